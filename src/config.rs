use std::{
    net::{AddrParseError, SocketAddr},
    time::Duration,
};

use clap::{Parser, ValueEnum};
use serde::Deserialize;

#[derive(Parser, Debug)]
#[command(name = "ledgerd", about = "ledgerd - accounts, entries and atomic transfers")]
pub struct CliArgs {
    /// Path to config file
    #[arg(short, long, default_value = "ledgerd.toml")]
    pub config: String,

    /// Port to listen on (overrides config file)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Log level (overrides config file)
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Storage backend (overrides config file)
    #[arg(short, long, value_enum)]
    pub storage: Option<BackendKind>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { host: "0.0.0.0".into(), port: 8080 }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".into(), json: false }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Memory,
    Sqlite,
    Postgres,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: BackendKind,

    /// SQLite database file, or `:memory:`.
    pub path: String,

    /// PostgreSQL connection string.
    pub url: Option<String>,

    pub pool_size: usize,

    /// Row lock wait limit for the memory backend. Unset waits forever.
    pub lock_timeout_ms: Option<u64>,
}

impl StorageConfig {
    pub fn lock_timeout(&self) -> Option<Duration> {
        self.lock_timeout_ms.map(Duration::from_millis)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Memory,
            path: "ledgerd.db".into(),
            url: None,
            pool_size: ledgerd_postgres::DEFAULT_POOL_SIZE,
            lock_timeout_ms: None,
        }
    }
}

impl Config {
    /// Reads the file named on the command line, then lets flags win.
    /// A missing file means defaults; an unparsable one is reported on
    /// stderr and also falls back to defaults.
    pub fn load(cli: &CliArgs) -> Self {
        let mut config = Self::read(&cli.config);
        config.apply(cli);
        config
    }

    fn read(path: &str) -> Self {
        let Ok(contents) = std::fs::read_to_string(path) else {
            return Self::default();
        };
        Self::parse(&contents).unwrap_or_else(|e| {
            eprintln!("Warning: ignoring {}: {}", path, e);
            Self::default()
        })
    }

    fn apply(&mut self, cli: &CliArgs) {
        self.server.port = cli.port.unwrap_or(self.server.port);
        self.storage.backend = cli.storage.unwrap_or(self.storage.backend);
        if let Some(level) = &cli.log_level {
            self.logging.level.clone_from(level);
        }
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, AddrParseError> {
        format!("{}:{}", self.server.host, self.server.port).parse()
    }
}
