use clap::Parser;

use ledgerd::{
    api::{self, AppState},
    config::{CliArgs, Config},
    open_backend, telemetry,
};

#[tokio::main]
async fn main() {
    let cli = CliArgs::parse();
    let config = Config::load(&cli);
    telemetry::init_logging(&config.logging);

    let addr = match config.listen_addr() {
        Ok(addr) => addr,
        Err(e) => {
            tracing::error!(error = %e, host = %config.server.host, "Invalid listen address");
            std::process::exit(1);
        }
    };

    let storage = config.storage.clone();
    let backend = match tokio::task::spawn_blocking(move || open_backend(&storage)).await {
        Ok(Ok(backend)) => backend,
        Ok(Err(e)) => {
            tracing::error!(error = %e, "Failed to open storage");
            std::process::exit(1);
        }
        Err(e) => {
            tracing::error!(error = %e, "Storage initialisation panicked");
            std::process::exit(1);
        }
    };

    let mut state = AppState::new(backend.clone());
    match telemetry::init_metrics() {
        Ok(handle) => state = state.with_metrics(handle),
        Err(e) => tracing::warn!(error = %e, "Prometheus recorder not installed"),
    }
    let app = api::router(state);

    tracing::info!(%addr, backend = backend.name(), "API listening");

    let served = match axum::Server::try_bind(&addr) {
        Ok(server) => {
            server
                .serve(app.into_make_service())
                .with_graceful_shutdown(shutdown_signal())
                .await
        }
        Err(e) => Err(e),
    };

    // Blocking clients own their own runtime and must be dropped off the async workers.
    let _ = tokio::task::spawn_blocking(move || drop(backend)).await;

    if let Err(e) = served {
        tracing::error!(error = %e, "Server error");
        std::process::exit(1);
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}
