use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use qio_server::config::ServerConfig;

#[tokio::main]
async fn main() {
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let config_path = env::var("QIO_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("qio.toml"));

    let config = match ServerConfig::load(&config_path) {
        Ok(config) => config,
        Err(err) if !config_path.exists() => {
            info!(path = %config_path.display(), %err, "no config file found, using defaults");
            ServerConfig::from_raw(Default::default()).expect("default config must be valid")
        }
        Err(err) => {
            eprintln!("failed to load config from {}: {err}", config_path.display());
            std::process::exit(1);
        }
    };

    let shutdown = Arc::new(tokio::sync::Notify::new());
    let shutdown_for_signals = Arc::clone(&shutdown);
    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown_for_signals.notify_waiters();
    });

    info!(addr = %config.bind_address, "starting qio-server");
    if let Err(err) = qio_server::run(config, shutdown).await {
        eprintln!("server error: {err}");
        std::process::exit(1);
    }
    info!("server shut down gracefully");
}

async fn shutdown_signal() {
    use tokio::signal;
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };
    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
