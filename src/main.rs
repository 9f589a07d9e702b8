use std::sync::Arc;

use tokio::{net::TcpListener, signal};
use tracing::info;
use vidget::{ApiError, AppState, Config, FileManager, YtDlp, build_router};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "vidget=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("Server error: {}", error.message);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ApiError> {
    let config = Config::from_env();

    tokio::fs::create_dir_all(&config.scratch_dir)
        .await
        .map_err(|error| {
            ApiError::internal(format!(
                "Could not create scratch directory {:?}: {error}",
                config.scratch_dir
            ))
        })?;

    let files = Arc::new(FileManager::new(
        config.scratch_dir.clone(),
        config.retention(),
    ));
    let engine = Arc::new(YtDlp::new(config.ytdlp_path.clone(), config.ytdlp_timeout));
    let sweeper = Arc::clone(&files).spawn_sweeper();

    let app = build_router(AppState { engine, files });

    let listener = TcpListener::bind(&config.bind_addr).await.map_err(|error| {
        ApiError::internal(format!("Could not bind {}: {error}", config.bind_addr))
    })?;

    info!(
        "Listening on http://{} (scratch directory {:?}, engine {})",
        config.bind_addr, config.scratch_dir, config.ytdlp_path
    );

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|error| ApiError::internal(format!("HTTP server error: {error}")));

    // Pending deferred deletions die with the runtime; the next startup sweep
    // reclaims anything they would have removed.
    sweeper.abort();
    info!("Shut down");
    served
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = signal::ctrl_c().await {
            tracing::warn!("Could not listen for Ctrl-C: {error}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(error) => {
                tracing::warn!("Could not listen for SIGTERM: {error}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
