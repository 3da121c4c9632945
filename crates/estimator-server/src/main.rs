// Estimation room server entry point.
//
// Startup sequence:
// 1. Initialize tracing
// 2. Load config
// 3. Open the room store
// 4. Build the repository, broadcaster and request API
// 5. Spawn the heartbeat task
// 6. Spawn the WebSocket and HTTP API server tasks
// 7. Wait for Ctrl+C, then stop every task

use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::{error, info};

use estimator_core::api::RequestApi;
use estimator_core::broadcaster::Broadcaster;
use estimator_core::config::{self, LoggingConfig};
use estimator_core::http_api;
use estimator_core::membership::Membership;
use estimator_core::store::{self, RetryPolicy, RoomRepository};
use estimator_core::ws_server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Config comes first so tracing knows where to write.
    let config = config::load_config().context("failed to load configuration")?;

    init_tracing(&config.logging)?;
    info!("Estimator starting up");
    info!(
        "Config loaded: listen={}, api={}, storage={:?}, heartbeat every {}s",
        config.server.listen_addr(),
        config.server.api_listen_addr(),
        config.storage.backend,
        config.heartbeat.interval_secs
    );

    let room_store = store::open_store(&config.storage).context("failed to open room store")?;
    let repo = Arc::new(RoomRepository::new(
        room_store,
        RetryPolicy::from(&config.storage),
    ));
    // Both transports share one repository so per-room ordering holds
    // across them.
    let broadcaster = Arc::new(Broadcaster::new(Arc::clone(&repo), config.heartbeat.clone()));
    let api = RequestApi::new(Membership::new(repo), Arc::clone(&broadcaster));

    let heartbeat_handle = tokio::spawn(Arc::clone(&broadcaster).run_heartbeat());

    let listen_addr = config.server.listen_addr();
    let listener = TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("failed to bind WebSocket server on {listen_addr}"))?;

    let ws_broadcaster = Arc::clone(&broadcaster);
    let ws_handle = tokio::spawn(async move {
        if let Err(e) = ws_server::run(listener, ws_broadcaster).await {
            error!("WebSocket server error: {}", e);
        }
    });

    let api_addr = config.server.api_listen_addr();
    let api_listener = TcpListener::bind(&api_addr)
        .await
        .with_context(|| format!("failed to bind HTTP API on {api_addr}"))?;
    let api_handle = tokio::spawn(async move {
        if let Err(e) = http_api::serve(api_listener, api).await {
            error!("HTTP API error: {}", e);
        }
    });

    info!(
        "Application ready. WebSocket server on {}, HTTP API on {}",
        listen_addr, api_addr
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl+C")?;
    info!("Shutdown requested");

    // All three tasks loop forever.
    ws_handle.abort();
    api_handle.abort();
    heartbeat_handle.abort();

    info!(
        open_connections = broadcaster.connection_count(),
        "Estimator shut down cleanly"
    );
    Ok(())
}

/// Initialize tracing to the configured log file, or stdout when none is set.
fn init_tracing(logging: &LoggingConfig) -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::fmt::writer::BoxMakeWriter;
    use tracing_subscriber::EnvFilter;

    let (writer, ansi) = match &logging.file {
        Some(path) => {
            let path = std::path::Path::new(path);
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("failed to create log directory {}", dir.display()))?;
            }
            let file = std::fs::File::create(path)
                .with_context(|| format!("failed to create log file {}", path.display()))?;
            (BoxMakeWriter::new(Arc::new(file)), false)
        }
        None => (BoxMakeWriter::new(std::io::stdout), true),
    };

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("estimator=info,estimator_core=info,warn")),
        )
        .with_writer(writer)
        .with_ansi(ansi)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    Ok(())
}
