//! The `serve` command: run both capture transports.

use crate::error::CliError;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tilecatcher::config::Settings;
use tilecatcher::logging::{default_log_file, init_logging};
use tilecatcher::notify::{LogNotifier, ThrottledNotifier};
use tilecatcher::pipeline::IngestController;
use tilecatcher::server::{HttpServer, TcpServer};
use tilecatcher::store::memory::{MemoryBlobStore, MemoryMetadataStore};
use tracing::info;

/// Minimum interval between non-forced operator notifications.
const NOTIFY_INTERVAL: Duration = Duration::from_secs(600);

pub async fn run(
    config: Option<PathBuf>,
    http_bind: &str,
    tcp_bind: &str,
    log_dir: &str,
) -> Result<(), CliError> {
    let settings = match config {
        Some(path) => Settings::from_ini_file(path)?,
        None => Settings::default(),
    };

    let _logging = init_logging(log_dir, default_log_file())?;
    info!(version = tilecatcher::VERSION, "starting tilecatcher");

    // In-memory backends; production deployments wire real stores in
    // through the library API instead of going through this command.
    let metadata = Arc::new(MemoryMetadataStore::with_auto_mosaics());
    let blobs = Arc::new(MemoryBlobStore::new());
    let notifier = Arc::new(ThrottledNotifier::new(
        Arc::new(LogNotifier),
        NOTIFY_INTERVAL,
        settings.content_queue_size,
    ));

    let controller = IngestController::start(&settings, metadata, blobs, notifier);

    let tcp = TcpServer::bind(tcp_bind, &settings, Arc::clone(&controller)).await?;
    let http = HttpServer::bind(http_bind, &settings, controller).await?;

    tokio::select! {
        _ = tcp.run() => {}
        result = http.run() => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received - shutting down");
        }
    }
    Ok(())
}
