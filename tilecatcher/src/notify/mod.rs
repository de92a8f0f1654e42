//! Operator notification.
//!
//! Pipeline failures are pushed to a [`Notifier`]. Delivery transports
//! (email, chat hooks) live outside this crate; the library ships a
//! [`LogNotifier`] that writes to the log and a [`ThrottledNotifier`]
//! wrapper that rate-limits any inner notifier.
//!
//! Throttling is queue-based: a message arriving inside the minimum
//! interval waits its turn instead of disappearing, and is dropped only
//! when the queue itself overflows - with a log line saying so. Forced
//! messages bypass the throttle entirely.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Receives failure messages from the pipeline.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Delivers `message`. When `force` is set the message skips any
    /// throttling and goes out immediately.
    async fn notify(&self, message: &str, force: bool);
}

/// Notifier that records messages in the service log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, message: &str, _force: bool) {
        error!(notification = message, "pipeline failure reported");
    }
}

/// Rate-limits an inner notifier to one delivery per interval.
pub struct ThrottledNotifier {
    queue_tx: mpsc::Sender<String>,
    inner: Arc<dyn Notifier>,
}

impl ThrottledNotifier {
    /// Wraps `inner`, delivering at most one queued message per
    /// `min_interval`. Up to `queue_size` messages wait their turn.
    pub fn new(inner: Arc<dyn Notifier>, min_interval: Duration, queue_size: usize) -> Self {
        let (queue_tx, mut queue_rx) = mpsc::channel::<String>(queue_size.max(1));
        let delivery = Arc::clone(&inner);
        tokio::spawn(async move {
            while let Some(message) = queue_rx.recv().await {
                delivery.notify(&message, true).await;
                tokio::time::sleep(min_interval).await;
            }
            info!("notifier delivery loop stopped");
        });
        Self { queue_tx, inner }
    }
}

#[async_trait]
impl Notifier for ThrottledNotifier {
    async fn notify(&self, message: &str, force: bool) {
        if force {
            self.inner.notify(message, true).await;
            return;
        }
        if let Err(e) = self.queue_tx.try_send(message.to_string()) {
            warn!(dropped = %e, "notification queue is full - dropping message");
        }
    }
}
