//! Ingestion controller - one tile's journey through both stages.
//!
//! The controller spills the payload to local disk, admits the tile into
//! the registration stage (bounded, with a wait timeout), waits for the
//! registration result, hands the content job to the storage stage and
//! assembles the response. The response goes out as soon as metadata is
//! durably registered; content durability is pipelined behind it, and a
//! storage failure surfaces on a *later* response through the async error
//! channel. A sender seeing a non-zero status or an error message should
//! slow down, not assume the tile is lost.

use crate::config::Settings;
use crate::notify::Notifier;
use crate::pipeline::content::{build_content_chain, ContentResult, ContentStoreProcessor};
use crate::pipeline::registration::RegistrationProcessor;
use crate::pipeline::{
    dispatcher, spill, AsyncErrors, ContentJob, IngestError, JobId, JobProcessor, PoolHandle,
    QueueStatus, RegistrationJob, StatusTriple, DEFAULT_RETRIES,
};
use crate::store::{BlobStore, MetadataStore, RegisteredTile, StoreError};
use crate::tile::{TileParams, TileRequest};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

/// Result of one tile's trip through the controller.
#[derive(Debug)]
pub struct IngestOutcome {
    pub acq_id: u64,
    pub params: TileParams,
    /// Registered tile row; present whenever stage 1 succeeded
    pub tile: Option<RegisteredTile>,
    /// Synchronous failure of this request, if any
    pub error: Option<IngestError>,
    /// A stage-2 failure from an earlier tile, attached to this response
    pub deferred_error: Option<String>,
    /// Backpressure triple at response time
    pub status: StatusTriple,
}

impl IngestOutcome {
    /// Tile id for the response; 0 when registration did not happen.
    #[inline]
    pub fn tile_id(&self) -> i64 {
        self.tile.as_ref().map(|t| t.tile_id).unwrap_or(0)
    }

    /// True when this request itself succeeded (a deferred error from an
    /// earlier tile does not retract this tile's registration).
    #[inline]
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// True when the response should carry a failure status on the wire:
    /// either this request failed or a deferred error rides along.
    #[inline]
    pub fn wire_failure(&self) -> bool {
        self.error.is_some() || self.deferred_error.is_some()
    }

    /// The message to surface to the sender, if any.
    pub fn error_message(&self) -> Option<String> {
        if let Some(e) = &self.error {
            return Some(e.to_string());
        }
        self.deferred_error.clone()
    }
}

/// Orchestrates the two pipeline stages for every inbound tile.
pub struct IngestController {
    tmp_data_dir: PathBuf,
    wait_timeout: Duration,
    metadata: Arc<dyn MetadataStore>,
    notifier: Arc<dyn Notifier>,
    registration: Arc<RegistrationProcessor>,
    registration_pool: Option<PoolHandle<RegistrationJob>>,
    content: Arc<ContentStoreProcessor>,
    content_pool: Option<PoolHandle<ContentJob>>,
    errors: Arc<AsyncErrors>,
    content_results: Mutex<Option<mpsc::Receiver<ContentResult>>>,
}

impl IngestController {
    /// Builds the pipeline and starts the worker pools.
    ///
    /// A stage configured with one worker runs inline on the caller's task
    /// and has no bounded queue; its backpressure status reads GREEN.
    pub fn start(
        settings: &Settings,
        metadata: Arc<dyn MetadataStore>,
        blobs: Arc<dyn BlobStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Arc<Self> {
        let errors = Arc::new(AsyncErrors::new(settings.content_queue_size));

        let (echo_tx, echo_rx) = if settings.content_result_buffer_size > 0 {
            let (tx, rx) = mpsc::channel(settings.content_result_buffer_size);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let registration = Arc::new(RegistrationProcessor::new(
            Arc::clone(&metadata),
            Arc::clone(&notifier),
        ));
        let registration_pool = (settings.tile_workers > 1).then(|| {
            info!(workers = settings.tile_workers, "wait for tile registration jobs");
            dispatcher::start(
                "tile-registration",
                Arc::clone(&registration),
                settings.tile_workers,
                settings.tile_queue_size,
            )
        });

        let chain = build_content_chain(
            blobs,
            Arc::clone(&metadata),
            Arc::clone(&errors),
            Arc::clone(&notifier),
            echo_tx,
            DEFAULT_RETRIES,
        );
        let content = Arc::new(ContentStoreProcessor::new(chain));
        let content_pool = (settings.content_workers > 1).then(|| {
            info!(workers = settings.content_workers, "wait for content store jobs");
            dispatcher::start(
                "content-store",
                Arc::clone(&content),
                settings.content_workers,
                settings.content_queue_size,
            )
        });

        Arc::new(Self {
            tmp_data_dir: settings.tmp_data_dir.clone(),
            wait_timeout: settings.wait_timeout,
            metadata,
            notifier,
            registration,
            registration_pool,
            content,
            content_pool,
            errors,
            content_results: Mutex::new(echo_rx),
        })
    }

    /// Runs one parsed tile request through both stages.
    pub async fn ingest(&self, request: TileRequest) -> IngestOutcome {
        let TileRequest {
            acq_id,
            params,
            payload,
            checksum,
            received_at,
        } = request;
        let job_id = JobId::new();

        let tmp_path = match spill::write_spill(
            &self.tmp_data_dir,
            acq_id,
            &params.name,
            payload.as_slice(),
        )
        .await
        {
            Ok(path) => path,
            Err(e) => return self.fail(acq_id, params, payload, e),
        };

        let (result_tx, result_rx) = oneshot::channel();
        let job = RegistrationJob {
            id: job_id,
            acq_id,
            params: params.clone(),
            content_len: payload.len(),
            received_at,
            result_tx,
        };

        if let Some(pool) = &self.registration_pool {
            if let Err(job) = pool.submit(job, self.wait_timeout).await {
                // The sender hears about this synchronously and will
                // re-send, so the spill has no recovery value.
                spill::remove_spill(&tmp_path).await;
                let error = IngestError::IngestionQueueFull {
                    acq_id: job.acq_id,
                    name: job.params.name,
                };
                return self.fail(acq_id, params, payload, error);
            }
        } else {
            self.registration.process(job).await;
        }

        let tile = match result_rx.await {
            Ok(Ok(tile)) => tile,
            Ok(Err(e)) => return self.fail(acq_id, params, payload, e),
            Err(_) => {
                let error =
                    IngestError::Internal("registration worker dropped the result channel".into());
                return self.fail(acq_id, params, payload, error);
            }
        };

        let content_job = ContentJob {
            id: job_id,
            acq_id,
            params: params.clone(),
            payload,
            checksum,
            tmp_path,
            tile: tile.clone(),
            received_at,
            blob: None,
        };
        self.hand_off_content(content_job).await;

        let deferred_error = self.errors.pop();
        let status = if deferred_error.is_some() {
            self.queue_status().degraded()
        } else {
            self.queue_status()
        };
        IngestOutcome {
            acq_id,
            params,
            tile: Some(tile),
            error: None,
            deferred_error,
            status,
        }
    }

    /// Queues the content job, or runs it inline with one worker.
    ///
    /// An admission timeout here is never returned to the caller: the
    /// failure goes to the async error channel and the notifier, the spill
    /// file stays for recovery, and the payload is released.
    async fn hand_off_content(&self, job: ContentJob) {
        let Some(pool) = &self.content_pool else {
            self.content.process(job).await;
            return;
        };
        if let Err(mut job) = pool.submit(job, self.wait_timeout).await {
            let error = IngestError::ContentQueueFull {
                acq_id: job.acq_id,
                name: job.params.name.clone(),
            };
            warn!(job = %job, "content queue full - deferring the failure");
            self.errors.push(error.to_string());
            self.notifier.notify(&error.to_string(), false).await;
            info!(
                path = %job.tmp_path.display(),
                "spill file retained for operator recovery"
            );
            job.payload.release();
        }
    }

    fn fail(
        &self,
        acq_id: u64,
        params: TileParams,
        mut payload: crate::tile::PayloadBuf,
        error: IngestError,
    ) -> IngestOutcome {
        payload.release();
        IngestOutcome {
            acq_id,
            params,
            tile: None,
            error: Some(error),
            deferred_error: None,
            status: self.queue_status().degraded(),
        }
    }

    /// Builds a failure outcome for a request the transport could not even
    /// hand to the pipeline (framing, name or checksum errors).
    pub fn reject(&self, acq_id: u64, params: TileParams, error: IngestError) -> IngestOutcome {
        IngestOutcome {
            acq_id,
            params,
            tile: None,
            error: Some(error),
            deferred_error: None,
            status: self.queue_status().degraded(),
        }
    }

    /// Current backpressure triple, computed from instantaneous depths.
    pub fn queue_status(&self) -> StatusTriple {
        let tile_queue = self
            .registration_pool
            .as_ref()
            .map(|p| p.status())
            .unwrap_or(QueueStatus::Green);
        let content_queue = self
            .content_pool
            .as_ref()
            .map(|p| p.status())
            .unwrap_or(QueueStatus::Green);
        StatusTriple::new(tile_queue, content_queue)
    }

    /// Connectivity probe for the health endpoint.
    pub async fn ping(&self) -> Result<(), StoreError> {
        self.metadata.ping().await
    }

    /// Takes the stage-2 result echo receiver, when one was configured.
    pub fn take_content_results(&self) -> Option<mpsc::Receiver<ContentResult>> {
        self.content_results.lock().unwrap().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::LogNotifier;
    use crate::store::memory::{MemoryBlobStore, MemoryMetadataStore};
    use crate::tile::PayloadBuf;
    use md5::{Digest, Md5};

    struct Fixture {
        metadata: Arc<MemoryMetadataStore>,
        blobs: Arc<MemoryBlobStore>,
        controller: Arc<IngestController>,
        _tmp: tempfile::TempDir,
    }

    fn fixture(mut settings: Settings) -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        settings.tmp_data_dir = tmp.path().to_path_buf();
        let metadata = Arc::new(MemoryMetadataStore::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        let controller = IngestController::start(
            &settings,
            metadata.clone(),
            blobs.clone(),
            Arc::new(LogNotifier),
        );
        Fixture {
            metadata,
            blobs,
            controller,
            _tmp: tmp,
        }
    }

    fn pooled_settings() -> Settings {
        Settings {
            tile_workers: 2,
            tile_queue_size: 8,
            content_workers: 2,
            content_queue_size: 8,
            ..Settings::default()
        }
    }

    fn request(acq_id: u64, col: i32, row: i32) -> TileRequest {
        let content = vec![0x11u8; 512];
        let checksum = Md5::digest(&content).to_vec();
        TileRequest::new(
            acq_id,
            TileParams::from_coords(col, row, 2, -1),
            PayloadBuf::from(content),
            checksum,
        )
    }

    async fn wait_for<F: Fn() -> bool>(what: &str, check: F) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    #[tokio::test]
    async fn test_happy_path_inline() {
        let fx = fixture(Settings::default());
        fx.metadata.register_mosaic(123, "s", "p", "o");

        let outcome = fx.controller.ingest(request(123, 5, 7)).await;
        assert!(outcome.is_success(), "error: {:?}", outcome.error);
        assert!(outcome.tile_id() > 0);
        assert!(outcome.deferred_error.is_none());
        assert_eq!(outcome.status.system, QueueStatus::Green);
        // inline stage 2 finished before the response
        assert!(fx.blobs.contains("/acquisitions/123/col0005_row0007_cam2.tif"));
    }

    #[tokio::test]
    async fn test_happy_path_pooled() {
        let fx = fixture(pooled_settings());
        fx.metadata.register_mosaic(123, "s", "p", "o");

        let outcome = fx.controller.ingest(request(123, 5, 7)).await;
        assert!(outcome.is_success());
        assert!(outcome.tile_id() > 0);

        let blobs = fx.blobs.clone();
        wait_for("stage-2 completion", move || {
            blobs.contains("/acquisitions/123/col0005_row0007_cam2.tif")
        })
        .await;
    }

    #[tokio::test]
    async fn test_unknown_acquisition_fails_synchronously() {
        let fx = fixture(Settings::default());

        let outcome = fx.controller.ingest(request(999, 0, 0)).await;
        assert!(!outcome.is_success());
        assert!(matches!(outcome.error, Some(IngestError::MetadataUnavailable(_))));
        assert_eq!(outcome.tile_id(), 0);
        // error paths force the system status to RED
        assert_eq!(outcome.status.system, QueueStatus::Red);
        assert_eq!(fx.blobs.put_count(), 0, "stage 2 never entered");
    }

    #[tokio::test]
    async fn test_duplicate_send_returns_same_tile_id() {
        let fx = fixture(Settings::default());
        fx.metadata.register_mosaic(7, "s", "p", "o");

        let first = fx.controller.ingest(request(7, 1, 2)).await;
        let second = fx.controller.ingest(request(7, 1, 2)).await;
        assert!(first.is_success() && second.is_success());
        assert_eq!(first.tile_id(), second.tile_id());
        assert_eq!(fx.metadata.tile_count(), 1);
        assert_eq!(fx.blobs.put_count(), 2, "the store is idempotent by key");
    }

    #[tokio::test]
    async fn test_stage2_failure_surfaces_on_next_response() {
        let fx = fixture(pooled_settings());
        fx.metadata.register_mosaic(55, "s", "p", "o");
        fx.blobs.fail_next_puts(DEFAULT_RETRIES);

        let failing = fx.controller.ingest(request(55, 0, 0)).await;
        assert!(failing.is_success(), "stage-2 failure is not synchronous");

        // The failure lands on the async channel once the workers give up
        // and rides on the first response assembled after that - usually a
        // following request, occasionally this one if the workers are fast.
        let mut carried: Option<IngestOutcome> =
            failing.deferred_error.is_some().then_some(failing);
        for row in 1..50 {
            if carried.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            let outcome = fx.controller.ingest(request(55, 0, row)).await;
            if outcome.deferred_error.is_some() {
                carried = Some(outcome);
            }
        }
        let carried = carried.expect("a later response carries the failure");
        assert!(carried.is_success(), "the carrying tile itself succeeded");
        assert!(carried.tile_id() > 0);
        assert!(carried.wire_failure());
        assert_eq!(carried.status.system, QueueStatus::Red);
        assert!(carried
            .error_message()
            .unwrap()
            .contains("content store failure"));

        // the failed tile's spill file stays on disk for recovery
        let spill = fx
            ._tmp
            .path()
            .join("55")
            .join("col0000_row0000_cam2.tif");
        assert!(spill.exists());
    }

    #[tokio::test]
    async fn test_inline_stage2_failure_surfaces_immediately() {
        let fx = fixture(Settings::default());
        fx.metadata.register_mosaic(55, "s", "p", "o");
        fx.blobs.fail_next_puts(DEFAULT_RETRIES);

        let outcome = fx.controller.ingest(request(55, 3, 3)).await;
        // registration succeeded, so the request reports its tile id, but
        // the inline storage failure rides along on the same response
        assert!(outcome.is_success());
        assert!(outcome.deferred_error.is_some());
        assert!(outcome.wire_failure());
    }

    #[tokio::test]
    async fn test_echo_buffer_wired_through() {
        let settings = Settings {
            content_result_buffer_size: 4,
            ..Settings::default()
        };
        let fx = fixture(settings);
        fx.metadata.register_mosaic(2, "s", "p", "o");
        let mut results = fx.controller.take_content_results().unwrap();

        let outcome = fx.controller.ingest(request(2, 0, 0)).await;
        assert!(outcome.is_success());

        let echoed = results.recv().await.unwrap();
        assert_eq!(echoed.acq_id, 2);
        assert!(echoed.error.is_none());
    }
}
