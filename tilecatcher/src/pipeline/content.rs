//! Stage 2 - content storage.
//!
//! Each content job runs through a chain of decorating layers stacked
//! around the blob-store call. Applied innermost to outermost:
//!
//! 1. store the content in the blob store
//! 2. retry the store on failure, within a fixed attempt budget
//! 3. verify the stored copy against what was sent
//! 4. stamp the tile row with the acquired timestamp, blob descriptor and
//!    ROI state
//! 5. echo the terminal result to an optional buffer
//! 6. push terminal errors onto the async error channel
//! 7. hand terminal errors to the notifier
//! 8. log timing and outcome
//! 9. remove the spill file on success, retain it on failure
//! 10. release the payload buffer
//!
//! The order is contractual: metadata is updated only after verification so
//! the stored descriptor is trustworthy, the spill file outlives the
//! metadata update, logging still sees job fields, and the payload is
//! released last of all.

use crate::notify::Notifier;
use crate::pipeline::{spill, ContentJob, IngestError, JobId, JobProcessor};
use crate::store::{acquisition_blob_path, BlobMetadata, BlobStore, MetadataStore, RoiState};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Total store attempts per job, counting the first one.
pub const DEFAULT_RETRIES: usize = 3;

/// Terminal summary of one content job, for the optional echo buffer.
#[derive(Debug, Clone)]
pub struct ContentResult {
    pub id: JobId,
    pub acq_id: u64,
    pub name: String,
    pub error: Option<String>,
}

/// Bounded, non-blocking channel carrying stage-2 failures back to the
/// next inbound request.
///
/// Many workers write; the controller drains at most one message per
/// request. Overflow drops silently - the notifier is the system of record
/// for errors.
pub struct AsyncErrors {
    tx: mpsc::Sender<String>,
    rx: std::sync::Mutex<mpsc::Receiver<String>>,
}

impl AsyncErrors {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: std::sync::Mutex::new(rx),
        }
    }

    /// Pushes a failure message; never blocks.
    pub fn push(&self, message: String) {
        if self.tx.try_send(message).is_err() {
            debug!("async error channel full - dropping message");
        }
    }

    /// Takes the oldest waiting message, if any.
    pub fn pop(&self) -> Option<String> {
        self.rx.lock().unwrap().try_recv().ok()
    }
}

/// One layer of the content-storage chain.
#[async_trait]
pub trait ContentProcessor: Send + Sync {
    async fn process(&self, job: &mut ContentJob) -> Result<(), IngestError>;
}

fn failure(job: &ContentJob, message: impl std::fmt::Display) -> IngestError {
    IngestError::ContentStoreFailure {
        acq_id: job.acq_id,
        name: job.params.name.clone(),
        message: message.to_string(),
    }
}

/// Innermost layer: put the content into the blob store.
struct StoreContent {
    blobs: Arc<dyn BlobStore>,
}

#[async_trait]
impl ContentProcessor for StoreContent {
    async fn process(&self, job: &mut ContentJob) -> Result<(), IngestError> {
        let path = acquisition_blob_path(job.acq_id, &job.params.name);
        let metadata = BlobMetadata::for_mosaic(&job.tile.mosaic, &job.checksum);
        let descriptor = self
            .blobs
            .put(&path, job.payload.share(), &metadata)
            .await
            .map_err(|e| failure(job, e))?;
        job.blob = Some(descriptor);
        Ok(())
    }
}

/// Re-runs the inner layer on failure, within a total attempt budget.
struct Retried {
    inner: Box<dyn ContentProcessor>,
    budget: usize,
}

#[async_trait]
impl ContentProcessor for Retried {
    async fn process(&self, job: &mut ContentJob) -> Result<(), IngestError> {
        let mut result = self.inner.process(job).await;
        if result.is_ok() {
            return result;
        }
        for attempt in 1..self.budget {
            info!(attempt, job = %job, "retrying content storage");
            result = self.inner.process(job).await;
            if result.is_ok() {
                return result;
            }
        }
        error!(job = %job, attempts = self.budget, "content storage aborted after retries");
        result
    }
}

/// Checks the blob store's copy against what was sent.
struct Verified {
    inner: Box<dyn ContentProcessor>,
    blobs: Arc<dyn BlobStore>,
}

#[async_trait]
impl ContentProcessor for Verified {
    async fn process(&self, job: &mut ContentJob) -> Result<(), IngestError> {
        if let Err(e) = self.inner.process(job).await {
            info!(job = %job, "skipped verification because of a previous error");
            return Err(e);
        }
        let blob = job
            .blob
            .as_ref()
            .ok_or_else(|| IngestError::Internal("no blob descriptor after store".to_string()))?;
        let start = Instant::now();
        self.blobs
            .verify(&blob.path, &blob.key)
            .await
            .map_err(|e| failure(job, e))?;
        debug!(
            job = %job,
            verify_ms = start.elapsed().as_millis() as u64,
            "verified stored content"
        );
        Ok(())
    }
}

/// Stamps the tile row once the content is durable and verified.
///
/// ROI handling follows the tile's lifecycle: every existing association
/// moves to READY, and zero affected rows is still success when the tile
/// already carries a matching association (a re-send after the ROIs
/// reached READY). Only a tile with no association at all - a drift frame,
/// typically - gets linked to the ROIs registered for its mosaic cell.
struct MetadataUpdating {
    inner: Box<dyn ContentProcessor>,
    metadata: Arc<dyn MetadataStore>,
}

#[async_trait]
impl ContentProcessor for MetadataUpdating {
    async fn process(&self, job: &mut ContentJob) -> Result<(), IngestError> {
        self.inner.process(job).await?;
        let blob = job
            .blob
            .as_ref()
            .ok_or_else(|| IngestError::Internal("no blob descriptor after verify".to_string()))?;

        self.metadata
            .update_tile_blob(job.tile.tile_id, blob, Utc::now())
            .await
            .map_err(|e| failure(job, e))?;

        let affected = self
            .metadata
            .update_roi_state(job.tile.tile_id, RoiState::Ready)
            .await
            .map_err(|e| failure(job, e))?;
        if affected > 0 {
            return Ok(());
        }

        let has_roi = self
            .metadata
            .tile_has_roi(job.tile.tile_id)
            .await
            .map_err(|e| failure(job, e))?;
        if has_roi {
            // Associations already in the requested state; nothing to do.
            info!(tile = %job.tile, "tile ROI state already current");
            return Ok(());
        }

        let rois = self
            .metadata
            .rois_for_cell(job.tile.mosaic.mosaic_id, job.tile.col, job.tile.row)
            .await
            .map_err(|e| failure(job, e))?;
        for roi_id in rois {
            if let Err(e) = self
                .metadata
                .associate_tile_roi(job.tile.tile_id, roi_id, RoiState::Ready)
                .await
            {
                error!(tile = %job.tile, roi_id, error = %e, "error associating ROI with tile");
            }
        }
        Ok(())
    }
}

/// Echoes the terminal result into a bounded buffer; never blocks.
struct EchoResult {
    inner: Box<dyn ContentProcessor>,
    tx: mpsc::Sender<ContentResult>,
}

#[async_trait]
impl ContentProcessor for EchoResult {
    async fn process(&self, job: &mut ContentJob) -> Result<(), IngestError> {
        let result = self.inner.process(job).await;
        let _ = self.tx.try_send(ContentResult {
            id: job.id,
            acq_id: job.acq_id,
            name: job.params.name.clone(),
            error: result.as_ref().err().map(|e| e.to_string()),
        });
        result
    }
}

/// Pushes terminal failures onto the async error channel.
struct ErrorEmitting {
    inner: Box<dyn ContentProcessor>,
    errors: Arc<AsyncErrors>,
}

#[async_trait]
impl ContentProcessor for ErrorEmitting {
    async fn process(&self, job: &mut ContentJob) -> Result<(), IngestError> {
        let result = self.inner.process(job).await;
        if let Err(e) = &result {
            self.errors.push(e.to_string());
        }
        result
    }
}

/// Hands terminal failures to the notifier.
struct Notified {
    inner: Box<dyn ContentProcessor>,
    notifier: Arc<dyn Notifier>,
}

#[async_trait]
impl ContentProcessor for Notified {
    async fn process(&self, job: &mut ContentJob) -> Result<(), IngestError> {
        let result = self.inner.process(job).await;
        if let Err(e) = &result {
            self.notifier.notify(&e.to_string(), false).await;
        }
        result
    }
}

/// Logs timing and outcome around the whole inner chain.
struct Logged {
    inner: Box<dyn ContentProcessor>,
}

#[async_trait]
impl ContentProcessor for Logged {
    async fn process(&self, job: &mut ContentJob) -> Result<(), IngestError> {
        let local_start = Instant::now();
        debug!(job_id = %job.id, job = %job, "begin content processing");
        let result = self.inner.process(job).await;
        match &result {
            Ok(()) => info!(
                job_id = %job.id,
                job = %job,
                stage_ms = local_start.elapsed().as_millis() as u64,
                total_ms = job.elapsed().as_millis() as u64,
                "successfully processed content"
            ),
            Err(e) => error!(
                job_id = %job.id,
                job = %job,
                error = %e,
                stage_ms = local_start.elapsed().as_millis() as u64,
                total_ms = job.elapsed().as_millis() as u64,
                "error encountered while processing content"
            ),
        }
        result
    }
}

/// Removes the spill file on success; retains it for recovery on failure.
struct SpillRemoving {
    inner: Box<dyn ContentProcessor>,
}

#[async_trait]
impl ContentProcessor for SpillRemoving {
    async fn process(&self, job: &mut ContentJob) -> Result<(), IngestError> {
        let result = self.inner.process(job).await;
        match &result {
            Ok(()) => spill::remove_spill(&job.tmp_path).await,
            Err(_) => info!(
                path = %job.tmp_path.display(),
                "spill file retained for operator recovery"
            ),
        }
        result
    }
}

/// Outermost layer: frees the payload buffer whatever the outcome.
struct PayloadReleasing {
    inner: Box<dyn ContentProcessor>,
}

#[async_trait]
impl ContentProcessor for PayloadReleasing {
    async fn process(&self, job: &mut ContentJob) -> Result<(), IngestError> {
        let result = self.inner.process(job).await;
        job.payload.release();
        result
    }
}

/// Builds the full stage-2 chain, innermost to outermost.
pub fn build_content_chain(
    blobs: Arc<dyn BlobStore>,
    metadata: Arc<dyn MetadataStore>,
    errors: Arc<AsyncErrors>,
    notifier: Arc<dyn Notifier>,
    echo: Option<mpsc::Sender<ContentResult>>,
    retries: usize,
) -> Box<dyn ContentProcessor> {
    let mut chain: Box<dyn ContentProcessor> = Box::new(StoreContent {
        blobs: Arc::clone(&blobs),
    });
    chain = Box::new(Retried {
        inner: chain,
        budget: retries.max(1),
    });
    chain = Box::new(Verified { inner: chain, blobs });
    chain = Box::new(MetadataUpdating {
        inner: chain,
        metadata,
    });
    if let Some(tx) = echo {
        chain = Box::new(EchoResult { inner: chain, tx });
    }
    chain = Box::new(ErrorEmitting {
        inner: chain,
        errors,
    });
    chain = Box::new(Notified {
        inner: chain,
        notifier,
    });
    chain = Box::new(Logged { inner: chain });
    chain = Box::new(SpillRemoving { inner: chain });
    chain = Box::new(PayloadReleasing { inner: chain });
    chain
}

/// Stage-2 job processor: runs each job through the chain.
///
/// The chain handles all result propagation (async error channel, notifier,
/// logs), so the worker itself has nothing to return.
pub struct ContentStoreProcessor {
    chain: Box<dyn ContentProcessor>,
}

impl ContentStoreProcessor {
    pub fn new(chain: Box<dyn ContentProcessor>) -> Self {
        Self { chain }
    }
}

impl JobProcessor for ContentStoreProcessor {
    type Job = ContentJob;

    async fn process(&self, mut job: ContentJob) {
        let _ = self.chain.process(&mut job).await;
    }
}
