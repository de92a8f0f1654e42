//! Job models for the two pipeline stages.
//!
//! A tile's journey is split across two job types. A [`RegistrationJob`]
//! carries only the tile's identity into stage 1 and reports back over a
//! single-use result channel; the payload stays with the controller. A
//! [`ContentJob`] then carries the payload, the spill path and the
//! registered tile row into stage 2, which owns it to a terminal state.

use crate::pipeline::IngestError;
use crate::store::{BlobDescriptor, RegisteredTile};
use crate::tile::{PayloadBuf, TileParams};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// Global counter for generating unique job IDs.
static JOB_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a job, used to correlate log lines across stages.
///
/// IDs are monotonically increasing and unique within a process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(u64);

impl JobId {
    /// Creates a new unique job ID.
    pub fn new() -> Self {
        Self(JOB_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw numeric value of this job ID.
    #[inline]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// Result of stage 1, delivered over the job's result channel.
pub type RegistrationResult = Result<RegisteredTile, IngestError>;

/// Stage-1 work item: register the tile's metadata row.
///
/// Deliberately light - the payload bytes never enter the registration
/// queue, so a deep queue does not multiply memory pressure.
pub struct RegistrationJob {
    /// Correlation id shared with the content job that may follow
    pub id: JobId,
    /// Acquisition this tile belongs to
    pub acq_id: u64,
    /// Tile address and name
    pub params: TileParams,
    /// Payload length, for logging only
    pub content_len: usize,
    /// When the transport started handling the request
    pub received_at: Instant,
    /// Single-use slot for the registration result
    pub result_tx: oneshot::Sender<RegistrationResult>,
}

impl RegistrationJob {
    /// Elapsed time since the transport first saw the request.
    #[inline]
    pub fn elapsed(&self) -> Duration {
        self.received_at.elapsed()
    }
}

impl std::fmt::Debug for RegistrationJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrationJob")
            .field("id", &self.id)
            .field("acq_id", &self.acq_id)
            .field("params", &self.params)
            .field("content_len", &self.content_len)
            .field("result_tx", &"<oneshot::Sender>")
            .finish()
    }
}

/// Stage-2 work item: make the tile content durable.
///
/// Owns the payload handle; the content chain releases it exactly once when
/// the job reaches a terminal state, whatever the outcome.
#[derive(Debug)]
pub struct ContentJob {
    /// Correlation id shared with the registration job
    pub id: JobId,
    /// Acquisition this tile belongs to
    pub acq_id: u64,
    /// Tile address and name
    pub params: TileParams,
    /// Payload ownership handle
    pub payload: PayloadBuf,
    /// Sender-computed MD5 of the payload (may be empty)
    pub checksum: Vec<u8>,
    /// Spill file on local disk, removed only after success
    pub tmp_path: PathBuf,
    /// Tile row created by stage 1
    pub tile: RegisteredTile,
    /// When the transport started handling the request
    pub received_at: Instant,
    /// Blob descriptor, filled in by the store layer on success
    pub blob: Option<BlobDescriptor>,
}

impl ContentJob {
    /// Elapsed time since the transport first saw the request.
    #[inline]
    pub fn elapsed(&self) -> Duration {
        self.received_at.elapsed()
    }

    /// Payload length in bytes; stable across release.
    #[inline]
    pub fn content_len(&self) -> usize {
        self.payload.len()
    }
}

impl std::fmt::Display for ContentJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{} ({})", self.acq_id, self.params.name, self.content_len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_id_unique_and_monotonic() {
        let id1 = JobId::new();
        let id2 = JobId::new();
        assert_ne!(id1, id2);
        assert!(id2.as_u64() > id1.as_u64());
    }

    #[test]
    fn test_job_id_display() {
        let id = JobId(42);
        assert_eq!(format!("{}", id), "job-42");
    }

    #[test]
    fn test_registration_job_reports_elapsed() {
        let (tx, _rx) = oneshot::channel();
        let job = RegistrationJob {
            id: JobId::new(),
            acq_id: 1,
            params: TileParams::from_coords(0, 0, 0, -1),
            content_len: 10,
            received_at: Instant::now(),
            result_tx: tx,
        };
        assert!(job.elapsed() < Duration::from_secs(1));
    }
}
