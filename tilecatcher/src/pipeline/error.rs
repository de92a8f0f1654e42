//! Error types for the ingestion pipeline.
//!
//! Errors split into two families: synchronous ones fail the request on the
//! response that is being assembled, and asynchronous ones (content storage)
//! surface on a later response through the pipeline's error channel.

use crate::codec::WireError;
use crate::store::StoreError;
use crate::tile::TileNameError;
use thiserror::Error;

/// Errors that can fail a tile's journey through the pipeline.
#[derive(Debug, Error)]
pub enum IngestError {
    /// Length prefix unreadable or payload truncated
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// Filename matches neither the stable nor the drift grammar
    #[error("invalid tile file name: {0}")]
    InvalidTileFileName(String),

    /// MD5 of the content differs from the carried checksum
    #[error("checksum mismatch: {0}")]
    ChecksumMismatch(String),

    /// Stage-1 admission timed out with the queue at capacity
    #[error("timeout waiting to enqueue the tile job for {acq_id}:{name}")]
    IngestionQueueFull { acq_id: u64, name: String },

    /// Stage-2 admission timed out; surfaced asynchronously, never to the
    /// caller of the current request
    #[error("timeout waiting to enqueue the content job for {acq_id}:{name}")]
    ContentQueueFull { acq_id: u64, name: String },

    /// Stage-1 worker could not resolve the mosaic or tile row
    #[error("metadata unavailable: {0}")]
    MetadataUnavailable(#[source] StoreError),

    /// Stage-2 put/verify/update failed after retries
    #[error("content store failure for {acq_id}:{name}: {message}")]
    ContentStoreFailure {
        acq_id: u64,
        name: String,
        message: String,
    },

    /// Spill file could not be written
    #[error("error writing temporary file {path}: {source}")]
    SpillFailure {
        path: String,
        source: std::io::Error,
    },

    /// Recovered panic or broken internal channel
    #[error("internal error: {0}")]
    Internal(String),
}

impl IngestError {
    /// True when the sender caused the failure (HTTP 400 rather than 500).
    pub fn is_caller_fault(&self) -> bool {
        matches!(
            self,
            IngestError::MalformedFrame(_)
                | IngestError::InvalidTileFileName(_)
                | IngestError::ChecksumMismatch(_)
        )
    }
}

impl From<WireError> for IngestError {
    fn from(e: WireError) -> Self {
        match e {
            WireError::ChecksumMismatch { .. } => IngestError::ChecksumMismatch(e.to_string()),
            other => IngestError::MalformedFrame(other.to_string()),
        }
    }
}

impl From<TileNameError> for IngestError {
    fn from(e: TileNameError) -> Self {
        IngestError::InvalidTileFileName(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caller_fault_classification() {
        assert!(IngestError::MalformedFrame("short".into()).is_caller_fault());
        assert!(IngestError::InvalidTileFileName("x.png".into()).is_caller_fault());
        assert!(IngestError::ChecksumMismatch("mismatch".into()).is_caller_fault());
        assert!(!IngestError::IngestionQueueFull {
            acq_id: 1,
            name: "t".into()
        }
        .is_caller_fault());
        assert!(!IngestError::Internal("boom".into()).is_caller_fault());
    }

    #[test]
    fn test_wire_error_mapping() {
        let checksum = WireError::ChecksumMismatch {
            carried: "aa".into(),
            computed: "bb".into(),
        };
        assert!(matches!(
            IngestError::from(checksum),
            IngestError::ChecksumMismatch(_)
        ));

        let truncated = WireError::Truncated {
            tag: 6,
            declared: 100,
            remaining: 10,
        };
        assert!(matches!(
            IngestError::from(truncated),
            IngestError::MalformedFrame(_)
        ));
    }

    #[test]
    fn test_queue_full_message_names_the_tile() {
        let err = IngestError::IngestionQueueFull {
            acq_id: 42,
            name: "col0001_row0002_cam0.tif".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("42"));
        assert!(msg.contains("col0001_row0002_cam0.tif"));
    }
}
