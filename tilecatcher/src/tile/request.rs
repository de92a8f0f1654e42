//! Tile request model and payload ownership.
//!
//! Tile payloads run 5-20 MB and hundreds can be in flight, so the bytes are
//! kept in a single reference-counted buffer from the moment the frame is
//! read until the content-storage stage finishes. [`PayloadBuf`] is the
//! explicit ownership handle: exactly one job owns it at a time and releases
//! it exactly once in its terminal cleanup, after every reader is done.

use crate::tile::TileParams;
use bytes::Bytes;
use std::time::Instant;

/// Owning handle for a tile's payload bytes.
///
/// Releasing drops the underlying buffer; subsequent reads see an empty
/// slice. Dropping an unreleased handle frees the buffer as well, so a
/// panicking worker cannot leak payload memory.
#[derive(Debug)]
pub struct PayloadBuf {
    bytes: Option<Bytes>,
    len: usize,
}

impl PayloadBuf {
    /// Wraps payload bytes in an ownership handle.
    pub fn new(bytes: Bytes) -> Self {
        let len = bytes.len();
        Self {
            bytes: Some(bytes),
            len,
        }
    }

    /// Returns the payload contents, or an empty slice after release.
    pub fn as_slice(&self) -> &[u8] {
        self.bytes.as_deref().unwrap_or(&[])
    }

    /// Returns a cheap reference-counted view of the payload.
    ///
    /// # Panics
    ///
    /// Panics if the payload was already released; callers clone only while
    /// the owning job is still live.
    pub fn share(&self) -> Bytes {
        self.bytes.clone().expect("payload accessed after release")
    }

    /// Original payload length; stable across release for logging.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if the payload was empty to begin with.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Frees the payload buffer. Idempotent.
    pub fn release(&mut self) {
        self.bytes = None;
    }

    /// True once [`release`](Self::release) has run.
    #[inline]
    pub fn is_released(&self) -> bool {
        self.bytes.is_none()
    }
}

impl From<Vec<u8>> for PayloadBuf {
    fn from(v: Vec<u8>) -> Self {
        Self::new(Bytes::from(v))
    }
}

/// A fully parsed tile upload, as handed to the ingestion controller.
///
/// Immutable once constructed apart from the payload handle, which the
/// content-storage stage releases when the tile reaches a terminal state.
#[derive(Debug)]
pub struct TileRequest {
    /// Acquisition this tile belongs to
    pub acq_id: u64,
    /// Tile address and file name
    pub params: TileParams,
    /// Payload ownership handle
    pub payload: PayloadBuf,
    /// MD5 of the payload as computed by the sender (may be empty on HTTP)
    pub checksum: Vec<u8>,
    /// When the transport started parsing this request
    pub received_at: Instant,
}

impl TileRequest {
    /// Creates a request, deriving the tile name if the sender omitted it.
    pub fn new(acq_id: u64, mut params: TileParams, payload: PayloadBuf, checksum: Vec<u8>) -> Self {
        params.ensure_name();
        Self {
            acq_id,
            params,
            payload,
            checksum,
            received_at: Instant::now(),
        }
    }

    /// Payload length in bytes.
    #[inline]
    pub fn content_len(&self) -> usize {
        self.payload.len()
    }
}

impl std::fmt::Display for TileRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{} ({})", self.acq_id, self.params.name, self.content_len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tile::STABLE_FRAME;

    #[test]
    fn test_payload_release_is_idempotent() {
        let mut payload = PayloadBuf::from(vec![1u8, 2, 3]);
        assert_eq!(payload.as_slice(), &[1, 2, 3]);
        assert!(!payload.is_released());

        payload.release();
        assert!(payload.is_released());
        assert_eq!(payload.as_slice(), &[] as &[u8]);

        payload.release();
        assert!(payload.is_released());
    }

    #[test]
    fn test_payload_len_survives_release() {
        let mut payload = PayloadBuf::from(vec![0u8; 1024]);
        payload.release();
        assert_eq!(payload.len(), 1024);
    }

    #[test]
    fn test_request_derives_missing_name() {
        let params = TileParams {
            col: 4,
            row: 2,
            camera: 0,
            frame: STABLE_FRAME,
            name: String::new(),
        };
        let request = TileRequest::new(77, params, PayloadBuf::from(vec![9u8]), vec![]);
        assert_eq!(request.params.name, "col0004_row0002_cam0.tif");
        assert_eq!(request.content_len(), 1);
    }

    #[test]
    fn test_shared_view_tracks_buffer() {
        let payload = PayloadBuf::from(vec![5u8; 16]);
        let view = payload.share();
        assert_eq!(view.len(), 16);
        assert_eq!(&view[..], payload.as_slice());
    }
}
