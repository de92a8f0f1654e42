//! External store interfaces consumed by the pipeline.
//!
//! The ingestion core does not own durable state. Tile metadata lives in a
//! relational store behind [`MetadataStore`]; tile content lives in a blob
//! store behind [`BlobStore`]. Both are consumed as trait objects so the
//! pipeline can run against the in-memory backend in [`memory`] for tests
//! and local development, or against real backends wired in by the host.
//!
//! Uniqueness of `(mosaic, col, row, frame)` is enforced by the metadata
//! store; it is the only serialization point across concurrent requests.

pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors surfaced by the external stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No mosaic registered for the acquisition
    #[error("no mosaic found for acquisition id {0}")]
    MosaicNotFound(u64),

    /// Referenced tile row does not exist
    #[error("no tile found for id {0}")]
    TileNotFound(i64),

    /// No blob stored under the given path
    #[error("no blob found at {0}")]
    BlobNotFound(String),

    /// Stored blob does not match what was sent
    #[error("verification failed for {path}: {reason}")]
    VerifyFailed { path: String, reason: String },

    /// Backend rejected or failed the operation
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Lifecycle state of a tile's ROI association.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoiState {
    /// Row created, content not yet durable
    Create,
    /// Content storage in flight
    InProgress,
    /// Content stored and verified; ready for downstream renderers
    Ready,
}

impl RoiState {
    /// Returns the state name as persisted by the metadata store.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::InProgress => "IN_PROGRESS",
            Self::Ready => "READY",
        }
    }
}

impl std::fmt::Display for RoiState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The mosaic entity bundle for one acquisition.
///
/// Fetched once per request by stage 1 and treated as immutable for the
/// request's lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mosaic {
    pub mosaic_id: i64,
    pub acq_id: u64,
    /// Identifier of the camera array that captured this acquisition
    pub temca_id: i64,
    pub sample: String,
    pub project: String,
    pub owner: String,
    pub stack: String,
}

/// Camera configuration resolved during registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraConfig {
    pub config_id: i64,
    pub camera: i32,
    pub width: i32,
    pub height: i32,
}

/// A tile row created (or found) by stage 1.
#[derive(Debug, Clone)]
pub struct RegisteredTile {
    pub tile_id: i64,
    pub mosaic: Mosaic,
    pub col: i32,
    pub row: i32,
    pub frame: i32,
    pub camera_config: Option<CameraConfig>,
}

impl RegisteredTile {
    /// Camera index for responses; -1 when no configuration was resolved.
    #[inline]
    pub fn camera(&self) -> i32 {
        self.camera_config.as_ref().map(|c| c.camera).unwrap_or(-1)
    }
}

impl std::fmt::Display for RegisteredTile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{{id: {}, col: {}, row: {}, camera: {}, frame: {}}}",
            self.tile_id,
            self.col,
            self.row,
            self.camera(),
            self.frame
        )
    }
}

/// Descriptor of a durably stored blob, returned by [`BlobStore::put`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobDescriptor {
    /// Opaque storage key assigned by the backend
    pub key: String,
    /// Logical path the blob was stored under
    pub path: String,
    /// Direct-access URL, when the backend exposes one
    pub location_url: Option<String>,
    /// Backend-computed MD5 of the stored bytes
    pub checksum: Vec<u8>,
    /// When the checksum was computed
    pub checksum_at: DateTime<Utc>,
}

/// Context metadata attached to every stored blob.
#[derive(Debug, Clone, Default)]
pub struct BlobMetadata {
    pub sample: String,
    pub project: String,
    pub owner: String,
    pub stack: String,
    /// Hex-encoded MD5 of the content, when the sender carried one
    pub checksum: Option<String>,
}

impl BlobMetadata {
    /// Builds the storage context for a tile of the given mosaic.
    pub fn for_mosaic(mosaic: &Mosaic, checksum: &[u8]) -> Self {
        Self {
            sample: mosaic.sample.clone(),
            project: mosaic.project.clone(),
            owner: mosaic.owner.clone(),
            stack: mosaic.stack.clone(),
            checksum: if checksum.is_empty() {
                None
            } else {
                Some(hex::encode(checksum))
            },
        }
    }
}

/// Logical blob path for an acquisition file.
pub fn acquisition_blob_path(acq_id: u64, name: &str) -> String {
    format!("/acquisitions/{}/{}", acq_id, name)
}

/// Relational metadata store, consumed per-call.
///
/// Sessions are acquired inside each method, never held across the
/// pipeline; writes run in a single transaction per call.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Fetches the acquisition's mosaic bundle.
    async fn get_mosaic(&self, acq_id: u64) -> Result<Mosaic, StoreError>;

    /// Creates the tile row for `(mosaic, col, row, frame)`, or returns the
    /// existing one. Re-sends are idempotent: the same address always maps
    /// to the same tile id.
    async fn create_or_get_tile(
        &self,
        mosaic: &Mosaic,
        col: i32,
        row: i32,
        frame: i32,
    ) -> Result<RegisteredTile, StoreError>;

    /// Resolves the camera configuration for a camera of the given array.
    async fn camera_config(&self, temca_id: i64, camera: i32) -> Result<CameraConfig, StoreError>;

    /// Associates a resolved camera configuration with the tile row.
    async fn update_tile_camera(
        &self,
        tile_id: i64,
        config: &CameraConfig,
    ) -> Result<(), StoreError>;

    /// Stamps the acquired timestamp and blob descriptor on the tile row.
    async fn update_tile_blob(
        &self,
        tile_id: i64,
        blob: &BlobDescriptor,
        acquired_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Moves every ROI association of the tile to `state`, returning the
    /// number of rows affected. Zero affected rows is not an error: the
    /// associations may already carry the requested state.
    async fn update_roi_state(&self, tile_id: i64, state: RoiState) -> Result<u64, StoreError>;

    /// True if the tile already has at least one ROI association.
    async fn tile_has_roi(&self, tile_id: i64) -> Result<bool, StoreError>;

    /// ROI ids registered for the mosaic cell `(col, row)`.
    async fn rois_for_cell(
        &self,
        mosaic_id: i64,
        col: i32,
        row: i32,
    ) -> Result<Vec<i64>, StoreError>;

    /// Associates the tile with an ROI in the given state.
    async fn associate_tile_roi(
        &self,
        tile_id: i64,
        roi_id: i64,
        state: RoiState,
    ) -> Result<(), StoreError>;

    /// Cheap connectivity probe for the health endpoint.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Durable content store, shared across workers.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Stores `content` under `path` with the given context metadata.
    async fn put(
        &self,
        path: &str,
        content: Bytes,
        metadata: &BlobMetadata,
    ) -> Result<BlobDescriptor, StoreError>;

    /// Checks that the stored copy under `path` matches the given key.
    async fn verify(&self, path: &str, key: &str) -> Result<(), StoreError>;

    /// Retrieves the stored bytes.
    async fn get(&self, path: &str) -> Result<Bytes, StoreError>;
}
