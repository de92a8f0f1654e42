//! In-memory store backends.
//!
//! Used by the CLI when no real backends are wired in, and by the test
//! suites. Behavior mirrors the production contracts: tile rows are unique
//! per `(mosaic, col, row, frame)`, blob puts are idempotent by path, and
//! ROI state updates report affected-row counts.

use crate::store::{
    BlobDescriptor, BlobMetadata, BlobStore, CameraConfig, MetadataStore, Mosaic, RegisteredTile,
    RoiState, StoreError,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use md5::{Digest, Md5};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

#[derive(Debug, Clone)]
struct TileRow {
    tile_id: i64,
    mosaic_id: i64,
    col: i32,
    row: i32,
    frame: i32,
    camera_config: Option<CameraConfig>,
    blob: Option<BlobDescriptor>,
}

/// In-memory metadata store.
///
/// Mosaics are either registered up front with
/// [`register_mosaic`](Self::register_mosaic) or, when auto-create is on,
/// materialized on first use so a bare `serve` run can accept tiles without
/// any provisioning step.
pub struct MemoryMetadataStore {
    auto_create_mosaics: bool,
    mosaics: DashMap<u64, Mosaic>,
    tiles_by_addr: DashMap<(i64, i32, i32, i32), i64>,
    tiles: DashMap<i64, TileRow>,
    /// ROI ids registered per mosaic cell
    cell_rois: DashMap<(i64, i32, i32), Vec<i64>>,
    /// ROI associations per tile
    tile_rois: DashMap<i64, Vec<(i64, RoiState)>>,
    next_id: AtomicI64,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self {
            auto_create_mosaics: false,
            mosaics: DashMap::new(),
            tiles_by_addr: DashMap::new(),
            tiles: DashMap::new(),
            cell_rois: DashMap::new(),
            tile_rois: DashMap::new(),
            next_id: AtomicI64::new(1),
        }
    }

    /// Creates a store that materializes a mosaic on first reference.
    pub fn with_auto_mosaics() -> Self {
        Self {
            auto_create_mosaics: true,
            ..Self::new()
        }
    }

    fn alloc_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Registers a mosaic for an acquisition, returning it.
    pub fn register_mosaic(&self, acq_id: u64, sample: &str, project: &str, owner: &str) -> Mosaic {
        let mosaic = Mosaic {
            mosaic_id: self.alloc_id(),
            acq_id,
            temca_id: 1,
            sample: sample.to_string(),
            project: project.to_string(),
            owner: owner.to_string(),
            stack: String::new(),
        };
        self.mosaics.entry(acq_id).or_insert(mosaic.clone());
        self.mosaics.get(&acq_id).map(|m| m.clone()).unwrap_or(mosaic)
    }

    /// Registers an ROI covering the given mosaic cells, returning its id.
    pub fn register_roi(&self, mosaic_id: i64, cells: &[(i32, i32)]) -> i64 {
        let roi_id = self.alloc_id();
        for &(col, row) in cells {
            self.cell_rois
                .entry((mosaic_id, col, row))
                .or_default()
                .push(roi_id);
        }
        roi_id
    }

    /// ROI associations currently held by a tile, for assertions.
    pub fn roi_associations(&self, tile_id: i64) -> Vec<(i64, RoiState)> {
        self.tile_rois.get(&tile_id).map(|r| r.clone()).unwrap_or_default()
    }

    /// Number of tile rows, for duplicate-registration assertions.
    pub fn tile_count(&self) -> usize {
        self.tiles.len()
    }

    /// Blob descriptor stored on a tile row, if stage 2 reached it.
    pub fn tile_blob(&self, tile_id: i64) -> Option<BlobDescriptor> {
        self.tiles.get(&tile_id).and_then(|t| t.blob.clone())
    }
}

impl Default for MemoryMetadataStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn get_mosaic(&self, acq_id: u64) -> Result<Mosaic, StoreError> {
        if let Some(mosaic) = self.mosaics.get(&acq_id) {
            return Ok(mosaic.clone());
        }
        if self.auto_create_mosaics {
            return Ok(self.register_mosaic(acq_id, "unregistered", "", ""));
        }
        Err(StoreError::MosaicNotFound(acq_id))
    }

    async fn create_or_get_tile(
        &self,
        mosaic: &Mosaic,
        col: i32,
        row: i32,
        frame: i32,
    ) -> Result<RegisteredTile, StoreError> {
        let addr = (mosaic.mosaic_id, col, row, frame);
        let tile_id = *self.tiles_by_addr.entry(addr).or_insert_with(|| {
            let tile_id = self.alloc_id();
            self.tiles.insert(
                tile_id,
                TileRow {
                    tile_id,
                    mosaic_id: mosaic.mosaic_id,
                    col,
                    row,
                    frame,
                    camera_config: None,
                    blob: None,
                },
            );
            tile_id
        });
        let camera_config = self
            .tiles
            .get(&tile_id)
            .ok_or(StoreError::TileNotFound(tile_id))?
            .camera_config
            .clone();
        Ok(RegisteredTile {
            tile_id,
            mosaic: mosaic.clone(),
            col,
            row,
            frame,
            camera_config,
        })
    }

    async fn camera_config(&self, _temca_id: i64, camera: i32) -> Result<CameraConfig, StoreError> {
        Ok(CameraConfig {
            config_id: camera as i64 + 1,
            camera,
            width: 2048,
            height: 2048,
        })
    }

    async fn update_tile_camera(
        &self,
        tile_id: i64,
        config: &CameraConfig,
    ) -> Result<(), StoreError> {
        let mut tile = self
            .tiles
            .get_mut(&tile_id)
            .ok_or(StoreError::TileNotFound(tile_id))?;
        tile.camera_config = Some(config.clone());
        Ok(())
    }

    async fn update_tile_blob(
        &self,
        tile_id: i64,
        blob: &BlobDescriptor,
        _acquired_at: chrono::DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tile = self
            .tiles
            .get_mut(&tile_id)
            .ok_or(StoreError::TileNotFound(tile_id))?;
        tile.blob = Some(blob.clone());
        Ok(())
    }

    async fn update_roi_state(&self, tile_id: i64, state: RoiState) -> Result<u64, StoreError> {
        if !self.tiles.contains_key(&tile_id) {
            return Err(StoreError::TileNotFound(tile_id));
        }
        let mut affected = 0;
        if let Some(mut rois) = self.tile_rois.get_mut(&tile_id) {
            for entry in rois.iter_mut() {
                if entry.1 != state {
                    entry.1 = state;
                    affected += 1;
                }
            }
        }
        Ok(affected)
    }

    async fn tile_has_roi(&self, tile_id: i64) -> Result<bool, StoreError> {
        Ok(self.tile_rois.get(&tile_id).map(|r| !r.is_empty()).unwrap_or(false))
    }

    async fn rois_for_cell(
        &self,
        mosaic_id: i64,
        col: i32,
        row: i32,
    ) -> Result<Vec<i64>, StoreError> {
        Ok(self
            .cell_rois
            .get(&(mosaic_id, col, row))
            .map(|r| r.clone())
            .unwrap_or_default())
    }

    async fn associate_tile_roi(
        &self,
        tile_id: i64,
        roi_id: i64,
        state: RoiState,
    ) -> Result<(), StoreError> {
        if !self.tiles.contains_key(&tile_id) {
            return Err(StoreError::TileNotFound(tile_id));
        }
        self.tile_rois.entry(tile_id).or_default().push((roi_id, state));
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// In-memory blob store with optional failure injection.
pub struct MemoryBlobStore {
    blobs: DashMap<String, (Bytes, BlobDescriptor)>,
    put_count: AtomicUsize,
    fail_puts: AtomicUsize,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self {
            blobs: DashMap::new(),
            put_count: AtomicUsize::new(0),
            fail_puts: AtomicUsize::new(0),
        }
    }

    /// Makes the next `n` puts fail, for exercising the retry path.
    pub fn fail_next_puts(&self, n: usize) {
        self.fail_puts.store(n, Ordering::SeqCst);
    }

    /// Total puts attempted, including injected failures.
    pub fn put_count(&self) -> usize {
        self.put_count.load(Ordering::SeqCst)
    }

    /// True if a blob exists under the path.
    pub fn contains(&self, path: &str) -> bool {
        self.blobs.contains_key(path)
    }
}

impl Default for MemoryBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(
        &self,
        path: &str,
        content: Bytes,
        _metadata: &BlobMetadata,
    ) -> Result<BlobDescriptor, StoreError> {
        self.put_count.fetch_add(1, Ordering::SeqCst);
        let remaining = self.fail_puts.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_puts.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Backend("injected put failure".to_string()));
        }

        let checksum = Md5::digest(&content).to_vec();
        let descriptor = BlobDescriptor {
            key: hex::encode(&checksum),
            path: path.to_string(),
            location_url: Some(format!("memory://{}", path)),
            checksum,
            checksum_at: Utc::now(),
        };
        self.blobs.insert(path.to_string(), (content, descriptor.clone()));
        Ok(descriptor)
    }

    async fn verify(&self, path: &str, key: &str) -> Result<(), StoreError> {
        let entry = self
            .blobs
            .get(path)
            .ok_or_else(|| StoreError::BlobNotFound(path.to_string()))?;
        if entry.1.key != key {
            return Err(StoreError::VerifyFailed {
                path: path.to_string(),
                reason: format!("stored key {} does not match {}", entry.1.key, key),
            });
        }
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Bytes, StoreError> {
        self.blobs
            .get(path)
            .map(|entry| entry.0.clone())
            .ok_or_else(|| StoreError::BlobNotFound(path.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_mosaic_requires_registration() {
        let store = MemoryMetadataStore::new();
        assert!(matches!(
            store.get_mosaic(42).await,
            Err(StoreError::MosaicNotFound(42))
        ));

        store.register_mosaic(42, "sample", "proj", "owner");
        let mosaic = store.get_mosaic(42).await.unwrap();
        assert_eq!(mosaic.acq_id, 42);
        assert_eq!(mosaic.sample, "sample");
    }

    #[tokio::test]
    async fn test_auto_mosaic_materializes() {
        let store = MemoryMetadataStore::with_auto_mosaics();
        let mosaic = store.get_mosaic(7).await.unwrap();
        assert_eq!(mosaic.acq_id, 7);
        // second fetch returns the same mosaic
        let again = store.get_mosaic(7).await.unwrap();
        assert_eq!(again.mosaic_id, mosaic.mosaic_id);
    }

    #[tokio::test]
    async fn test_create_or_get_tile_is_idempotent() {
        let store = MemoryMetadataStore::new();
        let mosaic = store.register_mosaic(1, "s", "p", "o");

        let first = store.create_or_get_tile(&mosaic, 5, 7, -1).await.unwrap();
        let second = store.create_or_get_tile(&mosaic, 5, 7, -1).await.unwrap();
        assert_eq!(first.tile_id, second.tile_id);
        assert_eq!(store.tile_count(), 1);

        let drift = store.create_or_get_tile(&mosaic, 5, 7, 3).await.unwrap();
        assert_ne!(drift.tile_id, first.tile_id);
        assert_eq!(store.tile_count(), 2);
    }

    #[tokio::test]
    async fn test_roi_state_update_counts_rows() {
        let store = MemoryMetadataStore::new();
        let mosaic = store.register_mosaic(1, "s", "p", "o");
        let roi = store.register_roi(mosaic.mosaic_id, &[(0, 0)]);
        let tile = store.create_or_get_tile(&mosaic, 0, 0, -1).await.unwrap();

        store.associate_tile_roi(tile.tile_id, roi, RoiState::Create).await.unwrap();
        assert_eq!(store.update_roi_state(tile.tile_id, RoiState::Ready).await.unwrap(), 1);
        // state already matches: zero rows affected, still success
        assert_eq!(store.update_roi_state(tile.tile_id, RoiState::Ready).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_blob_put_verify_get() {
        let store = MemoryBlobStore::new();
        let content = Bytes::from_static(b"tile bytes");
        let descriptor = store
            .put("/acquisitions/1/a.tif", content.clone(), &BlobMetadata::default())
            .await
            .unwrap();

        store.verify("/acquisitions/1/a.tif", &descriptor.key).await.unwrap();
        assert_eq!(store.get("/acquisitions/1/a.tif").await.unwrap(), content);
        assert!(store.verify("/acquisitions/1/a.tif", "wrong").await.is_err());
    }

    #[tokio::test]
    async fn test_blob_put_is_idempotent_by_path() {
        let store = MemoryBlobStore::new();
        let content = Bytes::from_static(b"same bytes");
        let first = store
            .put("/acquisitions/1/a.tif", content.clone(), &BlobMetadata::default())
            .await
            .unwrap();
        let second = store
            .put("/acquisitions/1/a.tif", content, &BlobMetadata::default())
            .await
            .unwrap();
        assert_eq!(first.key, second.key);
        assert_eq!(store.put_count(), 2);
    }

    #[tokio::test]
    async fn test_injected_put_failures() {
        let store = MemoryBlobStore::new();
        store.fail_next_puts(2);

        let meta = BlobMetadata::default();
        assert!(store.put("/a", Bytes::new(), &meta).await.is_err());
        assert!(store.put("/a", Bytes::new(), &meta).await.is_err());
        assert!(store.put("/a", Bytes::new(), &meta).await.is_ok());
        assert_eq!(store.put_count(), 3);
    }
}
