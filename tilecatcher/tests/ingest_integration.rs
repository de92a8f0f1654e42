//! End-to-end ingestion tests over the real transports.
//!
//! Each test boots the pipeline against the in-memory backends, binds the
//! relevant server on an ephemeral port and drives it the way a microscope
//! client would.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use md5::{Digest, Md5};
use std::sync::Arc;
use std::time::Duration;
use tilecatcher::codec::{FrameCodec, WireTileRequest, WireTileResponse, DEFAULT_MAX_FRAME_LEN};
use tilecatcher::config::Settings;
use tilecatcher::notify::LogNotifier;
use tilecatcher::pipeline::IngestController;
use tilecatcher::server::TcpServer;
use tilecatcher::store::memory::{MemoryBlobStore, MemoryMetadataStore};
use tilecatcher::store::{
    BlobDescriptor, CameraConfig, MetadataStore, Mosaic, RegisteredTile, RoiState, StoreError,
};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

struct Harness {
    metadata: Arc<MemoryMetadataStore>,
    blobs: Arc<MemoryBlobStore>,
    controller: Arc<IngestController>,
    _tmp: tempfile::TempDir,
}

fn harness(mut settings: Settings) -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    settings.tmp_data_dir = tmp.path().to_path_buf();
    let metadata = Arc::new(MemoryMetadataStore::new());
    let blobs = Arc::new(MemoryBlobStore::new());
    let controller = IngestController::start(
        &settings,
        metadata.clone() as Arc<dyn MetadataStore>,
        blobs.clone(),
        Arc::new(LogNotifier),
    );
    Harness {
        metadata,
        blobs,
        controller,
        _tmp: tmp,
    }
}

async fn start_tcp(harness: &Harness, settings: &Settings) -> std::net::SocketAddr {
    let server = TcpServer::bind("127.0.0.1:0", settings, Arc::clone(&harness.controller))
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());
    addr
}

fn tile_request(acq_id: u64, col: i32, row: i32, image: Vec<u8>) -> WireTileRequest {
    let checksum = Md5::digest(&image).to_vec();
    WireTileRequest {
        acq_id,
        camera: 1,
        frame: -1,
        col,
        row,
        image: Bytes::from(image),
        checksum,
    }
}

async fn read_response(framed: &mut Framed<TcpStream, FrameCodec>) -> WireTileResponse {
    let frame = tokio::time::timeout(Duration::from_secs(10), framed.next())
        .await
        .expect("response timed out")
        .expect("connection closed")
        .expect("frame error");
    WireTileResponse::decode(frame).unwrap()
}

async fn round_trip(
    framed: &mut Framed<TcpStream, FrameCodec>,
    request: &WireTileRequest,
) -> WireTileResponse {
    framed.send(request.encode()).await.unwrap();
    read_response(framed).await
}

async fn wait_for<F: Fn() -> bool>(what: &str, check: F) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test]
async fn socket_round_trip_stores_tile() {
    let settings = Settings {
        tile_workers: 2,
        tile_queue_size: 8,
        content_workers: 2,
        content_queue_size: 8,
        ..Settings::default()
    };
    let fx = harness(settings.clone());
    fx.metadata.register_mosaic(456, "sample", "proj", "owner");
    let addr = start_tcp(&fx, &settings).await;

    let stream = TcpStream::connect(addr).await.unwrap();
    let mut framed = Framed::new(stream, FrameCodec::new());

    let request = tile_request(456, 3, 9, vec![0x5au8; 1 << 20]);
    let response = round_trip(&mut framed, &request).await;

    assert_eq!(response.acq_id, 456);
    assert_eq!(response.status, 0);
    assert!(response.tile_id > 0);
    assert!((0..=2).contains(&response.system_status));

    let blobs = fx.blobs.clone();
    wait_for("blob landing", move || {
        blobs.contains("/acquisitions/456/col0003_row0009_cam1.tif")
    })
    .await;
}

#[tokio::test]
async fn socket_checksum_mismatch_rejects_before_pipeline() {
    let settings = Settings::default();
    let fx = harness(settings.clone());
    fx.metadata.register_mosaic(456, "s", "p", "o");
    let addr = start_tcp(&fx, &settings).await;

    let stream = TcpStream::connect(addr).await.unwrap();
    let mut framed = Framed::new(stream, FrameCodec::new());

    let mut request = tile_request(456, 3, 9, vec![0x5au8; 4096]);
    request.checksum = Md5::digest(b"other bytes").to_vec();
    let response = round_trip(&mut framed, &request).await;

    assert_eq!(response.acq_id, 456);
    assert_ne!(response.status, 0);
    assert_eq!(response.tile_id, 0);
    assert_eq!(response.system_status, 2, "error paths force RED");
    assert_eq!(fx.blobs.put_count(), 0);
    assert_eq!(fx.metadata.tile_count(), 0);

    // the connection survives the failure and serves the next request
    let good = tile_request(456, 3, 9, vec![0x5au8; 4096]);
    let response = round_trip(&mut framed, &good).await;
    assert_eq!(response.status, 0);
    assert!(response.tile_id > 0);
}

#[tokio::test]
async fn socket_connection_survives_oversized_frame() {
    let settings = Settings::default();
    let fx = harness(settings.clone());
    fx.metadata.register_mosaic(456, "s", "p", "o");
    let addr = start_tcp(&fx, &settings).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();

    // A frame whose declared length exceeds the limit. The server must
    // answer with a failure response, skip the declared payload and keep
    // the connection usable.
    let oversized = DEFAULT_MAX_FRAME_LEN + 1;
    stream
        .write_all(&(oversized as u32).to_le_bytes())
        .await
        .unwrap();
    let chunk = vec![0u8; 1 << 20];
    let mut remaining = oversized;
    while remaining > 0 {
        let n = remaining.min(chunk.len());
        stream.write_all(&chunk[..n]).await.unwrap();
        remaining -= n;
    }

    // Follow up with a well-formed request on the same connection.
    let mut framed = Framed::new(stream, FrameCodec::new());
    let request = tile_request(456, 1, 1, vec![0x7fu8; 2048]);
    framed.send(request.encode()).await.unwrap();

    // First the framing-error response, then the real one.
    let error_response = read_response(&mut framed).await;
    assert_ne!(error_response.status, 0);
    assert_eq!(error_response.tile_id, 0);
    assert_eq!(error_response.system_status, 2, "error paths force RED");

    let response = read_response(&mut framed).await;
    assert_eq!(response.status, 0);
    assert!(response.tile_id > 0);
    assert_eq!(fx.metadata.tile_count(), 1);
}

#[tokio::test]
async fn socket_connection_serves_many_requests_in_order() {
    let settings = Settings {
        tile_workers: 2,
        tile_queue_size: 8,
        content_workers: 2,
        content_queue_size: 8,
        ..Settings::default()
    };
    let fx = harness(settings.clone());
    fx.metadata.register_mosaic(7, "s", "p", "o");
    let addr = start_tcp(&fx, &settings).await;

    let stream = TcpStream::connect(addr).await.unwrap();
    let mut framed = Framed::new(stream, FrameCodec::new());

    for col in 0..5 {
        let request = tile_request(7, col, 0, vec![col as u8; 2048]);
        let response = round_trip(&mut framed, &request).await;
        assert_eq!(response.status, 0, "col {} failed", col);
    }
    assert_eq!(fx.metadata.tile_count(), 5);
}

#[tokio::test]
async fn duplicate_sends_share_one_metadata_row() {
    let settings = Settings {
        tile_workers: 2,
        tile_queue_size: 8,
        content_workers: 2,
        content_queue_size: 8,
        ..Settings::default()
    };
    let fx = harness(settings.clone());
    fx.metadata.register_mosaic(123, "s", "p", "o");
    let addr = start_tcp(&fx, &settings).await;

    let stream = TcpStream::connect(addr).await.unwrap();
    let mut framed = Framed::new(stream, FrameCodec::new());

    let request = tile_request(123, 5, 7, vec![0x42u8; 8192]);
    let first = round_trip(&mut framed, &request).await;
    let second = round_trip(&mut framed, &request).await;

    assert_eq!(first.status, 0);
    assert_eq!(second.status, 0);
    assert_eq!(first.tile_id, second.tile_id);
    assert_eq!(fx.metadata.tile_count(), 1);

    let blobs = fx.blobs.clone();
    wait_for("both puts", move || blobs.put_count() >= 2).await;
}

/// Delegating metadata store that slows the mosaic lookup, pinning
/// registration workers long enough to saturate the admission queue.
struct SlowMetadata {
    inner: Arc<MemoryMetadataStore>,
    delay: Duration,
}

#[async_trait]
impl MetadataStore for SlowMetadata {
    async fn get_mosaic(&self, acq_id: u64) -> Result<Mosaic, StoreError> {
        tokio::time::sleep(self.delay).await;
        self.inner.get_mosaic(acq_id).await
    }

    async fn create_or_get_tile(
        &self,
        mosaic: &Mosaic,
        col: i32,
        row: i32,
        frame: i32,
    ) -> Result<RegisteredTile, StoreError> {
        self.inner.create_or_get_tile(mosaic, col, row, frame).await
    }

    async fn camera_config(&self, temca_id: i64, camera: i32) -> Result<CameraConfig, StoreError> {
        self.inner.camera_config(temca_id, camera).await
    }

    async fn update_tile_camera(
        &self,
        tile_id: i64,
        config: &CameraConfig,
    ) -> Result<(), StoreError> {
        self.inner.update_tile_camera(tile_id, config).await
    }

    async fn update_tile_blob(
        &self,
        tile_id: i64,
        blob: &BlobDescriptor,
        acquired_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.inner.update_tile_blob(tile_id, blob, acquired_at).await
    }

    async fn update_roi_state(&self, tile_id: i64, state: RoiState) -> Result<u64, StoreError> {
        self.inner.update_roi_state(tile_id, state).await
    }

    async fn tile_has_roi(&self, tile_id: i64) -> Result<bool, StoreError> {
        self.inner.tile_has_roi(tile_id).await
    }

    async fn rois_for_cell(
        &self,
        mosaic_id: i64,
        col: i32,
        row: i32,
    ) -> Result<Vec<i64>, StoreError> {
        self.inner.rois_for_cell(mosaic_id, col, row).await
    }

    async fn associate_tile_roi(
        &self,
        tile_id: i64,
        roi_id: i64,
        state: RoiState,
    ) -> Result<(), StoreError> {
        self.inner.associate_tile_roi(tile_id, roi_id, state).await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.inner.ping().await
    }
}

#[tokio::test]
async fn saturation_turns_requests_away_with_queue_full() {
    let settings = Settings {
        tile_workers: 2,
        tile_queue_size: 1,
        content_workers: 2,
        content_queue_size: 8,
        wait_timeout: Duration::from_millis(50),
        ..Settings::default()
    };
    let tmp = tempfile::tempdir().unwrap();
    let settings = Settings {
        tmp_data_dir: tmp.path().to_path_buf(),
        ..settings
    };

    let memory = Arc::new(MemoryMetadataStore::new());
    memory.register_mosaic(9, "s", "p", "o");
    let slow = Arc::new(SlowMetadata {
        inner: memory,
        delay: Duration::from_millis(500),
    });
    let controller = IngestController::start(
        &settings,
        slow,
        Arc::new(MemoryBlobStore::new()),
        Arc::new(LogNotifier),
    );

    let server = TcpServer::bind("127.0.0.1:0", &settings, Arc::clone(&controller))
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());

    // Ten concurrent senders against two workers and a one-slot queue.
    let mut clients = Vec::new();
    for col in 0..10 {
        clients.push(tokio::spawn(async move {
            let stream = TcpStream::connect(addr).await.unwrap();
            let mut framed = Framed::new(stream, FrameCodec::new());
            let request = tile_request(9, col, 0, vec![1u8; 1024]);
            round_trip(&mut framed, &request).await
        }));
    }

    let mut failures = 0;
    let mut red_failures = 0;
    for client in clients {
        let response = client.await.unwrap();
        if response.status != 0 {
            failures += 1;
            if response.system_status == 2 {
                red_failures += 1;
            }
        }
    }
    assert!(failures > 0, "at least one request hits the full queue");
    assert_eq!(failures, red_failures, "turned-away responses read RED");
}
