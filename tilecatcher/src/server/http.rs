//! HTTP transport.
//!
//! Routes `PUT|POST /service/v1/capture-image-content/{acqid}` to the
//! ingestion controller and `GET /service/v1/ping` to the health probe.
//! Two upload forms are accepted:
//!
//! - multipart form with fields `tile-file` (bytes), `tile-filename`
//!   (string) and an optional `checksum` (raw bytes) or `checksum-str`
//!   (hex string);
//! - body-carried: the raw image bytes are the request body, with
//!   `tile-filename` and an optional hex `checksum` in the query string.
//!
//! Every response carries the backpressure triple in the
//! `System-Status` / `Tile-Queue-Status` / `Content-Queue-Status` headers.

use crate::codec::DEFAULT_MAX_FRAME_LEN;
use crate::config::Settings;
use crate::pipeline::{IngestController, IngestError, IngestOutcome};
use crate::tile::{parse_tile_name, PayloadBuf, TileParams, TileRequest};
use axum::extract::{Multipart, Path, Query, Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, RequestExt, Router};
use bytes::Bytes;
use md5::{Digest, Md5};
use serde_json::json;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

/// Header carrying the combined system status.
pub const SYSTEM_STATUS_HEADER: &str = "system-status";
/// Header carrying the stage-1 queue status.
pub const TILE_QUEUE_STATUS_HEADER: &str = "tile-queue-status";
/// Header carrying the stage-2 queue status.
pub const CONTENT_QUEUE_STATUS_HEADER: &str = "content-queue-status";

#[derive(Clone)]
struct AppState {
    controller: Arc<IngestController>,
    disable_keep_alive: bool,
}

/// HTTP server for tile capture and health probes.
pub struct HttpServer {
    listener: TcpListener,
    router: Router,
}

impl HttpServer {
    /// Binds the listener and builds the router.
    pub async fn bind(
        addr: &str,
        settings: &Settings,
        controller: Arc<IngestController>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "http server listening");
        Ok(Self {
            listener,
            router: router(settings, controller),
        })
    }

    /// The bound address; useful when binding to port 0.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serves requests until the process exits.
    pub async fn run(self) -> io::Result<()> {
        axum::serve(self.listener, self.router).await
    }
}

/// Builds the service router; exposed for in-process tests.
pub fn router(settings: &Settings, controller: Arc<IngestController>) -> Router {
    let state = AppState {
        controller,
        disable_keep_alive: settings.disable_keep_alive,
    };
    Router::new()
        .route(
            "/service/v1/capture-image-content/:acqid",
            put(capture_image).post(capture_image),
        )
        .route("/service/v1/ping", get(ping))
        .with_state(state)
}

async fn ping(State(state): State<AppState>) -> Response {
    match state.controller.ping().await {
        Ok(()) => decorate(&state, StatusCode::OK, Json(json!({})).into_response()),
        Err(e) => {
            error!(error = %e, "ping failed");
            decorate(
                &state,
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "errormessage": e.to_string() })).into_response(),
            )
        }
    }
}

async fn capture_image(
    State(state): State<AppState>,
    Path(acqid): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    request: Request,
) -> Response {
    let start = Instant::now();
    debug!(acqid = %acqid, "start processing capture-image-content");

    let acq_id: u64 = match acqid.parse() {
        Ok(id) => id,
        Err(e) => {
            error!(acqid = %acqid, error = %e, "error while parsing the acqid parameter");
            return error_response(
                &state,
                StatusCode::BAD_REQUEST,
                &format!("error while parsing the acqid parameter: {}", e),
            );
        }
    };

    let parsed = match extract_tile_request(acq_id, &query, request).await {
        Ok(parsed) => parsed,
        Err(e) => {
            error!(
                acq_id,
                error = %e,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "error extracting the tile parameters"
            );
            let code = if e.is_caller_fault() {
                StatusCode::BAD_REQUEST
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            return error_response(&state, code, &e.to_string());
        }
    };

    info!(
        acq_id,
        tile = %parsed.params.name,
        bytes = parsed.content_len(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "end request parsing"
    );

    let outcome = state.controller.ingest(parsed).await;
    let response = outcome_response(&state, &outcome);
    info!(
        acq_id,
        tile = %outcome.params.name,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "end capture-image-content"
    );
    response
}

/// Pulls the tile parameters and content out of either upload form.
async fn extract_tile_request(
    acq_id: u64,
    query: &HashMap<String, String>,
    request: Request,
) -> Result<TileRequest, IngestError> {
    let content_type = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let (params, content, checksum) = if content_type.starts_with("multipart/form-data") {
        extract_from_multipart(request).await?
    } else {
        extract_from_body(query, request).await?
    };

    if !checksum.is_empty() {
        let computed = Md5::digest(&content);
        if computed.as_slice() != checksum.as_slice() {
            return Err(IngestError::ChecksumMismatch(format!(
                "the received checksum {} and the calculated checksum {} do not match",
                hex::encode(&checksum),
                hex::encode(computed)
            )));
        }
    }

    Ok(TileRequest::new(
        acq_id,
        params,
        PayloadBuf::new(content),
        checksum,
    ))
}

async fn extract_from_multipart(
    request: Request,
) -> Result<(TileParams, Bytes, Vec<u8>), IngestError> {
    let mut multipart = request
        .extract::<Multipart, _>()
        .await
        .map_err(|e| IngestError::MalformedFrame(e.to_string()))?;

    let mut params: Option<TileParams> = None;
    let mut content: Option<Bytes> = None;
    let mut checksum: Vec<u8> = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| IngestError::MalformedFrame(e.to_string()))?
    {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "tile-filename" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| IngestError::MalformedFrame(e.to_string()))?;
                params = Some(parse_tile_name(&text)?);
            }
            "checksum" => {
                checksum = field
                    .bytes()
                    .await
                    .map_err(|e| IngestError::MalformedFrame(e.to_string()))?
                    .to_vec();
            }
            // the checksum comes hex encoded in this field
            "checksum-str" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| IngestError::MalformedFrame(e.to_string()))?;
                match hex::decode(text.trim()) {
                    Ok(decoded) => checksum = decoded,
                    Err(e) => error!(error = %e, "error decoding the checksum field"),
                }
            }
            "tile-file" => {
                let file_name = field.file_name().map(str::to_string);
                if params.is_none() {
                    if let Some(file_name) = &file_name {
                        debug!(file = %file_name, "extracting tile params from the file name");
                        params = parse_tile_name(file_name).ok();
                    }
                }
                content = Some(
                    field
                        .bytes()
                        .await
                        .map_err(|e| IngestError::MalformedFrame(e.to_string()))?,
                );
            }
            _ => {}
        }
    }

    let params = params.ok_or_else(|| {
        IngestError::InvalidTileFileName("no tile-filename in the multipart form".to_string())
    })?;
    Ok((params, content.unwrap_or_default(), checksum))
}

async fn extract_from_body(
    query: &HashMap<String, String>,
    request: Request,
) -> Result<(TileParams, Bytes, Vec<u8>), IngestError> {
    let tile_filename = query.get("tile-filename").ok_or_else(|| {
        IngestError::InvalidTileFileName("no tile-filename query parameter".to_string())
    })?;
    let params = parse_tile_name(tile_filename)?;

    let mut checksum = Vec::new();
    if let Some(carried) = query.get("checksum") {
        match hex::decode(carried.trim()) {
            Ok(decoded) => checksum = decoded,
            Err(e) => error!(error = %e, "error decoding the checksum parameter"),
        }
    }

    let content = axum::body::to_bytes(request.into_body(), DEFAULT_MAX_FRAME_LEN)
        .await
        .map_err(|e| IngestError::MalformedFrame(format!("error reading the request body: {}", e)))?;
    Ok((params, content, checksum))
}

fn outcome_response(state: &AppState, outcome: &IngestOutcome) -> Response {
    if let Some(error) = &outcome.error {
        let code = if error.is_caller_fault() {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        return outcome_decorate(state, outcome, code, error.to_string());
    }
    if let Some(deferred) = &outcome.deferred_error {
        return outcome_decorate(
            state,
            outcome,
            StatusCode::INTERNAL_SERVER_ERROR,
            deferred.clone(),
        );
    }

    let tile = outcome.tile.as_ref().expect("successful outcome has a tile");
    let body = json!({
        "tile_acq_id": outcome.acq_id,
        "tile_temca": tile.mosaic.temca_id,
        "tile_id": tile.tile_id,
        "tile_col": tile.col,
        "tile_row": tile.row,
        "tile_camera": tile.camera(),
        "tile_frame": tile.frame,
    });
    let mut response = decorate(state, StatusCode::OK, Json(body).into_response());
    apply_status_headers(&mut response, outcome);
    response
}

fn outcome_decorate(
    state: &AppState,
    outcome: &IngestOutcome,
    code: StatusCode,
    message: String,
) -> Response {
    let mut response = decorate(
        state,
        code,
        Json(json!({ "errormessage": message })).into_response(),
    );
    apply_status_headers(&mut response, outcome);
    response
}

/// Writes the outcome's backpressure triple into the response headers.
fn apply_status_headers(response: &mut Response, outcome: &IngestOutcome) {
    let headers = response.headers_mut();
    headers.insert(
        SYSTEM_STATUS_HEADER,
        HeaderValue::from_static(outcome.status.system.as_str()),
    );
    headers.insert(
        TILE_QUEUE_STATUS_HEADER,
        HeaderValue::from_static(outcome.status.tile_queue.as_str()),
    );
    headers.insert(
        CONTENT_QUEUE_STATUS_HEADER,
        HeaderValue::from_static(outcome.status.content_queue.as_str()),
    );
}

/// Applies the status code, current queue headers and keep-alive policy.
fn decorate(state: &AppState, code: StatusCode, mut response: Response) -> Response {
    *response.status_mut() = code;
    let status = state.controller.queue_status();
    let headers = response.headers_mut();
    headers.insert(
        SYSTEM_STATUS_HEADER,
        HeaderValue::from_static(status.system.as_str()),
    );
    headers.insert(
        TILE_QUEUE_STATUS_HEADER,
        HeaderValue::from_static(status.tile_queue.as_str()),
    );
    headers.insert(
        CONTENT_QUEUE_STATUS_HEADER,
        HeaderValue::from_static(status.content_queue.as_str()),
    );
    if state.disable_keep_alive {
        headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
    }
    response
}

fn error_response(state: &AppState, code: StatusCode, message: &str) -> Response {
    let mut response = decorate(
        state,
        code,
        Json(json!({ "errormessage": message })).into_response(),
    );
    // explicit error paths push the sender toward throttling
    response.headers_mut().insert(
        SYSTEM_STATUS_HEADER,
        HeaderValue::from_static(crate::pipeline::QueueStatus::Red.as_str()),
    );
    response
}
