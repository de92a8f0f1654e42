//! The `send` command: frame one tile and send it over the socket.
//!
//! Doubles as a smoke test for a running service: it reads a TIFF whose
//! name follows one of the tile grammars, computes the MD5, sends the
//! framed request and prints the decoded response with the backpressure
//! triple.

use crate::error::CliError;
use futures::{SinkExt, StreamExt};
use md5::{Digest, Md5};
use std::path::Path;
use tilecatcher::codec::{FrameCodec, WireTileRequest, WireTileResponse};
use tilecatcher::pipeline::QueueStatus;
use tilecatcher::tile::parse_tile_name;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

pub async fn run(addr: &str, acq_id: u64, file: &Path) -> Result<(), CliError> {
    let name = file
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| CliError::InvalidArgument(format!("not a file path: {}", file.display())))?;
    let params = parse_tile_name(name).map_err(|e| CliError::InvalidArgument(e.to_string()))?;

    let content = tokio::fs::read(file).await?;
    let checksum = Md5::digest(&content).to_vec();

    let stream = TcpStream::connect(addr).await?;
    let mut framed = Framed::new(stream, FrameCodec::new());

    let request = WireTileRequest {
        acq_id,
        camera: params.camera,
        frame: params.frame,
        col: params.col,
        row: params.row,
        image: content.into(),
        checksum,
    };
    framed.send(request.encode()).await?;

    let frame = framed
        .next()
        .await
        .ok_or_else(|| CliError::InvalidArgument("connection closed before a response".into()))??;
    let response = WireTileResponse::decode(frame)?;

    println!(
        "acq {} tile {} status {} system {} tile-queue {} content-queue {}",
        response.acq_id,
        response.tile_id,
        if response.status == 0 { "OK" } else { "FAILED" },
        QueueStatus::from_wire(response.system_status),
        QueueStatus::from_wire(response.tile_queue_status),
        QueueStatus::from_wire(response.content_queue_status),
    );
    Ok(())
}
