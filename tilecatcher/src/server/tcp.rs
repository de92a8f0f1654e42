//! Socket transport.
//!
//! Accepts connections on a `SO_REUSEPORT` listener and runs one handler
//! task per connection. A connection carries many requests serially: read
//! a frame, run it through the pipeline, write the framed response. On
//! framing errors the server answers with a failure response and keeps
//! reading; end-of-stream closes the connection.

use crate::codec::{FrameCodec, WireTileRequest, WireTileResponse};
use crate::config::Settings;
use crate::pipeline::{IngestController, IngestError, IngestOutcome};
use crate::tile::{PayloadBuf, TileParams, TileRequest};
use futures::{SinkExt, StreamExt};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tracing::{debug, error, info};

/// Binary socket server for tile capture.
pub struct TcpServer {
    listener: TcpListener,
    controller: Arc<IngestController>,
}

impl TcpServer {
    /// Binds the listener with `SO_REUSEPORT` (and `SO_RCVBUF` when
    /// configured) and prepares the accept loop.
    pub async fn bind(
        addr: &str,
        settings: &Settings,
        controller: Arc<IngestController>,
    ) -> io::Result<Self> {
        let addr: SocketAddr = addr
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;
        if let Some(size) = settings.so_receive_bufsize {
            socket.set_recv_buffer_size(size)?;
        }
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(1024)?;

        let listener = TcpListener::from_std(socket.into())?;
        info!(addr = %listener.local_addr()?, "socket server listening");
        Ok(Self { listener, controller })
    }

    /// The bound address; useful when binding to port 0.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Runs the accept loop forever.
    pub async fn run(self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(%peer, "accepted connection");
                    let controller = Arc::clone(&self.controller);
                    tokio::spawn(handle_connection(stream, controller));
                }
                Err(e) => {
                    error!(error = %e, "accept error");
                }
            }
        }
    }
}

/// Serves one connection until end-of-stream.
async fn handle_connection(stream: TcpStream, controller: Arc<IngestController>) {
    let mut framed = Framed::new(stream, FrameCodec::new());

    while let Some(frame) = framed.next().await {
        let response = match frame {
            Ok(payload) => handle_capture_request(payload, &controller).await,
            Err(e) => {
                error!(error = %e, "read request error encountered");
                let outcome = controller.reject(
                    0,
                    TileParams::from_coords(0, 0, 0, -1),
                    IngestError::from(e),
                );
                outcome_to_wire(&outcome)
            }
        };
        if let Err(e) = framed.send(response.encode()).await {
            error!(error = %e, "error writing the response frame");
            break;
        }
    }
    debug!("connection closed");
}

/// Decodes, verifies and ingests one framed request.
async fn handle_capture_request(
    payload: bytes::Bytes,
    controller: &IngestController,
) -> WireTileResponse {
    let decoded = match WireTileRequest::decode(payload) {
        Ok(decoded) => decoded,
        Err(e) => {
            error!(error = %e, "unmarshalling error");
            let outcome =
                controller.reject(0, TileParams::from_coords(0, 0, 0, -1), IngestError::from(e));
            return outcome_to_wire(&outcome);
        }
    };

    let acq_id = decoded.acq_id;
    let params = TileParams::from_coords(decoded.col, decoded.row, decoded.camera, decoded.frame);

    if let Err(e) = decoded.verify_checksum() {
        error!(acq_id, tile = %params.name, error = %e, "checksum verification failed");
        let outcome = controller.reject(acq_id, params, IngestError::from(e));
        return outcome_to_wire(&outcome);
    }

    debug!(
        acq_id,
        tile = %params.name,
        bytes = decoded.image.len(),
        "end request parsing"
    );

    let request = TileRequest::new(
        acq_id,
        params,
        PayloadBuf::new(decoded.image),
        decoded.checksum,
    );
    let outcome = controller.ingest(request).await;
    outcome_to_wire(&outcome)
}

/// Maps an ingest outcome to the wire response shape.
fn outcome_to_wire(outcome: &IngestOutcome) -> WireTileResponse {
    WireTileResponse {
        acq_id: outcome.acq_id,
        tile_id: outcome.tile_id(),
        status: if outcome.wire_failure() { 1 } else { 0 },
        system_status: outcome.status.system.as_wire(),
        tile_queue_status: outcome.status.tile_queue.as_wire(),
        content_queue_status: outcome.status.content_queue.as_wire(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{QueueStatus, StatusTriple};

    #[test]
    fn test_outcome_to_wire_success() {
        let outcome = IngestOutcome {
            acq_id: 456,
            params: TileParams::from_coords(3, 9, 1, -1),
            tile: None,
            error: None,
            deferred_error: None,
            status: StatusTriple::new(QueueStatus::Yellow, QueueStatus::Green),
        };
        let wire = outcome_to_wire(&outcome);
        assert_eq!(wire.acq_id, 456);
        assert_eq!(wire.status, 0);
        assert_eq!(wire.system_status, 1);
        assert_eq!(wire.tile_queue_status, 1);
        assert_eq!(wire.content_queue_status, 0);
    }

    #[test]
    fn test_outcome_to_wire_deferred_error_flags_failure() {
        let outcome = IngestOutcome {
            acq_id: 1,
            params: TileParams::from_coords(0, 0, 0, -1),
            tile: None,
            error: None,
            deferred_error: Some("content store failure".to_string()),
            status: StatusTriple::new(QueueStatus::Green, QueueStatus::Green).degraded(),
        };
        let wire = outcome_to_wire(&outcome);
        assert_eq!(wire.status, 1);
        assert_eq!(wire.system_status, 2);
    }
}
