//! Wire protocol for the binary socket transport.
//!
//! Every message is a length-prefixed frame:
//!
//! ```text
//! [u32 length, little-endian][payload of that many bytes]
//! ```
//!
//! The payload is a self-describing record of tagged fields, so fields can
//! be added without breaking older senders. Requests carry the tile
//! address, the image bytes and the sender-computed MD5; responses carry
//! the tile identity, a status code and the backpressure triple.
//!
//! [`FrameCodec`] handles the framing layer as a `tokio_util` codec;
//! [`WireTileRequest`] and [`WireTileResponse`] handle payload encoding,
//! decoding and checksum verification.

mod frame;
mod wire;

pub use frame::{FrameCodec, DEFAULT_MAX_FRAME_LEN};
pub use wire::{WireError, WireTileRequest, WireTileResponse};
