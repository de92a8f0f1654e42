//! Length-prefixed framing over the raw socket.
//!
//! `[u32 length, little-endian][payload]`. The decoder waits for a complete
//! frame before yielding, reserving buffer space up front so a 20 MB tile
//! does not trigger repeated reallocation mid-read.
//!
//! An over-limit length prefix is reported once and then skipped: the
//! decoder consumes the prefix and drains the declared payload as it
//! arrives, so the stream realigns on the next frame and a connection can
//! outlive a bad frame.

use crate::codec::WireError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Upper bound on a single frame.
///
/// Tiles top out around 20 MB; anything past this is a corrupt or hostile
/// length prefix, not a tile.
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Framing codec for the socket transport.
///
/// Decodes inbound frames to their raw payload [`Bytes`] and prefixes
/// outbound payloads with their length. Oversized frames error once, get
/// skipped in full, and leave the codec aligned on the next frame.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_len: usize,
    /// Bytes of an oversized frame still owed to the skip
    discard: usize,
}

impl FrameCodec {
    /// Creates a codec with the default frame limit.
    pub fn new() -> Self {
        Self {
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            discard: 0,
        }
    }

    /// Creates a codec with a custom frame limit (tests use small ones).
    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self {
            max_frame_len,
            discard: 0,
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, WireError> {
        // Finish draining a previously rejected oversized frame so the
        // stream realigns on the next length prefix.
        if self.discard > 0 {
            let drained = self.discard.min(src.len());
            src.advance(drained);
            self.discard -= drained;
            if self.discard > 0 {
                return Ok(None);
            }
        }

        if src.len() < 4 {
            return Ok(None);
        }

        let len = u32::from_le_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len > self.max_frame_len {
            // Consume the prefix and whatever payload is already buffered;
            // the remainder is skipped as it arrives. Returning without
            // advancing would re-parse these same bytes forever.
            src.advance(4);
            let drained = len.min(src.len());
            src.advance(drained);
            self.discard = len - drained;
            return Err(WireError::FrameTooLarge {
                len,
                max: self.max_frame_len,
            });
        }

        if src.len() < 4 + len {
            // reserve the rest of the frame in one step
            src.reserve(4 + len - src.len());
            return Ok(None);
        }

        src.advance(4);
        Ok(Some(src.split_to(len).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = WireError;

    fn encode(&mut self, payload: Bytes, dst: &mut BytesMut) -> Result<(), WireError> {
        dst.reserve(4 + payload.len());
        dst.put_u32_le(payload.len() as u32);
        dst.put_slice(&payload);
        Ok(())
    }
}
