//! Payload encoding for capture-image requests and responses.
//!
//! Each payload is a sequence of tagged fields:
//!
//! ```text
//! [u8 tag][u32 length, little-endian][value bytes]
//! ```
//!
//! Scalars are little-endian with their natural width; vectors are raw
//! bytes. Decoders skip unknown tags, which keeps the format forward
//! compatible: a newer sender can add fields without breaking this reader.
//!
//! Requests are verified against their carried MD5 with
//! [`WireTileRequest::verify_checksum`]; verification is separate from
//! structural decoding so that transports can still answer with the parsed
//! acquisition id when the checksum disagrees.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use md5::{Digest, Md5};
use thiserror::Error;

// Request field tags.
const TAG_ACQ_ID: u8 = 1;
const TAG_CAMERA: u8 = 2;
const TAG_FRAME: u8 = 3;
const TAG_COL: u8 = 4;
const TAG_ROW: u8 = 5;
const TAG_IMAGE: u8 = 6;
const TAG_CHECKSUM: u8 = 7;

// Response field tags.
const TAG_TILE_ID: u8 = 2;
const TAG_STATUS: u8 = 3;
const TAG_SYSTEM_STATUS: u8 = 4;
const TAG_TILE_QUEUE_STATUS: u8 = 5;
const TAG_CONTENT_QUEUE_STATUS: u8 = 6;

/// Errors from the wire codec.
#[derive(Debug, Error)]
pub enum WireError {
    /// Payload ended before a field's declared length
    #[error("truncated payload: field {tag} declares {declared} bytes but {remaining} remain")]
    Truncated {
        tag: u8,
        declared: usize,
        remaining: usize,
    },

    /// A scalar field carried an unexpected width
    #[error("field {tag} has width {got}, expected {expected}")]
    BadFieldWidth { tag: u8, expected: usize, got: usize },

    /// Frame exceeds the configured maximum
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    /// Carried MD5 does not match the received image bytes
    #[error("the received checksum {carried} and the calculated checksum {computed} do not match")]
    ChecksumMismatch { carried: String, computed: String },

    /// Underlying socket error surfaced through the framed transport
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// A decoded capture-image request payload.
#[derive(Debug, Clone, Default)]
pub struct WireTileRequest {
    pub acq_id: u64,
    pub camera: i32,
    pub frame: i32,
    pub col: i32,
    pub row: i32,
    pub image: Bytes,
    pub checksum: Vec<u8>,
}

/// A decoded capture-image response payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WireTileResponse {
    pub acq_id: u64,
    pub tile_id: i64,
    /// 0 on success, non-zero on failure
    pub status: i16,
    pub system_status: i16,
    pub tile_queue_status: i16,
    pub content_queue_status: i16,
}

fn put_field(buf: &mut BytesMut, tag: u8, value: &[u8]) {
    buf.put_u8(tag);
    buf.put_u32_le(value.len() as u32);
    buf.put_slice(value);
}

fn next_field(buf: &mut Bytes) -> Result<Option<(u8, Bytes)>, WireError> {
    if buf.is_empty() {
        return Ok(None);
    }
    if buf.len() < 5 {
        return Err(WireError::Truncated {
            tag: buf[0],
            declared: 5,
            remaining: buf.len(),
        });
    }
    let tag = buf.get_u8();
    let len = buf.get_u32_le() as usize;
    if buf.len() < len {
        return Err(WireError::Truncated {
            tag,
            declared: len,
            remaining: buf.len(),
        });
    }
    Ok(Some((tag, buf.split_to(len))))
}

fn scalar<const N: usize>(tag: u8, value: &Bytes) -> Result<[u8; N], WireError> {
    let bytes: &[u8] = value;
    bytes.try_into().map_err(|_| WireError::BadFieldWidth {
        tag,
        expected: N,
        got: value.len(),
    })
}

impl WireTileRequest {
    /// Serializes the request into a payload buffer (no length prefix).
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.image.len() + self.checksum.len() + 64);
        put_field(&mut buf, TAG_ACQ_ID, &self.acq_id.to_le_bytes());
        put_field(&mut buf, TAG_CAMERA, &self.camera.to_le_bytes());
        put_field(&mut buf, TAG_FRAME, &self.frame.to_le_bytes());
        put_field(&mut buf, TAG_COL, &self.col.to_le_bytes());
        put_field(&mut buf, TAG_ROW, &self.row.to_le_bytes());
        put_field(&mut buf, TAG_IMAGE, &self.image);
        put_field(&mut buf, TAG_CHECKSUM, &self.checksum);
        buf.freeze()
    }

    /// Decodes a payload buffer into a request.
    ///
    /// Structural only: the checksum is carried through untouched so the
    /// caller can answer a mismatch with the parsed identity. Call
    /// [`verify_checksum`](Self::verify_checksum) afterwards.
    pub fn decode(mut payload: Bytes) -> Result<Self, WireError> {
        let mut req = WireTileRequest::default();
        while let Some((tag, value)) = next_field(&mut payload)? {
            match tag {
                TAG_ACQ_ID => req.acq_id = u64::from_le_bytes(scalar(tag, &value)?),
                TAG_CAMERA => req.camera = i32::from_le_bytes(scalar(tag, &value)?),
                TAG_FRAME => req.frame = i32::from_le_bytes(scalar(tag, &value)?),
                TAG_COL => req.col = i32::from_le_bytes(scalar(tag, &value)?),
                TAG_ROW => req.row = i32::from_le_bytes(scalar(tag, &value)?),
                TAG_IMAGE => req.image = value,
                TAG_CHECKSUM => req.checksum = value.to_vec(),
                _ => {} // unknown field from a newer sender
            }
        }
        Ok(req)
    }

    /// Checks the carried MD5 against the received image bytes.
    pub fn verify_checksum(&self) -> Result<(), WireError> {
        let computed = Md5::digest(&self.image);
        if computed.as_slice() != self.checksum.as_slice() {
            return Err(WireError::ChecksumMismatch {
                carried: hex::encode(&self.checksum),
                computed: hex::encode(computed),
            });
        }
        Ok(())
    }
}

impl WireTileResponse {
    /// Serializes the response into a payload buffer (no length prefix).
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(80);
        put_field(&mut buf, TAG_ACQ_ID, &self.acq_id.to_le_bytes());
        put_field(&mut buf, TAG_TILE_ID, &self.tile_id.to_le_bytes());
        put_field(&mut buf, TAG_STATUS, &self.status.to_le_bytes());
        put_field(&mut buf, TAG_SYSTEM_STATUS, &self.system_status.to_le_bytes());
        put_field(&mut buf, TAG_TILE_QUEUE_STATUS, &self.tile_queue_status.to_le_bytes());
        put_field(
            &mut buf,
            TAG_CONTENT_QUEUE_STATUS,
            &self.content_queue_status.to_le_bytes(),
        );
        buf.freeze()
    }

    /// Decodes a payload buffer into a response.
    pub fn decode(mut payload: Bytes) -> Result<Self, WireError> {
        let mut resp = WireTileResponse::default();
        while let Some((tag, value)) = next_field(&mut payload)? {
            match tag {
                TAG_ACQ_ID => resp.acq_id = u64::from_le_bytes(scalar(tag, &value)?),
                TAG_TILE_ID => resp.tile_id = i64::from_le_bytes(scalar(tag, &value)?),
                TAG_STATUS => resp.status = i16::from_le_bytes(scalar(tag, &value)?),
                TAG_SYSTEM_STATUS => resp.system_status = i16::from_le_bytes(scalar(tag, &value)?),
                TAG_TILE_QUEUE_STATUS => {
                    resp.tile_queue_status = i16::from_le_bytes(scalar(tag, &value)?)
                }
                TAG_CONTENT_QUEUE_STATUS => {
                    resp.content_queue_status = i16::from_le_bytes(scalar(tag, &value)?)
                }
                _ => {}
            }
        }
        Ok(resp)
    }
}
