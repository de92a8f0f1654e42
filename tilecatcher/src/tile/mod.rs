//! Tile identity and request models.
//!
//! A tile is addressed by `(col, row, camera, frame)` within an acquisition.
//! `frame == -1` marks a stable tile (the canonical image for a grid cell);
//! `frame >= 0` marks a drift frame captured while focus and position are
//! still settling. The tile file name encodes the full address and is part
//! of the wire contract on both transports.

mod params;
mod request;

pub use params::{format_tile_name, parse_tile_name, TileNameError, TileParams, STABLE_FRAME};
pub use request::{PayloadBuf, TileRequest};
