//! Tile filename parsing and formatting.
//!
//! Two grammars are recognized:
//! - `col0005_row0007_cam2.tif` - a stable tile (frame is implicitly -1)
//! - `Dump_cam2_frame000123_col0005_row0007.tif` - a drift frame
//!
//! Parsing and formatting round-trip: `parse_tile_name(&format_tile_name(..))`
//! recovers the original coordinates.

use regex::Regex;
use std::sync::OnceLock;

/// Frame value that marks a stable tile.
pub const STABLE_FRAME: i32 = -1;

/// Parsed tile identity plus its canonical file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileParams {
    /// Column within the acquisition mosaic
    pub col: i32,
    /// Row within the acquisition mosaic
    pub row: i32,
    /// Camera index (0-3 on current microscopes)
    pub camera: i32,
    /// Frame number; [`STABLE_FRAME`] for stable tiles
    pub frame: i32,
    /// Tile file name; reconstructed from the coordinates when absent
    pub name: String,
}

/// Error parsing a tile file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TileNameError {
    /// Name matches neither the stable nor the drift grammar
    InvalidPattern(String),
}

impl std::fmt::Display for TileNameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TileNameError::InvalidPattern(name) => {
                write!(f, "tile file name does not match any recognized pattern: {}", name)
            }
        }
    }
}

impl std::error::Error for TileNameError {}

fn stable_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"col(\d+)_row(\d+)_cam(\d+)\.tif").unwrap())
}

fn drift_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"Dump_cam(\d)_frame(\d+)_col(\d+)_row(\d+)\.tif").unwrap())
}

/// Parse a tile file name (or a URL ending in one) into [`TileParams`].
///
/// Only the last path component is considered, so full URLs and paths are
/// accepted. Coordinates are not bounds-checked here; the metadata store's
/// schema is the authority on valid ranges.
pub fn parse_tile_name(url: &str) -> Result<TileParams, TileNameError> {
    let filename = url.rsplit('/').next().unwrap_or(url);

    if let Some(captures) = stable_pattern().captures(filename) {
        // The captured groups are all-digit by construction; a parse failure
        // can only mean overflow, which no real mosaic reaches.
        let col = captures[1].parse().unwrap_or(0);
        let row = captures[2].parse().unwrap_or(0);
        let camera = captures[3].parse().unwrap_or(0);
        return Ok(TileParams {
            col,
            row,
            camera,
            frame: STABLE_FRAME,
            name: filename.to_string(),
        });
    }

    if let Some(captures) = drift_pattern().captures(filename) {
        let camera = captures[1].parse().unwrap_or(0);
        let frame = captures[2].parse().unwrap_or(0);
        let col = captures[3].parse().unwrap_or(0);
        let row = captures[4].parse().unwrap_or(0);
        return Ok(TileParams {
            col,
            row,
            camera,
            frame,
            name: filename.to_string(),
        });
    }

    Err(TileNameError::InvalidPattern(url.to_string()))
}

/// Format the canonical file name for a tile address.
pub fn format_tile_name(col: i32, row: i32, camera: i32, frame: i32) -> String {
    if frame < 0 {
        format!("col{:04}_row{:04}_cam{}.tif", col, row, camera)
    } else {
        format!("Dump_cam{}_frame{:06}_col{:04}_row{:04}.tif", camera, frame, col, row)
    }
}

impl TileParams {
    /// Creates params from raw coordinates, deriving the canonical name.
    pub fn from_coords(col: i32, row: i32, camera: i32, frame: i32) -> Self {
        Self {
            col,
            row,
            camera,
            frame,
            name: format_tile_name(col, row, camera, frame),
        }
    }

    /// Returns true for stable tiles (`frame == -1`).
    #[inline]
    pub fn is_stable(&self) -> bool {
        self.frame < 0
    }

    /// Fills in the canonical file name if it was not carried on the wire.
    pub fn ensure_name(&mut self) {
        if self.name.is_empty() {
            self.name = format_tile_name(self.col, self.row, self.camera, self.frame);
        }
    }
}

impl std::fmt::Display for TileParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{{col: {}, row: {}, camera: {}, frame: {}, name: {}}}",
            self.col, self.row, self.camera, self.frame, self.name
        )
    }
}
