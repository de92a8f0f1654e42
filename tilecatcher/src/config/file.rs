//! INI loading for [`Settings`].
//!
//! Keys live in the top-level (sectionless) part of the file:
//!
//! ```ini
//! TILE_PROCESSING_WORKERS = 4
//! TILE_PROCESSING_QUEUE_SIZE = 32
//! CONTENT_STORE_WORKERS = 8
//! CONTENT_STORE_QUEUE_SIZE = 64
//! WAIT_TIMEOUT = 1s
//! TMP_DATA_DIR = /var/tmp/tilecatcher
//! ```

use super::settings::Settings;
use ini::Ini;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("error reading config file: {0}")]
    Read(#[from] ini::Error),

    #[error("invalid value for {key}: {value} ({reason})")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
}

/// Parses durations of the form `250ms`, `1s` or `2m`.
///
/// A bare number reads as seconds.
pub fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Some(ms) = value.strip_suffix("ms") {
        return ms.trim().parse::<u64>().ok().map(Duration::from_millis);
    }
    if let Some(s) = value.strip_suffix('s') {
        return s.trim().parse::<u64>().ok().map(Duration::from_secs);
    }
    if let Some(m) = value.strip_suffix('m') {
        return m.trim().parse::<u64>().ok().map(|m| Duration::from_secs(m * 60));
    }
    value.parse::<u64>().ok().map(Duration::from_secs)
}

fn invalid(key: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn positive(key: &str, value: &str) -> Result<usize, ConfigError> {
    let parsed: usize = value
        .trim()
        .parse()
        .map_err(|_| invalid(key, value, "not an unsigned integer"))?;
    if parsed == 0 {
        return Err(invalid(key, value, "must be at least 1"));
    }
    Ok(parsed)
}

impl Settings {
    /// Loads settings from an INI file, overlaying the defaults.
    pub fn from_ini_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let ini = Ini::load_from_file(path.as_ref())?;
        Self::from_ini(&ini)
    }

    /// Parses settings out of an already-loaded INI document.
    pub fn from_ini(ini: &Ini) -> Result<Self, ConfigError> {
        let mut settings = Settings::default();
        let section = ini.general_section();

        if let Some(v) = section.get("TILE_PROCESSING_WORKERS") {
            settings.tile_workers = positive("TILE_PROCESSING_WORKERS", v)?;
        }
        if let Some(v) = section.get("TILE_PROCESSING_QUEUE_SIZE") {
            settings.tile_queue_size = positive("TILE_PROCESSING_QUEUE_SIZE", v)?;
        }
        if let Some(v) = section.get("CONTENT_STORE_WORKERS") {
            settings.content_workers = positive("CONTENT_STORE_WORKERS", v)?;
        }
        if let Some(v) = section.get("CONTENT_STORE_QUEUE_SIZE") {
            settings.content_queue_size = positive("CONTENT_STORE_QUEUE_SIZE", v)?;
        }
        if let Some(v) = section.get("CONTENT_RESULT_BUFFER_SIZE") {
            settings.content_result_buffer_size = v
                .trim()
                .parse()
                .map_err(|_| invalid("CONTENT_RESULT_BUFFER_SIZE", v, "not an unsigned integer"))?;
        }
        if let Some(v) = section.get("WAIT_TIMEOUT") {
            settings.wait_timeout = parse_duration(v)
                .ok_or_else(|| invalid("WAIT_TIMEOUT", v, "expected e.g. 1s, 250ms or 2m"))?;
        }
        if let Some(v) = section.get("TMP_DATA_DIR") {
            settings.tmp_data_dir = PathBuf::from(v.trim());
        }
        if let Some(v) = section.get("SO_RECEIVE_BUFSIZE") {
            let size: usize = v
                .trim()
                .parse()
                .map_err(|_| invalid("SO_RECEIVE_BUFSIZE", v, "not an unsigned integer"))?;
            settings.so_receive_bufsize = Some(size);
        }
        if let Some(v) = section.get("DISABLE_SO_KEEP_ALIVE") {
            settings.disable_keep_alive = v
                .trim()
                .parse()
                .map_err(|_| invalid("DISABLE_SO_KEEP_ALIVE", v, "expected true or false"))?;
        }

        Ok(settings)
    }
}
