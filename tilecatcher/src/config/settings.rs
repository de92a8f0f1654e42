//! Typed settings and their defaults.

use std::path::PathBuf;
use std::time::Duration;

/// Default admission wait for both bounded queues.
pub(super) const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(1);

/// All recognized settings.
///
/// | Key | Effect |
/// |---|---|
/// | `TILE_PROCESSING_WORKERS` | Stage-1 worker count (1 runs inline) |
/// | `TILE_PROCESSING_QUEUE_SIZE` | Stage-1 queue capacity |
/// | `CONTENT_STORE_WORKERS` | Stage-2 worker count (1 runs inline) |
/// | `CONTENT_STORE_QUEUE_SIZE` | Stage-2 queue capacity |
/// | `CONTENT_RESULT_BUFFER_SIZE` | Echo buffer capacity; 0 disables |
/// | `WAIT_TIMEOUT` | Admission wait for both queues, e.g. `1s`, `50ms` |
/// | `TMP_DATA_DIR` | Root directory for spill files |
/// | `SO_RECEIVE_BUFSIZE` | Socket receive buffer size in bytes |
/// | `DISABLE_SO_KEEP_ALIVE` | Disable HTTP keep-alive |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub tile_workers: usize,
    pub tile_queue_size: usize,
    pub content_workers: usize,
    pub content_queue_size: usize,
    /// Capacity of the optional stage-2 result echo buffer; 0 disables it
    pub content_result_buffer_size: usize,
    pub wait_timeout: Duration,
    pub tmp_data_dir: PathBuf,
    /// `SO_RCVBUF` for the socket listener, when set
    pub so_receive_bufsize: Option<usize>,
    /// Disables HTTP keep-alive when true
    pub disable_keep_alive: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            tile_workers: 1,
            tile_queue_size: 1,
            content_workers: 1,
            content_queue_size: 1,
            content_result_buffer_size: 0,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            tmp_data_dir: std::env::temp_dir().join("tilecatcher"),
            so_receive_bufsize: None,
            disable_keep_alive: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_run_inline() {
        let settings = Settings::default();
        assert_eq!(settings.tile_workers, 1);
        assert_eq!(settings.tile_queue_size, 1);
        assert_eq!(settings.content_workers, 1);
        assert_eq!(settings.content_queue_size, 1);
        assert_eq!(settings.content_result_buffer_size, 0);
        assert_eq!(settings.wait_timeout, Duration::from_secs(1));
        assert!(!settings.disable_keep_alive);
        assert!(settings.so_receive_bufsize.is_none());
    }
}
