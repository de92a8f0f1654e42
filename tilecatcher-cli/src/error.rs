//! CLI error handling.

use thiserror::Error;

/// Errors surfaced to the terminal with a user-facing message.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] tilecatcher::config::ConfigError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] tilecatcher::codec::WireError),

    #[error("{0}")]
    InvalidArgument(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: CliError = io.into();
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn test_invalid_argument_displays_plain() {
        let err = CliError::InvalidArgument("bad tile name".to_string());
        assert_eq!(err.to_string(), "bad tile name");
    }
}
