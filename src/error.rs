// 错误类型
// Crate-wide error type for configuration, bus and persistence failures

use crate::drivers::can::CanError;
use std::io;
use thiserror::Error;

/// Errors surfaced by the library outside of the periodic tick functions
#[derive(Debug, Error)]
pub enum BmsError {
    /// Configuration file rejected by validation
    #[error("Configuration error: {0}")]
    Config(String),
    /// Bus driver failure
    #[error("Bus error: {0}")]
    Bus(#[from] CanError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, BmsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bus_errors_keep_their_message() {
        let err: BmsError = CanError::ConnectionFailed("can9: No such device".to_string()).into();
        assert_eq!(err.to_string(), "Bus error: Connection failed: can9: No such device");
    }
}
