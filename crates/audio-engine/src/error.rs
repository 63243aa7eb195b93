//! Error handling for the audio engine
//!
//! Structural failures (connection, empty device lists) propagate as typed
//! results out of `start()`/`create_streams()`. Per-tick transient errors are
//! absorbed inside the mixer callbacks and only ever logged.

use crate::types::{Direction, StreamRole, StreamState};
use thiserror::Error;

/// Result type alias for engine operations
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Errors raised by a single stream
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StreamError {
    /// The backend cannot honor the requested format or device
    #[error("Backend rejected stream: {reason}")]
    BackendRejected { reason: String },

    /// Operation attempted outside the Ready state
    #[error("Stream not ready (state {state:?})")]
    NotReady { state: StreamState },

    /// Per-tick backend hiccup (negative size, null fragment, short write)
    #[error("Transient backend error: {reason}")]
    Transient { reason: String },

    /// The stream object was already released
    #[error("Stream disconnected")]
    Disconnected,
}

impl StreamError {
    /// Create a new backend rejected error
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::BackendRejected {
            reason: reason.into(),
        }
    }

    /// Create a new transient error
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Transient {
            reason: reason.into(),
        }
    }
}

/// Comprehensive error type for engine operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    /// Audio server connection could not be established
    #[error("Failed to connect to audio server: {reason}")]
    ConnectFailed { reason: String },

    /// Format or device unsupported for one stream
    #[error("Backend rejected {role} stream: {reason}")]
    BackendRejected { role: StreamRole, reason: String },

    /// Enumeration returned no device for the direction
    #[error("No {direction} device available")]
    NoDeviceAvailable { direction: Direction },

    /// Negative size report, peek failure and similar hiccups
    #[error("Transient backend error: {reason}")]
    BackendTransientError { reason: String },

    /// Device index outside the current snapshot
    #[error("Invalid {direction} device index {index} ({available} devices available)")]
    InvalidDeviceIndex {
        direction: Direction,
        index: usize,
        available: usize,
    },

    /// Operation requires a running engine
    #[error("Audio engine is not running")]
    NotRunning,

    /// `start()` called on a running engine
    #[error("Audio engine already started")]
    AlreadyStarted,

    /// Invalid configuration value
    #[error("Audio engine configuration error: {message}")]
    Configuration { message: String },

    /// Stream level error
    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),
}

impl EngineError {
    /// Create a new connect failed error
    pub fn connect_failed(reason: impl Into<String>) -> Self {
        Self::ConnectFailed {
            reason: reason.into(),
        }
    }

    /// Create a new transient error
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::BackendTransientError {
            reason: reason.into(),
        }
    }

    /// Create a new configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Check if retrying (now or on the next hot-plug event) can succeed
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::ConnectFailed { .. }
            | Self::NoDeviceAvailable { .. }
            | Self::BackendTransientError { .. }
            | Self::NotRunning
            | Self::AlreadyStarted => true,

            Self::BackendRejected { .. }
            | Self::InvalidDeviceIndex { .. }
            | Self::Configuration { .. } => false,

            Self::Stream(e) => !matches!(e, StreamError::BackendRejected { .. }),
        }
    }

    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::ConnectFailed { .. } | Self::NotRunning | Self::AlreadyStarted => {
                ErrorCategory::Connection
            }
            Self::NoDeviceAvailable { .. } | Self::InvalidDeviceIndex { .. } => ErrorCategory::Device,
            Self::BackendRejected { .. } | Self::Stream(_) => ErrorCategory::Stream,
            Self::BackendTransientError { .. } => ErrorCategory::Transient,
            Self::Configuration { .. } => ErrorCategory::Configuration,
        }
    }
}

/// Broad error categories for reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Audio server connection lifecycle
    Connection,
    /// Device enumeration or selection
    Device,
    /// One stream
    Stream,
    /// Per-tick hiccups
    Transient,
    /// Configuration
    Configuration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = EngineError::NoDeviceAvailable {
            direction: Direction::Capture,
        };
        assert_eq!(err.to_string(), "No capture device available");

        let err = EngineError::BackendRejected {
            role: StreamRole::Ringtone,
            reason: "rate".to_string(),
        };
        assert!(err.to_string().contains("ringtone"));
    }

    #[test]
    fn test_recoverability() {
        assert!(EngineError::connect_failed("refused").is_recoverable());
        assert!(!EngineError::configuration("bad").is_recoverable());
        assert!(!EngineError::from(StreamError::rejected("format")).is_recoverable());
        assert!(EngineError::from(StreamError::transient("peek")).is_recoverable());
    }

    #[test]
    fn test_categories() {
        assert_eq!(
            EngineError::transient("negative size").category(),
            ErrorCategory::Transient
        );
        assert_eq!(
            EngineError::InvalidDeviceIndex {
                direction: Direction::Playback,
                index: 4,
                available: 2
            }
            .category(),
            ErrorCategory::Device
        );
    }
}
