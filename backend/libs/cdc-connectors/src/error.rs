//! Error types for CDC connectors

use thiserror::Error;

use crate::connector::ConnectorKind;
use crate::position::CdcPosition;

/// Result type for connector operations
pub type Result<T> = std::result::Result<T, CdcError>;

/// Classification of a [`CdcError`], used by callers to decide between
/// backing off, retrying in place, or dead-lettering a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ConnectionFailed,
    StreamInterrupted,
    DeserializationFailed,
    Configuration,
    PositionStore,
    Position,
}

/// Errors produced by connectors, the envelope mapper and position handling
#[derive(Error, Debug)]
pub enum CdcError {
    /// Source unreachable or authentication rejected
    ///
    /// Always ends the current `stream_changes` call. Back off and call again.
    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    /// Transient fault after the stream was established
    #[error("Stream interrupted: {message}")]
    StreamInterrupted { message: String },

    /// A single record could not be decoded into a change event
    ///
    /// `raw` carries the original record bytes for dead-lettering.
    #[error("Deserialization failed: {message}")]
    DeserializationFailed {
        message: String,
        raw: Option<Vec<u8>>,
        position: Option<CdcPosition>,
    },

    /// Invalid connector configuration
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// Position store lookup or save failed
    #[error("Position store error: {0}")]
    PositionStore(String),

    /// Two positions of different variants were compared
    #[error("Incomparable positions: {0}")]
    IncomparablePositions(String),

    /// Stored position bytes could not be decoded
    #[error("Invalid position encoding: {0}")]
    InvalidPosition(String),
}

impl CdcError {
    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            message: message.into(),
        }
    }

    pub fn stream_interrupted(message: impl Into<String>) -> Self {
        Self::StreamInterrupted {
            message: message.into(),
        }
    }

    pub fn deserialization_failed(
        message: impl Into<String>,
        raw: Option<Vec<u8>>,
        position: Option<CdcPosition>,
    ) -> Self {
        Self::DeserializationFailed {
            message: message.into(),
            raw,
            position,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            CdcError::ConnectionFailed { .. } => ErrorKind::ConnectionFailed,
            CdcError::StreamInterrupted { .. } => ErrorKind::StreamInterrupted,
            CdcError::DeserializationFailed { .. } => ErrorKind::DeserializationFailed,
            CdcError::Configuration(_) => ErrorKind::Configuration,
            CdcError::PositionStore(_) => ErrorKind::PositionStore,
            CdcError::IncomparablePositions(_) | CdcError::InvalidPosition(_) => {
                ErrorKind::Position
            }
        }
    }

    /// Whether this error ends a `stream_changes` call on the given connector
    ///
    /// Kafka recovers from mid-stream transport errors in-loop; a native
    /// change stream cursor has to be reopened instead.
    pub fn is_terminal_for(&self, connector: ConnectorKind) -> bool {
        match self.kind() {
            ErrorKind::ConnectionFailed => true,
            ErrorKind::StreamInterrupted => connector == ConnectorKind::MongoDb,
            ErrorKind::DeserializationFailed => false,
            _ => true,
        }
    }

    /// Raw record bytes attached to a deserialization failure
    pub fn raw_record(&self) -> Option<&[u8]> {
        match self {
            CdcError::DeserializationFailed { raw, .. } => raw.as_deref(),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for CdcError {
    fn from(err: serde_json::Error) -> Self {
        CdcError::deserialization_failed(err.to_string(), None, None)
    }
}
