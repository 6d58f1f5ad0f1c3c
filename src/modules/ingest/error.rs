//! Error types for the ingest relay.

use std::time::Duration;
use thiserror::Error;

use super::protocol::Notice;
use super::transcoder::ProcessExit;

/// Session-local failures. Every variant ends the session; none is retried.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Malformed init message: {0}")]
    MalformedInit(String),

    #[error("Init message carries no destination")]
    MissingDestination,

    #[error("Invalid destination: {reason}")]
    InvalidDestination { reason: String },

    #[error("Destination key {key} is already being published")]
    DuplicateDestination { key: String },

    #[error("Failed to spawn transcoder {program}: {reason}")]
    SpawnFailed { program: String, reason: String },

    #[error("Failed to write to transcoder input: {0}")]
    WriteFailed(String),

    #[error("Transcoder exited unexpectedly: {0}")]
    UnexpectedProcessExit(ProcessExit),

    #[error("No stream data for {idle:?}")]
    IdleTimeout { idle: Duration },

    #[error("Transport error: {0}")]
    TransportError(String),
}

impl RelayError {
    /// Stable machine-readable name, sent as `code` in error notices.
    pub fn code(&self) -> &'static str {
        match self {
            RelayError::MalformedInit(_) => "malformed_init",
            RelayError::MissingDestination => "missing_destination",
            RelayError::InvalidDestination { .. } => "invalid_destination",
            RelayError::DuplicateDestination { .. } => "duplicate_destination",
            RelayError::SpawnFailed { .. } => "spawn_failed",
            RelayError::WriteFailed(_) => "write_failed",
            RelayError::UnexpectedProcessExit(_) => "unexpected_process_exit",
            RelayError::IdleTimeout { .. } => "idle_timeout",
            RelayError::TransportError(_) => "transport_error",
        }
    }

    /// Notice to send the publisher before closing, if the channel is still usable.
    pub fn notice(&self) -> Option<Notice> {
        let summary = match self {
            RelayError::MalformedInit(_) => "malformed init message",
            RelayError::MissingDestination => "missing destination",
            RelayError::InvalidDestination { .. } => "invalid destination",
            RelayError::DuplicateDestination { .. } => "destination already in use",
            RelayError::SpawnFailed { .. } => "transcoder failed to start",
            RelayError::WriteFailed(_) => "transcoder input closed",
            RelayError::UnexpectedProcessExit(_) => "transcoder exited",
            RelayError::IdleTimeout { .. } => "idle timeout",
            RelayError::TransportError(_) => return None,
        };
        let detail = match self {
            // The key is the publisher's own secret; echoing it back adds nothing.
            RelayError::DuplicateDestination { .. } | RelayError::MissingDestination => None,
            other => Some(other.to_string()),
        };
        Some(Notice::error(summary, self.code(), detail))
    }
}

impl From<axum::Error> for RelayError {
    fn from(e: axum::Error) -> Self {
        RelayError::TransportError(e.to_string())
    }
}
