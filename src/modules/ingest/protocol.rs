//! Publisher-facing message formats
//!
//! The first message on an ingest connection is a JSON init record naming the
//! destination. Every state change the publisher needs to know about is
//! answered with a JSON notice on the same channel.

use serde::Serialize;
use url::Url;

use super::error::RelayError;

/// Acknowledgment or error notice sent back to the publisher
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Notice {
    Ack {
        ok: bool,
        info: String,
    },
    Error {
        error: String,
        code: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
}

impl Notice {
    pub fn ack(info: impl Into<String>) -> Self {
        Notice::Ack {
            ok: true,
            info: info.into(),
        }
    }

    pub fn error(error: impl Into<String>, code: impl Into<String>, detail: Option<String>) -> Self {
        Notice::Error {
            error: error.into(),
            code: code.into(),
            detail,
        }
    }

    /// Encode as the JSON text frame sent to the publisher
    pub fn to_json(&self) -> String {
        // Serializing plain strings and bools cannot fail.
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }
}

/// Ack sent once the destination key has been claimed
pub const INFO_WAITING_FOR_HEADER: &str = "waiting for header";
/// Ack sent once the transcoder has been started
pub const INFO_STARTED: &str = "started";

/// Outbound publish target taken from the init message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    url: String,
    key: String,
}

impl Destination {
    /// Parse `raw` and extract the key that follows `prefix` in its path.
    ///
    /// The key must be the final, non-empty path segment directly after the
    /// prefix: `rtmps://host/live2/KEY` with prefix `/live2/` yields `KEY`.
    pub fn parse(raw: &str, prefix: &str) -> Result<Self, RelayError> {
        let url = Url::parse(raw).map_err(|e| RelayError::InvalidDestination {
            reason: e.to_string(),
        })?;
        if url.host_str().is_none() {
            return Err(RelayError::InvalidDestination {
                reason: "destination has no host".to_string(),
            });
        }

        let key = url
            .path()
            .strip_prefix(prefix)
            .ok_or_else(|| RelayError::InvalidDestination {
                reason: format!("path does not start with {}", prefix),
            })?;
        if key.is_empty() || key.contains('/') {
            return Err(RelayError::InvalidDestination {
                reason: "no key after destination prefix".to_string(),
            });
        }

        Ok(Destination {
            url: raw.to_string(),
            key: key.to_string(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

/// Decode the init record `{ "destination": "<url>" }` and resolve its destination.
pub fn parse_init(payload: &[u8], prefix: &str) -> Result<Destination, RelayError> {
    let value: serde_json::Value = serde_json::from_slice(payload)
        .map_err(|e| RelayError::MalformedInit(e.to_string()))?;
    let record = value
        .as_object()
        .ok_or_else(|| RelayError::MalformedInit("init message is not an object".to_string()))?;

    let destination = record
        .get("destination")
        .and_then(serde_json::Value::as_str)
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .ok_or(RelayError::MissingDestination)?;

    Destination::parse(destination, prefix)
}
