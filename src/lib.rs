//! WebSocket ingest relay: publishers stream WebM over a WebSocket, the relay
//! checks the container header and feeds the stream to a transcoder that
//! republishes it to an RTMP(S) destination.

pub mod modules;
pub mod settings;

pub use modules::ingest::{IngestSession, KeyRegistry, RelayError, SessionConfig};
pub use modules::server::{RelayServer, ServerError};
pub use settings::{RelaySettings, SettingsError};
