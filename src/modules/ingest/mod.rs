//! Live Ingest Relay
//!
//! Accepts one media stream per publisher connection, validates its container
//! header and pipes it into an external transcoder that republishes it to the
//! publisher's chosen destination.
//!
//! ## Architecture
//!
//! - `registry.rs` - process-wide set of destination keys in use
//! - `sniffer.rs` - container signature check and pre-validation buffer
//! - `transcoder.rs` - transcoder subprocess lifecycle
//! - `watchdog.rs` - publisher stall detection
//! - `session.rs` - per-connection state machine
//! - `transport.rs` - message channel the session talks through
//! - `protocol.rs` - init message and notices

pub mod error;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod sniffer;
pub mod transcoder;
pub mod transport;
pub mod watchdog;

pub use error::RelayError;
pub use registry::{KeyLease, KeyRegistry};
pub use session::{IngestSession, SessionConfig, SessionPhase, SessionReport};
pub use transport::{ChannelPeer, ChannelTransport, Inbound, Transport, WsTransport};
