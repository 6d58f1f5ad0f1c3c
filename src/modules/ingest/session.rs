//! Per-Connection Ingest Session State Machine
//!
//! Drives one publisher connection through:
//! - init: claim the destination key named by the first message
//! - header validation: buffer binary chunks until the container signature shows up
//! - streaming: run the transcoder and forward every chunk to it
//! - teardown: exactly once, on every exit path

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use super::error::RelayError;
use super::protocol::{parse_init, Destination, Notice, INFO_STARTED, INFO_WAITING_FOR_HEADER};
use super::registry::{KeyLease, KeyRegistry};
use super::sniffer::{HeaderBuffer, HeaderSniffer};
use super::transcoder::{TranscodeProcess, TranscodeSettings};
use super::transport::{Inbound, Transport};
use super::watchdog::IdleWatchdog;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Session lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Waiting for the init message
    AwaitingInit,
    /// Key claimed, buffering until the container header arrives
    ValidatingHeader,
    /// Transcoder running, chunks forwarded
    Streaming,
    /// Ended by a failure; torn down the same way as `Closed`
    Errored,
    /// Torn down
    Closed,
}

/// Timing and transcoder parameters shared by every session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub destination_prefix: String,
    pub sniffer: HeaderSniffer,
    pub idle_timeout: Duration,
    pub idle_check_interval: Duration,
    /// Limit for init plus header validation
    pub handshake_timeout: Duration,
    pub transcode: TranscodeSettings,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            destination_prefix: "/live2/".to_string(),
            sniffer: HeaderSniffer::default(),
            idle_timeout: Duration::from_secs(10),
            idle_check_interval: Duration::from_secs(1),
            handshake_timeout: Duration::from_secs(30),
            transcode: TranscodeSettings::default(),
        }
    }
}

/// Resources that only exist while streaming
struct Pipeline {
    process: TranscodeProcess,
    watchdog: IdleWatchdog,
    idle_expired: mpsc::Receiver<Duration>,
}

enum State {
    AwaitingInit,
    ValidatingHeader(HeaderBuffer),
    Streaming(Pipeline),
    Closed,
}

/// How a session ended
#[derive(Debug)]
pub struct SessionReport {
    pub id: u64,
    pub destination_key: Option<String>,
    pub bytes_forwarded: u64,
    /// `Closed` or `Errored`
    pub phase: SessionPhase,
    pub result: Result<(), RelayError>,
}

pub struct IngestSession<T: Transport> {
    id: u64,
    transport: T,
    registry: KeyRegistry,
    config: Arc<SessionConfig>,
    state: State,
    failed: bool,
    destination: Option<Destination>,
    lease: Option<KeyLease>,
    bytes_forwarded: u64,
}

impl<T: Transport> IngestSession<T> {
    pub fn new(transport: T, registry: KeyRegistry, config: Arc<SessionConfig>) -> Self {
        IngestSession {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            transport,
            registry,
            config,
            state: State::AwaitingInit,
            failed: false,
            destination: None,
            lease: None,
            bytes_forwarded: 0,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn phase(&self) -> SessionPhase {
        match &self.state {
            State::AwaitingInit => SessionPhase::AwaitingInit,
            State::ValidatingHeader(_) => SessionPhase::ValidatingHeader,
            State::Streaming(_) => SessionPhase::Streaming,
            State::Closed if self.failed => SessionPhase::Errored,
            State::Closed => SessionPhase::Closed,
        }
    }

    /// Run the session to completion. Teardown has happened when this returns.
    pub async fn run(mut self) -> SessionReport {
        log::info!("[session {}] publisher connected", self.id);

        let result = self.drive().await;
        if let Err(ref e) = result {
            self.failed = true;
            match e {
                RelayError::TransportError(_) => {
                    log::warn!("[session {}] {}", self.id, e)
                }
                _ => log::error!("[session {}] {}", self.id, e),
            }
            if let Some(notice) = e.notice() {
                if let Err(send_err) = self.transport.send(&notice).await {
                    log::debug!("[session {}] error notice not delivered: {}", self.id, send_err);
                }
            }
        }
        self.teardown().await;

        log::info!(
            "[session {}] closed, {} bytes forwarded",
            self.id,
            self.bytes_forwarded
        );
        SessionReport {
            id: self.id,
            destination_key: self.destination.as_ref().map(|d| d.key().to_string()),
            bytes_forwarded: self.bytes_forwarded,
            phase: self.phase(),
            result,
        }
    }

    /// Process messages until the publisher leaves (`Ok`) or something fails.
    async fn drive(&mut self) -> Result<(), RelayError> {
        let handshake_deadline = Instant::now() + self.config.handshake_timeout;

        loop {
            let inbound = match &mut self.state {
                State::AwaitingInit | State::ValidatingHeader(_) => {
                    tokio::select! {
                        message = self.transport.recv() => message?,
                        _ = tokio::time::sleep_until(handshake_deadline) => {
                            return Err(RelayError::IdleTimeout {
                                idle: self.config.handshake_timeout,
                            });
                        }
                    }
                }
                State::Streaming(pipeline) => {
                    let exited = pipeline.process.exited();
                    tokio::select! {
                        biased;
                        Some(idle) = pipeline.idle_expired.recv() => {
                            return Err(RelayError::IdleTimeout { idle });
                        }
                        exit = exited => {
                            if exit.requested {
                                return Ok(());
                            }
                            return Err(RelayError::UnexpectedProcessExit(exit));
                        }
                        message = self.transport.recv() => message?,
                    }
                }
                State::Closed => return Ok(()),
            };

            let Some(inbound) = inbound else {
                log::info!("[session {}] publisher disconnected", self.id);
                return Ok(());
            };
            self.handle(inbound).await?;
        }
    }

    async fn handle(&mut self, inbound: Inbound) -> Result<(), RelayError> {
        let data = match inbound {
            Inbound::Binary(data) => data,
            Inbound::Text(text) if matches!(self.state, State::AwaitingInit) => {
                return self.on_init(text.as_bytes()).await;
            }
            Inbound::Text(text) => {
                log::debug!(
                    "[session {}] ignoring {}-byte text message in {:?}",
                    self.id,
                    text.len(),
                    self.phase()
                );
                return Ok(());
            }
        };

        match &mut self.state {
            State::AwaitingInit => self.on_init(&data).await,
            State::ValidatingHeader(buffer) => {
                buffer.push(data);
                if !buffer.sniff(&self.config.sniffer) {
                    log::debug!(
                        "[session {}] no container header yet, {} bytes held",
                        self.id,
                        buffer.len()
                    );
                    return Ok(());
                }
                let initial = buffer.take();
                self.start_pipeline(initial).await
            }
            State::Streaming(pipeline) => {
                pipeline.watchdog.touch();
                pipeline.process.write(&data).await?;
                self.bytes_forwarded += data.len() as u64;
                Ok(())
            }
            State::Closed => Ok(()),
        }
    }

    async fn on_init(&mut self, payload: &[u8]) -> Result<(), RelayError> {
        let destination = parse_init(payload, &self.config.destination_prefix)?;
        let lease = self.registry.lease(destination.key()).ok_or_else(|| {
            RelayError::DuplicateDestination {
                key: destination.key().to_string(),
            }
        })?;

        log::info!(
            "[session {}] publishing to key {}",
            self.id,
            destination.key()
        );
        self.lease = Some(lease);
        self.destination = Some(destination);
        self.state = State::ValidatingHeader(HeaderBuffer::default());
        self.transport
            .send(&Notice::ack(INFO_WAITING_FOR_HEADER))
            .await
    }

    async fn start_pipeline(&mut self, initial: Vec<u8>) -> Result<(), RelayError> {
        let Some(destination) = self.destination.as_ref() else {
            return Err(RelayError::MissingDestination);
        };
        log::info!(
            "[session {}] container header found, starting transcoder with {} bytes",
            self.id,
            initial.len()
        );

        let process =
            TranscodeProcess::start(&self.config.transcode, destination.url(), &initial).await?;
        let (watchdog, idle_expired) = IdleWatchdog::arm(
            self.config.idle_timeout,
            self.config.idle_check_interval,
            process.stop_handle(),
        );
        self.bytes_forwarded += initial.len() as u64;
        self.state = State::Streaming(Pipeline {
            process,
            watchdog,
            idle_expired,
        });
        self.transport.send(&Notice::ack(INFO_STARTED)).await
    }

    /// Release everything the session holds. Safe to call more than once.
    async fn teardown(&mut self) {
        if let State::Streaming(mut pipeline) = std::mem::replace(&mut self.state, State::Closed) {
            pipeline.watchdog.disarm();
            pipeline.process.stop().await;
        }
        if let Some(lease) = self.lease.take() {
            lease.release();
        }
        self.transport.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::ingest::transport::{ChannelPeer, ChannelTransport};

    fn session(registry: &KeyRegistry) -> (IngestSession<ChannelTransport>, ChannelPeer) {
        let (transport, peer) = ChannelTransport::pair();
        let config = Arc::new(SessionConfig::default());
        (IngestSession::new(transport, registry.clone(), config), peer)
    }

    #[tokio::test]
    async fn test_phase_starts_awaiting_init() {
        let registry = KeyRegistry::new();
        let (session, _peer) = session(&registry);
        assert_eq!(session.phase(), SessionPhase::AwaitingInit);
    }

    #[tokio::test]
    async fn test_session_ids_are_unique() {
        let registry = KeyRegistry::new();
        let (a, _pa) = session(&registry);
        let (b, _pb) = session(&registry);
        assert_ne!(a.id(), b.id());
    }

    #[tokio::test]
    async fn test_init_claims_key_and_acks() {
        let registry = KeyRegistry::new();
        let (mut session, mut peer) = session(&registry);

        session
            .handle(Inbound::Text(
                r#"{"destination":"rtmps://a.rtmps.youtube.com/live2/KEY1"}"#.to_string(),
            ))
            .await
            .unwrap();

        assert_eq!(session.phase(), SessionPhase::ValidatingHeader);
        assert!(registry.is_active("KEY1"));
        assert_eq!(peer.try_notice(), Some(Notice::ack(INFO_WAITING_FOR_HEADER)));

        session.teardown().await;
        assert!(!registry.is_active("KEY1"));
        assert_eq!(session.phase(), SessionPhase::Closed);
    }

    #[tokio::test]
    async fn test_text_ignored_while_validating() {
        let registry = KeyRegistry::new();
        let (mut session, mut peer) = session(&registry);
        session
            .handle(Inbound::Text(r#"{"destination":"rtmp://h/live2/K"}"#.to_string()))
            .await
            .unwrap();
        peer.try_notice();

        session.handle(Inbound::Text("chatter".to_string())).await.unwrap();
        session.handle(Inbound::Binary(vec![0x00, 0x01])).await.unwrap();

        assert_eq!(session.phase(), SessionPhase::ValidatingHeader);
        assert_eq!(peer.try_notice(), None);
        session.teardown().await;
    }

    #[tokio::test]
    async fn test_binary_init_is_parsed() {
        let registry = KeyRegistry::new();
        let (mut session, _peer) = session(&registry);
        session
            .handle(Inbound::Binary(
                br#"{"destination":"rtmp://h/live2/BIN"}"#.to_vec(),
            ))
            .await
            .unwrap();
        assert!(registry.is_active("BIN"));
        session.teardown().await;
    }

    #[tokio::test]
    async fn test_teardown_is_idempotent() {
        let registry = KeyRegistry::new();
        let (mut session, _peer) = session(&registry);
        session
            .handle(Inbound::Text(r#"{"destination":"rtmp://h/live2/K"}"#.to_string()))
            .await
            .unwrap();

        session.teardown().await;
        // Another session takes the key; a second teardown must not free it.
        assert!(registry.try_acquire("K"));
        session.teardown().await;
        assert!(registry.is_active("K"));
    }
}
