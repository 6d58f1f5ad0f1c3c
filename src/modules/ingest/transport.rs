//! Publisher message channel
//!
//! The session only needs ordered text/binary messages in, JSON notices out,
//! and a way to close. `WsTransport` provides that over a WebSocket;
//! `ChannelTransport` provides it in memory.

use std::future::Future;

use axum::extract::ws::{Message, WebSocket};
use futures_util::SinkExt;
use tokio::sync::mpsc;

use super::error::RelayError;
use super::protocol::Notice;

/// One message from the publisher
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    Binary(Vec<u8>),
}

pub trait Transport: Send {
    /// Next message; `Ok(None)` once the publisher has closed the channel.
    ///
    /// Must be cancel safe: the session races it against timers and process exit.
    fn recv(&mut self) -> impl Future<Output = Result<Option<Inbound>, RelayError>> + Send;

    fn send(&mut self, notice: &Notice) -> impl Future<Output = Result<(), RelayError>> + Send;

    /// Close the channel if it is still open. Errors are not interesting here.
    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// Publisher connection over an upgraded WebSocket
pub struct WsTransport {
    ws: WebSocket,
    /// Set once the socket is gone; a peer Close frame does not count, its
    /// reply still has to be flushed by `close`.
    finished: bool,
}

impl WsTransport {
    pub fn new(ws: WebSocket) -> Self {
        WsTransport {
            ws,
            finished: false,
        }
    }
}

impl Transport for WsTransport {
    async fn recv(&mut self) -> Result<Option<Inbound>, RelayError> {
        loop {
            match self.ws.recv().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(Inbound::Text(text))),
                Some(Ok(Message::Binary(data))) => return Ok(Some(Inbound::Binary(data))),
                Some(Ok(Message::Close(frame))) => {
                    log::debug!("Publisher sent close: {:?}", frame);
                    return Ok(None);
                }
                // Ping/pong are answered by the websocket layer itself.
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    self.finished = true;
                    return Err(e.into());
                }
                None => {
                    self.finished = true;
                    return Ok(None);
                }
            }
        }
    }

    async fn send(&mut self, notice: &Notice) -> Result<(), RelayError> {
        self.ws.send(Message::Text(notice.to_json())).await?;
        Ok(())
    }

    async fn close(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        // Sends our Close frame, or flushes the reply to the publisher's.
        if let Err(e) = SinkExt::close(&mut self.ws).await {
            log::debug!("WebSocket close failed: {}", e);
        }
    }
}

/// In-memory transport; the peer side is a `ChannelPeer`
pub struct ChannelTransport {
    inbound: mpsc::UnboundedReceiver<Inbound>,
    outbound: Option<mpsc::UnboundedSender<Notice>>,
}

/// Publisher end of a `ChannelTransport`
pub struct ChannelPeer {
    inbound: Option<mpsc::UnboundedSender<Inbound>>,
    outbound: mpsc::UnboundedReceiver<Notice>,
}

impl ChannelTransport {
    pub fn pair() -> (ChannelTransport, ChannelPeer) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        (
            ChannelTransport {
                inbound: inbound_rx,
                outbound: Some(outbound_tx),
            },
            ChannelPeer {
                inbound: Some(inbound_tx),
                outbound: outbound_rx,
            },
        )
    }
}

impl Transport for ChannelTransport {
    async fn recv(&mut self) -> Result<Option<Inbound>, RelayError> {
        Ok(self.inbound.recv().await)
    }

    async fn send(&mut self, notice: &Notice) -> Result<(), RelayError> {
        let outbound = self
            .outbound
            .as_ref()
            .ok_or_else(|| RelayError::TransportError("channel closed".to_string()))?;
        outbound
            .send(notice.clone())
            .map_err(|_| RelayError::TransportError("peer went away".to_string()))
    }

    async fn close(&mut self) {
        self.outbound = None;
        self.inbound.close();
    }
}

impl ChannelPeer {
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.push(Inbound::Text(text.into()))
    }

    pub fn send_binary(&self, data: impl Into<Vec<u8>>) -> bool {
        self.push(Inbound::Binary(data.into()))
    }

    fn push(&self, message: Inbound) -> bool {
        self.inbound
            .as_ref()
            .map(|tx| tx.send(message).is_ok())
            .unwrap_or(false)
    }

    /// Close the publisher side, as a client disconnect would.
    pub fn disconnect(&mut self) {
        self.inbound = None;
    }

    /// Next notice; `None` once the session has closed the channel.
    pub async fn next_notice(&mut self) -> Option<Notice> {
        self.outbound.recv().await
    }

    /// Notice already delivered, without waiting.
    pub fn try_notice(&mut self) -> Option<Notice> {
        self.outbound.try_recv().ok()
    }
}
