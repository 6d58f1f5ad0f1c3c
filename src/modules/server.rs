//! TCP Listener and Connection Handling
//!
//! Accepts connections (optionally over TLS) and serves each one with the
//! relay's axum router:
//! - the ingest path is upgraded to a WebSocket and handed to an `IngestSession`
//! - `/api/videos` returns a page of the video catalog
//! - anything else is served from the static asset directory

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{RawQuery, State};
use axum::response::Response;
use axum::routing::get;
use axum::{Extension, Json, Router};
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio_native_tls::TlsAcceptor;
use tower_http::services::ServeDir;

use super::catalog::{CatalogPage, PageRequest, VideoCatalog};
use super::ingest::{IngestSession, KeyRegistry, SessionConfig, WsTransport};
use crate::settings::RelaySettings;

pub const VIDEOS_PATH: &str = "/api/videos";

/// How long in-flight connections and sessions get to wind down after shutdown
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind port: {0}")]
    Bind(std::io::Error),

    #[error("Failed to accept connection: {0}")]
    Accept(std::io::Error),

    #[error("Failed to load TLS identity: {0}")]
    Tls(String),
}

trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// State shared by every request handler
#[derive(Clone)]
struct AppState {
    registry: KeyRegistry,
    session_config: Arc<SessionConfig>,
    catalog: VideoCatalog,
    /// Held by every connection and session; all clones gone means drained
    _drain: mpsc::Sender<()>,
}

pub struct RelayServer {
    port: u16,
    ingest_path: String,
    static_dir: PathBuf,
    registry: KeyRegistry,
    session_config: Arc<SessionConfig>,
    catalog: VideoCatalog,
    tls: Option<TlsAcceptor>,
}

impl RelayServer {
    pub fn new(settings: &RelaySettings) -> Result<Self, ServerError> {
        let tls = match (&settings.tls_cert_path, &settings.tls_key_path) {
            (Some(cert), Some(key)) => Some(TlsAcceptor::from(load_tls_config(cert, key)?)),
            _ => None,
        };
        Ok(RelayServer {
            port: settings.port,
            ingest_path: settings.ingest_path.clone(),
            static_dir: settings.static_dir.clone(),
            registry: KeyRegistry::new(),
            session_config: Arc::new(settings.session.clone()),
            catalog: VideoCatalog::new(settings.video_cache_path.clone()),
            tls,
        })
    }

    /// The registry shared by every session this server spawns
    pub fn registry(&self) -> &KeyRegistry {
        &self.registry
    }

    /// Run the server until a shutdown signal arrives
    pub async fn run_with_shutdown(
        self,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), ServerError> {
        let addr = format!("0.0.0.0:{}", self.port);
        let listener = TcpListener::bind(&addr).await.map_err(ServerError::Bind)?;
        log::info!(
            "Ingest relay listening on {} ({})",
            addr,
            if self.tls.is_some() { "wss/https" } else { "ws/http" }
        );
        log::info!("Publisher endpoint: {}", self.ingest_path);

        self.serve(listener, async move {
            let _ = shutdown.recv().await;
        })
        .await
    }

    fn router(&self, drain: mpsc::Sender<()>) -> Router {
        let state = AppState {
            registry: self.registry.clone(),
            session_config: self.session_config.clone(),
            catalog: self.catalog.clone(),
            _drain: drain,
        };
        Router::new()
            .route(&self.ingest_path, get(ingest))
            .route(VIDEOS_PATH, get(list_videos))
            .fallback_service(ServeDir::new(&self.static_dir))
            .with_state(state)
    }

    /// Accept connections on `listener` until `shutdown` completes, then give
    /// in-flight connections and sessions a short window to finish.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<(), ServerError>
    where
        F: std::future::Future<Output = ()>,
    {
        let (drain_tx, mut drain_rx) = mpsc::channel::<()>(1);
        let app = self.router(drain_tx);
        tokio::pin!(shutdown);
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            log::debug!("Accepted connection from {}", addr);
                            let tls = self.tls.clone();
                            let app = app.clone().layer(Extension(addr));
                            connections.spawn(async move {
                                let stream: Box<dyn AsyncStream> = match tls {
                                    Some(acceptor) => match acceptor.accept(socket).await {
                                        Ok(tls_stream) => Box::new(tls_stream),
                                        Err(e) => {
                                            log::warn!("TLS handshake with {} failed: {}", addr, e);
                                            return;
                                        }
                                    },
                                    None => Box::new(socket),
                                };
                                serve_connection(stream, app, addr).await;
                            });
                        }
                        Err(e) => {
                            log::error!("{}", ServerError::Accept(e));
                        }
                    }
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = &mut shutdown => {
                    log::info!("Shutdown signal received, no longer accepting connections");
                    break;
                }
            }
        }

        drop(listener);
        drop(app);
        // recv yields None once every connection and session has let go of its sender
        if tokio::time::timeout(SHUTDOWN_DRAIN, drain_rx.recv()).await.is_err() {
            log::warn!(
                "Aborting {} connection(s) still open after shutdown",
                connections.len()
            );
        }
        connections.shutdown().await;
        Ok(())
    }
}

async fn serve_connection(stream: Box<dyn AsyncStream>, app: Router, addr: SocketAddr) {
    let service = TowerToHyperService::new(app);
    if let Err(e) = hyper::server::conn::http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades()
        .await
    {
        log::debug!("Connection from {} ended with error: {}", addr, e);
    }
}

async fn ingest(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Extension(addr): Extension<SocketAddr>,
) -> Response {
    ws.on_upgrade(move |socket| run_session(socket, state, addr))
}

async fn run_session(socket: WebSocket, state: AppState, addr: SocketAddr) {
    let session = IngestSession::new(
        WsTransport::new(socket),
        state.registry.clone(),
        state.session_config.clone(),
    );
    log::info!("[session {}] publisher {}", session.id(), addr);

    let report = session.run().await;
    match &report.result {
        Ok(()) => log::info!(
            "[session {}] finished cleanly ({} bytes)",
            report.id,
            report.bytes_forwarded
        ),
        Err(e) => log::info!("[session {}] finished with {}", report.id, e.code()),
    }
}

async fn list_videos(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
) -> Json<CatalogPage> {
    Json(state.catalog.page(PageRequest::from_query(query.as_deref())).await)
}

fn load_tls_config(cert_path: &str, key_path: &str) -> Result<native_tls::TlsAcceptor, ServerError> {
    let cert = std::fs::read(cert_path)
        .map_err(|e| ServerError::Tls(format!("{}: {}", cert_path, e)))?;
    let key = std::fs::read(key_path)
        .map_err(|e| ServerError::Tls(format!("{}: {}", key_path, e)))?;

    let identity = native_tls::Identity::from_pkcs8(&cert, &key)
        .map_err(|e| ServerError::Tls(e.to_string()))?;
    native_tls::TlsAcceptor::new(identity).map_err(|e| ServerError::Tls(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use std::collections::HashMap;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio_tungstenite::tungstenite::Message;

    struct TestServer {
        addr: SocketAddr,
        registry: KeyRegistry,
        shutdown: broadcast::Sender<()>,
        handle: tokio::task::JoinHandle<Result<(), ServerError>>,
        _dir: tempfile::TempDir,
    }

    async fn start_server() -> TestServer {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), b"<html>gallery</html>").unwrap();
        std::fs::write(
            dir.path().join("cache.json"),
            br#"{"ids":["a","b"],"videos":[{"id":"a"},{"id":"b","title":"B"}]}"#,
        )
        .unwrap();

        let vars: HashMap<&str, String> = HashMap::from([
            ("STATIC_DIR", dir.path().display().to_string()),
            ("VIDEO_CACHE_PATH", dir.path().join("cache.json").display().to_string()),
        ]);
        let settings = RelaySettings::from_lookup(|name| vars.get(name).cloned()).unwrap();

        let server = RelayServer::new(&settings).unwrap();
        let registry = server.registry().clone();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown, mut rx) = broadcast::channel(1);
        let handle = tokio::spawn(server.serve(listener, async move {
            let _ = rx.recv().await;
        }));

        TestServer {
            addr,
            registry,
            shutdown,
            handle,
            _dir: dir,
        }
    }

    impl TestServer {
        async fn stop(self) {
            self.shutdown.send(()).unwrap();
            self.handle.await.unwrap().unwrap();
        }
    }

    async fn http(addr: SocketAddr, method: &str, target: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "{} {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
            method, target
        );
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    async fn wait_released(registry: &KeyRegistry, key: &str) {
        for _ in 0..100 {
            if !registry.is_active(key) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("key {} still held", key);
    }

    #[tokio::test]
    async fn test_serves_index_and_listing() {
        let server = start_server().await;

        let index = http(server.addr, "GET", "/").await;
        assert!(index.starts_with("HTTP/1.1 200 OK"), "{}", index);
        assert!(index.ends_with("<html>gallery</html>"));

        let listing = http(server.addr, "GET", "/api/videos?page=2&page_size=1").await;
        assert!(listing.starts_with("HTTP/1.1 200 OK"), "{}", listing);
        let body = listing.split("\r\n\r\n").nth(1).unwrap();
        let json: serde_json::Value = serde_json::from_str(body).unwrap();
        assert_eq!(json["total_count"], 2);
        assert_eq!(json["page"], 2);
        assert_eq!(json["videos"][0]["title"], "B");

        let bad_page = http(server.addr, "GET", "/api/videos?page=abc").await;
        let body = bad_page.split("\r\n\r\n").nth(1).unwrap();
        let json: serde_json::Value = serde_json::from_str(body).unwrap();
        assert_eq!(json["page"], 1);
        assert_eq!(json["page_size"], 20);

        let missing = http(server.addr, "GET", "/missing.css").await;
        assert!(missing.starts_with("HTTP/1.1 404"), "{}", missing);

        let traversal = http(server.addr, "GET", "/../cache.json").await;
        assert!(!traversal.starts_with("HTTP/1.1 200"), "{}", traversal);

        let post = http(server.addr, "POST", "/start").await;
        assert!(post.starts_with("HTTP/1.1 405"), "{}", post);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_websocket_init_claims_key_until_disconnect() {
        let server = start_server().await;
        let url = format!("ws://{}/ingest", server.addr);

        let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        ws.send(Message::Text(
            r#"{"destination":"rtmp://example.com/live2/WSKEY"}"#.to_string(),
        ))
        .await
        .unwrap();
        let ack = ws.next().await.unwrap().unwrap();
        let ack: serde_json::Value = serde_json::from_str(ack.to_text().unwrap()).unwrap();
        assert_eq!(ack["ok"], true);
        assert_eq!(ack["info"], "waiting for header");
        assert!(server.registry.is_active("WSKEY"));

        // A second publisher for the same key is refused.
        let (mut rival, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        rival
            .send(Message::Text(
                r#"{"destination":"rtmp://example.com/live2/WSKEY"}"#.to_string(),
            ))
            .await
            .unwrap();
        let refusal = rival.next().await.unwrap().unwrap();
        let refusal: serde_json::Value =
            serde_json::from_str(refusal.to_text().unwrap()).unwrap();
        assert_eq!(refusal["code"], "duplicate_destination");

        ws.close(None).await.unwrap();
        wait_released(&server.registry, "WSKEY").await;

        server.stop().await;
    }

    #[tokio::test]
    async fn test_publisher_close_is_answered_with_close() {
        let server = start_server().await;
        let url = format!("ws://{}/ingest", server.addr);

        let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        ws.send(Message::Text(
            r#"{"destination":"rtmp://example.com/live2/CLOSEKEY"}"#.to_string(),
        ))
        .await
        .unwrap();
        ws.next().await.unwrap().unwrap();

        ws.send(Message::Close(None)).await.unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .unwrap();
        assert!(
            matches!(reply, Some(Ok(Message::Close(_)))),
            "expected a close reply, got {:?}",
            reply
        );
        wait_released(&server.registry, "CLOSEKEY").await;

        server.stop().await;
    }
}
