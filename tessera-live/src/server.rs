//! WebSocket transport.
//!
//! Architecture:
//! ```text
//!                 ┌──────────── socket task ─────────────┐
//! Client ──ws──►  │ reader ──► mpsc<Inbound> ──► Connection ──► views
//!        ◄──ws──  │ writer ◄───────── replies / pushes ◄─┘
//!                 └──────────────────────────────────────┘
//!                          ▲
//!        pub/sub forwarders, timers (per view)
//! ```
//!
//! One task per socket. A reader task turns frames into [`Inbound`] items;
//! the socket task drains the queue one item at a time and writes whatever
//! the connection returns. No frame within the heartbeat window, a close
//! frame or a failed write ends the socket and leaves every view on it.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;

use crate::connection::{Connection, Inbound};
use crate::manager::Services;
use crate::router::Router;
use crate::upload::TempDirStager;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Bound of each socket's inbound queue
    pub inbound_queue_capacity: usize,
    /// Per-subscriber buffer of the default pub/sub hub
    pub pubsub_capacity: usize,
    /// Sockets silent for this long are closed
    pub heartbeat_timeout_secs: u64,
    /// Upload staging directory (None = OS temp dir)
    pub upload_dir: Option<PathBuf>,
    /// Larger frames are dropped
    pub max_frame_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:4001".to_string(),
            inbound_queue_capacity: 256,
            pubsub_capacity: 256,
            heartbeat_timeout_secs: 60,
            upload_dir: None,
            max_frame_bytes: 8 * 1024 * 1024,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    /// Malformed, unroutable or rejected messages
    pub dropped_messages: u64,
    pub callback_failures: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) total_connections: AtomicU64,
    pub(crate) active_connections: AtomicU64,
    pub(crate) total_messages: AtomicU64,
    pub(crate) dropped_messages: AtomicU64,
    pub(crate) callback_failures: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> ServerStats {
        ServerStats {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            total_messages: self.total_messages.load(Ordering::Relaxed),
            dropped_messages: self.dropped_messages.load(Ordering::Relaxed),
            callback_failures: self.callback_failures.load(Ordering::Relaxed),
        }
    }
}

/// The live view server.
pub struct LiveServer {
    config: ServerConfig,
    router: Arc<Router>,
    services: Services,
    counters: Arc<Counters>,
}

impl LiveServer {
    /// Create a server with in-process collaborators.
    pub fn new(config: ServerConfig, router: Router) -> Self {
        let mut services = Services::in_memory(config.pubsub_capacity);
        if let Some(dir) = &config.upload_dir {
            services.stager = Arc::new(TempDirStager::new(dir.clone()));
        }
        Self::with_services(config, router, services)
    }

    /// Create a server with caller-supplied collaborators.
    pub fn with_services(config: ServerConfig, router: Router, services: Services) -> Self {
        Self {
            config,
            router: Arc::new(router),
            services,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Start listening for WebSocket connections.
    ///
    /// This runs the server event loop. Call from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!(
            "Live server listening on {} ({} routes)",
            self.config.bind_addr,
            self.router.len()
        );

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let router = self.router.clone();
            let services = self.services.clone();
            let config = self.config.clone();
            let counters = self.counters.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, router, services, config, counters).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        router: Arc<Router>,
        services: Services,
        config: ServerConfig,
        counters: Arc<Counters>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");
        counters.total_connections.fetch_add(1, Ordering::Relaxed);
        counters.active_connections.fetch_add(1, Ordering::Relaxed);

        let (tx, mut rx) = mpsc::channel(config.inbound_queue_capacity.max(1));
        let reader_tx = tx.clone();
        let max_frame = config.max_frame_bytes;
        let reader_counters = counters.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_receiver.next().await {
                let inbound = match msg {
                    Ok(Message::Text(text)) if text.len() <= max_frame => Inbound::Text(text.as_str().to_owned()),
                    Ok(Message::Binary(data)) if data.len() <= max_frame => Inbound::Binary(data.to_vec()),
                    Ok(Message::Text(_)) | Ok(Message::Binary(_)) => {
                        reader_counters.dropped_messages.fetch_add(1, Ordering::Relaxed);
                        log::warn!("Dropped frame from {addr}: larger than {max_frame} bytes");
                        continue;
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        log::error!("WebSocket error from {addr}: {e}");
                        break;
                    }
                };
                if reader_tx.send(inbound).await.is_err() {
                    return;
                }
            }
            let _ = reader_tx.send(Inbound::Closed).await;
        });

        let mut connection = Connection::new(router, services, tx, counters.clone());
        let window = Duration::from_secs(config.heartbeat_timeout_secs.max(1));
        let mut deadline = Instant::now() + window;

        let result = loop {
            let inbound = match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(Inbound::Closed)) | Ok(None) => {
                    log::info!("Connection closed from {addr}");
                    break Ok(());
                }
                Ok(Some(inbound)) => inbound,
                Err(_) => {
                    log::warn!("No frame from {addr} in {}s; closing", window.as_secs());
                    break Ok(());
                }
            };
            if matches!(inbound, Inbound::Text(_) | Inbound::Binary(_)) {
                deadline = Instant::now() + window;
            }

            let mut failure = None;
            for envelope in connection.handle(inbound).await {
                let text = match envelope.encode() {
                    Ok(text) => text,
                    Err(e) => {
                        log::error!("Failed to encode {} on {}: {e}", envelope.event, envelope.topic);
                        continue;
                    }
                };
                if let Err(e) = ws_sender.send(Message::Text(text.into())).await {
                    failure = Some(e);
                    break;
                }
            }
            if let Some(e) = failure {
                log::error!("Send to {addr} failed; tearing down");
                break Err(e.into());
            }
        };

        connection.shutdown().await;
        reader.abort();
        let _ = ws_sender.close().await;
        counters.active_connections.fetch_sub(1, Ordering::Relaxed);
        result
    }

    /// Get server statistics.
    pub fn stats(&self) -> ServerStats {
        self.counters.snapshot()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn router(&self) -> &Router {
        &self.router
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::FileStager;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:4001");
        assert_eq!(config.inbound_queue_capacity, 256);
        assert_eq!(config.pubsub_capacity, 256);
        assert_eq!(config.heartbeat_timeout_secs, 60);
        assert!(config.upload_dir.is_none());
        assert_eq!(config.max_frame_bytes, 8 * 1024 * 1024);
    }

    #[test]
    fn test_server_custom_config() {
        let config = ServerConfig {
            bind_addr: "0.0.0.0:8080".to_string(),
            heartbeat_timeout_secs: 15,
            ..ServerConfig::default()
        };
        let server = LiveServer::new(config, Router::new());
        assert_eq!(server.bind_addr(), "0.0.0.0:8080");
        assert!(server.router().is_empty());
    }

    #[test]
    fn test_upload_dir_configures_stager() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            upload_dir: Some(dir.path().to_path_buf()),
            ..ServerConfig::default()
        };
        let server = LiveServer::new(config, Router::new());
        assert_eq!(server.services().stager.path_for("x").parent(), Some(dir.path()));
    }

    #[test]
    fn test_server_stats_initial() {
        let server = LiveServer::new(ServerConfig::default(), Router::new());
        assert_eq!(server.stats(), ServerStats::default());
    }
}
