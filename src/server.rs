//! The TCP accept loop and shutdown sequence.
//!
//! Grounded on the teacher's `start_server_with_config`: bind, loop on
//! `listener.accept()`, optionally wrap in TLS, hand the connection off.
//! The teacher hands connections to a caller-driven `EventStream`; here
//! each accepted connection is spawned straight into `session::run`,
//! which registers itself with the `SessionManager` and calls into the
//! `Handler` directly. `Server` also owns the capacity check and the
//! shutdown sequence (stop accepting, close every open session, wait for
//! them to drain) that the teacher never implemented.

use crate::config::{load_tls_config, ServerConfig};
use crate::error::Error;
use crate::manager::{Handler, SessionManager};
use crate::session;
use crate::transport::Transport;
use log::{error, info, warn};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;

const CAPACITY_EXCEEDED_RESPONSE: &[u8] = b"HTTP/1.1 503 Service Unavailable\r\nConnection: close\r\nContent-Length: 0\r\n\r\n";

pub struct Server {
    config: Arc<ServerConfig>,
    manager: SessionManager,
    handler: Arc<dyn Handler>,
}

impl Server {
    pub fn new(config: ServerConfig, handler: Arc<dyn Handler>) -> Self {
        let manager = SessionManager::new(config.websocket.max_frame_size, config.websocket.outbound_queue_capacity);
        Self {
            config: Arc::new(config),
            manager,
            handler,
        }
    }

    pub fn manager(&self) -> SessionManager {
        self.manager.clone()
    }

    /// Runs the accept loop until `shutdown` fires, then closes every
    /// open session and returns once they have all disconnected.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), Error> {
        let listener = TcpListener::bind(self.config.socket_addr()).await.map_err(Error::from)?;
        info!("listening on {}", self.config.socket_addr());

        let tls_acceptor = match &self.config.tls {
            Some(tls) => Some(TlsAcceptor::from(load_tls_config(tls)?)),
            None => None,
        };

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer_addr) = match accepted {
                        Ok(pair) => pair,
                        Err(err) => {
                            warn!("failed to accept a connection: {err}");
                            continue;
                        }
                    };

                    if self.manager.connected_count() >= self.config.max_connections {
                        warn!("rejecting {peer_addr}: server at capacity");
                        let mut stream = stream;
                        let _ = stream.write_all(CAPACITY_EXCEEDED_RESPONSE).await;
                        let _ = stream.shutdown().await;
                        continue;
                    }

                    let ws_config = Arc::new(self.config.websocket.clone());
                    let manager = self.manager.clone();
                    let handler = Arc::clone(&self.handler);
                    let tls_acceptor = tls_acceptor.clone();

                    tokio::spawn(async move {
                        let transport = match tls_acceptor {
                            Some(acceptor) => match acceptor.accept(stream).await {
                                Ok(tls_stream) => Transport::Tls(Box::new(tls_stream)),
                                Err(err) => {
                                    warn!("TLS handshake failed for {peer_addr}: {err}");
                                    return;
                                }
                            },
                            None => Transport::Plain(stream),
                        };
                        session::run(transport, ws_config, manager, handler).await;
                    });
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("shutting down, closing {} active session(s)", self.manager.connected_count());
        self.manager.close_all(1001, "server shutting down");

        let deadline = tokio::time::Instant::now() + tokio::time::Duration::from_secs(self.config.websocket.close_timeout_secs);
        while self.manager.connected_count() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        }
        if self.manager.connected_count() > 0 {
            error!("{} session(s) did not drain before shutdown deadline", self.manager.connected_count());
        }

        Ok(())
    }
}
