//! TCP listener and accept loop.
//!
//! ```text
//! ┌──────────────┐  accept   ┌────────────────────┐  spawn  ┌───────────────────┐
//! │ TcpListener  │──────────>│ ConnectionRegistry │───────> │ ConnectionHandler │
//! └──────────────┘           └────────────────────┘         └───────────────────┘
//!        ▲                                                            ▲
//!        └──────────── shutdown token ──── child tokens ──────────────┘
//! ```
//!
//! Cancelling the shutdown token stops the accept loop, which then gives open
//! connections a grace period to finish their current request.

use crate::commands::{CommandTranslator, DEFAULT_REQUEST_TIMEOUT};
use crate::connection::{handle_connection, ConnectionRegistry, ConnectionStats};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// The default port legacy clients connect to
pub const DEFAULT_PORT: u16 = 11210;

/// The default host the bridge binds to
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Pause after a failed accept, e.g. when the process is out of descriptors
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Listener settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Address to bind, `host:port`
    pub bind_addr: String,
    /// Deadline for each backend call
    pub request_timeout: Duration,
    /// How long shutdown waits for open connections
    pub shutdown_grace: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bind_addr: format!("{}:{}", DEFAULT_HOST, DEFAULT_PORT),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to accept connection: {0}")]
    Accept(#[source] io::Error),

    /// The listener was closed by shutdown.
    #[error("listener closed")]
    ListenerClosed,
}

/// Accepts legacy clients and runs one handler task per connection.
pub struct Server {
    listener: TcpListener,
    translator: CommandTranslator,
    registry: Arc<ConnectionRegistry>,
    stats: Arc<ConnectionStats>,
    shutdown: CancellationToken,
    shutdown_grace: Duration,
}

impl Server {
    /// Binds the listener.
    pub async fn bind(
        config: &BridgeConfig,
        translator: CommandTranslator,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(&config.bind_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: config.bind_addr.clone(),
                source,
            })?;

        Ok(Self {
            listener,
            translator: translator.with_request_timeout(config.request_timeout),
            registry: Arc::new(ConnectionRegistry::new()),
            stats: Arc::new(ConnectionStats::new()),
            shutdown: CancellationToken::new(),
            shutdown_grace: config.shutdown_grace,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn stats(&self) -> Arc<ConnectionStats> {
        Arc::clone(&self.stats)
    }

    /// Token that stops the server when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Runs the accept loop until shutdown.
    pub async fn run(self) -> Result<(), ServerError> {
        info!(addr = ?self.listener.local_addr().ok(), "Accepting connections");

        loop {
            match self.accept().await {
                Ok((stream, addr)) => {
                    let registration = self.registry.register_guarded(addr);
                    debug!(conn = %registration.id(), client = %addr, "Accepted connection");

                    tokio::spawn(handle_connection(
                        stream,
                        addr,
                        registration,
                        self.translator.clone(),
                        Arc::clone(&self.stats),
                        self.shutdown.child_token(),
                    ));
                }
                Err(ServerError::ListenerClosed) => {
                    info!("Listener closed, no longer accepting connections");
                    break;
                }
                Err(e) => {
                    error!(
                        error = %e,
                        backoff = ?ACCEPT_BACKOFF,
                        "Failed to accept connection"
                    );
                    self.back_off().await;
                }
            }
        }

        self.drain().await;
        Ok(())
    }

    async fn accept(&self) -> Result<(TcpStream, SocketAddr), ServerError> {
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(ServerError::ListenerClosed),
            accepted = self.listener.accept() => accepted.map_err(ServerError::Accept),
        }
    }

    /// Sleeps for [`ACCEPT_BACKOFF`], or until shutdown.
    async fn back_off(&self) {
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
        }
    }

    /// Waits for open connections to deregister, up to the grace period.
    async fn drain(&self) {
        let registry = Arc::clone(&self.registry);
        let drained = tokio::time::timeout(self.shutdown_grace, async move {
            while !registry.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;

        match drained {
            Ok(()) => info!("All connections closed"),
            Err(_) => warn!(
                open = self.registry.len(),
                "Shutdown grace period elapsed with connections still open"
            ),
        }
    }
}
