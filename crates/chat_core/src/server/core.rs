//! Core chat server implementation.
//!
//! Contains the [`ChatServer`] struct: it owns the dispatcher task, binds the
//! listener, runs the accept loop, and coordinates shutdown.

use super::gateway::handle_connection;
use crate::config::ServerConfig;
use crate::dispatcher::{Dispatcher, RelayHandle};
use crate::error::RelayError;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::TcpListener as StdTcpListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Runtime counters reported by [`ChatServer::stats`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerStats {
    /// Readers currently running, named or not
    pub live_connections: usize,
    /// Connections in the registry
    pub registered_connections: usize,
    /// Users who have joined
    pub joined_users: usize,
}

/// The chat relay server.
///
/// Creating a server spawns its dispatcher, so [`ChatServer::new`] must be
/// called from within a Tokio runtime.
pub struct ChatServer {
    config: Arc<ServerConfig>,
    relay: RelayHandle,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    live_connections: Arc<AtomicUsize>,
    shutdown_signal: watch::Sender<bool>,
}

impl ChatServer {
    pub fn new(config: ServerConfig) -> Self {
        let (dispatcher, relay) = Dispatcher::spawn(&config);
        let (shutdown_signal, _) = watch::channel(false);
        Self {
            config: Arc::new(config),
            relay,
            dispatcher: Mutex::new(Some(dispatcher)),
            live_connections: Arc::new(AtomicUsize::new(0)),
            shutdown_signal,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Handle for submitting work to the dispatcher directly, used for
    /// in-process subscribers and roster queries.
    pub fn relay(&self) -> RelayHandle {
        self.relay.clone()
    }

    pub fn live_connections(&self) -> usize {
        self.live_connections.load(Ordering::Acquire)
    }

    /// Bind the configured address.
    ///
    /// # Errors
    /// Returns `RelayError::Network` if the socket cannot be created or bound
    pub async fn bind(&self) -> Result<TcpListener, RelayError> {
        let addr = self.config.bind_address;
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| RelayError::Network(format!("Socket creation failed: {e}")))?;
        if let Err(e) = socket.set_reuse_address(true) {
            warn!(error = %e, "Failed to set SO_REUSEADDR");
        }

        socket
            .bind(&addr.into())
            .map_err(|e| RelayError::Network(format!("Failed to bind to {addr}: {e}")))?;
        socket
            .listen(1024)
            .map_err(|e| RelayError::Network(format!("Listen failed: {e}")))?;

        let std_listener: StdTcpListener = socket.into();
        std_listener
            .set_nonblocking(true)
            .map_err(|e| RelayError::Network(format!("Failed to set non-blocking: {e}")))?;

        TcpListener::from_std(std_listener)
            .map_err(|e| RelayError::Network(format!("Tokio listener creation failed: {e}")))
    }

    /// Bind and serve until [`ChatServer::shutdown`] is called.
    ///
    /// # Errors
    /// Returns `RelayError::Network` if binding fails
    pub async fn start(&self) -> Result<(), RelayError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accept connections on `listener` until shutdown is signalled.
    ///
    /// Each accepted socket is upgraded and served on its own task, so a slow
    /// handshake never holds up the accept loop.
    ///
    /// # Errors
    /// `RelayError::DispatcherClosed` if the dispatcher stops while serving
    pub async fn serve(&self, listener: TcpListener) -> Result<(), RelayError> {
        let mut shutdown_rx = self.shutdown_signal.subscribe();
        if *shutdown_rx.borrow() {
            return Ok(());
        }

        match listener.local_addr() {
            Ok(addr) => info!(%addr, path = %self.config.ws_path, "Chat server listening"),
            Err(e) => warn!(error = %e, "Listening on unknown address"),
        }

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            if self.relay.is_closed() {
                                error!("Dispatcher is gone, stopping accept loop");
                                return Err(RelayError::DispatcherClosed);
                            }
                            let relay = self.relay.clone();
                            let config = self.config.clone();
                            let live = self.live_connections.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, relay, config, live).await {
                                    warn!(remote_addr = %addr, error = %e, "Connection setup failed");
                                }
                            });
                        }
                        Err(e) => error!(error = %e, "Failed to accept connection"),
                    }
                }
                _ = shutdown_rx.changed() => {
                    info!("Shutdown signal received, stopping accept loop");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Stop accepting, close every registered connection, and wait for the
    /// dispatcher to finish.
    pub async fn shutdown(&self) -> Result<(), RelayError> {
        info!("Shutting down chat server");
        self.shutdown_signal.send_replace(true);

        let result = match self.relay.shutdown().await {
            Err(RelayError::DispatcherClosed) => Ok(()),
            other => other,
        };

        if let Some(dispatcher) = self.dispatcher.lock().await.take() {
            if let Err(e) = dispatcher.await {
                error!(error = %e, "Dispatcher task failed");
            }
        }
        result
    }

    pub async fn stats(&self) -> Result<ServerStats, RelayError> {
        let roster = self.relay.roster().await?;
        Ok(ServerStats {
            live_connections: self.live_connections(),
            registered_connections: roster.connections,
            joined_users: roster.users.len(),
        })
    }
}
