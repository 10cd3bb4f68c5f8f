//! # Listener
//!
//! Accepts raw TCP connections, applies the authorization hook and runs the
//! acceptor handshake for each one. Connections that reach `Connected` are
//! delivered over an `mpsc` channel.
//!
//! A denied peer receives a single NAK byte and the socket is closed before
//! any handshake byte is read. Failed accepts and failed handshakes are logged
//! and never stop the accept loop.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::{lookup_host, TcpListener, TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{NetworkConfig, NAK};
use crate::error::{ProtocolError, Result};
use crate::service::connection::{Acceptor, Connection};
use crate::utils::metrics::global_metrics;

/// Decides whether a remote address may connect
pub type Authorizer = Arc<dyn Fn(SocketAddr) -> bool + Send + Sync>;

/// Capacity of the established-connection channel
const CONNECTION_CHANNEL_CAPACITY: usize = 64;

/// Listener configuration; `start` binds and spawns the accept loop
#[derive(Clone)]
pub struct Listener {
    acceptor: Acceptor,
    authorizer: Option<Authorizer>,
    address: Option<String>,
    backlog: u32,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("acceptor", &self.acceptor)
            .field("authorizer", &self.authorizer.is_some())
            .field("address", &self.address)
            .field("backlog", &self.backlog)
            .finish()
    }
}

impl Listener {
    pub fn new(acceptor: Acceptor) -> Self {
        Self {
            acceptor,
            authorizer: None,
            address: None,
            backlog: crate::config::DEFAULT_BACKLOG,
        }
    }

    /// Build from the `[server]` and `[tls]` sections
    pub fn from_config(config: &NetworkConfig) -> Result<Self> {
        let mut listener = Self::new(Acceptor::from_config(config)?);
        listener.address = Some(config.server.address.clone());
        listener.backlog = config.server.backlog;
        Ok(listener)
    }

    /// Install the authorization hook; without one every address is allowed
    pub fn with_authorizer<F>(mut self, authorize: F) -> Self
    where
        F: Fn(SocketAddr) -> bool + Send + Sync + 'static,
    {
        self.authorizer = Some(Arc::new(authorize));
        self
    }

    pub fn acceptor(&self) -> &Acceptor {
        &self.acceptor
    }

    /// Bind to the configured address and backlog
    pub async fn start_configured(&self) -> Result<(ListenerHandle, mpsc::Receiver<Connection>)> {
        let address = self.address.as_deref().ok_or_else(|| {
            ProtocolError::ConfigError("Listener has no configured address".into())
        })?;
        self.start(address, self.backlog).await
    }

    /// Bind `address` with the given backlog and start accepting.
    ///
    /// Established connections arrive on the returned receiver. One accept is
    /// outstanding at a time; each handshake runs on its own task.
    #[instrument(skip(self))]
    pub async fn start(
        &self,
        address: &str,
        backlog: u32,
    ) -> Result<(ListenerHandle, mpsc::Receiver<Connection>)> {
        let bind_addr = lookup_host(address).await?.next().ok_or_else(|| {
            ProtocolError::ConfigError(format!("Address '{address}' did not resolve"))
        })?;

        let socket = if bind_addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(bind_addr)?;
        let listener = socket.listen(backlog)?;
        let local_addr = listener.local_addr()?;
        info!(address = %local_addr, backlog, "Listening");

        let (conn_tx, conn_rx) = mpsc::channel(CONNECTION_CHANNEL_CAPACITY);
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        let task = tokio::spawn(accept_loop(
            listener,
            self.acceptor.clone(),
            self.authorizer.clone(),
            conn_tx,
            shutdown_rx,
        ));

        Ok((
            ListenerHandle {
                local_addr,
                shutdown_tx,
                task,
            },
            conn_rx,
        ))
    }
}

/// Running accept loop
#[derive(Debug)]
pub struct ListenerHandle {
    local_addr: SocketAddr,
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    /// Bound address, with the real port when bound to port 0
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and release the listening socket.
    ///
    /// Connections already accepted, including those still in their
    /// handshake, are left alone.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(()).await;
        if let Err(e) = self.task.await {
            error!(error = %e, "Accept loop ended abnormally");
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: Acceptor,
    authorizer: Option<Authorizer>,
    conn_tx: mpsc::Sender<Connection>,
    mut shutdown_rx: mpsc::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("Listener stopped");
                global_metrics().log_metrics();
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    global_metrics().connection_accepted();
                    let acceptor = acceptor.clone();
                    let authorizer = authorizer.clone();
                    let conn_tx = conn_tx.clone();
                    tokio::spawn(async move {
                        handle_incoming(stream, peer, acceptor, authorizer, conn_tx).await;
                    });
                }
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                }
            }
        }
    }
}

#[instrument(skip(stream, acceptor, authorizer, conn_tx))]
async fn handle_incoming(
    mut stream: TcpStream,
    peer: SocketAddr,
    acceptor: Acceptor,
    authorizer: Option<Authorizer>,
    conn_tx: mpsc::Sender<Connection>,
) {
    if let Some(authorize) = &authorizer {
        if !authorize(peer) {
            global_metrics().connection_denied();
            warn!("Connection denied by authorization hook");
            let _ = stream.write_all(&[NAK]).await;
            let _ = stream.shutdown().await;
            return;
        }
    }

    match acceptor.accept(stream).await {
        Ok(connection) => {
            if conn_tx.send(connection).await.is_err() {
                debug!("Connection receiver dropped; closing new connection");
            }
        }
        Err(e) => {
            debug!(error = %e, "Acceptor handshake did not complete");
        }
    }
}
