//! # Connection Endpoint
//!
//! One point-to-point connection: the handshake state machine for either role,
//! the optional TLS upgrade, and record I/O over the resulting stream.
//!
//! Initiators are built from a [`Connector`]; acceptors are produced by the
//! listener through an [`Acceptor`]. Any handshake failure closes the socket,
//! leaves the connection `Disconnected` and returns the error to the caller.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::{NetworkConfig, Version, MAX_RECORD_SIZE, PROTOCOL_VERSION};
use crate::core::codec::{Codec, Decoded, RecordCodec};
use crate::core::record::Record;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::handshake::{self, HandshakeOptions};
use crate::protocol::state::{ConnectionState, Role};
use crate::transport::stream::ConnectionStream;
use crate::transport::tls::{TlsClientConfig, TlsServerConfig};
use crate::utils::metrics::{global_metrics, Timer};
use crate::utils::timeout::{with_timeout_error, DEFAULT_TIMEOUT, HANDSHAKE_TIMEOUT};

/// Initiator settings: where to connect and how long the whole attempt may take
#[derive(Debug, Clone)]
pub struct Connector {
    address: String,
    timeout: Duration,
    version: Version,
    tls: TlsClientConfig,
    max_record_size: usize,
}

impl Connector {
    pub fn new<S: Into<String>>(address: S) -> Self {
        Self {
            address: address.into(),
            timeout: DEFAULT_TIMEOUT,
            version: PROTOCOL_VERSION,
            tls: TlsClientConfig::new(),
            max_record_size: MAX_RECORD_SIZE,
        }
    }

    /// Build from the `[client]` and `[tls]` sections
    pub fn from_config(config: &NetworkConfig) -> Result<Self> {
        let tls = TlsClientConfig::from_settings(&config.tls, config.client.server_name.clone())?;
        Ok(Self::new(config.client.address.clone())
            .with_timeout(config.client.connection_timeout)
            .with_max_record_size(config.client.max_record_size)
            .with_tls(tls))
    }

    /// Deadline covering TCP connect, handshake and TLS upgrade together
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// TLS settings used if the acceptor asks for encryption
    pub fn with_tls(mut self, tls: TlsClientConfig) -> Self {
        self.tls = tls;
        self
    }

    /// Announce a different protocol version
    pub fn with_version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    /// Largest record a receive will buffer before tearing the connection down
    pub fn with_max_record_size(mut self, limit: usize) -> Self {
        self.max_record_size = limit;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Open a new connection
    pub async fn connect(&self) -> Result<Connection> {
        let mut connection = Connection::new(Role::Initiator);
        connection.connect(self).await?;
        Ok(connection)
    }
}

/// Acceptor settings shared by every connection a listener accepts
#[derive(Clone)]
pub struct Acceptor {
    version: Version,
    no_delay: bool,
    tls: Option<TlsAcceptor>,
    handshake_timeout: Duration,
    max_record_size: usize,
}

impl std::fmt::Debug for Acceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acceptor")
            .field("version", &self.version)
            .field("no_delay", &self.no_delay)
            .field("encryption", &self.tls.is_some())
            .field("handshake_timeout", &self.handshake_timeout)
            .field("max_record_size", &self.max_record_size)
            .finish()
    }
}

impl Default for Acceptor {
    fn default() -> Self {
        Self::new()
    }
}

impl Acceptor {
    pub fn new() -> Self {
        Self {
            version: PROTOCOL_VERSION,
            no_delay: true,
            tls: None,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            max_record_size: MAX_RECORD_SIZE,
        }
    }

    /// Build from the `[server]` and `[tls]` sections.
    ///
    /// Encryption is negotiated when `tls.enabled` is set; that requires a
    /// certificate.
    pub fn from_config(config: &NetworkConfig) -> Result<Self> {
        let mut acceptor = Self::new()
            .with_no_delay(config.server.no_delay)
            .with_handshake_timeout(config.server.handshake_timeout)
            .with_max_record_size(config.server.max_record_size);
        if config.tls.enabled {
            let tls = TlsServerConfig::from_settings(&config.tls)
                .ok_or_else(|| ProtocolError::ConfigError(constants::ERR_NO_SERVER_TLS.into()))?;
            acceptor = acceptor.with_tls(&tls)?;
        }
        Ok(acceptor)
    }

    /// Negotiate encryption with every initiator using this certificate
    pub fn with_tls(mut self, config: &TlsServerConfig) -> Result<Self> {
        self.tls = Some(config.acceptor()?);
        Ok(self)
    }

    /// Whether initiators are told to disable small-write batching
    pub fn with_no_delay(mut self, no_delay: bool) -> Self {
        self.no_delay = no_delay;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    /// Largest record accepted connections will buffer
    pub fn with_max_record_size(mut self, limit: usize) -> Self {
        self.max_record_size = limit;
        self
    }

    /// Options announced in the handshake
    pub fn options(&self) -> HandshakeOptions {
        HandshakeOptions::new(self.no_delay, self.tls.is_some())
    }

    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }

    /// Run the acceptor handshake on a freshly accepted socket
    pub async fn accept(&self, stream: TcpStream) -> Result<Connection> {
        let mut connection = Connection::new(Role::Acceptor);
        connection.accept(stream, self).await?;
        Ok(connection)
    }
}

/// A connection endpoint in either role
pub struct Connection {
    role: Role,
    state: ConnectionState,
    stream: Option<ConnectionStream>,
    peer: Option<SocketAddr>,
    no_delay: bool,
    read_buf: BytesMut,
    max_record_size: usize,
    last_activity: Instant,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("peer", &self.peer)
            .field("encrypted", &self.is_encrypted())
            .finish()
    }
}

impl Connection {
    /// A `Disconnected` endpoint
    pub fn new(role: Role) -> Self {
        Self {
            role,
            state: ConnectionState::Disconnected,
            stream: None,
            peer: None,
            no_delay: false,
            read_buf: BytesMut::new(),
            max_record_size: MAX_RECORD_SIZE,
            last_activity: Instant::now(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn is_encrypted(&self) -> bool {
        self.stream.as_ref().is_some_and(ConnectionStream::is_encrypted)
    }

    /// Whether small-write batching is disabled on the socket
    pub fn no_delay(&self) -> bool {
        self.no_delay
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Largest record a receive will buffer
    pub fn max_record_size(&self) -> usize {
        self.max_record_size
    }

    /// Time since the last completed send or receive
    pub fn time_since_last_activity(&self) -> Duration {
        self.last_activity.elapsed()
    }

    fn begin(&mut self) -> Result<()> {
        if !self.state.can_start() {
            return Err(ProtocolError::InvalidState(
                constants::ERR_ALREADY_ACTIVE.into(),
            ));
        }
        self.read_buf.clear();
        self.state = ConnectionState::Initializing;
        global_metrics().handshake_attempt();
        Ok(())
    }

    fn established(&mut self, stream: ConnectionStream, peer: SocketAddr, no_delay: bool) {
        let encrypted = stream.is_encrypted();
        self.stream = Some(stream);
        self.peer = Some(peer);
        self.no_delay = no_delay;
        self.state = ConnectionState::Connected;
        self.last_activity = Instant::now();
        global_metrics().handshake_success(encrypted);
        info!(role = %self.role, %peer, encrypted, "Connection established");
    }

    fn failed(&mut self, error: &ProtocolError) {
        self.state = ConnectionState::Disconnected;
        self.stream = None;
        global_metrics().handshake_failed();
        warn!(role = %self.role, error = %error, "Handshake failed");
    }

    /// Connect out and run the initiator handshake.
    ///
    /// Only valid from `Disconnected`. The connector's timeout bounds the whole
    /// attempt; on expiry the socket is dropped and `HandshakeTimeout` returned.
    #[instrument(skip(self, connector), fields(address = %connector.address))]
    pub async fn connect(&mut self, connector: &Connector) -> Result<()> {
        self.begin()?;
        self.max_record_size = connector.max_record_size;
        let _timer = Timer::start("connect");

        let result = with_timeout_error(self.run_initiator(connector), connector.timeout).await;
        if let Err(e) = &result {
            self.failed(e);
        }
        result
    }

    async fn run_initiator(&mut self, connector: &Connector) -> Result<()> {
        let mut tcp = TcpStream::connect(&connector.address).await?;
        tcp.set_nodelay(true)?;
        let peer = tcp.peer_addr()?;
        debug!(%peer, "TCP connected");

        let options = handshake::initiate_plain(&mut tcp, connector.version).await?;
        tcp.set_nodelay(options.no_delay)?;

        let stream = if options.encryption {
            self.state = ConnectionState::Authenticating;
            let tls_connector: TlsConnector = connector.tls.connector()?;
            let server_name = connector.tls.server_name(peer.ip())?;
            let mut tls = tls_connector
                .connect(server_name, tcp)
                .await
                .map_err(|e| ProtocolError::EncryptionFailure(e.to_string()))?;
            handshake::confirm_as_initiator(&mut tls).await?;
            ConnectionStream::Tls(Box::new(TlsStream::from(tls)))
        } else {
            ConnectionStream::Plain(tcp)
        };

        self.established(stream, peer, options.no_delay);
        Ok(())
    }

    /// Run the acceptor handshake on `stream`, bounded by the acceptor's timeout
    #[instrument(skip(self, stream, acceptor))]
    pub async fn accept(&mut self, stream: TcpStream, acceptor: &Acceptor) -> Result<()> {
        self.begin()?;
        self.max_record_size = acceptor.max_record_size;
        let result =
            with_timeout_error(self.run_acceptor(stream, acceptor), acceptor.handshake_timeout)
                .await;
        if let Err(e) = &result {
            self.failed(e);
        }
        result
    }

    async fn run_acceptor(&mut self, mut tcp: TcpStream, acceptor: &Acceptor) -> Result<()> {
        let peer = tcp.peer_addr()?;
        tcp.set_nodelay(acceptor.no_delay)?;

        let options = acceptor.options();
        let version = handshake::accept_plain(&mut tcp, acceptor.version, options).await?;
        debug!(%peer, %version, "Initiator version accepted");

        let stream = match &acceptor.tls {
            Some(tls_acceptor) => {
                self.state = ConnectionState::Authenticating;
                let mut tls = tls_acceptor
                    .accept(tcp)
                    .await
                    .map_err(|e| ProtocolError::EncryptionFailure(e.to_string()))?;
                handshake::confirm_as_acceptor(&mut tls).await?;
                ConnectionStream::Tls(Box::new(TlsStream::from(tls)))
            }
            None => ConnectionStream::Plain(tcp),
        };

        self.established(stream, peer, options.no_delay);
        Ok(())
    }

    /// Close both stream layers and return to `Disconnected`
    pub async fn disconnect(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            // Peer may already be gone
            let _ = stream.shutdown().await;
        }
        self.read_buf.clear();
        if self.state == ConnectionState::Connected {
            global_metrics().connection_closed();
            debug!(role = %self.role, peer = ?self.peer, "Connection closed");
        }
        self.state = ConnectionState::Disconnected;
    }

    /// Drop the stream after a framing failure; the byte position is lost
    fn teardown(&mut self, reason: &ProtocolError) {
        warn!(role = %self.role, error = %reason, "Tearing down connection");
        self.stream = None;
        self.read_buf.clear();
        if self.state == ConnectionState::Connected {
            global_metrics().connection_closed();
        }
        self.state = ConnectionState::Disconnected;
    }

    fn stream_mut(&mut self) -> Result<&mut ConnectionStream> {
        match (&self.state, self.stream.as_mut()) {
            (ConnectionState::Connected, Some(stream)) => Ok(stream),
            _ => Err(ProtocolError::InvalidState(
                constants::ERR_NOT_CONNECTED.into(),
            )),
        }
    }

    /// Serialize `record` and write it to the stream
    pub async fn send<R: Record>(&mut self, codec: &Codec, record: &R) -> Result<()> {
        let mut buf = BytesMut::new();
        codec.serialize_into(record, &mut buf)?;

        let stream = self.stream_mut()?;
        let written = async {
            stream.write_all(&buf).await?;
            stream.flush().await
        }
        .await;
        if let Err(e) = written {
            let error = ProtocolError::Io(e);
            self.teardown(&error);
            return Err(error);
        }

        global_metrics().record_sent(buf.len() as u64);
        self.last_activity = Instant::now();
        Ok(())
    }

    /// Read one complete `R` from the stream.
    ///
    /// A record still unfinished after `max_record_size` bytes fails with
    /// `RecordTooLarge` and tears the connection down.
    pub async fn receive<R: Record>(&mut self, codec: &Codec) -> Result<R> {
        self.stream_mut()?;
        let outcome = loop {
            if !self.read_buf.is_empty() {
                match codec.decode_prefix::<R>(&self.read_buf, None) {
                    Ok(decoded) => break Ok(decoded),
                    Err(ProtocolError::Truncated) => {}
                    Err(e) => break Err(e),
                }
            }
            if let Err(e) = self.check_record_size() {
                break Err(e);
            }
            if let Err(e) = self.fill_read_buf().await {
                break Err(e);
            }
        };
        self.finish_receive(outcome).map(|decoded| decoded.value)
    }

    /// Read one `R`, giving up when `cancel` fires.
    ///
    /// If part of a record has arrived when the token fires, the complete
    /// fields are returned with `interrupted` set and the connection is torn
    /// down, since the rest of the record can no longer be framed. If nothing
    /// decodable has arrived the result is `ProtocolError::Cancelled`.
    pub async fn receive_with_cancel<R: Record>(
        &mut self,
        codec: &Codec,
        cancel: &CancellationToken,
    ) -> Result<Decoded<R>> {
        self.stream_mut()?;
        let outcome = loop {
            if !self.read_buf.is_empty() {
                match codec.decode_prefix::<R>(&self.read_buf, None) {
                    Ok(decoded) => break Ok(decoded),
                    Err(ProtocolError::Truncated) => {}
                    Err(e) => break Err(e),
                }
            }
            if let Err(e) = self.check_record_size() {
                break Err(e);
            }
            if cancel.is_cancelled() {
                break if self.read_buf.is_empty() {
                    Err(ProtocolError::Cancelled)
                } else {
                    match codec.decode_partial::<R>(&self.read_buf) {
                        Err(ProtocolError::Truncated) => Err(ProtocolError::Cancelled),
                        other => other,
                    }
                };
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {}
                filled = self.fill_read_buf() => {
                    if let Err(e) = filled {
                        break Err(e);
                    }
                }
            }
        };
        self.finish_receive(outcome)
    }

    fn check_record_size(&self) -> Result<()> {
        if self.read_buf.len() > self.max_record_size {
            return Err(ProtocolError::RecordTooLarge {
                buffered: self.read_buf.len(),
                limit: self.max_record_size,
            });
        }
        Ok(())
    }

    async fn fill_read_buf(&mut self) -> Result<()> {
        let Self {
            stream, read_buf, ..
        } = self;
        let stream = stream
            .as_mut()
            .ok_or_else(|| ProtocolError::InvalidState(constants::ERR_NOT_CONNECTED.into()))?;
        if stream.read_buf(read_buf).await? == 0 {
            return Err(if read_buf.is_empty() {
                ProtocolError::StreamClosed
            } else {
                ProtocolError::Truncated
            });
        }
        Ok(())
    }

    fn finish_receive<R>(&mut self, outcome: Result<Decoded<R>>) -> Result<Decoded<R>> {
        match outcome {
            Ok(decoded) => {
                self.read_buf.advance(decoded.consumed);
                global_metrics().record_received(decoded.consumed as u64);
                self.last_activity = Instant::now();
                if decoded.interrupted {
                    self.teardown(&ProtocolError::Cancelled);
                }
                Ok(decoded)
            }
            Err(ProtocolError::Cancelled) if self.read_buf.is_empty() => {
                Err(ProtocolError::Cancelled)
            }
            Err(e) => {
                self.teardown(&e);
                Err(e)
            }
        }
    }

    /// Take the stream out; the connection stays counted as active with its new owner
    fn release_stream(&mut self) -> Result<ConnectionStream> {
        if self.state != ConnectionState::Connected {
            return Err(ProtocolError::InvalidState(
                constants::ERR_NOT_CONNECTED.into(),
            ));
        }
        let stream = self
            .stream
            .take()
            .ok_or_else(|| ProtocolError::InvalidState(constants::ERR_NOT_CONNECTED.into()))?;
        self.state = ConnectionState::Disconnected;
        debug!(role = %self.role, peer = ?self.peer, "Stream handed over");
        Ok(stream)
    }

    /// Hand over the established stream, e.g. to wrap it in another codec
    pub fn into_stream(mut self) -> Result<ConnectionStream> {
        self.release_stream()
    }

    /// Wrap the established stream in a record framing codec.
    ///
    /// Bytes already buffered by [`Connection::receive`] are carried over,
    /// and the codec keeps this connection's record size limit.
    pub fn framed(mut self, codec: Arc<Codec>) -> Result<Framed<ConnectionStream, RecordCodec>> {
        let stream = self.release_stream()?;
        let buffered = std::mem::take(&mut self.read_buf);
        let framing = RecordCodec::new(codec).with_max_record_size(self.max_record_size);
        let mut framed = Framed::new(stream, framing);
        framed.read_buffer_mut().extend_from_slice(&buffered);
        Ok(framed)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.state == ConnectionState::Connected {
            global_metrics().connection_closed();
        }
    }
}
