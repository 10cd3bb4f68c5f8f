//! Plain handshake and TLS confirmation exchange.
//!
//! The plain handshake establishes protocol compatibility and lets the acceptor
//! dictate the connection options:
//!
//! ```text
//! I -> A  "REDSOCKET" major minor patch     12 bytes
//! A -> I  ACK options                        2 bytes (NAK NAK on version mismatch)
//! I -> A  ACK                                1 byte
//! A -> I  EOT                                1 byte
//! ```
//!
//! Option bit 0 asks the initiator to disable small-write batching, bit 1 turns
//! on encryption. When encryption is on, both sides run a TLS handshake and then
//! the confirmation exchange: the initiator writes ACK and expects ACK back.
//!
//! These functions work on any `AsyncRead + AsyncWrite` stream and leave the
//! connection state and teardown to the caller.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, instrument, warn};

use crate::config::{Version, ACK, EOT, MAGIC_BYTES, NAK};
use crate::error::{constants, ProtocolError, Result};

const NO_DELAY_BIT: u8 = 0b01;
const ENCRYPTION_BIT: u8 = 0b10;

/// Options the acceptor announces in the second handshake byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HandshakeOptions {
    pub no_delay: bool,
    pub encryption: bool,
}

impl HandshakeOptions {
    pub fn new(no_delay: bool, encryption: bool) -> Self {
        Self {
            no_delay,
            encryption,
        }
    }

    /// Pack into the option byte; reserved bits are zero
    pub fn bits(self) -> u8 {
        let mut bits = 0;
        if self.no_delay {
            bits |= NO_DELAY_BIT;
        }
        if self.encryption {
            bits |= ENCRYPTION_BIT;
        }
        bits
    }

    /// Unpack the option byte; reserved bits are ignored
    pub fn from_bits(bits: u8) -> Self {
        Self {
            no_delay: bits & NO_DELAY_BIT != 0,
            encryption: bits & ENCRYPTION_BIT != 0,
        }
    }
}

/// Read exactly `buf.len()` bytes; a peer hanging up early is a protocol violation
async fn read_handshake_bytes<S>(stream: &mut S, buf: &mut [u8]) -> Result<()>
where
    S: AsyncRead + Unpin,
{
    match stream.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(
            ProtocolError::ProtocolViolation(constants::ERR_SHORT_READ.into()),
        ),
        Err(e) => Err(e.into()),
    }
}

async fn read_handshake_byte<S>(stream: &mut S) -> Result<u8>
where
    S: AsyncRead + Unpin,
{
    let mut byte = [0u8; 1];
    read_handshake_bytes(stream, &mut byte).await?;
    Ok(byte[0])
}

async fn write_handshake_bytes<S>(stream: &mut S, bytes: &[u8]) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(bytes).await?;
    stream.flush().await?;
    Ok(())
}

/// Run the acceptor side of the plain handshake.
///
/// Returns the initiator's version. On a major/minor mismatch the acceptor
/// writes `NAK NAK` and fails without announcing options.
#[instrument(skip(stream))]
pub async fn accept_plain<S>(
    stream: &mut S,
    local: Version,
    options: HandshakeOptions,
) -> Result<Version>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut magic = [0u8; MAGIC_BYTES.len()];
    read_handshake_bytes(stream, &mut magic).await?;
    if magic != MAGIC_BYTES {
        warn!("Rejecting peer with bad magic header");
        return Err(ProtocolError::ProtocolViolation(
            constants::ERR_BAD_MAGIC.into(),
        ));
    }

    let mut version = [0u8; 3];
    read_handshake_bytes(stream, &mut version).await?;
    let peer = Version::from_bytes(version);
    if !local.is_compatible_with(&peer) {
        warn!(peer = %peer, "Rejecting incompatible protocol version");
        write_handshake_bytes(stream, &[NAK, NAK]).await?;
        return Err(ProtocolError::ProtocolViolation(format!(
            "{}: local {local}, peer {peer}",
            constants::ERR_VERSION_MISMATCH
        )));
    }
    debug!(peer = %peer, "Protocol version accepted");

    write_handshake_bytes(stream, &[ACK, options.bits()]).await?;
    debug!(options = options.bits(), "Sent connection options");

    let ack = read_handshake_byte(stream).await?;
    if ack != ACK {
        return Err(ProtocolError::ProtocolViolation(format!(
            "{}, got {ack:#04x}",
            constants::ERR_EXPECTED_ACK
        )));
    }

    write_handshake_bytes(stream, &[EOT]).await?;
    debug!("Plain handshake complete");
    Ok(peer)
}

/// Run the initiator side of the plain handshake and return the options the
/// acceptor chose.
#[instrument(skip(stream))]
pub async fn initiate_plain<S>(stream: &mut S, local: Version) -> Result<HandshakeOptions>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut hello = [0u8; MAGIC_BYTES.len() + 3];
    hello[..MAGIC_BYTES.len()].copy_from_slice(&MAGIC_BYTES);
    hello[MAGIC_BYTES.len()..].copy_from_slice(&local.to_bytes());
    write_handshake_bytes(stream, &hello).await?;

    match read_handshake_byte(stream).await? {
        ACK => {}
        NAK => {
            warn!("Acceptor refused the connection");
            return Err(ProtocolError::ProtocolViolation(
                constants::ERR_PEER_REFUSED.into(),
            ));
        }
        other => {
            return Err(ProtocolError::ProtocolViolation(format!(
                "{}, got {other:#04x}",
                constants::ERR_EXPECTED_ACK
            )));
        }
    }
    let options = HandshakeOptions::from_bits(read_handshake_byte(stream).await?);
    debug!(?options, "Received connection options");

    write_handshake_bytes(stream, &[ACK]).await?;

    let eot = read_handshake_byte(stream).await?;
    if eot != EOT {
        return Err(ProtocolError::ProtocolViolation(format!(
            "{}, got {eot:#04x}",
            constants::ERR_EXPECTED_EOT
        )));
    }
    debug!("Plain handshake complete");
    Ok(options)
}

/// Initiator half of the post-TLS confirmation: write ACK, expect ACK
pub async fn confirm_as_initiator<S>(stream: &mut S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_handshake_bytes(stream, &[ACK]).await?;
    expect_confirmation(stream).await
}

/// Acceptor half of the post-TLS confirmation: expect ACK, write ACK
pub async fn confirm_as_acceptor<S>(stream: &mut S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    expect_confirmation(stream).await?;
    write_handshake_bytes(stream, &[ACK]).await
}

async fn expect_confirmation<S>(stream: &mut S) -> Result<()>
where
    S: AsyncRead + Unpin,
{
    let mut byte = [0u8; 1];
    match stream.read_exact(&mut byte).await {
        Ok(_) if byte[0] == ACK => Ok(()),
        Ok(_) | Err(_) => Err(ProtocolError::EncryptionFailure(
            constants::ERR_CONFIRMATION_FAILED.into(),
        )),
    }
}
