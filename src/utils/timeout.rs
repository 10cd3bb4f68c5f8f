//! Async timeout helpers shared by the connector and the listener.

use crate::error::{ProtocolError, Result};
use std::future::Future;
use std::time::Duration;

/// Default deadline for connect plus handshake on the initiator
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

/// Default deadline for one acceptor handshake
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Run `fut` with a deadline, mapping expiry to `ProtocolError::HandshakeTimeout`.
///
/// The future is dropped on expiry, which closes any stream it owns.
pub async fn with_timeout_error<F, T>(fut: F, duration: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(ProtocolError::HandshakeTimeout),
    }
}
