//! Connection lifecycle states.

use std::fmt;

/// Where a connection is in its lifecycle.
///
/// ```text
/// Disconnected -> Initializing -> (Authenticating) -> Connected
///       ^______________|_______________|________________|
/// ```
/// `Authenticating` is only entered when the acceptor negotiated encryption.
/// Any failure or explicit disconnect returns to `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Initializing,
    Authenticating,
    Connected,
}

impl ConnectionState {
    /// Whether a connect or accept attempt may start from this state
    pub fn can_start(self) -> bool {
        self == ConnectionState::Disconnected
    }

    /// Whether the handshake is running
    pub fn is_handshaking(self) -> bool {
        matches!(
            self,
            ConnectionState::Initializing | ConnectionState::Authenticating
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Initializing => "initializing",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Connected => "connected",
        };
        f.write_str(name)
    }
}

/// Which side of the handshake an endpoint plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Connects out and sends the magic header
    Initiator,
    /// Accepted by a listener; decides the connection options
    Acceptor,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Initiator => f.write_str("initiator"),
            Role::Acceptor => f.write_str("acceptor"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_disconnected_can_start() {
        assert!(ConnectionState::default().can_start());
        assert!(!ConnectionState::Initializing.can_start());
        assert!(!ConnectionState::Connected.can_start());
        assert!(ConnectionState::Authenticating.is_handshaking());
        assert!(!ConnectionState::Connected.is_handshaking());
    }
}
