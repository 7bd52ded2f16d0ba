//! Errors returned by the embedded NATS harness.

use crate::harness::State;
use std::io;
use std::time::Duration;

/// Everything that can go wrong while constructing,
/// starting or stopping an [`EmbeddedNats`](crate::EmbeddedNats).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The OS had no free local port to hand out.
    #[error("no free local port available: {0}")]
    PortAllocation(#[source] io::Error),

    /// The server did not report readiness in time. This is also
    /// how a failed bind becomes visible.
    #[error("NATS server on port {port} not ready after {timeout:?}")]
    ServerNotReady { port: u16, timeout: Duration },

    /// The client could not connect although the server was ready.
    #[error("error connecting to NATS server at localhost port {port}: {source}")]
    Connect {
        port: u16,
        #[source]
        source: io::Error,
    },

    /// A lifecycle operation was called in the wrong state.
    #[error("cannot {op} embedded NATS harness in state {state}")]
    InvalidState { op: &'static str, state: State },

    /// The server thread could not be spawned.
    #[error("error spawning embedded NATS server thread: {0}")]
    Spawn(#[source] io::Error),

    /// Unreadable config file or malformed env override.
    #[error("invalid enats config: {0}")]
    Config(String),
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_error_display() {
        let err = Error::Connect {
            port: 4222,
            source: io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
        };
        let msg = err.to_string();
        assert!(msg.contains("4222"), "got: {}", msg);
        assert!(msg.contains("refused"), "got: {}", msg);
    }

    #[test]
    fn test_invalid_state_display() {
        let err = Error::InvalidState {
            op: "stop",
            state: State::Constructed,
        };
        assert_eq!(
            err.to_string(),
            "cannot stop embedded NATS harness in state constructed"
        );
    }
}
