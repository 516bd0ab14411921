//! Relay connector error types.

use std::time::Duration;

use relaybridge_crypto::CryptoError;

/// Errors that can occur talking to the relay.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Not connected to relay")]
    NotConnected,

    #[error("Relay connector is shut down")]
    ShutDown,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Event rejected by relay: {0}")]
    Rejected(String),

    #[error("No acknowledgement from relay within {0:?}")]
    Timeout(Duration),

    #[error("Signing error: {0}")]
    Signing(#[from] CryptoError),
}
