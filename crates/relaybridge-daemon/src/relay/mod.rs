//! Relay connectivity.
//!
//! Maintains the subscription for events addressed to this node, reconnects
//! with a fixed delay, and publishes signed responses.

pub mod config;
pub mod connector;
pub mod error;
pub mod protocol;
pub mod transport;

pub use config::RelaySettings;
pub use connector::{ConnectionState, InboundMessage, RelayConnector};
pub use error::RelayError;
pub use protocol::{ClientMessage, Filter, RelayMessage};
pub use transport::{RelayLink, RelayTransport, WebSocketTransport};
