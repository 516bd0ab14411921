//! Bridge between relay requests and the worker.
//!
//! - **payload**: relay event content in both directions
//! - **publisher**: signed response events
//! - **coordinator**: queue ownership, dispatch and response routing

mod coordinator;
mod payload;
mod publisher;

pub use coordinator::{BridgeCoordinator, BridgeSettings, BridgeStatus, WorkerSink};
pub use payload::{EMPTY_MESSAGE, RESPONSE_TYPE, inbound_message_text, response_content};
pub use publisher::{RelayPublisher, ResponsePublisher};
