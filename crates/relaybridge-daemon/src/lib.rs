//! relaybridge daemon library
//!
//! Bridges a relay network to a local worker process:
//! - Worker supervision with NDJSON over stdio
//! - FIFO request queue with a single in-flight item
//! - Relay connection with fixed-delay reconnection
//! - Coordinator routing responses back to their senders

pub mod bridge;
pub mod queue;
pub mod relay;
pub mod subprocess;
