//! relaybridge core library
//!
//! Shared functionality for the relaybridge daemon:
//! - NDJSON framing and envelopes for the worker stdio protocol
//! - Configuration resolution and hierarchy
//! - Tracing initialization
//! - Common error types

pub mod config;
pub mod error;
pub mod ndjson;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, Result};
