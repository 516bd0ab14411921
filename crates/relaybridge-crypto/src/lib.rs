//! Relay identity and event signing.
//!
//! ## Primitives
//!
//! - **Identity**: one secp256k1 keypair per bridge, addressed by its hex x-only public key
//! - **Events**: SHA-256 id over the canonical field array, BIP-340 Schnorr signature over the id

pub mod error;
pub mod event;
pub mod identity;

pub use error::CryptoError;
pub use event::{Event, UnsignedEvent, compute_id, unix_now};
pub use identity::{IdentityKeyPair, KEY_SIZE, parse_public_hex};
