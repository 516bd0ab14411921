//! Signed relay events.
//!
//! Event ids are the SHA-256 of the compact JSON array
//! `[0, pubkey, created_at, kind, tags, content]`; signatures are BIP-340
//! Schnorr over the id bytes.

use k256::schnorr::Signature;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::CryptoError;
use crate::identity::{IdentityKeyPair, parse_public_hex};

/// A signed event as exchanged with the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: String,
}

impl Event {
    /// Values of every tag named `name`, i.e. the second element of each match.
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags.iter().filter_map(move |tag| match tag.as_slice() {
            [tag_name, value, ..] if tag_name == name => Some(value.as_str()),
            _ => None,
        })
    }

    /// Whether the event carries a `p` tag for `pubkey`.
    pub fn is_addressed_to(&self, pubkey: &str) -> bool {
        self.tag_values("p").any(|v| v == pubkey)
    }

    /// Check that the id matches the content and the signature is valid.
    pub fn verify(&self) -> Result<(), CryptoError> {
        let digest = compute_id(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        )?;
        if hex::encode(digest) != self.id {
            return Err(CryptoError::IdMismatch);
        }

        let key = parse_public_hex(&self.pubkey)?;
        let sig_bytes = hex::decode(&self.sig).map_err(|e| CryptoError::InvalidHex(e.to_string()))?;
        let sig = Signature::try_from(sig_bytes.as_slice())
            .map_err(|e| CryptoError::VerificationFailed(e.to_string()))?;
        key.verify_raw(&digest, &sig)
            .map_err(|e| CryptoError::VerificationFailed(e.to_string()))
    }
}

/// An event that has not been signed yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedEvent {
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

impl UnsignedEvent {
    /// New event stamped with the current time.
    pub fn new(kind: u16, content: impl Into<String>) -> Self {
        Self {
            created_at: unix_now(),
            kind,
            tags: Vec::new(),
            content: content.into(),
        }
    }

    /// Append a tag.
    #[must_use]
    pub fn tag<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.push(values.into_iter().map(Into::into).collect());
        self
    }

    /// Compute the id and sign it with `keys`.
    pub fn sign(self, keys: &IdentityKeyPair) -> Result<Event, CryptoError> {
        let pubkey = keys.public_hex();
        let digest = compute_id(&pubkey, self.created_at, self.kind, &self.tags, &self.content)?;
        let sig = keys.sign_digest(&digest)?;
        Ok(Event {
            id: hex::encode(digest),
            pubkey,
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags,
            content: self.content,
            sig: hex::encode(sig.to_bytes()),
        })
    }
}

/// SHA-256 over the canonical serialization of the event fields.
pub fn compute_id(
    pubkey: &str,
    created_at: u64,
    kind: u16,
    tags: &[Vec<String>],
    content: &str,
) -> Result<[u8; 32], CryptoError> {
    let canonical = serde_json::to_string(&(0u8, pubkey, created_at, kind, tags, content))
        .map_err(|e| CryptoError::SerializationError(e.to_string()))?;
    Ok(Sha256::digest(canonical.as_bytes()).into())
}

/// Seconds since the Unix epoch; 0 if the clock is before it.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn signed(keys: &IdentityKeyPair) -> Event {
        UnsignedEvent::new(1573, r#"{"message":"hi"}"#)
            .tag(["s", "0"])
            .tag(["p", "abc"])
            .sign(keys)
            .unwrap()
    }

    #[test]
    fn signed_event_verifies() {
        let keys = IdentityKeyPair::generate();
        let event = signed(&keys);
        assert_eq!(event.pubkey, keys.public_hex());
        assert_eq!(event.id.len(), 64);
        assert_eq!(event.sig.len(), 128);
        event.verify().unwrap();
    }

    #[test]
    fn tampered_content_fails_verification() {
        let keys = IdentityKeyPair::generate();
        let mut event = signed(&keys);
        event.content = "changed".into();
        assert!(matches!(event.verify(), Err(CryptoError::IdMismatch)));
    }

    #[test]
    fn signature_from_other_key_fails() {
        let keys = IdentityKeyPair::generate();
        let other = IdentityKeyPair::generate();
        let mut event = signed(&keys);
        event.sig = signed(&other).sig;
        assert!(matches!(
            event.verify(),
            Err(CryptoError::VerificationFailed(_))
        ));
    }

    #[test]
    fn canonical_serialization_is_compact_array() {
        let tags = vec![vec!["p".to_string(), "abc".to_string()]];
        let canonical = serde_json::to_string(&(0u8, "pk", 10u64, 1u16, &tags, "a\"b")).unwrap();
        assert_eq!(canonical, r#"[0,"pk",10,1,[["p","abc"]],"a\"b"]"#);
    }

    #[test]
    fn tag_helpers() {
        let keys = IdentityKeyPair::generate();
        let event = signed(&keys);
        assert_eq!(event.tag_values("p").collect::<Vec<_>>(), vec!["abc"]);
        assert!(event.is_addressed_to("abc"));
        assert!(!event.is_addressed_to("def"));
    }

    #[test]
    fn event_json_field_names() {
        let keys = IdentityKeyPair::generate();
        let value = serde_json::to_value(signed(&keys)).unwrap();
        for field in ["id", "pubkey", "created_at", "kind", "tags", "content", "sig"] {
            assert!(value.get(field).is_some(), "missing {field}");
        }
    }
}
