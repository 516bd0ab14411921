//! Relay identity keypair management.
//!
//! The bridge has one long-lived secp256k1 keypair. Its x-only public key,
//! hex-encoded, is the identity other peers address messages to; the secret
//! key signs every published event (BIP-340 Schnorr).

use std::path::Path;

use k256::schnorr::{Signature, SigningKey, VerifyingKey};
use rand::RngCore;
use rand::rngs::OsRng;
use zeroize::Zeroize;

use crate::error::CryptoError;

/// Length of a raw secret key and of an x-only public key.
pub const KEY_SIZE: usize = 32;

/// A secp256k1 identity keypair.
pub struct IdentityKeyPair {
    secret: SigningKey,
}

impl std::fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("public", &self.public_hex())
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

impl IdentityKeyPair {
    /// Generate a new random identity keypair.
    pub fn generate() -> Self {
        Self {
            secret: SigningKey::random(&mut OsRng),
        }
    }

    /// Reconstruct from raw 32-byte secret key bytes.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: bytes.len(),
            });
        }
        let secret =
            SigningKey::from_bytes(bytes).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Ok(Self { secret })
    }

    /// Reconstruct from a hex-encoded secret key.
    pub fn from_secret_hex(hex_key: &str) -> Result<Self, CryptoError> {
        let mut bytes =
            hex::decode(hex_key.trim()).map_err(|e| CryptoError::InvalidHex(e.to_string()))?;
        let result = Self::from_secret_bytes(&bytes);
        bytes.zeroize();
        result
    }

    /// Get the verifying (public) key.
    pub fn public_key(&self) -> &VerifyingKey {
        self.secret.verifying_key()
    }

    /// Get the x-only public key as raw bytes.
    pub fn public_bytes(&self) -> [u8; KEY_SIZE] {
        self.public_key().to_bytes().into()
    }

    /// Hex-encoded public key: the identity peers address messages to.
    pub fn public_hex(&self) -> String {
        hex::encode(self.public_bytes())
    }

    /// Get the secret key as raw bytes. Handle with care.
    pub fn secret_bytes(&self) -> [u8; KEY_SIZE] {
        self.secret.to_bytes().into()
    }

    /// Sign a 32-byte digest with fresh auxiliary randomness.
    pub fn sign_digest(&self, digest: &[u8; 32]) -> Result<Signature, CryptoError> {
        let mut aux = [0u8; 32];
        OsRng.fill_bytes(&mut aux);
        self.secret
            .sign_raw(digest, &aux)
            .map_err(|e| CryptoError::SigningFailed(e.to_string()))
    }

    /// Save the secret key to a file with restrictive permissions.
    pub fn save_to_file(&self, path: &Path) -> Result<(), CryptoError> {
        let dir = path.parent().ok_or_else(|| {
            CryptoError::IoError(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "path has no parent directory",
            ))
        })?;
        std::fs::create_dir_all(dir)?;

        let mut bytes = self.secret_bytes();
        std::fs::write(path, bytes)?;
        bytes.zeroize();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        Ok(())
    }

    /// Load a keypair from a file containing the 32-byte secret key.
    ///
    /// On Unix, verifies file permissions are 0600 (owner-only) before reading.
    pub fn load_from_file(path: &Path) -> Result<Self, CryptoError> {
        use std::io::Read;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let metadata = std::fs::metadata(path)?;
            let mode = metadata.permissions().mode() & 0o777;
            if mode != 0o600 {
                return Err(CryptoError::IoError(std::io::Error::new(
                    std::io::ErrorKind::PermissionDenied,
                    format!("Identity key file has insecure permissions: {mode:o} (expected 600)"),
                )));
            }
        }

        let mut file = std::fs::File::open(path)?;
        let mut buf = [0u8; KEY_SIZE];
        file.read_exact(&mut buf)?;
        let result = Self::from_secret_bytes(&buf);
        buf.zeroize();
        result
    }

    /// Load from file, or generate a new keypair and save it.
    pub fn load_or_generate(path: &Path) -> Result<Self, CryptoError> {
        if path.exists() {
            Self::load_from_file(path)
        } else {
            let kp = Self::generate();
            kp.save_to_file(path)?;
            Ok(kp)
        }
    }
}

/// Check that `hex_key` is a valid x-only public key.
pub fn parse_public_hex(hex_key: &str) -> Result<VerifyingKey, CryptoError> {
    let bytes = hex::decode(hex_key).map_err(|e| CryptoError::InvalidHex(e.to_string()))?;
    if bytes.len() != KEY_SIZE {
        return Err(CryptoError::InvalidKeyLength {
            expected: KEY_SIZE,
            actual: bytes.len(),
        });
    }
    VerifyingKey::from_bytes(&bytes).map_err(|e| CryptoError::InvalidKey(e.to_string()))
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn generate_and_save_keypair() -> (tempfile::TempDir, std::path::PathBuf, IdentityKeyPair) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("identity.key");
        let kp = IdentityKeyPair::generate();
        kp.save_to_file(&path).unwrap();
        (dir, path, kp)
    }

    #[test]
    fn secret_bytes_roundtrip() {
        let kp = IdentityKeyPair::generate();
        let kp2 = IdentityKeyPair::from_secret_bytes(&kp.secret_bytes()).unwrap();
        assert_eq!(kp2.public_bytes(), kp.public_bytes());
    }

    #[test]
    fn from_secret_hex_matches_bytes() {
        let kp = IdentityKeyPair::generate();
        let hex_key = hex::encode(kp.secret_bytes());
        let kp2 = IdentityKeyPair::from_secret_hex(&hex_key).unwrap();
        assert_eq!(kp2.public_hex(), kp.public_hex());
    }

    #[test]
    fn public_hex_is_64_lowercase_chars() {
        let hex_key = IdentityKeyPair::generate().public_hex();
        assert_eq!(hex_key.len(), 64);
        assert!(hex_key.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn from_secret_bytes_rejects_wrong_length() {
        let err = IdentityKeyPair::from_secret_bytes(&[1u8; 16]).unwrap_err();
        assert!(matches!(
            err,
            CryptoError::InvalidKeyLength {
                expected: 32,
                actual: 16
            }
        ));
    }

    #[test]
    fn zero_secret_is_rejected() {
        assert!(IdentityKeyPair::from_secret_bytes(&[0u8; 32]).is_err());
    }

    #[test]
    fn from_secret_hex_rejects_garbage() {
        let err = IdentityKeyPair::from_secret_hex("not-hex").unwrap_err();
        assert!(matches!(err, CryptoError::InvalidHex(_)));
    }

    #[test]
    fn save_and_load_identity_key() {
        let (_dir, path, kp) = generate_and_save_keypair();
        let loaded = IdentityKeyPair::load_from_file(&path).unwrap();
        assert_eq!(loaded.public_bytes(), kp.public_bytes());
    }

    #[test]
    fn load_nonexistent_generates_new() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.key");

        let kp = IdentityKeyPair::load_or_generate(&path).unwrap();
        assert!(path.exists());

        let kp2 = IdentityKeyPair::load_or_generate(&path).unwrap();
        assert_eq!(kp.public_bytes(), kp2.public_bytes());
    }

    #[cfg(unix)]
    #[test]
    fn load_rejects_world_readable_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let (_dir, path, _kp) = generate_and_save_keypair();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        assert!(IdentityKeyPair::load_from_file(&path).is_err());
    }

    #[test]
    fn debug_impl_redacts_secret() {
        let kp = IdentityKeyPair::generate();
        let debug_output = format!("{kp:?}");
        assert!(debug_output.contains("[REDACTED]"));
        assert!(!debug_output.contains(&hex::encode(kp.secret_bytes())));
    }

    #[test]
    fn parse_public_hex_accepts_own_key() {
        let kp = IdentityKeyPair::generate();
        let parsed = parse_public_hex(&kp.public_hex()).unwrap();
        assert_eq!(parsed.to_bytes(), kp.public_key().to_bytes());
    }

    #[test]
    fn parse_public_hex_rejects_short_key() {
        assert!(parse_public_hex("abcd").is_err());
    }
}
