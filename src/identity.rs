//! Identity generation: ed25519 signing keys, derived x25519 link keys, and
//! x25519 account keys for mail-proxy users.
//!
//! Every role instance gets exactly one [`Identity`]. The link key is not a
//! second secret: it is the x25519 form of the identity's own scalar, so
//! `link_public_key()` is the Montgomery form of `public_key()`. Test clusters
//! only.
//!
//! Key files written by [`Identity::save`]:
//! ```text
//! <data_dir>/
//! ├── identity.private   (32-byte signing key seed, mode 0600)
//! └── identity.public    (32-byte verifying key, mode 0644)
//! ```

use std::{fmt, fs, path::Path, str::FromStr};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use ed25519_dalek::SigningKey;
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use crate::error::ClusterError;

pub const KEY_SIZE: usize = 32;

// ── key newtypes ─────────────────────────────────────────────────────────────

/// A 32-byte public key (ed25519 identity or x25519 link), base64 on the wire.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PublicKey([u8; KEY_SIZE]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Canonical fixed-size encoding, used as the key for set membership.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    pub fn fingerprint(&self) -> String {
        compute_fingerprint(&self.0)
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&STANDARD.encode(self.0))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({self})")
    }
}

impl FromStr for PublicKey {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_key(s).map(Self)
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// A 32-byte secret key, base64 on the wire. Never printed by `Debug`.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretKey([u8; KEY_SIZE]);

impl SecretKey {
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(<redacted>)")
    }
}

impl Serialize for SecretKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(self.0))
    }
}

impl<'de> Deserialize<'de> for SecretKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        decode_key(&text).map(Self).map_err(serde::de::Error::custom)
    }
}

// ── Identity ─────────────────────────────────────────────────────────────────

/// Signing identity of one role instance.
#[derive(Clone)]
pub struct Identity {
    signing_key: SigningKey,
}

impl Identity {
    /// Generate a fresh identity from the OS randomness source.
    pub fn generate() -> Result<Self, ClusterError> {
        let seed = random_bytes()?;
        Ok(Self {
            signing_key: SigningKey::from_bytes(&seed),
        })
    }

    pub fn from_secret(secret: &SecretKey) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(secret.as_bytes()),
        }
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.signing_key.verifying_key().to_bytes())
    }

    pub fn secret_key(&self) -> SecretKey {
        SecretKey(self.signing_key.to_bytes())
    }

    pub fn link_public_key(&self) -> PublicKey {
        PublicKey(X25519PublicKey::from(&self.link_secret()).to_bytes())
    }

    pub fn link_secret_key(&self) -> SecretKey {
        SecretKey(self.link_secret().to_bytes())
    }

    pub fn fingerprint(&self) -> String {
        self.public_key().fingerprint()
    }

    /// Write the key pair into `dir` (which must already exist).
    pub fn save(&self, dir: &Path) -> Result<(), ClusterError> {
        let secret_path = dir.join("identity.private");
        let pub_path = dir.join("identity.public");

        fs::write(&secret_path, self.signing_key.to_bytes())
            .map_err(|e| ClusterError::directory(&secret_path, e))?;
        fs::write(&pub_path, self.public_key().as_bytes())
            .map_err(|e| ClusterError::directory(&pub_path, e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&secret_path, fs::Permissions::from_mode(0o600))
                .map_err(|e| ClusterError::directory(&secret_path, e))?;
            fs::set_permissions(&pub_path, fs::Permissions::from_mode(0o644))
                .map_err(|e| ClusterError::directory(&pub_path, e))?;
        }

        Ok(())
    }

    fn link_secret(&self) -> StaticSecret {
        StaticSecret::from(self.signing_key.to_scalar_bytes())
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("public_key", &self.public_key())
            .finish_non_exhaustive()
    }
}

// ── UserKey ──────────────────────────────────────────────────────────────────

/// x25519 key pair for a mail-proxy account. The same secret serves as both
/// the account's link key and identity key.
#[derive(Clone)]
pub struct UserKey {
    secret: StaticSecret,
}

impl UserKey {
    pub fn generate() -> Result<Self, ClusterError> {
        Ok(Self {
            secret: StaticSecret::from(random_bytes()?),
        })
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(X25519PublicKey::from(&self.secret).to_bytes())
    }

    pub fn secret_key(&self) -> SecretKey {
        SecretKey(self.secret.to_bytes())
    }
}

impl fmt::Debug for UserKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserKey")
            .field("public_key", &self.public_key())
            .finish_non_exhaustive()
    }
}

// ── internals ────────────────────────────────────────────────────────────────

fn random_bytes() -> Result<[u8; KEY_SIZE], ClusterError> {
    let mut bytes = [0u8; KEY_SIZE];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| ClusterError::Crypto(format!("randomness source failed: {e}")))?;
    Ok(bytes)
}

fn decode_key(text: &str) -> Result<[u8; KEY_SIZE], ClusterError> {
    let raw = STANDARD
        .decode(text.trim())
        .map_err(|e| ClusterError::Crypto(format!("key is not valid base64: {e}")))?;
    raw.try_into()
        .map_err(|v: Vec<u8>| ClusterError::Crypto(format!("key is {} bytes, expected {KEY_SIZE}", v.len())))
}

/// First 8 hex chars of `SHA256(key_bytes)`.
pub fn compute_fingerprint(key_bytes: &[u8; KEY_SIZE]) -> String {
    let digest = Sha256::digest(key_bytes);
    hex::encode(digest)[..8].to_string()
}

// ── tests ─────────────────────────────────────────────────────────────────────
