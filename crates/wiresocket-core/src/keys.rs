//! WireGuard key handling
//!
//! Curve25519 keypair generation and the base64 encoding WireGuard
//! tooling expects everywhere on the wire.

use crate::error::{CoreError, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use x25519_dalek::{PublicKey, StaticSecret};

/// A WireGuard keypair, base64-encoded.
#[derive(Debug, Clone)]
pub struct KeyPair {
    pub private_key: String,
    pub public_key: String,
}

impl KeyPair {
    /// Generate a fresh Curve25519 keypair.
    pub fn generate() -> Self {
        let private = StaticSecret::random_from_rng(rand::thread_rng());
        let public = PublicKey::from(&private);
        Self {
            private_key: BASE64.encode(private.as_bytes()),
            public_key: BASE64.encode(public.as_bytes()),
        }
    }
}

/// Derive the base64 public key for a base64 private key.
pub fn public_from_private(private_key: &str) -> Result<String> {
    let secret = StaticSecret::from(decode_key(private_key)?);
    let public = PublicKey::from(&secret);
    Ok(BASE64.encode(public.as_bytes()))
}

/// Decode a base64 WireGuard key into raw bytes.
pub fn decode_key(key: &str) -> Result<[u8; 32]> {
    let bytes = BASE64
        .decode(key.trim())
        .map_err(|_| CoreError::InvalidConfig(format!("invalid base64 key: {key:.8}...")))?;
    bytes
        .try_into()
        .map_err(|_| CoreError::InvalidConfig("key must be 32 bytes".into()))
}

/// Encode raw key bytes as base64.
pub fn encode_key(key: &[u8; 32]) -> String {
    BASE64.encode(key)
}
