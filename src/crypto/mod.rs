//! Cryptographic primitives for the packet envelope
//!
//! This module provides:
//! - HKDF-SHA256 sub-key derivation from the shared secret
//! - ChaCha20-Poly1305 AEAD packet encryption
//! - HMAC-SHA256 fulfillment generation and SHA-256 conditions
//! - Secure random number generation

mod envelope;
mod kdf;

pub use envelope::PacketCrypto;
pub use kdf::{derive_packet_keys, PacketKeys};

use thiserror::Error;

/// Length of a symmetric key in bytes.
pub const KEY_LEN: usize = 32;

/// Length of an AEAD nonce in bytes.
pub const NONCE_LEN: usize = 12;

/// Length of an AEAD authentication tag in bytes.
pub const TAG_LEN: usize = 16;

/// Length of a fulfillment and of its condition digest, in bytes.
pub const CONDITION_LEN: usize = 32;

/// Minimum length of the shared secret in bytes.
pub const MIN_SECRET_LEN: usize = 32;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Shared secret too short: {0} < {MIN_SECRET_LEN} bytes")]
    SecretTooShort(usize),

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed")]
    Decryption,

    #[error("Invalid key length")]
    InvalidKeyLength,
}

/// Generate cryptographically secure random bytes.
pub fn random_bytes(buf: &mut [u8]) {
    use ring::rand::{SecureRandom, SystemRandom};
    let rng = SystemRandom::new();
    rng.fill(buf).expect("Failed to generate random bytes");
}

/// A random 32-byte condition with no known preimage, for unfulfillable
/// test packets.
pub fn random_condition() -> [u8; CONDITION_LEN] {
    let mut condition = [0u8; CONDITION_LEN];
    random_bytes(&mut condition);
    condition
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_bytes() {
        let mut buf1 = [0u8; 32];
        let mut buf2 = [0u8; 32];
        random_bytes(&mut buf1);
        random_bytes(&mut buf2);
        assert_ne!(buf1, buf2);
    }

    #[test]
    fn test_random_conditions_differ() {
        assert_ne!(random_condition(), random_condition());
    }
}
