//! Sub-key derivation
//!
//! One shared secret fans out into three independent 32-byte keys via
//! HKDF-SHA256. No key material ever crosses the wire: both endpoints run
//! this same derivation, and agreeing on the secret means agreeing on
//! every key.

use super::{CryptoError, KEY_LEN, MIN_SECRET_LEN};
use ring::hkdf::{Prk, Salt, HKDF_SHA256};

/// The three sub-keys derived from one shared secret. Both endpoints run
/// the same derivation, so the keys agree without any in-band negotiation.
pub struct PacketKeys {
    /// AEAD key for sealing and opening inner packets.
    pub encryption: [u8; KEY_LEN],
    /// PRF key for computing fulfillments over ciphertexts.
    pub fulfillment: [u8; KEY_LEN],
    /// Reserved for deterministic padding schemes.
    pub padding: [u8; KEY_LEN],
}

/// Derive the per-connection sub-keys from the shared secret.
///
/// Secrets shorter than [`MIN_SECRET_LEN`] are refused outright rather
/// than stretched.
pub fn derive_packet_keys(shared_secret: &[u8]) -> Result<PacketKeys, CryptoError> {
    if shared_secret.len() < MIN_SECRET_LEN {
        return Err(CryptoError::SecretTooShort(shared_secret.len()));
    }

    // Zero salt: the secret is already uniformly random, the salt adds
    // nothing and would have to be agreed upon out of band.
    let prk = Salt::new(HKDF_SHA256, &[0u8; 32]).extract(shared_secret);

    Ok(PacketKeys {
        encryption: expand_label(&prk, b"paystream_encryption")?,
        fulfillment: expand_label(&prk, b"paystream_fulfillment")?,
        padding: expand_label(&prk, b"paystream_padding")?,
    })
}

// HKDF_SHA256 itself serves as the output-length marker: its digest size
// is exactly one sub-key.
fn expand_label(prk: &Prk, label: &[u8]) -> Result<[u8; KEY_LEN], CryptoError> {
    let mut key = [0u8; KEY_LEN];
    prk.expand(&[label], HKDF_SHA256)
        .and_then(|okm| okm.fill(&mut key))
        .map_err(|_| {
            CryptoError::KeyDerivation(format!(
                "sub-key expansion failed for label {:?}",
                String::from_utf8_lossy(label)
            ))
        })?;
    Ok(key)
}
