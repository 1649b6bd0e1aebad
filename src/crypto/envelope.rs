//! Authenticated encryption envelope for inner packets
//!
//! Every inner packet travels as `nonce ∥ ciphertext ∥ tag` inside the
//! transport payload. The fulfillment of a packet is the HMAC of its whole
//! wire ciphertext under the fulfillment sub-key, and the execution condition
//! is the SHA-256 digest of that fulfillment. The receiving endpoint can
//! therefore recompute the fulfillment from the bytes it was handed, without
//! any per-packet state.

use super::kdf::derive_packet_keys;
use super::{random_bytes, CryptoError, CONDITION_LEN, NONCE_LEN, TAG_LEN};
use bytes::{BufMut, Bytes, BytesMut};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, CHACHA20_POLY1305};
use ring::digest;
use ring::hmac;

/// Per-connection packet sealing, opening, and fulfillment derivation.
pub struct PacketCrypto {
    sealing_key: LessSafeKey,
    fulfillment_key: hmac::Key,
}

impl PacketCrypto {
    /// Derive the packet crypto context from a shared secret.
    pub fn new(shared_secret: &[u8]) -> Result<Self, CryptoError> {
        let keys = derive_packet_keys(shared_secret)?;

        let unbound = UnboundKey::new(&CHACHA20_POLY1305, &keys.encryption)
            .map_err(|_| CryptoError::InvalidKeyLength)?;

        Ok(Self {
            sealing_key: LessSafeKey::new(unbound),
            fulfillment_key: hmac::Key::new(hmac::HMAC_SHA256, &keys.fulfillment),
        })
    }

    /// Encrypt a plaintext, producing the self-contained wire form
    /// `nonce ∥ ciphertext ∥ tag`.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Bytes, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        random_bytes(&mut nonce_bytes);
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let mut buffer = plaintext.to_vec();
        self.sealing_key
            .seal_in_place_append_tag(nonce, Aad::empty(), &mut buffer)
            .map_err(|_| CryptoError::Encryption("seal failed".to_string()))?;

        let mut wire = BytesMut::with_capacity(NONCE_LEN + buffer.len());
        wire.put_slice(&nonce_bytes);
        wire.put_slice(&buffer);
        Ok(wire.freeze())
    }

    /// Decrypt a wire-form ciphertext, verifying its tag.
    pub fn open(&self, wire: &[u8]) -> Result<Bytes, CryptoError> {
        if wire.len() < NONCE_LEN + TAG_LEN {
            return Err(CryptoError::Decryption);
        }

        let mut nonce_bytes = [0u8; NONCE_LEN];
        nonce_bytes.copy_from_slice(&wire[..NONCE_LEN]);
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let mut buffer = wire[NONCE_LEN..].to_vec();
        let plaintext = self
            .sealing_key
            .open_in_place(nonce, Aad::empty(), &mut buffer)
            .map_err(|_| CryptoError::Decryption)?;

        Ok(Bytes::copy_from_slice(plaintext))
    }

    /// The fulfillment for a packet: `HMAC-SHA256(fulfillment_key, wire)`.
    pub fn fulfillment(&self, wire_ciphertext: &[u8]) -> [u8; CONDITION_LEN] {
        let tag = hmac::sign(&self.fulfillment_key, wire_ciphertext);
        let mut fulfillment = [0u8; CONDITION_LEN];
        fulfillment.copy_from_slice(tag.as_ref());
        fulfillment
    }

    /// The execution condition that a given fulfillment satisfies.
    pub fn condition(fulfillment: &[u8; CONDITION_LEN]) -> [u8; CONDITION_LEN] {
        let digest = digest::digest(&digest::SHA256, fulfillment);
        let mut condition = [0u8; CONDITION_LEN];
        condition.copy_from_slice(digest.as_ref());
        condition
    }

    /// The execution condition for a packet this endpoint is about to send.
    pub fn condition_for(&self, wire_ciphertext: &[u8]) -> [u8; CONDITION_LEN] {
        Self::condition(&self.fulfillment(wire_ciphertext))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn crypto() -> PacketCrypto {
        PacketCrypto::new(&[7u8; 32]).unwrap()
    }

    #[test]
    fn seal_open_roundtrip() {
        let c = crypto();
        let plaintext = b"forty-two tokens and some bytes";

        let wire = c.seal(plaintext).unwrap();
        assert_ne!(&wire[NONCE_LEN..], plaintext.as_slice());

        let opened = c.open(&wire).unwrap();
        assert_eq!(&opened[..], plaintext);
    }

    #[test]
    fn both_endpoints_agree() {
        let sender = PacketCrypto::new(&[9u8; 32]).unwrap();
        let receiver = PacketCrypto::new(&[9u8; 32]).unwrap();

        let wire = sender.seal(b"payload").unwrap();
        assert_eq!(&receiver.open(&wire).unwrap()[..], b"payload");
        assert_eq!(sender.fulfillment(&wire), receiver.fulfillment(&wire));
    }

    #[test]
    fn tamper_detection() {
        let c = crypto();
        let mut wire = c.seal(b"honest bytes").unwrap().to_vec();
        wire[NONCE_LEN] ^= 0xFF;
        assert!(matches!(c.open(&wire), Err(CryptoError::Decryption)));
    }

    #[test]
    fn truncated_wire_rejected() {
        let c = crypto();
        assert!(c.open(&[0u8; NONCE_LEN + TAG_LEN - 1]).is_err());
    }

    #[test]
    fn condition_matches_fulfillment() {
        let c = crypto();
        let wire = c.seal(b"x").unwrap();

        let fulfillment = c.fulfillment(&wire);
        let condition = PacketCrypto::condition(&fulfillment);
        assert_eq!(condition, c.condition_for(&wire));

        // A different ciphertext yields a different fulfillment.
        let other = c.seal(b"y").unwrap();
        assert_ne!(c.fulfillment(&other), fulfillment);
    }
}
