//! Canonical variable-length unsigned integers.
//!
//! Wire form: one length byte (1..=8) followed by that many big-endian
//! bytes. The length is always minimal, so every value has exactly one
//! encoding and packet round-trips are byte-identical. Zero encodes as
//! `01 00`.

use super::CodecError;
use bytes::{Buf, BufMut};

/// Number of bytes the value part of `value` occupies (1..=8).
const fn byte_len(value: u64) -> usize {
    if value == 0 {
        1
    } else {
        ((64 - value.leading_zeros() as usize) + 7) / 8
    }
}

/// Total encoded size of `value`, length prefix included.
pub const fn var_uint_len(value: u64) -> usize {
    1 + byte_len(value)
}

/// Append the canonical encoding of `value`.
pub fn put_var_uint<B: BufMut>(buf: &mut B, value: u64) {
    let len = byte_len(value);
    buf.put_u8(len as u8);
    buf.put_slice(&value.to_be_bytes()[8 - len..]);
}

/// Read one var-uint, rejecting non-canonical or truncated encodings.
pub fn get_var_uint<B: Buf>(buf: &mut B) -> Result<u64, CodecError> {
    if buf.remaining() < 1 {
        return Err(CodecError::UnexpectedEof);
    }
    let len = buf.get_u8() as usize;
    if len == 0 || len > 8 {
        return Err(CodecError::InvalidVarUint);
    }
    if buf.remaining() < len {
        return Err(CodecError::UnexpectedEof);
    }

    let mut bytes = [0u8; 8];
    buf.copy_to_slice(&mut bytes[8 - len..]);
    let value = u64::from_be_bytes(bytes);

    // Minimal-length rule: a multi-byte encoding may not lead with zero.
    if len > 1 && bytes[8 - len] == 0 {
        return Err(CodecError::InvalidVarUint);
    }
    Ok(value)
}

/// Total encoded size of a length-prefixed byte string.
pub fn var_bytes_len(bytes: &[u8]) -> usize {
    var_uint_len(bytes.len() as u64) + bytes.len()
}

/// Append a length-prefixed byte string.
pub fn put_var_bytes<B: BufMut>(buf: &mut B, bytes: &[u8]) {
    put_var_uint(buf, bytes.len() as u64);
    buf.put_slice(bytes);
}

/// Read a length-prefixed byte string.
pub fn get_var_bytes<B: Buf>(buf: &mut B) -> Result<bytes::Bytes, CodecError> {
    let len = get_var_uint(buf)? as usize;
    if buf.remaining() < len {
        return Err(CodecError::UnexpectedEof);
    }
    Ok(buf.copy_to_bytes(len))
}

/// Read a length-prefixed UTF-8 string.
pub fn get_var_str<B: Buf>(buf: &mut B) -> Result<String, CodecError> {
    let bytes = get_var_bytes(buf)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidUtf8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn encode(value: u64) -> Vec<u8> {
        let mut buf = BytesMut::new();
        put_var_uint(&mut buf, value);
        buf.to_vec()
    }

    #[test]
    fn encoding() {
        assert_eq!(encode(0), [0x01, 0x00]);
        assert_eq!(encode(1), [0x01, 0x01]);
        assert_eq!(encode(255), [0x01, 0xFF]);
        assert_eq!(encode(256), [0x02, 0x01, 0x00]);
        assert_eq!(encode(65535), [0x02, 0xFF, 0xFF]);
        assert_eq!(
            encode(u64::MAX),
            [0x08, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]
        );
    }

    #[test]
    fn decoding_roundtrip() {
        for value in [0u64, 1, 127, 128, 255, 256, 65535, 65536, 1 << 40, u64::MAX] {
            let encoded = encode(value);
            assert_eq!(encoded.len(), var_uint_len(value));
            let mut slice = &encoded[..];
            assert_eq!(get_var_uint(&mut slice).unwrap(), value);
            assert!(slice.is_empty());
        }
    }

    #[test]
    fn non_canonical_rejected() {
        // 1 encoded with a leading zero byte.
        let mut slice: &[u8] = &[0x02, 0x00, 0x01];
        assert!(matches!(
            get_var_uint(&mut slice),
            Err(CodecError::InvalidVarUint)
        ));
    }

    #[test]
    fn oversized_length_rejected() {
        let mut slice: &[u8] = &[0x09, 0, 0, 0, 0, 0, 0, 0, 0, 1];
        assert!(get_var_uint(&mut slice).is_err());
        let mut slice: &[u8] = &[0x00];
        assert!(get_var_uint(&mut slice).is_err());
    }

    #[test]
    fn truncated_rejected() {
        let mut slice: &[u8] = &[0x04, 0x01, 0x02];
        assert!(matches!(
            get_var_uint(&mut slice),
            Err(CodecError::UnexpectedEof)
        ));
    }

    #[test]
    fn var_bytes_roundtrip() {
        let mut buf = BytesMut::new();
        put_var_bytes(&mut buf, b"hello");
        assert_eq!(buf.len(), var_bytes_len(b"hello"));
        let mut slice = &buf[..];
        assert_eq!(&get_var_bytes(&mut slice).unwrap()[..], b"hello");
    }

    #[test]
    fn var_str_rejects_bad_utf8() {
        let mut buf = BytesMut::new();
        put_var_bytes(&mut buf, &[0xFF, 0xFE]);
        let mut slice = &buf[..];
        assert!(matches!(
            get_var_str(&mut slice),
            Err(CodecError::InvalidUtf8)
        ));
    }
}
