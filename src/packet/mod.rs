//! Inner packet codec
//!
//! The inner packet is the plaintext that travels authenticated-encrypted
//! inside every transport packet:
//!
//! ```text
//! Packet := sequence (var-uint, ≥1) ∥ type (u8) ∥ prepare-amount (var-uint) ∥
//!           frame-count (var-uint) ∥ frame*
//! ```
//!
//! Serialization is symmetric: round-tripping any valid packet yields
//! byte-identical output. Bytes after the declared frames (zero padding
//! added before encryption) are ignored on decode.

mod frame;
mod varint;

pub use frame::{ErrorCode, Frame, FrameType};
pub use varint::{get_var_uint, put_var_uint, var_uint_len};

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Unexpected end of input")]
    UnexpectedEof,

    #[error("Invalid var-uint encoding")]
    InvalidVarUint,

    #[error("Invalid UTF-8 in string field")]
    InvalidUtf8,

    #[error("Unknown packet type: {0}")]
    UnknownPacketType(u8),
}

/// Role of a packet within the conditional-transfer exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Prepare = 12,
    Fulfill = 13,
    Reject = 14,
}

impl PacketType {
    fn from_u8(value: u8) -> Result<PacketType, CodecError> {
        match value {
            12 => Ok(PacketType::Prepare),
            13 => Ok(PacketType::Fulfill),
            14 => Ok(PacketType::Reject),
            other => Err(CodecError::UnknownPacketType(other)),
        }
    }
}

/// One inner packet: a sequence number, its transfer role, the minimum (for
/// Prepare) or actual (for responses) destination amount, and its frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub sequence: u64,
    pub packet_type: PacketType,
    pub prepare_amount: u64,
    pub frames: Vec<Frame>,
}

impl Packet {
    pub fn new(sequence: u64, packet_type: PacketType, prepare_amount: u64) -> Packet {
        Packet {
            sequence,
            packet_type,
            prepare_amount,
            frames: Vec::new(),
        }
    }

    /// Encoded size in bytes.
    pub fn encoded_len(&self) -> usize {
        var_uint_len(self.sequence)
            + 1
            + var_uint_len(self.prepare_amount)
            + var_uint_len(self.frames.len() as u64)
            + self.frames.iter().map(Frame::encoded_len).sum::<usize>()
    }

    /// Serialize to the wire form.
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        put_var_uint(&mut buf, self.sequence);
        buf.put_u8(self.packet_type as u8);
        put_var_uint(&mut buf, self.prepare_amount);
        put_var_uint(&mut buf, self.frames.len() as u64);
        for frame in &self.frames {
            frame.encode(&mut buf);
        }
        buf
    }

    /// Parse a packet, skipping unknown frame types and ignoring trailing
    /// padding.
    pub fn decode(plaintext: &[u8]) -> Result<Packet, CodecError> {
        let mut buf = BytesMut::from(plaintext);

        let sequence = get_var_uint(&mut buf)?;
        if buf.remaining() < 1 {
            return Err(CodecError::UnexpectedEof);
        }
        let packet_type = PacketType::from_u8(buf.get_u8())?;
        let prepare_amount = get_var_uint(&mut buf)?;
        let frame_count = get_var_uint(&mut buf)?;

        let mut frames = Vec::with_capacity(frame_count.min(64) as usize);
        for _ in 0..frame_count {
            if let Some(frame) = Frame::decode(&mut buf)? {
                frames.push(frame);
            }
        }

        Ok(Packet {
            sequence,
            packet_type,
            prepare_amount,
            frames,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn sample() -> Packet {
        let mut packet = Packet::new(7, PacketType::Prepare, 1000);
        packet.frames.push(Frame::StreamMoney {
            stream_id: 1,
            shares: 400,
        });
        packet.frames.push(Frame::StreamData {
            stream_id: 1,
            offset: 0,
            data: Bytes::from_static(b"hello stream"),
        });
        packet.frames.push(Frame::StreamMaxMoney {
            stream_id: 2,
            receive_max: 9999,
            total_received: 12,
        });
        packet
    }

    #[test]
    fn roundtrip_is_byte_identical() {
        let packet = sample();
        let encoded = packet.encode();
        let decoded = Packet::decode(&encoded).unwrap();
        assert_eq!(decoded, packet);
        assert_eq!(decoded.encode(), encoded);
        assert_eq!(encoded.len(), packet.encoded_len());
    }

    #[test]
    fn trailing_padding_ignored() {
        let packet = sample();
        let mut padded = packet.encode();
        padded.resize(padded.len() + 512, 0);
        let decoded = Packet::decode(&padded).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn bad_packet_type_rejected() {
        let mut encoded = sample().encode();
        // sequence 7 encodes as two bytes; the type byte follows.
        encoded[2] = 99;
        assert!(matches!(
            Packet::decode(&encoded),
            Err(CodecError::UnknownPacketType(99))
        ));
    }

    #[test]
    fn truncation_rejected() {
        let encoded = sample().encode();
        assert!(Packet::decode(&encoded[..encoded.len() - 4]).is_err());
        assert!(Packet::decode(&[]).is_err());
    }

    #[test]
    fn empty_packet_roundtrip() {
        let packet = Packet::new(1, PacketType::Fulfill, 0);
        let decoded = Packet::decode(&packet.encode()).unwrap();
        assert_eq!(decoded, packet);
        assert!(decoded.frames.is_empty());
    }
}
