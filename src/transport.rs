//! Outer packet types and the transport seam
//!
//! The network transport is an external collaborator: it takes one
//! conditional [`Prepare`] at a time and comes back with the far end's
//! [`Fulfill`] or [`Reject`]. How those are serialized and routed across
//! the relay network is entirely its business.

use crate::crypto::CONDITION_LEN;
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Transport closed")]
    Closed,

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// An outbound conditional transfer.
#[derive(Debug, Clone)]
pub struct Prepare {
    /// Amount delivered to the receiving endpoint, in its units.
    pub amount: u64,
    /// Hash whose preimage the receiver must present to take the money.
    pub execution_condition: [u8; CONDITION_LEN],
    /// Encrypted inner packet.
    pub data: Bytes,
}

/// A successful response: the condition's preimage plus an encrypted
/// inner packet.
#[derive(Debug, Clone)]
pub struct Fulfill {
    pub fulfillment: [u8; CONDITION_LEN],
    pub data: Bytes,
}

/// A failed response.
#[derive(Debug, Clone)]
pub struct Reject {
    pub code: RejectCode,
    pub message: String,
    /// For application-level rejects, an encrypted inner packet.
    pub data: Bytes,
}

/// Either outcome of one transfer.
#[derive(Debug, Clone)]
pub enum PacketOutcome {
    Fulfilled(Fulfill),
    Rejected(Reject),
}

/// Three-character reject code, e.g. `F08` or `T01`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RejectCode([u8; 3]);

impl RejectCode {
    /// Amount exceeded the path's maximum packet size.
    pub const PACKET_TOO_LARGE: RejectCode = RejectCode(*b"F08");
    /// Rejected by the receiving application; carries an encrypted inner
    /// packet.
    pub const APPLICATION_ERROR: RejectCode = RejectCode(*b"F99");
    /// Payload was not addressed to this endpoint (or failed to decrypt).
    pub const UNEXPECTED_PAYMENT: RejectCode = RejectCode(*b"F06");
    /// Transient shortage of liquidity along the path.
    pub const INSUFFICIENT_LIQUIDITY: RejectCode = RejectCode(*b"T04");
    /// Generic temporary failure.
    pub const TEMPORARY_FAILURE: RejectCode = RejectCode(*b"T00");

    /// Parse a code; must be one letter-class byte followed by two digits.
    pub fn parse(code: &str) -> Option<RejectCode> {
        let bytes = code.as_bytes();
        if bytes.len() != 3
            || !bytes[0].is_ascii_uppercase()
            || !bytes[1].is_ascii_digit()
            || !bytes[2].is_ascii_digit()
        {
            return None;
        }
        Some(RejectCode([bytes[0], bytes[1], bytes[2]]))
    }

    pub fn as_str(&self) -> &str {
        // Constructed only from validated ASCII.
        std::str::from_utf8(&self.0).unwrap_or("???")
    }

    /// `Txx` — worth retrying after a backoff.
    pub fn is_temporary(&self) -> bool {
        self.0[0] == b'T'
    }

    /// `Fxx` — final; retrying the identical packet cannot succeed.
    pub fn is_final(&self) -> bool {
        self.0[0] == b'F'
    }
}

impl std::fmt::Display for RejectCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body of an F08 reject: how much arrived at the bottleneck and the most
/// it would forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxPacketDetails {
    pub received: u64,
    pub maximum: u64,
}

impl MaxPacketDetails {
    pub const ENCODED_LEN: usize = 16;

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::ENCODED_LEN);
        buf.put_u64(self.received);
        buf.put_u64(self.maximum);
        buf.freeze()
    }

    pub fn from_bytes(mut data: &[u8]) -> Option<MaxPacketDetails> {
        if data.len() < Self::ENCODED_LEN {
            return None;
        }
        Some(MaxPacketDetails {
            received: data.get_u64(),
            maximum: data.get_u64(),
        })
    }
}

/// The send-packet primitive the connection core drives.
///
/// Implementations must be safe to call from the connection's single owner;
/// the core issues one call at a time per connection.
#[async_trait]
pub trait PacketSender: Send {
    async fn send_prepare(&mut self, prepare: Prepare) -> Result<PacketOutcome, TransportError>;
}
