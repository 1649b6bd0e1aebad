//! # paystream
//!
//! Connection core for a payment-and-data streaming protocol layered over a
//! hop-by-hop conditional-transfer packet network. A single shared secret
//! carries many logical bidirectional streams, each moving both fungible
//! value and ordered byte-data.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 Application Layer                    │
//! │        (open streams, send money, read bytes)        │
//! ├─────────────────────────────────────────────────────┤
//! │                 Connection Layer                     │
//! │   (send loop, rate discovery, flow control, close)   │
//! ├─────────────────────────────────────────────────────┤
//! │                  Packet Layer                        │
//! │      (typed frames, authenticated encryption)        │
//! ├─────────────────────────────────────────────────────┤
//! │                Transport Layer (external)            │
//! │      (conditional Prepare / Fulfill / Reject)        │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! The transport itself is an external collaborator consumed through the
//! [`transport::PacketSender`] trait: it delivers one opaque amount-bearing
//! packet at a time and returns the far end's fulfillment or rejection.

pub mod config;
pub mod connection;
pub mod crypto;
pub mod packet;
pub mod rate;
pub mod stream;
pub mod transport;

pub use config::ConnectionConfig;
pub use connection::{Connection, ConnectionError, ConnectionEvent, Role};
pub use rate::Rate;
pub use stream::StreamId;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Maximum plaintext size of one inner packet (frames included), in bytes.
pub const MAX_DATA_SIZE: usize = 32767;

/// Default per-direction connection data window in bytes.
pub const DEFAULT_BUFFER_SIZE: u64 = 65534;

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error("Codec error: {0}")]
    Codec(#[from] packet::CodecError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Stream error: {0}")]
    Stream(#[from] stream::StreamError),

    #[error("Connection error: {0}")]
    Connection(#[from] connection::ConnectionError),

    #[error("Configuration error: {0}")]
    Config(String),
}
