// Wire-level building blocks for the gridpulse streaming protocol.
pub mod cache;
pub mod commands;
pub mod encoding;
pub mod framing;
pub mod measurement;
pub mod settings;
pub mod ticks;
pub mod tssc;

pub use cache::SignalIndexCache;
pub use encoding::TextEncoding;
pub use framing::ResponseFrame;
pub use measurement::{CompactMeasurement, Measurement};
pub use tssc::{TsscDecoder, TsscEncoder};

/// Largest measurement payload a single data packet may carry.
pub const MAX_PACKET_SIZE: usize = 32768;

/// Size of the big-endian length prefix on every command-channel frame.
pub const PAYLOAD_HEADER_SIZE: usize = 4;

/// Response code plus original command code.
pub const RESPONSE_HEADER_SIZE: usize = 2;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("incomplete frame")]
    Incomplete,
    #[error("frame too large")]
    FrameTooLarge,
    #[error("invalid string payload: {0}")]
    InvalidString(String),
    #[error("malformed signal index cache: {0}")]
    MalformedCache(String),
    #[error("malformed data packet: {0}")]
    MalformedPacket(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
