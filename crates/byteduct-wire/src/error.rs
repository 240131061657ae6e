/// Errors that can occur during message encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// The message header contains an invalid magic number.
    #[error("invalid message magic (expected 0x4244 \"BD\")")]
    InvalidMagic,

    /// The message body carries a tag this implementation does not know.
    #[error("unknown message tag 0x{0:02x}")]
    UnknownTag(u8),

    /// The body length does not match what the tag requires.
    #[error("truncated or oversized body for tag 0x{tag:02x} ({len} bytes)")]
    TruncatedBody { tag: u8, len: usize },

    /// A data message must carry at least one payload byte.
    #[error("data message with empty payload")]
    EmptyData,

    /// The payload exceeds the configured maximum size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// An I/O error occurred while reading or writing messages.
    #[error("message I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed before a complete message was received.
    #[error("connection closed (incomplete message)")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, WireError>;
