//! Channel message set and binary codec for byteduct streams.
//!
//! A byteduct channel is message-oriented: every message arrives whole and
//! in order. This crate defines the eight control/data messages both stream
//! directions are built from, and frames them on the wire with:
//! - A 2-byte magic number ("BD") for stream synchronization
//! - A 4-byte little-endian body length
//! - A 1-byte message tag followed by the message fields
//!
//! No partial reads, no buffer management in user code.

pub mod codec;
pub mod error;
pub mod message;
pub mod reader;
pub mod writer;

pub use codec::{decode_message, encode_message, WireConfig, DEFAULT_MAX_PAYLOAD, HEADER_SIZE, MAGIC};
pub use error::{Result, WireError};
pub use message::Message;
pub use reader::MessageReader;
pub use writer::MessageWriter;
