use bytes::{Buf, BufMut, BytesMut};

use crate::error::{Result, WireError};
use crate::message::{
    Message, TAG_ACK, TAG_CANCEL, TAG_CLEAR_ERROR, TAG_DATA, TAG_ERROR, TAG_INIT,
    TAG_REPORT_BYTES_RECEIVED, TAG_RESUME,
};

/// Message header: magic (2) + body length (4) = 6 bytes.
pub const HEADER_SIZE: usize = 6;

/// Magic bytes: "BD" (0x42 0x44).
pub const MAGIC: [u8; 2] = [0x42, 0x44];

/// Default maximum data payload size: 16 MiB.
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Encode a message into the wire format.
///
/// Wire format:
/// ```text
/// ┌──────────────┬───────────┬─────────┬──────────────────┐
/// │ Magic (2B)   │ Length    │ Tag     │ Fields            │
/// │ 0x42 0x44    │ (4B LE)   │ (1B)    │ (LE ints / bytes) │
/// │ "BD"         │           │         │                   │
/// └──────────────┴───────────┴─────────┴──────────────────┘
/// ```
/// Length counts the body (tag + fields).
pub fn encode_message(msg: &Message, dst: &mut BytesMut) -> Result<()> {
    let body_len = match msg {
        Message::Init { .. }
        | Message::Error { .. }
        | Message::ReportBytesReceived { .. }
        | Message::Cancel { .. } => 5,
        Message::Resume | Message::ClearError => 1,
        Message::Ack { .. } => 9,
        Message::Data { bytes } => {
            if bytes.is_empty() {
                return Err(WireError::EmptyData);
            }
            if bytes.len() > u32::MAX as usize - 1 {
                return Err(WireError::PayloadTooLarge {
                    size: bytes.len(),
                    max: u32::MAX as usize - 1,
                });
            }
            1 + bytes.len()
        }
    };

    dst.reserve(HEADER_SIZE + body_len);
    dst.put_slice(&MAGIC);
    dst.put_u32_le(body_len as u32);
    dst.put_u8(msg.tag());
    match msg {
        Message::Init { buffer_size } => dst.put_u32_le(*buffer_size),
        Message::Data { bytes } => dst.put_slice(bytes),
        Message::Error { code } => dst.put_i32_le(*code),
        Message::ReportBytesReceived { count } => dst.put_u32_le(*count),
        Message::Resume | Message::ClearError => {}
        Message::Ack {
            bytes_consumed,
            error,
        } => {
            dst.put_u32_le(*bytes_consumed);
            dst.put_i32_le(*error);
        }
        Message::Cancel { error } => dst.put_i32_le(*error),
    }
    Ok(())
}

/// Decode a message from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete message yet.
/// On success, consumes the message bytes from the buffer.
pub fn decode_message(src: &mut BytesMut, max_payload: usize) -> Result<Option<Message>> {
    if src.len() < HEADER_SIZE {
        return Ok(None); // Need more data
    }

    // Check magic
    if src[0..2] != MAGIC {
        return Err(WireError::InvalidMagic);
    }

    let body_len = u32::from_le_bytes(src[2..6].try_into().unwrap()) as usize;

    if body_len == 0 {
        return Err(WireError::TruncatedBody { tag: 0, len: 0 });
    }
    if body_len > max_payload + 1 {
        return Err(WireError::PayloadTooLarge {
            size: body_len - 1,
            max: max_payload,
        });
    }

    let total = HEADER_SIZE + body_len;
    if src.len() < total {
        return Ok(None); // Need more data
    }

    src.advance(HEADER_SIZE);
    let mut body = src.split_to(body_len);
    let tag = body.get_u8();
    let fields = body.remaining();

    let msg = match tag {
        TAG_INIT => {
            expect_fields(tag, fields, 4)?;
            Message::Init {
                buffer_size: body.get_u32_le(),
            }
        }
        TAG_DATA => {
            if fields == 0 {
                return Err(WireError::EmptyData);
            }
            Message::Data {
                bytes: body.freeze(),
            }
        }
        TAG_ERROR => {
            expect_fields(tag, fields, 4)?;
            Message::Error {
                code: body.get_i32_le(),
            }
        }
        TAG_REPORT_BYTES_RECEIVED => {
            expect_fields(tag, fields, 4)?;
            Message::ReportBytesReceived {
                count: body.get_u32_le(),
            }
        }
        TAG_RESUME => {
            expect_fields(tag, fields, 0)?;
            Message::Resume
        }
        TAG_ACK => {
            expect_fields(tag, fields, 8)?;
            Message::Ack {
                bytes_consumed: body.get_u32_le(),
                error: body.get_i32_le(),
            }
        }
        TAG_CANCEL => {
            expect_fields(tag, fields, 4)?;
            Message::Cancel {
                error: body.get_i32_le(),
            }
        }
        TAG_CLEAR_ERROR => {
            expect_fields(tag, fields, 0)?;
            Message::ClearError
        }
        other => return Err(WireError::UnknownTag(other)),
    };

    Ok(Some(msg))
}

fn expect_fields(tag: u8, got: usize, want: usize) -> Result<()> {
    if got != want {
        return Err(WireError::TruncatedBody { tag, len: got + 1 });
    }
    Ok(())
}

/// Configuration for the message codec.
#[derive(Debug, Clone)]
pub struct WireConfig {
    /// Maximum data payload size in bytes. Default: 16 MiB.
    pub max_payload_size: usize,
}

impl Default for WireConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
        }
    }
}
