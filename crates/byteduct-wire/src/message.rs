//! The channel message set.
//!
//! Both stream directions reuse this shape: a credit-based source direction
//! (`Init`/`Data`/`Error`/`ReportBytesReceived`/`Resume`) and a push-based
//! sink direction (`Data`/`Ack`/`Cancel`/`ClearError`).

use bytes::Bytes;

/// Tag byte for [`Message::Init`].
pub const TAG_INIT: u8 = 0x01;
/// Tag byte for [`Message::Data`].
pub const TAG_DATA: u8 = 0x02;
/// Tag byte for [`Message::Error`].
pub const TAG_ERROR: u8 = 0x03;
/// Tag byte for [`Message::ReportBytesReceived`].
pub const TAG_REPORT_BYTES_RECEIVED: u8 = 0x04;
/// Tag byte for [`Message::Resume`].
pub const TAG_RESUME: u8 = 0x05;
/// Tag byte for [`Message::Ack`].
pub const TAG_ACK: u8 = 0x06;
/// Tag byte for [`Message::Cancel`].
pub const TAG_CANCEL: u8 = 0x07;
/// Tag byte for [`Message::ClearError`].
pub const TAG_CLEAR_ERROR: u8 = 0x08;

/// One whole channel message, delivered atomically and in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Receiver → source: sets the source's initial credit.
    Init { buffer_size: u32 },
    /// One frame of pushed data. Never empty.
    Data { bytes: Bytes },
    /// Source → receiver: standalone error push, no data attached.
    Error { code: i32 },
    /// Receiver → source: credit replenishment.
    ReportBytesReceived { count: u32 },
    /// Receiver → source: clears the source's paused state.
    Resume,
    /// Sink → producer: per-frame acknowledgement. `error == 0` means the
    /// whole frame was consumed.
    Ack { bytes_consumed: u32, error: i32 },
    /// Producer → sink: cancellation request.
    Cancel { error: i32 },
    /// Producer → sink: unlatches a previously reported error.
    ClearError,
}

impl Message {
    /// The wire tag for this message.
    pub fn tag(&self) -> u8 {
        match self {
            Message::Init { .. } => TAG_INIT,
            Message::Data { .. } => TAG_DATA,
            Message::Error { .. } => TAG_ERROR,
            Message::ReportBytesReceived { .. } => TAG_REPORT_BYTES_RECEIVED,
            Message::Resume => TAG_RESUME,
            Message::Ack { .. } => TAG_ACK,
            Message::Cancel { .. } => TAG_CANCEL,
            Message::ClearError => TAG_CLEAR_ERROR,
        }
    }

    /// A human-readable name for this message kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Init { .. } => "Init",
            Message::Data { .. } => "Data",
            Message::Error { .. } => "Error",
            Message::ReportBytesReceived { .. } => "ReportBytesReceived",
            Message::Resume => "Resume",
            Message::Ack { .. } => "Ack",
            Message::Cancel { .. } => "Cancel",
            Message::ClearError => "ClearError",
        }
    }
}
