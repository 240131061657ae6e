//! Seams between stream components, the channel, and local endpoints.

use byteduct_wire::{Message, MessageWriter};

use crate::buffer::{ReadBuffer, WriteBuffer};

/// Error returned by [`MessageSink::send`] once the channel endpoint is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("channel to the peer was lost")]
pub struct ChannelLost;

/// Outbound half of a channel endpoint.
///
/// Implementations must deliver messages reliably and in order; they may
/// defer actual delivery, but must preserve the order `send` was called in.
pub trait MessageSink {
    /// Queue one message for delivery to the peer.
    fn send(&mut self, msg: Message) -> Result<(), ChannelLost>;
}

/// A direction bound to a byte stream writes its messages straight through
/// the wire codec.
impl<T: std::io::Write> MessageSink for MessageWriter<T> {
    fn send(&mut self, msg: Message) -> Result<(), ChannelLost> {
        self.write_message(&msg).map_err(|err| {
            tracing::debug!(error = %err, "message write failed; treating channel as lost");
            ChannelLost
        })
    }
}

/// Inbound half of a channel endpoint: whole messages, in arrival order.
///
/// All four stream components implement this; the channel glue routes each
/// endpoint's messages to its component.
pub trait MessageHandler {
    /// A message arrived from the peer.
    fn on_message(&self, msg: Message);

    /// The channel itself was lost. Treated identically to explicit
    /// shutdown.
    fn on_channel_closed(&self);
}

/// Local producer for a [`crate::SourceSender`].
///
/// Invoked with a writable buffer sized to the current credit. The producer
/// fills some prefix and closes the buffer — possibly much later; holding
/// the buffer is how a producer with nothing to send waits.
pub trait Producer {
    fn produce(&mut self, buffer: WriteBuffer);
}

impl<F: FnMut(WriteBuffer)> Producer for F {
    fn produce(&mut self, buffer: WriteBuffer) {
        self(buffer)
    }
}

/// Local consumer for a [`crate::SinkReceiver`].
pub trait Consumer {
    /// One frame (or the unconsumed suffix of one) is ready. The consumer
    /// reads some prefix and closes the buffer.
    fn consume(&mut self, buffer: ReadBuffer);

    /// The peer requested cancellation while the consumer holds a buffer.
    /// Advisory: the consumer's own close still decides the outcome.
    fn cancelled(&mut self, _error: i32) {}
}

impl<F: FnMut(ReadBuffer)> Consumer for F {
    fn consume(&mut self, buffer: ReadBuffer) {
        self(buffer)
    }
}
