//! Duplex, flow-controlled byte-stream components over a message-oriented
//! channel.
//!
//! A byteduct connection is built from four single-threaded, callback-driven
//! components, two per direction:
//!
//! - [`SourceSender`] pulls bytes from a local producer only while the peer
//!   has advertised receive credit, and pauses on producer errors.
//! - [`SourceReceiver`] buffers pushed data/error frames, serves them one at
//!   a time to a local consumer, and replenishes the sender's credit.
//! - [`SinkSender`] pushes whole frames to the peer and tracks per-frame
//!   acknowledgement in strict FIFO order, with advisory cancellation.
//! - [`SinkReceiver`] hands pushed frames to a local consumer one at a time
//!   and acknowledges each with success, partial success, or error.
//!
//! Nothing here blocks or spawns threads: all asynchronous behavior is a
//! deferred callback posted to the connection's [`TaskQueue`]. User callbacks
//! are never invoked synchronously from the call that triggered them, so
//! callers may safely call back into a component from inside a callback.

pub mod buffer;
pub mod error;
pub mod sink_receiver;
pub mod sink_sender;
pub mod source_receiver;
pub mod source_sender;
pub mod task;
pub mod traits;

pub use buffer::{ReadBuffer, WriteBuffer};
pub use error::{Result, StreamError};
pub use sink_receiver::SinkReceiver;
pub use sink_sender::SinkSender;
pub use source_receiver::SourceReceiver;
pub use source_sender::SourceSender;
pub use task::TaskQueue;
pub use traits::{ChannelLost, Consumer, MessageHandler, MessageSink, Producer};

#[cfg(test)]
pub(crate) mod testutil {
    use std::cell::RefCell;
    use std::rc::Rc;

    use byteduct_wire::Message;

    use crate::traits::{ChannelLost, MessageSink};

    /// Records every message a component sends, for wire-level assertions.
    #[derive(Clone, Default)]
    pub struct RecordingSink {
        pub sent: Rc<RefCell<Vec<Message>>>,
        pub closed: Rc<RefCell<bool>>,
    }

    impl RecordingSink {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn close(&self) {
            *self.closed.borrow_mut() = true;
        }

        pub fn take(&self) -> Vec<Message> {
            std::mem::take(&mut *self.sent.borrow_mut())
        }
    }

    impl MessageSink for RecordingSink {
        fn send(&mut self, msg: Message) -> std::result::Result<(), ChannelLost> {
            if *self.closed.borrow() {
                return Err(ChannelLost);
            }
            self.sent.borrow_mut().push(msg);
            Ok(())
        }
    }
}
