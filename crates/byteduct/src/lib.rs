//! Duplex, flow-controlled byte streams over message-oriented channels.
//!
//! byteduct splits a bidirectional byte stream into two independently
//! flow-controlled directions over any in-order message channel:
//!
//! - the **pull** direction, where a credit-based [`SourceSender`] feeds a
//!   buffering [`SourceReceiver`] and never sends more than the receiver
//!   has advertised room for;
//! - the **push** direction, where a [`SinkSender`] transmits whole frames
//!   eagerly and a single-slot [`SinkReceiver`] acknowledges each one.
//!
//! # Crate Structure
//!
//! - [`stream`] — The four stream components, their seams, and the task
//!   queue they schedule on
//! - [`wire`] — The channel message set and its binary codec
//! - [`loopback`] / [`duplex`] — In-process channel endpoints and the
//!   wiring of a full duplex connection over them

pub mod duplex;
pub mod loopback;

/// Re-export stream component types.
pub mod stream {
    pub use byteduct_stream::*;
}

/// Re-export wire types.
pub mod wire {
    pub use byteduct_wire::*;
}

pub use byteduct_stream::{
    Consumer, Producer, ReadBuffer, SinkReceiver, SinkSender, SourceReceiver, SourceSender,
    StreamError, TaskQueue, WriteBuffer,
};
pub use duplex::{duplex, DuplexBackend, DuplexClient, DuplexConfig};
pub use loopback::{loopback, LoopbackEndpoint};
