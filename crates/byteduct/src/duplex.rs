//! Pairing of the four stream components into one duplex connection.
//!
//! The pull direction pairs a [`SourceSender`] on the backend with a
//! [`SourceReceiver`] on the client; the push direction pairs a
//! [`SinkSender`] on the client with a [`SinkReceiver`] on the backend.
//! Each direction runs over its own loopback channel on a shared task
//! queue.

use byteduct_stream::{
    Consumer, Producer, SinkReceiver, SinkSender, SourceReceiver, SourceSender, TaskQueue,
};
use tracing::debug;

use crate::loopback::{loopback, LoopbackEndpoint};

/// Knobs for [`duplex`].
#[derive(Debug, Clone, Copy)]
pub struct DuplexConfig {
    /// Initial credit the client advertises for the pull direction.
    pub buffer_size: u32,
    /// Error code reported to every outstanding operation on shutdown or
    /// channel loss.
    pub fatal_error: i32,
}

impl Default for DuplexConfig {
    fn default() -> Self {
        Self {
            buffer_size: 64 * 1024,
            fatal_error: -1,
        }
    }
}

/// The backend half: produces pull-direction data, consumes push-direction
/// frames.
pub struct DuplexBackend {
    pub source: SourceSender,
    pub sink: SinkReceiver,
    pull: LoopbackEndpoint,
    push: LoopbackEndpoint,
}

/// The client half: reads pull-direction data, sends push-direction
/// frames.
pub struct DuplexClient {
    pub receiver: SourceReceiver,
    pub sender: SinkSender,
    pull: LoopbackEndpoint,
    push: LoopbackEndpoint,
}

/// Wire a full duplex connection over in-process channels.
///
/// `producer` feeds the backend's pull direction; `consumer` receives the
/// client's pushed frames on the backend; `fatal_handler` is told when the
/// backend's source dies. Nothing moves until the task queue is pumped.
pub fn duplex(
    tasks: &TaskQueue,
    config: DuplexConfig,
    producer: impl Producer + 'static,
    fatal_handler: impl FnOnce(i32) + 'static,
    consumer: impl Consumer + 'static,
) -> (DuplexClient, DuplexBackend) {
    let (pull_backend, pull_client) = loopback(tasks);
    let (push_client, push_backend) = loopback(tasks);

    let source = SourceSender::new(
        tasks.clone(),
        pull_backend.clone(),
        producer,
        config.fatal_error,
        fatal_handler,
    );
    pull_backend.set_handler(source.clone());

    let receiver = SourceReceiver::new(
        tasks.clone(),
        pull_client.clone(),
        config.buffer_size,
        config.fatal_error,
    );
    pull_client.set_handler(receiver.clone());

    let sender = SinkSender::new(tasks.clone(), push_client.clone(), config.fatal_error);
    push_client.set_handler(sender.clone());

    let sink = SinkReceiver::new(tasks.clone(), push_backend.clone(), consumer);
    push_backend.set_handler(sink.clone());

    debug!(
        buffer_size = config.buffer_size,
        fatal_error = config.fatal_error,
        "duplex connection wired"
    );
    (
        DuplexClient {
            receiver,
            sender,
            pull: pull_client,
            push: push_client,
        },
        DuplexBackend {
            source,
            sink,
            pull: pull_backend,
            push: push_backend,
        },
    )
}

impl DuplexClient {
    /// Tear down both directions from the client side.
    pub fn shutdown(&self) {
        self.receiver.shutdown();
        self.sender.shutdown();
        self.pull.close();
        self.push.close();
    }
}

impl DuplexBackend {
    /// Tear down both directions from the backend side.
    pub fn shutdown(&self) {
        self.source.shutdown();
        self.sink.shutdown();
        self.pull.close();
        self.push.close();
    }
}
