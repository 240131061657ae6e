//! Single-slot inbound sink receiver: the consumer half of the push
//! direction.
//!
//! Queues pushed frames, hands at most one buffer at a time to the local
//! consumer, and acknowledges each frame back over the channel with the
//! total bytes consumed and an error code. A consumer error (or a peer
//! cancellation) latches: the frame queue is discarded with error acks and
//! every later frame is refused until the peer sends `ClearError`.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

use bytes::Bytes;
use byteduct_wire::Message;
use tracing::{debug, trace, warn};

use crate::buffer::ReadBuffer;
use crate::task::TaskQueue;
use crate::traits::{Consumer, MessageHandler, MessageSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// No buffer outstanding. The queue may still hold frames if the
    /// consumer last closed a buffer without taking any bytes.
    Idle,
    /// A buffer is held by (or a hand-off task is in flight to) the
    /// consumer.
    Dispatching,
    /// A consumer error or cancellation was acked; new frames are refused
    /// with this code until the peer clears it.
    ErrorLatched(i32),
    ShutDown,
}

struct PendingFrame {
    bytes: Bytes,
    offset: usize,
}

/// Single-slot inbound sink receiver.
///
/// Cheap to clone; all clones share one underlying component.
#[derive(Clone)]
pub struct SinkReceiver {
    inner: Rc<RefCell<Inner>>,
}

struct Inner {
    state: State,
    queue: VecDeque<PendingFrame>,
    /// Taken out of the slot for the duration of a consumer call so the
    /// consumer may call back into the component.
    consumer: Option<Box<dyn Consumer>>,
    /// Cancellation received while the consumer holds a buffer; applied
    /// when the buffer closes. The consumer's own error takes precedence.
    cancel_error: Option<i32>,
    chan: Box<dyn MessageSink>,
    tasks: TaskQueue,
}

impl SinkReceiver {
    pub fn new(tasks: TaskQueue, chan: impl MessageSink + 'static, consumer: impl Consumer + 'static) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                state: State::Idle,
                queue: VecDeque::new(),
                consumer: Some(Box::new(consumer)),
                cancel_error: None,
                chan: Box::new(chan),
                tasks,
            })),
        }
    }

    /// Frames queued but not yet fully consumed.
    pub fn buffered_frames(&self) -> usize {
        self.inner.borrow().queue.len()
    }

    /// The latched error code, if a consumer error or cancellation is
    /// awaiting `ClearError` from the peer.
    pub fn latched_error(&self) -> Option<i32> {
        match self.inner.borrow().state {
            State::ErrorLatched(code) => Some(code),
            _ => None,
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.borrow().state == State::ShutDown
    }

    /// Make the receiver permanently inert. Idempotent.
    ///
    /// Does not ack queued frames or notify the consumer; the owning
    /// connection propagates shutdown to its own parties.
    pub fn shutdown(&self) {
        Inner::tear_down(&self.inner);
    }
}

impl MessageHandler for SinkReceiver {
    fn on_message(&self, msg: Message) {
        match msg {
            Message::Data { bytes } => Inner::on_data(&self.inner, bytes),
            Message::Cancel { error } => Inner::on_cancel(&self.inner, error),
            Message::ClearError => Inner::on_clear_error(&self.inner),
            other => {
                warn!(kind = other.kind(), "unexpected message for sink receiver");
                Inner::tear_down(&self.inner);
            }
        }
    }

    fn on_channel_closed(&self) {
        Inner::tear_down(&self.inner);
    }
}

impl Inner {
    fn on_data(cell: &Rc<RefCell<Inner>>, bytes: Bytes) {
        let lost = {
            let mut inner = cell.borrow_mut();
            match inner.state {
                State::ShutDown => return,
                State::ErrorLatched(code) => {
                    trace!(code, len = bytes.len(), "frame refused while latched");
                    inner.chan.send(Message::Ack { bytes_consumed: 0, error: code }).is_err()
                }
                State::Idle | State::Dispatching => {
                    if bytes.is_empty() {
                        warn!("empty data frame");
                        true
                    } else {
                        trace!(len = bytes.len(), queued = inner.queue.len(), "frame queued");
                        inner.queue.push_back(PendingFrame { bytes, offset: 0 });
                        if inner.state == State::Idle {
                            Inner::schedule_dispatch(cell, &mut inner);
                        }
                        false
                    }
                }
            }
        };
        if lost {
            Inner::tear_down(cell);
        }
    }

    fn on_cancel(cell: &Rc<RefCell<Inner>>, error: i32) {
        let mut inner = cell.borrow_mut();
        match inner.state {
            State::ShutDown => {}
            // A latched ack is already on its way to the peer; reacting
            // here would make it misattribute a later cancel to this one.
            State::ErrorLatched(_) => {
                trace!(error, "cancel ignored while latched");
            }
            State::Dispatching => {
                if inner.cancel_error.is_some() {
                    trace!(error, "cancel already pending");
                    return;
                }
                debug!(error, "cancelled while consumer holds a buffer");
                inner.cancel_error = Some(error);
                let weak = Rc::downgrade(cell);
                inner.tasks.post(move || Inner::notify_cancelled(&weak, error));
            }
            State::Idle => {
                debug!(error, discarded = inner.queue.len(), "cancelled while idle");
                if Inner::latch(&mut inner, error) {
                    drop(inner);
                    Inner::tear_down(cell);
                }
            }
        }
    }

    fn on_clear_error(cell: &Rc<RefCell<Inner>>) {
        let mut inner = cell.borrow_mut();
        match inner.state {
            State::ErrorLatched(code) => {
                debug!(code, "error cleared");
                inner.state = State::Idle;
            }
            State::ShutDown => {}
            _ => warn!("ClearError with no error latched"),
        }
    }

    /// Invoke the consumer's cancellation notice outside the cell.
    fn notify_cancelled(weak: &Weak<RefCell<Inner>>, error: i32) {
        let Some(cell) = weak.upgrade() else { return };
        let consumer = {
            let mut inner = cell.borrow_mut();
            if inner.state == State::ShutDown {
                return;
            }
            inner.consumer.take()
        };
        let Some(mut consumer) = consumer else { return };
        consumer.cancelled(error);
        let mut inner = cell.borrow_mut();
        if inner.state != State::ShutDown {
            inner.consumer = Some(consumer);
        }
    }

    /// Hand the front frame to the consumer, or go idle if the queue is
    /// empty. Caller holds the borrow.
    fn schedule_dispatch(cell: &Rc<RefCell<Inner>>, inner: &mut Inner) {
        if inner.queue.is_empty() {
            inner.state = State::Idle;
            return;
        }
        inner.state = State::Dispatching;
        let weak = Rc::downgrade(cell);
        inner.tasks.post(move || Inner::dispatch(&weak));
    }

    fn dispatch(weak: &Weak<RefCell<Inner>>) {
        let Some(cell) = weak.upgrade() else { return };
        let handoff = {
            let mut inner = cell.borrow_mut();
            if inner.state != State::Dispatching {
                return;
            }
            let Some(front) = inner.queue.front() else {
                inner.state = State::Idle;
                return;
            };
            let suffix = front.bytes.slice(front.offset..);
            let consumer = inner.consumer.take();
            (suffix, consumer)
        };
        let (suffix, consumer) = handoff;
        let Some(mut consumer) = consumer else { return };

        let done_weak = Weak::clone(weak);
        let buf = ReadBuffer::new(
            suffix,
            Box::new(move |n, err| Inner::on_consumed(&done_weak, n, err)),
        );
        trace!(len = buf.len(), "buffer handed to consumer");
        consumer.consume(buf);

        let mut inner = cell.borrow_mut();
        if inner.state != State::ShutDown {
            inner.consumer = Some(consumer);
        }
    }

    fn on_consumed(weak: &Weak<RefCell<Inner>>, bytes_consumed: usize, error: Option<i32>) {
        let Some(cell) = weak.upgrade() else { return };
        let lost = {
            let mut inner = cell.borrow_mut();
            if inner.state == State::ShutDown {
                return;
            }
            // The consumer's own error outranks a pending cancellation.
            let effective = error.or(inner.cancel_error.take());
            if let Some(code) = effective {
                let total = inner
                    .queue
                    .front()
                    .map(|f| f.offset + bytes_consumed)
                    .unwrap_or(bytes_consumed) as u32;
                debug!(code, total, "consumer reported an error");
                inner.queue.pop_front();
                if inner.chan.send(Message::Ack { bytes_consumed: total, error: code }).is_err() {
                    true
                } else {
                    Inner::latch(&mut inner, code)
                }
            } else {
                let Some(front) = inner.queue.front_mut() else {
                    inner.state = State::Idle;
                    return;
                };
                debug_assert!(bytes_consumed <= front.bytes.len() - front.offset);
                front.offset += bytes_consumed;
                trace!(
                    bytes_consumed,
                    remaining = front.bytes.len() - front.offset,
                    "buffer closed"
                );
                if front.offset == front.bytes.len() {
                    let total = front.bytes.len() as u32;
                    inner.queue.pop_front();
                    if inner.chan.send(Message::Ack { bytes_consumed: total, error: 0 }).is_err() {
                        true
                    } else {
                        Inner::schedule_dispatch(&cell, &mut inner);
                        false
                    }
                } else if bytes_consumed > 0 {
                    // Re-hand the remaining suffix.
                    Inner::schedule_dispatch(&cell, &mut inner);
                    false
                } else {
                    // Nothing taken: go idle rather than re-hand in a loop.
                    // The next incoming frame restarts dispatch.
                    inner.state = State::Idle;
                    false
                }
            }
        };
        if lost {
            Inner::tear_down(&cell);
        }
    }

    /// Ack every remaining queued frame with `(0, code)` and latch.
    /// Returns true if the channel was lost mid-drain.
    fn latch(inner: &mut Inner, code: i32) -> bool {
        let mut lost = false;
        for frame in inner.queue.drain(..) {
            trace!(code, len = frame.bytes.len(), "queued frame discarded");
            lost |= inner.chan.send(Message::Ack { bytes_consumed: 0, error: code }).is_err();
        }
        inner.state = State::ErrorLatched(code);
        inner.cancel_error = None;
        lost
    }

    fn tear_down(cell: &Rc<RefCell<Inner>>) {
        let mut inner = cell.borrow_mut();
        if inner.state == State::ShutDown {
            return;
        }
        debug!(dropped = inner.queue.len(), "sink receiver is inert");
        inner.state = State::ShutDown;
        inner.queue.clear();
        inner.consumer = None;
        inner.cancel_error = None;
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::testutil::RecordingSink;

    /// Consumer that parks every delivered buffer for the test to close,
    /// and records cancellation notices.
    #[derive(Clone, Default)]
    struct ParkingConsumer {
        held: Rc<RefCell<Vec<ReadBuffer>>>,
        cancels: Rc<RefCell<Vec<i32>>>,
    }

    impl Consumer for ParkingConsumer {
        fn consume(&mut self, buf: ReadBuffer) {
            self.held.borrow_mut().push(buf);
        }

        fn cancelled(&mut self, error: i32) {
            self.cancels.borrow_mut().push(error);
        }
    }

    struct Harness {
        tasks: TaskQueue,
        sink: RecordingSink,
        consumer: ParkingConsumer,
        receiver: SinkReceiver,
    }

    fn harness() -> Harness {
        let tasks = TaskQueue::new();
        let sink = RecordingSink::new();
        let consumer = ParkingConsumer::default();
        let receiver = SinkReceiver::new(tasks.clone(), sink.clone(), consumer.clone());
        Harness {
            tasks,
            sink,
            consumer,
            receiver,
        }
    }

    fn held(h: &Harness) -> ReadBuffer {
        h.consumer.held.borrow_mut().pop().expect("a buffer should be held")
    }

    #[test]
    fn frame_is_handed_to_consumer_and_full_consumption_acks() {
        let h = harness();
        h.receiver.on_message(Message::Data {
            bytes: Bytes::from_static(b"abc"),
        });
        assert!(h.consumer.held.borrow().is_empty());
        h.tasks.run_until_idle();

        let buf = held(&h);
        assert_eq!(&buf[..], b"abc");
        buf.done(3);

        assert_eq!(
            h.sink.take(),
            vec![Message::Ack {
                bytes_consumed: 3,
                error: 0
            }]
        );
        assert_eq!(h.receiver.buffered_frames(), 0);
    }

    #[test]
    fn partial_consumption_rehands_the_remainder() {
        let h = harness();
        h.receiver.on_message(Message::Data {
            bytes: Bytes::from_static(b"abcd"),
        });
        h.tasks.run_until_idle();
        held(&h).done(1);
        assert!(h.sink.take().is_empty());

        h.tasks.run_until_idle();
        let buf = held(&h);
        assert_eq!(&buf[..], b"bcd");
        buf.done(3);
        assert_eq!(
            h.sink.take(),
            vec![Message::Ack {
                bytes_consumed: 4,
                error: 0
            }]
        );
    }

    #[test]
    fn frames_queue_behind_the_held_buffer() {
        let h = harness();
        h.receiver.on_message(Message::Data {
            bytes: Bytes::from_static(b"aa"),
        });
        h.receiver.on_message(Message::Data {
            bytes: Bytes::from_static(b"bb"),
        });
        h.tasks.run_until_idle();

        // Only the front frame is handed out.
        assert_eq!(h.consumer.held.borrow().len(), 1);
        held(&h).done(2);
        h.tasks.run_until_idle();

        let buf = held(&h);
        assert_eq!(&buf[..], b"bb");
        buf.done(2);
        assert_eq!(
            h.sink.take(),
            vec![
                Message::Ack {
                    bytes_consumed: 2,
                    error: 0
                },
                Message::Ack {
                    bytes_consumed: 2,
                    error: 0
                },
            ]
        );
    }

    #[test]
    fn consumer_error_acks_discards_queue_and_latches() {
        let h = harness();
        h.receiver.on_message(Message::Data {
            bytes: Bytes::from_static(b"abcd"),
        });
        h.receiver.on_message(Message::Data {
            bytes: Bytes::from_static(b"e"),
        });
        h.tasks.run_until_idle();

        held(&h).done_with_error(2, -6);
        assert_eq!(
            h.sink.take(),
            vec![
                Message::Ack {
                    bytes_consumed: 2,
                    error: -6
                },
                Message::Ack {
                    bytes_consumed: 0,
                    error: -6
                },
            ]
        );
        assert_eq!(h.receiver.latched_error(), Some(-6));

        // Further frames are refused without queuing.
        h.receiver.on_message(Message::Data {
            bytes: Bytes::from_static(b"f"),
        });
        assert_eq!(
            h.sink.take(),
            vec![Message::Ack {
                bytes_consumed: 0,
                error: -6
            }]
        );
        assert_eq!(h.receiver.buffered_frames(), 0);
    }

    #[test]
    fn clear_error_unlatches() {
        let h = harness();
        h.receiver.on_message(Message::Data {
            bytes: Bytes::from_static(b"a"),
        });
        h.tasks.run_until_idle();
        held(&h).done_with_error(0, -6);
        h.sink.take();
        assert_eq!(h.receiver.latched_error(), Some(-6));

        h.receiver.on_message(Message::ClearError);
        assert_eq!(h.receiver.latched_error(), None);

        h.receiver.on_message(Message::Data {
            bytes: Bytes::from_static(b"b"),
        });
        h.tasks.run_until_idle();
        held(&h).done(1);
        assert_eq!(
            h.sink.take(),
            vec![Message::Ack {
                bytes_consumed: 1,
                error: 0
            }]
        );
    }

    #[test]
    fn cancel_while_buffer_held_defers_until_close() {
        let h = harness();
        h.receiver.on_message(Message::Data {
            bytes: Bytes::from_static(b"ab"),
        });
        h.tasks.run_until_idle();
        let buf = held(&h);

        h.receiver.on_message(Message::Cancel { error: -2 });
        h.tasks.run_until_idle();
        assert_eq!(*h.consumer.cancels.borrow(), vec![-2]);
        // Nothing acked yet; the close carries the cancellation error.
        assert!(h.sink.take().is_empty());

        buf.done(1);
        assert_eq!(
            h.sink.take(),
            vec![Message::Ack {
                bytes_consumed: 1,
                error: -2
            }]
        );
        assert_eq!(h.receiver.latched_error(), Some(-2));
    }

    #[test]
    fn consumer_error_outranks_pending_cancel() {
        let h = harness();
        h.receiver.on_message(Message::Data {
            bytes: Bytes::from_static(b"ab"),
        });
        h.tasks.run_until_idle();
        let buf = held(&h);

        h.receiver.on_message(Message::Cancel { error: -2 });
        h.tasks.run_until_idle();
        buf.done_with_error(0, -6);

        assert_eq!(
            h.sink.take(),
            vec![Message::Ack {
                bytes_consumed: 0,
                error: -6
            }]
        );
        assert_eq!(h.receiver.latched_error(), Some(-6));
    }

    #[test]
    fn cancel_while_idle_latches_immediately() {
        let h = harness();
        h.receiver.on_message(Message::Cancel { error: -2 });
        assert_eq!(h.receiver.latched_error(), Some(-2));

        h.receiver.on_message(Message::Data {
            bytes: Bytes::from_static(b"a"),
        });
        assert_eq!(
            h.sink.take(),
            vec![Message::Ack {
                bytes_consumed: 0,
                error: -2
            }]
        );
    }

    #[test]
    fn cancel_while_latched_is_a_no_op() {
        let h = harness();
        h.receiver.on_message(Message::Cancel { error: -2 });
        h.receiver.on_message(Message::Cancel { error: -3 });
        assert_eq!(h.receiver.latched_error(), Some(-2));
        assert!(h.consumer.cancels.borrow().is_empty());
    }

    #[test]
    fn zero_byte_close_parks_the_frame_until_more_data() {
        let h = harness();
        h.receiver.on_message(Message::Data {
            bytes: Bytes::from_static(b"a"),
        });
        h.tasks.run_until_idle();
        held(&h).done(0);
        h.tasks.run_until_idle();

        // No re-hand loop; the frame waits.
        assert!(h.consumer.held.borrow().is_empty());
        assert_eq!(h.receiver.buffered_frames(), 1);

        // The next frame restarts dispatch at the parked frame.
        h.receiver.on_message(Message::Data {
            bytes: Bytes::from_static(b"b"),
        });
        h.tasks.run_until_idle();
        let buf = held(&h);
        assert_eq!(&buf[..], b"a");
        buf.done(1);
    }

    #[test]
    fn shutdown_is_inert_and_idempotent() {
        let h = harness();
        h.receiver.on_message(Message::Data {
            bytes: Bytes::from_static(b"a"),
        });
        h.receiver.shutdown();
        h.receiver.shutdown();
        h.tasks.run_until_idle();

        assert!(h.receiver.is_shut_down());
        assert!(h.consumer.held.borrow().is_empty());
        assert!(h.sink.take().is_empty());

        // Later traffic is ignored outright.
        h.receiver.on_message(Message::Data {
            bytes: Bytes::from_static(b"b"),
        });
        h.tasks.run_until_idle();
        assert!(h.consumer.held.borrow().is_empty());
    }

    #[test]
    fn empty_data_frame_is_fatal() {
        let h = harness();
        h.receiver.on_message(Message::Data { bytes: Bytes::new() });
        assert!(h.receiver.is_shut_down());
    }

    #[test]
    fn unexpected_message_is_fatal() {
        let h = harness();
        h.receiver.on_message(Message::Resume);
        assert!(h.receiver.is_shut_down());
    }
}
