//! Push-based outbound sender: the producer half of the push direction.
//!
//! Accepts any number of in-flight send requests, transmits each as one
//! whole frame immediately, and matches the peer's per-frame
//! acknowledgements against the pending-send queue in strict FIFO order.
//! Cancellation is advisory and races against in-flight acknowledgements.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use bytes::Bytes;
use byteduct_wire::Message;
use tracing::{debug, trace, warn};

use crate::error::{Result, StreamError};
use crate::task::TaskQueue;
use crate::traits::{MessageHandler, MessageSink};

struct PendingSend {
    seq: u64,
    frame_len: u32,
    sent_cb: Box<dyn FnOnce(u32)>,
    error_cb: Box<dyn FnOnce(u32, i32)>,
}

struct PendingCancel {
    callback: Box<dyn FnOnce()>,
}

/// Push-based outbound sender.
///
/// Cheap to clone; all clones share one underlying component.
#[derive(Clone)]
pub struct SinkSender {
    inner: Rc<RefCell<Inner>>,
}

struct Inner {
    shut_down: bool,
    next_seq: u64,
    queue: VecDeque<PendingSend>,
    cancel: Option<PendingCancel>,
    /// The peer's sink latches after an error or a transmitted cancel; once
    /// the queue drains we owe it a `ClearError`.
    need_clear_error: bool,
    chan: Box<dyn MessageSink>,
    fatal_error: i32,
    tasks: TaskQueue,
}

impl SinkSender {
    /// Create a sender bound to `chan`.
    ///
    /// `fatal_error` is the code every outstanding error callback receives
    /// when the component shuts down or the channel is lost.
    pub fn new(tasks: TaskQueue, chan: impl MessageSink + 'static, fatal_error: i32) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                shut_down: false,
                next_seq: 0,
                queue: VecDeque::new(),
                cancel: None,
                need_clear_error: false,
                chan: Box::new(chan),
                fatal_error,
                tasks,
            })),
        }
    }

    /// Transmit `data` as one whole frame and await its acknowledgement.
    ///
    /// Exactly one of the callbacks eventually fires, asynchronously:
    /// `sent_cb(bytes_consumed)` on full consumption by the peer's
    /// consumer, `error_cb(bytes_consumed, error)` otherwise. Fails without
    /// invoking either callback if a cancellation is pending or the
    /// component is shut down.
    pub fn send(
        &self,
        data: Bytes,
        sent_cb: impl FnOnce(u32) + 'static,
        error_cb: impl FnOnce(u32, i32) + 'static,
    ) -> Result<()> {
        let lost = {
            let mut inner = self.inner.borrow_mut();
            if inner.shut_down {
                return Err(StreamError::ShutDown);
            }
            if inner.cancel.is_some() {
                return Err(StreamError::CancelPending);
            }
            if data.is_empty() {
                return Err(StreamError::EmptyFrame);
            }
            if data.len() > u32::MAX as usize {
                return Err(StreamError::FrameTooLarge(data.len()));
            }

            let frame_len = data.len() as u32;
            let seq = inner.next_seq;
            if inner.chan.send(Message::Data { bytes: data }).is_err() {
                true
            } else {
                inner.next_seq += 1;
                trace!(seq, frame_len, in_flight = inner.queue.len() + 1, "frame sent");
                inner.queue.push_back(PendingSend {
                    seq,
                    frame_len,
                    sent_cb: Box::new(sent_cb),
                    error_cb: Box::new(error_cb),
                });
                false
            }
        };
        if lost {
            Inner::tear_down(&self.inner);
            return Err(StreamError::ChannelLost);
        }
        Ok(())
    }

    /// Request cancellation of all in-flight sends.
    ///
    /// Advisory: each in-flight send still resolves with whatever the
    /// peer's consumer actually reported, which may differ from `error`.
    /// `callback` fires once the pending-send queue has drained — at once
    /// (asynchronously) if it is already empty.
    pub fn cancel(&self, error: i32, callback: impl FnOnce() + 'static) -> Result<()> {
        let lost = {
            let mut inner = self.inner.borrow_mut();
            if inner.shut_down {
                return Err(StreamError::ShutDown);
            }
            if inner.cancel.is_some() {
                return Err(StreamError::CancelPending);
            }
            if inner.queue.is_empty() {
                inner.tasks.post(callback);
                return Ok(());
            }
            if inner.chan.send(Message::Cancel { error }).is_err() {
                true
            } else {
                debug!(error, in_flight = inner.queue.len(), "cancel requested");
                inner.need_clear_error = true;
                inner.cancel = Some(PendingCancel {
                    callback: Box::new(callback),
                });
                false
            }
        };
        if lost {
            Inner::tear_down(&self.inner);
            return Err(StreamError::ChannelLost);
        }
        Ok(())
    }

    /// Sends transmitted but not yet acknowledged.
    pub fn sends_in_flight(&self) -> usize {
        self.inner.borrow().queue.len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.borrow().shut_down
    }

    /// Tear the component down. Idempotent.
    ///
    /// Drains the pending-send queue in FIFO order, invoking each entry's
    /// error callback with `(0, fatal_error)`, then resolves any pending
    /// cancellation — all before returning.
    pub fn shutdown(&self) {
        Inner::tear_down(&self.inner);
    }
}

impl MessageHandler for SinkSender {
    fn on_message(&self, msg: Message) {
        match msg {
            Message::Ack {
                bytes_consumed,
                error,
            } => Inner::on_ack(&self.inner, bytes_consumed, error),
            other => {
                warn!(kind = other.kind(), "unexpected message for sink sender");
                Inner::tear_down(&self.inner);
            }
        }
    }

    fn on_channel_closed(&self) {
        Inner::tear_down(&self.inner);
    }
}

impl Inner {
    fn on_ack(cell: &Rc<RefCell<Inner>>, bytes_consumed: u32, error: i32) {
        let failed = {
            let mut inner = cell.borrow_mut();
            if inner.shut_down {
                return;
            }
            match inner.queue.front() {
                None => {
                    warn!("ack with no send in flight");
                    true
                }
                Some(front) if bytes_consumed > front.frame_len => {
                    warn!(
                        bytes_consumed,
                        frame_len = front.frame_len,
                        "ack exceeds frame size"
                    );
                    true
                }
                Some(front) if error == 0 && bytes_consumed != front.frame_len => {
                    warn!(
                        bytes_consumed,
                        frame_len = front.frame_len,
                        "success ack for a partial frame"
                    );
                    true
                }
                Some(_) => {
                    let entry = inner.queue.pop_front().expect("checked above");
                    trace!(seq = entry.seq, bytes_consumed, error, "send resolved");
                    if error == 0 {
                        let sent_cb = entry.sent_cb;
                        inner.tasks.post(move || sent_cb(bytes_consumed));
                    } else {
                        let error_cb = entry.error_cb;
                        inner.tasks.post(move || error_cb(bytes_consumed, error));
                        inner.need_clear_error = true;
                    }
                    if inner.queue.is_empty() {
                        Inner::finish_drain(&mut inner)
                    } else {
                        false
                    }
                }
            }
        };
        if failed {
            Inner::tear_down(cell);
        }
    }

    /// The queue just drained: unlatch the peer if needed and resolve a
    /// pending cancellation. Returns true if the channel was lost.
    fn finish_drain(inner: &mut Inner) -> bool {
        let mut lost = false;
        if inner.need_clear_error {
            inner.need_clear_error = false;
            lost = inner.chan.send(Message::ClearError).is_err();
            trace!("queue drained; ClearError sent");
        }
        if let Some(cancel) = inner.cancel.take() {
            debug!("cancellation resolved");
            inner.tasks.post(cancel.callback);
        }
        lost
    }

    fn tear_down(cell: &Rc<RefCell<Inner>>) {
        let (drained, cancel, code) = {
            let mut inner = cell.borrow_mut();
            if inner.shut_down {
                return;
            }
            inner.shut_down = true;
            let drained: Vec<PendingSend> = inner.queue.drain(..).collect();
            (drained, inner.cancel.take(), inner.fatal_error)
        };
        debug!(
            code,
            dropped = drained.len(),
            "sink sender is inert; draining queue"
        );
        // The drain completes before shutdown returns: each callback runs
        // here, in FIFO order, with the cell released so callbacks may call
        // back in (and get ShutDown errors).
        for entry in drained {
            (entry.error_cb)(0, code);
        }
        if let Some(cancel) = cancel {
            (cancel.callback)();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::testutil::RecordingSink;

    const FATAL: i32 = -88;

    struct Harness {
        tasks: TaskQueue,
        sink: RecordingSink,
        sender: SinkSender,
    }

    fn harness() -> Harness {
        let tasks = TaskQueue::new();
        let sink = RecordingSink::new();
        let sender = SinkSender::new(tasks.clone(), sink.clone(), FATAL);
        Harness {
            tasks,
            sink,
            sender,
        }
    }

    type SendLog = Rc<RefCell<Vec<(u64, std::result::Result<u32, (u32, i32)>)>>>;

    fn send_logged(h: &Harness, id: u64, bytes: &'static [u8], log: &SendLog) {
        let ok_log = Rc::clone(log);
        let err_log = Rc::clone(log);
        h.sender
            .send(
                Bytes::from_static(bytes),
                move |n| ok_log.borrow_mut().push((id, Ok(n))),
                move |n, e| err_log.borrow_mut().push((id, Err((n, e)))),
            )
            .unwrap();
    }

    #[test]
    fn frames_transmit_immediately_and_whole() {
        let h = harness();
        let log: SendLog = Rc::new(RefCell::new(Vec::new()));
        send_logged(&h, 1, b"abc", &log);
        send_logged(&h, 2, b"de", &log);

        assert_eq!(
            h.sink.take(),
            vec![
                Message::Data {
                    bytes: Bytes::from_static(b"abc")
                },
                Message::Data {
                    bytes: Bytes::from_static(b"de")
                },
            ]
        );
        assert_eq!(h.sender.sends_in_flight(), 2);
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn acks_resolve_in_fifo_order_exactly_once() {
        let h = harness();
        let log: SendLog = Rc::new(RefCell::new(Vec::new()));
        send_logged(&h, 1, b"a", &log);
        send_logged(&h, 2, b"bb", &log);
        send_logged(&h, 3, b"ccc", &log);

        h.sender.on_message(Message::Ack {
            bytes_consumed: 1,
            error: 0,
        });
        h.sender.on_message(Message::Ack {
            bytes_consumed: 2,
            error: 0,
        });
        h.sender.on_message(Message::Ack {
            bytes_consumed: 3,
            error: 0,
        });
        h.tasks.run_until_idle();

        assert_eq!(
            *log.borrow(),
            vec![(1, Ok(1)), (2, Ok(2)), (3, Ok(3))]
        );
        assert_eq!(h.sender.sends_in_flight(), 0);
    }

    #[test]
    fn error_ack_may_be_partial() {
        let h = harness();
        let log: SendLog = Rc::new(RefCell::new(Vec::new()));
        send_logged(&h, 1, b"abcd", &log);
        h.sink.take();

        h.sender.on_message(Message::Ack {
            bytes_consumed: 2,
            error: -6,
        });
        h.tasks.run_until_idle();

        assert_eq!(*log.borrow(), vec![(1, Err((2, -6)))]);
        // Queue drained on an error: the peer's latch must be cleared.
        assert_eq!(h.sink.take(), vec![Message::ClearError]);
    }

    #[test]
    fn ack_larger_than_frame_is_fatal() {
        let h = harness();
        let log: SendLog = Rc::new(RefCell::new(Vec::new()));
        send_logged(&h, 1, b"ab", &log);

        h.sender.on_message(Message::Ack {
            bytes_consumed: 3,
            error: 0,
        });
        h.tasks.run_until_idle();

        assert!(h.sender.is_shut_down());
        assert_eq!(*log.borrow(), vec![(1, Err((0, FATAL)))]);
    }

    #[test]
    fn unexpected_ack_is_fatal() {
        let h = harness();
        h.sender.on_message(Message::Ack {
            bytes_consumed: 0,
            error: 0,
        });
        assert!(h.sender.is_shut_down());
    }

    #[test]
    fn cancel_with_empty_queue_fires_immediately() {
        let h = harness();
        let done = Rc::new(RefCell::new(false));
        let done_slot = Rc::clone(&done);
        h.sender.cancel(-2, move || *done_slot.borrow_mut() = true).unwrap();

        // No Cancel goes out; there is nothing to cancel.
        assert!(h.sink.take().is_empty());
        assert!(!*done.borrow());
        h.tasks.run_until_idle();
        assert!(*done.borrow());
    }

    #[test]
    fn cancel_transmits_and_defers_until_queue_drains() {
        let h = harness();
        let log: SendLog = Rc::new(RefCell::new(Vec::new()));
        send_logged(&h, 1, b"x", &log);
        h.sink.take();

        let done = Rc::new(RefCell::new(false));
        let done_slot = Rc::clone(&done);
        h.sender.cancel(-2, move || *done_slot.borrow_mut() = true).unwrap();
        assert_eq!(h.sink.take(), vec![Message::Cancel { error: -2 }]);

        // Sends are refused while cancelling.
        let err = h.sender.send(Bytes::from_static(b"y"), |_| {}, |_, _| {}).unwrap_err();
        assert_eq!(err, StreamError::CancelPending);

        // The in-flight send resolves with the peer's error, not ours.
        h.sender.on_message(Message::Ack {
            bytes_consumed: 0,
            error: -6,
        });
        h.tasks.run_until_idle();

        assert_eq!(*log.borrow(), vec![(1, Err((0, -6)))]);
        assert!(*done.borrow());
        assert_eq!(h.sink.take(), vec![Message::ClearError]);

        // And the sender is usable again.
        assert!(h.sender.send(Bytes::from_static(b"z"), |_| {}, |_, _| {}).is_ok());
    }

    #[test]
    fn cancel_resolved_by_natural_success_acks() {
        let h = harness();
        let log: SendLog = Rc::new(RefCell::new(Vec::new()));
        send_logged(&h, 1, b"x", &log);
        h.sink.take();

        let done = Rc::new(RefCell::new(false));
        let done_slot = Rc::clone(&done);
        h.sender.cancel(-2, move || *done_slot.borrow_mut() = true).unwrap();
        h.sink.take();

        h.sender.on_message(Message::Ack {
            bytes_consumed: 1,
            error: 0,
        });
        h.tasks.run_until_idle();

        assert_eq!(*log.borrow(), vec![(1, Ok(1))]);
        assert!(*done.borrow());
        // The peer latched our cancel error; it still needs clearing.
        assert_eq!(h.sink.take(), vec![Message::ClearError]);
    }

    #[test]
    fn double_cancel_fails() {
        let h = harness();
        let log: SendLog = Rc::new(RefCell::new(Vec::new()));
        send_logged(&h, 1, b"x", &log);

        h.sender.cancel(-2, || {}).unwrap();
        assert_eq!(h.sender.cancel(-3, || {}).unwrap_err(), StreamError::CancelPending);
        h.sender.shutdown();
        h.tasks.run_until_idle();
    }

    #[test]
    fn shutdown_drains_queue_in_order_before_returning() {
        let h = harness();
        let log: SendLog = Rc::new(RefCell::new(Vec::new()));
        send_logged(&h, 1, b"a", &log);
        send_logged(&h, 2, b"b", &log);
        send_logged(&h, 3, b"c", &log);

        h.sender.shutdown();
        // Synchronous from the owner's perspective: no queue pumping needed.
        assert_eq!(
            *log.borrow(),
            vec![
                (1, Err((0, FATAL))),
                (2, Err((0, FATAL))),
                (3, Err((0, FATAL))),
            ]
        );

        assert_eq!(
            h.sender.send(Bytes::from_static(b"d"), |_| {}, |_, _| {}).unwrap_err(),
            StreamError::ShutDown
        );
        assert_eq!(h.sender.cancel(-1, || {}).unwrap_err(), StreamError::ShutDown);
    }

    #[test]
    fn shutdown_is_idempotent() {
        let h = harness();
        let log: SendLog = Rc::new(RefCell::new(Vec::new()));
        send_logged(&h, 1, b"a", &log);

        h.sender.shutdown();
        h.sender.shutdown();
        assert_eq!(*log.borrow(), vec![(1, Err((0, FATAL)))]);
    }

    #[test]
    fn channel_loss_equals_shutdown() {
        let h = harness();
        let log: SendLog = Rc::new(RefCell::new(Vec::new()));
        send_logged(&h, 1, b"a", &log);

        h.sender.on_channel_closed();
        assert_eq!(*log.borrow(), vec![(1, Err((0, FATAL)))]);
        assert!(h.sender.is_shut_down());
    }

    #[test]
    fn send_failure_on_lost_channel_tears_down() {
        let h = harness();
        let log: SendLog = Rc::new(RefCell::new(Vec::new()));
        send_logged(&h, 1, b"a", &log);
        h.sink.close();

        let err = h.sender.send(Bytes::from_static(b"b"), |_| {}, |_, _| {}).unwrap_err();
        assert_eq!(err, StreamError::ChannelLost);
        // The earlier in-flight send resolves with the fatal code.
        assert_eq!(*log.borrow(), vec![(1, Err((0, FATAL)))]);
    }

    #[test]
    fn empty_frame_rejected() {
        let h = harness();
        let err = h.sender.send(Bytes::new(), |_| {}, |_, _| {}).unwrap_err();
        assert_eq!(err, StreamError::EmptyFrame);
    }
}
