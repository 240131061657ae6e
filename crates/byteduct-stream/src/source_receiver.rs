//! Buffering inbound receiver: the consumer half of the pull direction.
//!
//! Buffers data/error frames pushed by the remote source, serves them one at
//! a time to the local consumer on demand, and replenishes the source's
//! credit as frames are fully consumed. Backpressure is the remote sender's
//! job; the frame queue here is not size-limited.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use bytes::Bytes;
use byteduct_wire::Message;
use tracing::{debug, trace, warn};

use crate::buffer::ReadBuffer;
use crate::error::{Result, StreamError};
use crate::task::TaskQueue;
use crate::traits::{MessageHandler, MessageSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// No dispatch in flight. A receive may or may not be registered.
    Idle,
    /// A frame is being handed to the consumer, or the consumer still holds
    /// the buffer. The registered receive stays outstanding until the
    /// buffer is closed.
    Dispatching,
    /// Permanently inert.
    ShutDown,
}

enum PendingFrame {
    Data { bytes: Bytes, offset: usize },
    Error { code: i32 },
}

struct PendingReceive {
    data_cb: Box<dyn FnOnce(ReadBuffer)>,
    error_cb: Box<dyn FnOnce(i32)>,
}

/// Buffering inbound receiver.
///
/// Cheap to clone; all clones share one underlying component. Sends
/// `Init(buffer_size)` to the remote source at construction.
#[derive(Clone)]
pub struct SourceReceiver {
    inner: Rc<RefCell<Inner>>,
}

struct Inner {
    state: State,
    queue: VecDeque<PendingFrame>,
    pending: Option<PendingReceive>,
    /// Set when an error frame has been dispatched; the next accepted
    /// receive sends `Resume` before touching the queue.
    needs_resume: bool,
    chan: Box<dyn MessageSink>,
    fatal_error: i32,
    tasks: TaskQueue,
}

impl SourceReceiver {
    /// Create a receiver bound to `chan` and advertise `buffer_size` bytes
    /// of initial credit to the remote source.
    ///
    /// `fatal_error` is the code handed to an outstanding receive's error
    /// callback when the channel is lost or the component is shut down.
    pub fn new(
        tasks: TaskQueue,
        chan: impl MessageSink + 'static,
        buffer_size: u32,
        fatal_error: i32,
    ) -> Self {
        let mut chan: Box<dyn MessageSink> = Box::new(chan);
        let lost = chan.send(Message::Init { buffer_size }).is_err();
        let receiver = Self {
            inner: Rc::new(RefCell::new(Inner {
                state: if lost { State::ShutDown } else { State::Idle },
                queue: VecDeque::new(),
                pending: None,
                needs_resume: false,
                chan,
                fatal_error,
                tasks,
            })),
        };
        if lost {
            debug!("channel lost before Init; source receiver starts inert");
        }
        receiver
    }

    /// Register exactly one outstanding read.
    ///
    /// Exactly one of the two callbacks fires per accepted call, always
    /// asynchronously: `data_cb` with a buffer over the unconsumed suffix
    /// of the front frame, or `error_cb` with a peer-reported (or fatal)
    /// error code. The read stays outstanding until the buffer is closed.
    pub fn receive(
        &self,
        data_cb: impl FnOnce(ReadBuffer) + 'static,
        error_cb: impl FnOnce(i32) + 'static,
    ) -> Result<()> {
        let resume_failed = {
            let mut inner = self.inner.borrow_mut();
            if inner.state == State::ShutDown {
                return Err(StreamError::ShutDown);
            }
            if inner.pending.is_some() || inner.state == State::Dispatching {
                return Err(StreamError::ReceiveOutstanding);
            }
            inner.pending = Some(PendingReceive {
                data_cb: Box::new(data_cb),
                error_cb: Box::new(error_cb),
            });
            if inner.needs_resume {
                inner.needs_resume = false;
                trace!("sending Resume before further receives");
                inner.chan.send(Message::Resume).is_err()
            } else {
                false
            }
        };
        if resume_failed {
            Inner::tear_down(&self.inner);
        } else {
            Inner::maybe_dispatch(&self.inner);
        }
        Ok(())
    }

    /// True while a receive is outstanding.
    pub fn receive_outstanding(&self) -> bool {
        let inner = self.inner.borrow();
        inner.pending.is_some() || inner.state == State::Dispatching
    }

    /// Frames received from the peer but not yet fully consumed.
    pub fn buffered_frames(&self) -> usize {
        self.inner.borrow().queue.len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.borrow().state == State::ShutDown
    }

    /// Tear the component down. Idempotent.
    ///
    /// An outstanding receive's error callback fires (asynchronously) with
    /// the fatal code; all future `receive` calls fail.
    pub fn shutdown(&self) {
        Inner::tear_down(&self.inner);
    }
}

impl MessageHandler for SourceReceiver {
    fn on_message(&self, msg: Message) {
        match msg {
            Message::Data { bytes } => Inner::on_data(&self.inner, bytes),
            Message::Error { code } => Inner::on_error(&self.inner, code),
            other => {
                warn!(kind = other.kind(), "unexpected message for source receiver");
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
        let violation = {
            let mut inner = cell.borrow_mut();
            if inner.state == State::ShutDown {
                return;
            }
            if bytes.is_empty() {
                true
            } else {
                trace!(bytes = bytes.len(), "data frame buffered");
                inner.queue.push_back(PendingFrame::Data { bytes, offset: 0 });
                false
            }
        };
        if violation {
            warn!("empty data frame from peer");
            Inner::tear_down(cell);
        } else {
            Inner::maybe_dispatch(cell);
        }
    }

    fn on_error(cell: &Rc<RefCell<Inner>>, code: i32) {
        {
            let mut inner = cell.borrow_mut();
            if inner.state == State::ShutDown {
                return;
            }
            trace!(code, "error frame buffered");
            inner.queue.push_back(PendingFrame::Error { code });
        }
        Inner::maybe_dispatch(cell);
    }

    /// Hand the front frame to the registered receive, if both exist and no
    /// dispatch is already in flight. Always defers through the task queue.
    fn maybe_dispatch(cell: &Rc<RefCell<Inner>>) {
        let tasks = {
            let mut inner = cell.borrow_mut();
            if inner.state != State::Idle || inner.pending.is_none() || inner.queue.is_empty() {
                return;
            }
            inner.state = State::Dispatching;
            inner.tasks.clone()
        };
        let weak = Rc::downgrade(cell);
        tasks.post(move || {
            if let Some(cell) = weak.upgrade() {
                Inner::dispatch(&cell);
            }
        });
    }

    fn dispatch(cell: &Rc<RefCell<Inner>>) {
        enum Handoff {
            Data(Box<dyn FnOnce(ReadBuffer)>, ReadBuffer),
            Error(Box<dyn FnOnce(i32)>, i32),
        }

        let handoff = {
            let mut inner = cell.borrow_mut();
            if inner.state != State::Dispatching {
                return;
            }
            // Owned copy of the front frame's unconsumed suffix, or None
            // for an error frame; ends the queue borrow before mutation.
            let suffix = match inner.queue.front() {
                None => {
                    inner.state = State::Idle;
                    return;
                }
                Some(PendingFrame::Data { bytes, offset }) => Some(bytes.slice(*offset..)),
                Some(PendingFrame::Error { .. }) => None,
            };
            let pending = inner.pending.take().expect("dispatch without receive");
            match suffix {
                Some(suffix) => {
                    let weak = Rc::downgrade(cell);
                    let buffer = ReadBuffer::new(
                        suffix,
                        Box::new(move |bytes_consumed, error| {
                            if let Some(cell) = weak.upgrade() {
                                Inner::on_consumed(&cell, bytes_consumed, error);
                            }
                        }),
                    );
                    Handoff::Data(pending.data_cb, buffer)
                }
                None => {
                    let Some(PendingFrame::Error { code }) = inner.queue.pop_front() else {
                        unreachable!("front frame changed under dispatch")
                    };
                    inner.needs_resume = true;
                    inner.state = State::Idle;
                    debug!(code, "dispatching error frame");
                    Handoff::Error(pending.error_cb, code)
                }
            }
        };

        // The cell is not borrowed here: callbacks may call back in.
        match handoff {
            Handoff::Data(data_cb, buffer) => data_cb(buffer),
            Handoff::Error(error_cb, code) => error_cb(code),
        }
    }

    fn on_consumed(cell: &Rc<RefCell<Inner>>, bytes_consumed: usize, _error: Option<i32>) {
        let report_failed = {
            let mut inner = cell.borrow_mut();
            if inner.state == State::ShutDown {
                return;
            }
            debug_assert_eq!(inner.state, State::Dispatching);
            inner.state = State::Idle;

            let Some(PendingFrame::Data { bytes, offset }) = inner.queue.front_mut() else {
                debug_assert!(false, "consume completion without a data frame");
                return;
            };
            debug_assert!(bytes_consumed <= bytes.len() - *offset);
            *offset += bytes_consumed;
            trace!(bytes_consumed, remaining = bytes.len() - *offset, "buffer closed");

            if *offset == bytes.len() {
                let count = bytes.len() as u32;
                inner.queue.pop_front();
                inner.chan.send(Message::ReportBytesReceived { count }).is_err()
            } else {
                false
            }
        };
        if report_failed {
            Inner::tear_down(cell);
        } else {
            // A receive registered from inside the consumer callback may
            // already be waiting for the remainder or the next frame.
            Inner::maybe_dispatch(cell);
        }
    }

    fn tear_down(cell: &Rc<RefCell<Inner>>) {
        let (pending, code, tasks) = {
            let mut inner = cell.borrow_mut();
            if inner.state == State::ShutDown {
                return;
            }
            inner.state = State::ShutDown;
            inner.queue.clear();
            (inner.pending.take(), inner.fatal_error, inner.tasks.clone())
        };
        debug!(code, "source receiver is inert");
        if let Some(p) = pending {
            tasks.post(move || (p.error_cb)(code));
        }
    }
}
