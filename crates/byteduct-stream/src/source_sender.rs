//! Credit-based outbound sender: the source half of the pull direction.
//!
//! Pulls bytes from a local [`Producer`] only while the peer has advertised
//! receive credit, transmits each produced prefix as one data frame, and
//! pauses on producer-reported errors until the peer sends `Resume`.

use std::cell::RefCell;
use std::rc::Rc;

use bytes::BytesMut;
use byteduct_wire::Message;
use tracing::{debug, trace, warn};

use crate::buffer::WriteBuffer;
use crate::task::TaskQueue;
use crate::traits::{MessageHandler, MessageSink, Producer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// No pull outstanding; will pull as soon as credit allows.
    Idle,
    /// The producer holds a write buffer.
    Pulling,
    /// A producer error went out; waiting for the peer's `Resume`.
    Paused,
    /// Permanently inert.
    ShutDown,
}

/// Credit-based outbound sender.
///
/// Cheap to clone; all clones share one underlying component. Bound to one
/// channel endpoint for its whole life: incoming peer messages arrive via
/// [`MessageHandler`], outgoing frames leave via the [`MessageSink`] given
/// at construction.
#[derive(Clone)]
pub struct SourceSender {
    inner: Rc<RefCell<Inner>>,
}

struct Inner {
    state: State,
    credit: u32,
    initialized: bool,
    chan: Box<dyn MessageSink>,
    producer: Option<Box<dyn Producer>>,
    fatal_handler: Option<Box<dyn FnOnce(i32)>>,
    fatal_error: i32,
    tasks: TaskQueue,
}

impl SourceSender {
    /// Create a sender bound to `chan`.
    ///
    /// `fatal_error` is the designated code reported to `fatal_handler`
    /// (and nowhere else) when the channel is lost or the peer violates the
    /// protocol. Pulling starts once the peer sends `Init`.
    pub fn new(
        tasks: TaskQueue,
        chan: impl MessageSink + 'static,
        producer: impl Producer + 'static,
        fatal_error: i32,
        fatal_handler: impl FnOnce(i32) + 'static,
    ) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                state: State::Idle,
                credit: 0,
                initialized: false,
                chan: Box::new(chan),
                producer: Some(Box::new(producer)),
                fatal_handler: Some(Box::new(fatal_handler)),
                fatal_error,
                tasks,
            })),
        }
    }

    /// Peer-advertised receive capacity still available, in bytes.
    pub fn available_capacity(&self) -> u32 {
        self.inner.borrow().credit
    }

    /// True after a producer error, until the peer sends `Resume`.
    pub fn is_paused(&self) -> bool {
        self.inner.borrow().state == State::Paused
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.borrow().state == State::ShutDown
    }

    /// Tear the component down. Idempotent.
    ///
    /// An outstanding producer buffer becomes inert (closing it is ignored).
    /// The fatal handler is not invoked; shutdown is owner-initiated.
    pub fn shutdown(&self) {
        let mut inner = self.inner.borrow_mut();
        if inner.state == State::ShutDown {
            return;
        }
        inner.state = State::ShutDown;
        inner.producer = None;
        inner.fatal_handler = None;
        debug!("source sender shut down");
    }
}

impl MessageHandler for SourceSender {
    fn on_message(&self, msg: Message) {
        match msg {
            Message::Init { buffer_size } => Inner::on_init(&self.inner, buffer_size),
            Message::ReportBytesReceived { count } => {
                Inner::on_bytes_received(&self.inner, count)
            }
            Message::Resume => Inner::on_resume(&self.inner),
            other => {
                warn!(kind = other.kind(), "unexpected message for source sender");
                Inner::dispatch_fatal(&self.inner);
            }
        }
    }

    fn on_channel_closed(&self) {
        Inner::dispatch_fatal(&self.inner);
    }
}

enum After {
    Nothing,
    Pull,
    Violation(&'static str),
    Fatal,
}

impl Inner {
    fn on_init(cell: &Rc<RefCell<Inner>>, buffer_size: u32) {
        let after = {
            let mut inner = cell.borrow_mut();
            if inner.state == State::ShutDown {
                After::Nothing
            } else if inner.initialized {
                After::Violation("Init received twice")
            } else {
                inner.initialized = true;
                inner.credit = buffer_size;
                trace!(credit = buffer_size, "source sender initialized");
                After::Pull
            }
        };
        Inner::run_after(cell, after);
    }

    fn on_bytes_received(cell: &Rc<RefCell<Inner>>, count: u32) {
        let after = {
            let mut inner = cell.borrow_mut();
            if inner.state == State::ShutDown {
                After::Nothing
            } else {
                match inner.credit.checked_add(count) {
                    Some(credit) => {
                        inner.credit = credit;
                        trace!(count, credit, "credit replenished");
                        if inner.state == State::Idle {
                            After::Pull
                        } else {
                            After::Nothing
                        }
                    }
                    None => After::Violation("credit counter overflow"),
                }
            }
        };
        Inner::run_after(cell, after);
    }

    fn on_resume(cell: &Rc<RefCell<Inner>>) {
        let after = {
            let mut inner = cell.borrow_mut();
            match inner.state {
                State::ShutDown => After::Nothing,
                State::Pulling => After::Violation("Resume while a pull is outstanding"),
                State::Paused => {
                    inner.state = State::Idle;
                    debug!("resumed after producer error");
                    After::Pull
                }
                State::Idle => After::Pull,
            }
        };
        Inner::run_after(cell, after);
    }

    fn run_after(cell: &Rc<RefCell<Inner>>, after: After) {
        match after {
            After::Nothing => {}
            After::Pull => Inner::schedule_pull(cell),
            After::Violation(what) => {
                warn!(what, "protocol violation on source channel");
                Inner::dispatch_fatal(cell);
            }
            After::Fatal => Inner::dispatch_fatal(cell),
        }
    }

    /// Post a pull attempt. Pulls always run as their own task so a pull
    /// completing synchronously can never recurse into the next one.
    fn schedule_pull(cell: &Rc<RefCell<Inner>>) {
        let tasks = {
            let inner = cell.borrow();
            if inner.state != State::Idle || inner.credit == 0 {
                return;
            }
            inner.tasks.clone()
        };
        let weak = Rc::downgrade(cell);
        tasks.post(move || {
            if let Some(cell) = weak.upgrade() {
                Inner::pull(&cell);
            }
        });
    }

    fn pull(cell: &Rc<RefCell<Inner>>) {
        let (mut producer, buffer) = {
            let mut inner = cell.borrow_mut();
            if inner.state != State::Idle || inner.credit == 0 {
                return;
            }
            let Some(producer) = inner.producer.take() else {
                return;
            };
            inner.state = State::Pulling;
            trace!(granted = inner.credit, "pulling from producer");

            let weak = Rc::downgrade(cell);
            let buffer = WriteBuffer::new(
                inner.credit as usize,
                Box::new(move |data, bytes_written, error| {
                    if let Some(cell) = weak.upgrade() {
                        Inner::on_produced(&cell, data, bytes_written, error);
                    }
                }),
            );
            (producer, buffer)
        };

        // The cell is not borrowed here: the producer may close the buffer
        // synchronously, which calls back into this component.
        producer.produce(buffer);

        let mut inner = cell.borrow_mut();
        if inner.state != State::ShutDown {
            inner.producer = Some(producer);
        }
    }

    fn on_produced(
        cell: &Rc<RefCell<Inner>>,
        mut data: BytesMut,
        bytes_written: usize,
        error: Option<i32>,
    ) {
        let after = {
            let mut inner = cell.borrow_mut();
            if inner.state == State::ShutDown {
                return;
            }
            debug_assert_eq!(inner.state, State::Pulling);
            inner.state = State::Idle;

            let produced = bytes_written as u32;
            debug_assert!(produced <= inner.credit);
            inner.credit -= produced;

            let mut lost = false;
            if bytes_written > 0 {
                data.truncate(bytes_written);
                lost = inner
                    .chan
                    .send(Message::Data {
                        bytes: data.freeze(),
                    })
                    .is_err();
                trace!(bytes = bytes_written, credit = inner.credit, "frame sent");
            }

            if lost {
                After::Fatal
            } else if let Some(code) = error {
                let lost = inner.chan.send(Message::Error { code }).is_err();
                inner.state = State::Paused;
                debug!(code, "producer reported error; pausing");
                if lost {
                    After::Fatal
                } else {
                    After::Nothing
                }
            } else if bytes_written > 0 && inner.credit > 0 {
                After::Pull
            } else {
                After::Nothing
            }
        };
        Inner::run_after(cell, after);
    }

    fn dispatch_fatal(cell: &Rc<RefCell<Inner>>) {
        let (handler, code, tasks) = {
            let mut inner = cell.borrow_mut();
            if inner.state == State::ShutDown {
                return;
            }
            inner.state = State::ShutDown;
            inner.producer = None;
            (
                inner.fatal_handler.take(),
                inner.fatal_error,
                inner.tasks.clone(),
            )
        };
        debug!(code, "fatal error; source sender is inert");
        if let Some(handler) = handler {
            tasks.post(move || handler(code));
        }
    }
}
