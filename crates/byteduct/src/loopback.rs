//! In-process channel: a pair of connected endpoints that deliver messages
//! to each other through the shared task queue.
//!
//! Delivery is always deferred, never synchronous with `send`, so a
//! component's handler is never entered while the sending component still
//! holds its own state borrowed. Messages sent before the receiving side
//! has attached a handler are held back and delivered once it does.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use byteduct_stream::{ChannelLost, MessageHandler, MessageSink, TaskQueue};
use byteduct_wire::Message;
use tracing::trace;

struct Side {
    handler: Option<Box<dyn MessageHandler>>,
    backlog: VecDeque<Message>,
}

/// One end of an in-process message channel.
///
/// Clones share the same end. Use it as the [`MessageSink`] for the local
/// component and attach that component as the handler for inbound traffic.
#[derive(Clone)]
pub struct LoopbackEndpoint {
    local: Rc<RefCell<Side>>,
    peer: Rc<RefCell<Side>>,
    open: Rc<Cell<bool>>,
    tasks: TaskQueue,
}

/// Create a connected endpoint pair over `tasks`.
pub fn loopback(tasks: &TaskQueue) -> (LoopbackEndpoint, LoopbackEndpoint) {
    let a = Rc::new(RefCell::new(Side {
        handler: None,
        backlog: VecDeque::new(),
    }));
    let b = Rc::new(RefCell::new(Side {
        handler: None,
        backlog: VecDeque::new(),
    }));
    let open = Rc::new(Cell::new(true));
    (
        LoopbackEndpoint {
            local: Rc::clone(&a),
            peer: Rc::clone(&b),
            open: Rc::clone(&open),
            tasks: tasks.clone(),
        },
        LoopbackEndpoint {
            local: b,
            peer: a,
            open,
            tasks: tasks.clone(),
        },
    )
}

impl LoopbackEndpoint {
    /// Attach the component that consumes this end's inbound messages.
    /// Any held-back messages are delivered on the next queue pump.
    pub fn set_handler(&self, handler: impl MessageHandler + 'static) {
        self.local.borrow_mut().handler = Some(Box::new(handler));
        let local = Rc::clone(&self.local);
        self.tasks.post(move || Side::deliver(&local));
    }

    /// Drop the connection. Both handlers get `on_channel_closed` and all
    /// further sends from either end fail.
    pub fn close(&self) {
        if !self.open.replace(false) {
            return;
        }
        trace!("loopback channel closed");
        for cell in [&self.local, &self.peer] {
            let cell = Rc::clone(cell);
            self.tasks.post(move || {
                let handler = cell.borrow_mut().handler.take();
                if let Some(handler) = handler {
                    handler.on_channel_closed();
                    let mut side = cell.borrow_mut();
                    if side.handler.is_none() {
                        side.handler = Some(handler);
                    }
                }
            });
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.get()
    }
}

impl MessageSink for LoopbackEndpoint {
    fn send(&mut self, msg: Message) -> Result<(), ChannelLost> {
        if !self.open.get() {
            return Err(ChannelLost);
        }
        trace!(kind = msg.kind(), "message queued for peer");
        self.peer.borrow_mut().backlog.push_back(msg);
        let peer = Rc::clone(&self.peer);
        self.tasks.post(move || Side::deliver(&peer));
        Ok(())
    }
}

impl Side {
    /// Hand queued messages to the handler, one at a time, with the cell
    /// released so the handler may send replies through its own endpoint.
    fn deliver(cell: &Rc<RefCell<Side>>) {
        loop {
            let (handler, msg) = {
                let mut side = cell.borrow_mut();
                let Some(handler) = side.handler.take() else {
                    return;
                };
                match side.backlog.pop_front() {
                    Some(msg) => (handler, msg),
                    None => {
                        side.handler = Some(handler);
                        return;
                    }
                }
            };
            handler.on_message(msg);
            let mut side = cell.borrow_mut();
            if side.handler.is_none() {
                side.handler = Some(handler);
            }
        }
    }
}
