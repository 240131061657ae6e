//! Deferred-callback scheduling for one connection.
//!
//! All components of a connection share one [`TaskQueue`]. Components never
//! invoke user callbacks from within the call that triggered them; they post
//! the invocation here instead, and the connection's owner drains the queue
//! from its event loop. Everything is single-threaded and cooperative.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

type Task = Box<dyn FnOnce()>;

/// A FIFO queue of deferred callbacks, shared by clone.
#[derive(Clone, Default)]
pub struct TaskQueue {
    inner: Rc<RefCell<VecDeque<Task>>>,
}

impl TaskQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a task for later execution.
    pub fn post(&self, task: impl FnOnce() + 'static) {
        self.inner.borrow_mut().push_back(Box::new(task));
    }

    /// Run queued tasks, in order, until the queue is empty.
    ///
    /// Tasks posted while draining run in the same call. The queue is not
    /// borrowed while a task runs, so tasks may post further tasks and call
    /// back into any component.
    ///
    /// Returns the number of tasks run.
    pub fn run_until_idle(&self) -> usize {
        let mut ran = 0usize;
        loop {
            let task = self.inner.borrow_mut().pop_front();
            match task {
                Some(task) => {
                    task();
                    ran += 1;
                }
                None => return ran,
            }
        }
    }

    /// Number of tasks currently queued.
    pub fn pending(&self) -> usize {
        self.inner.borrow().len()
    }

    /// True if nothing is queued.
    pub fn is_idle(&self) -> bool {
        self.inner.borrow().is_empty()
    }
}
