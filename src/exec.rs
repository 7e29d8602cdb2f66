//! The execution queue: every stateful datastore operation runs through
//! one of these, strictly one at a time.
//!
//! Operations invoked from the outside run immediately and block until
//! done, which trivially preserves program order. Work discovered *during*
//! a task (a TTL-triggered removal found mid-read, say) is deferred and
//! drained in FIFO order once the current task returns. A panicking user
//! callback unwinds through the executor without wedging it: the busy flag
//! is reset on the way out, and whatever was deferred runs at the start of
//! the next task.

use std::cell::{ Cell, RefCell };
use std::collections::VecDeque;
use std::fmt;

/// A unit of deferred work.
type Task = Box<dyn FnOnce()>;

/// The single FIFO task queue of one datastore.
pub struct Executor {
    /// Work deferred while a task was running.
    queue: RefCell<VecDeque<Task>>,
    /// Whether a task is currently running.
    busy: Cell<bool>,
}

impl Executor {
    /// Creates an idle executor.
    pub fn new() -> Self {
        Executor {
            queue: RefCell::new(VecDeque::new()),
            busy: Cell::new(false),
        }
    }

    /// Runs a task to completion and returns its result.
    ///
    /// A nested call (from a user callback running inside another task) is
    /// executed immediately: it is logically part of the task that invoked
    /// the callback.
    pub fn run<R, F: FnOnce() -> R>(&self, task: F) -> R {
        if self.busy.get() {
            return task();
        }

        self.busy.set(true);
        let _guard = BusyGuard(&self.busy);

        // Leftovers from a predecessor that panicked mid-drain.
        self.drain();
        let result = task();
        self.drain();

        result
    }

    /// Schedules work to run after the current task (immediately, when
    /// idle). Deferred tasks run in submission order.
    pub fn defer(&self, task: Task) {
        if self.busy.get() {
            self.queue.borrow_mut().push_back(task);
        } else {
            self.run(task);
        }
    }

    /// Runs deferred tasks until the queue is empty. Tasks may defer
    /// further work; it is picked up in the same pass.
    fn drain(&self) {
        loop {
            let next = self.queue.borrow_mut().pop_front();
            match next {
                Some(task) => task(),
                None => break,
            }
        }
    }
}

impl Default for Executor {
    fn default() -> Self {
        Executor::new()
    }
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Executor")
            .field("busy", &self.busy.get())
            .field("deferred", &self.queue.borrow().len())
            .finish()
    }
}

/// Clears the busy flag even when the task unwinds.
struct BusyGuard<'a>(&'a Cell<bool>);

impl<'a> Drop for BusyGuard<'a> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}
