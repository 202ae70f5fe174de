//! FIFO completion dispatcher.
//!
//! Handlers are never run while the channel state is locked. They are queued
//! here and run by whichever caller finds the dispatcher idle. A handler that
//! re-enters the channel queues its own completions behind the current ones
//! and returns; the outer [`Dispatcher::run`] loop picks them up, so nesting
//! depth stays constant no matter how many completions chain.

use parking_lot::Mutex;
use std::collections::VecDeque;

pub(crate) type Completion = Box<dyn FnOnce() + Send>;

struct Queue {
    completions: VecDeque<Completion>,
    running: bool,
}

pub(crate) struct Dispatcher {
    queue: Mutex<Queue>,
}

impl Dispatcher {
    pub(crate) fn new() -> Self {
        Self {
            queue: Mutex::new(Queue {
                completions: VecDeque::new(),
                running: false,
            }),
        }
    }

    pub(crate) fn schedule(&self, completions: Vec<Completion>) {
        if completions.is_empty() {
            return;
        }
        self.queue.lock().completions.extend(completions);
    }

    /// Runs queued completions until the queue is empty.
    ///
    /// Returns immediately if another frame (or thread) is already running
    /// them.
    pub(crate) fn run(&self) {
        {
            let mut queue = self.queue.lock();
            if queue.running {
                return;
            }
            queue.running = true;
        }

        let mut guard = RunGuard {
            dispatcher: self,
            armed: true,
        };

        loop {
            let next = {
                let mut queue = self.queue.lock();
                match queue.completions.pop_front() {
                    Some(completion) => completion,
                    None => {
                        queue.running = false;
                        guard.armed = false;
                        return;
                    }
                }
            };

            next();
        }
    }
}

// Releases the running flag if a handler unwinds.
struct RunGuard<'a> {
    dispatcher: &'a Dispatcher,
    armed: bool,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.dispatcher.queue.lock().running = false;
        }
    }
}
