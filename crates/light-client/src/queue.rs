//! Execution queue
//!
//! A bounded FIFO of closures run by a single consumer thread. The consumer
//! owns a state value of type `S` and hands every task a mutable reference to
//! it, so state that would otherwise need a lock is only ever touched by one
//! thread, one task at a time.
//!
//! - tasks run strictly in submission order, never concurrently
//! - submission never blocks; a full or closed queue refuses the task
//! - capacity counts the queued tasks plus the one currently running
//! - `close` lets the running task finish, drops the rest and waits for the
//!   consumer to stop

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, trace};

/// A unit of work for the consumer
pub type Task<S> = Box<dyn FnOnce(&mut S) + Send + 'static>;

struct Shared<S> {
    tasks: VecDeque<Task<S>>,
    running: bool,
    closed: bool,
    stopped: bool,
}

struct Inner<S> {
    capacity: usize,
    shared: Mutex<Shared<S>>,
    cond: Condvar,
    consumer: Mutex<Option<ThreadId>>,
}

/// Handle to a single-consumer execution queue. Clones share the queue.
pub struct ExecQueue<S = ()> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for ExecQueue<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S> fmt::Debug for ExecQueue<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = self.inner.shared.lock();
        f.debug_struct("ExecQueue")
            .field("capacity", &self.inner.capacity)
            .field("queued", &shared.tasks.len())
            .field("running", &shared.running)
            .field("closed", &shared.closed)
            .finish()
    }
}

impl ExecQueue<()> {
    /// Create a stateless queue holding at most `capacity` tasks
    pub fn new(capacity: usize) -> io::Result<Self> {
        Self::with_state(capacity, ())
    }
}

impl<S: Send + 'static> ExecQueue<S> {
    /// Create a queue whose consumer owns `state`
    pub fn with_state(capacity: usize, state: S) -> io::Result<Self> {
        let inner = Arc::new(Inner {
            capacity,
            shared: Mutex::new(Shared {
                tasks: VecDeque::new(),
                running: false,
                closed: false,
                stopped: false,
            }),
            cond: Condvar::new(),
            consumer: Mutex::new(None),
        });

        let worker = inner.clone();
        let handle = thread::Builder::new()
            .name("exec-queue".into())
            .spawn(move || consume(worker, state))?;
        *inner.consumer.lock() = Some(handle.thread().id());

        debug!(capacity, "execution queue started");
        Ok(Self { inner })
    }
}

impl<S> ExecQueue<S> {
    /// Submit `task`. Returns false if the queue is full or closed.
    pub fn enqueue<F>(&self, task: F) -> bool
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        self.try_enqueue(Box::new(task)).is_ok()
    }

    /// Submit `task`, handing it back if the queue is full or closed
    pub fn try_enqueue(&self, task: Task<S>) -> Result<(), Task<S>> {
        let mut shared = self.inner.shared.lock();
        if shared.closed || !self.has_room(&shared) {
            return Err(task);
        }
        shared.tasks.push_back(task);
        drop(shared);
        self.inner.cond.notify_all();
        Ok(())
    }

    /// Whether a task would currently be accepted. The answer may be stale by
    /// the time the caller acts on it.
    pub fn can_queue(&self) -> bool {
        let shared = self.inner.shared.lock();
        !shared.closed && self.has_room(&shared)
    }

    /// Drop every task that has not started yet. Returns how many were dropped.
    pub fn clear(&self) -> usize {
        let dropped = std::mem::take(&mut self.inner.shared.lock().tasks);
        if !dropped.is_empty() {
            trace!(dropped = dropped.len(), "cleared execution queue");
        }
        dropped.len()
    }

    /// Start shutting down without waiting for the consumer. Returns false if
    /// shutdown had already been initiated.
    pub fn begin_close(&self) -> bool {
        let dropped = {
            let mut shared = self.inner.shared.lock();
            if shared.closed {
                return false;
            }
            shared.closed = true;
            std::mem::take(&mut shared.tasks)
        };
        self.inner.cond.notify_all();
        debug!(dropped = dropped.len(), "execution queue closing");
        true
    }

    /// Shut the queue down: the running task completes, queued tasks are
    /// dropped and the call returns once the consumer has stopped. Called
    /// from a task, it does not wait, as the consumer stops right after.
    pub fn close(&self) {
        self.begin_close();

        let on_consumer = *self.inner.consumer.lock() == Some(thread::current().id());
        if on_consumer {
            return;
        }
        let mut shared = self.inner.shared.lock();
        while !shared.stopped {
            self.inner.cond.wait(&mut shared);
        }
    }

    /// Whether shutdown has been initiated
    pub fn is_closed(&self) -> bool {
        self.inner.shared.lock().closed
    }

    /// Configured capacity
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Tasks waiting to run
    pub fn queued(&self) -> usize {
        self.inner.shared.lock().tasks.len()
    }

    fn has_room(&self, shared: &Shared<S>) -> bool {
        shared.tasks.len() + usize::from(shared.running) < self.inner.capacity
    }
}

fn consume<S>(inner: Arc<Inner<S>>, mut state: S) {
    loop {
        let task = {
            let mut shared = inner.shared.lock();
            shared.running = false;
            loop {
                if shared.closed {
                    break None;
                }
                if let Some(task) = shared.tasks.pop_front() {
                    shared.running = true;
                    break Some(task);
                }
                inner.cond.wait(&mut shared);
            }
        };
        let Some(task) = task else {
            break;
        };

        if panic::catch_unwind(AssertUnwindSafe(|| task(&mut state))).is_err() {
            error!("execution queue task panicked");
        }
    }

    // State goes first so anything it owns is released before closers return
    drop(state);
    let dropped = {
        let mut shared = inner.shared.lock();
        shared.stopped = true;
        std::mem::take(&mut shared.tasks)
    };
    inner.cond.notify_all();
    drop(dropped);
    debug!("execution queue stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_task_sees_state() {
        let queue = ExecQueue::with_state(4, 0u64).unwrap();
        let (tx, rx) = mpsc::channel();
        for _ in 0..3 {
            assert!(queue.enqueue(|n: &mut u64| *n += 1));
        }
        assert!(queue.enqueue(move |n: &mut u64| tx.send(*n).unwrap()));
        assert_eq!(rx.recv().unwrap(), 3);
        queue.close();
    }

    #[test]
    fn test_panicking_task_does_not_stop_consumer() {
        let queue = ExecQueue::new(4).unwrap();
        let (tx, rx) = mpsc::channel();
        assert!(queue.enqueue(|_| panic!("boom")));
        assert!(queue.enqueue(move |_| tx.send(()).unwrap()));
        rx.recv().unwrap();
        queue.close();
    }

    #[test]
    fn test_close_from_task() {
        let queue = ExecQueue::new(4).unwrap();
        let handle = queue.clone();
        let (tx, rx) = mpsc::channel();
        assert!(queue.enqueue(move |_| {
            handle.close();
            tx.send(()).unwrap();
        }));
        rx.recv().unwrap();
        queue.close();
        assert!(queue.is_closed());
    }
}
