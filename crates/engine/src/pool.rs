//! Fixed-size worker pool over a bounded queue.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, error, warn};

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Why a task was not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("worker queue is full")]
    Saturated,
    #[error("worker pool is shut down")]
    Closed,
}

#[derive(Debug, Default)]
struct Occupancy {
    queued: AtomicUsize,
    active: AtomicUsize,
}

/// `threads` named workers consuming a queue of at most `capacity` tasks.
///
/// Submission never blocks: a full queue is reported as
/// [`SubmitError::Saturated`] so the caller can apply backpressure.
pub struct WorkerPool {
    name: String,
    capacity: usize,
    sender: Mutex<Option<SyncSender<Task>>>,
    occupancy: Arc<Occupancy>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("queued", &self.queued())
            .field("active", &self.active())
            .finish()
    }
}

impl WorkerPool {
    pub fn new(name: impl Into<String>, threads: usize, capacity: usize) -> std::io::Result<Self> {
        let name = name.into();
        let (sender, receiver) = mpsc::sync_channel::<Task>(capacity);
        let receiver = Arc::new(Mutex::new(receiver));
        let occupancy = Arc::new(Occupancy::default());

        let mut workers = Vec::with_capacity(threads);
        for index in 0..threads {
            let receiver = receiver.clone();
            let occupancy = occupancy.clone();
            let worker_name = format!("{name}-worker-{index}");
            let join = thread::Builder::new()
                .name(worker_name.clone())
                .spawn(move || worker_loop(&worker_name, &receiver, &occupancy))?;
            workers.push(join);
        }

        Ok(Self {
            name,
            capacity,
            sender: Mutex::new(Some(sender)),
            occupancy,
            workers: Mutex::new(workers),
        })
    }

    /// Queue a task without blocking.
    pub fn try_submit<F>(&self, task: F) -> Result<(), SubmitError>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = sender.as_ref() else {
            return Err(SubmitError::Closed);
        };

        self.occupancy.queued.fetch_add(1, Ordering::SeqCst);
        match sender.try_send(Box::new(task)) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.occupancy.queued.fetch_sub(1, Ordering::SeqCst);
                match err {
                    TrySendError::Full(_) => Err(SubmitError::Saturated),
                    TrySendError::Disconnected(_) => Err(SubmitError::Closed),
                }
            }
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Tasks waiting for a worker.
    pub fn queued(&self) -> usize {
        self.occupancy.queued.load(Ordering::SeqCst)
    }

    /// Tasks currently running.
    pub fn active(&self) -> usize {
        self.occupancy.active.load(Ordering::SeqCst)
    }

    pub fn remaining_capacity(&self) -> usize {
        self.capacity.saturating_sub(self.queued())
    }

    pub fn is_idle(&self) -> bool {
        self.active() == 0 && self.queued() == 0
    }

    /// Close the queue, let queued and running tasks finish, and wait up to `timeout`.
    ///
    /// Returns `false` if some workers were still busy at the deadline; those
    /// threads are detached and left to finish on their own.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        drop(
            self.sender
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );

        let workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        let deadline = Instant::now() + timeout;
        let mut pending = workers;
        loop {
            let (finished, running): (Vec<_>, Vec<_>) =
                pending.into_iter().partition(|w| w.is_finished());
            for worker in finished {
                let _ = worker.join();
            }
            if running.is_empty() {
                debug!(pool = %self.name, "worker pool drained");
                return true;
            }
            if Instant::now() >= deadline {
                warn!(
                    pool = %self.name,
                    abandoned = running.len(),
                    queued = self.queued(),
                    active = self.active(),
                    "worker pool shutdown timed out; abandoning busy workers"
                );
                return false;
            }
            pending = running;
            thread::sleep(Duration::from_millis(10));
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Closing the queue lets idle workers exit; busy ones finish their task first.
        drop(
            self.sender
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
    }
}

fn worker_loop(name: &str, receiver: &Mutex<Receiver<Task>>, occupancy: &Occupancy) {
    loop {
        let next = receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .recv();
        let Ok(task) = next else {
            break;
        };

        occupancy.active.fetch_add(1, Ordering::SeqCst);
        occupancy.queued.fetch_sub(1, Ordering::SeqCst);

        if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
            error!(worker = name, "task panicked");
        }

        occupancy.active.fetch_sub(1, Ordering::SeqCst);
    }
    debug!(worker = name, "worker stopped");
}
