use crate::error::{Error, Result};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Mutex, PoisonError};
use std::thread;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Worker {
    id: usize,
    thread: Option<thread::JoinHandle<()>>,
}

impl Worker {
    fn new(id: usize, receiver: Receiver<Job>) -> Result<Worker> {
        let thread = thread::Builder::new()
            .name(format!("pool-worker-{}", id))
            .stack_size(2 * 1024 * 1024)
            .spawn(move || {
                // Ends once every sender is gone and the queue is drained
                for job in receiver {
                    if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                        log::error!(target: "dispatcher", "Handler panicked on pool-worker-{}", id);
                    }
                }
            })?;

        Ok(Worker { id, thread: Some(thread) })
    }
}

/// Fixed set of worker threads, each with its own bounded queue.
///
/// Jobs submitted with the same key always land on the same worker and so
/// run in submission order. Submission never blocks: a full queue is
/// reported as `Error::QueueFull`.
pub struct ThreadPool {
    workers: Mutex<Vec<Worker>>,
    senders: Mutex<Option<Vec<SyncSender<Job>>>>,
    size: usize,
    bound: usize,
    next: AtomicUsize,
}

impl ThreadPool {
    /// Create a pool of `size` workers with `bound` queued jobs per worker.
    pub fn new(size: usize, bound: usize) -> Result<ThreadPool> {
        if size == 0 || bound == 0 {
            return Err(Error::config(
                "thread pool needs at least one worker and a non-zero queue bound",
            ));
        }

        let mut workers = Vec::with_capacity(size);
        let mut senders = Vec::with_capacity(size);
        for id in 0..size {
            let (sender, receiver) = mpsc::sync_channel(bound);
            workers.push(Worker::new(id, receiver)?);
            senders.push(sender);
        }

        Ok(ThreadPool {
            workers: Mutex::new(workers),
            senders: Mutex::new(Some(senders)),
            size,
            bound,
            next: AtomicUsize::new(0),
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn bound(&self) -> usize {
        self.bound
    }

    /// Queue a job.
    ///
    /// `key`: if `Some`, the job is routed to a stable worker based on its
    /// hash, which keeps jobs of one key sequential. `None` spreads jobs
    /// round-robin.
    pub fn try_execute<F, K>(&self, f: F, key: Option<K>) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
        K: Hash,
    {
        let worker_idx = match key {
            Some(k) => {
                let mut hasher = DefaultHasher::new();
                k.hash(&mut hasher);
                (hasher.finish() as usize) % self.size
            }
            None => self.next.fetch_add(1, Ordering::Relaxed) % self.size,
        };

        let senders = self.senders.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(senders) = senders.as_ref() else {
            return Err(Error::ShutDown);
        };
        match senders[worker_idx].try_send(Box::new(f)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(Error::QueueFull { bound: self.bound }),
            Err(TrySendError::Disconnected(_)) => Err(Error::ShutDown),
        }
    }

    /// Stop accepting jobs, let queued and running jobs finish, and join the
    /// workers. A worker calling this does not join itself.
    pub fn shutdown(&self) {
        self.senders.lock().unwrap_or_else(PoisonError::into_inner).take();

        let workers: Vec<Worker> =
            std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        for mut worker in workers {
            if let Some(handle) = worker.thread.take() {
                if handle.thread().id() == thread::current().id() {
                    continue;
                }
                if handle.join().is_err() {
                    log::error!(
                        target: "dispatcher",
                        "pool-worker-{} terminated abnormally",
                        worker.id
                    );
                }
            }
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.senders.lock().unwrap_or_else(PoisonError::into_inner).is_none()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
