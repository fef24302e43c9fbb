//! Timer thread for discovery ticks and periodic tasks.
//!
//! All tasks run one after another on the scheduler thread, so a task must
//! not block for long. Commands reach the thread over a channel; the thread
//! owns the task list.

use crate::error::{Error, Result};
use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Handle of a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

type Task = Box<dyn FnMut() + Send + 'static>;

enum Command {
    Schedule { id: TaskId, first_run: Instant, interval: Option<Duration>, task: Task },
    Cancel(TaskId),
    Stop,
}

struct Entry {
    id: TaskId,
    next_run: Instant,
    interval: Option<Duration>,
    task: Task,
}

// Upper bound on how long the thread sleeps with nothing scheduled
const IDLE_WAIT: Duration = Duration::from_secs(1);

pub struct Scheduler {
    commands: Mutex<Option<Sender<Command>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    live: Mutex<HashSet<TaskId>>,
    next_id: AtomicU64,
}

impl Scheduler {
    pub fn new(name: &str) -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        let thread = thread::Builder::new().name(name.to_string()).spawn(move || run(rx))?;
        Ok(Scheduler {
            commands: Mutex::new(Some(tx)),
            thread: Mutex::new(Some(thread)),
            live: Mutex::new(HashSet::new()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Run `task` after `first_delay`, then every `interval`.
    pub fn schedule_repeating<F>(
        &self,
        first_delay: Duration,
        interval: Duration,
        task: F,
    ) -> Result<TaskId>
    where
        F: FnMut() + Send + 'static,
    {
        self.submit(first_delay, Some(interval), Box::new(task))
    }

    /// Run `task` once after `delay`.
    pub fn schedule_once<F>(&self, delay: Duration, task: F) -> Result<TaskId>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut task = Some(task);
        self.submit(delay, None, Box::new(move || {
            if let Some(task) = task.take() {
                task()
            }
        }))
    }

    fn submit(&self, delay: Duration, interval: Option<Duration>, task: Task) -> Result<TaskId> {
        let id = TaskId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let first_run = Instant::now() + delay;
        self.live.lock().unwrap_or_else(PoisonError::into_inner).insert(id);
        self.send(Command::Schedule { id, first_run, interval, task }).inspect_err(|_| {
            self.live.lock().unwrap_or_else(PoisonError::into_inner).remove(&id);
        })?;
        Ok(id)
    }

    /// Cancel a task. A run already in progress completes. Returns `false`
    /// for unknown or already cancelled IDs.
    pub fn cancel(&self, id: TaskId) -> bool {
        let known = self.live.lock().unwrap_or_else(PoisonError::into_inner).remove(&id);
        if known {
            let _ = self.send(Command::Cancel(id));
        }
        known
    }

    pub fn is_scheduled(&self, id: TaskId) -> bool {
        self.live.lock().unwrap_or_else(PoisonError::into_inner).contains(&id)
    }

    fn send(&self, command: Command) -> Result<()> {
        let commands = self.commands.lock().unwrap_or_else(PoisonError::into_inner);
        match commands.as_ref() {
            Some(tx) => tx.send(command).map_err(|_| Error::ShutDown),
            None => Err(Error::ShutDown),
        }
    }

    /// Drop every task and join the thread. Idempotent.
    pub fn stop(&self) {
        if let Some(tx) = self.commands.lock().unwrap_or_else(PoisonError::into_inner).take() {
            let _ = tx.send(Command::Stop);
        }
        self.live.lock().unwrap_or_else(PoisonError::into_inner).clear();
        if let Some(handle) = self.thread.lock().unwrap_or_else(PoisonError::into_inner).take() {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                log::error!(target: "runtime", "Scheduler thread panicked");
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(rx: Receiver<Command>) {
    let mut entries: Vec<Entry> = Vec::new();
    loop {
        let now = Instant::now();
        let wait = entries
            .iter()
            .map(|e| e.next_run.saturating_duration_since(now))
            .min()
            .unwrap_or(IDLE_WAIT);

        match rx.recv_timeout(wait) {
            Ok(Command::Schedule { id, first_run, interval, task }) => {
                entries.push(Entry { id, next_run: first_run, interval, task })
            }
            Ok(Command::Cancel(id)) => entries.retain(|e| e.id != id),
            Ok(Command::Stop) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }

        let now = Instant::now();
        let mut finished = Vec::new();
        for entry in entries.iter_mut().filter(|e| e.next_run <= now) {
            if panic::catch_unwind(AssertUnwindSafe(|| (entry.task)())).is_err() {
                log::error!(target: "runtime", "Scheduled task {:?} panicked", entry.id);
            }
            match entry.interval {
                Some(interval) => {
                    entry.next_run += interval;
                    // Skip missed periods instead of bursting to catch up
                    if entry.next_run <= now {
                        entry.next_run = now + interval;
                    }
                }
                None => finished.push(entry.id),
            }
        }
        entries.retain(|e| !finished.contains(&e.id));
    }
}
