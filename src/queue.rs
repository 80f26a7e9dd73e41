//! Bounded task queue shared by every session and every worker
//!
//! Producers (directory walkers) block while the queue is full, consumers
//! (workers) block while it is empty. One lock guards the whole queue;
//! nothing performs I/O while holding it.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;

use crate::session::Session;

/// One regular file waiting to be streamed to its session's client.
#[derive(Debug, Clone)]
pub struct FileTransferTask {
    /// Path the worker opens on the server
    pub absolute_path: PathBuf,
    /// Name sent to the client, relative to the requested root's parent
    pub display_path: String,
    /// Size at scan time; exactly this many bytes are sent
    pub size_bytes: u32,
    pub session: Arc<Session>,
}

struct QueueState {
    tasks: VecDeque<FileTransferTask>,
    closed: bool,
    high_water: usize,
}

/// Fixed-capacity FIFO of [`FileTransferTask`]s.
pub struct TaskQueue {
    state: Mutex<QueueState>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl TaskQueue {
    /// Create a queue holding at most `capacity` tasks (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(QueueState {
                tasks: VecDeque::with_capacity(capacity),
                closed: false,
                high_water: 0,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        }
    }

    /// Append a task, blocking while the queue is full.
    ///
    /// Hands the task back if the queue has been closed.
    pub fn push(&self, task: FileTransferTask) -> Result<(), FileTransferTask> {
        let mut state = self.state.lock();
        while state.tasks.len() >= self.capacity && !state.closed {
            self.not_full.wait(&mut state);
        }
        if state.closed {
            return Err(task);
        }
        state.tasks.push_back(task);
        state.high_water = state.high_water.max(state.tasks.len());
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Remove the oldest task, blocking while the queue is empty.
    ///
    /// Returns `None` only once the queue is closed and drained.
    pub fn pop(&self) -> Option<FileTransferTask> {
        let mut state = self.state.lock();
        while state.tasks.is_empty() {
            if state.closed {
                return None;
            }
            self.not_empty.wait(&mut state);
        }
        let task = state.tasks.pop_front();
        drop(state);
        self.not_full.notify_one();
        task
    }

    /// Stop accepting tasks. Queued tasks are still handed out.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Largest number of tasks ever held at once
    pub fn high_water(&self) -> usize {
        self.state.lock().high_water
    }
}
