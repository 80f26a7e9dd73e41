//! Per-connection state shared between the session driver and workers
//!
//! A session owns the write half of its connection and counts the tasks
//! it has handed to the worker pool. The driver waits on that count
//! before sending the completion marker.
//!
//! Lock order: the transfer lock and the counter lock are never held at
//! the same time.

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::fmt;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

use crate::codec::write_completion_marker;
use crate::error::Result;

/// Write half of a client connection.
pub type SessionWriter = Box<dyn Write + Send>;

/// Counters reported when the session closes.
#[derive(Debug, Default)]
pub struct SessionStats {
    pub files_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
    /// Tasks given up on (open failure, broken stream, write failure)
    pub abandoned: AtomicU64,
    /// Times the outstanding counter dropped to zero
    pub drains: AtomicU64,
}

impl SessionStats {
    pub fn files_sent(&self) -> u64 {
        self.files_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn abandoned(&self) -> u64 {
        self.abandoned.load(Ordering::Relaxed)
    }

    pub fn drains(&self) -> u64 {
        self.drains.load(Ordering::Relaxed)
    }
}

pub struct Session {
    id: u64,
    peer: String,
    transfer: Mutex<SessionWriter>,
    outstanding: Mutex<usize>,
    drained: Condvar,
    broken: AtomicBool,
    stats: SessionStats,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("outstanding", &self.outstanding())
            .field("broken", &self.is_broken())
            .finish()
    }
}

impl Session {
    pub fn new(id: u64, peer: impl Into<String>, writer: SessionWriter) -> Arc<Self> {
        Arc::new(Self {
            id,
            peer: peer.into(),
            transfer: Mutex::new(writer),
            outstanding: Mutex::new(0),
            drained: Condvar::new(),
            broken: AtomicBool::new(false),
            stats: SessionStats::default(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Count a task that is about to become visible to workers.
    pub fn register_task(&self) {
        *self.outstanding.lock() += 1;
    }

    /// Count a finished (or abandoned) task and wake the driver at zero.
    pub fn complete_task(&self) {
        let mut outstanding = self.outstanding.lock();
        if *outstanding == 0 {
            error!(session = self.id, "task completed with no outstanding tasks");
            return;
        }
        *outstanding -= 1;
        if *outstanding == 0 {
            self.stats.drains.fetch_add(1, Ordering::Relaxed);
            drop(outstanding);
            self.drained.notify_all();
        }
    }

    pub fn outstanding(&self) -> usize {
        *self.outstanding.lock()
    }

    /// Block until every registered task has completed.
    pub fn wait_for_drain(&self) {
        let mut outstanding = self.outstanding.lock();
        while *outstanding > 0 {
            self.drained.wait(&mut outstanding);
        }
        debug!(session = self.id, "all tasks drained");
    }

    /// Hold the counter above zero for the duration of a walk.
    pub fn begin_walk(&self) -> WalkGuard<'_> {
        WalkGuard::new(self)
    }

    /// Exclusive access to the socket for one whole file record.
    pub fn lock_transfer(&self) -> MutexGuard<'_, SessionWriter> {
        self.transfer.lock()
    }

    /// The byte stream can no longer be framed; later tasks are dropped.
    pub fn mark_broken(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }

    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::SeqCst)
    }

    pub(crate) fn record_file(&self, bytes: u64) {
        self.stats.files_sent.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_abandoned(&self) {
        self.stats.abandoned.fetch_add(1, Ordering::Relaxed);
    }

    /// Write the empty-name record that ends the transfer.
    pub fn send_completion_marker(&self) -> Result<()> {
        let mut writer = self.lock_transfer();
        write_completion_marker(&mut **writer)
    }

    #[cfg(test)]
    pub(crate) fn for_test() -> Arc<Self> {
        Session::new(0, "test", Box::new(std::io::sink()))
    }
}

/// RAII registration held by the session driver while it walks
pub struct WalkGuard<'a> {
    session: &'a Session,
}

impl<'a> WalkGuard<'a> {
    fn new(session: &'a Session) -> Self {
        session.register_task();
        Self { session }
    }
}

impl Drop for WalkGuard<'_> {
    fn drop(&mut self) {
        self.session.complete_task();
    }
}
