//! Fixed pool of transfer workers
//!
//! Each worker pops a task, takes the owning session's transfer lock,
//! streams the file record onto the socket and reports completion to the
//! session. Workers live until the queue is closed and drained.

use std::fs::File;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

use crate::codec::write_file_header;
use crate::error::{Result, TransferError};
use crate::queue::{FileTransferTask, TaskQueue};

/// What happened to one task
#[derive(Debug)]
pub enum TaskOutcome {
    Sent { bytes: u64 },
    /// Nothing was written; the connection carries on
    Skipped(TransferError),
    /// The record was cut short; the session's stream is unusable
    Failed(TransferError),
    /// An earlier failure already broke the session's stream
    Dropped,
}

pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Start `size` workers servicing `queue` with `block_size` reads.
    pub fn spawn(size: usize, queue: Arc<TaskQueue>, block_size: usize) -> Result<Self> {
        let block_size = block_size.max(1);
        let mut handles = Vec::with_capacity(size);
        for id in 0..size {
            let queue = Arc::clone(&queue);
            let handle = thread::Builder::new()
                .name(format!("dirfetch-worker-{id}"))
                .spawn(move || worker_loop(id, &queue, block_size))?;
            handles.push(handle);
        }
        info!(workers = size, block_size, "worker pool started");
        Ok(Self { handles })
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Wait for every worker to exit. Returns once the queue is closed
    /// and drained.
    pub fn join(self) {
        for handle in self.handles {
            if handle.join().is_err() {
                warn!("worker thread panicked");
            }
        }
    }
}

fn worker_loop(id: usize, queue: &TaskQueue, block_size: usize) {
    debug!(worker = id, "worker starting");
    let mut buf = vec![0u8; block_size];
    while let Some(task) = queue.pop() {
        let outcome = transfer_file(&task, &mut buf);
        let session = &task.session;
        match &outcome {
            TaskOutcome::Sent { bytes } => {
                session.record_file(*bytes);
                debug!(
                    worker = id,
                    session = session.id(),
                    file = %task.display_path,
                    bytes,
                    "file sent"
                );
            }
            TaskOutcome::Skipped(err) => {
                session.record_abandoned();
                warn!(worker = id, session = session.id(), error = %err, "skipping file");
            }
            TaskOutcome::Failed(err) => {
                session.record_abandoned();
                warn!(
                    worker = id,
                    session = session.id(),
                    file = %task.display_path,
                    error = %err,
                    "transfer failed, abandoning session stream"
                );
            }
            TaskOutcome::Dropped => {
                session.record_abandoned();
            }
        }
        // Transfer lock is released by now; the counter is only touched after.
        session.complete_task();
    }
    debug!(worker = id, "worker exiting");
}

/// Stream one file record onto the task's session.
pub fn transfer_file(task: &FileTransferTask, buf: &mut [u8]) -> TaskOutcome {
    let session = &task.session;
    let mut writer = session.lock_transfer();
    if session.is_broken() {
        return TaskOutcome::Dropped;
    }

    let file = match File::open(&task.absolute_path) {
        Ok(f) => f,
        Err(e) => {
            return TaskOutcome::Skipped(TransferError::filesystem(&task.absolute_path, e));
        }
    };

    if let Err(err) = write_file_header(&mut **writer, &task.display_path, task.size_bytes) {
        if matches!(err, TransferError::ProtocolWrite(_)) {
            session.mark_broken();
            return TaskOutcome::Failed(err);
        }
        return TaskOutcome::Skipped(err);
    }

    match send_contents(file, &mut **writer, task, buf) {
        Ok(bytes) => TaskOutcome::Sent { bytes },
        Err(err) => {
            session.mark_broken();
            TaskOutcome::Failed(err)
        }
    }
}

/// Copy exactly `size_bytes` from `file` to `writer` in `buf`-sized blocks.
fn send_contents<W: Write + ?Sized>(
    mut file: File,
    writer: &mut W,
    task: &FileTransferTask,
    buf: &mut [u8],
) -> Result<u64> {
    let mut remaining = task.size_bytes as u64;
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let n = match file.read(&mut buf[..want]) {
            Ok(0) => {
                return Err(TransferError::filesystem(
                    &task.absolute_path,
                    io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("file shrank: {remaining} bytes short"),
                    ),
                ));
            }
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(TransferError::filesystem(&task.absolute_path, e)),
        };
        writer
            .write_all(&buf[..n])
            .map_err(TransferError::ProtocolWrite)?;
        remaining -= n as u64;
    }
    writer.flush().map_err(TransferError::ProtocolWrite)?;
    Ok(task.size_bytes as u64)
}
