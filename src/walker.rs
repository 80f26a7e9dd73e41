//! Directory walker: the producer side of the task queue
//!
//! Every regular file under the requested directory becomes one
//! [`FileTransferTask`]. Directories are descended, everything else
//! (symlinks, devices, sockets, fifos) is ignored.
//!
//! Failure policy: permission denied below the root skips that entry or
//! subtree; any other error ends the walk.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{Result, TransferError};
use crate::protocol::MAX_FILE_SIZE;
use crate::queue::{FileTransferTask, TaskQueue};
use crate::session::Session;

/// Totals for one walk
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WalkSummary {
    pub files_queued: u64,
    pub bytes_queued: u64,
    /// Entries or subtrees left out (permission denied, unframeable)
    pub skipped: u64,
}

pub struct DirectoryWalker {
    queue: Arc<TaskQueue>,
}

impl DirectoryWalker {
    pub fn new(queue: Arc<TaskQueue>) -> Self {
        Self { queue }
    }

    /// Queue every regular file under `dir` for `session`.
    ///
    /// Names sent to the client are `display_root` followed by the path
    /// below `dir`. Tasks queued before an error stay queued; the caller
    /// decides whether to wait for them.
    pub fn walk(
        &self,
        dir: &Path,
        display_root: &str,
        session: &Arc<Session>,
    ) -> Result<WalkSummary> {
        let meta = std::fs::metadata(dir).map_err(|e| TransferError::filesystem(dir, e))?;
        if !meta.is_dir() {
            return Err(TransferError::filesystem(
                dir,
                io::Error::other("not a directory"),
            ));
        }

        let mut summary = WalkSummary::default();
        let walker = WalkDir::new(dir)
            .follow_links(false)
            .min_depth(1)
            .sort_by_file_name();

        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(err) => {
                    let depth = err.depth();
                    let path = err
                        .path()
                        .map(Path::to_path_buf)
                        .unwrap_or_else(|| dir.to_path_buf());
                    let err = TransferError::filesystem(path, io::Error::from(err));
                    if depth > 0 && err.is_permission_denied() {
                        warn!(session = session.id(), error = %err, "skipping subtree");
                        summary.skipped += 1;
                        continue;
                    }
                    return Err(err);
                }
            };

            if !entry.file_type().is_file() {
                // Directories are descended by walkdir; the rest is ignored.
                continue;
            }

            let size = match entry.metadata() {
                Ok(m) => m.len(),
                Err(err) => {
                    let err = TransferError::filesystem(entry.path(), io::Error::from(err));
                    if err.is_permission_denied() {
                        warn!(session = session.id(), error = %err, "skipping file");
                        summary.skipped += 1;
                        continue;
                    }
                    return Err(err);
                }
            };
            if size > MAX_FILE_SIZE {
                warn!(
                    session = session.id(),
                    path = %entry.path().display(),
                    size,
                    "file too large for the size field, skipping"
                );
                summary.skipped += 1;
                continue;
            }

            let Some(display_path) = display_name(dir, entry.path(), display_root) else {
                warn!(
                    session = session.id(),
                    path = %entry.path().display(),
                    "file name is not UTF-8, skipping"
                );
                summary.skipped += 1;
                continue;
            };

            self.enqueue(FileTransferTask {
                absolute_path: entry.path().to_path_buf(),
                display_path,
                size_bytes: size as u32,
                session: Arc::clone(session),
            })?;
            summary.files_queued += 1;
            summary.bytes_queued += size;
        }

        debug!(
            session = session.id(),
            files = summary.files_queued,
            bytes = summary.bytes_queued,
            skipped = summary.skipped,
            "walk finished"
        );
        Ok(summary)
    }

    fn enqueue(&self, task: FileTransferTask) -> Result<()> {
        // Count first: a worker may finish the task before push returns.
        let session = Arc::clone(&task.session);
        session.register_task();
        if self.queue.push(task).is_err() {
            session.complete_task();
            return Err(TransferError::QueueClosed);
        }
        Ok(())
    }
}

/// `display_root/relative/path` with `/` separators
fn display_name(dir: &Path, path: &Path, display_root: &str) -> Option<String> {
    let rel = path.strip_prefix(dir).ok()?;
    let mut name = String::from(display_root);
    for component in rel.components() {
        if !name.is_empty() {
            name.push('/');
        }
        name.push_str(component.as_os_str().to_str()?);
    }
    Some(name)
}

/// Server-side location of a request: `root` joined with the request path.
pub fn resolve_request_dir(root: &Path, request_path: &str) -> PathBuf {
    request_path
        .split('/')
        .filter(|c| !c.is_empty())
        .fold(root.to_path_buf(), |acc, c| acc.join(c))
}
