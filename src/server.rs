//! Acceptor loop and per-connection session driver
//!
//! One thread per accepted connection reads the request, walks the
//! requested directory onto the shared task queue, waits for the worker
//! pool to finish every task of the session, then writes the completion
//! marker and closes the socket.

use std::io::{self, Read};
use std::net::{IpAddr, Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, info, warn};

use crate::codec::{Request, RequestDecoder};
use crate::error::{Result, TransferError};
use crate::protocol::REQUEST_READ_SIZE;
use crate::queue::TaskQueue;
use crate::session::Session;
use crate::walker::{resolve_request_dir, DirectoryWalker};
use crate::worker::WorkerPool;

/// Validated server settings
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: IpAddr,
    pub port: u16,
    pub thread_pool_size: usize,
    pub queue_size: usize,
    pub block_size: usize,
    /// Directory requests are resolved against
    pub root: PathBuf,
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("thread_pool_size", self.thread_pool_size),
            ("queue_size", self.queue_size),
            ("block_size", self.block_size),
        ] {
            if value == 0 {
                return Err(TransferError::Io(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("{name} must be at least 1"),
                )));
            }
        }
        let meta = std::fs::metadata(&self.root)
            .map_err(|e| TransferError::filesystem(&self.root, e))?;
        if !meta.is_dir() {
            return Err(TransferError::filesystem(
                &self.root,
                io::Error::other("root is not a directory"),
            ));
        }
        Ok(())
    }
}

/// State shared by every connection thread
struct ServerContext {
    root: PathBuf,
    queue: Arc<TaskQueue>,
    walker: DirectoryWalker,
    next_session: AtomicU64,
}

pub struct Server {
    listener: TcpListener,
    ctx: Arc<ServerContext>,
    pool: WorkerPool,
}

/// Stops a running [`Server`] from another thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    queue: Arc<TaskQueue>,
    wake_addr: SocketAddr,
}

impl ShutdownHandle {
    /// Close the task queue and unblock the acceptor. Queued tasks are
    /// still served before the workers exit.
    pub fn shutdown(&self) {
        self.queue.close();
        // accept() only returns on a connection; give it one.
        let _ = TcpStream::connect(self.wake_addr);
    }
}

impl Server {
    /// Bind the listener and start the worker pool.
    pub fn bind(config: &ServerConfig) -> Result<Self> {
        config.validate()?;
        let listener = TcpListener::bind((config.bind, config.port))?;
        let queue = Arc::new(TaskQueue::new(config.queue_size));
        let pool = WorkerPool::spawn(
            config.thread_pool_size,
            Arc::clone(&queue),
            config.block_size,
        )?;
        info!(
            addr = %listener.local_addr()?,
            root = %config.root.display(),
            queue_size = queue.capacity(),
            "dirfetchd listening"
        );
        let ctx = Arc::new(ServerContext {
            root: config.root.clone(),
            walker: DirectoryWalker::new(Arc::clone(&queue)),
            queue,
            next_session: AtomicU64::new(1),
        });
        Ok(Self {
            listener,
            ctx,
            pool,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn queue(&self) -> Arc<TaskQueue> {
        Arc::clone(&self.ctx.queue)
    }

    pub fn shutdown_handle(&self) -> io::Result<ShutdownHandle> {
        let mut wake_addr = self.local_addr()?;
        if wake_addr.ip().is_unspecified() {
            wake_addr.set_ip(IpAddr::V4(Ipv4Addr::LOCALHOST));
        }
        Ok(ShutdownHandle {
            queue: self.queue(),
            wake_addr,
        })
    }

    /// Accept connections until shut down, one driver thread each.
    pub fn run(self) -> Result<()> {
        for conn in self.listener.incoming() {
            if self.ctx.queue.is_closed() {
                break;
            }
            match conn {
                Ok(stream) => {
                    let ctx = Arc::clone(&self.ctx);
                    let id = ctx.next_session.fetch_add(1, Ordering::Relaxed);
                    let spawned = thread::Builder::new()
                        .name(format!("dirfetch-session-{id}"))
                        .spawn(move || handle_conn(stream, &ctx, id));
                    if let Err(e) = spawned {
                        warn!(error = %e, "failed to spawn session thread");
                    }
                }
                Err(e) => {
                    warn!(error = %e, "accept error");
                }
            }
        }
        info!(workers = self.pool.size(), "acceptor stopped, draining worker pool");
        self.pool.join();
        Ok(())
    }
}

fn handle_conn(stream: TcpStream, ctx: &ServerContext, id: u64) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(session = id, error = %e, "failed to set TCP_NODELAY");
    }
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    info!(session = id, %peer, "connection accepted");

    let writer = match stream.try_clone() {
        Ok(w) => w,
        Err(e) => {
            warn!(session = id, error = %e, "failed to clone socket");
            return;
        }
    };
    let session = Session::new(id, peer, Box::new(writer));
    let mut reader = &stream;
    let result = drive_session(&mut reader, &session, &ctx.root, &ctx.walker);
    let _ = stream.shutdown(Shutdown::Both);

    let stats = session.stats();
    match result {
        Ok(()) => info!(
            session = id,
            peer = session.peer(),
            files = stats.files_sent(),
            bytes = stats.bytes_sent(),
            abandoned = stats.abandoned(),
            "session complete"
        ),
        Err(TransferError::ConnectionClosed) => {
            info!(session = id, "client closed connection before request")
        }
        Err(e) => warn!(
            session = id,
            peer = session.peer(),
            error = %e,
            files = stats.files_sent(),
            abandoned = stats.abandoned(),
            "session closed without completion marker"
        ),
    }
}

enum SessionState {
    ReceivingRequest,
    Walking(Request),
    AwaitingCompletion(Option<TransferError>),
    Draining,
    Closed(Option<TransferError>),
}

/// Run one connection from request to completion marker.
///
/// Errors mean the socket must be closed without a completion marker.
/// By the time this returns no task of `session` is queued or in flight.
pub fn drive_session<R: Read + ?Sized>(
    reader: &mut R,
    session: &Arc<Session>,
    root: &Path,
    walker: &DirectoryWalker,
) -> Result<()> {
    let mut state = SessionState::ReceivingRequest;
    loop {
        state = match state {
            SessionState::ReceivingRequest => match read_request(reader) {
                Ok(request) => SessionState::Walking(request),
                Err(e) => SessionState::Closed(Some(e)),
            },
            SessionState::Walking(request) => {
                let dir = resolve_request_dir(root, &request.path);
                info!(
                    session = session.id(),
                    request = %request.path,
                    dir = %dir.display(),
                    "request received"
                );
                let walked = {
                    let _walk = session.begin_walk();
                    walker.walk(&dir, request.display_root(), session)
                };
                SessionState::AwaitingCompletion(walked.err())
            }
            SessionState::AwaitingCompletion(walk_error) => {
                // Tasks queued before a walk error still hold the socket.
                session.wait_for_drain();
                match walk_error {
                    Some(e) => SessionState::Closed(Some(e)),
                    None if session.is_broken() => SessionState::Closed(Some(
                        TransferError::Protocol("stream broken by a failed file transfer".into()),
                    )),
                    None => SessionState::Draining,
                }
            }
            SessionState::Draining => match session.send_completion_marker() {
                Ok(()) => SessionState::Closed(None),
                Err(e) => SessionState::Closed(Some(e)),
            },
            SessionState::Closed(None) => return Ok(()),
            SessionState::Closed(Some(e)) => return Err(e),
        };
    }
}

fn read_request<R: Read + ?Sized>(reader: &mut R) -> Result<Request> {
    let mut decoder = RequestDecoder::new();
    let mut buf = [0u8; REQUEST_READ_SIZE];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => return Err(TransferError::ConnectionClosed),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        if let Some((request, _used)) = decoder.feed(&buf[..n])? {
            debug!(path = %request.path, prefix_len = request.prefix_len, "request decoded");
            return Ok(request);
        }
    }
}
