//! dirfetch library
//!
//! Concurrent directory transfer: the server walks a requested directory
//! onto a bounded task queue serviced by a fixed worker pool, and the
//! client rebuilds the streamed tree locally.

pub mod cli;
pub mod client;
pub mod codec;
pub mod error;
pub mod progress;
pub mod protocol;
pub mod queue;
pub mod server;
pub mod session;
pub mod walker;
pub mod worker;

pub use client::{fetch, ClientConfig, FetchSummary, ReceivedFile};
pub use error::TransferError;
pub use queue::{FileTransferTask, TaskQueue};
pub use server::{Server, ServerConfig, ShutdownHandle};
pub use session::Session;
