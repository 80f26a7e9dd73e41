//! Shared protocol constants for the dirfetch wire format
//!
//! ```text
//! REQUEST (client -> server):  [path bytes][0x00]
//!
//! PER FILE (server -> client):
//!   [name bytes][0x00]
//!   [4 bytes BE: size]
//!   [size bytes: raw file data]
//!
//! COMPLETION MARKER:           [0x00]
//! ```

/// Terminates the request path and every file name.
pub const NUL: u8 = 0;

/// Width of the size field that follows each file name.
pub const SIZE_FIELD_LEN: usize = 4;

/// Completion marker: an empty name.
pub const COMPLETION_MARKER: &[u8] = &[NUL];

// Longest request path the server accepts (PATH_MAX on Linux)
pub const MAX_REQUEST_LEN: usize = 4096;

// Longest file name the client accepts before giving up on the stream
pub const MAX_NAME_LEN: usize = 4096;

/// Largest file the size field can describe.
pub const MAX_FILE_SIZE: u64 = u32::MAX as u64;

/// Socket read size used by the server while receiving a request.
pub const REQUEST_READ_SIZE: usize = 50;

/// Default socket read size for the client.
pub const DEFAULT_CLIENT_READ_SIZE: usize = 4096;

/// Default output directory for reconstructed trees.
pub const DEFAULT_OUTPUT_DIR: &str = "output";
