//! Shared CLI option structs for dirfetchd and dirfetch

use clap::Parser;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use crate::client::ClientConfig;
use crate::protocol::{DEFAULT_CLIENT_READ_SIZE, DEFAULT_OUTPUT_DIR};
use crate::server::ServerConfig;

/// Server options
#[derive(Clone, Debug, Parser)]
#[command(
    name = "dirfetchd",
    version,
    about = "Serve directory trees to dirfetch clients from a fixed worker pool"
)]
pub struct ServerOpts {
    /// Port to listen on
    #[arg(short = 'p', long)]
    pub port: u16,

    /// Number of worker threads streaming files
    #[arg(short = 's', long = "thread-pool-size")]
    pub thread_pool_size: usize,

    /// Maximum number of queued file transfers
    #[arg(short = 'q', long = "queue-size")]
    pub queue_size: usize,

    /// Block size in bytes for reading and sending file contents
    #[arg(short = 'b', long = "block-size")]
    pub block_size: usize,

    /// Address to bind
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub bind: IpAddr,

    /// Directory requests are resolved against
    #[arg(long, default_value = ".")]
    pub root: PathBuf,

    /// Debug-level logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl ServerOpts {
    pub fn into_config(self) -> ServerConfig {
        ServerConfig {
            bind: self.bind,
            port: self.port,
            thread_pool_size: self.thread_pool_size,
            queue_size: self.queue_size,
            block_size: self.block_size,
            root: self.root,
        }
    }
}

/// Client options
#[derive(Clone, Debug, Parser)]
#[command(
    name = "dirfetch",
    version,
    about = "Fetch a directory tree from a dirfetchd server"
)]
pub struct ClientOpts {
    /// Server IP address
    #[arg(short = 'i', long = "server-ip")]
    pub server_ip: IpAddr,

    /// Server port
    #[arg(short = 'p', long)]
    pub port: u16,

    /// Directory to fetch, relative to the server root (no trailing '/')
    #[arg(short = 'd', long)]
    pub directory: String,

    /// Local directory the tree is rebuilt under
    #[arg(long, default_value = DEFAULT_OUTPUT_DIR)]
    pub output: PathBuf,

    /// Socket read size in bytes
    #[arg(long, default_value_t = DEFAULT_CLIENT_READ_SIZE)]
    pub read_size: usize,

    /// Debug-level logging
    #[arg(short, long)]
    pub verbose: bool,

    /// No progress spinner
    #[arg(long)]
    pub quiet: bool,
}

impl ClientOpts {
    pub fn to_config(&self) -> ClientConfig {
        ClientConfig {
            server: self.server_ip,
            port: self.port,
            directory: self.directory.clone(),
            output: self.output.clone(),
            read_size: self.read_size,
        }
    }
}

/// Install the stderr log subscriber. `RUST_LOG` overrides the level.
pub fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
