use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use dirfetch::cli::{init_tracing, ServerOpts};
use dirfetch::Server;

fn main() -> Result<()> {
    let opts = ServerOpts::parse();
    init_tracing(opts.verbose);
    let mut config = opts.into_config();

    // Canonicalize the root for clearer logging
    config.root = std::fs::canonicalize(&config.root)
        .with_context(|| format!("Failed to canonicalize root path: {}", config.root.display()))?;

    let server = Server::bind(&config)
        .with_context(|| format!("Failed to start server on {}:{}", config.bind, config.port))?;
    info!(
        workers = config.thread_pool_size,
        queue_size = config.queue_size,
        block_size = config.block_size,
        "server initialized"
    );

    let shutdown = server
        .shutdown_handle()
        .context("Failed to resolve listener address")?;
    ctrlc::set_handler(move || {
        info!("shutdown requested, finishing queued transfers");
        shutdown.shutdown();
    })
    .context("Failed to install signal handler")?;

    server.run().context("Server stopped with an error")
}
