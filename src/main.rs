//! dirfetch - fetch a directory tree from a dirfetchd server
//!
//! Received files are rebuilt under the output directory (`output/` by
//! default), keeping their paths relative to the requested directory's
//! parent.

use anyhow::{Context, Result};
use clap::Parser;

use dirfetch::cli::{init_tracing, ClientOpts};
use dirfetch::fetch;
use dirfetch::progress::FetchProgress;

fn main() -> Result<()> {
    let opts = ClientOpts::parse();
    init_tracing(opts.verbose);
    let config = opts.to_config();
    config.validate().context("Invalid arguments")?;

    let mut progress = if opts.quiet {
        FetchProgress::hidden()
    } else {
        FetchProgress::new(opts.verbose)
    };

    match fetch(&config, |file| progress.file_received(file)) {
        Ok(_) => {
            progress.finish_success();
            Ok(())
        }
        Err(e) => {
            progress.finish_error(&e.to_string());
            Err(e).with_context(|| {
                format!(
                    "Failed to fetch '{}' from {}",
                    config.directory,
                    config.server_addr()
                )
            })
        }
    }
}
