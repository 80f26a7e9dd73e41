//! Client-side progress spinner
//!
//! File names scroll above a single status line that carries the running
//! file and byte counts.

use indicatif::{ProgressBar, ProgressStyle};
use std::time::{Duration, Instant};

use crate::client::ReceivedFile;

pub struct FetchProgress {
    spinner: ProgressBar,
    start_time: Instant,
    files: u64,
    bytes: u64,
    show_files: bool,
}

impl FetchProgress {
    pub fn new(show_files: bool) -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"),
        );
        spinner.enable_steady_tick(Duration::from_millis(100));
        spinner.set_message("Waiting for server");

        Self {
            spinner,
            start_time: Instant::now(),
            files: 0,
            bytes: 0,
            show_files,
        }
    }

    /// Hidden progress for non-interactive runs
    pub fn hidden() -> Self {
        Self {
            spinner: ProgressBar::hidden(),
            start_time: Instant::now(),
            files: 0,
            bytes: 0,
            show_files: false,
        }
    }

    pub fn file_received(&mut self, file: &ReceivedFile) {
        self.files += 1;
        self.bytes += file.size as u64;
        if self.show_files {
            self.spinner.println(format!("  {} ({} bytes)", file.name, file.size));
        }
        self.spinner.set_message(format!(
            "Receiving {} files ({:.1} MB) in {:.1}s",
            self.files,
            self.bytes as f64 / 1_048_576.0,
            self.start_time.elapsed().as_secs_f64()
        ));
    }

    pub fn finish_success(&self) {
        let secs = self.start_time.elapsed().as_secs_f64();
        let throughput = if secs > 0.0 {
            self.bytes as f64 / secs / 1_048_576.0
        } else {
            0.0
        };
        self.spinner.finish_with_message(format!(
            "Completed {} files ({:.1} MB) in {:.1}s ({:.1} MB/s)",
            self.files,
            self.bytes as f64 / 1_048_576.0,
            secs,
            throughput
        ));
    }

    pub fn finish_error(&self, msg: &str) {
        self.spinner.abandon_with_message(format!("Failed: {msg}"));
    }
}
