//! Progress bar utilities for bundle operations
//!
//! Provides progress indicators for embedding files using indicatif.

use indicatif::{ProgressBar, ProgressStyle};

/// Style presets for different types of progress indicators
pub struct ProgressStyles;

impl ProgressStyles {
    /// Style for file processing operations (shows count and speed)
    pub fn files() -> ProgressStyle {
        ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec}) {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▓▒░  ")
    }

    /// Style for byte-based operations (shows size and speed)
    pub fn bytes() -> ProgressStyle {
        ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}) {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▓▒░  ")
    }

    /// Style for success message
    pub fn success() -> ProgressStyle {
        ProgressStyle::with_template("{prefix:.green} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
    }

    /// Style for error message
    pub fn error() -> ProgressStyle {
        ProgressStyle::with_template("{prefix:.red} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
    }
}

/// Helper trait for progress bar operations
pub trait ProgressExt {
    /// Finish with a success message
    fn finish_success(&self, msg: &str);

    /// Finish with an error message
    fn finish_error(&self, msg: &str);

    /// Update message and increment
    fn tick_with_message(&self, msg: &str);
}

impl ProgressExt for ProgressBar {
    fn finish_success(&self, msg: &str) {
        self.set_style(ProgressStyles::success());
        self.set_prefix("✓");
        self.finish_with_message(msg.to_string());
    }

    fn finish_error(&self, msg: &str) {
        self.set_style(ProgressStyles::error());
        self.set_prefix("✗");
        self.finish_with_message(msg.to_string());
    }

    fn tick_with_message(&self, msg: &str) {
        self.set_message(msg.to_string());
        self.inc(1);
    }
}

/// Create a progress bar counting files
pub fn progress_bar(total: u64, msg: &str) -> ProgressBar {
    let pb = ProgressBar::new(total);
    pb.set_style(ProgressStyles::files());
    pb.set_message(msg.to_string());
    pb
}

/// Create a progress bar counting bytes
pub fn bytes_bar(total: u64, msg: &str) -> ProgressBar {
    let pb = ProgressBar::new(total);
    pb.set_style(ProgressStyles::bytes());
    pb.set_message(msg.to_string());
    pb
}
