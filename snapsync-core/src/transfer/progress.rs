//! Byte and file progress for a sync transaction.
//!
//! The library never prints; progress is reported through `tracing` at most
//! once per reporting interval, plus a final summary.

use std::time::{Duration, Instant};

const REPORT_INTERVAL: Duration = Duration::from_secs(2);

/// Snapshot of transfer progress
#[derive(Debug, Clone, Default)]
pub struct TransferProgress {
    /// Total bytes to transfer
    pub total_bytes: u64,

    /// Bytes transferred so far
    pub transferred_bytes: u64,

    /// Number of files transferred
    pub files_done: usize,

    /// Total number of files to transfer
    pub total_files: usize,

    /// Current transfer speed in bytes/second
    pub bytes_per_second: u64,

    /// Estimated time remaining (seconds)
    pub eta_seconds: u64,
}

impl TransferProgress {
    pub fn percent_complete(&self) -> f64 {
        if self.total_bytes > 0 {
            (self.transferred_bytes as f64 / self.total_bytes as f64) * 100.0
        } else if self.total_files > 0 {
            (self.files_done as f64 / self.total_files as f64) * 100.0
        } else {
            100.0
        }
    }

    pub fn is_complete(&self) -> bool {
        self.files_done >= self.total_files
    }
}

/// Progress tracker with time-based speed calculation
pub struct SyncProgress {
    start_time: Instant,
    last_update_time: Instant,
    last_report_time: Option<Instant>,
    last_bytes: u64,
    progress: TransferProgress,
}

impl SyncProgress {
    pub fn new(total_bytes: u64, total_files: usize) -> Self {
        let now = Instant::now();
        Self {
            start_time: now,
            last_update_time: now,
            last_report_time: None,
            last_bytes: 0,
            progress: TransferProgress {
                total_bytes,
                total_files,
                ..TransferProgress::default()
            },
        }
    }

    /// Record one finished file of `bytes` bytes.
    pub fn file_done(&mut self, path: &str, bytes: u64) -> &TransferProgress {
        let transferred = self.progress.transferred_bytes.saturating_add(bytes);
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update_time).as_secs_f64();

        if elapsed > 0.0 {
            let diff = transferred.saturating_sub(self.last_bytes);
            self.progress.bytes_per_second = (diff as f64 / elapsed) as u64;
        }
        if self.progress.bytes_per_second > 0 {
            let remaining = self.progress.total_bytes.saturating_sub(transferred);
            self.progress.eta_seconds = remaining / self.progress.bytes_per_second;
        }

        self.progress.transferred_bytes = transferred;
        self.progress.files_done += 1;
        self.last_update_time = now;
        self.last_bytes = transferred;

        let due = self
            .last_report_time
            .map_or(true, |t| now.duration_since(t) >= REPORT_INTERVAL);
        if due || self.progress.is_complete() {
            self.last_report_time = Some(now);
            tracing::info!(
                path,
                files = %format!("{}/{}", self.progress.files_done, self.progress.total_files),
                transferred = %format_bytes(transferred),
                total = %format_bytes(self.progress.total_bytes),
                speed = %format_speed(self.progress.bytes_per_second),
                eta = %format_duration(self.progress.eta_seconds),
                "Transfer progress"
            );
        }

        &self.progress
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Average speed since start
    pub fn average_speed(&self) -> u64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            (self.progress.transferred_bytes as f64 / elapsed) as u64
        } else {
            0
        }
    }

    pub fn progress(&self) -> &TransferProgress {
        &self.progress
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

pub fn format_speed(bytes_per_second: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_second))
}

pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}
