//! Human-readable run log that survives checkpoint/resume.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// One logged line and the training time at which it was written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEntry {
    pub elapsed_secs: f64,
    pub message: String,
}

/// Serialized form of a [`ProgressLogger`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressLog {
    /// Training time accumulated before the last save.
    pub elapsed_secs: f64,
    pub entries: Vec<ProgressEntry>,
}

/// Records log lines with elapsed training time and emits them via `tracing`.
///
/// Elapsed time accumulates across runs: a logger restored from a
/// checkpoint continues from the saved total.
#[derive(Debug)]
pub struct ProgressLogger {
    previous: Duration,
    started: Instant,
    entries: Vec<ProgressEntry>,
}

impl Default for ProgressLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressLogger {
    pub fn new() -> Self {
        Self {
            previous: Duration::ZERO,
            started: Instant::now(),
            entries: Vec::new(),
        }
    }

    /// Restore a saved log and replay its lines.
    pub fn resume(log: ProgressLog) -> Self {
        let previous = if log.elapsed_secs.is_finite() && log.elapsed_secs > 0.0 {
            Duration::from_secs_f64(log.elapsed_secs)
        } else {
            Duration::ZERO
        };
        let logger = Self {
            previous,
            started: Instant::now(),
            entries: log.entries,
        };
        logger.replay();
        logger
    }

    pub fn elapsed(&self) -> Duration {
        self.previous + self.started.elapsed()
    }

    pub fn log(&mut self, message: impl Into<String>) {
        let message = message.into();
        let elapsed_secs = self.elapsed().as_secs_f64();
        tracing::info!(elapsed = %format_elapsed(elapsed_secs), "{message}");
        self.entries.push(ProgressEntry {
            elapsed_secs,
            message,
        });
    }

    /// Re-emit every recorded line.
    pub fn replay(&self) {
        if self.entries.is_empty() {
            return;
        }
        tracing::info!(lines = self.entries.len(), "Replaying progress log from checkpoint");
        for entry in &self.entries {
            tracing::info!(elapsed = %format_elapsed(entry.elapsed_secs), "{}", entry.message);
        }
    }

    pub fn entries(&self) -> &[ProgressEntry] {
        &self.entries
    }

    /// Snapshot for a checkpoint. Does not reset the clock.
    pub fn to_log(&self) -> ProgressLog {
        ProgressLog {
            elapsed_secs: self.elapsed().as_secs_f64(),
            entries: self.entries.clone(),
        }
    }
}

/// `h:mm:ss` for log output.
pub fn format_elapsed(secs: f64) -> String {
    let total = secs.max(0.0) as u64;
    format!("{}:{:02}:{:02}", total / 3600, (total / 60) % 60, total % 60)
}
