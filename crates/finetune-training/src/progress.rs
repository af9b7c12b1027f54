//! Per-run diagnostic log.
//!
//! Lines written here are for humans only; nothing reads them back.

use crate::run::RunId;
use chrono::Local;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

pub trait ProgressSink: Send + Sync {
    fn log(&self, run_id: &RunId, message: &str);
}

/// Appends `[HH:MM:SS] message` lines to a run's `train.log` and mirrors them
/// into `tracing`.
#[derive(Debug)]
pub struct FileProgressSink {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileProgressSink {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path, lock: Mutex::new(()) }
    }

    fn append(&self, line: &str) -> std::io::Result<()> {
        let _guard = self.lock.lock().map_err(|_| std::io::Error::other("log lock poisoned"))?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(file, "{line}")
    }
}

impl ProgressSink for FileProgressSink {
    fn log(&self, run_id: &RunId, message: &str) {
        tracing::info!(run_id = %run_id, "{message}");
        let line = format!("[{}] {message}", Local::now().format("%H:%M:%S"));
        if let Err(e) = self.append(&line) {
            tracing::warn!(run_id = %run_id, path = %self.path.display(), error = %e, "Failed to append run log");
        }
    }
}

/// Collects messages in memory.
#[derive(Debug, Default)]
pub struct MemoryProgressSink {
    lines: Mutex<Vec<String>>,
}

impl MemoryProgressSink {
    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }
}

impl ProgressSink for MemoryProgressSink {
    fn log(&self, _run_id: &RunId, message: &str) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(message.to_string());
        }
    }
}
