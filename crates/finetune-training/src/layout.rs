use crate::run::RunId;
use std::path::{Path, PathBuf};

/// Filesystem layout for per-run artifacts.
///
/// Everything a run writes lives under `<root>/runs/<run_id>/...`, so
/// concurrently executing runs never share a path.
#[derive(Debug, Clone)]
pub struct RunLayout {
    root: PathBuf,
}

impl RunLayout {
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn run_dir(&self, run_id: &RunId) -> PathBuf {
        self.root.join("runs").join(run_id.as_str())
    }

    #[must_use]
    pub fn log_path(&self, run_id: &RunId) -> PathBuf {
        self.run_dir(run_id).join("train.log")
    }

    #[must_use]
    pub fn checkpoints_dir(&self, run_id: &RunId) -> PathBuf {
        self.run_dir(run_id).join("checkpoints")
    }

    #[must_use]
    pub fn checkpoint_path(&self, run_id: &RunId, step: u64) -> PathBuf {
        self.checkpoints_dir(run_id).join(format!("step_{step}.json"))
    }

    /// Optimizer partitioning config written by the distributed backend.
    #[must_use]
    pub fn optimization_config_path(&self, run_id: &RunId) -> PathBuf {
        self.run_dir(run_id).join("optimization.json")
    }

    #[must_use]
    pub fn adapter_dir(&self, run_id: &RunId) -> PathBuf {
        self.run_dir(run_id).join("adapter")
    }

    pub fn ensure_run_dirs(&self, run_id: &RunId) -> std::io::Result<()> {
        std::fs::create_dir_all(self.checkpoints_dir(run_id))
    }
}
