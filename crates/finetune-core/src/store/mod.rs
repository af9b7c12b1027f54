//! Durable ledger of runs, metrics and checkpoints.
//!
//! The store records whatever it is told. Transition rules are enforced by
//! the backend reporter, not here.

// SQL strings don't need hash-less raw strings
#![allow(clippy::needless_raw_string_hashes)]

pub mod error;
pub mod sqlite;

pub use error::{StoreError, StoreResult};
pub use sqlite::SqliteRunStore;

use finetune_training::{
    Checkpoint, HardwareSnapshot, Metric, MetricValues, Run, RunConfig, RunError, RunId, RunState,
};
use std::path::Path;

/// Source of truth for run state.
///
/// Every write is durable before the call returns.
pub trait RunStore: Send + Sync {
    /// Writes a new run in `Created` state and returns its id.
    fn create(&self, config: &RunConfig) -> StoreResult<RunId>;

    /// Overwrites the state and refreshes `updated_at`.
    ///
    /// `error` is stored alongside `Error` states; the note is derived from it.
    fn update_state(&self, run_id: &RunId, state: RunState, error: Option<&RunError>) -> StoreResult<()>;

    /// Records the resolved device and hardware snapshot taken at run start.
    fn record_execution(
        &self,
        run_id: &RunId,
        device_used: &str,
        hardware: &HardwareSnapshot,
    ) -> StoreResult<()>;

    fn append_metric(&self, run_id: &RunId, step: u64, values: MetricValues) -> StoreResult<()>;

    fn register_checkpoint(
        &self,
        run_id: &RunId,
        step: u64,
        path: &Path,
        metrics: Option<&serde_json::Value>,
    ) -> StoreResult<()>;

    fn get(&self, run_id: &RunId) -> StoreResult<Run>;

    /// All runs, most recently created first.
    fn list(&self) -> StoreResult<Vec<Run>>;

    /// Metrics of a run in append order.
    fn metrics(&self, run_id: &RunId) -> StoreResult<Vec<Metric>>;

    /// Checkpoints of a run in append order.
    fn checkpoints(&self, run_id: &RunId) -> StoreResult<Vec<Checkpoint>>;
}
