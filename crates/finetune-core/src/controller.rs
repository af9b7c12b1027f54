//! Run controller.
//!
//! Accepts submissions, records them in the store and launches each run's
//! backend on its own task. Keeps a registry of live runs for cancellation
//! and graceful shutdown.

use crate::backend::{BackendError, RunContext, RunReporter, backend_for};
use crate::store::{RunStore, StoreError};
use finetune_training::{
    Checkpoint, FileProgressSink, HardwareInspector, Metric, ModelLibrary, Run, RunId, RunLayout,
    RunError, RunErrorKind, RunRequest, RunState, SimulatedLibrary, SystemInspector, ValidationError,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{RwLock, Semaphore, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const SUBMIT_MESSAGE: &str = "Training started";

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("run not found: {0}")]
    NotFound(RunId),

    #[error("capacity exceeded: {limit} runs already admitted")]
    CapacityExceeded { limit: usize },

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for ControllerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => Self::NotFound(RunId(id)),
            other => Self::Store(other),
        }
    }
}

pub type ControllerResult<T> = std::result::Result<T, ControllerError>;

/// Admission limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunLimits {
    /// Runs executing at the same time; the rest wait in `Created`.
    pub max_concurrent_runs: usize,
    /// Live runs (waiting or executing) before `submit` is rejected.
    pub max_pending_runs: usize,
}

impl Default for RunLimits {
    fn default() -> Self {
        Self { max_concurrent_runs: 2, max_pending_runs: 64 }
    }
}

/// Immediate response to a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitReceipt {
    pub run_id: RunId,
    pub backend: String,
    pub message: String,
}

/// A store failure surfaced by a run task.
#[derive(Debug)]
pub struct RunFailure {
    pub run_id: RunId,
    pub error: StoreError,
}

struct RunHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    /// Flips to `true` once the run has left the registry; the sender is
    /// dropped when the task ends, whatever way it ends.
    done: watch::Receiver<bool>,
}

type Registry = Arc<RwLock<HashMap<RunId, RunHandle>>>;

pub struct RunController {
    store: Arc<dyn RunStore>,
    library: Arc<dyn ModelLibrary>,
    hardware: Arc<dyn HardwareInspector>,
    layout: RunLayout,
    limits: RunLimits,
    permits: Arc<Semaphore>,
    runs: Registry,
    failures: Arc<std::sync::Mutex<Vec<RunFailure>>>,
}

impl fmt::Debug for RunController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunController")
            .field("root", &self.layout.root())
            .field("limits", &self.limits)
            .field("live_runs", &self.runs.try_read().map(|r| r.len()).unwrap_or(0))
            .finish_non_exhaustive()
    }
}

impl RunController {
    /// Creates a controller over `store`, writing run artifacts under `layout`.
    ///
    /// Uses the simulated model library and the host hardware inspector until
    /// replaced with [`Self::with_library`] / [`Self::with_hardware`].
    #[must_use]
    pub fn new(store: Arc<dyn RunStore>, layout: RunLayout) -> Self {
        let limits = RunLimits::default();
        Self {
            store,
            library: Arc::new(SimulatedLibrary::new()),
            hardware: Arc::new(SystemInspector),
            layout,
            limits,
            permits: Arc::new(Semaphore::new(limits.max_concurrent_runs)),
            runs: Arc::new(RwLock::new(HashMap::new())),
            failures: Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }

    #[must_use]
    pub fn with_library(mut self, library: Arc<dyn ModelLibrary>) -> Self {
        self.library = library;
        self
    }

    #[must_use]
    pub fn with_hardware(mut self, hardware: Arc<dyn HardwareInspector>) -> Self {
        self.hardware = hardware;
        self
    }

    #[must_use]
    pub fn with_limits(mut self, limits: RunLimits) -> Self {
        let limits = RunLimits {
            max_concurrent_runs: limits.max_concurrent_runs.max(1),
            max_pending_runs: limits.max_pending_runs.max(1),
        };
        self.permits = Arc::new(Semaphore::new(limits.max_concurrent_runs));
        self.limits = limits;
        self
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    #[must_use]
    pub fn hardware(&self) -> &Arc<dyn HardwareInspector> {
        &self.hardware
    }

    /// Validates and records a run, then launches it without waiting for training.
    pub async fn submit(&self, request: RunRequest) -> ControllerResult<SubmitReceipt> {
        let config = request.validate()?;
        let backend = backend_for(config.backend);
        let backend_name = backend.kind().as_str().to_string();

        let mut runs = self.runs.write().await;
        if runs.len() >= self.limits.max_pending_runs {
            warn!(limit = self.limits.max_pending_runs, "Rejecting submission, run capacity exceeded");
            return Err(ControllerError::CapacityExceeded { limit: self.limits.max_pending_runs });
        }

        let run_id = self.store.create(&config)?;
        let cancel = CancellationToken::new();
        let sink = Arc::new(FileProgressSink::new(self.layout.log_path(&run_id)));
        let ctx = RunContext {
            run_id: run_id.clone(),
            config: Arc::new(config),
            reporter: RunReporter::new(run_id.clone(), Arc::clone(&self.store), sink),
            cancel: cancel.clone(),
            layout: self.layout.clone(),
            hardware: Arc::clone(&self.hardware),
            library: Arc::clone(&self.library),
        };

        let permits = Arc::clone(&self.permits);
        let registry = Arc::clone(&self.runs);
        let failures = Arc::clone(&self.failures);
        let task_run_id = run_id.clone();
        let (done_tx, done) = watch::channel(false);
        let task = tokio::spawn(async move {
            // Cancelled runs still go through `execute` so they end in `Error`.
            let _permit = tokio::select! {
                permit = permits.acquire_owned() => permit.ok(),
                () = ctx.cancel.cancelled() => None,
            };
            debug!(run_id = %task_run_id, "Run admitted");

            let reporter = ctx.reporter.clone();
            // A nested task turns a panic inside the backend into a `JoinError`.
            match tokio::spawn(async move { backend.execute(ctx).await }).await {
                Ok(Ok(state)) => debug!(run_id = %task_run_id, state = %state, "Run task finished"),
                Ok(Err(e)) => {
                    error!(run_id = %task_run_id, error = %e, "Run task surfaced a store failure");
                    if let Ok(mut failures) = failures.lock() {
                        failures.push(RunFailure { run_id: task_run_id.clone(), error: e });
                    }
                }
                Err(e) => {
                    error!(run_id = %task_run_id, error = %e, "Run task panicked");
                    mark_panicked(&reporter, &e.to_string());
                }
            }
            registry.write().await.remove(&task_run_id);
            let _ = done_tx.send(true);
        });
        runs.insert(run_id.clone(), RunHandle { cancel, task, done });
        drop(runs);

        info!(run_id = %run_id, backend = %backend_name, "Run submitted");
        Ok(SubmitReceipt { run_id, backend: backend_name, message: SUBMIT_MESSAGE.to_string() })
    }

    pub fn get(&self, run_id: &RunId) -> ControllerResult<Run> {
        Ok(self.store.get(run_id)?)
    }

    /// All runs, most recently created first.
    pub fn list(&self) -> ControllerResult<Vec<Run>> {
        Ok(self.store.list()?)
    }

    pub fn metrics(&self, run_id: &RunId) -> ControllerResult<Vec<Metric>> {
        Ok(self.store.metrics(run_id)?)
    }

    pub fn checkpoints(&self, run_id: &RunId) -> ControllerResult<Vec<Checkpoint>> {
        Ok(self.store.checkpoints(run_id)?)
    }

    /// Signals a live run to stop.
    ///
    /// Returns `false` when the run exists but is no longer live.
    pub async fn cancel(&self, run_id: &RunId) -> ControllerResult<bool> {
        if let Some(handle) = self.runs.read().await.get(run_id) {
            info!(run_id = %run_id, "Cancelling run");
            handle.cancel.cancel();
            return Ok(true);
        }
        let run = self.store.get(run_id)?;
        debug!(run_id = %run_id, state = %run.state, "Cancel requested for run that is not live");
        Ok(false)
    }

    /// Ids of runs that are waiting or executing.
    pub async fn active_runs(&self) -> Vec<RunId> {
        let mut ids: Vec<RunId> = self.runs.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Waits for a live run's task to finish and returns its stored state.
    ///
    /// Returns immediately for runs that are not live.
    pub async fn wait(&self, run_id: &RunId) -> ControllerResult<RunState> {
        let done = self.runs.read().await.get(run_id).map(|handle| handle.done.clone());
        if let Some(mut done) = done {
            // An error means the task ended without signalling.
            let _ = done.wait_for(|finished| *finished).await;
        }
        Ok(self.store.get(run_id)?.state)
    }

    /// Cancels every live run, joins their tasks and returns the store
    /// failures they surfaced.
    pub async fn shutdown(&self) -> Vec<RunFailure> {
        let handles: Vec<(RunId, RunHandle)> = self.runs.write().await.drain().collect();
        info!(live_runs = handles.len(), "Shutting down run controller");

        for (_, handle) in &handles {
            handle.cancel.cancel();
        }
        for (run_id, handle) in handles {
            if let Err(e) = handle.task.await {
                error!(run_id = %run_id, error = %e, "Run task panicked");
            }
        }

        self.failures.lock().map(|mut f| std::mem::take(&mut *f)).unwrap_or_default()
    }
}

/// Records a panicked run as `Error` if it has not already reached a terminal state.
fn mark_panicked(reporter: &RunReporter, reason: &str) {
    let run_error = RunError::new(RunErrorKind::BackendExecution, format!("run task panicked: {reason}"));
    let result = match reporter.transition(RunState::Error, Some(&run_error)) {
        Err(BackendError::InvalidTransition { from: RunState::Created, .. }) => reporter
            .transition(RunState::Running, None)
            .and_then(|()| reporter.transition(RunState::Error, Some(&run_error))),
        other => other,
    };
    if let Err(e) = result {
        warn!(run_id = %reporter.run_id(), error = %e, "Failed to mark panicked run as errored");
    }
}
