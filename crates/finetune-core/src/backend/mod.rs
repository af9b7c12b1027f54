//! Training backends.
//!
//! A backend drives one run from `Running` to a terminal state. The shared
//! lifecycle lives in [`TrainingBackend::execute`]; variants only implement
//! [`TrainingBackend::train`].

pub mod distributed;
pub mod mock;
pub mod single_process;

pub use distributed::DistributedBackend;
pub use mock::MockBackend;
pub use single_process::SingleProcessBackend;

use crate::store::{RunStore, StoreError, StoreResult};
use async_trait::async_trait;
use finetune_training::{
    BackendKind, HardwareInspector, LibraryError, MetricValues, ModelLibrary, ProgressSink,
    RunConfig, RunError, RunErrorKind, RunId, RunLayout, RunState, StrategyError,
};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Failure inside a run's own execution unit.
///
/// All variants except `Store` end the run in `Error`; `Store` is surfaced to
/// whoever awaits the run task.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("{0}")]
    MissingInput(String),

    #[error(transparent)]
    Strategy(#[from] StrategyError),

    #[error(transparent)]
    Library(#[from] LibraryError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("run cancelled")]
    Cancelled,

    #[error("invalid state transition {from} -> {to}")]
    InvalidTransition { from: RunState, to: RunState },

    #[error("training task failed: {0}")]
    Task(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl BackendError {
    /// Structured error to record on the run, or `None` for store failures.
    #[must_use]
    pub fn run_error(&self) -> Option<RunError> {
        let kind = match self {
            Self::Store(_) => return None,
            Self::MissingInput(_) | Self::Library(LibraryError::DatasetNotFound(_)) => {
                RunErrorKind::MissingInput
            }
            Self::Strategy(_) => RunErrorKind::Strategy,
            Self::Cancelled => RunErrorKind::Cancelled,
            Self::Library(_) | Self::Io(_) | Self::InvalidTransition { .. } | Self::Task(_) => {
                RunErrorKind::BackendExecution
            }
        };
        Some(RunError::new(kind, self.to_string()))
    }
}

/// The only writer for a single run's record.
///
/// State changes are checked against the current stored state before they are
/// written, so a run never leaves a terminal state.
#[derive(Clone)]
pub struct RunReporter {
    run_id: RunId,
    store: Arc<dyn RunStore>,
    sink: Arc<dyn ProgressSink>,
}

impl std::fmt::Debug for RunReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunReporter").field("run_id", &self.run_id).finish_non_exhaustive()
    }
}

impl RunReporter {
    #[must_use]
    pub fn new(run_id: RunId, store: Arc<dyn RunStore>, sink: Arc<dyn ProgressSink>) -> Self {
        Self { run_id, store, sink }
    }

    #[must_use]
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn transition(&self, to: RunState, error: Option<&RunError>) -> Result<(), BackendError> {
        let from = self.store.get(&self.run_id)?.state;
        if !from.can_transition_to(to) {
            warn!(run_id = %self.run_id, from = %from, to = %to, "Rejected state transition");
            return Err(BackendError::InvalidTransition { from, to });
        }
        self.store.update_state(&self.run_id, to, error)?;
        debug!(run_id = %self.run_id, from = %from, to = %to, "Run state changed");
        Ok(())
    }

    pub fn metric(&self, step: u64, values: MetricValues) -> StoreResult<()> {
        self.store.append_metric(&self.run_id, step, values)
    }

    pub fn checkpoint(
        &self,
        step: u64,
        path: &Path,
        metrics: Option<&serde_json::Value>,
    ) -> StoreResult<()> {
        self.store.register_checkpoint(&self.run_id, step, path, metrics)
    }

    /// Appends a line to the run's diagnostic log.
    pub fn log(&self, message: impl AsRef<str>) {
        self.sink.log(&self.run_id, message.as_ref());
    }
}

/// Everything a backend needs to execute one run.
#[derive(Clone)]
pub struct RunContext {
    pub run_id: RunId,
    pub config: Arc<RunConfig>,
    pub reporter: RunReporter,
    pub cancel: CancellationToken,
    pub layout: RunLayout,
    pub hardware: Arc<dyn HardwareInspector>,
    pub library: Arc<dyn ModelLibrary>,
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("run_id", &self.run_id)
            .field("backend", &self.config.backend)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl RunContext {
    pub(crate) fn check_cancelled(&self) -> Result<(), BackendError> {
        if self.cancel.is_cancelled() {
            return Err(BackendError::Cancelled);
        }
        Ok(())
    }
}

#[async_trait]
pub trait TrainingBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Variant-specific work between `Running` and completion.
    ///
    /// `device` is the compute device resolved from the hardware snapshot.
    async fn train(&self, ctx: &RunContext, device: &str) -> Result<(), BackendError>;

    /// Runs the shared lifecycle and returns the terminal state reached.
    ///
    /// Every failure except a store failure is recorded on the run and
    /// swallowed here.
    async fn execute(&self, ctx: RunContext) -> Result<RunState, StoreError> {
        let reporter = ctx.reporter.clone();
        match reporter.transition(RunState::Running, None) {
            Ok(()) => {}
            Err(BackendError::Store(e)) => return Err(e),
            Err(e) => {
                error!(run_id = %ctx.run_id, error = %e, "Run could not be started");
                return Ok(RunState::Error);
            }
        }
        info!(run_id = %ctx.run_id, backend = self.kind().as_str(), "Run started");

        let result = async {
            ctx.check_cancelled()?;
            let device = start(&ctx).await?;
            self.train(&ctx, &device).await
        }
        .await;

        match result {
            Ok(()) => {
                finish(&reporter, RunState::Completed, None)?;
                reporter.log("Training finished successfully.");
                info!(run_id = %ctx.run_id, "Run completed");
                Ok(RunState::Completed)
            }
            Err(BackendError::Store(e)) => {
                error!(run_id = %ctx.run_id, error = %e, "Run store failure during training");
                let run_error = RunError::new(RunErrorKind::BackendExecution, e.to_string());
                if let Err(mark) = reporter.transition(RunState::Error, Some(&run_error)) {
                    warn!(run_id = %ctx.run_id, error = %mark, "Failed to mark run as errored");
                }
                Err(e)
            }
            Err(e) => {
                let run_error = e
                    .run_error()
                    .unwrap_or_else(|| RunError::new(RunErrorKind::BackendExecution, e.to_string()));
                reporter.log(format!("Run failed: {run_error}"));
                if run_error.kind == RunErrorKind::Cancelled {
                    info!(run_id = %ctx.run_id, "Run cancelled");
                } else {
                    warn!(run_id = %ctx.run_id, error = %run_error, "Run failed");
                }
                finish(&reporter, RunState::Error, Some(&run_error))?;
                Ok(RunState::Error)
            }
        }
    }
}

/// Prepares the run directory and records the hardware snapshot.
async fn start(ctx: &RunContext) -> Result<String, BackendError> {
    let layout = ctx.layout.clone();
    let run_id = ctx.run_id.clone();
    let inspector = Arc::clone(&ctx.hardware);
    let hardware = tokio::task::spawn_blocking(move || {
        layout.ensure_run_dirs(&run_id)?;
        Ok::<_, std::io::Error>(inspector.snapshot())
    })
    .await
    .map_err(|e| BackendError::Task(e.to_string()))??;

    let device = hardware.resolve_device(&ctx.config.compute.device, ctx.config.compute.gpu_index);
    ctx.reporter.log(format!("Using device {device}"));
    ctx.reporter.store.record_execution(&ctx.run_id, &device, &hardware)?;
    Ok(device)
}

fn finish(reporter: &RunReporter, to: RunState, error: Option<&RunError>) -> Result<(), StoreError> {
    match reporter.transition(to, error) {
        Ok(()) => Ok(()),
        Err(BackendError::Store(e)) => Err(e),
        Err(e) => {
            error!(run_id = %reporter.run_id(), error = %e, "Failed to record terminal state");
            Ok(())
        }
    }
}

/// Builds the backend for a run's selector.
#[must_use]
pub fn backend_for(kind: BackendKind) -> Arc<dyn TrainingBackend> {
    match kind {
        BackendKind::Mock => Arc::new(MockBackend),
        BackendKind::SingleProcess => Arc::new(SingleProcessBackend),
        BackendKind::Distributed => Arc::new(DistributedBackend),
    }
}
