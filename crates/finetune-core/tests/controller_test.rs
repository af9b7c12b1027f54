//! Integration tests for the run controller.
//!
//! Covers:
//! - Submission, asynchronous execution and terminal states
//! - Metric and checkpoint ledgers of completed runs
//! - Failure classification (missing input, strategy, cancellation)
//! - Admission limits, cancellation and shutdown
//! - Store failures and panics inside run tasks

mod common;

use common::{
    engine, engine_with_library, engine_with_limits, engine_with_store, mock_request,
    slow_mock_request, wait_for, wait_until_state, write_dataset,
};
use finetune_core::controller::SUBMIT_MESSAGE;
use finetune_core::{ControllerError, RunLimits, RunStore, SqliteRunStore, StoreError, StoreResult};
use finetune_training::{
    Checkpoint, HardwareSnapshot, Metric, MetricValues, Run, RunConfig, RunError, RunErrorKind, RunId,
    RunRequest, RunState, SimulatedLibrary, ValidationError,
};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[tokio::test]
async fn test_mock_run_end_to_end() {
    let engine = engine();
    let controller = &engine.controller;

    let receipt = controller.submit(mock_request("t1", 3)).await.unwrap();
    assert_eq!(receipt.backend, "mock");
    assert_eq!(receipt.message, SUBMIT_MESSAGE);
    assert!(!receipt.run_id.as_str().is_empty());

    assert_eq!(wait_for(controller, &receipt.run_id).await, RunState::Completed);

    let runs = controller.list().unwrap();
    assert_eq!(runs.len(), 1);
    let run = &runs[0];
    assert_eq!(run.id, receipt.run_id);
    assert_eq!(run.name, "t1");
    assert_eq!(run.base_model, "demo");
    assert_eq!(run.state, RunState::Completed);
    assert!(run.error.is_none());
    assert_eq!(run.device_used.as_deref(), Some("cpu"));
    assert!(run.hardware_snapshot.is_some());
    assert!(run.updated_at >= run.created_at);
}

#[tokio::test]
async fn test_submit_returns_before_training_finishes() {
    let engine = engine();
    let controller = &engine.controller;

    let started = Instant::now();
    let receipt = controller.submit(slow_mock_request("slow")).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));

    let state = controller.get(&receipt.run_id).unwrap().state;
    assert!(matches!(state, RunState::Created | RunState::Running));
    assert_eq!(controller.active_runs().await, vec![receipt.run_id.clone()]);

    assert!(controller.shutdown().await.is_empty());
}

#[tokio::test]
async fn test_completed_mock_run_has_one_metric_and_checkpoint_per_step() {
    let engine = engine();
    let controller = &engine.controller;

    let receipt = controller.submit(mock_request("ledger", 4)).await.unwrap();
    assert_eq!(wait_for(controller, &receipt.run_id).await, RunState::Completed);

    let metrics = controller.metrics(&receipt.run_id).unwrap();
    let checkpoints = controller.checkpoints(&receipt.run_id).unwrap();
    assert_eq!(metrics.iter().map(|m| m.step).collect::<Vec<_>>(), vec![1, 2, 3, 4]);
    assert_eq!(checkpoints.iter().map(|c| c.step).collect::<Vec<_>>(), vec![1, 2, 3, 4]);

    for metric in &metrics {
        assert!((0.5..=2.0).contains(&metric.loss));
        assert!((1e-5..=5e-4).contains(&metric.learning_rate));
    }
    for checkpoint in &checkpoints {
        assert!(checkpoint.storage_path.exists(), "missing {}", checkpoint.storage_path.display());
        assert_eq!(checkpoint.metrics_at_checkpoint["step"], checkpoint.step);
    }

    let log = std::fs::read_to_string(engine.root().join("runs").join(receipt.run_id.as_str()).join("train.log"))
        .unwrap();
    assert!(log.contains("Training finished successfully."));
}

#[tokio::test]
async fn test_get_is_idempotent_after_completion() {
    let engine = engine();
    let controller = &engine.controller;

    let receipt = controller.submit(mock_request("same", 2)).await.unwrap();
    wait_for(controller, &receipt.run_id).await;

    let first = serde_json::to_value(controller.get(&receipt.run_id).unwrap()).unwrap();
    let second = serde_json::to_value(controller.get(&receipt.run_id).unwrap()).unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_observed_states_never_move_backwards() {
    let engine = engine();
    let controller = &engine.controller;

    let mut request = mock_request("order", 5);
    request.mock.step_delay_ms = 20;
    let receipt = controller.submit(request).await.unwrap();

    let mut observed = Vec::new();
    loop {
        let state = controller.get(&receipt.run_id).unwrap().state;
        if observed.last() != Some(&state) {
            observed.push(state);
        }
        if state.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    let rank = |s: &RunState| match s {
        RunState::Created => 0,
        RunState::Running => 1,
        RunState::Completed | RunState::Error => 2,
    };
    assert!(observed.windows(2).all(|w| rank(&w[0]) < rank(&w[1])), "observed {observed:?}");
    assert_eq!(observed.last(), Some(&RunState::Completed));
}

#[tokio::test]
async fn test_concurrent_runs_are_isolated() {
    let engine = engine();
    let controller = &engine.controller;

    let ok = controller.submit(mock_request("ok", 3)).await.unwrap();
    let missing = engine.root().join("nowhere.jsonl");
    let broken = controller
        .submit(RunRequest::new("broken", "demo").with_backend("single_process").with_dataset(&missing))
        .await
        .unwrap();

    assert_eq!(wait_for(controller, &ok.run_id).await, RunState::Completed);
    assert_eq!(wait_for(controller, &broken.run_id).await, RunState::Error);

    let ok_metrics = controller.metrics(&ok.run_id).unwrap();
    assert_eq!(ok_metrics.len(), 3);
    assert!(ok_metrics.iter().all(|m| m.run_id == ok.run_id));
    assert!(controller.metrics(&broken.run_id).unwrap().is_empty());
    assert_eq!(controller.list().unwrap().len(), 2);
}

#[tokio::test]
async fn test_missing_dataset_marks_run_errored() {
    let engine = engine();
    let controller = &engine.controller;

    let missing = engine.root().join("train.jsonl");
    let receipt = controller
        .submit(RunRequest::new("t2", "demo").with_backend("single_process").with_dataset(&missing))
        .await
        .unwrap();
    assert_eq!(receipt.backend, "single_process");
    assert_eq!(wait_for(controller, &receipt.run_id).await, RunState::Error);

    let run = controller.get(&receipt.run_id).unwrap();
    let error = run.error.unwrap();
    assert_eq!(error.kind, RunErrorKind::MissingInput);
    assert!(run.note.unwrap().contains(&missing.display().to_string()));
    assert!(controller.metrics(&receipt.run_id).unwrap().is_empty());
}

#[tokio::test]
async fn test_single_process_run_completes_with_dataset() {
    let engine = engine();
    let controller = &engine.controller;

    let dataset = write_dataset(engine.root(), 8);
    let mut request = RunRequest::new("sp", "demo").with_backend("accelerate").with_dataset(&dataset);
    request.training.logging_steps = 2;
    request.training.save_steps = 4;
    request.training.per_device_train_batch_size = 1;
    request.training.gradient_accumulation_steps = 1;
    request.training.epochs = 1;

    let receipt = controller.submit(request).await.unwrap();
    assert_eq!(receipt.backend, "single_process");
    assert_eq!(wait_for(controller, &receipt.run_id).await, RunState::Completed);

    let steps: Vec<u64> = controller.metrics(&receipt.run_id).unwrap().iter().map(|m| m.step).collect();
    assert_eq!(steps, vec![2, 4, 6, 8]);
    let saved: Vec<u64> = controller.checkpoints(&receipt.run_id).unwrap().iter().map(|c| c.step).collect();
    assert_eq!(saved, vec![4, 8]);
}

#[tokio::test]
async fn test_single_process_run_cancels_between_steps() {
    let engine = engine_with_library(SimulatedLibrary::new().with_step_delay(Duration::from_millis(20)));
    let controller = &engine.controller;

    let dataset = write_dataset(engine.root(), 200);
    let mut request = RunRequest::new("sp-stop", "demo").with_backend("single_process").with_dataset(&dataset);
    request.training.logging_steps = 1;
    request.training.per_device_train_batch_size = 1;
    request.training.gradient_accumulation_steps = 1;

    let receipt = controller.submit(request).await.unwrap();
    let first_metric = async {
        while controller.metrics(&receipt.run_id).unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), first_metric).await.unwrap();

    assert!(controller.cancel(&receipt.run_id).await.unwrap());
    assert_eq!(wait_for(controller, &receipt.run_id).await, RunState::Error);
    assert_eq!(controller.get(&receipt.run_id).unwrap().error.unwrap().kind, RunErrorKind::Cancelled);
    assert!(controller.metrics(&receipt.run_id).unwrap().len() < 200);
    assert!(!engine.root().join("runs").join(receipt.run_id.as_str()).join("adapter").exists());
}

#[tokio::test]
async fn test_invalid_rank_is_strategy_error() {
    let engine = engine();
    let controller = &engine.controller;

    let dataset = write_dataset(engine.root(), 4);
    let mut request = RunRequest::new("r0", "demo").with_backend("single_process").with_dataset(&dataset);
    request.lora.r = 0;

    let receipt = controller.submit(request).await.unwrap();
    assert_eq!(wait_for(controller, &receipt.run_id).await, RunState::Error);
    assert_eq!(controller.get(&receipt.run_id).unwrap().error.unwrap().kind, RunErrorKind::Strategy);
}

#[tokio::test]
async fn test_unknown_backend_is_rejected_without_creating_a_run() {
    let engine = engine();
    let controller = &engine.controller;

    let err = controller.submit(RunRequest::new("t3", "demo").with_backend("tpu-pod")).await.unwrap_err();
    assert!(matches!(err, ControllerError::Validation(ValidationError::UnknownBackend(ref b)) if b == "tpu-pod"));

    let mut no_name = RunRequest::new("", "demo");
    no_name.run_name = None;
    let err = controller.submit(no_name).await.unwrap_err();
    assert!(matches!(err, ControllerError::Validation(ValidationError::MissingField("run_name"))));

    assert!(controller.list().unwrap().is_empty());
}

#[tokio::test]
async fn test_cancel_marks_run_cancelled() {
    let engine = engine();
    let controller = &engine.controller;

    let receipt = controller.submit(slow_mock_request("stop")).await.unwrap();
    wait_until_state(controller, &receipt.run_id, RunState::Running).await;

    assert!(controller.cancel(&receipt.run_id).await.unwrap());
    assert_eq!(wait_for(controller, &receipt.run_id).await, RunState::Error);

    let run = controller.get(&receipt.run_id).unwrap();
    assert_eq!(run.error.unwrap().kind, RunErrorKind::Cancelled);
    assert!(controller.metrics(&receipt.run_id).unwrap().len() < 1000);

    // No longer live.
    assert!(!controller.cancel(&receipt.run_id).await.unwrap());
}

#[tokio::test]
async fn test_cancel_unknown_run_is_not_found() {
    let engine = engine();
    let controller = &engine.controller;
    let unknown = RunId::from("does-not-exist");

    assert!(matches!(controller.cancel(&unknown).await, Err(ControllerError::NotFound(_))));
    assert!(matches!(controller.get(&unknown), Err(ControllerError::NotFound(_))));
    assert!(matches!(controller.metrics(&unknown), Err(ControllerError::NotFound(_))));
    assert!(matches!(controller.checkpoints(&unknown), Err(ControllerError::NotFound(_))));
}

#[tokio::test]
async fn test_concurrency_limit_holds_runs_in_created() {
    let engine = engine_with_limits(RunLimits { max_concurrent_runs: 1, max_pending_runs: 4 });
    let controller = &engine.controller;

    let first = controller.submit(slow_mock_request("first")).await.unwrap();
    wait_until_state(controller, &first.run_id, RunState::Running).await;
    let second = controller.submit(slow_mock_request("second")).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(controller.get(&second.run_id).unwrap().state, RunState::Created);

    controller.cancel(&first.run_id).await.unwrap();
    wait_until_state(controller, &second.run_id, RunState::Running).await;

    assert!(controller.shutdown().await.is_empty());
    for id in [&first.run_id, &second.run_id] {
        let run = controller.get(id).unwrap();
        assert_eq!(run.state, RunState::Error);
        assert_eq!(run.error.unwrap().kind, RunErrorKind::Cancelled);
    }
}

#[tokio::test]
async fn test_pending_limit_rejects_submissions() {
    let engine = engine_with_limits(RunLimits { max_concurrent_runs: 1, max_pending_runs: 1 });
    let controller = &engine.controller;

    let first = controller.submit(slow_mock_request("first")).await.unwrap();
    let err = controller.submit(slow_mock_request("second")).await.unwrap_err();
    assert!(matches!(err, ControllerError::CapacityExceeded { limit: 1 }));
    assert_eq!(controller.list().unwrap().len(), 1);

    controller.cancel(&first.run_id).await.unwrap();
    wait_for(controller, &first.run_id).await;
    let third = controller.submit(mock_request("third", 1)).await.unwrap();
    assert_eq!(wait_for(controller, &third.run_id).await, RunState::Completed);
}

#[tokio::test]
async fn test_shutdown_cancels_live_runs() {
    let engine = engine();
    let controller = &engine.controller;

    let a = controller.submit(slow_mock_request("a")).await.unwrap();
    let b = controller.submit(slow_mock_request("b")).await.unwrap();

    assert!(controller.shutdown().await.is_empty());
    assert!(controller.active_runs().await.is_empty());
    for id in [&a.run_id, &b.run_id] {
        assert_eq!(controller.get(id).unwrap().state, RunState::Error);
    }
}

/// Store whose metric appends always fail, by error or by panic.
struct FailingMetricsStore {
    inner: SqliteRunStore,
    panic: bool,
}

impl FailingMetricsStore {
    fn new(panic: bool) -> Self {
        Self { inner: SqliteRunStore::open_in_memory().unwrap(), panic }
    }
}

impl RunStore for FailingMetricsStore {
    fn create(&self, config: &RunConfig) -> StoreResult<RunId> {
        self.inner.create(config)
    }

    fn update_state(&self, run_id: &RunId, state: RunState, error: Option<&RunError>) -> StoreResult<()> {
        self.inner.update_state(run_id, state, error)
    }

    fn record_execution(&self, run_id: &RunId, device_used: &str, hardware: &HardwareSnapshot) -> StoreResult<()> {
        self.inner.record_execution(run_id, device_used, hardware)
    }

    fn append_metric(&self, _run_id: &RunId, _step: u64, _values: MetricValues) -> StoreResult<()> {
        assert!(!self.panic, "metrics table corrupted");
        Err(StoreError::Io(std::io::Error::other("disk full")))
    }

    fn register_checkpoint(
        &self,
        run_id: &RunId,
        step: u64,
        path: &Path,
        metrics: Option<&serde_json::Value>,
    ) -> StoreResult<()> {
        self.inner.register_checkpoint(run_id, step, path, metrics)
    }

    fn get(&self, run_id: &RunId) -> StoreResult<Run> {
        self.inner.get(run_id)
    }

    fn list(&self) -> StoreResult<Vec<Run>> {
        self.inner.list()
    }

    fn metrics(&self, run_id: &RunId) -> StoreResult<Vec<Metric>> {
        self.inner.metrics(run_id)
    }

    fn checkpoints(&self, run_id: &RunId) -> StoreResult<Vec<Checkpoint>> {
        self.inner.checkpoints(run_id)
    }
}

#[tokio::test]
async fn test_store_failure_is_surfaced_at_shutdown() {
    let store = Arc::new(FailingMetricsStore::new(false));
    let engine = engine_with_store(store, RunLimits::default());
    let controller = &engine.controller;

    let receipt = controller.submit(mock_request("flaky", 3)).await.unwrap();
    assert_eq!(wait_for(controller, &receipt.run_id).await, RunState::Error);
    assert_eq!(controller.get(&receipt.run_id).unwrap().error.unwrap().kind, RunErrorKind::BackendExecution);

    let failures = controller.shutdown().await;
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].run_id, receipt.run_id);
    assert!(matches!(failures[0].error, StoreError::Io(_)));
}

#[tokio::test]
async fn test_panicking_run_releases_its_slot() {
    let store = Arc::new(FailingMetricsStore::new(true));
    let engine = engine_with_store(store, RunLimits { max_concurrent_runs: 1, max_pending_runs: 1 });
    let controller = &engine.controller;

    let receipt = controller.submit(mock_request("boom", 3)).await.unwrap();
    assert_eq!(wait_for(controller, &receipt.run_id).await, RunState::Error);

    let error = controller.get(&receipt.run_id).unwrap().error.unwrap();
    assert_eq!(error.kind, RunErrorKind::BackendExecution);
    assert!(error.message.contains("panicked"));
    assert!(controller.active_runs().await.is_empty());

    // The slot is free again for the next submission.
    let next = controller.submit(mock_request("after", 1)).await.unwrap();
    assert_eq!(wait_for(controller, &next.run_id).await, RunState::Error);
    assert!(controller.shutdown().await.is_empty());
}
