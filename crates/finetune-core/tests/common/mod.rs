//! Shared test utilities for finetune-core integration tests.

#![allow(dead_code)]

use finetune_core::{RunController, RunLimits, RunStore, SqliteRunStore};
use finetune_training::{
    RunId, RunLayout, RunRequest, RunState, SimulatedLibrary, StaticInspector,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// A controller over an in-memory store with artifacts in a temp dir.
pub struct TestEngine {
    pub temp: TempDir,
    pub controller: Arc<RunController>,
}

impl TestEngine {
    pub fn root(&self) -> &Path {
        self.temp.path()
    }
}

pub fn engine() -> TestEngine {
    engine_with_limits(RunLimits::default())
}

pub fn engine_with_limits(limits: RunLimits) -> TestEngine {
    let store = Arc::new(SqliteRunStore::open_in_memory().expect("Failed to open in-memory store"));
    engine_with_store(store, limits)
}

pub fn engine_with_store(store: Arc<dyn RunStore>, limits: RunLimits) -> TestEngine {
    build_engine(store, SimulatedLibrary::new(), limits)
}

pub fn engine_with_library(library: SimulatedLibrary) -> TestEngine {
    let store = Arc::new(SqliteRunStore::open_in_memory().expect("Failed to open in-memory store"));
    build_engine(store, library, RunLimits::default())
}

fn build_engine(store: Arc<dyn RunStore>, library: SimulatedLibrary, limits: RunLimits) -> TestEngine {
    let temp = TempDir::new().expect("Failed to create temp dir");
    let controller = RunController::new(store, RunLayout::new(temp.path().to_path_buf()))
        .with_library(Arc::new(library))
        .with_hardware(Arc::new(StaticInspector::cpu_only()))
        .with_limits(limits);
    TestEngine { temp, controller: Arc::new(controller) }
}

/// Mock run of `steps` steps with a short delay between them.
pub fn mock_request(name: &str, steps: u64) -> RunRequest {
    let mut request = RunRequest::new(name, "demo").with_backend("mock");
    request.mock.total_steps = steps;
    request.mock.step_delay_ms = 5;
    request
}

/// Mock run that stays live long enough to be observed or cancelled.
pub fn slow_mock_request(name: &str) -> RunRequest {
    let mut request = RunRequest::new(name, "demo").with_backend("mock");
    request.mock.total_steps = 1000;
    request.mock.step_delay_ms = 50;
    request
}

pub fn write_dataset(dir: &Path, records: usize) -> PathBuf {
    let path = dir.join("train.jsonl");
    let body: String = (0..records).map(|i| format!("{{\"text\":\"example {i}\"}}\n")).collect();
    std::fs::write(&path, body).expect("Failed to write dataset");
    path
}

/// Waits for a run to leave the live registry, failing the test after 10s.
pub async fn wait_for(controller: &RunController, run_id: &RunId) -> RunState {
    tokio::time::timeout(Duration::from_secs(10), controller.wait(run_id))
        .await
        .expect("Run did not finish in time")
        .expect("Run not found")
}

/// Polls until the run reaches `state`, failing the test after 5s.
pub async fn wait_until_state(controller: &RunController, run_id: &RunId, state: RunState) {
    let poll = async {
        loop {
            if controller.get(run_id).expect("Run not found").state == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), poll).await.expect("Run never reached state");
}
