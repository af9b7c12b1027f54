//! Finetune Core - run orchestration engine.
//!
//! This crate provides:
//! - The SQLite-backed run store
//! - Training backends (mock, single-process, distributed-optimization)
//! - The run controller with admission, cancellation and shutdown
//! - Engine configuration and the HTTP adapter
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use finetune_core::{RunController, SqliteRunStore};
//! use finetune_training::{RunLayout, RunRequest};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(SqliteRunStore::open("finetune-data/finetune.db")?);
//! let controller = RunController::new(store, RunLayout::new("finetune-data".into()));
//! let receipt = controller.submit(RunRequest::new("t1", "demo")).await?;
//! println!("{} started on {}", receipt.run_id, receipt.backend);
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod controller;
pub mod error;
pub mod server;
pub mod store;

pub use backend::{
    BackendError, DistributedBackend, MockBackend, RunContext, RunReporter, SingleProcessBackend,
    TrainingBackend, backend_for,
};
pub use config::EngineConfig;
pub use controller::{
    ControllerError, ControllerResult, RunController, RunFailure, RunLimits, SubmitReceipt,
};
pub use error::{EngineError, Result};
pub use store::{RunStore, SqliteRunStore, StoreError, StoreResult};
