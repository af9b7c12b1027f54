//! Finetune Training
//!
//! Backend-agnostic primitives for fine-tuning runs:
//! - Run configuration and validation (`RunRequest` -> `RunConfig`)
//! - The run entity model and its state machine
//! - Adaptation strategies (`AdaptationStrategy`)
//! - The model-training-library and hardware-inspector boundaries
//! - Per-run filesystem layout and diagnostic log

pub mod config;
pub mod error;
pub mod hardware;
pub mod layout;
pub mod library;
pub mod progress;
pub mod run;
pub mod schedule;
pub mod strategy;

pub use config::{
    BackendKind, ComputeConfig, DatasetConfig, DistributedConfig, LoraConfig, MockConfig,
    OffloadDevice, QuantizationConfig, RunConfig, RunRequest, StrategyKind, TrainingConfig,
};
pub use error::{
    LibraryError, LibraryResult, StrategyError, StrategyResult, ValidationError, ValidationResult,
};
pub use hardware::{Accelerator, HardwareInspector, HardwareSnapshot, StaticInspector, SystemInspector};
pub use layout::RunLayout;
pub use library::{
    DatasetHandle, Dtype, LoadOptions, LowRankSpec, ModelHandle, ModelLibrary, QuantizationSpec,
    SimulatedLibrary, StepReport, TokenizerHandle, TrainingOutcome, TrainingPlan,
};
pub use progress::{FileProgressSink, MemoryProgressSink, ProgressSink};
pub use run::{
    latest_per_step, Checkpoint, Metric, MetricValues, Run, RunError, RunErrorKind, RunId,
    RunState, RunSummary,
};
pub use schedule::{LrSchedule, LrScheduleKind};
pub use strategy::{strategy_for, AdaptationStrategy, LowRankStrategy, QuantizedLowRankStrategy};
