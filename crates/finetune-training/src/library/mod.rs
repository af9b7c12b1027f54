//! Boundary to the model-training library.
//!
//! The engine never performs numerical work itself. Backends call a
//! [`ModelLibrary`] synchronously from their own execution unit and treat any
//! failure as a terminal run error.

pub mod simulated;

use crate::error::LibraryResult;
use crate::schedule::LrScheduleKind;
use serde::{Deserialize, Serialize};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};

pub use simulated::SimulatedLibrary;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dtype {
    Float32,
    Float16,
    Bfloat16,
}

impl Dtype {
    #[must_use]
    pub fn from_flags(fp16: bool, bf16: bool) -> Self {
        if bf16 {
            Self::Bfloat16
        } else if fp16 {
            Self::Float16
        } else {
            Self::Float32
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadOptions {
    pub dtype: Dtype,
    pub device: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuantizationSpec {
    pub bits: u8,
    pub quant_type: String,
    pub double_quant: bool,
    pub compute_dtype: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LowRankSpec {
    pub rank: u32,
    pub alpha: f64,
    pub dropout: f64,
}

/// Opaque-to-the-engine description of a loaded model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelHandle {
    pub reference: String,
    pub dtype: Dtype,
    pub device: String,
    pub quantization: Option<QuantizationSpec>,
    pub adapter: Option<LowRankSpec>,
    /// Whether the original weights are excluded from optimization.
    pub base_frozen: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenizerHandle {
    pub reference: String,
    pub max_length: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetHandle {
    pub path: PathBuf,
    pub examples: usize,
}

/// Hyperparameters passed to the training loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingPlan {
    pub epochs: u32,
    pub batch_size: u32,
    pub gradient_accumulation_steps: u32,
    pub learning_rate: f64,
    pub lr_schedule: LrScheduleKind,
    pub seed: u64,
    pub output_dir: PathBuf,
    /// Backend-specific optimizer configuration file, if any.
    pub optimization_config: Option<PathBuf>,
}

/// One optimizer step as reported by the training loop.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StepReport {
    pub step: u64,
    pub total_steps: u64,
    pub epoch: f64,
    pub loss: f64,
    pub learning_rate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrainingOutcome {
    pub steps_completed: u64,
    pub final_loss: Option<f64>,
    /// The progress callback asked the loop to stop before the last step.
    pub stopped_early: bool,
}

pub type ProgressCallback<'a> = dyn FnMut(&StepReport) -> ControlFlow<()> + 'a;

pub trait ModelLibrary: Send + Sync {
    fn load_tokenizer(&self, reference: &str, max_length: u32) -> LibraryResult<TokenizerHandle>;

    fn load_model(&self, reference: &str, options: &LoadOptions) -> LibraryResult<ModelHandle>;

    /// Reduces the numeric precision of a loaded model.
    fn quantize(&self, model: ModelHandle, spec: &QuantizationSpec) -> LibraryResult<ModelHandle>;

    /// Wraps a model with trainable low-rank update matrices and freezes the base weights.
    fn attach_low_rank(&self, model: ModelHandle, spec: &LowRankSpec) -> LibraryResult<ModelHandle>;

    fn load_dataset(&self, path: &Path, tokenizer: &TokenizerHandle) -> LibraryResult<DatasetHandle>;

    /// Runs the training loop, invoking `progress` after every optimizer step.
    ///
    /// Returning `ControlFlow::Break` from `progress` stops the loop after the
    /// current step.
    fn run_training_loop(
        &self,
        model: &ModelHandle,
        dataset: &DatasetHandle,
        plan: &TrainingPlan,
        progress: &mut ProgressCallback<'_>,
    ) -> LibraryResult<TrainingOutcome>;

    fn save_checkpoint(
        &self,
        model: &ModelHandle,
        path: &Path,
        metrics: &serde_json::Value,
    ) -> LibraryResult<()>;

    fn save_model(&self, model: &ModelHandle, dir: &Path) -> LibraryResult<()>;
}
