//! Run configuration.
//!
//! A [`RunRequest`] is the loosely-typed submission as received from a caller.
//! [`RunRequest::validate`] turns it into a [`RunConfig`], the immutable
//! snapshot stored with the run and handed to its backend.

use crate::error::{ValidationError, ValidationResult};
use crate::schedule::LrScheduleKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;

/// Training backend selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Deterministic synthetic loop, no model or data dependencies.
    Mock,
    /// One process driving the collaborator library's training loop.
    SingleProcess,
    /// Single-process plus a materialized optimizer partitioning config.
    Distributed,
}

impl BackendKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mock => "mock",
            Self::SingleProcess => "single_process",
            Self::Distributed => "distributed",
        }
    }

    /// Whether the backend reads the dataset reference.
    #[must_use]
    pub fn requires_dataset(self) -> bool {
        !matches!(self, Self::Mock)
    }
}

impl FromStr for BackendKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mock" => Ok(Self::Mock),
            "single_process" | "single-process" | "accelerate" => Ok(Self::SingleProcess),
            "distributed" | "deepspeed" => Ok(Self::Distributed),
            _ => Err(ValidationError::UnknownBackend(s.to_string())),
        }
    }
}

/// Adaptation strategy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Lora,
    Qlora,
}

impl StrategyKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lora => "lora",
            Self::Qlora => "qlora",
        }
    }
}

impl FromStr for StrategyKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lora" => Ok(Self::Lora),
            "qlora" => Ok(Self::Qlora),
            _ => Err(ValidationError::UnknownStrategy(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetConfig {
    #[serde(rename = "type", default = "default_dataset_type")]
    pub kind: String,
    pub path: PathBuf,
    #[serde(default = "default_format_standard")]
    pub format_standard: String,
    #[serde(default)]
    pub input_columns: BTreeMap<String, Option<String>>,
    #[serde(default = "default_true")]
    pub shuffle: bool,
}

fn default_dataset_type() -> String {
    "jsonl".to_string()
}

fn default_format_standard() -> String {
    "INSTRUCTION_CHAT".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub epochs: u32,
    pub per_device_train_batch_size: u32,
    pub learning_rate: f64,
    pub gradient_accumulation_steps: u32,
    pub lr_scheduler_type: LrScheduleKind,
    pub fp16: bool,
    pub bf16: bool,
    /// Metric cadence, in optimizer steps.
    pub logging_steps: u64,
    /// Checkpoint cadence, in optimizer steps.
    pub save_steps: u64,
    pub max_seq_len: u32,
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 1,
            per_device_train_batch_size: 2,
            learning_rate: 2e-4,
            gradient_accumulation_steps: 8,
            lr_scheduler_type: LrScheduleKind::Cosine,
            fp16: false,
            bf16: true,
            logging_steps: 10,
            save_steps: 50,
            max_seq_len: 512,
            seed: 42,
        }
    }
}

impl TrainingConfig {
    pub fn validate(&self) -> ValidationResult<()> {
        if self.epochs == 0 {
            return Err(ValidationError::invalid("training.epochs", "must be >= 1"));
        }
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return Err(ValidationError::invalid("training.learning_rate", "must be > 0"));
        }
        if self.per_device_train_batch_size == 0 {
            return Err(ValidationError::invalid(
                "training.per_device_train_batch_size",
                "must be >= 1",
            ));
        }
        if self.gradient_accumulation_steps == 0 {
            return Err(ValidationError::invalid(
                "training.gradient_accumulation_steps",
                "must be >= 1",
            ));
        }
        if self.logging_steps == 0 {
            return Err(ValidationError::invalid("training.logging_steps", "must be >= 1"));
        }
        if self.save_steps == 0 {
            return Err(ValidationError::invalid("training.save_steps", "must be >= 1"));
        }
        if self.max_seq_len == 0 {
            return Err(ValidationError::invalid("training.max_seq_len", "must be >= 1"));
        }
        if self.fp16 && self.bf16 {
            return Err(ValidationError::invalid(
                "training.fp16",
                "fp16 and bf16 are mutually exclusive",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComputeConfig {
    /// `auto`, `cpu`, or `cuda`.
    pub device: String,
    pub gpu_index: u32,
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self { device: "auto".to_string(), gpu_index: 0 }
    }
}

/// Low-rank adapter parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoraConfig {
    pub r: u32,
    pub lora_alpha: f64,
    pub lora_dropout: f64,
}

impl Default for LoraConfig {
    fn default() -> Self {
        Self { r: 8, lora_alpha: 32.0, lora_dropout: 0.05 }
    }
}

/// Precision reduction applied before low-rank wrapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuantizationConfig {
    pub bits: u8,
    pub quant_type: String,
    pub double_quant: bool,
    pub compute_dtype: String,
}

impl Default for QuantizationConfig {
    fn default() -> Self {
        Self {
            bits: 4,
            quant_type: "nf4".to_string(),
            double_quant: true,
            compute_dtype: "float16".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OffloadDevice {
    None,
    Cpu,
    Nvme,
}

/// Optimizer partitioning settings for the distributed-optimization backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributedConfig {
    pub zero_stage: u8,
    pub offload_param: OffloadDevice,
    pub offload_optimizer: OffloadDevice,
    pub overlap_comm: bool,
    pub contiguous_gradients: bool,
    pub reduce_bucket_size: f64,
    pub stage3_prefetch_bucket_size: f64,
    pub stage3_param_persistence_threshold: f64,
    pub steps_per_print: u64,
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            zero_stage: 2,
            offload_param: OffloadDevice::None,
            offload_optimizer: OffloadDevice::None,
            overlap_comm: true,
            contiguous_gradients: true,
            reduce_bucket_size: 2e8,
            stage3_prefetch_bucket_size: 5e7,
            stage3_param_persistence_threshold: 1e6,
            steps_per_print: 50,
        }
    }
}

impl DistributedConfig {
    pub fn validate(&self) -> ValidationResult<()> {
        if self.zero_stage > 3 {
            return Err(ValidationError::invalid("distributed.zero_stage", "must be 0..=3"));
        }
        if self.zero_stage < 3 && self.offload_param != OffloadDevice::None {
            return Err(ValidationError::invalid(
                "distributed.offload_param",
                "parameter offload requires zero_stage 3",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MockConfig {
    pub total_steps: u64,
    pub step_delay_ms: u64,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self { total_steps: 10, step_delay_ms: 1000 }
    }
}

/// Submission as received from a caller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunRequest {
    #[serde(default)]
    pub run_name: Option<String>,
    #[serde(default)]
    pub base_model: Option<String>,
    #[serde(default)]
    pub backend: Option<String>,
    #[serde(default)]
    pub strategy: Option<String>,
    #[serde(default)]
    pub dataset: Option<DatasetConfig>,
    #[serde(default)]
    pub training: TrainingConfig,
    #[serde(default)]
    pub compute: ComputeConfig,
    #[serde(default)]
    pub lora: LoraConfig,
    #[serde(default)]
    pub quantization: QuantizationConfig,
    #[serde(default)]
    pub distributed: DistributedConfig,
    #[serde(default)]
    pub mock: MockConfig,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl RunRequest {
    #[must_use]
    pub fn new(run_name: impl Into<String>, base_model: impl Into<String>) -> Self {
        Self {
            run_name: Some(run_name.into()),
            base_model: Some(base_model.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = Some(backend.into());
        self
    }

    #[must_use]
    pub fn with_dataset(mut self, path: impl Into<PathBuf>) -> Self {
        self.dataset = Some(DatasetConfig {
            kind: default_dataset_type(),
            path: path.into(),
            format_standard: default_format_standard(),
            input_columns: BTreeMap::new(),
            shuffle: true,
        });
        self
    }

    /// Checks required fields and resolves selectors into a [`RunConfig`].
    pub fn validate(self) -> ValidationResult<RunConfig> {
        let run_name = required(self.run_name, "run_name")?;
        let base_model = required(self.base_model, "base_model")?;

        let backend = match self.backend.as_deref() {
            None => BackendKind::Mock,
            Some(s) => s.parse()?,
        };
        let strategy = match self.strategy.as_deref() {
            None => StrategyKind::Lora,
            Some(s) => s.parse()?,
        };

        let dataset = match self.dataset {
            Some(d) if d.path.as_os_str().is_empty() => None,
            other => other,
        };
        if backend.requires_dataset() && dataset.is_none() {
            return Err(ValidationError::MissingField("dataset.path"));
        }

        self.training.validate()?;
        if backend == BackendKind::Distributed {
            self.distributed.validate()?;
        }
        if backend == BackendKind::Mock && self.mock.total_steps == 0 {
            return Err(ValidationError::invalid("mock.total_steps", "must be >= 1"));
        }

        Ok(RunConfig {
            run_name,
            base_model,
            backend,
            strategy,
            dataset,
            training: self.training,
            compute: self.compute,
            lora: self.lora,
            quantization: self.quantization,
            distributed: self.distributed,
            mock: self.mock,
            notes: self.notes,
            tags: self.tags,
        })
    }
}

fn required(value: Option<String>, field: &'static str) -> ValidationResult<String> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
        _ => Err(ValidationError::MissingField(field)),
    }
}

/// Validated, immutable configuration snapshot of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub run_name: String,
    pub base_model: String,
    pub backend: BackendKind,
    pub strategy: StrategyKind,
    pub dataset: Option<DatasetConfig>,
    pub training: TrainingConfig,
    pub compute: ComputeConfig,
    pub lora: LoraConfig,
    pub quantization: QuantizationConfig,
    pub distributed: DistributedConfig,
    pub mock: MockConfig,
    pub notes: Option<String>,
    pub tags: Vec<String>,
}
