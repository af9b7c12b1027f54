//! In-process stand-in for a real model-training library.
//!
//! Datasets are read from disk for real; models, adapters and the training
//! loop are simulated with a deterministic decaying loss curve.

use super::{
    DatasetHandle, LoadOptions, LowRankSpec, ModelHandle, ModelLibrary, ProgressCallback,
    QuantizationSpec, StepReport, TokenizerHandle, TrainingOutcome, TrainingPlan,
};
use crate::error::{LibraryError, LibraryResult};
use crate::schedule::LrSchedule;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use std::ops::ControlFlow;
use std::path::Path;
use std::time::Duration;

const INITIAL_LOSS: f64 = 2.0;
const LOSS_FLOOR: f64 = 0.5;

#[derive(Debug, Default)]
pub struct SimulatedLibrary {
    step_delay: Duration,
    unsupported_models: HashSet<String>,
}

impl SimulatedLibrary {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleeps for `delay` after every simulated optimizer step.
    #[must_use]
    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    /// Marks a model reference as incompatible with adapter wrapping.
    #[must_use]
    pub fn with_unsupported_model(mut self, reference: impl Into<String>) -> Self {
        self.unsupported_models.insert(reference.into());
        self
    }

    fn total_steps(dataset: &DatasetHandle, plan: &TrainingPlan) -> u64 {
        let per_step = u64::from(plan.batch_size.max(1)) * u64::from(plan.gradient_accumulation_steps.max(1));
        let per_epoch = (dataset.examples as u64).div_ceil(per_step).max(1);
        per_epoch * u64::from(plan.epochs.max(1))
    }
}

impl ModelLibrary for SimulatedLibrary {
    fn load_tokenizer(&self, reference: &str, max_length: u32) -> LibraryResult<TokenizerHandle> {
        if reference.trim().is_empty() {
            return Err(LibraryError::Tokenizer {
                reference: reference.to_string(),
                reason: "empty model reference".to_string(),
            });
        }
        Ok(TokenizerHandle { reference: reference.to_string(), max_length })
    }

    fn load_model(&self, reference: &str, options: &LoadOptions) -> LibraryResult<ModelHandle> {
        if reference.trim().is_empty() {
            return Err(LibraryError::Model {
                reference: reference.to_string(),
                reason: "empty model reference".to_string(),
            });
        }
        Ok(ModelHandle {
            reference: reference.to_string(),
            dtype: options.dtype,
            device: options.device.clone(),
            quantization: None,
            adapter: None,
            base_frozen: false,
        })
    }

    fn quantize(&self, mut model: ModelHandle, spec: &QuantizationSpec) -> LibraryResult<ModelHandle> {
        if model.adapter.is_some() {
            return Err(LibraryError::Unsupported(
                "cannot quantize a model that already carries an adapter".to_string(),
            ));
        }
        model.quantization = Some(spec.clone());
        Ok(model)
    }

    fn attach_low_rank(&self, mut model: ModelHandle, spec: &LowRankSpec) -> LibraryResult<ModelHandle> {
        if self.unsupported_models.contains(&model.reference) {
            return Err(LibraryError::Unsupported(format!(
                "{} has no target modules for low-rank adapters",
                model.reference
            )));
        }
        model.adapter = Some(spec.clone());
        model.base_frozen = true;
        Ok(model)
    }

    fn load_dataset(&self, path: &Path, _tokenizer: &TokenizerHandle) -> LibraryResult<DatasetHandle> {
        if !path.exists() {
            return Err(LibraryError::DatasetNotFound(path.display().to_string()));
        }
        let contents = std::fs::read_to_string(path)?;
        let is_csv = path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("csv"));

        let examples = if is_csv {
            contents.lines().skip(1).filter(|l| !l.trim().is_empty()).count()
        } else {
            let mut count = 0;
            for (idx, line) in contents.lines().enumerate() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let value: serde_json::Value = serde_json::from_str(line).map_err(|e| {
                    LibraryError::Dataset(format!("failed to parse jsonl line {}: {}", idx + 1, e))
                })?;
                if !value.is_object() {
                    return Err(LibraryError::Dataset(format!(
                        "jsonl line {} is not an object",
                        idx + 1
                    )));
                }
                count += 1;
            }
            count
        };

        if examples == 0 {
            return Err(LibraryError::Dataset(format!("dataset is empty: {}", path.display())));
        }
        Ok(DatasetHandle { path: path.to_path_buf(), examples })
    }

    fn run_training_loop(
        &self,
        model: &ModelHandle,
        dataset: &DatasetHandle,
        plan: &TrainingPlan,
        progress: &mut ProgressCallback<'_>,
    ) -> LibraryResult<TrainingOutcome> {
        if model.adapter.is_none() {
            return Err(LibraryError::Training(
                "model has no trainable adapter attached".to_string(),
            ));
        }

        let total_steps = Self::total_steps(dataset, plan);
        let schedule = LrSchedule::new(plan.lr_schedule, plan.learning_rate, total_steps);
        let mut rng = StdRng::seed_from_u64(plan.seed);
        let mut final_loss = None;

        for step in 1..=total_steps {
            let progress_ratio = step as f64 / total_steps as f64;
            let decay = (INITIAL_LOSS - LOSS_FLOOR) * (-3.0 * progress_ratio).exp();
            let loss = (LOSS_FLOOR + decay + rng.gen_range(-0.02..0.02)).max(0.0);
            let report = StepReport {
                step,
                total_steps,
                epoch: progress_ratio * f64::from(plan.epochs.max(1)),
                loss,
                learning_rate: schedule.at(step),
            };
            final_loss = Some(loss);

            if !self.step_delay.is_zero() {
                std::thread::sleep(self.step_delay);
            }

            if progress(&report).is_break() {
                return Ok(TrainingOutcome { steps_completed: step, final_loss, stopped_early: step < total_steps });
            }
        }

        Ok(TrainingOutcome { steps_completed: total_steps, final_loss, stopped_early: false })
    }

    fn save_checkpoint(
        &self,
        model: &ModelHandle,
        path: &Path,
        metrics: &serde_json::Value,
    ) -> LibraryResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let body = serde_json::json!({
            "model": model.reference,
            "adapter": model.adapter,
            "metrics": metrics,
        });
        std::fs::write(path, serde_json::to_string_pretty(&body)?)?;
        Ok(())
    }

    fn save_model(&self, model: &ModelHandle, dir: &Path) -> LibraryResult<()> {
        std::fs::create_dir_all(dir)?;
        std::fs::write(dir.join("adapter_config.json"), serde_json::to_string_pretty(model)?)?;
        Ok(())
    }
}
