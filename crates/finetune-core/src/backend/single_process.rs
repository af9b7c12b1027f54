//! Single-process backend driving the model library's training loop.

use super::{BackendError, RunContext, TrainingBackend};
use async_trait::async_trait;
use finetune_training::{
    BackendKind, Dtype, LoadOptions, MetricValues, ModelHandle, StepReport, TrainingPlan,
    strategy_for,
};
use std::ops::ControlFlow;
use std::path::PathBuf;

#[derive(Debug, Default, Clone, Copy)]
pub struct SingleProcessBackend;

#[async_trait]
impl TrainingBackend for SingleProcessBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::SingleProcess
    }

    async fn train(&self, ctx: &RunContext, device: &str) -> Result<(), BackendError> {
        ctx.reporter.log("Starting single-process training");
        run_blocking(ctx, device, None).await
    }
}

/// Runs [`run_library_training`] on the blocking pool.
pub(crate) async fn run_blocking(
    ctx: &RunContext,
    device: &str,
    optimization_config: Option<PathBuf>,
) -> Result<(), BackendError> {
    let ctx = ctx.clone();
    let device = device.to_string();
    tokio::task::spawn_blocking(move || run_library_training(&ctx, &device, optimization_config))
        .await
        .map_err(|e| BackendError::Task(e.to_string()))?
}

/// Load, adapt, train and save through the model library.
///
/// Blocks the calling thread for the whole training loop.
pub(crate) fn run_library_training(
    ctx: &RunContext,
    device: &str,
    optimization_config: Option<PathBuf>,
) -> Result<(), BackendError> {
    let config = &ctx.config;
    let library = ctx.library.as_ref();
    ctx.check_cancelled()?;

    let dataset = config
        .dataset
        .as_ref()
        .ok_or_else(|| BackendError::MissingInput("no dataset configured".to_string()))?;
    if !dataset.path.exists() {
        ctx.reporter.log(format!("Dataset not found: {}", dataset.path.display()));
        return Err(BackendError::MissingInput(format!(
            "dataset not found: {}",
            dataset.path.display()
        )));
    }

    ctx.reporter.log(format!("Loading tokenizer for {}", config.base_model));
    let tokenizer = library.load_tokenizer(&config.base_model, config.training.max_seq_len)?;
    let dataset = library.load_dataset(&dataset.path, &tokenizer)?;
    ctx.reporter.log(format!("Loaded {} examples from {}", dataset.examples, dataset.path.display()));

    ctx.reporter.log(format!("Loading model {} on {device}", config.base_model));
    let options = LoadOptions {
        dtype: Dtype::from_flags(config.training.fp16, config.training.bf16),
        device: device.to_string(),
    };
    let base = library.load_model(&config.base_model, &options)?;

    let strategy = strategy_for(config);
    ctx.reporter.log(format!("Applying {} adaptation", strategy.kind().as_str()));
    let model = strategy.apply(library, base)?;
    ctx.check_cancelled()?;

    let plan = TrainingPlan {
        epochs: config.training.epochs,
        batch_size: config.training.per_device_train_batch_size,
        gradient_accumulation_steps: config.training.gradient_accumulation_steps,
        learning_rate: config.training.learning_rate,
        lr_schedule: config.training.lr_scheduler_type,
        seed: config.training.seed,
        output_dir: ctx.layout.checkpoints_dir(&ctx.run_id),
        optimization_config,
    };

    let mut failure = None;
    let outcome = library.run_training_loop(&model, &dataset, &plan, &mut |report: &StepReport| {
        if let Err(e) = report_step(ctx, &model, report) {
            failure = Some(e);
            return ControlFlow::Break(());
        }
        if ctx.cancel.is_cancelled() {
            return ControlFlow::Break(());
        }
        ControlFlow::Continue(())
    })?;
    if let Some(e) = failure {
        return Err(e);
    }
    if outcome.stopped_early {
        return Err(BackendError::Cancelled);
    }

    let adapter_dir = ctx.layout.adapter_dir(&ctx.run_id);
    library.save_model(&model, &adapter_dir)?;
    ctx.reporter.log(format!(
        "Saved adapter to {} after {} steps",
        adapter_dir.display(),
        outcome.steps_completed
    ));
    Ok(())
}

/// Records a metric every `logging_steps` and on the last step, and a
/// checkpoint every `save_steps`.
fn report_step(ctx: &RunContext, model: &ModelHandle, report: &StepReport) -> Result<(), BackendError> {
    let training = &ctx.config.training;
    let step = report.step;

    if step % training.logging_steps == 0 || step == report.total_steps {
        ctx.reporter.metric(step, MetricValues { loss: report.loss, learning_rate: report.learning_rate })?;
        ctx.reporter.log(format!(
            "Step {step}/{} | loss={:.4} | lr={:.6}",
            report.total_steps, report.loss, report.learning_rate
        ));
    }

    if step % training.save_steps == 0 {
        let path = ctx.layout.checkpoint_path(&ctx.run_id, step);
        let snapshot = serde_json::json!({
            "step": step,
            "epoch": report.epoch,
            "loss": report.loss,
            "learning_rate": report.learning_rate,
        });
        ctx.library.save_checkpoint(model, &path, &snapshot)?;
        ctx.reporter.checkpoint(step, &path, Some(&snapshot))?;
        ctx.reporter.log(format!("Checkpoint saved at step {step}"));
    }
    Ok(())
}
