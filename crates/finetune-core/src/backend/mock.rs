//! Deterministic synthetic backend for tests and demos.

use super::{BackendError, RunContext, TrainingBackend};
use async_trait::async_trait;
use finetune_training::{BackendKind, MetricValues};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;

/// Fixed-length loop with seeded loss and learning-rate values.
///
/// Records one metric and one checkpoint per step without touching the model
/// library or the dataset.
#[derive(Debug, Default, Clone, Copy)]
pub struct MockBackend;

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10_f64.powi(decimals);
    (value * factor).round() / factor
}

#[async_trait]
impl TrainingBackend for MockBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Mock
    }

    async fn train(&self, ctx: &RunContext, _device: &str) -> Result<(), BackendError> {
        let total_steps = ctx.config.mock.total_steps;
        let delay = Duration::from_millis(ctx.config.mock.step_delay_ms);
        let mut rng = StdRng::seed_from_u64(ctx.config.training.seed);

        ctx.reporter.log(format!("Starting mock training loop for run {}", ctx.run_id));
        for step in 1..=total_steps {
            ctx.check_cancelled()?;

            let loss = round_to(rng.gen_range(0.5..=2.0), 4);
            let learning_rate = round_to(rng.gen_range(1e-5..=5e-4), 6);
            ctx.reporter.metric(step, MetricValues { loss, learning_rate })?;

            let snapshot = serde_json::json!({ "step": step, "loss": loss, "lr": learning_rate });
            let path = ctx.layout.checkpoint_path(&ctx.run_id, step);
            tokio::fs::write(&path, serde_json::to_vec_pretty(&snapshot).map_err(std::io::Error::other)?)
                .await?;
            ctx.reporter.checkpoint(step, &path, Some(&snapshot))?;
            ctx.reporter.log(format!("Checkpoint saved at step {step}"));
            ctx.reporter.log(format!("Step {step}/{total_steps} | loss={loss} | lr={learning_rate}"));

            if step < total_steps && !delay.is_zero() {
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = ctx.cancel.cancelled() => return Err(BackendError::Cancelled),
                }
            }
        }
        Ok(())
    }
}
