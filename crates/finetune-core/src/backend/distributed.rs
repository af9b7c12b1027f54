//! Distributed-optimization backend.
//!
//! Same pipeline as the single-process backend, plus a ZeRO-style optimizer
//! partitioning config written to the run directory and handed to the library.

use super::single_process::run_blocking;
use super::{BackendError, RunContext, TrainingBackend};
use async_trait::async_trait;
use finetune_training::{BackendKind, RunConfig};

#[derive(Debug, Default, Clone, Copy)]
pub struct DistributedBackend;

/// Optimizer partitioning config derived from a run's settings.
#[must_use]
pub fn optimization_config(config: &RunConfig) -> serde_json::Value {
    let d = &config.distributed;
    let t = &config.training;
    serde_json::json!({
        "zero_optimization": {
            "stage": d.zero_stage,
            "offload_param": { "device": d.offload_param },
            "offload_optimizer": { "device": d.offload_optimizer },
            "overlap_comm": d.overlap_comm,
            "contiguous_gradients": d.contiguous_gradients,
            "reduce_bucket_size": d.reduce_bucket_size,
            "stage3_prefetch_bucket_size": d.stage3_prefetch_bucket_size,
            "stage3_param_persistence_threshold": d.stage3_param_persistence_threshold,
        },
        "fp16": { "enabled": t.fp16 },
        "bf16": { "enabled": t.bf16 },
        "train_micro_batch_size_per_gpu": t.per_device_train_batch_size,
        "gradient_accumulation_steps": t.gradient_accumulation_steps,
        "steps_per_print": d.steps_per_print,
        "wall_clock_breakdown": false,
    })
}

#[async_trait]
impl TrainingBackend for DistributedBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Distributed
    }

    async fn train(&self, ctx: &RunContext, device: &str) -> Result<(), BackendError> {
        let path = ctx.layout.optimization_config_path(&ctx.run_id);
        let body = serde_json::to_vec_pretty(&optimization_config(&ctx.config))
            .map_err(std::io::Error::other)?;
        tokio::fs::write(&path, body).await?;
        ctx.reporter.log(format!(
            "Starting distributed training (ZeRO-{}) with {}",
            ctx.config.distributed.zero_stage,
            path.display()
        ));
        run_blocking(ctx, device, Some(path)).await
    }
}
