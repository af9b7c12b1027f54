use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LrScheduleKind {
    Constant,
    Linear,
    Cosine,
}

/// Learning-rate schedule over a fixed number of optimizer steps.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LrSchedule {
    kind: LrScheduleKind,
    base_lr: f64,
    total_steps: u64,
}

impl LrSchedule {
    #[must_use]
    pub fn new(kind: LrScheduleKind, base_lr: f64, total_steps: u64) -> Self {
        Self { kind, base_lr, total_steps: total_steps.max(1) }
    }

    /// Learning rate applied at `step` (1-based).
    #[must_use]
    pub fn at(&self, step: u64) -> f64 {
        let progress = (step.saturating_sub(1)) as f64 / self.total_steps as f64;
        let progress = progress.clamp(0.0, 1.0);
        match self.kind {
            LrScheduleKind::Constant => self.base_lr,
            LrScheduleKind::Linear => self.base_lr * (1.0 - progress),
            LrScheduleKind::Cosine => self.base_lr * 0.5 * (1.0 + (PI * progress).cos()),
        }
    }
}
