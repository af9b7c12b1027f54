use crate::config::RunConfig;
use crate::hardware::HardwareSnapshot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

/// Identifier for a training run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for RunId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Lifecycle state of a run.
///
/// `Created -> Running -> {Completed | Error}`. Terminal states never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunState {
    Created,
    Running,
    Completed,
    Error,
}

impl RunState {
    #[must_use]
    pub fn can_transition_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Created, Self::Running) | (Self::Running, Self::Completed | Self::Error)
        )
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "Created",
            Self::Running => "Running",
            Self::Completed => "Completed",
            Self::Error => "Error",
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Created" => Ok(Self::Created),
            "Running" => Ok(Self::Running),
            "Completed" => Ok(Self::Completed),
            "Error" => Ok(Self::Error),
            other => Err(format!("unknown run state: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunErrorKind {
    /// A required input (dataset, model files) was missing or invalid.
    MissingInput,
    /// The adaptation strategy could not be applied.
    Strategy,
    /// The training loop or collaborator library failed.
    BackendExecution,
    /// The run was cancelled before it finished.
    Cancelled,
}

impl RunErrorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MissingInput => "missing_input",
            Self::Strategy => "strategy",
            Self::BackendExecution => "backend_execution",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Structured failure attached to a run in the `Error` state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    pub kind: RunErrorKind,
    pub message: String,
}

impl RunError {
    #[must_use]
    pub fn new(kind: RunErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    /// Human-readable note stored alongside the state.
    #[must_use]
    pub fn note(&self) -> String {
        format!("Error: {}: {}", self.kind.as_str(), self.message)
    }
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.note())
    }
}

/// Persisted record of one fine-tuning attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub name: String,
    pub base_model: String,
    pub state: RunState,
    pub note: Option<String>,
    pub error: Option<RunError>,
    pub config: RunConfig,
    pub device_used: Option<String>,
    pub hardware_snapshot: Option<HardwareSnapshot>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Compact view of a run for listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub id: RunId,
    pub name: String,
    pub base_model: String,
    pub backend: String,
    pub state: RunState,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Run> for RunSummary {
    fn from(run: &Run) -> Self {
        Self {
            id: run.id.clone(),
            name: run.name.clone(),
            base_model: run.base_model.clone(),
            backend: run.config.backend.as_str().to_string(),
            state: run.state,
            note: run.note.clone(),
            created_at: run.created_at,
            updated_at: run.updated_at,
        }
    }
}

/// Values reported at a single progress point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricValues {
    pub loss: f64,
    pub learning_rate: f64,
}

/// One appended progress sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub run_id: RunId,
    pub step: u64,
    pub loss: f64,
    pub learning_rate: f64,
    pub recorded_at: DateTime<Utc>,
}

/// Reference to a persisted model snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: RunId,
    pub step: u64,
    pub storage_path: PathBuf,
    #[serde(default)]
    pub metrics_at_checkpoint: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Collapses duplicate steps keeping the last sample recorded for each one,
/// ordered by step.
#[must_use]
pub fn latest_per_step(metrics: &[Metric]) -> Vec<Metric> {
    let mut by_step = BTreeMap::new();
    for metric in metrics {
        by_step.insert(metric.step, metric.clone());
    }
    by_step.into_values().collect()
}
