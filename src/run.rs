//! Run Model
//!
//! Identifiers, lifecycle states and the serializable snapshots the registry
//! and archive keep for every run.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::duration::serde_str;
use crate::error::{ErrorKind, StepError};
use crate::pipeline::StepKind;
use crate::scope::Scope;

/// Unique identifier of a run (UUID v4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Lifecycle state of a run.
///
/// ```text
/// queued ──► running ──► succeeded | failed | timed_out | cancelled
///    └──────────────────────────────────────────────────► cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Queued | RunStatus::Running)
    }

    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        match (self, next) {
            (RunStatus::Queued, RunStatus::Running | RunStatus::Cancelled) => true,
            (RunStatus::Running, next) => next.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::TimedOut => "timed_out",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What caused a run to be submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    Manual {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        requested_by: Option<String>,
    },
    Scheduled {
        /// The schedule's interval, e.g. `15m`
        every: String,
    },
    /// An upstream event such as an uploaded file
    Event { name: String, payload: Value },
}

impl Trigger {
    pub fn manual() -> Self {
        Trigger::Manual { requested_by: None }
    }

    pub fn event(name: impl Into<String>, payload: Value) -> Self {
        Trigger::Event {
            name: name.into(),
            payload,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Trigger::Manual { .. } => "manual",
            Trigger::Scheduled { .. } => "scheduled",
            Trigger::Event { .. } => "event",
        }
    }
}

/// How a finished step ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Succeeded,
    Failed,
    TimedOut,
}

/// One finished step in a run's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub step: String,
    pub kind: StepKind,
    pub outcome: StepOutcome,
    pub attempts: u32,
    pub started_at: DateTime<Utc>,
    #[serde(with = "serde_str")]
    pub duration: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Why a run did not succeed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureReason {
    /// The step that failed or was interrupted
    pub step: Option<String>,
    pub kind: ErrorKind,
    pub message: String,
}

impl FailureReason {
    pub fn from_step_error(step: &str, error: &StepError) -> Self {
        Self {
            step: Some(step.to_string()),
            kind: error.kind(),
            message: error.to_string(),
        }
    }

    /// The run's task died without producing an outcome.
    pub fn aborted(step: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            step: step.map(str::to_string),
            kind: ErrorKind::Executor,
            message: message.into(),
        }
    }

    pub fn cancelled(step: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            step: step.map(str::to_string),
            kind: ErrorKind::Cancelled,
            message: message.into(),
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.step {
            Some(step) => {
                let verb = match self.kind {
                    ErrorKind::Cancelled => "interrupted",
                    ErrorKind::TimedOut => "timed out",
                    ErrorKind::Resolution | ErrorKind::Executor => "failed",
                };
                write!(f, "step '{}' {} ({}): {}", step, verb, self.kind, self.message)
            }
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

/// Everything known about a run at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub id: RunId,
    pub pipeline: String,
    pub trigger: Trigger,
    pub input: BTreeMap<String, Value>,
    pub status: RunStatus,
    /// Index of the step being executed
    pub current_step: Option<usize>,
    pub history: Vec<HistoryEntry>,
    /// Params plus outputs of completed, registered steps
    pub scope: Scope,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub reason: Option<FailureReason>,
}

impl RunSnapshot {
    /// A freshly submitted, queued run.
    pub fn queued(
        id: RunId,
        pipeline: impl Into<String>,
        trigger: Trigger,
        input: BTreeMap<String, Value>,
        submitted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            pipeline: pipeline.into(),
            trigger,
            scope: Scope::with_params(input.clone()),
            input,
            status: RunStatus::Queued,
            current_step: None,
            history: Vec::new(),
            submitted_at,
            started_at: None,
            ended_at: None,
            reason: None,
        }
    }

    /// Wall time from start to end, once both are known.
    pub fn duration(&self) -> Option<Duration> {
        let started = self.started_at?;
        let ended = self.ended_at?;
        (ended - started).to_std().ok()
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            id: self.id,
            pipeline: self.pipeline.clone(),
            status: self.status,
            trigger: self.trigger.label().to_string(),
            submitted_at: self.submitted_at,
            started_at: self.started_at,
            ended_at: self.ended_at,
            steps_completed: self.history.len(),
            reason: self.reason.as_ref().map(|r| r.to_string()),
        }
    }
}

/// A compact row for run listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub id: RunId,
    pub pipeline: String,
    pub status: RunStatus,
    pub trigger: String,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub steps_completed: usize,
    pub reason: Option<String>,
}
