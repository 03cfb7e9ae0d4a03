//! Error Taxonomy
//!
//! Every failure the engine can report, grouped by where it is detected:
//!
//! - [`ConfigError`]: a pipeline definition or engine config is malformed
//!   (detected at load/registration time, before any run is admitted)
//! - [`ResolutionError`]: a template referenced a value the run scope lacks
//! - [`ExecutorError`]: an integration call failed
//! - [`StepError`]: the union a single step attempt can end with
//! - [`SubmitError`]: the Trigger API rejected a run request
//! - [`EngineError`]: anything surfaced by the [`Engine`](crate::Engine) facade

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Malformed pipeline definitions or engine configuration.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Pipeline has an empty name")]
    EmptyPipelineName,

    #[error("Pipeline '{0}' has no steps")]
    EmptyPipeline(String),

    #[error("Duplicate step name: '{0}'")]
    DuplicateStep(String),

    #[error("Duplicate parameter: '{0}'")]
    DuplicateParameter(String),

    #[error("Register name '{name}' is bound by both '{first}' and '{second}'")]
    DuplicateRegister {
        name: String,
        first: String,
        second: String,
    },

    #[error("Step '{step}': {message}")]
    InvalidStep { step: String, message: String },

    #[error("Step '{step}': invalid expression {expression:?}: {message}")]
    InvalidExpression {
        step: String,
        expression: String,
        message: String,
    },

    #[error("Step '{step}' references unknown parameter '{parameter}'")]
    UnknownParameter { step: String, parameter: String },

    #[error("Step '{step}' references 'actions.{register}' but no earlier step registers it")]
    UnknownRegister { step: String, register: String },

    #[error("Step '{step}' uses unknown connection '{connection}'")]
    UnknownConnection { step: String, connection: String },

    #[error("Invalid duration '{0}' (expected e.g. 500ms, 30s, 10m, 1h)")]
    InvalidDuration(String),

    #[error("Invalid value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("Failed to parse definition: {0}")]
    Parse(String),

    #[error("Failed to read '{path}': {message}")]
    Io { path: String, message: String },

    #[error("Pipeline '{0}' is already registered")]
    DuplicatePipeline(String),

    #[error("{}", join_errors(.0))]
    Multiple(Vec<ConfigError>),
}

fn join_errors(errors: &[ConfigError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

impl ConfigError {
    /// Collapses a list of validation errors into a single error.
    ///
    /// Returns `None` for an empty list.
    pub fn from_list(mut errors: Vec<ConfigError>) -> Option<ConfigError> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(ConfigError::Multiple(errors)),
        }
    }
}

/// A template referenced a path the run scope cannot satisfy.
///
/// Always a step-author bug; never retried.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ResolutionError {
    #[error("'{path}': unknown parameter")]
    UnknownParameter { path: String },

    #[error("'{path}': no completed step has registered '{register}'")]
    UnavailableAction { path: String, register: String },

    #[error("'{path}': cannot resolve segment '{segment}'")]
    MissingField { path: String, segment: String },
}

impl ResolutionError {
    /// The full path that failed to resolve.
    pub fn path(&self) -> &str {
        match self {
            Self::UnknownParameter { path }
            | Self::UnavailableAction { path, .. }
            | Self::MissingField { path, .. } => path,
        }
    }
}

/// An integration call failed.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExecutorError {
    #[error("connection '{connection}' unavailable: {message}")]
    ConnectionUnavailable { connection: String, message: String },

    #[error("query failed: {0}")]
    Query(String),

    #[error("failed to start '{program}': {message}")]
    Spawn { program: String, message: String },

    #[error("script exited with status {}: {stderr}", display_code(.code))]
    NonZeroExit { code: Option<i32>, stderr: String },

    #[error("HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },

    #[error("network timeout calling {url}")]
    NetworkTimeout { url: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("step exceeded its {0:?} timeout")]
    DeadlineExceeded(Duration),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
}

fn display_code(code: &Option<i32>) -> String {
    code.map_or_else(|| "signal".to_string(), |c| c.to_string())
}

/// How a single step attempt can end unsuccessfully.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StepError {
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error("condition did not hold within {0:?}")]
    TimedOut(Duration),

    #[error("cancelled")]
    Cancelled,
}

impl StepError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Resolution(_) => ErrorKind::Resolution,
            Self::Executor(_) => ErrorKind::Executor,
            Self::TimedOut(_) => ErrorKind::TimedOut,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Only integration failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Executor(_))
    }
}

/// Error category recorded in run history and terminal reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    #[serde(rename = "resolution_error")]
    Resolution,
    #[serde(rename = "executor_error")]
    Executor,
    TimedOut,
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Resolution => "resolution_error",
            Self::Executor => "executor_error",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

/// Rejections from the Trigger API.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SubmitError {
    #[error("Unknown pipeline: '{0}'")]
    UnknownPipeline(String),

    #[error("Pipeline '{pipeline}' requires parameter '{parameter}'")]
    MissingParameter { pipeline: String, parameter: String },

    #[error("Engine is shutting down")]
    ShuttingDown,
}

/// Failures persisting or reading archived runs.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive I/O on '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("archive serialization: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Errors surfaced by the engine facade.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Submit(#[from] SubmitError),

    #[error("Unknown pipeline: '{0}'")]
    UnknownPipeline(String),

    #[error("Unknown run: '{0}'")]
    UnknownRun(String),

    #[error(transparent)]
    Archive(#[from] ArchiveError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_error_kinds() {
        let err = StepError::from(ResolutionError::UnknownParameter {
            path: "params.x".into(),
        });
        assert_eq!(err.kind(), ErrorKind::Resolution);
        assert!(!err.is_retryable());

        let err = StepError::from(ExecutorError::Query("boom".into()));
        assert_eq!(err.kind(), ErrorKind::Executor);
        assert!(err.is_retryable());

        assert!(!StepError::TimedOut(Duration::from_secs(1)).is_retryable());
        assert!(!StepError::Cancelled.is_retryable());
    }

    #[test]
    fn test_error_kind_display_matches_serde() {
        for kind in [
            ErrorKind::Resolution,
            ErrorKind::Executor,
            ErrorKind::TimedOut,
            ErrorKind::Cancelled,
        ] {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind));
        }
    }

    #[test]
    fn test_config_error_from_list() {
        assert!(ConfigError::from_list(vec![]).is_none());

        let single = ConfigError::from_list(vec![ConfigError::EmptyPipelineName]).unwrap();
        assert_eq!(single, ConfigError::EmptyPipelineName);

        let multiple = ConfigError::from_list(vec![
            ConfigError::DuplicateStep("a".into()),
            ConfigError::DuplicateStep("b".into()),
        ])
        .unwrap();
        let text = multiple.to_string();
        assert!(text.contains("'a'"));
        assert!(text.contains("'b'"));
        assert_eq!(text.lines().count(), 2);
    }

    #[test]
    fn test_resolution_error_path() {
        let err = ResolutionError::UnavailableAction {
            path: "actions.db_result.id".into(),
            register: "db_result".into(),
        };
        assert_eq!(err.path(), "actions.db_result.id");
        assert!(err.to_string().contains("db_result"));
    }

    #[test]
    fn test_non_zero_exit_display() {
        let err = ExecutorError::NonZeroExit {
            code: Some(2),
            stderr: "bad".into(),
        };
        assert_eq!(err.to_string(), "script exited with status 2: bad");

        let err = ExecutorError::NonZeroExit {
            code: None,
            stderr: String::new(),
        };
        assert!(err.to_string().contains("signal"));
    }
}
