//! Pipeline Data Model
//!
//! The immutable, validated representation of a pipeline: its declared
//! parameters and its ordered steps. Every template and condition in a
//! definition is already parsed; nothing is re-parsed per run.
//!
//! # Example YAML Format
//!
//! ```yaml
//! name: call_debtor
//! params:
//!   - name: full_name
//!   - name: timezone
//!     default: Europe/Moscow
//!
//! actions:
//!   - name: save_initial_state
//!     type: db_query
//!     connection: postgres_main
//!     query: "INSERT INTO debtors (name) VALUES ('{{ params.full_name }}')"
//!     register: db_result
//!
//!   - name: wait_if_needed
//!     type: wait_for
//!     condition: "{{ calling_allowed(params.timezone) }}"
//!     timeout: 1h
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SubmitError;
use crate::execution::retry::RetryPolicy;
use crate::pipeline::condition::Condition;
use crate::pipeline::template::{Template, TemplateValue, VarPath};

/// A declared input parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSpec {
    pub name: String,
    /// Used when a run is submitted without this parameter
    pub default: Option<Value>,
}

impl ParameterSpec {
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default: None,
        }
    }

    pub fn with_default(name: impl Into<String>, default: Value) -> Self {
        Self {
            name: name.into(),
            default: Some(default),
        }
    }
}

/// The discriminant of an [`Action`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    DbQuery,
    Script,
    HttpRequest,
    WaitFor,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::DbQuery => "db_query",
            StepKind::Script => "script",
            StepKind::HttpRequest => "http_request",
            StepKind::WaitFor => "wait_for",
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a step does, with its kind-specific parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    DbQuery {
        connection: String,
        query: Template,
    },
    Script {
        /// One template per argv element; the first names the program
        command: Vec<Template>,
        /// Treat a non-zero exit as success
        allow_failure: bool,
    },
    HttpRequest {
        url: Template,
        method: Method,
        headers: Vec<(String, Template)>,
        body: Option<TemplateValue>,
    },
    WaitFor {
        condition: Condition,
        /// Overrides the engine's poll interval
        poll_interval: Option<Duration>,
    },
}

impl Action {
    pub fn kind(&self) -> StepKind {
        match self {
            Action::DbQuery { .. } => StepKind::DbQuery,
            Action::Script { .. } => StepKind::Script,
            Action::HttpRequest { .. } => StepKind::HttpRequest,
            Action::WaitFor { .. } => StepKind::WaitFor,
        }
    }

    /// Every scope path this action reads.
    pub fn references(&self) -> Vec<&VarPath> {
        match self {
            Action::DbQuery { query, .. } => query.references().collect(),
            Action::Script { command, .. } => command.iter().flat_map(|t| t.references()).collect(),
            Action::HttpRequest {
                url, headers, body, ..
            } => url
                .references()
                .chain(headers.iter().flat_map(|(_, t)| t.references()))
                .chain(body.iter().flat_map(|b| b.references()))
                .collect(),
            Action::WaitFor { condition, .. } => condition.references(),
        }
    }

    /// The named database connection this action needs, if any.
    pub fn connection(&self) -> Option<&str> {
        match self {
            Action::DbQuery { connection, .. } => Some(connection),
            _ => None,
        }
    }
}

/// A single step in a pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct StepDefinition {
    /// Unique within the pipeline
    pub name: String,

    pub action: Action,

    /// Binds this step's output under `actions.<register>`
    pub register: Option<String>,

    /// Absent means the engine default; required for `wait_for`
    pub timeout: Option<Duration>,

    /// Overrides the pipeline's retry policy
    pub retry: Option<RetryPolicy>,
}

impl StepDefinition {
    /// Creates a step with no register, timeout or retry override.
    ///
    /// # Example
    ///
    /// ```
    /// use callflow::pipeline::{Action, StepDefinition, Template};
    ///
    /// let step = StepDefinition::new(
    ///     "save_initial_state",
    ///     Action::DbQuery {
    ///         connection: "postgres_main".into(),
    ///         query: Template::parse("SELECT 1").unwrap(),
    ///     },
    /// )
    /// .with_register("db_result");
    /// ```
    pub fn new(name: impl Into<String>, action: Action) -> Self {
        Self {
            name: name.into().trim().to_string(),
            action,
            register: None,
            timeout: None,
            retry: None,
        }
    }

    pub fn with_register(mut self, register: impl Into<String>) -> Self {
        self.register = Some(register.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn kind(&self) -> StepKind {
        self.action.kind()
    }
}

/// A recurring trigger declared by the pipeline itself.
#[derive(Debug, Clone, PartialEq)]
pub struct Schedule {
    pub every: Duration,
    pub params: BTreeMap<String, Value>,
}

/// A named, ordered sequence of steps.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Vec<ParameterSpec>,
    /// Execution order
    pub steps: Vec<StepDefinition>,
    /// Overrides the engine's default concurrency limit
    pub max_concurrent: Option<usize>,
    /// Overrides the engine's default retry policy
    pub retry: Option<RetryPolicy>,
    pub schedule: Option<Schedule>,
}

impl PipelineDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into().trim().to_string(),
            description: String::new(),
            parameters: Vec::new(),
            steps: Vec::new(),
            max_concurrent: None,
            retry: None,
            schedule: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_parameter(mut self, parameter: ParameterSpec) -> Self {
        self.parameters.push(parameter);
        self
    }

    pub fn with_step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = Some(max_concurrent);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = Some(schedule);
        self
    }

    pub fn get_step(&self, name: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Every database connection named by a step.
    pub fn connections(&self) -> BTreeSet<&str> {
        self.steps
            .iter()
            .filter_map(|s| s.action.connection())
            .collect()
    }

    /// Builds a run's input parameters from what the trigger supplied.
    ///
    /// Declared defaults fill absent parameters; undeclared extras are kept.
    pub fn resolve_inputs(
        &self,
        mut given: BTreeMap<String, Value>,
    ) -> Result<BTreeMap<String, Value>, SubmitError> {
        for parameter in &self.parameters {
            if given.contains_key(&parameter.name) {
                continue;
            }
            match &parameter.default {
                Some(default) => {
                    given.insert(parameter.name.clone(), default.clone());
                }
                None => {
                    return Err(SubmitError::MissingParameter {
                        pipeline: self.name.clone(),
                        parameter: parameter.name.clone(),
                    })
                }
            }
        }
        Ok(given)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn script(command: &str) -> Action {
        Action::Script {
            command: command.split_whitespace().map(|w| Template::parse(w).unwrap()).collect(),
            allow_failure: false,
        }
    }

    #[test]
    fn test_step_builder() {
        let step = StepDefinition::new("  check_legal_time ", script("echo ok"))
            .with_register("compliance_check")
            .with_timeout(Duration::from_secs(5));

        assert_eq!(step.name, "check_legal_time");
        assert_eq!(step.kind(), StepKind::Script);
        assert_eq!(step.register.as_deref(), Some("compliance_check"));
        assert_eq!(step.timeout, Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_action_references() {
        let action = Action::HttpRequest {
            url: Template::parse("http://tts/{{ params.voice }}").unwrap(),
            method: Method::POST,
            headers: vec![(
                "X-Run".to_string(),
                Template::parse("{{ actions.db_result.id }}").unwrap(),
            )],
            body: Some(TemplateValue::parse(&json!({"text": "{{ params.full_name }}"})).unwrap()),
        };
        let refs: Vec<&str> = action.references().iter().map(|p| p.as_str()).collect();
        assert_eq!(refs, vec!["params.voice", "actions.db_result.id", "params.full_name"]);
    }

    #[test]
    fn test_resolve_inputs() {
        let pipeline = PipelineDefinition::new("call_debtor")
            .with_parameter(ParameterSpec::required("full_name"))
            .with_parameter(ParameterSpec::with_default("timezone", json!("Europe/Moscow")));

        let mut given = BTreeMap::new();
        given.insert("full_name".to_string(), json!("Ivan"));
        given.insert("campaign".to_string(), json!("march"));

        let inputs = pipeline.resolve_inputs(given).unwrap();
        assert_eq!(inputs["timezone"], json!("Europe/Moscow"));
        assert_eq!(inputs["campaign"], json!("march"));

        let err = pipeline.resolve_inputs(BTreeMap::new()).unwrap_err();
        assert_eq!(
            err,
            SubmitError::MissingParameter {
                pipeline: "call_debtor".into(),
                parameter: "full_name".into()
            }
        );
    }

    #[test]
    fn test_connections() {
        let pipeline = PipelineDefinition::new("p")
            .with_step(StepDefinition::new(
                "a",
                Action::DbQuery {
                    connection: "postgres_main".into(),
                    query: Template::literal("SELECT 1"),
                },
            ))
            .with_step(StepDefinition::new("b", script("true")));

        assert_eq!(pipeline.connections().into_iter().collect::<Vec<_>>(), vec!["postgres_main"]);
        assert_eq!(pipeline.len(), 2);
        assert!(pipeline.get_step("b").is_some());
    }

    #[test]
    fn test_step_kind_display() {
        assert_eq!(StepKind::HttpRequest.to_string(), "http_request");
        assert_eq!(serde_json::to_string(&StepKind::WaitFor).unwrap(), "\"wait_for\"");
    }
}
