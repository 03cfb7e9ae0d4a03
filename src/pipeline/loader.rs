//! Pipeline Loader
//!
//! Reads pipeline definitions from YAML in the `params` / `actions` layout
//! and turns them into validated [`PipelineDefinition`]s. Templates,
//! conditions and script command lines are parsed here, once.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use log::{debug, info};
use reqwest::Method;
use serde::Deserialize;
use serde_json::Value;

use super::condition::Condition;
use super::model::{Action, ParameterSpec, PipelineDefinition, Schedule, StepDefinition};
use super::template::{Template, TemplateError, TemplateValue};
use super::validator::validate_pipeline;
use crate::duration::{serde_opt, serde_str};
use crate::error::ConfigError;
use crate::execution::retry::RetryPolicy;

#[derive(Debug, Deserialize)]
struct RawPipeline {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default, alias = "parameters")]
    params: Vec<RawParameter>,
    #[serde(alias = "steps")]
    actions: Vec<RawStep>,
    #[serde(default)]
    max_concurrent: Option<usize>,
    #[serde(default)]
    retry: Option<RawRetry>,
    #[serde(default)]
    schedule: Option<RawSchedule>,
}

/// `- full_name` or `- name: full_name` with an optional default.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawParameter {
    Name(String),
    Spec {
        name: String,
        #[serde(default)]
        default: Option<Value>,
    },
}

/// `retry: true` enables three attempts with the default backoff.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawRetry {
    Enabled(bool),
    Policy(RetryPolicy),
}

impl RawRetry {
    fn into_policy(self) -> RetryPolicy {
        match self {
            RawRetry::Enabled(true) => RetryPolicy::with_attempts(3),
            RawRetry::Enabled(false) => RetryPolicy::none(),
            RawRetry::Policy(policy) => policy,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawSchedule {
    #[serde(with = "serde_str")]
    every: Duration,
    #[serde(default)]
    params: BTreeMap<String, Value>,
}

#[derive(Debug, Deserialize)]
struct RawStep {
    name: String,
    #[serde(flatten)]
    action: RawAction,
    #[serde(default)]
    register: Option<String>,
    #[serde(default, with = "serde_opt")]
    timeout: Option<Duration>,
    #[serde(default)]
    retry: Option<RawRetry>,
}

fn default_method() -> String {
    "POST".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RawAction {
    DbQuery {
        connection: String,
        query: String,
    },
    Script {
        script: String,
        #[serde(default)]
        allow_failure: bool,
    },
    HttpRequest {
        url: String,
        #[serde(default = "default_method")]
        method: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
        #[serde(default)]
        body: Option<Value>,
    },
    WaitFor {
        condition: String,
        #[serde(default, with = "serde_opt")]
        poll_interval: Option<Duration>,
    },
}

/// Splits a command line into arguments.
///
/// Whitespace separates arguments except inside quotes or `{{ }}`. Quotes
/// group but are not kept.
pub fn split_command(line: &str) -> Result<Vec<String>, String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_arg = false;
    let mut quote: Option<char> = None;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '{' && chars.peek() == Some(&'{') {
            chars.next();
            current.push_str("{{");
            in_arg = true;
            let mut closed = false;
            while let Some(inner) = chars.next() {
                current.push(inner);
                if inner == '}' && chars.peek() == Some(&'}') {
                    chars.next();
                    current.push('}');
                    closed = true;
                    break;
                }
            }
            if !closed {
                return Err("unclosed '{{'".to_string());
            }
            continue;
        }

        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '\'' || c == '"' => {
                quote = Some(c);
                in_arg = true;
            }
            None if c.is_whitespace() => {
                if in_arg {
                    args.push(std::mem::take(&mut current));
                    in_arg = false;
                }
            }
            None => {
                current.push(c);
                in_arg = true;
            }
        }
    }

    if let Some(q) = quote {
        return Err(format!("unterminated {} quote", q));
    }
    if in_arg {
        args.push(current);
    }
    Ok(args)
}

fn expression_error(step: &str, expression: &str, error: TemplateError) -> ConfigError {
    ConfigError::InvalidExpression {
        step: step.to_string(),
        expression: expression.to_string(),
        message: error.to_string(),
    }
}

fn build_action(step: &str, raw: RawAction) -> Result<Action, ConfigError> {
    let template = |source: &str| {
        Template::parse(source).map_err(|e| expression_error(step, source, e))
    };

    Ok(match raw {
        RawAction::DbQuery { connection, query } => Action::DbQuery {
            connection,
            query: template(&query)?,
        },
        RawAction::Script {
            script,
            allow_failure,
        } => {
            let words = split_command(&script).map_err(|message| ConfigError::InvalidExpression {
                step: step.to_string(),
                expression: script.clone(),
                message,
            })?;
            Action::Script {
                command: words.iter().map(|w| template(w)).collect::<Result<_, _>>()?,
                allow_failure,
            }
        }
        RawAction::HttpRequest {
            url,
            method,
            headers,
            body,
        } => {
            let method = Method::from_bytes(method.trim().to_ascii_uppercase().as_bytes())
                .map_err(|_| ConfigError::InvalidStep {
                    step: step.to_string(),
                    message: format!("invalid HTTP method '{}'", method),
                })?;
            let headers = headers
                .iter()
                .map(|(name, value)| Ok((name.clone(), template(value)?)))
                .collect::<Result<_, ConfigError>>()?;
            let body = body
                .as_ref()
                .map(|b| {
                    TemplateValue::parse(b).map_err(|e| expression_error(step, &b.to_string(), e))
                })
                .transpose()?;
            Action::HttpRequest {
                url: template(&url)?,
                method,
                headers,
                body,
            }
        }
        RawAction::WaitFor {
            condition,
            poll_interval,
        } => Action::WaitFor {
            condition: Condition::parse(&condition)
                .map_err(|e| expression_error(step, &condition, e))?,
            poll_interval,
        },
    })
}

fn build_pipeline(raw: RawPipeline) -> Result<PipelineDefinition, ConfigError> {
    let mut pipeline = PipelineDefinition::new(raw.name).with_description(raw.description);
    pipeline.max_concurrent = raw.max_concurrent;
    pipeline.retry = raw.retry.map(RawRetry::into_policy);
    pipeline.schedule = raw.schedule.map(|s| Schedule {
        every: s.every,
        params: s.params,
    });

    for parameter in raw.params {
        pipeline.parameters.push(match parameter {
            RawParameter::Name(name) => ParameterSpec::required(name),
            RawParameter::Spec {
                name,
                default: Some(default),
            } => ParameterSpec::with_default(name, default),
            RawParameter::Spec { name, default: None } => ParameterSpec::required(name),
        });
    }

    let mut errors = Vec::new();
    for raw_step in raw.actions {
        match build_action(&raw_step.name, raw_step.action) {
            Ok(action) => {
                let mut step = StepDefinition::new(raw_step.name, action);
                step.register = raw_step.register;
                step.timeout = raw_step.timeout;
                step.retry = raw_step.retry.map(RawRetry::into_policy);
                pipeline.steps.push(step);
            }
            Err(error) => errors.push(error),
        }
    }
    if let Some(error) = ConfigError::from_list(errors) {
        return Err(error);
    }

    Ok(pipeline)
}

/// Parses and validates a pipeline definition from YAML text.
pub fn parse_pipeline(yaml: &str) -> Result<PipelineDefinition, ConfigError> {
    let raw: RawPipeline = serde_yaml::from_str(yaml)
        .map_err(|e| ConfigError::Parse(format!("{}. Check the file format.", e)))?;

    debug!("Parsed pipeline '{}' with {} actions", raw.name, raw.actions.len());

    let pipeline = build_pipeline(raw)?;
    validate_pipeline(&pipeline)?;
    Ok(pipeline)
}

/// Loads a pipeline definition from a YAML file.
///
/// # Example
///
/// ```rust,no_run
/// use callflow::pipeline::load_pipeline;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let pipeline = load_pipeline("call_debtor.yaml")?;
///     println!("Loaded {} steps", pipeline.steps.len());
///     Ok(())
/// }
/// ```
pub fn load_pipeline(path: impl AsRef<Path>) -> Result<PipelineDefinition, ConfigError> {
    let path = path.as_ref();
    info!("Loading pipeline from: {}", path.display());

    let yaml = fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    let pipeline = parse_pipeline(&yaml)?;
    info!(
        "Loaded pipeline '{}': {} steps, {} params",
        pipeline.name,
        pipeline.steps.len(),
        pipeline.parameters.len()
    );
    Ok(pipeline)
}
