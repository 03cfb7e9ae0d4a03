//! Pipeline Validation
//!
//! Checks a [`PipelineDefinition`] before it can be registered:
//! - pipeline, parameter and step names are present and unique
//! - `register` names are unique identifiers
//! - every `params.*` reference names a declared parameter
//! - every `actions.*` reference names a register bound by an *earlier* step
//! - `wait_for` steps declare a timeout and no register
//! - retry policies and concurrency limits are sensible

use std::collections::{HashMap, HashSet};

use log::{debug, info};

use super::model::{Action, PipelineDefinition, StepDefinition};
use crate::error::ConfigError;
use crate::execution::retry::RetryPolicy;

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn validate_retry(field: String, policy: &RetryPolicy) -> Vec<ConfigError> {
    let mut errors = Vec::new();
    if policy.max_attempts == 0 {
        errors.push(ConfigError::InvalidValue {
            field: field.clone(),
            message: "max_attempts must be at least 1".to_string(),
        });
    }
    if !(policy.multiplier >= 1.0) {
        errors.push(ConfigError::InvalidValue {
            field,
            message: format!("multiplier must be >= 1 (got {})", policy.multiplier),
        });
    }
    errors
}

/// Validates a single step's own fields.
fn validate_step(step: &StepDefinition) -> Vec<ConfigError> {
    let mut errors = Vec::new();
    let invalid = |message: &str| ConfigError::InvalidStep {
        step: step.name.clone(),
        message: message.to_string(),
    };

    if let Some(register) = &step.register {
        if !is_identifier(register) {
            errors.push(invalid(&format!("register '{}' is not a valid name", register)));
        }
    }

    if step.timeout.map_or(false, |t| t.is_zero()) {
        errors.push(invalid("timeout must be greater than zero"));
    }

    match &step.action {
        Action::DbQuery { connection, query } => {
            if connection.trim().is_empty() {
                errors.push(invalid("db_query needs a connection"));
            }
            if query.source().trim().is_empty() {
                errors.push(invalid("db_query needs a query"));
            }
        }
        Action::Script { command, .. } => {
            if command.is_empty() {
                errors.push(invalid("script needs a command"));
            }
        }
        Action::HttpRequest { url, .. } => {
            if url.source().trim().is_empty() {
                errors.push(invalid("http_request needs a url"));
            }
        }
        Action::WaitFor { poll_interval, .. } => {
            if step.timeout.is_none() {
                errors.push(invalid("wait_for requires a timeout"));
            }
            if step.register.is_some() {
                errors.push(invalid("wait_for produces no result and cannot register one"));
            }
            if poll_interval.map_or(false, |p| p.is_zero()) {
                errors.push(invalid("poll_interval must be greater than zero"));
            }
        }
    }

    if let Some(retry) = &step.retry {
        errors.extend(validate_retry(format!("{}.retry", step.name), retry));
    }

    errors
}

/// Validates a pipeline definition.
///
/// All problems are collected and returned together.
pub fn validate_pipeline(pipeline: &PipelineDefinition) -> Result<(), ConfigError> {
    info!(
        "Validating pipeline '{}' with {} steps",
        pipeline.name,
        pipeline.steps.len()
    );

    if pipeline.name.trim().is_empty() {
        return Err(ConfigError::EmptyPipelineName);
    }
    if pipeline.steps.is_empty() {
        return Err(ConfigError::EmptyPipeline(pipeline.name.clone()));
    }

    let mut errors = Vec::new();

    let mut declared: HashSet<&str> = HashSet::new();
    for parameter in &pipeline.parameters {
        if parameter.name.trim().is_empty() {
            errors.push(ConfigError::InvalidValue {
                field: "params".to_string(),
                message: "parameter with an empty name".to_string(),
            });
        } else if !declared.insert(parameter.name.as_str()) {
            errors.push(ConfigError::DuplicateParameter(parameter.name.clone()));
        }
    }

    if pipeline.max_concurrent == Some(0) {
        errors.push(ConfigError::InvalidValue {
            field: "max_concurrent".to_string(),
            message: "must be at least 1".to_string(),
        });
    }

    if let Some(retry) = &pipeline.retry {
        errors.extend(validate_retry("retry".to_string(), retry));
    }

    let mut step_names: HashSet<&str> = HashSet::new();
    // register name -> step that binds it
    let mut bound: HashMap<&str, &str> = HashMap::new();

    for step in &pipeline.steps {
        if step.name.trim().is_empty() {
            errors.push(ConfigError::InvalidValue {
                field: "actions".to_string(),
                message: "step with an empty name".to_string(),
            });
            continue;
        }
        if !step_names.insert(step.name.as_str()) {
            errors.push(ConfigError::DuplicateStep(step.name.clone()));
        }

        errors.extend(validate_step(step));

        // References are checked against what is bound *before* this step.
        for path in step.action.references() {
            if let Some(parameter) = path.parameter() {
                if !declared.contains(parameter) {
                    errors.push(ConfigError::UnknownParameter {
                        step: step.name.clone(),
                        parameter: parameter.to_string(),
                    });
                }
            }
            if let Some(register) = path.register() {
                if !bound.contains_key(register) {
                    errors.push(ConfigError::UnknownRegister {
                        step: step.name.clone(),
                        register: register.to_string(),
                    });
                }
            }
        }

        if let Some(register) = &step.register {
            if let Some(first) = bound.insert(register.as_str(), step.name.as_str()) {
                errors.push(ConfigError::DuplicateRegister {
                    name: register.clone(),
                    first: first.to_string(),
                    second: step.name.clone(),
                });
            }
        }
    }

    if let Some(schedule) = &pipeline.schedule {
        if schedule.every.is_zero() {
            errors.push(ConfigError::InvalidValue {
                field: "schedule.every".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        for parameter in &pipeline.parameters {
            if parameter.default.is_none() && !schedule.params.contains_key(&parameter.name) {
                errors.push(ConfigError::InvalidValue {
                    field: "schedule.params".to_string(),
                    message: format!("missing required parameter '{}'", parameter.name),
                });
            }
        }
    }

    if let Some(error) = ConfigError::from_list(errors) {
        return Err(error);
    }

    debug!(
        "Step order: {:?}",
        pipeline.steps.iter().map(|s| &s.name).collect::<Vec<_>>()
    );
    info!("Pipeline '{}' validated", pipeline.name);
    Ok(())
}

/// Validation errors as a list of messages, for editor feedback.
pub fn quick_validate(pipeline: &PipelineDefinition) -> Vec<String> {
    match validate_pipeline(pipeline) {
        Ok(()) => Vec::new(),
        Err(ConfigError::Multiple(errors)) => errors.iter().map(|e| e.to_string()).collect(),
        Err(error) => vec![error.to_string()],
    }
}
