//! Run Scope
//!
//! The run-local mapping of values visible to templates: the run's input
//! parameters (`params.*`) and the outputs of completed steps that declared
//! a `register` name (`actions.*`).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What a completed step exposes through `actions.<register>.result` and
/// `actions.<register>.status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutput {
    pub result: Value,
    pub status: Value,
}

impl StepOutput {
    pub fn new(result: Value, status: Value) -> Self {
        Self { result, status }
    }

    /// Output of control-flow steps that produce nothing.
    pub fn empty() -> Self {
        Self::new(Value::Null, Value::Null)
    }
}

/// Values visible to a run's templates.
///
/// Grows monotonically: bindings are only ever added, and only once the
/// producing step has completed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Scope {
    params: BTreeMap<String, Value>,
    actions: BTreeMap<String, StepOutput>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a scope seeded with the run's input parameters.
    pub fn with_params(params: BTreeMap<String, Value>) -> Self {
        Self {
            params,
            actions: BTreeMap::new(),
        }
    }

    pub fn param(&self, name: &str) -> Option<&Value> {
        self.params.get(name)
    }

    pub fn action(&self, register: &str) -> Option<&StepOutput> {
        self.actions.get(register)
    }

    pub fn params(&self) -> &BTreeMap<String, Value> {
        &self.params
    }

    pub fn actions(&self) -> &BTreeMap<String, StepOutput> {
        &self.actions
    }

    /// Names bound under `actions.*`, in sorted order.
    pub fn registers(&self) -> impl Iterator<Item = &str> {
        self.actions.keys().map(String::as_str)
    }

    /// Binds a completed step's output under its register name.
    pub(crate) fn bind(&mut self, register: impl Into<String>, output: StepOutput) {
        self.actions.insert(register.into(), output);
    }
}
