//! Action Executors
//!
//! One executor per step kind. Each resolves its templates against the run
//! scope, talks to its integration, and turns the response into a
//! [`StepOutput`]:
//!
//! - [`db`]: SQL against a named connection pool
//! - [`script`]: a child process spawned without a shell
//! - [`http`]: a JSON request to an opaque service
//! - [`wait`]: polls a condition until it holds or the step times out

pub mod db;
pub mod http;
pub mod script;
pub mod wait;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::compliance::{Clock, ComplianceWindow, ContactZone, SystemClock};
use crate::config::EngineConfig;
use crate::error::{ConfigError, ExecutorError, StepError};
use crate::pipeline::Action;
use crate::run::RunId;
use crate::scope::{Scope, StepOutput};

pub use db::{Datastore, QueryOutput, SqlDatastore};

/// External collaborators the executors talk to.
#[derive(Clone)]
pub struct Integrations {
    datastores: HashMap<String, Arc<dyn Datastore>>,
    http: reqwest::Client,
    clock: Arc<dyn Clock>,
    compliance: ComplianceWindow,
}

impl Integrations {
    /// No datastores, a default HTTP client and the system clock.
    pub fn new(compliance: ComplianceWindow) -> Self {
        Self {
            datastores: HashMap::new(),
            http: reqwest::Client::new(),
            clock: Arc::new(SystemClock),
            compliance,
        }
    }

    /// Builds pools and clients from engine configuration.
    ///
    /// Pools connect lazily, so unreachable databases surface as step
    /// failures rather than startup errors.
    pub fn from_config(config: &EngineConfig) -> Result<Self, ConfigError> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.http_connect_timeout)
            .build()
            .map_err(|e| ConfigError::InvalidValue {
                field: "http_connect_timeout".to_string(),
                message: e.to_string(),
            })?;

        let mut integrations = Self::new(config.compliance).with_http_client(http);
        for (name, connection) in &config.connections {
            let store = SqlDatastore::connect_lazy(name, connection)?;
            integrations = integrations.with_datastore(name.clone(), Arc::new(store));
        }
        Ok(integrations)
    }

    pub fn with_datastore(mut self, name: impl Into<String>, store: Arc<dyn Datastore>) -> Self {
        self.datastores.insert(name.into(), store);
        self
    }

    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = client;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn datastore(&self, name: &str) -> Option<&Arc<dyn Datastore>> {
        self.datastores.get(name)
    }

    pub fn has_datastore(&self, name: &str) -> bool {
        self.datastores.contains_key(name)
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub fn compliance(&self) -> &ComplianceWindow {
        &self.compliance
    }

    /// Answers `calling_allowed(zone)` for the current time.
    pub fn calling_allowed(&self, zone: &Value) -> Result<bool, ExecutorError> {
        let name = zone.as_str().ok_or_else(|| {
            ExecutorError::InvalidParameter(format!("time zone must be a string, got {}", zone))
        })?;
        let zone: ContactZone = name.parse().map_err(ExecutorError::InvalidParameter)?;
        let allowed = self.compliance.allows(&zone, self.clock.now());
        if !allowed {
            debug!("Calling window closed for zone {}", zone);
        }
        Ok(allowed)
    }
}

impl std::fmt::Debug for Integrations {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Integrations")
            .field("datastores", &self.datastores.keys().collect::<Vec<_>>())
            .field("clock", &self.clock)
            .field("compliance", &self.compliance)
            .finish()
    }
}

/// What an executor knows about the step it is running.
#[derive(Debug, Clone, Copy)]
pub struct StepContext<'a> {
    pub run_id: RunId,
    pub step: &'a str,
    pub cancel: &'a CancellationToken,
    pub integrations: &'a Integrations,
    /// The step's effective timeout
    pub timeout: Duration,
    pub poll_interval: Duration,
}

/// Runs one attempt of an action.
pub async fn execute(
    action: &Action,
    scope: &Scope,
    ctx: &StepContext<'_>,
) -> Result<StepOutput, StepError> {
    match action {
        Action::DbQuery { connection, query } => db::run_query(connection, query, scope, ctx).await,
        Action::Script {
            command,
            allow_failure,
        } => script::run_script(command, *allow_failure, scope, ctx).await,
        Action::HttpRequest {
            url,
            method,
            headers,
            body,
        } => http::send_request(url, method, headers, body.as_ref(), scope, ctx).await,
        Action::WaitFor {
            condition,
            poll_interval,
        } => wait::wait_for(condition, *poll_interval, scope, ctx).await,
    }
}

/// Keeps error payloads (stderr, response bodies) readable in logs.
pub(crate) fn truncate_detail(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= max_chars {
        trimmed.to_string()
    } else {
        let head: String = trimmed.chars().take(max_chars).collect();
        format!("{}...", head)
    }
}
