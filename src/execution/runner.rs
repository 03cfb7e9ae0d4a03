//! Run Engine
//!
//! Walks a pipeline's steps in order for one run. Each step gets an attempt
//! loop with bounded exponential backoff; a completed step's output is bound
//! into the scope before the next step starts, and the registry is told
//! about every finished step.

use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::actions::{Integrations, StepContext};
use super::retry::RetryPolicy;
use super::step::execute_step;
use crate::error::StepError;
use crate::monitoring::RunRegistry;
use crate::pipeline::{PipelineDefinition, StepDefinition};
use crate::run::{FailureReason, HistoryEntry, RunId, RunStatus, StepOutcome};
use crate::scope::{Scope, StepOutput};

/// Engine-wide defaults a runner falls back to.
#[derive(Debug, Clone)]
pub struct RunDefaults {
    pub step_timeout: Duration,
    pub poll_interval: Duration,
    pub retry: RetryPolicy,
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub reason: Option<FailureReason>,
}

impl RunOutcome {
    fn succeeded() -> Self {
        Self {
            status: RunStatus::Succeeded,
            reason: None,
        }
    }

    fn ended(status: RunStatus, reason: FailureReason) -> Self {
        Self {
            status,
            reason: Some(reason),
        }
    }
}

/// Executes one run of a pipeline.
pub struct Runner {
    pub(crate) run_id: RunId,
    pub(crate) pipeline: Arc<PipelineDefinition>,
    pub(crate) registry: Arc<RunRegistry>,
    pub(crate) integrations: Integrations,
    pub(crate) defaults: RunDefaults,
    pub(crate) cancel: CancellationToken,
}

impl Runner {
    /// Runs every step starting from `scope` and returns the terminal
    /// outcome. Never panics on step failure; failures become the outcome's
    /// reason.
    pub async fn run(&self, mut scope: Scope) -> RunOutcome {
        info!(
            "[{}] Running pipeline '{}' ({} steps)",
            self.run_id,
            self.pipeline.name,
            self.pipeline.len()
        );

        for (index, step) in self.pipeline.steps.iter().enumerate() {
            if self.cancel.is_cancelled() {
                info!("[{}] Cancelled before step '{}'", self.run_id, step.name);
                return RunOutcome::ended(
                    RunStatus::Cancelled,
                    FailureReason::cancelled(None, format!("cancelled before step '{}'", step.name)),
                );
            }

            self.registry.step_started(self.run_id, index);
            if let Err(outcome) = self.run_step(step, &mut scope).await {
                return outcome;
            }
        }

        RunOutcome::succeeded()
    }

    fn policy_for<'a>(&'a self, step: &'a StepDefinition) -> &'a RetryPolicy {
        step.retry
            .as_ref()
            .or(self.pipeline.retry.as_ref())
            .unwrap_or(&self.defaults.retry)
    }

    async fn run_step(&self, step: &StepDefinition, scope: &mut Scope) -> Result<(), RunOutcome> {
        let policy = self.policy_for(step);
        let ctx = StepContext {
            run_id: self.run_id,
            step: &step.name,
            cancel: &self.cancel,
            integrations: &self.integrations,
            timeout: step.timeout.unwrap_or(self.defaults.step_timeout),
            poll_interval: self.defaults.poll_interval,
        };

        info!("[{}] Starting step: {} ({})", self.run_id, step.name, step.kind());
        let started_at = self.integrations.clock().now();
        let started = Instant::now();
        let (result, attempts) = self.attempt(step, scope, &ctx, policy).await;
        let duration = started.elapsed();

        let entry = |outcome, error: Option<&StepError>| HistoryEntry {
            step: step.name.clone(),
            kind: step.kind(),
            outcome,
            attempts,
            started_at,
            duration,
            error: error.map(|e| e.to_string()),
        };

        match result {
            Ok(output) => {
                info!(
                    "[{}] Step '{}' completed in {:?}",
                    self.run_id, step.name, duration
                );
                let binding = step.register.as_ref().map(|register| {
                    scope.bind(register.clone(), output.clone());
                    (register.clone(), output)
                });
                self.registry
                    .record_step(self.run_id, entry(StepOutcome::Succeeded, None), binding);
                Ok(())
            }
            Err(StepError::Cancelled) => {
                info!("[{}] Step '{}' interrupted", self.run_id, step.name);
                Err(RunOutcome::ended(
                    RunStatus::Cancelled,
                    FailureReason::cancelled(Some(&step.name), "cancelled while running"),
                ))
            }
            Err(err) => {
                let (outcome, status) = match err {
                    StepError::TimedOut(_) => (StepOutcome::TimedOut, RunStatus::TimedOut),
                    _ => (StepOutcome::Failed, RunStatus::Failed),
                };
                error!(
                    "[{}] Step '{}' {} after {} attempt(s): {}",
                    self.run_id,
                    step.name,
                    status,
                    attempts,
                    err
                );
                self.registry
                    .record_step(self.run_id, entry(outcome, Some(&err)), None);
                Err(RunOutcome::ended(
                    status,
                    FailureReason::from_step_error(&step.name, &err),
                ))
            }
        }
    }

    /// Runs attempts until one succeeds, the error is not retryable, the
    /// policy is exhausted, or the run is cancelled during backoff.
    async fn attempt(
        &self,
        step: &StepDefinition,
        scope: &Scope,
        ctx: &StepContext<'_>,
        policy: &RetryPolicy,
    ) -> (Result<StepOutput, StepError>, u32) {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match execute_step(step, scope, ctx).await {
                Ok(output) => return (Ok(output), attempt),
                Err(err) => err,
            };
            if !err.is_retryable() || !policy.allows_retry_after(attempt) {
                return (Err(err), attempt);
            }

            let delay = policy.backoff(attempt);
            warn!(
                "[{}] Step '{}' attempt {}/{} failed: {}. Retrying in {:?}",
                self.run_id, step.name, attempt, policy.max_attempts, err, delay
            );
            tokio::select! {
                _ = self.cancel.cancelled() => return (Err(StepError::Cancelled), attempt),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compliance::ComplianceWindow;
    use crate::error::{ErrorKind, ExecutorError};
    use crate::execution::actions::db::fakes::FakeDatastore;
    use crate::pipeline::{Action, Condition, Template};
    use crate::run::{RunSnapshot, Trigger};
    use chrono::Utc;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn query(name: &str, sql: &str) -> StepDefinition {
        StepDefinition::new(
            name,
            Action::DbQuery {
                connection: "main".into(),
                query: Template::parse(sql).unwrap(),
            },
        )
    }

    struct Harness {
        registry: Arc<RunRegistry>,
        store: Arc<FakeDatastore>,
        run_id: RunId,
    }

    impl Harness {
        fn runner(&self, pipeline: PipelineDefinition, cancel: CancellationToken) -> Runner {
            let integrations = Integrations::new(ComplianceWindow::default())
                .with_datastore("main", self.store.clone());
            Runner {
                run_id: self.run_id,
                pipeline: Arc::new(pipeline),
                registry: self.registry.clone(),
                integrations,
                defaults: RunDefaults {
                    step_timeout: Duration::from_secs(5),
                    poll_interval: Duration::from_secs(1),
                    retry: RetryPolicy::none(),
                },
                cancel,
            }
        }
    }

    fn harness(pipeline: &str) -> Harness {
        let registry = Arc::new(RunRegistry::new(10));
        let run_id = RunId::new();
        registry.register_queued(RunSnapshot::queued(
            run_id,
            pipeline,
            Trigger::manual(),
            BTreeMap::new(),
            Utc::now(),
        ));
        registry.mark_running(run_id, Utc::now());
        Harness {
            registry,
            store: Arc::new(FakeDatastore::new()),
            run_id,
        }
    }

    fn scope() -> Scope {
        let mut params = BTreeMap::new();
        params.insert("full_name".to_string(), json!("Ivan"));
        Scope::with_params(params)
    }

    #[tokio::test]
    async fn test_scope_grows_in_step_order() {
        let h = harness("p");
        let pipeline = PipelineDefinition::new("p")
            .with_step(
                query("insert", "INSERT INTO debtors (name) VALUES ('{{ params.full_name }}')")
                    .with_register("db_result"),
            )
            .with_step(query(
                "update",
                "UPDATE debtors SET status = 'x' WHERE id = {{ actions.db_result.id }}",
            ));

        let outcome = h.runner(pipeline, CancellationToken::new()).run(scope()).await;
        assert_eq!(outcome, RunOutcome::succeeded());
        assert_eq!(
            h.store.statements()[1],
            "UPDATE debtors SET status = 'x' WHERE id = 1"
        );

        let snapshot = h.registry.get(h.run_id).unwrap();
        assert_eq!(snapshot.history.len(), 2);
        assert_eq!(snapshot.scope.action("db_result").unwrap().result["id"], json!(1));
    }

    #[tokio::test]
    async fn test_resolution_error_fails_without_retry() {
        let h = harness("p");
        let pipeline = PipelineDefinition::new("p")
            .with_retry(RetryPolicy::with_attempts(3))
            .with_step(query("bad", "SELECT {{ params.missing }}"));

        let outcome = h.runner(pipeline, CancellationToken::new()).run(scope()).await;
        assert_eq!(outcome.status, RunStatus::Failed);
        let reason = outcome.reason.unwrap();
        assert_eq!(reason.kind, ErrorKind::Resolution);
        assert_eq!(reason.step.as_deref(), Some("bad"));

        let snapshot = h.registry.get(h.run_id).unwrap();
        assert_eq!(snapshot.history[0].attempts, 1);
        assert_eq!(snapshot.history[0].outcome, StepOutcome::Failed);
        assert!(h.store.statements().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_executor_errors_are_retried_with_backoff() {
        let h = harness("p");
        h.store.respond(Err(ExecutorError::Query("deadlock".into())));
        h.store.respond(Err(ExecutorError::Query("deadlock".into())));
        let pipeline = PipelineDefinition::new("p").with_step(
            query("flaky", "SELECT 1").with_retry(RetryPolicy::with_attempts(3)),
        );

        let started = Instant::now();
        let outcome = h.runner(pipeline, CancellationToken::new()).run(scope()).await;
        assert_eq!(outcome.status, RunStatus::Succeeded);
        // 1s then 2s of backoff.
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert!(started.elapsed() < Duration::from_secs(4));
        assert_eq!(h.registry.get(h.run_id).unwrap().history[0].attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_fail_the_run() {
        let h = harness("p");
        for _ in 0..2 {
            h.store.respond(Err(ExecutorError::Query("down".into())));
        }
        let pipeline = PipelineDefinition::new("p")
            .with_retry(RetryPolicy::with_attempts(2))
            .with_step(query("first", "SELECT 1"))
            .with_step(query("never", "SELECT 2"));

        let outcome = h.runner(pipeline, CancellationToken::new()).run(scope()).await;
        assert_eq!(outcome.status, RunStatus::Failed);
        assert_eq!(outcome.reason.unwrap().kind, ErrorKind::Executor);
        assert_eq!(h.store.statements().len(), 2);
        assert_eq!(h.registry.get(h.run_id).unwrap().history.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_timeout_ends_run_timed_out() {
        let h = harness("p");
        let pipeline = PipelineDefinition::new("p").with_step(
            StepDefinition::new(
                "gate",
                Action::WaitFor {
                    condition: Condition::parse("false").unwrap(),
                    poll_interval: None,
                },
            )
            .with_timeout(Duration::from_secs(10)),
        );

        let outcome = h.runner(pipeline, CancellationToken::new()).run(scope()).await;
        assert_eq!(outcome.status, RunStatus::TimedOut);
        let snapshot = h.registry.get(h.run_id).unwrap();
        assert_eq!(snapshot.history[0].outcome, StepOutcome::TimedOut);
    }

    #[tokio::test]
    async fn test_cancelled_run_appends_no_history() {
        let h = harness("p");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let pipeline = PipelineDefinition::new("p").with_step(query("first", "SELECT 1"));

        let outcome = h.runner(pipeline, cancel).run(scope()).await;
        assert_eq!(outcome.status, RunStatus::Cancelled);
        assert!(h.registry.get(h.run_id).unwrap().history.is_empty());
        assert!(h.store.statements().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let h = harness("p");
        h.store.respond(Err(ExecutorError::Query("down".into())));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            trigger.cancel();
        });
        let pipeline = PipelineDefinition::new("p")
            .with_step(query("flaky", "SELECT 1").with_retry(RetryPolicy::with_attempts(5)));

        let outcome = h.runner(pipeline, cancel).run(scope()).await;
        assert_eq!(outcome.status, RunStatus::Cancelled);
        assert_eq!(outcome.reason.unwrap().step.as_deref(), Some("flaky"));
        assert_eq!(h.store.statements().len(), 1);
        assert!(h.registry.get(h.run_id).unwrap().history.is_empty());
    }
}
