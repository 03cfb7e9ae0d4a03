//! Single Step Execution
//!
//! Runs one attempt of a step under its deadline and the run's cancellation
//! token. Retries and history live in the runner.

use std::time::Duration;

use log::debug;

use super::actions::{self, StepContext};
use crate::error::{ExecutorError, StepError};
use crate::pipeline::{Action, StepDefinition};
use crate::scope::{Scope, StepOutput};

/// Executes one attempt of `step`.
///
/// Integration calls are bounded by `ctx.timeout`; overrunning it is an
/// [`ExecutorError::DeadlineExceeded`] and may be retried. `wait_for` steps
/// manage their own deadline and end in [`StepError::TimedOut`] instead.
///
/// Cancellation drops the in-flight call: child processes are killed and
/// HTTP connections closed.
pub async fn execute_step(
    step: &StepDefinition,
    scope: &Scope,
    ctx: &StepContext<'_>,
) -> Result<StepOutput, StepError> {
    if let Action::WaitFor { .. } = step.action {
        return actions::execute(&step.action, scope, ctx).await;
    }

    tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => {
            debug!("[{}] {}: interrupted by cancellation", ctx.run_id, ctx.step);
            Err(StepError::Cancelled)
        }
        outcome = bounded(ctx.timeout, actions::execute(&step.action, scope, ctx)) => outcome,
    }
}

async fn bounded<F>(timeout: Duration, call: F) -> Result<StepOutput, StepError>
where
    F: std::future::Future<Output = Result<StepOutput, StepError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(outcome) => outcome,
        Err(_) => Err(ExecutorError::DeadlineExceeded(timeout).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compliance::ComplianceWindow;
    use crate::execution::actions::Integrations;
    use crate::pipeline::{Condition, Template};
    use crate::run::RunId;
    use tokio_util::sync::CancellationToken;

    fn sleeper(seconds: &str) -> StepDefinition {
        StepDefinition::new(
            "slow_script",
            Action::Script {
                command: vec![Template::literal("sleep"), Template::literal(seconds)],
                allow_failure: false,
            },
        )
    }

    fn ctx<'a>(
        integrations: &'a Integrations,
        cancel: &'a CancellationToken,
        timeout: Duration,
    ) -> StepContext<'a> {
        StepContext {
            run_id: RunId::new(),
            step: "slow_script",
            cancel,
            integrations,
            timeout,
            poll_interval: Duration::from_millis(10),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_deadline_is_executor_error() {
        let integrations = Integrations::new(ComplianceWindow::default());
        let cancel = CancellationToken::new();
        let err = execute_step(
            &sleeper("5"),
            &Scope::new(),
            &ctx(&integrations, &cancel, Duration::from_millis(100)),
        )
        .await
        .unwrap_err();
        assert_eq!(
            err,
            StepError::Executor(ExecutorError::DeadlineExceeded(Duration::from_millis(100)))
        );
        assert!(err.is_retryable());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancellation_wins_over_running_call() {
        let integrations = Integrations::new(ComplianceWindow::default());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let err = execute_step(
            &sleeper("5"),
            &Scope::new(),
            &ctx(&integrations, &cancel, Duration::from_secs(30)),
        )
        .await
        .unwrap_err();
        assert_eq!(err, StepError::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_uses_its_own_deadline() {
        let integrations = Integrations::new(ComplianceWindow::default());
        let cancel = CancellationToken::new();
        let step = StepDefinition::new(
            "never",
            Action::WaitFor {
                condition: Condition::parse("false").unwrap(),
                poll_interval: None,
            },
        );
        let err = execute_step(
            &step,
            &Scope::new(),
            &ctx(&integrations, &cancel, Duration::from_secs(1)),
        )
        .await
        .unwrap_err();
        assert_eq!(err, StepError::TimedOut(Duration::from_secs(1)));
    }
}
