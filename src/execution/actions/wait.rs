//! `wait_for` executor.

use std::time::Duration;

use log::{debug, info};
use tokio::time::{sleep_until, Instant};

use super::StepContext;
use crate::error::StepError;
use crate::pipeline::Condition;
use crate::scope::{Scope, StepOutput};

/// Cap on a wait's deadline when its timeout does not fit in an `Instant`.
const MAX_WAIT: Duration = Duration::from_secs(100 * 365 * 86_400);

/// Polls `condition` until it holds, the step's timeout passes, or the run
/// is cancelled.
///
/// The condition is checked once more at the deadline before giving up.
pub(crate) async fn wait_for(
    condition: &Condition,
    poll_interval: Option<Duration>,
    scope: &Scope,
    ctx: &StepContext<'_>,
) -> Result<StepOutput, StepError> {
    let interval = poll_interval.unwrap_or(ctx.poll_interval);
    let started = Instant::now();
    let deadline = started
        .checked_add(ctx.timeout)
        .unwrap_or_else(|| started + MAX_WAIT);
    let calling_allowed = |zone: &serde_json::Value| ctx.integrations.calling_allowed(zone);
    let mut polls: u64 = 0;

    loop {
        if ctx.cancel.is_cancelled() {
            return Err(StepError::Cancelled);
        }

        polls += 1;
        let holds = condition.evaluate(scope, &calling_allowed)?;
        if polls == 1 && !holds {
            info!(
                "[{}] {}: waiting up to {:?} for condition",
                ctx.run_id, ctx.step, ctx.timeout
            );
        }
        if holds {
            if polls > 1 {
                info!(
                    "[{}] {}: condition held after {:?} ({} polls)",
                    ctx.run_id,
                    ctx.step,
                    started.elapsed(),
                    polls
                );
            }
            return Ok(StepOutput::empty());
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(StepError::TimedOut(ctx.timeout));
        }

        debug!(
            "[{}] {}: condition not met, polling again in {:?}",
            ctx.run_id, ctx.step, interval
        );
        let next = now.checked_add(interval).unwrap_or(deadline).min(deadline);
        tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(StepError::Cancelled),
            _ = sleep_until(next) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compliance::{ComplianceWindow, ShiftedClock};
    use crate::error::{ExecutorError, ResolutionError};
    use crate::execution::actions::Integrations;
    use crate::run::RunId;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn moscow_scope() -> Scope {
        let mut params = BTreeMap::new();
        params.insert("timezone".to_string(), json!("Europe/Moscow"));
        Scope::with_params(params)
    }

    fn integrations_at(utc_hour: u32, utc_minute: u32) -> Integrations {
        // A Tuesday.
        let start = Utc
            .with_ymd_and_hms(2024, 3, 12, utc_hour, utc_minute, 0)
            .unwrap();
        Integrations::new(ComplianceWindow::default())
            .with_clock(Arc::new(ShiftedClock::starting_at(start)))
    }

    async fn wait(
        condition: &str,
        integrations: &Integrations,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> Result<StepOutput, StepError> {
        let ctx = StepContext {
            run_id: RunId::new(),
            step: "compliance_check",
            cancel,
            integrations,
            timeout,
            poll_interval: Duration::from_secs(60),
        };
        wait_for(
            &Condition::parse(condition).unwrap(),
            None,
            &moscow_scope(),
            &ctx,
        )
        .await
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_window_returns_immediately() {
        let integrations = integrations_at(9, 0);
        let started = Instant::now();
        let output = wait(
            "{{ calling_allowed(params.timezone) }}",
            &integrations,
            &CancellationToken::new(),
            Duration::from_secs(3600),
        )
        .await
        .unwrap();
        assert_eq!(output, StepOutput::empty());
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_until_window_opens() {
        // 07:50 in Moscow; the window opens at 08:00.
        let integrations = integrations_at(4, 50);
        let started = Instant::now();
        wait(
            "calling_allowed(params.timezone)",
            &integrations,
            &CancellationToken::new(),
            Duration::from_secs(3600),
        )
        .await
        .unwrap();
        assert!(started.elapsed() >= Duration::from_secs(600));
        assert!(started.elapsed() < Duration::from_secs(660));
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_when_condition_never_holds() {
        // 23:00 in Moscow; nothing opens within the hour.
        let integrations = integrations_at(20, 0);
        let started = Instant::now();
        let err = wait(
            "calling_allowed(params.timezone)",
            &integrations,
            &CancellationToken::new(),
            Duration::from_secs(3600),
        )
        .await
        .unwrap_err();
        assert_eq!(err, StepError::TimedOut(Duration::from_secs(3600)));
        assert_eq!(started.elapsed(), Duration::from_secs(3600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_polling() {
        let integrations = integrations_at(20, 0);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(90)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let err = wait(
            "calling_allowed(params.timezone)",
            &integrations,
            &cancel,
            Duration::from_secs(3600),
        )
        .await
        .unwrap_err();
        assert_eq!(err, StepError::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(120));
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_timeout_still_waits() {
        let integrations = integrations_at(4, 50);
        let started = Instant::now();
        wait(
            "calling_allowed(params.timezone)",
            &integrations,
            &CancellationToken::new(),
            Duration::from_secs(u64::MAX),
        )
        .await
        .unwrap();
        assert!(started.elapsed() >= Duration::from_secs(600));
        assert!(started.elapsed() < Duration::from_secs(660));
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_zone_is_an_executor_error() {
        let integrations = integrations_at(9, 0);
        let cancel = CancellationToken::new();
        let ctx = StepContext {
            run_id: RunId::new(),
            step: "compliance_check",
            cancel: &cancel,
            integrations: &integrations,
            timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(5),
        };
        let mut params = BTreeMap::new();
        params.insert("timezone".to_string(), json!("UTC+1é1"));

        let err = wait_for(
            &Condition::parse("calling_allowed(params.timezone)").unwrap(),
            None,
            &Scope::with_params(params),
            &ctx,
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            StepError::Executor(ExecutorError::InvalidParameter(ref message)) if message.contains("UTC+1é1")
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresolvable_condition_fails_fast() {
        let integrations = integrations_at(9, 0);
        let err = wait(
            "actions.compliance.result == 'ok'",
            &integrations,
            &CancellationToken::new(),
            Duration::from_secs(60),
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            StepError::Resolution(ResolutionError::UnavailableAction { .. })
        ));
    }
}
