//! `script` executor.
//!
//! Every argv element is rendered on its own and handed to the process
//! directly. No shell is involved, so a resolved value is always exactly one
//! argument.

use std::process::Stdio;

use log::{debug, error, warn};
use serde_json::Value;
use tokio::process::Command;

use super::{truncate_detail, StepContext};
use crate::error::{ExecutorError, StepError};
use crate::pipeline::{Coercion, Template};
use crate::scope::{Scope, StepOutput};

/// Environment variable carrying the run id into scripts.
pub const RUN_ID_ENV: &str = "CALLFLOW_RUN_ID";
/// Environment variable carrying the step name into scripts.
pub const STEP_ENV: &str = "CALLFLOW_STEP";

pub(crate) async fn run_script(
    command: &[Template],
    allow_failure: bool,
    scope: &Scope,
    ctx: &StepContext<'_>,
) -> Result<StepOutput, StepError> {
    let argv = command
        .iter()
        .map(|arg| arg.render(scope, Coercion::Text))
        .collect::<Result<Vec<_>, _>>()?;
    let (program, args) = argv.split_first().ok_or_else(|| {
        ExecutorError::InvalidParameter("script command is empty".to_string())
    })?;

    debug!(
        "[{}] {}: spawning '{}' with {} argument(s)",
        ctx.run_id,
        ctx.step,
        program,
        args.len()
    );

    // Dropping the future (timeout or cancellation) kills the child.
    let output = Command::new(program)
        .args(args)
        .env(RUN_ID_ENV, ctx.run_id.to_string())
        .env(STEP_ENV, ctx.step)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| ExecutorError::Spawn {
            program: program.clone(),
            message: e.to_string(),
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    let code = output.status.code();

    if !output.status.success() {
        if allow_failure {
            warn!(
                "[{}] {}: '{}' exited with {:?}, failure allowed",
                ctx.run_id, ctx.step, program, code
            );
        } else {
            error!(
                "[{}] {}: '{}' failed with exit code {:?}",
                ctx.run_id, ctx.step, program, code
            );
            if !stderr.trim().is_empty() {
                error!("stderr:\n{}", stderr);
            }
            return Err(ExecutorError::NonZeroExit {
                code,
                stderr: truncate_detail(&stderr, 500),
            }
            .into());
        }
    }

    let trimmed = stdout.trim();
    let result = serde_json::from_str(trimmed).unwrap_or_else(|_| Value::from(trimmed));
    let status = code.map_or(Value::Null, Value::from);
    Ok(StepOutput::new(result, status))
}
