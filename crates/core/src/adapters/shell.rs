use crate::error::StepError;
use crate::registry::{RollbackOutcome, StepAdapter, StepContext, StepOutput};
use crate::workflow::StepSpec;
use std::process::Stdio;
use tokio::process::Command;

/// Exit code conventionally meaning "temporary failure, try again" (EX_TEMPFAIL)
const DEFAULT_TRANSIENT_EXIT_CODE: i32 = 75;

/// Characters of output kept in summaries and error messages
const OUTPUT_TAIL: usize = 512;

/// Runs the step's `command` parameter through `sh -c`.
///
/// Parameters:
/// - `command` (required): script to run
/// - `workdir`: working directory
/// - `env`: table of extra environment variables
/// - `transientExitCodes`: exit codes to report as transient (default `[75]`)
/// - `rollback`: script that reverses the step
///
/// The global context is exported as `RUNWAY_<KEY>` and each resolved secret as
/// `SECRET_<NAME>`. Output and errors are masked before they leave the adapter.
#[derive(Debug, Clone)]
pub struct ShellAdapter {
    shell: String,
}

impl ShellAdapter {
    pub fn new() -> Self {
        Self {
            shell: "sh".to_string(),
        }
    }

    pub fn with_shell(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }

    fn command(&self, script: &str, step: &StepSpec, ctx: &StepContext) -> Command {
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(workdir) = step.param_str("workdir") {
            cmd.current_dir(workdir);
        }

        cmd.env("RUNWAY_PLAN_ID", ctx.plan_id.as_str())
            .env("RUNWAY_RUN_ID", ctx.run_id.to_string())
            .env("RUNWAY_STEP_ID", step.id.as_str())
            .env("RUNWAY_ATTEMPT", ctx.attempt.to_string())
            .env("RUNWAY_IDEMPOTENCY_KEY", &step.idempotency_key);

        for (key, value) in ctx.context.entries() {
            cmd.env(format!("RUNWAY_{}", env_name(&key)), value);
        }

        if let Some(env) = step.parameters.get("env").and_then(|v| v.as_object()) {
            for (key, value) in env {
                match value {
                    serde_json::Value::String(s) => cmd.env(key, s),
                    other => cmd.env(key, other.to_string()),
                };
            }
        }

        for (name, value) in ctx.secrets.iter() {
            cmd.env(format!("SECRET_{}", env_name(name)), value.expose());
        }

        cmd
    }

    fn transient_exit_codes(step: &StepSpec) -> Vec<i32> {
        match step
            .parameters
            .get("transientExitCodes")
            .and_then(|v| v.as_array())
        {
            Some(codes) => codes
                .iter()
                .filter_map(|c| c.as_i64())
                .filter_map(|c| i32::try_from(c).ok())
                .collect(),
            None => vec![DEFAULT_TRANSIENT_EXIT_CODE],
        }
    }

    async fn run(
        &self,
        script: &str,
        step: &StepSpec,
        ctx: &StepContext,
    ) -> Result<String, StepError> {
        let output = self
            .command(script, step, ctx)
            .output()
            .await
            .map_err(|e| StepError::permanent(format!("failed to spawn {}: {}", self.shell, e)))?;

        let stdout = ctx.secrets.redact(&String::from_utf8_lossy(&output.stdout));
        if output.status.success() {
            return Ok(tail(&stdout));
        }

        let stderr = ctx.secrets.redact(&String::from_utf8_lossy(&output.stderr));
        let detail = if stderr.trim().is_empty() {
            tail(&stdout)
        } else {
            tail(&stderr)
        };

        match output.status.code() {
            Some(code) if Self::transient_exit_codes(step).contains(&code) => Err(
                StepError::transient(format!("command exited with {}: {}", code, detail)),
            ),
            Some(code) => Err(StepError::permanent(format!(
                "command exited with {}: {}",
                code, detail
            ))),
            None => Err(StepError::transient(format!(
                "command terminated by signal: {}",
                detail
            ))),
        }
    }
}

impl Default for ShellAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl StepAdapter for ShellAdapter {
    async fn execute(&self, step: &StepSpec, ctx: &StepContext) -> Result<StepOutput, StepError> {
        let script = step
            .param_str("command")
            .ok_or_else(|| StepError::permanent("missing 'command' parameter"))?;

        tracing::debug!("Running shell step {} (attempt {})", step.id, ctx.attempt);
        let stdout = self.run(script, step, ctx).await?;

        Ok(StepOutput {
            summary: (!stdout.is_empty()).then_some(stdout),
        })
    }

    async fn rollback(
        &self,
        step: &StepSpec,
        ctx: &StepContext,
    ) -> Result<RollbackOutcome, StepError> {
        let Some(script) = step.param_str("rollback") else {
            return Ok(RollbackOutcome::Unsupported);
        };

        tracing::debug!("Rolling back shell step {}", step.id);
        self.run(script, step, ctx).await?;
        Ok(RollbackOutcome::Reverted)
    }
}

fn env_name(key: &str) -> String {
    key.chars()
        .map(|c| match c {
            'a'..='z' => c.to_ascii_uppercase(),
            'A'..='Z' | '0'..='9' => c,
            _ => '_',
        })
        .collect()
}

/// Last line-aligned chunk of `text`, trimmed
fn tail(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= OUTPUT_TAIL {
        return trimmed.to_string();
    }
    let skip = trimmed.chars().count() - OUTPUT_TAIL;
    let cut: String = trimmed.chars().skip(skip).collect();
    match cut.find('\n') {
        Some(newline) => cut[newline + 1..].to_string(),
        None => cut,
    }
}
