//! Runner abstraction for one agent attempt.
//!
//! The [`Runner`] trait decouples the executor from the actual agent backend
//! (currently the `claude` CLI in stream-json mode). Tests use scripted
//! runners that return predetermined outcomes without spawning processes.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::cancel::CancelToken;
use crate::core::plan::Task;
use crate::error::CancelledError;
use crate::io::config::AgentConfig;
use crate::io::output::OutputCapture;
use crate::io::process::{LaunchSpec, ProcessLauncher, SystemLauncher, run_streaming};
use crate::io::prompt::{PromptInputs, render_task_prompt};

/// Parameters for a single attempt.
#[derive(Debug, Clone, Copy)]
pub struct AttemptRequest<'a> {
    pub task: &'a Task,
    /// Plan-level orientation text, identical for every attempt.
    pub plan_context: &'a str,
    /// 1-indexed attempt number.
    pub attempt: u32,
    pub max_attempts: u32,
    /// Working directory the agent edits.
    pub workdir: &'a Path,
    /// Sink for everything the agent writes.
    pub output: &'a OutputCapture,
    pub cancel: &'a CancelToken,
}

/// Abstraction over agent execution backends.
///
/// `Ok(())` means the attempt succeeded; any error fails the attempt. An
/// attempt interrupted by cancellation should return [`CancelledError`].
pub trait Runner {
    fn run(&self, request: &AttemptRequest<'_>) -> Result<()>;
}

/// Runner that pipes the task prompt into the agent CLI.
#[derive(Debug, Clone)]
pub struct ClaudeRunner<L = SystemLauncher> {
    agent: AgentConfig,
    timeout: Option<Duration>,
    launcher: L,
}

impl ClaudeRunner<SystemLauncher> {
    pub fn new(agent: AgentConfig, timeout: Option<Duration>) -> Self {
        Self::with_launcher(agent, timeout, SystemLauncher)
    }
}

impl<L: ProcessLauncher> ClaudeRunner<L> {
    pub fn with_launcher(agent: AgentConfig, timeout: Option<Duration>, launcher: L) -> Self {
        Self {
            agent,
            timeout,
            launcher,
        }
    }
}

impl<L: ProcessLauncher> Runner for ClaudeRunner<L> {
    #[instrument(skip_all, fields(task_id = %request.task.id, attempt = request.attempt))]
    fn run(&self, request: &AttemptRequest<'_>) -> Result<()> {
        let prompt = render_task_prompt(&PromptInputs {
            task: request.task,
            plan_context: request.plan_context,
            attempt: request.attempt,
            max_attempts: request.max_attempts,
        })?;

        let spec = LaunchSpec {
            program: self.agent.command.clone(),
            args: self.agent.args.clone(),
            workdir: request.workdir.to_path_buf(),
        };
        info!(program = %spec.program, workdir = %spec.workdir.display(), "starting agent");
        let cmd = self.launcher.command(&spec);

        let exit = match run_streaming(
            cmd,
            Some(prompt.into_bytes()),
            request.output,
            request.cancel,
            self.timeout,
        ) {
            Ok(exit) => exit,
            Err(err) => {
                request
                    .output
                    .note(&format!("failed to run agent: {err:#}"))?;
                return Err(err).with_context(|| format!("run agent {}", spec.program));
            }
        };

        if exit.cancelled {
            request.output.note("attempt cancelled")?;
            return Err(CancelledError.into());
        }
        if exit.timed_out {
            let limit = self.timeout.unwrap_or_default();
            request
                .output
                .note(&format!("agent timed out after {limit:?}"))?;
            return Err(anyhow!("agent timed out after {limit:?}"));
        }

        let summary = request.output.summary()?;
        if !exit.status.success() {
            warn!(exit_code = ?exit.status.code(), "agent failed");
            return Err(anyhow!(
                "agent exited with status {}",
                exit.status
                    .code()
                    .map_or_else(|| "signal".to_string(), |code| code.to_string())
            ));
        }
        if summary.session_expired {
            return Err(anyhow!("agent session expired"));
        }
        if let Some(message) = summary.error {
            return Err(anyhow!("agent reported an error: {message}"));
        }

        debug!(
            cost_usd = summary.cost_usd,
            input_tokens = summary.usage.input_tokens,
            output_tokens = summary.usage.output_tokens,
            "agent finished"
        );
        Ok(())
    }
}
