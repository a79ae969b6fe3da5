//! Test-only helpers: plan fixtures, a scripted runner, an in-memory
//! workspace, and a scratch git repository.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow, bail};
use tempfile::TempDir;

use crate::core::plan::{Plan, PlanStatus, Task, TaskStatus};
use crate::error::CancelledError;
use crate::io::agent::{AttemptRequest, Runner};
use crate::io::git::{Git, StatusEntry, Workspace, WorkspaceStatus};
use crate::io::paths::{plan_dir_name, plans_dir};
use crate::io::plan_store::save_plan;

/// Deterministic task with explicit status and attempt count.
pub fn task_with(id: &str, status: TaskStatus, attempts: u32) -> Task {
    Task {
        description: format!("{id} description"),
        acceptance_criteria: vec![format!("{id} is done")],
        status,
        attempts,
        ..Task::new(id, format!("{id} title"))
    }
}

/// Not-started plan holding `tasks`.
pub fn plan_with_tasks(tasks: Vec<Task>) -> Plan {
    Plan {
        id: "p-test".to_string(),
        name: "test-plan".to_string(),
        description: "Plan used by tests".to_string(),
        source_file: "docs/design.md".to_string(),
        created_at: "2026-01-01T00:00:00Z".to_string(),
        status: PlanStatus::NotStarted,
        tasks,
    }
}

/// Plan with `count` pending tasks named `t01`, `t02`, ...
pub fn pending_plan(count: usize) -> Plan {
    plan_with_tasks(
        (1..=count)
            .map(|n| task_with(&format!("t{n:02}"), TaskStatus::Pending, 0))
            .collect(),
    )
}

/// How a scripted attempt ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedOutcome {
    Succeed,
    Fail(String),
    /// Trip the cancel token, then fail with [`CancelledError`].
    Cancel,
}

/// One queued attempt for [`ScriptedRunner`].
#[derive(Debug, Clone)]
pub struct ScriptedAttempt {
    pub outcome: ScriptedOutcome,
    /// Files written relative to the request workdir before finishing.
    pub files: Vec<(String, String)>,
    /// Lines fed to the output capture as if the agent printed them.
    pub output: Vec<String>,
}

impl ScriptedAttempt {
    pub fn succeed() -> Self {
        Self::with_outcome(ScriptedOutcome::Succeed)
    }

    pub fn fail(message: &str) -> Self {
        Self::with_outcome(ScriptedOutcome::Fail(message.to_string()))
    }

    pub fn cancel() -> Self {
        Self::with_outcome(ScriptedOutcome::Cancel)
    }

    pub fn writing(mut self, path: &str, contents: &str) -> Self {
        self.files.push((path.to_string(), contents.to_string()));
        self
    }

    pub fn printing(mut self, line: &str) -> Self {
        self.output.push(line.to_string());
        self
    }

    fn with_outcome(outcome: ScriptedOutcome) -> Self {
        Self {
            outcome,
            files: Vec::new(),
            output: Vec::new(),
        }
    }
}

/// Runner that replays a queue of scripted attempts.
///
/// Clones share the queue and call log, so a test can keep a handle after
/// moving the runner into an executor.
#[derive(Debug, Clone, Default)]
pub struct ScriptedRunner {
    queue: Arc<Mutex<VecDeque<ScriptedAttempt>>>,
    calls: Arc<Mutex<Vec<(String, u32)>>>,
}

impl ScriptedRunner {
    pub fn new(attempts: Vec<ScriptedAttempt>) -> Self {
        Self {
            queue: Arc::new(Mutex::new(attempts.into())),
            calls: Arc::default(),
        }
    }

    /// `(task_id, attempt)` for every call so far.
    pub fn calls(&self) -> Vec<(String, u32)> {
        self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
    }

    pub fn remaining(&self) -> usize {
        self.queue.lock().map(|queue| queue.len()).unwrap_or_default()
    }
}

impl Runner for ScriptedRunner {
    fn run(&self, request: &AttemptRequest<'_>) -> Result<()> {
        self.calls
            .lock()
            .map_err(|_| anyhow!("calls lock poisoned"))?
            .push((request.task.id.clone(), request.attempt));
        let step = self
            .queue
            .lock()
            .map_err(|_| anyhow!("queue lock poisoned"))?
            .pop_front()
            .context("no scripted attempt left")?;

        for (path, contents) in &step.files {
            let target = request.workdir.join(path);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&target, contents)?;
        }
        for line in &step.output {
            request.output.write_line(line)?;
        }

        match step.outcome {
            ScriptedOutcome::Succeed => Ok(()),
            ScriptedOutcome::Fail(message) => bail!(message),
            ScriptedOutcome::Cancel => {
                request.cancel.cancel();
                Err(CancelledError.into())
            }
        }
    }
}

#[derive(Debug, Default)]
struct FakeState {
    dirty: Vec<StatusEntry>,
    left_after_commit: Vec<StatusEntry>,
    commits: Vec<String>,
}

/// In-memory [`Workspace`] recording commit messages.
#[derive(Debug, Clone, Default)]
pub struct FakeWorkspace {
    state: Arc<Mutex<FakeState>>,
}

impl FakeWorkspace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `files` as modified until the next commit.
    pub fn dirty(self, files: &[&str]) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.dirty = entries(files);
        }
        self
    }

    /// Report `files` as modified even after every commit.
    pub fn stuck_after_commit(self, files: &[&str]) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.left_after_commit = entries(files);
        }
        self
    }

    pub fn commits(&self) -> Vec<String> {
        self.state
            .lock()
            .map(|state| state.commits.clone())
            .unwrap_or_default()
    }
}

impl Workspace for FakeWorkspace {
    fn status(&self) -> Result<WorkspaceStatus> {
        let state = self.state.lock().map_err(|_| anyhow!("state poisoned"))?;
        Ok(WorkspaceStatus {
            entries: state.dirty.clone(),
        })
    }

    fn commit_all(&self, message: &str) -> Result<bool> {
        let mut state = self.state.lock().map_err(|_| anyhow!("state poisoned"))?;
        state.commits.push(message.to_string());
        state.dirty = state.left_after_commit.clone();
        Ok(true)
    }
}

fn entries(files: &[&str]) -> Vec<StatusEntry> {
    files
        .iter()
        .map(|path| StatusEntry {
            code: " M".to_string(),
            path: (*path).to_string(),
        })
        .collect()
}

/// Throwaway git repository with one initial commit.
#[derive(Debug)]
pub struct TestRepo {
    dir: TempDir,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create temp repo")?;
        let repo = Self { dir };
        repo.git(&["init", "-q"])?;
        repo.git(&["config", "user.email", "test@example.com"])?;
        repo.git(&["config", "user.name", "test"])?;
        repo.git(&["config", "commit.gpgsign", "false"])?;
        fs::write(repo.root().join("README.md"), "hi\n").context("write README")?;
        repo.git(&["add", "README.md"])?;
        repo.git(&["commit", "-q", "-m", "init"])?;
        Ok(repo)
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Write `plan` under `.rafa/plans/` and commit it. Returns the plan dir.
    pub fn add_plan(&self, plan: &Plan) -> Result<PathBuf> {
        let plan_dir = plans_dir(self.root()).join(plan_dir_name(&plan.id, &plan.name));
        save_plan(&plan_dir, plan)?;
        Git::new(self.root()).commit_all("add plan")?;
        Ok(plan_dir)
    }

    /// Commit subjects, newest first.
    pub fn log_subjects(&self) -> Result<Vec<String>> {
        let out = self.git(&["log", "--format=%s"])?;
        Ok(out.lines().map(str::to_string).collect())
    }

    /// Run git in the repo and return stdout.
    pub fn git(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(self.root())
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))?;
        if !output.status.success() {
            bail!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
