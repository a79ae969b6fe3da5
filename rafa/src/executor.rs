//! Retry/resume state machine that drives a plan to completion.
//!
//! One [`Executor::run`] call holds the plan lock for its whole duration,
//! runs the pending suffix of the plan strictly in order, and persists
//! `plan.json` after every transition so a killed process resumes at the
//! exact task it was on.

use std::path::{Path, PathBuf};
use std::sync::mpsc::SyncSender;
use std::time::Instant;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::cancel::CancelToken;
use crate::core::plan::{MAX_ATTEMPTS, Plan, PlanStatus, TaskStatus};
use crate::core::selector::reset_exhausted_for_rerun;
use crate::error::{CancelledError, DirtyWorkspaceError, PostCommitDirtyError, TaskExhaustedError};
use crate::io::agent::{AttemptRequest, Runner};
use crate::io::git::{Git, StatusEntry, Workspace, WorkspaceStatus};
use crate::io::lock::PlanLock;
use crate::io::output::{OutputCapture, OutputEvent, extract_commit_message};
use crate::io::paths::{LOCK_FILE, PlanPaths};
use crate::io::plan_store::{all_tasks_completed, first_pending_task, save_plan};
use crate::io::progress::ProgressLog;

/// How a run ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Nothing to do: every task was already completed.
    AlreadyComplete,
    /// Every remaining task completed during this run.
    Completed,
    /// Stopped cooperatively; the interrupted task is back to pending.
    Cancelled,
}

enum TaskOutcome {
    Completed,
    Cancelled,
}

/// Runs a plan's tasks through a [`Runner`] with bounded retries.
pub struct Executor<R, W = Git> {
    paths: PlanPaths,
    plan: Plan,
    runner: R,
    workspace: W,
    workdir: PathBuf,
    allow_dirty: bool,
    events: Option<SyncSender<OutputEvent>>,
}

impl<R: Runner> Executor<R, Git> {
    /// Executor over `plan_dir` working in the current directory.
    pub fn new(plan_dir: impl Into<PathBuf>, plan: Plan, runner: R) -> Self {
        let paths = PlanPaths::new(plan_dir);
        let workdir = PathBuf::from(".");
        Self {
            workspace: Git::new(&workdir).excluding(&paths.lock_path),
            paths,
            plan,
            runner,
            workdir,
            allow_dirty: false,
            events: None,
        }
    }

    /// Run the agent and git in `workdir`.
    pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = workdir.into();
        self.workspace = Git::new(&self.workdir).excluding(&self.paths.lock_path);
        self
    }
}

impl<R: Runner, W: Workspace> Executor<R, W> {
    /// Substitute the version-control backend.
    pub fn with_workspace<V: Workspace>(self, workspace: V) -> Executor<R, V> {
        Executor {
            paths: self.paths,
            plan: self.plan,
            runner: self.runner,
            workspace,
            workdir: self.workdir,
            allow_dirty: self.allow_dirty,
            events: self.events,
        }
    }

    /// Skip the clean-workspace precondition and every commit.
    pub fn allow_dirty(mut self, allow: bool) -> Self {
        self.allow_dirty = allow;
        self
    }

    /// Feed live output events to an observer.
    pub fn with_events(mut self, events: SyncSender<OutputEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Run every pending task. Cancellation is not an error.
    #[instrument(skip_all, fields(plan_id = %self.plan.id))]
    pub fn run(&mut self, cancel: &CancelToken) -> Result<RunOutcome> {
        let started = Instant::now();
        let _lock = PlanLock::new(&self.paths.lock_path).lock()?;

        if !self.allow_dirty {
            let status = self.status_without_lock()?;
            if !status.is_clean() {
                return Err(DirtyWorkspaceError {
                    files: status.files(),
                }
                .into());
            }
        }

        if all_tasks_completed(&self.plan) {
            info!("all tasks already completed");
            if self.plan.status != PlanStatus::Completed {
                // Interrupted between the last task commit and the final save.
                self.plan.status = PlanStatus::Completed;
                self.save()?;
            }
            return Ok(RunOutcome::AlreadyComplete);
        }

        let Some(start) = first_pending_task(&mut self.plan) else {
            return Ok(RunOutcome::AlreadyComplete);
        };
        if reset_exhausted_for_rerun(&mut self.plan, start) {
            info!(task_id = %self.plan.tasks[start].id, "re-running exhausted task with a fresh budget");
        }

        let progress = ProgressLog::new(&self.paths.progress_path);
        if self.plan.status != PlanStatus::InProgress {
            self.plan.status = PlanStatus::InProgress;
        }
        self.save()?;
        progress.plan_started(&self.plan.id, &self.plan.name, self.plan.tasks.len())?;

        let capture = OutputCapture::open(&self.paths.output_path, self.events.clone())?;
        let plan_context = self.plan.context();

        for index in start..self.plan.tasks.len() {
            match self.run_task(index, &plan_context, &capture, &progress, cancel)? {
                TaskOutcome::Completed => {}
                TaskOutcome::Cancelled => return Ok(RunOutcome::Cancelled),
            }
        }

        self.plan.status = PlanStatus::Completed;
        self.save()?;
        progress.plan_completed(self.plan.tasks.len(), started.elapsed())?;
        info!(elapsed_ms = started.elapsed().as_millis() as u64, "plan completed");

        if !self.allow_dirty {
            let message = format!("[rafa] Complete plan: {}", self.plan.name);
            match self.workspace.commit_all(&message) {
                Ok(committed) => debug!(committed, "final metadata commit"),
                Err(err) => warn!(err = %format!("{err:#}"), "final metadata commit failed"),
            }
        }
        Ok(RunOutcome::Completed)
    }

    fn run_task(
        &mut self,
        index: usize,
        plan_context: &str,
        capture: &OutputCapture,
        progress: &ProgressLog,
        cancel: &CancelToken,
    ) -> Result<TaskOutcome> {
        let task_id = self.plan.tasks[index].id.clone();

        while self.plan.tasks[index].attempts < MAX_ATTEMPTS {
            if cancel.is_cancelled() {
                return self.cancel_task(index, progress);
            }

            let attempt = {
                let task = &mut self.plan.tasks[index];
                task.attempts += 1;
                task.status = TaskStatus::InProgress;
                task.attempts
            };
            self.save()?;
            progress.task_started(&task_id, attempt)?;
            info!(task_id = %task_id, attempt, max_attempts = MAX_ATTEMPTS, "starting attempt");

            capture.begin_attempt(&task_id, attempt)?;
            let attempt_started = Instant::now();
            let result = self.runner.run(&AttemptRequest {
                task: &self.plan.tasks[index],
                plan_context,
                attempt,
                max_attempts: MAX_ATTEMPTS,
                workdir: &self.workdir,
                output: capture,
                cancel,
            });
            capture.end_attempt(result.is_ok())?;

            match result {
                Ok(()) => {
                    self.plan.tasks[index].status = TaskStatus::Completed;
                    self.save()?;
                    progress.task_completed(&task_id, attempt, attempt_started.elapsed())?;
                    info!(task_id = %task_id, attempt, "task completed");
                    if !self.allow_dirty {
                        self.commit_task(index)?;
                    }
                    return Ok(TaskOutcome::Completed);
                }
                Err(err)
                    if cancel.is_cancelled() || err.downcast_ref::<CancelledError>().is_some() =>
                {
                    return self.cancel_task(index, progress);
                }
                Err(err) => {
                    let message = format!("{err:#}");
                    warn!(task_id = %task_id, attempt, err = %message, "attempt failed");
                    progress.task_failed(&task_id, attempt, &message)?;
                }
            }
        }

        let attempts = self.plan.tasks[index].attempts;
        self.plan.tasks[index].status = TaskStatus::Failed;
        self.plan.status = PlanStatus::Failed;
        self.save()?;
        if let Err(err) = progress.plan_failed(&task_id, attempts) {
            warn!(err = %format!("{err:#}"), "failed to log plan failure");
        }
        Err(TaskExhaustedError {
            task_id,
            title: self.plan.tasks[index].title.clone(),
            attempts,
        }
        .into())
    }

    fn cancel_task(&mut self, index: usize, progress: &ProgressLog) -> Result<TaskOutcome> {
        let task_id = self.plan.tasks[index].id.clone();
        info!(task_id = %task_id, "cancelled; returning task to pending");
        self.plan.tasks[index].status = TaskStatus::Pending;
        self.save()?;
        if let Err(err) = progress.plan_cancelled(&task_id) {
            warn!(err = %format!("{err:#}"), "failed to log cancellation");
        }
        Ok(TaskOutcome::Cancelled)
    }

    /// Commit the task's changes and prove the tree is clean afterwards.
    fn commit_task(&self, index: usize) -> Result<()> {
        let task = &self.plan.tasks[index];
        let suggested = extract_commit_message(&self.paths.output_path)?;
        let message = if suggested.is_empty() {
            format!("[rafa] Complete task {}: {}", task.id, task.title)
        } else {
            suggested
        };
        debug!(task_id = %task.id, message = %message, "committing task");
        self.workspace
            .commit_all(&message)
            .with_context(|| format!("commit task {}", task.id))?;

        let status = self.status_without_lock()?;
        if !status.is_clean() {
            return Err(PostCommitDirtyError {
                task_id: task.id.clone(),
                files: status.files(),
            }
            .into());
        }
        Ok(())
    }

    fn status_without_lock(&self) -> Result<WorkspaceStatus> {
        let lock_suffix = match self.paths.dir.file_name() {
            Some(name) => Path::new(name).join(LOCK_FILE),
            None => PathBuf::from(LOCK_FILE),
        };
        Ok(self
            .workspace
            .status()?
            .without(|entry: &StatusEntry| Path::new(&entry.path).ends_with(&lock_suffix)))
    }

    fn save(&self) -> Result<()> {
        save_plan(&self.paths.dir, &self.plan)
    }
}
