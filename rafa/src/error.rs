//! Classified failures callers branch on.
//!
//! Everything else travels as plain `anyhow::Error` with context. These types
//! are wrapped in `anyhow::Error` too and recovered with `downcast_ref`.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// The plan lock could not be taken.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    #[error("plan is already running (PID {pid})")]
    Held { pid: u32 },
    #[error("another process acquired the lock {} while reclaiming a stale one", path.display())]
    Raced { path: PathBuf },
}

/// Uncommitted changes block the run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "workspace has uncommitted changes:\n{}\ncommit or stash them first, or pass --allow-dirty",
    format_files(files)
)]
pub struct DirtyWorkspaceError {
    pub files: Vec<String>,
}

/// A commit left changes behind (e.g. a hook rewrote files).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "workspace not clean after committing task {task_id}:\n{}",
    format_files(files)
)]
pub struct PostCommitDirtyError {
    pub task_id: String,
    pub files: Vec<String>,
}

/// A task spent its whole attempt budget.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("task {task_id} ({title}) failed after {attempts} attempts")]
pub struct TaskExhaustedError {
    pub task_id: String,
    pub title: String,
    pub attempts: u32,
}

/// An attempt was interrupted by cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("attempt cancelled")]
pub struct CancelledError;

/// No plan directory matched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct PlanNotFoundError {
    pub message: String,
}

impl PlanNotFoundError {
    pub fn none(base: &Path) -> Self {
        Self {
            message: format!("no plans found in {}", base.display()),
        }
    }

    pub fn ambiguous(base: &Path, count: usize) -> Self {
        Self {
            message: format!(
                "{count} plans found in {}; name one explicitly",
                base.display()
            ),
        }
    }

    pub fn named(base: &Path, selector: &str) -> Self {
        Self {
            message: format!("plan '{selector}' not found in {}", base.display()),
        }
    }
}

fn format_files(files: &[String]) -> String {
    files
        .iter()
        .map(|file| format!("  {file}"))
        .collect::<Vec<_>>()
        .join("\n")
}
