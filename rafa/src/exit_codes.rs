//! Stable exit codes for rafa CLI commands.

use crate::error::{
    DirtyWorkspaceError, LockError, PlanNotFoundError, PostCommitDirtyError, TaskExhaustedError,
};

/// Command succeeded, or the plan was already complete.
pub const OK: i32 = 0;
/// Unclassified failure (I/O, config, agent spawn, ...).
pub const ERROR: i32 = 1;
/// A task spent its attempt budget; the plan is marked failed.
pub const TASK_FAILED: i32 = 2;
/// The run was cancelled; the interrupted task is pending again.
pub const CANCELLED: i32 = 3;
/// Another live process holds the plan lock.
pub const LOCKED: i32 = 4;
/// The workspace was dirty before the run or after a task commit.
pub const DIRTY: i32 = 5;
/// No plan matched the selector.
pub const NOT_FOUND: i32 = 6;

/// Exit code for a failed command.
pub fn for_error(err: &anyhow::Error) -> i32 {
    if err.downcast_ref::<TaskExhaustedError>().is_some() {
        TASK_FAILED
    } else if err.downcast_ref::<LockError>().is_some() {
        LOCKED
    } else if err.downcast_ref::<DirtyWorkspaceError>().is_some()
        || err.downcast_ref::<PostCommitDirtyError>().is_some()
    {
        DIRTY
    } else if err.downcast_ref::<PlanNotFoundError>().is_some() {
        NOT_FOUND
    } else {
        ERROR
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn classified_errors_map_through_context() {
        let err = Err::<(), _>(LockError::Held { pid: 7 })
            .context("run plan")
            .expect_err("error");
        assert_eq!(for_error(&err), LOCKED);

        let err = anyhow::Error::from(TaskExhaustedError {
            task_id: "t01".to_string(),
            title: "x".to_string(),
            attempts: 5,
        });
        assert_eq!(for_error(&err), TASK_FAILED);
    }

    #[test]
    fn unclassified_errors_are_generic() {
        assert_eq!(for_error(&anyhow::anyhow!("disk full")), ERROR);
    }
}
