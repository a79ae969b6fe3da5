//! Deterministic resume-point selection for a plan.

use crate::core::plan::{Plan, PlanStatus, TaskStatus};

/// Index of the first task that is not completed.
///
/// A task found in the `failed` state is reset to `pending` with its attempt
/// count preserved, so asking for the next task also performs the resume
/// transition. Returns `None` when every task is completed.
pub fn first_pending_task(plan: &mut Plan) -> Option<usize> {
    let index = plan.tasks.iter().position(|task| !task.is_completed())?;
    let task = &mut plan.tasks[index];
    if task.status == TaskStatus::Failed {
        task.status = TaskStatus::Pending;
    }
    Some(index)
}

/// True when every task is completed (vacuously true for an empty plan).
pub fn all_tasks_completed(plan: &Plan) -> bool {
    plan.tasks.iter().all(|task| task.is_completed())
}

/// Re-run reset for a plan whose blocking task exhausted its budget.
///
/// Only a failed plan whose task at `index` has spent every attempt gets its
/// counter cleared; anything else keeps its attempts. Returns true if a reset
/// happened.
pub fn reset_exhausted_for_rerun(plan: &mut Plan, index: usize) -> bool {
    if plan.status != PlanStatus::Failed {
        return false;
    }
    let Some(task) = plan.tasks.get_mut(index) else {
        return false;
    };
    if !task.is_exhausted() {
        return false;
    }
    task.status = TaskStatus::Pending;
    task.attempts = 0;
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::plan::MAX_ATTEMPTS;
    use crate::test_support::{plan_with_tasks, task_with};

    #[test]
    fn skips_completed_prefix() {
        let mut plan = plan_with_tasks(vec![
            task_with("t01", TaskStatus::Completed, 1),
            task_with("t02", TaskStatus::Completed, 2),
            task_with("t03", TaskStatus::Pending, 0),
        ]);
        assert_eq!(first_pending_task(&mut plan), Some(2));
    }

    #[test]
    fn failed_task_resets_to_pending_preserving_attempts() {
        let mut plan = plan_with_tasks(vec![
            task_with("t01", TaskStatus::Completed, 1),
            task_with("t02", TaskStatus::Failed, 3),
        ]);
        assert_eq!(first_pending_task(&mut plan), Some(1));
        assert_eq!(plan.tasks[1].status, TaskStatus::Pending);
        assert_eq!(plan.tasks[1].attempts, 3);
    }

    #[test]
    fn in_progress_task_is_selected_as_is() {
        let mut plan = plan_with_tasks(vec![task_with("t01", TaskStatus::InProgress, 2)]);
        assert_eq!(first_pending_task(&mut plan), Some(0));
        assert_eq!(plan.tasks[0].status, TaskStatus::InProgress);
    }

    #[test]
    fn none_when_all_completed() {
        let mut plan = plan_with_tasks(vec![task_with("t01", TaskStatus::Completed, 1)]);
        assert_eq!(first_pending_task(&mut plan), None);
        assert!(all_tasks_completed(&plan));
    }

    #[test]
    fn empty_plan_is_complete() {
        let plan = plan_with_tasks(Vec::new());
        assert!(all_tasks_completed(&plan));
    }

    #[test]
    fn rerun_reset_requires_failed_plan_and_exhausted_task() {
        let mut plan = plan_with_tasks(vec![task_with("t01", TaskStatus::Failed, MAX_ATTEMPTS)]);
        assert!(!reset_exhausted_for_rerun(&mut plan, 0));
        assert_eq!(plan.tasks[0].attempts, MAX_ATTEMPTS);

        plan.status = PlanStatus::Failed;
        assert!(reset_exhausted_for_rerun(&mut plan, 0));
        assert_eq!(plan.tasks[0].attempts, 0);
        assert_eq!(plan.tasks[0].status, TaskStatus::Pending);
    }

    #[test]
    fn rerun_reset_keeps_partial_attempts() {
        let mut plan = plan_with_tasks(vec![task_with("t01", TaskStatus::Failed, 2)]);
        plan.status = PlanStatus::Failed;
        assert!(!reset_exhausted_for_rerun(&mut plan, 0));
        assert_eq!(plan.tasks[0].attempts, 2);
    }
}
