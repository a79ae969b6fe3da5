//! End-to-end executor runs against a real git repository.
//!
//! The agent is replaced by `ScriptedRunner`; everything else (plan store,
//! lock, logs, git commits) is the production code path.

use std::fs;

use rafa::cancel::CancelToken;
use rafa::core::plan::{MAX_ATTEMPTS, PlanStatus, TaskStatus};
use rafa::error::{DirtyWorkspaceError, TaskExhaustedError};
use rafa::executor::{Executor, RunOutcome};
use rafa::io::paths::PlanPaths;
use rafa::io::plan_store::load_plan;
use rafa::io::progress::{ProgressKind, read_events};
use rafa::status::plan_status;
use rafa::test_support::{ScriptedAttempt, ScriptedRunner, TestRepo, pending_plan};

fn executor(
    repo: &TestRepo,
    plan_dir: &std::path::Path,
    runner: &ScriptedRunner,
) -> Executor<ScriptedRunner> {
    let plan = load_plan(plan_dir).expect("load plan");
    Executor::new(plan_dir, plan, runner.clone()).with_workdir(repo.root())
}

/// Plan lifecycle with one retry:
///
/// 1. t01 attempt 1 fails, attempt 2 writes `src/a.txt` and succeeds.
/// 2. t02 writes `src/b.txt` and suggests its own commit message.
/// 3. Final metadata commit leaves the tree clean.
#[test]
fn completes_plan_with_one_commit_per_task() {
    let repo = TestRepo::new().expect("repo");
    let plan_dir = repo.add_plan(&pending_plan(2)).expect("add plan");
    let runner = ScriptedRunner::new(vec![
        ScriptedAttempt::fail("compile error"),
        ScriptedAttempt::succeed().writing("src/a.txt", "a\n"),
        ScriptedAttempt::succeed()
            .writing("src/b.txt", "b\n")
            .printing("All done.")
            .printing("SUGGESTED_COMMIT_MESSAGE: feat: add b"),
    ]);

    let outcome = executor(&repo, &plan_dir, &runner)
        .run(&CancelToken::new())
        .expect("run");

    assert_eq!(outcome, RunOutcome::Completed);
    assert_eq!(
        repo.log_subjects().expect("log"),
        vec![
            "[rafa] Complete plan: test-plan",
            "feat: add b",
            "[rafa] Complete task t01: t01 title",
            "add plan",
            "init",
        ]
    );
    assert_eq!(repo.git(&["status", "--porcelain"]).expect("status"), "");

    let committed_a = repo
        .git(&["show", "--name-only", "--format=", "HEAD~2"])
        .expect("show");
    assert!(committed_a.lines().any(|line| line == "src/a.txt"), "{committed_a}");

    let plan = load_plan(&plan_dir).expect("load plan");
    assert_eq!(plan.status, PlanStatus::Completed);
    assert_eq!(plan.tasks[0].attempts, 2);

    let events = read_events(&PlanPaths::new(&plan_dir).progress_path).expect("events");
    let started = events
        .iter()
        .filter(|event| event.event == ProgressKind::TaskStarted)
        .count();
    assert_eq!(started, 3);
    assert_eq!(events.last().map(|event| event.event), Some(ProgressKind::PlanCompleted));

    let transcript =
        fs::read_to_string(PlanPaths::new(&plan_dir).output_path).expect("output log");
    assert!(transcript.contains("=== Task t01, Attempt 1 ==="));
    assert!(transcript.contains("=== Task t01: FAILED ==="));
    assert!(transcript.contains("=== Task t02: SUCCESS ==="));
    assert!(!PlanPaths::new(&plan_dir).lock_path.exists());
}

#[test]
fn exhausted_task_leaves_changes_uncommitted() {
    let repo = TestRepo::new().expect("repo");
    let plan_dir = repo.add_plan(&pending_plan(1)).expect("add plan");
    let runner = ScriptedRunner::new(
        (0..MAX_ATTEMPTS)
            .map(|_| ScriptedAttempt::fail("tests failed").writing("wip.txt", "partial\n"))
            .collect(),
    );

    let err = executor(&repo, &plan_dir, &runner)
        .run(&CancelToken::new())
        .expect_err("run should fail");

    assert!(err.downcast_ref::<TaskExhaustedError>().is_some(), "{err:#}");
    assert_eq!(
        repo.log_subjects().expect("log"),
        vec!["add plan".to_string(), "init".to_string()]
    );
    let status = repo.git(&["status", "--porcelain"]).expect("status");
    assert!(status.contains("wip.txt"), "{status}");

    let report = plan_status(&plan_dir).expect("status report");
    assert_eq!(report.plan.status, PlanStatus::Failed);
    assert_eq!(report.plan.tasks[0].status, TaskStatus::Failed);
    assert_eq!(report.running_pid, None);
}

#[test]
fn untracked_file_blocks_run() {
    let repo = TestRepo::new().expect("repo");
    let plan_dir = repo.add_plan(&pending_plan(1)).expect("add plan");
    fs::write(repo.root().join("notes.txt"), "scratch\n").expect("write");
    let runner = ScriptedRunner::new(vec![ScriptedAttempt::succeed()]);

    let err = executor(&repo, &plan_dir, &runner)
        .run(&CancelToken::new())
        .expect_err("run should fail");

    let dirty = err
        .downcast_ref::<DirtyWorkspaceError>()
        .expect("dirty error");
    assert_eq!(dirty.files, vec!["notes.txt".to_string()]);
    assert!(runner.calls().is_empty());
    assert!(!PlanPaths::new(&plan_dir).lock_path.exists());
}

#[test]
fn cancelled_run_resumes_on_next_invocation() {
    let repo = TestRepo::new().expect("repo");
    let plan_dir = repo.add_plan(&pending_plan(2)).expect("add plan");
    let runner = ScriptedRunner::new(vec![
        ScriptedAttempt::cancel(),
        ScriptedAttempt::succeed().writing("one.txt", "1\n"),
        ScriptedAttempt::succeed().writing("two.txt", "2\n"),
    ]);

    let first = executor(&repo, &plan_dir, &runner)
        .run(&CancelToken::new())
        .expect("first run");
    assert_eq!(first, RunOutcome::Cancelled);
    let plan = load_plan(&plan_dir).expect("load plan");
    assert_eq!(plan.tasks[0].status, TaskStatus::Pending);
    assert_eq!(plan.tasks[0].attempts, 1);
    assert!(!PlanPaths::new(&plan_dir).lock_path.exists());

    // Operator commits the interrupted run's metadata before resuming.
    repo.git(&["add", "-A"]).expect("add");
    repo.git(&["commit", "-q", "-m", "checkpoint"]).expect("commit");

    let second = executor(&repo, &plan_dir, &runner)
        .run(&CancelToken::new())
        .expect("second run");
    assert_eq!(second, RunOutcome::Completed);
    assert_eq!(
        runner.calls(),
        vec![
            ("t01".to_string(), 1),
            ("t01".to_string(), 2),
            ("t02".to_string(), 1),
        ]
    );
    assert_eq!(repo.git(&["status", "--porcelain"]).expect("status"), "");
}

#[test]
fn project_file_named_like_the_lock_is_committed() {
    let repo = TestRepo::new().expect("repo");
    let plan_dir = repo.add_plan(&pending_plan(1)).expect("add plan");
    let runner = ScriptedRunner::new(vec![
        ScriptedAttempt::succeed().writing("services/db/run.lock", "pid-file fixture\n"),
    ]);

    let outcome = executor(&repo, &plan_dir, &runner)
        .run(&CancelToken::new())
        .expect("run");

    assert_eq!(outcome, RunOutcome::Completed);
    assert_eq!(repo.git(&["status", "--porcelain"]).expect("status"), "");
    let tracked = repo.git(&["ls-files"]).expect("ls-files");
    assert!(tracked.lines().any(|line| line == "services/db/run.lock"), "{tracked}");
    assert!(!tracked.lines().any(|line| line.ends_with("p-test-test-plan/run.lock")));
}
