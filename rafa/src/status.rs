//! Read-only plan status report.

use std::fmt;
use std::path::Path;

use anyhow::Result;

use crate::core::plan::{MAX_ATTEMPTS, Plan, TaskStatus};
use crate::io::lock::PlanLock;
use crate::io::paths::PlanPaths;
use crate::io::plan_store::load_plan;

/// Snapshot of a plan and whether a run currently holds it.
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub plan: Plan,
    /// PID of the live lock holder.
    pub running_pid: Option<u32>,
}

impl StatusReport {
    pub fn completed(&self) -> usize {
        self.plan.tasks.iter().filter(|task| task.is_completed()).count()
    }
}

/// Load the plan and check its lock without taking it.
pub fn plan_status(plan_dir: &Path) -> Result<StatusReport> {
    let paths = PlanPaths::new(plan_dir);
    let plan = load_plan(plan_dir)?;
    let running_pid = PlanLock::new(&paths.lock_path).live_holder()?;
    Ok(StatusReport { plan, running_pid })
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Plan: {} ({})", self.plan.name, self.plan.id)?;
        match self.running_pid {
            Some(pid) => writeln!(
                f,
                "Status: {} (running, PID {pid})",
                self.plan.status.as_str()
            )?,
            None => writeln!(f, "Status: {}", self.plan.status.as_str())?,
        }
        writeln!(
            f,
            "Tasks: {}/{} completed",
            self.completed(),
            self.plan.tasks.len()
        )?;
        for task in &self.plan.tasks {
            let mark = match task.status {
                TaskStatus::Pending => " ",
                TaskStatus::InProgress => ">",
                TaskStatus::Completed => "x",
                TaskStatus::Failed => "!",
            };
            write!(f, "  [{mark}] {} {}", task.id, task.title)?;
            if task.attempts > 0 {
                write!(f, " (attempts {}/{MAX_ATTEMPTS})", task.attempts)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
