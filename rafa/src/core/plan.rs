//! Plan and task documents persisted as `plan.json`.
//!
//! These types are plain data. Transitions that touch disk live in
//! [`crate::io::plan_store`]; transitions that only reorder in-memory state
//! live in [`crate::core::selector`].

use serde::{Deserialize, Serialize};

/// Maximum number of agent invocations per task before the plan fails.
pub const MAX_ATTEMPTS: u32 = 5;

/// Lifecycle status of a whole plan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    #[default]
    NotStarted,
    InProgress,
    Completed,
    Failed,
}

impl PlanStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PlanStatus::NotStarted => "not_started",
            PlanStatus::InProgress => "in_progress",
            PlanStatus::Completed => "completed",
            PlanStatus::Failed => "failed",
        }
    }
}

/// Lifecycle status of a single task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

/// One unit of agent work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub attempts: u32,
}

impl Task {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            acceptance_criteria: Vec::new(),
            status: TaskStatus::Pending,
            attempts: 0,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == TaskStatus::Completed
    }

    /// True once the attempt budget is spent.
    pub fn is_exhausted(&self) -> bool {
        self.attempts >= MAX_ATTEMPTS
    }
}

/// A named, ordered sequence of tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub source_file: String,
    /// RFC3339 creation timestamp.
    pub created_at: String,
    #[serde(default)]
    pub status: PlanStatus,
    #[serde(default)]
    pub tasks: Vec<Task>,
}

impl Plan {
    /// Orientation text handed to every task invocation.
    pub fn context(&self) -> String {
        let mut buf = String::new();
        buf.push_str(&format!("Plan: {}\n", self.name));
        if !self.description.trim().is_empty() {
            buf.push_str(&format!("Description: {}\n", self.description.trim()));
        }
        if !self.source_file.trim().is_empty() {
            buf.push_str(&format!("Source: {}\n", self.source_file.trim()));
        }
        buf
    }
}
