//! Append-only milestone log (`progress.log`, JSON Lines).
//!
//! The file is opened and closed on every write so a killed process leaves at
//! worst a truncated final line behind.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// Milestone kinds recorded in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressKind {
    PlanStarted,
    PlanCompleted,
    PlanCancelled,
    PlanFailed,
    TaskStarted,
    TaskCompleted,
    TaskFailed,
}

/// One line of `progress.log`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub timestamp: String,
    pub event: ProgressKind,
    #[serde(default)]
    pub data: Map<String, Value>,
}

/// Writer for a plan's progress log.
#[derive(Debug, Clone)]
pub struct ProgressLog {
    path: PathBuf,
}

impl ProgressLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn plan_started(&self, plan_id: &str, plan_name: &str, total_tasks: usize) -> Result<()> {
        self.log(
            ProgressKind::PlanStarted,
            json!({ "plan_id": plan_id, "plan_name": plan_name, "total_tasks": total_tasks }),
        )
    }

    pub fn plan_completed(&self, total_tasks: usize, elapsed: Duration) -> Result<()> {
        self.log(
            ProgressKind::PlanCompleted,
            json!({ "total_tasks": total_tasks, "duration_ms": millis(elapsed) }),
        )
    }

    pub fn plan_cancelled(&self, task_id: &str) -> Result<()> {
        self.log(ProgressKind::PlanCancelled, json!({ "task_id": task_id }))
    }

    pub fn plan_failed(&self, task_id: &str, attempts: u32) -> Result<()> {
        self.log(
            ProgressKind::PlanFailed,
            json!({ "task_id": task_id, "attempts": attempts }),
        )
    }

    pub fn task_started(&self, task_id: &str, attempt: u32) -> Result<()> {
        self.log(
            ProgressKind::TaskStarted,
            json!({ "task_id": task_id, "attempt": attempt }),
        )
    }

    pub fn task_completed(&self, task_id: &str, attempt: u32, elapsed: Duration) -> Result<()> {
        self.log(
            ProgressKind::TaskCompleted,
            json!({ "task_id": task_id, "attempt": attempt, "duration_ms": millis(elapsed) }),
        )
    }

    pub fn task_failed(&self, task_id: &str, attempt: u32, error: &str) -> Result<()> {
        self.log(
            ProgressKind::TaskFailed,
            json!({ "task_id": task_id, "attempt": attempt, "error": error }),
        )
    }

    fn log(&self, kind: ProgressKind, data: Value) -> Result<()> {
        let data = match data {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        let event = ProgressEvent {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            event: kind,
            data,
        };
        let mut line = serde_json::to_string(&event).context("serialize progress event")?;
        line.push('\n');

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create progress dir {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open progress log {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("append progress log {}", self.path.display()))
    }
}

/// Read all well-formed events; a torn final line is skipped.
pub fn read_events(path: &Path) -> Result<Vec<ProgressEvent>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read progress log {}", path.display()))?;
    Ok(contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect())
}

fn millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_one_line_per_event() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = ProgressLog::new(temp.path().join("progress.log"));

        log.plan_started("p1", "demo", 2).expect("plan started");
        log.task_started("t01", 1).expect("task started");
        log.task_failed("t01", 1, "agent exited with status 1")
            .expect("task failed");

        let raw = fs::read_to_string(log.path()).expect("read");
        assert_eq!(raw.lines().count(), 3);

        let events = read_events(log.path()).expect("events");
        let kinds: Vec<ProgressKind> = events.iter().map(|event| event.event).collect();
        assert_eq!(
            kinds,
            vec![
                ProgressKind::PlanStarted,
                ProgressKind::TaskStarted,
                ProgressKind::TaskFailed
            ]
        );
        assert_eq!(events[1].data["attempt"], 1);
        assert_eq!(events[2].data["error"], "agent exited with status 1");
    }

    #[test]
    fn line_shape_is_event_and_data() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = ProgressLog::new(temp.path().join("progress.log"));
        log.plan_completed(3, Duration::from_millis(1500))
            .expect("plan completed");

        let raw = fs::read_to_string(log.path()).expect("read");
        let value: Value = serde_json::from_str(raw.trim()).expect("json");
        assert_eq!(value["event"], "plan_completed");
        assert_eq!(value["data"]["duration_ms"], 1500);
        assert!(
            chrono::DateTime::parse_from_rfc3339(value["timestamp"].as_str().expect("ts")).is_ok()
        );
    }

    #[test]
    fn torn_final_line_is_ignored() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = ProgressLog::new(temp.path().join("progress.log"));
        log.plan_cancelled("t01").expect("cancelled");
        let mut file = OpenOptions::new()
            .append(true)
            .open(log.path())
            .expect("open");
        file.write_all(b"{\"timestamp\":\"2025").expect("write");

        let events = read_events(log.path()).expect("events");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, ProgressKind::PlanCancelled);
    }

    #[test]
    fn missing_log_reads_empty() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(
            read_events(&temp.path().join("progress.log"))
                .expect("events")
                .is_empty()
        );
    }
}
