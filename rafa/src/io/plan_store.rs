//! Plan document storage (`plan.json`).

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;

use crate::core::plan::Plan;
use crate::error::PlanNotFoundError;
use crate::io::paths::PlanPaths;

pub use crate::core::selector::{all_tasks_completed, first_pending_task};

/// Load the plan document from a plan directory.
pub fn load_plan(plan_dir: &Path) -> Result<Plan> {
    let path = PlanPaths::new(plan_dir).plan_path;
    debug!(path = %path.display(), "loading plan");
    if !path.is_file() {
        return Err(PlanNotFoundError {
            message: format!("plan not found: {}", path.display()),
        }
        .into());
    }
    let contents =
        fs::read_to_string(&path).with_context(|| format!("read plan {}", path.display()))?;
    let plan: Plan =
        serde_json::from_str(&contents).with_context(|| format!("parse plan {}", path.display()))?;
    debug!(plan_id = %plan.id, status = plan.status.as_str(), tasks = plan.tasks.len(), "plan loaded");
    Ok(plan)
}

/// Atomically write the plan document (temp file + rename).
pub fn save_plan(plan_dir: &Path, plan: &Plan) -> Result<()> {
    let path = PlanPaths::new(plan_dir).plan_path;
    debug!(path = %path.display(), status = plan.status.as_str(), "saving plan");
    let mut buf = serde_json::to_string_pretty(plan).context("serialize plan")?;
    buf.push('\n');
    write_atomic(&path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("plan path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp plan {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace plan {}", path.display()))?;
    Ok(())
}
