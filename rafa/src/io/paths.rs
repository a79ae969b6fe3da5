//! Canonical on-disk layout under `.rafa/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::error::PlanNotFoundError;

pub const RAFA_DIR: &str = ".rafa";
pub const PLANS_DIR: &str = "plans";
pub const PLAN_FILE: &str = "plan.json";
pub const PROGRESS_FILE: &str = "progress.log";
pub const OUTPUT_FILE: &str = "output.log";
pub const LOCK_FILE: &str = "run.lock";
pub const CONFIG_FILE: &str = "config.toml";

/// All files belonging to one plan directory.
#[derive(Debug, Clone)]
pub struct PlanPaths {
    pub dir: PathBuf,
    pub plan_path: PathBuf,
    pub progress_path: PathBuf,
    pub output_path: PathBuf,
    pub lock_path: PathBuf,
}

impl PlanPaths {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            plan_path: dir.join(PLAN_FILE),
            progress_path: dir.join(PROGRESS_FILE),
            output_path: dir.join(OUTPUT_FILE),
            lock_path: dir.join(LOCK_FILE),
            dir,
        }
    }
}

/// `<root>/.rafa/plans`.
pub fn plans_dir(root: &Path) -> PathBuf {
    root.join(RAFA_DIR).join(PLANS_DIR)
}

/// `<root>/.rafa/config.toml`.
pub fn config_path(root: &Path) -> PathBuf {
    root.join(RAFA_DIR).join(CONFIG_FILE)
}

/// Directory name for a plan: `<id>-<name>`.
pub fn plan_dir_name(id: &str, name: &str) -> String {
    format!("{id}-{name}")
}

/// Resolve a plan directory by id, name, or full `<id>-<name>` directory name.
///
/// With no selector the only plan is returned; several plans make the
/// selector mandatory.
pub fn find_plan_dir(root: &Path, selector: Option<&str>) -> Result<PathBuf> {
    let base = plans_dir(root);
    let mut dirs = Vec::new();
    if base.is_dir() {
        for entry in
            fs::read_dir(&base).with_context(|| format!("read plans dir {}", base.display()))?
        {
            let entry = entry.with_context(|| format!("read entry in {}", base.display()))?;
            if entry.path().join(PLAN_FILE).is_file() {
                dirs.push(entry.path());
            }
        }
    }
    dirs.sort();

    let Some(selector) = selector else {
        return match dirs.len() {
            1 => Ok(dirs.remove(0)),
            0 => Err(PlanNotFoundError::none(&base).into()),
            _ => Err(PlanNotFoundError::ambiguous(&base, dirs.len()).into()),
        };
    };

    dirs.into_iter()
        .find(|dir| dir_matches(dir, selector))
        .ok_or_else(|| PlanNotFoundError::named(&base, selector).into())
}

fn dir_matches(dir: &Path, selector: &str) -> bool {
    let Some(name) = dir.file_name().and_then(|name| name.to_str()) else {
        return false;
    };
    if name == selector {
        return true;
    }
    match name.split_once('-') {
        Some((id, plan_name)) => id == selector || plan_name == selector,
        None => false,
    }
}
