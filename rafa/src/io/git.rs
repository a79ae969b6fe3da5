//! Git adapter for the executor.
//!
//! The executor needs exactly two things from version control: a workspace
//! status and "commit everything". [`Workspace`] is that seam; [`Git`] backs
//! it with `git` subprocess calls.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

/// Snapshot of uncommitted changes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkspaceStatus {
    pub entries: Vec<StatusEntry>,
}

impl WorkspaceStatus {
    pub fn is_clean(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn files(&self) -> Vec<String> {
        self.entries.iter().map(|entry| entry.path.clone()).collect()
    }

    /// Drop entries for which `ignore` returns true.
    pub fn without(self, ignore: impl Fn(&StatusEntry) -> bool) -> Self {
        Self {
            entries: self
                .entries
                .into_iter()
                .filter(|entry| !ignore(entry))
                .collect(),
        }
    }
}

/// Version-control operations the executor depends on.
pub trait Workspace {
    /// Uncommitted changes, untracked files included.
    fn status(&self) -> Result<WorkspaceStatus>;

    /// Stage and commit every change. Returns `Ok(false)` when there was
    /// nothing to commit.
    fn commit_all(&self, message: &str) -> Result<bool>;
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
    /// Path kept out of every commit, relative to `workdir`.
    exclude: Option<PathBuf>,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            exclude: None,
        }
    }

    /// Never stage `path`. Absolute paths under the workdir are made relative.
    pub fn excluding(mut self, path: &Path) -> Self {
        let relative = path.strip_prefix(&self.workdir).unwrap_or(path);
        self.exclude = Some(relative.to_path_buf());
        self
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    /// Stage all changes (respects .gitignore) except the excluded path.
    pub fn add_all(&self) -> Result<()> {
        match &self.exclude {
            Some(path) => {
                let exclude = format!(":(exclude,literal){}", path.display());
                self.run_checked(&["add", "-A", "--", ":/", &exclude])?;
            }
            None => {
                self.run_checked(&["add", "-A", "--", ":/"])?;
            }
        }
        Ok(())
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run(&["diff", "--cached", "--name-only"])?;
        Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
    }

    /// Commit staged changes with a message.
    ///
    /// If there are no staged changes, this returns Ok(false) and does nothing.
    #[instrument(skip_all)]
    pub fn commit_staged(&self, message: &str) -> Result<bool> {
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        debug!("committing staged changes");
        self.run_checked(&["commit", "-m", message])?;
        Ok(true)
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

impl Workspace for Git {
    #[instrument(skip_all)]
    fn status(&self) -> Result<WorkspaceStatus> {
        let entries = self.status_porcelain()?;
        if !entries.is_empty() {
            debug!(changed = entries.len(), "worktree has changes");
        }
        Ok(WorkspaceStatus { entries })
    }

    #[instrument(skip_all)]
    fn commit_all(&self, message: &str) -> Result<bool> {
        self.add_all()?;
        let committed = self.commit_staged(message)?;
        if !committed {
            warn!("nothing to commit");
        }
        Ok(committed)
    }
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: unquote(path.trim()),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry {
        code,
        path: unquote(&path),
    })
}

/// Porcelain quotes paths with unusual characters.
fn unquote(path: &str) -> String {
    path.strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
        .unwrap_or(path)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestRepo;
    use std::fs;

    #[test]
    fn parses_untracked_line() {
        let e = parse_status_line("?? foo.txt").expect("parse");
        assert_eq!(
            e,
            StatusEntry {
                code: "??".to_string(),
                path: "foo.txt".to_string()
            }
        );
    }

    #[test]
    fn parses_modified_line() {
        let e = parse_status_line(" M src/main.rs").expect("parse");
        assert_eq!(
            e,
            StatusEntry {
                code: " M".to_string(),
                path: "src/main.rs".to_string()
            }
        );
    }

    #[test]
    fn parses_rename_line_uses_new_path() {
        let e = parse_status_line("R  old.txt -> new.txt").expect("parse");
        assert_eq!(e.path, "new.txt");
    }

    #[test]
    fn strips_porcelain_quotes() {
        let e = parse_status_line("?? \"with space.txt\"").expect("parse");
        assert_eq!(e.path, "with space.txt");
    }

    #[test]
    fn status_filter_drops_matching_entries() {
        let status = WorkspaceStatus {
            entries: vec![
                parse_status_line("?? .rafa/plans/p-x/run.lock").expect("parse"),
                parse_status_line(" M src/lib.rs").expect("parse"),
            ],
        };
        let filtered = status.without(|entry| entry.path.ends_with("run.lock"));
        assert_eq!(filtered.files(), vec!["src/lib.rs".to_string()]);
        assert!(!filtered.is_clean());
    }

    #[test]
    fn commit_all_skips_only_the_excluded_path() {
        let repo = TestRepo::new().expect("repo");
        let lock = repo.root().join(".rafa/plans/p-x/run.lock");
        fs::create_dir_all(lock.parent().expect("lock parent")).expect("mkdir plan");
        fs::write(&lock, "1\n").expect("write lock");
        fs::create_dir_all(repo.root().join("services/db")).expect("mkdir services");
        fs::write(repo.root().join("services/db/run.lock"), "db\n").expect("write db lock");

        let git = Git::new(repo.root()).excluding(&lock);
        assert!(git.commit_all("work").expect("commit"));

        let status = git.status().expect("status");
        assert_eq!(status.files(), vec![".rafa/plans/p-x/run.lock".to_string()]);
        let committed = repo
            .git(&["show", "--name-only", "--format=", "HEAD"])
            .expect("show");
        assert!(committed.lines().any(|line| line == "services/db/run.lock"), "{committed}");
    }

    #[test]
    fn commit_all_without_changes_is_a_no_op() {
        let repo = TestRepo::new().expect("repo");
        let git = Git::new(repo.root());
        assert!(!git.commit_all("nothing").expect("commit"));
    }
}
