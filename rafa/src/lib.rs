//! Resumable task execution engine for coding-agent plans.
//!
//! A plan is an ordered list of tasks stored under `.rafa/plans/<id>-<name>/`.
//! The [`executor`] hands each pending task to an agent, retries failures up
//! to a fixed budget, commits every completed task, and persists state after
//! each transition so an interrupted run resumes where it stopped.
//!
//! - **[`core`]**: Pure plan model, task selection, and stream-json parsing.
//! - **[`io`]**: Plan store, progress and output logs, lock, git, and the
//!   agent process.

pub mod cancel;
pub mod core;
pub mod error;
pub mod executor;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod status;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
