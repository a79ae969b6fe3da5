//! Side-effecting collaborators: plan files, logs, locks, git, the agent process.

pub mod agent;
pub mod config;
pub mod git;
pub mod lock;
pub mod output;
pub mod paths;
pub mod plan_store;
pub mod process;
pub mod progress;
pub mod prompt;
