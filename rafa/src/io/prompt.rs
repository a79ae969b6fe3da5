//! Prompt rendering for a single task attempt.

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;
use tracing::debug;

use crate::core::plan::Task;

const TASK_TEMPLATE: &str = include_str!("prompts/task.md");

/// Task fields exposed to the template.
#[derive(Debug, Clone, Serialize)]
struct TaskContext<'a> {
    id: &'a str,
    title: &'a str,
    description: &'a str,
    acceptance_criteria: &'a [String],
}

/// Everything the agent needs to know for one attempt.
#[derive(Debug, Clone)]
pub struct PromptInputs<'a> {
    pub task: &'a Task,
    pub plan_context: &'a str,
    pub attempt: u32,
    pub max_attempts: u32,
}

/// Render the task prompt.
pub fn render_task_prompt(input: &PromptInputs<'_>) -> Result<String> {
    let mut env = Environment::new();
    env.add_template("task", TASK_TEMPLATE)
        .context("load task prompt template")?;
    let template = env.get_template("task").context("get task template")?;
    let task = TaskContext {
        id: &input.task.id,
        title: &input.task.title,
        description: input.task.description.trim(),
        acceptance_criteria: &input.task.acceptance_criteria,
    };
    let rendered = template
        .render(context! {
            plan_context => input.plan_context,
            task => task,
            attempt => input.attempt,
            max_attempts => input.max_attempts,
        })
        .context("render task prompt")?;
    debug!(task_id = %input.task.id, attempt = input.attempt, bytes = rendered.len(), "rendered prompt");
    Ok(rendered)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> Task {
        let mut task = Task::new("t03", "Add login endpoint");
        task.description = "Expose POST /login.".to_string();
        task.acceptance_criteria = vec!["returns 200".to_string(), "tests pass".to_string()];
        task
    }

    #[test]
    fn first_attempt_has_task_and_criteria() {
        let task = task();
        let prompt = render_task_prompt(&PromptInputs {
            task: &task,
            plan_context: "Plan: auth\n",
            attempt: 1,
            max_attempts: 5,
        })
        .expect("render");

        assert!(prompt.contains("Plan: auth"));
        assert!(prompt.contains("## Task t03: Add login endpoint"));
        assert!(prompt.contains("Attempt 1 of 5."));
        assert!(prompt.contains("Expose POST /login."));
        assert!(prompt.contains("- returns 200\n- tests pass\n"));
        assert!(prompt.contains("SUGGESTED_COMMIT_MESSAGE:"));
        assert!(!prompt.contains("Previous attempts"));
    }

    #[test]
    fn retry_mentions_leftover_changes() {
        let task = task();
        let prompt = render_task_prompt(&PromptInputs {
            task: &task,
            plan_context: "Plan: auth\n",
            attempt: 3,
            max_attempts: 5,
        })
        .expect("render");

        assert!(prompt.contains("## Previous attempts"));
        assert!(prompt.contains("2 previous attempt(s)"));
        assert!(prompt.contains("Uncommitted changes"));
    }
}
