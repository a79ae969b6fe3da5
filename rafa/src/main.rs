//! `rafa` command-line entry point.
//!
//! Runs a plan stored under `.rafa/plans/` task by task, or prints its status.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{Receiver, sync_channel};
use std::thread;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use rafa::cancel::CancelToken;
use rafa::core::stream::StreamEvent;
use rafa::executor::{Executor, RunOutcome};
use rafa::exit_codes;
use rafa::io::agent::ClaudeRunner;
use rafa::io::config::{RafaConfig, load_config, write_config};
use rafa::io::output::{OutputEvent, OutputPayload};
use rafa::io::paths::{config_path, find_plan_dir};
use rafa::io::plan_store::load_plan;
use rafa::logging;
use rafa::status::plan_status;

#[derive(Parser)]
#[command(
    name = "rafa",
    version,
    about = "Run coding-agent plans task by task with retries and commits"
)]
struct Cli {
    /// Project root containing `.rafa/`.
    #[arg(short = 'C', long, global = true, default_value = ".")]
    dir: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write `.rafa/config.toml` with defaults if missing.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Execute the pending tasks of a plan.
    Run {
        /// Plan id, name, or `<id>-<name>`; optional when only one plan exists.
        plan: Option<String>,
        /// Skip the clean-workspace check and all commits.
        #[arg(long)]
        allow_dirty: bool,
    },
    /// Show plan and task status.
    Status {
        /// Plan id, name, or `<id>-<name>`; optional when only one plan exists.
        plan: Option<String>,
    },
}

fn main() {
    logging::init();
    let cli = Cli::parse();
    let code = match dispatch(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            exit_codes::for_error(&err)
        }
    };
    std::process::exit(code);
}

fn dispatch(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Init { force } => cmd_init(&cli.dir, force),
        Command::Run { plan, allow_dirty } => cmd_run(&cli.dir, plan.as_deref(), allow_dirty),
        Command::Status { plan } => cmd_status(&cli.dir, plan.as_deref()),
    }
}

fn cmd_init(root: &Path, force: bool) -> Result<i32> {
    let path = config_path(root);
    if path.exists() && !force {
        println!("{} already exists", path.display());
        return Ok(exit_codes::OK);
    }
    write_config(&path, &RafaConfig::default())?;
    println!("wrote {}", path.display());
    Ok(exit_codes::OK)
}

fn cmd_run(root: &Path, selector: Option<&str>, allow_dirty: bool) -> Result<i32> {
    let config = load_config(&config_path(root))?;
    let plan_dir = find_plan_dir(root, selector)?;
    let plan = load_plan(&plan_dir)?;
    let plan_name = plan.name.clone();
    info!(plan_dir = %plan_dir.display(), "running plan");

    let cancel = CancelToken::new();
    watch_ctrl_c(cancel.clone())?;

    let (tx, rx) = sync_channel(config.event_channel_capacity);
    let printer = thread::Builder::new()
        .name("rafa-events".to_string())
        .spawn(move || print_events(rx))
        .context("spawn event printer")?;

    let runner = ClaudeRunner::new(config.agent.clone(), config.attempt_timeout());
    let result = Executor::new(&plan_dir, plan, runner)
        .with_workdir(root)
        .allow_dirty(allow_dirty || config.allow_dirty)
        .with_events(tx)
        .run(&cancel);
    if printer.join().is_err() {
        warn!("event printer panicked");
    }

    match result? {
        RunOutcome::AlreadyComplete => {
            println!("Plan {plan_name} is already complete.");
            Ok(exit_codes::OK)
        }
        RunOutcome::Completed => {
            println!("Plan {plan_name} completed.");
            Ok(exit_codes::OK)
        }
        RunOutcome::Cancelled => {
            eprintln!("Cancelled. Run again to resume.");
            Ok(exit_codes::CANCELLED)
        }
    }
}

fn cmd_status(root: &Path, selector: Option<&str>) -> Result<i32> {
    let plan_dir = find_plan_dir(root, selector)?;
    print!("{}", plan_status(&plan_dir)?);
    Ok(exit_codes::OK)
}

/// First Ctrl-C cancels cooperatively; a second one exits immediately.
fn watch_ctrl_c(cancel: CancelToken) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("build signal runtime")?;
    thread::Builder::new()
        .name("rafa-signals".to_string())
        .spawn(move || {
            runtime.block_on(async move {
                if tokio::signal::ctrl_c().await.is_err() {
                    warn!("ctrl-c handler unavailable");
                    return;
                }
                eprintln!("\nCancelling... press Ctrl-C again to exit immediately.");
                cancel.cancel();
                if tokio::signal::ctrl_c().await.is_ok() {
                    std::process::exit(exit_codes::CANCELLED);
                }
            });
        })
        .context("spawn signal watcher")?;
    Ok(())
}

/// Render live events until the executor drops its sender.
fn print_events(rx: Receiver<OutputEvent>) {
    let stdout = io::stdout();
    for event in rx {
        let mut out = stdout.lock();
        let written = match &event.payload {
            OutputPayload::Stream(StreamEvent::Text { text }) => write!(out, "{text}"),
            OutputPayload::Stream(StreamEvent::ToolUse { name, target, .. }) => writeln!(
                out,
                "\n[{}#{}] {name} {target}",
                event.task_id, event.attempt
            ),
            OutputPayload::Stream(StreamEvent::Error { message, .. }) => {
                writeln!(out, "\n[{}#{}] error: {message}", event.task_id, event.attempt)
            }
            OutputPayload::Stream(StreamEvent::Done { cost_usd, .. }) => writeln!(
                out,
                "\n[{}#{}] done (${cost_usd:.4})",
                event.task_id, event.attempt
            ),
            OutputPayload::Line(line) => writeln!(out, "{line}"),
            OutputPayload::Stream(_) => Ok(()),
        };
        if written.and_then(|()| out.flush()).is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_with_plan_and_flag() {
        let cli = Cli::parse_from(["rafa", "run", "auth", "--allow-dirty"]);
        match cli.command {
            Command::Run { plan, allow_dirty } => {
                assert_eq!(plan.as_deref(), Some("auth"));
                assert!(allow_dirty);
            }
            _ => panic!("expected run"),
        }
        assert_eq!(cli.dir, PathBuf::from("."));
    }

    #[test]
    fn parse_status_without_plan() {
        let cli = Cli::parse_from(["rafa", "-C", "/tmp/project", "status"]);
        assert!(matches!(cli.command, Command::Status { plan: None }));
        assert_eq!(cli.dir, PathBuf::from("/tmp/project"));
    }

    #[test]
    fn parse_init_force() {
        let cli = Cli::parse_from(["rafa", "init", "--force"]);
        assert!(matches!(cli.command, Command::Init { force: true }));
    }

    #[test]
    fn init_writes_default_config_once() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert_eq!(cmd_init(temp.path(), false).expect("init"), exit_codes::OK);
        let cfg = load_config(&config_path(temp.path())).expect("load");
        assert_eq!(cfg, RafaConfig::default());
        assert_eq!(cmd_init(temp.path(), false).expect("init again"), exit_codes::OK);
    }
}
