//! Agent process launching with streamed output and cooperative cancellation.

use std::io::{self, Write};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::cancel::CancelToken;
use crate::io::output::OutputCapture;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// What to launch for one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub workdir: PathBuf,
}

/// Builds the OS command for a launch. Injected so tests can substitute the
/// agent binary.
pub trait ProcessLauncher {
    fn command(&self, spec: &LaunchSpec) -> Command;
}

/// Launches `spec.program` as-is.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemLauncher;

impl ProcessLauncher for SystemLauncher {
    fn command(&self, spec: &LaunchSpec) -> Command {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args).current_dir(&spec.workdir);
        cmd
    }
}

/// How a streamed process ended.
#[derive(Debug)]
pub struct StreamedExit {
    pub status: ExitStatus,
    pub timed_out: bool,
    pub cancelled: bool,
}

/// Run a command, feeding stdout and stderr line by line into `capture`.
///
/// The child is polled so that cancellation or the optional timeout kills
/// the OS process rather than abandoning it. Output is drained on background
/// threads while the child runs.
#[instrument(skip_all, fields(timeout_secs = timeout.map(|t| t.as_secs())))]
pub fn run_streaming(
    mut cmd: Command,
    stdin: Option<Vec<u8>>,
    capture: &OutputCapture,
    cancel: &CancelToken,
    timeout: Option<Duration>,
) -> Result<StreamedExit> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // Own process group, so a kill reaches the agent's tool subprocesses.
        cmd.process_group(0);
    }

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdin_handle = match stdin {
        Some(input) => {
            let mut child_stdin = child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("stdin was not piped"))?;
            Some(thread::spawn(move || -> io::Result<()> {
                child_stdin.write_all(&input)?;
                // Dropping closes the pipe so the agent sees EOF.
                Ok(())
            }))
        }
        None => None,
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let mut stdout_writer = capture.writer();
    let mut stderr_writer = capture.writer();
    let stdout_handle = thread::spawn(move || -> Result<()> {
        let mut stdout = stdout;
        io::copy(&mut stdout, &mut stdout_writer).context("drain stdout")?;
        stdout_writer.finish()
    });
    let stderr_handle = thread::spawn(move || -> Result<()> {
        let mut stderr = stderr;
        io::copy(&mut stderr, &mut stderr_writer).context("drain stderr")?;
        stderr_writer.finish()
    });

    let started = Instant::now();
    let mut timed_out = false;
    let mut cancelled = false;
    let status = loop {
        if let Some(status) = child.wait_timeout(POLL_INTERVAL).context("wait for command")? {
            break status;
        }
        if cancel.is_cancelled() {
            warn!("cancellation requested, killing child");
            cancelled = true;
        } else if let Some(limit) = timeout
            && started.elapsed() >= limit
        {
            warn!(timeout_secs = limit.as_secs(), "command timed out, killing");
            timed_out = true;
        } else {
            continue;
        }
        kill_process_tree(&mut child)?;
        break child.wait().context("wait command after kill")?;
    };

    join_reader(stdout_handle).context("join stdout")?;
    join_reader(stderr_handle).context("join stderr")?;
    if let Some(handle) = stdin_handle {
        match handle.join() {
            Ok(Ok(())) => {}
            // The agent may exit without reading its whole prompt.
            Ok(Err(err)) => debug!(err = %err, "stdin write ended early"),
            Err(_) => return Err(anyhow!("stdin writer thread panicked")),
        }
    }

    debug!(exit_code = ?status.code(), timed_out, cancelled, "command finished");
    Ok(StreamedExit {
        status,
        timed_out,
        cancelled,
    })
}

/// Kill the child's whole process group, falling back to the child alone.
fn kill_process_tree(child: &mut Child) -> Result<()> {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        if let Ok(raw) = i32::try_from(child.id()) {
            match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
                Ok(()) => return Ok(()),
                Err(err) => debug!(err = %err, "killpg failed, killing child only"),
            }
        }
    }
    child.kill().context("kill command")
}

fn join_reader(handle: thread::JoinHandle<Result<()>>) -> Result<()> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn streams_stdout_and_stderr_into_transcript() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("output.log");
        let capture = OutputCapture::open(&path, None).expect("open");

        let exit = run_streaming(
            sh("cat; echo from-stdout; echo from-stderr >&2"),
            Some(b"prompt text\n".to_vec()),
            &capture,
            &CancelToken::new(),
            None,
        )
        .expect("run");

        assert!(exit.status.success());
        assert!(!exit.timed_out && !exit.cancelled);
        let raw = fs::read_to_string(&path).expect("read");
        assert!(raw.contains("prompt text\n"));
        assert!(raw.contains("from-stdout\n"));
        assert!(raw.contains("from-stderr\n"));
    }

    #[test]
    fn nonzero_exit_is_reported_not_raised() {
        let temp = tempfile::tempdir().expect("tempdir");
        let capture = OutputCapture::open(&temp.path().join("output.log"), None).expect("open");
        let exit = run_streaming(sh("exit 3"), None, &capture, &CancelToken::new(), None)
            .expect("run");
        assert_eq!(exit.status.code(), Some(3));
    }

    #[test]
    fn cancellation_kills_the_child() {
        let temp = tempfile::tempdir().expect("tempdir");
        let capture = OutputCapture::open(&temp.path().join("output.log"), None).expect("open");
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            trigger.cancel();
        });

        let started = Instant::now();
        let exit = run_streaming(sh("exec sleep 30"), None, &capture, &cancel, None).expect("run");
        canceller.join().expect("join canceller");

        assert!(exit.cancelled);
        assert!(!exit.status.success());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn cancellation_kills_grandchildren_too() {
        let temp = tempfile::tempdir().expect("tempdir");
        let capture = OutputCapture::open(&temp.path().join("output.log"), None).expect("open");
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            trigger.cancel();
        });

        let started = Instant::now();
        let exit = run_streaming(sh("sleep 30; echo done"), None, &capture, &cancel, None)
            .expect("run");
        canceller.join().expect("join canceller");

        assert!(exit.cancelled);
        assert!(started.elapsed() < Duration::from_secs(10));
        let raw = fs::read_to_string(temp.path().join("output.log")).expect("read");
        assert!(!raw.contains("done"));
    }

    #[test]
    fn timeout_kills_the_child() {
        let temp = tempfile::tempdir().expect("tempdir");
        let capture = OutputCapture::open(&temp.path().join("output.log"), None).expect("open");
        let exit = run_streaming(
            sh("exec sleep 30"),
            None,
            &capture,
            &CancelToken::new(),
            Some(Duration::from_millis(200)),
        )
        .expect("run");
        assert!(exit.timed_out);
    }

    #[test]
    fn system_launcher_sets_args_and_workdir() {
        let temp = tempfile::tempdir().expect("tempdir");
        let spec = LaunchSpec {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), "pwd".to_string()],
            workdir: temp.path().to_path_buf(),
        };
        let output = SystemLauncher.command(&spec).output().expect("run");
        let pwd = String::from_utf8_lossy(&output.stdout);
        let expected = temp.path().canonicalize().expect("canonicalize");
        assert_eq!(
            PathBuf::from(pwd.trim()).canonicalize().expect("canonicalize pwd"),
            expected
        );
    }
}
