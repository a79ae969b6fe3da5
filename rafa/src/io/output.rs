//! Durable transcript (`output.log`) plus a live event feed for observers.
//!
//! Every line the agent writes goes through [`OutputCapture`]. The transcript
//! write always happens; the live feed is a bounded channel fed with
//! `try_send`, so a slow observer loses events instead of stalling the agent.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{SyncSender, TrySendError};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result, anyhow};
use chrono::{SecondsFormat, Utc};
use tracing::{debug, warn};

use crate::core::stream::{StreamEvent, TokenUsage, is_json, parse_line};

/// Marker the agent uses to propose a commit message.
pub const COMMIT_MESSAGE_MARKER: &str = "SUGGESTED_COMMIT_MESSAGE:";
/// How many trailing transcript lines are searched for the marker.
pub const COMMIT_MESSAGE_SCAN_LINES: usize = 100;

const TAIL_CHUNK_BYTES: u64 = 8 * 1024;

/// A live event tagged with the attempt it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputEvent {
    pub task_id: String,
    pub attempt: u32,
    pub payload: OutputPayload,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutputPayload {
    /// Decoded protocol event. Text deltas arrive coalesced.
    Stream(StreamEvent),
    /// Raw non-protocol line (stderr, plain prints).
    Line(String),
}

/// What the stream told us about the current attempt.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttemptSummary {
    pub session_id: Option<String>,
    pub error: Option<String>,
    pub session_expired: bool,
    pub completed: bool,
    pub cost_usd: f64,
    pub usage: TokenUsage,
}

/// Shared handle to a plan's transcript and observer channel.
#[derive(Debug, Clone)]
pub struct OutputCapture {
    state: Arc<Mutex<CaptureState>>,
}

#[derive(Debug)]
struct CaptureState {
    path: PathBuf,
    file: File,
    events: Option<SyncSender<OutputEvent>>,
    task_id: String,
    attempt: u32,
    pending_text: String,
    at_line_start: bool,
    seen_tools: HashSet<String>,
    summary: AttemptSummary,
    dropped: u64,
}

impl OutputCapture {
    /// Open (or create) the transcript in append mode.
    pub fn open(path: &Path, events: Option<SyncSender<OutputEvent>>) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create output dir {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open output log {}", path.display()))?;
        Ok(Self {
            state: Arc::new(Mutex::new(CaptureState {
                path: path.to_path_buf(),
                file,
                events,
                task_id: String::new(),
                attempt: 0,
                pending_text: String::new(),
                at_line_start: true,
                seen_tools: HashSet::new(),
                summary: AttemptSummary::default(),
                dropped: 0,
            })),
        })
    }

    pub fn path(&self) -> Result<PathBuf> {
        Ok(self.state()?.path.clone())
    }

    /// Write the attempt header and reset per-attempt state.
    pub fn begin_attempt(&self, task_id: &str, attempt: u32) -> Result<()> {
        let mut state = self.state()?;
        state.flush_text();
        state.task_id = task_id.to_string();
        state.attempt = attempt;
        state.seen_tools.clear();
        state.summary = AttemptSummary::default();
        let started = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        state.write_block(&format!(
            "\n=== Task {task_id}, Attempt {attempt} ===\nStarted: {started}\n\n"
        ))
    }

    /// Flush buffered text and write the attempt footer.
    pub fn end_attempt(&self, success: bool) -> Result<()> {
        let mut state = self.state()?;
        state.flush_text();
        let result = if success { "SUCCESS" } else { "FAILED" };
        let task_id = state.task_id.clone();
        state.write_block(&format!("\n=== Task {task_id}: {result} ===\n"))?;
        if state.dropped > 0 {
            debug!(dropped = state.dropped, "live events dropped during attempt");
            state.dropped = 0;
        }
        Ok(())
    }

    /// Record a runner-side note (spawn failures, timeouts) in the transcript.
    pub fn note(&self, message: &str) -> Result<()> {
        let mut state = self.state()?;
        state.flush_text();
        state.write_block(&format!("[rafa] {}\n", message.trim_end()))
    }

    /// Process one complete line of agent output.
    pub fn write_line(&self, line: &str) -> Result<()> {
        self.state()?.process_line(line)
    }

    /// Line-buffering writer that feeds this capture.
    pub fn writer(&self) -> CaptureWriter {
        CaptureWriter {
            capture: self.clone(),
            buf: Vec::new(),
        }
    }

    pub fn summary(&self) -> Result<AttemptSummary> {
        Ok(self.state()?.summary.clone())
    }

    fn state(&self) -> Result<MutexGuard<'_, CaptureState>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("output capture lock poisoned"))
    }
}

impl CaptureState {
    fn process_line(&mut self, raw: &str) -> Result<()> {
        let line = raw.trim_end_matches(['\r', '\n']);
        let event = parse_line(line);
        match event {
            StreamEvent::Text { text } => {
                self.write_raw(&text)?;
                self.pending_text.push_str(&text);
                Ok(())
            }
            StreamEvent::Empty => {
                if line.trim().is_empty() || is_json(line) {
                    return Ok(());
                }
                self.flush_text();
                self.write_block(&format!("{line}\n"))?;
                self.send(OutputPayload::Line(line.to_string()));
                Ok(())
            }
            event => {
                self.flush_text();
                if let StreamEvent::ToolUse { id, .. } = &event
                    && !id.is_empty()
                    && !self.seen_tools.insert(id.clone())
                {
                    return Ok(());
                }
                if let Some(rendered) = self.record(&event) {
                    self.write_block(&format!("{rendered}\n"))?;
                }
                self.send(OutputPayload::Stream(event));
                Ok(())
            }
        }
    }

    /// Update the attempt summary; returns the transcript rendering, if any.
    fn record(&mut self, event: &StreamEvent) -> Option<String> {
        match event {
            StreamEvent::Init { session_id } => {
                self.summary.session_id = Some(session_id.clone());
                Some(format!("[session] {session_id}"))
            }
            StreamEvent::ToolUse { name, target, .. } => {
                if target.is_empty() {
                    Some(format!("[tool] {name}"))
                } else {
                    Some(format!("[tool] {name} {target}"))
                }
            }
            StreamEvent::ToolResult {
                tool_use_id,
                is_error: true,
            } => Some(format!("[tool error] {tool_use_id}")),
            StreamEvent::Usage(usage) => {
                self.summary.usage = *usage;
                None
            }
            StreamEvent::Error {
                message,
                session_expired,
            } => {
                self.summary.error = Some(message.clone());
                self.summary.session_expired |= *session_expired;
                Some(format!("[error] {message}"))
            }
            StreamEvent::Done {
                session_id,
                cost_usd,
                usage,
            } => {
                self.summary.completed = true;
                if !session_id.is_empty() {
                    self.summary.session_id = Some(session_id.clone());
                }
                self.summary.cost_usd = *cost_usd;
                self.summary.usage = *usage;
                Some(format!(
                    "[done] cost ${cost_usd:.4}, tokens in {} / out {}",
                    usage.input_tokens, usage.output_tokens
                ))
            }
            _ => None,
        }
    }

    fn flush_text(&mut self) {
        if self.pending_text.is_empty() {
            return;
        }
        let text = std::mem::take(&mut self.pending_text);
        self.send(OutputPayload::Stream(StreamEvent::Text { text }));
    }

    fn send(&mut self, payload: OutputPayload) {
        let Some(sender) = &self.events else {
            return;
        };
        let event = OutputEvent {
            task_id: self.task_id.clone(),
            attempt: self.attempt,
            payload,
        };
        match sender.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => self.dropped += 1,
            Err(TrySendError::Disconnected(_)) => {
                debug!("live event receiver gone; disabling feed");
                self.events = None;
            }
        }
    }

    /// Write starting on a fresh line.
    fn write_block(&mut self, text: &str) -> Result<()> {
        if !self.at_line_start {
            self.write_raw("\n")?;
        }
        self.write_raw(text)
    }

    fn write_raw(&mut self, text: &str) -> Result<()> {
        if text.is_empty() {
            return Ok(());
        }
        self.file
            .write_all(text.as_bytes())
            .with_context(|| format!("append output log {}", self.path.display()))?;
        self.at_line_start = text.ends_with('\n');
        Ok(())
    }
}

/// `io::Write` adapter that splits bytes into lines for an [`OutputCapture`].
///
/// A trailing partial line is processed on drop.
#[derive(Debug)]
pub struct CaptureWriter {
    capture: OutputCapture,
    buf: Vec<u8>,
}

impl CaptureWriter {
    fn drain_lines(&mut self) -> Result<()> {
        while let Some(pos) = self.buf.iter().position(|byte| *byte == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            self.capture.write_line(&String::from_utf8_lossy(&line))?;
        }
        Ok(())
    }

    /// Process any buffered partial line.
    pub fn finish(&mut self) -> Result<()> {
        self.drain_lines()?;
        if self.buf.is_empty() {
            return Ok(());
        }
        let rest = std::mem::take(&mut self.buf);
        self.capture.write_line(&String::from_utf8_lossy(&rest))
    }
}

impl Write for CaptureWriter {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(bytes);
        self.drain_lines().map_err(|err| io::Error::other(format!("{err:#}")))?;
        Ok(bytes.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for CaptureWriter {
    fn drop(&mut self) {
        if let Err(err) = self.finish() {
            warn!(err = %err, "failed to flush captured output");
        }
    }
}

/// Most recent `SUGGESTED_COMMIT_MESSAGE:` within the transcript's last lines.
///
/// Returns an empty string if there is none or the transcript is missing.
pub fn extract_commit_message(path: &Path) -> Result<String> {
    if !path.exists() {
        return Ok(String::new());
    }
    let lines = tail_lines(path, COMMIT_MESSAGE_SCAN_LINES)?;
    // Never reach past the newest attempt header into an earlier attempt.
    Ok(lines
        .iter()
        .rev()
        .take_while(|line| !is_attempt_header(line))
        .find_map(|line| line.trim_start().strip_prefix(COMMIT_MESSAGE_MARKER))
        .map(|message| message.trim().to_string())
        .unwrap_or_default())
}

fn is_attempt_header(line: &str) -> bool {
    line.starts_with("=== Task ") && line.contains(", Attempt ")
}

/// Read at most the last `count` lines, scanning backwards in chunks.
fn tail_lines(path: &Path, count: usize) -> Result<Vec<String>> {
    let mut file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let len = file
        .metadata()
        .with_context(|| format!("stat {}", path.display()))?
        .len();

    let mut pos = len;
    let mut tail: Vec<u8> = Vec::new();
    // One extra newline so the first kept line is complete.
    while pos > 0 && tail.iter().filter(|byte| **byte == b'\n').count() <= count {
        let step = TAIL_CHUNK_BYTES.min(pos);
        pos -= step;
        file.seek(SeekFrom::Start(pos))
            .with_context(|| format!("seek {}", path.display()))?;
        let mut chunk = vec![0u8; usize::try_from(step).context("chunk size")?];
        file.read_exact(&mut chunk)
            .with_context(|| format!("read {}", path.display()))?;
        chunk.extend_from_slice(&tail);
        tail = chunk;
    }

    let text = String::from_utf8_lossy(&tail);
    let lines: Vec<&str> = text.lines().collect();
    let skip = lines.len().saturating_sub(count);
    Ok(lines[skip..].iter().map(|line| line.to_string()).collect())
}
