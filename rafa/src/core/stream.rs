//! Decoder for the agent CLI's line-delimited `stream-json` output.
//!
//! With `--include-partial-messages` the CLI emits, per session:
//!   system(init) → stream_event* → assistant → user(tool_result) → … → result
//!
//! `stream_event` lines wrap raw API events (`content_block_delta`, …) and
//! carry the incremental text. Every line decodes to exactly one
//! [`StreamEvent`]; anything malformed or irrelevant becomes
//! [`StreamEvent::Empty`]. Decoding never fails.

use serde::Deserialize;
use serde::de::IgnoredAny;
use serde_json::Value;

/// Freeform phrases the CLI prints when a resumed conversation is gone.
const SESSION_EXPIRED_PHRASES: &[&str] = &[
    "session not found",
    "session expired",
    "invalid session",
    "no conversation found",
];

/// Token counts reported by the agent. Missing fields are zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// One decoded line of agent output.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Nothing worth reporting.
    Empty,
    Init {
        session_id: String,
    },
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        /// Tool-specific subject (file path, pattern, command, …).
        target: String,
    },
    ToolResult {
        tool_use_id: String,
        is_error: bool,
    },
    Usage(TokenUsage),
    Error {
        message: String,
        session_expired: bool,
    },
    Done {
        session_id: String,
        cost_usd: f64,
        usage: TokenUsage,
    },
}

impl StreamEvent {
    pub fn is_empty(&self) -> bool {
        matches!(self, StreamEvent::Empty)
    }

    pub fn is_session_expired(&self) -> bool {
        matches!(
            self,
            StreamEvent::Error {
                session_expired: true,
                ..
            }
        )
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireLine {
    System {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
    },
    StreamEvent {
        #[serde(default)]
        event: Option<WireInner>,
    },
    Assistant {
        #[serde(default)]
        message: Option<WireMessage>,
    },
    User {
        #[serde(default)]
        message: Option<WireMessage>,
    },
    Result {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        is_error: Option<bool>,
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        total_cost_usd: Option<f64>,
        #[serde(default)]
        usage: Option<WireUsage>,
    },
    #[serde(other)]
    Other,
}

/// Raw API event inside a `stream_event` wrapper.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireInner {
    ContentBlockStart { content_block: WireBlock },
    ContentBlockDelta { delta: WireDelta },
    MessageDelta {
        #[serde(default)]
        usage: Option<WireUsage>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireDelta {
    TextDelta { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: WireContent,
}

/// Message content is either a block list or a bare string.
#[derive(Debug, Deserialize, Default)]
#[serde(untagged)]
enum WireContent {
    Blocks(Vec<WireBlock>),
    Text(IgnoredAny),
    #[default]
    Empty,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireBlock {
    ToolUse {
        #[serde(default)]
        id: String,
        name: String,
        #[serde(default)]
        input: Option<Value>,
    },
    ToolResult {
        #[serde(default)]
        tool_use_id: String,
        #[serde(default)]
        is_error: Option<bool>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    input_tokens: Option<u64>,
    #[serde(default)]
    output_tokens: Option<u64>,
}

impl From<Option<WireUsage>> for TokenUsage {
    fn from(usage: Option<WireUsage>) -> Self {
        let Some(usage) = usage else {
            return TokenUsage::default();
        };
        TokenUsage {
            input_tokens: usage.input_tokens.unwrap_or(0),
            output_tokens: usage.output_tokens.unwrap_or(0),
        }
    }
}

/// Decode one line of agent output.
///
/// Session-expiry phrases only count in error results and in plain-text
/// diagnostics. Any other JSON line is agent traffic and decodes as-is.
pub fn parse_line(line: &str) -> StreamEvent {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return StreamEvent::Empty;
    }
    match decode(trimmed) {
        StreamEvent::Error { message, .. } => StreamEvent::Error {
            session_expired: is_session_expired(&message),
            message,
        },
        StreamEvent::Empty if !is_json(trimmed) && is_session_expired(trimmed) => {
            StreamEvent::Error {
                message: trimmed.to_string(),
                session_expired: true,
            }
        }
        event => event,
    }
}

/// True if `line` is a complete JSON value.
pub fn is_json(line: &str) -> bool {
    serde_json::from_str::<IgnoredAny>(line).is_ok()
}

/// Case-insensitive check for "the conversation is gone" diagnostics.
pub fn is_session_expired(line: &str) -> bool {
    let lower = line.to_lowercase();
    SESSION_EXPIRED_PHRASES
        .iter()
        .any(|phrase| lower.contains(phrase))
}

fn decode(line: &str) -> StreamEvent {
    let Ok(wire) = serde_json::from_str::<WireLine>(line) else {
        return StreamEvent::Empty;
    };
    match wire {
        WireLine::System {
            subtype,
            session_id,
        } => match subtype.as_deref() {
            Some("init") => StreamEvent::Init {
                session_id: session_id.unwrap_or_default(),
            },
            _ => StreamEvent::Empty,
        },
        WireLine::StreamEvent { event } => match event {
            Some(WireInner::ContentBlockDelta {
                delta: WireDelta::TextDelta { text },
            }) => StreamEvent::Text { text },
            Some(WireInner::ContentBlockStart { content_block }) => tool_use_event(content_block),
            Some(WireInner::MessageDelta { usage: Some(usage) }) => {
                StreamEvent::Usage(TokenUsage::from(Some(usage)))
            }
            _ => StreamEvent::Empty,
        },
        WireLine::Assistant { message } => blocks(message)
            .into_iter()
            .map(tool_use_event)
            .find(|event| !event.is_empty())
            .unwrap_or(StreamEvent::Empty),
        WireLine::User { message } => blocks(message)
            .into_iter()
            .find_map(|block| match block {
                WireBlock::ToolResult {
                    tool_use_id,
                    is_error,
                } => Some(StreamEvent::ToolResult {
                    tool_use_id,
                    is_error: is_error.unwrap_or(false),
                }),
                _ => None,
            })
            .unwrap_or(StreamEvent::Empty),
        WireLine::Result {
            subtype,
            is_error,
            result,
            session_id,
            total_cost_usd,
            usage,
        } => {
            if is_error.unwrap_or(false) {
                let message = result
                    .filter(|text| !text.trim().is_empty())
                    .or(subtype)
                    .unwrap_or_else(|| "agent reported an error".to_string());
                return StreamEvent::Error {
                    message,
                    session_expired: false,
                };
            }
            StreamEvent::Done {
                session_id: session_id.unwrap_or_default(),
                cost_usd: total_cost_usd.unwrap_or(0.0),
                usage: TokenUsage::from(usage),
            }
        }
        WireLine::Other => StreamEvent::Empty,
    }
}

fn blocks(message: Option<WireMessage>) -> Vec<WireBlock> {
    match message.map(|message| message.content) {
        Some(WireContent::Blocks(blocks)) => blocks,
        _ => Vec::new(),
    }
}

fn tool_use_event(block: WireBlock) -> StreamEvent {
    match block {
        WireBlock::ToolUse { id, name, input } => {
            let target = tool_target(&name, input.as_ref());
            StreamEvent::ToolUse { id, name, target }
        }
        _ => StreamEvent::Empty,
    }
}

/// Extract the field that best describes what a tool call acts on.
pub fn tool_target(name: &str, input: Option<&Value>) -> String {
    let key = match name {
        "Read" | "Write" | "Edit" | "MultiEdit" => "file_path",
        "NotebookEdit" => "notebook_path",
        "Glob" | "Grep" => "pattern",
        "Bash" => "command",
        "Task" => "description",
        "WebFetch" => "url",
        "WebSearch" => "query",
        _ => return String::new(),
    };
    input
        .and_then(|input| input.get(key))
        .and_then(Value::as_str)
        .map(|value| value.lines().next().unwrap_or_default().to_string())
        .unwrap_or_default()
}
