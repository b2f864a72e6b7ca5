//! Streaming event decoder
//!
//! Turns the Messages streaming protocol into display deltas and keeps the
//! in-flight assistant message up to date. The decoder owns only per-stream
//! bookkeeping; the conversation is passed in on every call so the controller
//! stays the single owner of history.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::BodsError;
use crate::messages::{ContentBlock, Message, Role};

pub const THINKING_OPEN: &str = "`<thinking>` \n\n";
pub const THINKING_CLOSE: &str = "\n\n`</thinking>`\n\n";

pub const STOP_TOOL_USE: &str = "tool_use";

// ═══════════════════════════════════════════════════════════════
// WIRE EVENTS
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    MessageStart {
        message: MessageStart,
    },
    ContentBlockStart {
        index: usize,
        content_block: BlockStart,
    },
    ContentBlockDelta {
        index: usize,
        delta: Delta,
    },
    ContentBlockStop {
        index: usize,
    },
    MessageDelta {
        delta: MessageDeltaBody,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
    },
    MessageStop {
        #[serde(
            rename = "amazon-bedrock-invocationMetrics",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        metrics: Option<InvocationMetrics>,
    },
    Ping,
    Error {
        error: ApiError,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageStart {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockStart {
    Text {
        #[serde(default)]
        text: String,
    },
    Thinking {
        #[serde(default)]
        thinking: String,
    },
    RedactedThinking {
        data: String,
    },
    ToolUse {
        id: String,
        name: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Delta {
    TextDelta { text: String },
    ThinkingDelta { thinking: String },
    SignatureDelta { signature: String },
    InputJsonDelta { partial_json: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageDeltaBody {
    #[serde(default)]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub stop_sequence: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub output_tokens: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationMetrics {
    #[serde(default)]
    pub input_token_count: u64,
    #[serde(default)]
    pub output_token_count: u64,
    #[serde(default)]
    pub invocation_latency: u64,
    #[serde(default)]
    pub first_byte_latency: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiError {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
}

impl StreamEvent {
    pub fn from_json(bytes: &[u8]) -> Result<Self, BodsError> {
        serde_json::from_slice(bytes).map_err(|e| {
            BodsError::protocol(format!(
                "unparsable event {}: {}",
                String::from_utf8_lossy(bytes),
                e
            ))
        })
    }
}

// ═══════════════════════════════════════════════════════════════
// DECODER
// ═══════════════════════════════════════════════════════════════

/// Text for the renderer, in stream order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisplayDelta {
    Text(String),
    Thinking(String),
}

/// How a stream ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Completed,
    ToolRequested,
}

/// Outcome of applying one event
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Step {
    pub display: Option<DisplayDelta>,
    pub signal: Option<Signal>,
}

impl Step {
    fn display(delta: DisplayDelta) -> Self {
        Self {
            display: Some(delta),
            signal: None,
        }
    }

    fn text(text: &str) -> Self {
        Self::display(DisplayDelta::Text(text.to_string()))
    }

    fn signal(signal: Signal) -> Self {
        Self {
            display: None,
            signal: Some(signal),
        }
    }
}

#[derive(Debug, Default)]
pub struct StreamDecoder {
    format: bool,
    thinking_enabled: bool,
    started: bool,
    open_block: Option<usize>,
    tool_json: String,
    stop_reason: Option<String>,
    thinking_closed: bool,
}

impl StreamDecoder {
    pub fn new(format: bool, thinking_enabled: bool) -> Self {
        Self {
            format,
            thinking_enabled,
            ..Default::default()
        }
    }

    pub fn stop_reason(&self) -> Option<&str> {
        self.stop_reason.as_deref()
    }

    /// Apply one event to the conversation
    pub fn apply(&mut self, conversation: &mut Vec<Message>, event: StreamEvent) -> Result<Step, BodsError> {
        match event {
            StreamEvent::MessageStart { message } => {
                if message.role != Role::Assistant {
                    return Err(BodsError::protocol(format!(
                        "message_start with unexpected role {:?}",
                        message.role
                    )));
                }
                if self.started {
                    return Err(BodsError::protocol("message_start received twice"));
                }
                self.started = true;
                conversation.push(Message::assistant(Vec::new()));
                Ok(Step::default())
            }

            StreamEvent::ContentBlockStart { index, content_block } => {
                self.ensure_started("content_block_start")?;
                if let Some(open) = self.open_block {
                    return Err(BodsError::protocol(format!(
                        "content_block_start {} while block {} is still open",
                        index, open
                    )));
                }
                let blocks = &mut current_message(conversation)?.content;
                if index != blocks.len() {
                    return Err(BodsError::protocol(format!(
                        "content_block_start index {} out of order, expected {}",
                        index,
                        blocks.len()
                    )));
                }
                self.open_block = Some(index);

                match content_block {
                    BlockStart::Text { text } => {
                        blocks.push(ContentBlock::text(text));
                        Ok(Step::default())
                    }
                    BlockStart::Thinking { thinking } => {
                        blocks.push(ContentBlock::Thinking {
                            thinking,
                            signature: String::new(),
                        });
                        self.thinking_closed = false;
                        Ok(if self.format {
                            Step::text(THINKING_OPEN)
                        } else {
                            Step::default()
                        })
                    }
                    BlockStart::RedactedThinking { data } => {
                        blocks.push(ContentBlock::RedactedThinking { data });
                        Ok(Step::default())
                    }
                    BlockStart::ToolUse { id, name } => {
                        tracing::debug!(%id, %name, "tool_use block started");
                        blocks.push(ContentBlock::ToolUse {
                            id,
                            name,
                            input: Value::Object(Default::default()),
                        });
                        self.tool_json.clear();
                        if self.format && self.thinking_enabled {
                            self.thinking_closed = false;
                            Ok(Step::text(THINKING_OPEN))
                        } else {
                            Ok(Step::default())
                        }
                    }
                }
            }

            StreamEvent::ContentBlockDelta { index, delta } => {
                let block = self.open(conversation, index, "content_block_delta")?;
                match (block, delta) {
                    (ContentBlock::Text { text, .. }, Delta::TextDelta { text: piece }) => {
                        text.push_str(&piece);
                        Ok(Step::display(DisplayDelta::Text(piece)))
                    }
                    (ContentBlock::Thinking { thinking, .. }, Delta::ThinkingDelta { thinking: piece }) => {
                        thinking.push_str(&piece);
                        Ok(Step::display(DisplayDelta::Thinking(piece)))
                    }
                    (ContentBlock::Thinking { signature, .. }, Delta::SignatureDelta { signature: piece }) => {
                        signature.push_str(&piece);
                        if self.format && !self.thinking_closed {
                            self.thinking_closed = true;
                            Ok(Step::text(THINKING_CLOSE))
                        } else {
                            Ok(Step::default())
                        }
                    }
                    (ContentBlock::ToolUse { .. }, Delta::InputJsonDelta { partial_json }) => {
                        self.tool_json.push_str(&partial_json);
                        Ok(Step::default())
                    }
                    (block, delta) => Err(BodsError::protocol(format!(
                        "{} does not apply to a {} block",
                        delta_name(&delta),
                        block_name(block)
                    ))),
                }
            }

            StreamEvent::ContentBlockStop { index } => {
                let block = self.open(conversation, index, "content_block_stop")?;
                if let ContentBlock::ToolUse { id, input, .. } = block {
                    let raw = if self.tool_json.trim().is_empty() {
                        "{}"
                    } else {
                        self.tool_json.as_str()
                    };
                    *input = serde_json::from_str(raw)
                        .map_err(|e| BodsError::protocol(format!("unparsable tool input {}: {}", raw, e)))?;
                    tracing::debug!(%id, "tool_use input complete");
                    self.tool_json.clear();
                }
                self.open_block = None;
                Ok(Step::default())
            }

            StreamEvent::MessageDelta { delta, usage } => {
                self.ensure_started("message_delta")?;
                if let Some(usage) = usage {
                    tracing::debug!(output_tokens = usage.output_tokens, "message_delta");
                }
                if delta.stop_reason.as_deref() == Some(STOP_TOOL_USE) {
                    let requested = current_message(conversation)?
                        .content
                        .iter()
                        .any(|block| matches!(block, ContentBlock::ToolUse { .. }));
                    if !requested || self.open_block.is_some() {
                        return Err(BodsError::protocol("tool_use stop without a completed tool_use block"));
                    }
                }
                self.stop_reason = delta.stop_reason;
                Ok(Step::default())
            }

            StreamEvent::MessageStop { metrics } => {
                self.ensure_started("message_stop")?;
                if let Some(m) = metrics {
                    tracing::info!(
                        input_tokens = m.input_token_count,
                        output_tokens = m.output_token_count,
                        latency_ms = m.invocation_latency,
                        first_byte_ms = m.first_byte_latency,
                        "invocation finished"
                    );
                }
                if self.stop_reason() == Some(STOP_TOOL_USE) {
                    Ok(Step::signal(Signal::ToolRequested))
                } else {
                    Ok(Step::signal(Signal::Completed))
                }
            }

            StreamEvent::Ping => Ok(Step::default()),

            StreamEvent::Error { error } => Err(BodsError::transport(format!(
                "{}: {}",
                error.error_type, error.message
            ))),
        }
    }

    fn ensure_started(&self, event: &str) -> Result<(), BodsError> {
        if self.started {
            Ok(())
        } else {
            Err(BodsError::protocol(format!("{} before message_start", event)))
        }
    }

    /// The open block an event addresses
    fn open<'c>(
        &self,
        conversation: &'c mut [Message],
        index: usize,
        event: &str,
    ) -> Result<&'c mut ContentBlock, BodsError> {
        self.ensure_started(event)?;
        if self.open_block != Some(index) {
            return Err(BodsError::protocol(format!("{} for block {} which is not open", event, index)));
        }
        current_message(conversation)?
            .content
            .get_mut(index)
            .ok_or_else(|| BodsError::protocol(format!("{} for missing block {}", event, index)))
    }
}

fn current_message(conversation: &mut [Message]) -> Result<&mut Message, BodsError> {
    match conversation.last_mut() {
        Some(msg) if msg.role == Role::Assistant => Ok(msg),
        _ => Err(BodsError::protocol("no assistant message in flight")),
    }
}

fn block_name(block: &ContentBlock) -> &'static str {
    match block {
        ContentBlock::Text { .. } => "text",
        ContentBlock::Image { .. } => "image",
        ContentBlock::Document { .. } => "document",
        ContentBlock::ToolUse { .. } => "tool_use",
        ContentBlock::ToolResult { .. } => "tool_result",
        ContentBlock::Thinking { .. } => "thinking",
        ContentBlock::RedactedThinking { .. } => "redacted_thinking",
    }
}

fn delta_name(delta: &Delta) -> &'static str {
    match delta {
        Delta::TextDelta { .. } => "text_delta",
        Delta::ThinkingDelta { .. } => "thinking_delta",
        Delta::SignatureDelta { .. } => "signature_delta",
        Delta::InputJsonDelta { .. } => "input_json_delta",
    }
}
