//! Messages API wire types
//!
//! The request body follows Bedrock's Anthropic Messages schema. Content blocks
//! are a tagged sum type; the wire format is "struct with optionals" but each
//! variant only carries the fields its tag uses.

use base64::Engine;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::models::EditorSchema;

pub const ANTHROPIC_VERSION: &str = "bedrock-2023-05-31";
pub const DEFAULT_MAX_TOKENS: u32 = 2048;
pub const DEFAULT_TEMPERATURE: f64 = 1.0;
pub const DEFAULT_THINKING_TOKENS: u32 = 1024;
pub const MIN_THINKING_TOKENS: u32 = 1024;

pub const MEDIA_TYPE_JPEG: &str = "image/jpeg";
pub const MEDIA_TYPE_PNG: &str = "image/png";
pub const MEDIA_TYPE_GIF: &str = "image/gif";
pub const MEDIA_TYPE_WEBP: &str = "image/webp";
pub const MEDIA_TYPE_PDF: &str = "application/pdf";

/// Image media types accepted by the service
pub const IMAGE_MEDIA_TYPES: &[&str] = &[MEDIA_TYPE_JPEG, MEDIA_TYPE_PNG, MEDIA_TYPE_GIF, MEDIA_TYPE_WEBP];

// ═══════════════════════════════════════════════════════════════
// CONTENT
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Prompt-caching checkpoint marker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheControl {
    #[serde(rename = "type")]
    pub cache_type: String,
}

impl CacheControl {
    pub fn ephemeral() -> Self {
        Self {
            cache_type: "ephemeral".to_string(),
        }
    }
}

/// Base64 payload of an image or document block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    #[serde(rename = "type")]
    pub source_type: String,
    pub media_type: String,
    pub data: String,
}

impl Source {
    pub fn base64(media_type: &str, bytes: &[u8]) -> Self {
        Self {
            source_type: "base64".to_string(),
            media_type: media_type.to_string(),
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        #[serde(serialize_with = "non_empty_text")]
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
    },
    Image {
        source: Source,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
    },
    Document {
        source: Source,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
    Thinking {
        thinking: String,
        signature: String,
    },
    RedactedThinking {
        data: String,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text {
            text: text.into(),
            cache_control: None,
        }
    }

    pub fn image(media_type: &str, bytes: &[u8]) -> Self {
        Self::Image {
            source: Source::base64(media_type, bytes),
            cache_control: None,
        }
    }

    pub fn document(bytes: &[u8]) -> Self {
        Self::Document {
            source: Source::base64(MEDIA_TYPE_PDF, bytes),
            cache_control: None,
        }
    }

    pub fn tool_result(tool_use_id: impl Into<String>, content: impl Into<String>, is_error: bool) -> Self {
        Self::ToolResult {
            tool_use_id: tool_use_id.into(),
            content: content.into(),
            is_error,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text, .. } => Some(text),
            _ => None,
        }
    }

    pub fn cache_control(&self) -> Option<&CacheControl> {
        match self {
            Self::Text { cache_control, .. }
            | Self::Image { cache_control, .. }
            | Self::Document { cache_control, .. } => cache_control.as_ref(),
            _ => None,
        }
    }
}

/// The service rejects empty text blocks.
fn non_empty_text<S: Serializer>(text: &str, serializer: S) -> Result<S::Ok, S::Error> {
    if text.is_empty() {
        serializer.serialize_str(" ")
    } else {
        serializer.serialize_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl Message {
    pub fn user(content: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::User,
            content,
        }
    }

    pub fn assistant(content: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::Assistant,
            content,
        }
    }

    /// Concatenation of every text block, in order
    pub fn text(&self) -> String {
        self.content.iter().filter_map(ContentBlock::as_text).collect()
    }
}

// ═══════════════════════════════════════════════════════════════
// PARAMETERS
// ═══════════════════════════════════════════════════════════════

/// Extended thinking configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ThinkingConfig {
    Enabled { budget_tokens: u32 },
}

impl ThinkingConfig {
    pub fn budget_tokens(&self) -> u32 {
        match self {
            Self::Enabled { budget_tokens } => *budget_tokens,
        }
    }
}

/// Client-side tool declared to the model
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub name: String,
}

impl ToolDefinition {
    pub fn text_editor(schema: EditorSchema) -> Self {
        Self {
            tool_type: schema.tool_type().to_string(),
            name: schema.tool_name().to_string(),
        }
    }
}

/// Lets the model decide whether to call a tool, one call per turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ToolChoice {
    #[serde(rename = "type")]
    pub choice_type: &'static str,
    pub disable_parallel_tool_use: bool,
}

impl ToolChoice {
    pub const AUTO_SINGLE: ToolChoice = ToolChoice {
        choice_type: "auto",
        disable_parallel_tool_use: true,
    };
}

/// Scalar knobs for one invocation
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceParameters {
    pub anthropic_version: String,
    pub system: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: u32,
    pub top_p: Option<f64>,
    pub top_k: Option<u32>,
    pub stop_sequences: Vec<String>,
    pub thinking: Option<ThinkingConfig>,
    pub tools: Vec<ToolDefinition>,
    pub anthropic_beta: Vec<String>,
}

impl Default for InferenceParameters {
    fn default() -> Self {
        Self {
            anthropic_version: ANTHROPIC_VERSION.to_string(),
            system: None,
            temperature: Some(DEFAULT_TEMPERATURE),
            max_tokens: DEFAULT_MAX_TOKENS,
            top_p: None,
            top_k: None,
            stop_sequences: Vec::new(),
            thinking: None,
            tools: Vec::new(),
            anthropic_beta: Vec::new(),
        }
    }
}

impl InferenceParameters {
    pub fn body<'a>(&'a self, messages: &'a [Message]) -> RequestBody<'a> {
        RequestBody {
            anthropic_version: &self.anthropic_version,
            messages,
            system: self.system.as_deref().filter(|s| !s.is_empty()),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            top_p: self.top_p,
            top_k: self.top_k,
            stop_sequences: &self.stop_sequences,
            thinking: self.thinking.as_ref(),
            tools: &self.tools,
            tool_choice: (!self.tools.is_empty()).then_some(ToolChoice::AUTO_SINGLE),
            anthropic_beta: &self.anthropic_beta,
        }
    }
}

/// Serialized `{parameters, messages}` posted to the invoke endpoint
#[derive(Debug, Serialize)]
pub struct RequestBody<'a> {
    pub anthropic_version: &'a str,
    pub messages: &'a [Message],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    pub stop_sequences: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<&'a ThinkingConfig>,
    #[serde(skip_serializing_if = "<[ToolDefinition]>::is_empty")]
    pub tools: &'a [ToolDefinition],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    pub anthropic_beta: &'a [String],
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_empty_text_serializes_as_space() {
        let block = ContentBlock::text("");
        let value = serde_json::to_value(&block).unwrap();
        assert_eq!(value, json!({"type": "text", "text": " "}));
    }

    #[test]
    fn test_tool_result_omits_false_error_flag() {
        let ok = serde_json::to_value(ContentBlock::tool_result("toolu_1", "done", false)).unwrap();
        assert_eq!(ok, json!({"type": "tool_result", "tool_use_id": "toolu_1", "content": "done"}));

        let failed = serde_json::to_value(ContentBlock::tool_result("toolu_1", "Error: x", true)).unwrap();
        assert_eq!(failed["is_error"], json!(true));
    }

    #[test]
    fn test_image_source_is_base64() {
        let block = ContentBlock::image(MEDIA_TYPE_PNG, b"abc");
        let value = serde_json::to_value(&block).unwrap();
        assert_eq!(value["source"]["type"], "base64");
        assert_eq!(value["source"]["media_type"], "image/png");
        assert_eq!(value["source"]["data"], "YWJj");
    }

    #[test]
    fn test_body_skips_unset_fields() {
        let params = InferenceParameters::default();
        let messages = vec![Message::user(vec![ContentBlock::text("hi")])];
        let value = serde_json::to_value(params.body(&messages)).unwrap();

        assert_eq!(value["anthropic_version"], ANTHROPIC_VERSION);
        assert_eq!(value["max_tokens"], 2048);
        for absent in ["system", "top_p", "top_k", "stop_sequences", "thinking", "tools", "tool_choice", "anthropic_beta"] {
            assert!(value.get(absent).is_none(), "{absent} should be omitted");
        }
    }

    #[test]
    fn test_thinking_and_tools_serialize() {
        let params = InferenceParameters {
            thinking: Some(ThinkingConfig::Enabled { budget_tokens: 2000 }),
            tools: vec![ToolDefinition::text_editor(EditorSchema::V20250124)],
            anthropic_beta: vec!["computer-use-2025-01-24".to_string()],
            ..Default::default()
        };
        let value = serde_json::to_value(params.body(&[])).unwrap();
        assert_eq!(value["thinking"], json!({"type": "enabled", "budget_tokens": 2000}));
        assert_eq!(
            value["tools"],
            json!([{"type": "text_editor_20250124", "name": "str_replace_editor"}])
        );
        assert_eq!(value["anthropic_beta"], json!(["computer-use-2025-01-24"]));
        assert_eq!(
            value["tool_choice"],
            json!({"type": "auto", "disable_parallel_tool_use": true})
        );
    }

    #[test]
    fn test_message_text_joins_text_blocks() {
        let msg = Message::assistant(vec![
            ContentBlock::text("hi"),
            ContentBlock::Thinking {
                thinking: "hmm".to_string(),
                signature: String::new(),
            },
            ContentBlock::text(" there"),
        ]);
        assert_eq!(msg.text(), "hi there");
    }
}
