//! Claude model catalog and capability predicates
//!
//! Model ids are Bedrock identifiers such as
//! `anthropic.claude-3-7-sonnet-20250219-v1:0`. Inference-profile ids carry an
//! extra routing prefix (`us.`, `eu.`, `global.`); the prefix is kept on the
//! wire but every capability lookup goes through the normalized base id.

use serde::{Deserialize, Serialize};
use std::fmt;

pub const CLAUDE_INSTANT_V1: &str = "anthropic.claude-instant-v1";
pub const CLAUDE_V2: &str = "anthropic.claude-v2";
pub const CLAUDE_V2_1: &str = "anthropic.claude-v2:1";
pub const CLAUDE_V3_HAIKU: &str = "anthropic.claude-3-haiku-20240307-v1:0";
pub const CLAUDE_V3_SONNET: &str = "anthropic.claude-3-sonnet-20240229-v1:0";
pub const CLAUDE_V3_OPUS: &str = "anthropic.claude-3-opus-20240229-v1:0";
pub const CLAUDE_V35_HAIKU: &str = "anthropic.claude-3-5-haiku-20241022-v1:0";
pub const CLAUDE_V35_SONNET: &str = "anthropic.claude-3-5-sonnet-20240620-v1:0";
pub const CLAUDE_V35_SONNET_V2: &str = "anthropic.claude-3-5-sonnet-20241022-v2:0";
pub const CLAUDE_V37_SONNET: &str = "anthropic.claude-3-7-sonnet-20250219-v1:0";
pub const CLAUDE_V4_SONNET: &str = "anthropic.claude-sonnet-4-20250514-v1:0";
pub const CLAUDE_V4_OPUS: &str = "anthropic.claude-opus-4-20250514-v1:0";
pub const CLAUDE_V41_OPUS: &str = "anthropic.claude-opus-4-1-20250805-v1:0";
pub const CLAUDE_V45_SONNET: &str = "anthropic.claude-sonnet-4-5-20250929-v1:0";
pub const CLAUDE_V45_HAIKU: &str = "anthropic.claude-haiku-4-5-20251001-v1:0";
pub const CLAUDE_V45_OPUS: &str = "anthropic.claude-opus-4-5-20251101-v1:0";
pub const CLAUDE_V46_OPUS: &str = "anthropic.claude-opus-4-6-v1";

pub const DEFAULT_MODEL_ID: &str = CLAUDE_V37_SONNET;

/// All ids offered for shell completion of `--model`
pub const KNOWN_MODEL_IDS: &[&str] = &[
    CLAUDE_INSTANT_V1,
    CLAUDE_V2,
    CLAUDE_V2_1,
    CLAUDE_V3_HAIKU,
    CLAUDE_V3_SONNET,
    CLAUDE_V3_OPUS,
    CLAUDE_V35_HAIKU,
    CLAUDE_V35_SONNET,
    CLAUDE_V35_SONNET_V2,
    CLAUDE_V37_SONNET,
    CLAUDE_V4_SONNET,
    CLAUDE_V4_OPUS,
    CLAUDE_V41_OPUS,
    CLAUDE_V45_SONNET,
    CLAUDE_V45_HAIKU,
    CLAUDE_V45_OPUS,
    CLAUDE_V46_OPUS,
];

/// Version of the text editor tool schema a model understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditorSchema {
    /// Claude 3.5 Sonnet
    V20241022,
    /// Claude 3.7 Sonnet
    V20250124,
    /// Claude 4 and later
    V20250728,
}

impl EditorSchema {
    /// On-wire tool type
    pub fn tool_type(self) -> &'static str {
        match self {
            Self::V20241022 => "text_editor_20241022",
            Self::V20250124 => "text_editor_20250124",
            Self::V20250728 => "text_editor_20250728",
        }
    }

    pub fn tool_name(self) -> &'static str {
        match self {
            Self::V20241022 | Self::V20250124 => "str_replace_editor",
            Self::V20250728 => "str_replace_based_edit_tool",
        }
    }

    /// Beta flag Bedrock requires before it accepts the tool definition
    pub fn beta_flag(self) -> Option<&'static str> {
        match self {
            Self::V20241022 => Some("computer-use-2024-10-22"),
            Self::V20250124 => Some("computer-use-2025-01-24"),
            Self::V20250728 => None,
        }
    }
}

/// A model identifier as given on the command line or in a template
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelId(String);

impl ModelId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id exactly as it goes on the wire
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Strip an inference-profile prefix: `us.anthropic.x` becomes `anthropic.x`
    pub fn base(&self) -> &str {
        match self.0.find(".anthropic.") {
            Some(idx) => &self.0[idx + 1..],
            None => &self.0,
        }
    }

    /// True for `global.` or two-letter region prefixes such as `us.` and `eu.`
    pub fn has_profile_prefix(&self) -> bool {
        if self.0.starts_with("global.") {
            return true;
        }
        let bytes = self.0.as_bytes();
        bytes.len() >= 3
            && bytes[2] == b'.'
            && bytes[..2].iter().all(|b| b.is_ascii_alphabetic())
    }

    pub fn supports_vision(&self) -> bool {
        matches!(
            self.base(),
            CLAUDE_V3_HAIKU
                | CLAUDE_V3_SONNET
                | CLAUDE_V3_OPUS
                | CLAUDE_V35_SONNET
                | CLAUDE_V35_SONNET_V2
                | CLAUDE_V37_SONNET
        ) || self.is_claude4()
    }

    pub fn supports_prompt_caching(&self) -> bool {
        matches!(self.base(), CLAUDE_V35_HAIKU | CLAUDE_V37_SONNET) || self.is_claude4()
    }

    pub fn supports_thinking(&self) -> bool {
        self.base() == CLAUDE_V37_SONNET || self.is_claude4()
    }

    /// Newer models reject requests that set both `temperature` and `top_p`
    pub fn requires_temperature_xor_top_p(&self) -> bool {
        matches!(
            self.base(),
            CLAUDE_V41_OPUS | CLAUDE_V45_SONNET | CLAUDE_V45_HAIKU | CLAUDE_V45_OPUS | CLAUDE_V46_OPUS
        )
    }

    /// Claude 2 takes the system prompt inline with the user turn
    pub fn supports_system_field(&self) -> bool {
        !matches!(self.base(), CLAUDE_INSTANT_V1 | CLAUDE_V2 | CLAUDE_V2_1)
    }

    pub fn supports_tool_editor(&self) -> bool {
        self.editor_schema().is_some()
    }

    pub fn editor_schema(&self) -> Option<EditorSchema> {
        match self.base() {
            CLAUDE_V35_SONNET | CLAUDE_V35_SONNET_V2 => Some(EditorSchema::V20241022),
            CLAUDE_V37_SONNET => Some(EditorSchema::V20250124),
            _ if self.is_claude4() => Some(EditorSchema::V20250728),
            _ => None,
        }
    }

    fn is_claude4(&self) -> bool {
        matches!(
            self.base(),
            CLAUDE_V4_SONNET
                | CLAUDE_V4_OPUS
                | CLAUDE_V41_OPUS
                | CLAUDE_V45_SONNET
                | CLAUDE_V45_HAIKU
                | CLAUDE_V45_OPUS
                | CLAUDE_V46_OPUS
        )
    }
}

impl Default for ModelId {
    fn default() -> Self {
        Self::new(DEFAULT_MODEL_ID)
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ModelId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_strips_profile_prefix() {
        assert_eq!(
            ModelId::new("us.anthropic.claude-3-7-sonnet-20250219-v1:0").base(),
            CLAUDE_V37_SONNET
        );
        assert_eq!(
            ModelId::new("global.anthropic.claude-sonnet-4-5-20250929-v1:0").base(),
            CLAUDE_V45_SONNET
        );
        assert_eq!(ModelId::new(CLAUDE_V2).base(), CLAUDE_V2);
    }

    #[test]
    fn test_prefix_kept_on_wire() {
        let id = ModelId::new("eu.anthropic.claude-3-7-sonnet-20250219-v1:0");
        assert_eq!(id.as_str(), "eu.anthropic.claude-3-7-sonnet-20250219-v1:0");
        assert!(id.has_profile_prefix());
        assert!(!ModelId::new(CLAUDE_V37_SONNET).has_profile_prefix());
    }

    #[test]
    fn test_vision() {
        assert!(ModelId::new(CLAUDE_V3_SONNET).supports_vision());
        assert!(!ModelId::new(CLAUDE_V35_HAIKU).supports_vision());
        assert!(ModelId::new(CLAUDE_V45_OPUS).supports_vision());
        assert!(ModelId::new("anthropic.claude-opus-4-5-20251101-v1:0").supports_vision());
        assert!(ModelId::new(CLAUDE_V46_OPUS).supports_vision());
    }

    #[test]
    fn test_prompt_caching() {
        for id in [CLAUDE_V35_HAIKU, CLAUDE_V37_SONNET, CLAUDE_V4_SONNET, CLAUDE_V4_OPUS, CLAUDE_V45_HAIKU] {
            assert!(ModelId::new(id).supports_prompt_caching(), "{id}");
        }
        assert!(!ModelId::new(CLAUDE_V3_SONNET).supports_prompt_caching());
    }

    #[test]
    fn test_editor_schema_by_model_class() {
        assert_eq!(
            ModelId::new(CLAUDE_V35_SONNET_V2).editor_schema(),
            Some(EditorSchema::V20241022)
        );
        assert_eq!(
            ModelId::new("us.anthropic.claude-3-7-sonnet-20250219-v1:0").editor_schema(),
            Some(EditorSchema::V20250124)
        );
        assert_eq!(
            ModelId::new(CLAUDE_V4_SONNET).editor_schema(),
            Some(EditorSchema::V20250728)
        );
        assert_eq!(ModelId::new(CLAUDE_V3_HAIKU).editor_schema(), None);
        assert_eq!(EditorSchema::V20250728.tool_name(), "str_replace_based_edit_tool");
        assert_eq!(EditorSchema::V20250124.tool_name(), "str_replace_editor");
    }

    #[test]
    fn test_sampling_restrictions() {
        assert!(ModelId::new(CLAUDE_V45_SONNET).requires_temperature_xor_top_p());
        assert!(!ModelId::new(CLAUDE_V37_SONNET).requires_temperature_xor_top_p());
        assert!(!ModelId::new(CLAUDE_V2_1).supports_system_field());
        assert!(ModelId::new(CLAUDE_V3_HAIKU).supports_system_field());
    }
}
