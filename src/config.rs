//! Configuration with XDG paths
//!
//! ~/.config/bods/bods.yaml - prompt templates (replaces the embedded defaults)
//! ~/.cache/bods/cache.db   - inference profile cache
//!
//! Credentials and region come from the environment, the same variables the
//! AWS tooling reads.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use crate::error::BodsError;
use crate::messages::{InferenceParameters, ThinkingConfig, DEFAULT_THINKING_TOKENS, MIN_THINKING_TOKENS};
use crate::models::ModelId;

const APP_NAME: &str = "bods";
const CONFIG_FILE: &str = "bods.yaml";

/// Templates shipped with the binary
pub const EMBEDDED_CONFIG: &str = include_str!("bods.yaml");

pub const DEFAULT_REGION: &str = "us-east-1";
pub const API_KEY_ENV: &str = "AWS_BEARER_TOKEN_BEDROCK";
pub const ENDPOINT_ENV: &str = "BODS_ENDPOINT_URL";

/// Get config directory (~/.config/bods/)
pub fn config_dir() -> Result<PathBuf> {
    let base = dirs::config_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
        .context("Could not determine config directory")?;
    Ok(base.join(APP_NAME))
}

/// Get cache directory (~/.cache/bods/)
pub fn cache_dir() -> Result<PathBuf> {
    let base = dirs::cache_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".cache")))
        .context("Could not determine cache directory")?;
    Ok(base.join(APP_NAME))
}

/// Get prompt template file path
pub fn config_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE))
}

// ═══════════════════════════════════════════════════════════════
// PROMPT TEMPLATES
// ═══════════════════════════════════════════════════════════════

/// One named entry under `prompts:`
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PromptTemplate {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub top_k: Option<u32>,
    #[serde(default)]
    pub system: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub assistant: Option<String>,
    #[serde(default)]
    pub thinking: bool,
    #[serde(default)]
    pub budget_tokens: Option<u32>,
    #[serde(default)]
    pub text_editor: bool,
}

#[derive(Debug, Default, Deserialize)]
struct PromptFile {
    #[serde(default)]
    prompts: BTreeMap<String, PromptTemplate>,
}

/// Where the active templates were read from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    Embedded,
    File(PathBuf),
}

/// Parsed template file plus its raw text for `--show-config`
#[derive(Debug)]
pub struct PromptConfig {
    pub source: ConfigSource,
    pub raw: String,
    prompts: BTreeMap<String, PromptTemplate>,
}

impl PromptConfig {
    /// Load the user's bods.yaml if present, else the embedded defaults
    pub fn load() -> Result<Self> {
        let path = config_path()?;
        if path.exists() {
            tracing::debug!("replacing embedded bods.yaml with {}", path.display());
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            Self::parse(raw, ConfigSource::File(path))
        } else {
            Self::embedded()
        }
    }

    pub fn embedded() -> Result<Self> {
        Self::parse(EMBEDDED_CONFIG.to_string(), ConfigSource::Embedded)
    }

    pub fn parse(raw: String, source: ConfigSource) -> Result<Self> {
        let file: PromptFile = if raw.trim().is_empty() {
            PromptFile::default()
        } else {
            serde_yaml::from_str(&raw).with_context(|| match &source {
                ConfigSource::File(path) => format!("Failed to parse {}", path.display()),
                ConfigSource::Embedded => "Failed to parse embedded bods.yaml".to_string(),
            })?
        };
        for name in file.prompts.keys() {
            tracing::debug!("adding prompt from config: {}", name);
        }
        Ok(Self {
            source,
            raw,
            prompts: file.prompts,
        })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.prompts.keys().map(String::as_str)
    }

    pub fn template(&self, name: &str) -> Result<&PromptTemplate, BodsError> {
        self.prompts.get(name).ok_or_else(|| {
            let known: Vec<&str> = self.names().collect();
            BodsError::Config(format!(
                "prompt template '{}' not found (available: {})",
                name,
                known.join(", ")
            ))
        })
    }
}

// ═══════════════════════════════════════════════════════════════
// ENVIRONMENT
// ═══════════════════════════════════════════════════════════════

/// `AWS_REGION`, then `AWS_DEFAULT_REGION`, then us-east-1
pub fn region() -> String {
    region_from(|name| std::env::var(name).ok())
}

pub fn region_from(lookup: impl Fn(&str) -> Option<String>) -> String {
    ["AWS_REGION", "AWS_DEFAULT_REGION"]
        .iter()
        .filter_map(|name| lookup(name))
        .find(|value| !value.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_REGION.to_string())
}

/// Bedrock API key, sent as a bearer token
pub fn get_api_key() -> Result<String, BodsError> {
    match std::env::var(API_KEY_ENV) {
        Ok(key) if !key.trim().is_empty() => Ok(key),
        _ => Err(BodsError::Config(format!(
            "No Bedrock API key configured. Set {} to a Bedrock API key.",
            API_KEY_ENV
        ))),
    }
}

pub fn endpoint_override() -> Option<String> {
    std::env::var(ENDPOINT_ENV).ok().filter(|url| !url.trim().is_empty())
}

// ═══════════════════════════════════════════════════════════════
// SETTINGS RESOLUTION
// ═══════════════════════════════════════════════════════════════

/// Values given on the command line; each wins over the template
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub model: Option<String>,
    pub system: Option<String>,
    pub assistant: Option<String>,
    pub max_tokens: Option<u32>,
    pub think: bool,
    pub budget_tokens: Option<u32>,
    pub text_editor: bool,
}

/// Everything one invocation needs besides the content itself
#[derive(Debug, Clone)]
pub struct Settings {
    pub model: ModelId,
    pub params: InferenceParameters,
    /// System prompt for models without a system field, sent as the first block
    pub inline_system: Option<String>,
    /// Assistant prefill, trailing newline removed
    pub assistant: Option<String>,
    /// Template `user` text before placeholder substitution
    pub user_template: String,
    pub text_editor: bool,
}

impl Settings {
    pub fn resolve(template: Option<&PromptTemplate>, overrides: &Overrides) -> Result<Self, BodsError> {
        let empty = PromptTemplate::default();
        let template = template.unwrap_or(&empty);

        let model = overrides
            .model
            .clone()
            .or_else(|| template.model_id.clone())
            .filter(|id| !id.trim().is_empty())
            .map(ModelId::new)
            .unwrap_or_default();
        tracing::debug!("model set to {}", model);

        let mut params = InferenceParameters::default();

        let system = overrides
            .system
            .clone()
            .or_else(|| template.system.clone())
            .filter(|s| !s.is_empty());
        let inline_system = if model.supports_system_field() {
            params.system = system;
            None
        } else {
            system
        };

        if let Some(max_tokens) = overrides.max_tokens.or(template.max_tokens) {
            params.max_tokens = max_tokens;
        }

        params.top_k = template.top_k;
        match (template.temperature, template.top_p) {
            (Some(t), Some(p)) if model.requires_temperature_xor_top_p() => {
                return Err(BodsError::ParameterConflict(format!(
                    "temperature {} and top_p {}: {} accepts only one of them",
                    t, p, model
                )));
            }
            (None, Some(p)) if model.requires_temperature_xor_top_p() => {
                tracing::info!("{} accepts only one of temperature and top_p; dropping top_p {}", model, p);
            }
            (t, p) => {
                params.top_p = p;
                if let Some(t) = t {
                    params.temperature = Some(t);
                }
            }
        }

        if overrides.think || template.thinking {
            if model.supports_thinking() {
                let budget = overrides
                    .budget_tokens
                    .or(template.budget_tokens)
                    .unwrap_or(DEFAULT_THINKING_TOKENS);
                check_thinking_budget(budget, params.max_tokens)?;
                params.thinking = Some(ThinkingConfig::Enabled { budget_tokens: budget });
                params.temperature = Some(1.0);
                params.top_p = None;
                params.top_k = None;
            } else {
                tracing::info!("thinking is not supported by {}, ignoring", model);
            }
        }

        let mut text_editor = false;
        if overrides.text_editor || template.text_editor {
            match model.editor_schema() {
                Some(schema) => {
                    params.tools.push(crate::messages::ToolDefinition::text_editor(schema));
                    if let Some(flag) = schema.beta_flag() {
                        params.anthropic_beta.push(flag.to_string());
                    }
                    text_editor = true;
                    tracing::debug!("enabled text editor tool {} for {}", schema.tool_type(), model);
                }
                None => tracing::info!("text editor tool is not supported by {}, ignoring", model),
            }
        }

        let assistant = overrides
            .assistant
            .clone()
            .or_else(|| template.assistant.clone())
            .map(|a| a.trim_end_matches('\n').to_string())
            .filter(|a| !a.is_empty());

        Ok(Self {
            model,
            params,
            inline_system,
            assistant,
            user_template: template.user.clone().unwrap_or_default(),
            text_editor,
        })
    }
}

fn check_thinking_budget(budget: u32, max_tokens: u32) -> Result<(), BodsError> {
    if budget < MIN_THINKING_TOKENS {
        return Err(BodsError::ParameterConflict(format!(
            "{} is less than the minimum budget tokens size of {} tokens. Anthropic suggests trying at least 4000 tokens to achieve more comprehensive and nuanced reasoning",
            budget, MIN_THINKING_TOKENS
        )));
    }
    if max_tokens <= budget {
        return Err(BodsError::ParameterConflict(format!(
            "{} <= {}: Thinking budget tokens must always be less than the max tokens",
            max_tokens, budget
        )));
    }
    Ok(())
}
