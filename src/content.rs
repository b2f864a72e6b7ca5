//! First user message assembly
//!
//! Sections are appended in a fixed order:
//! 1. system prompt, only for models without a system field
//! 2. payload: clipboard, `--images`, then the classified stdin bytes
//! 3. user prefix (template `user` + command-line words)
//! 4. environment context when the text editor tool is on
//! 5. format instruction
//!
//! Also home to template placeholder handling (`{{.NAME}}`), the metaprompt
//! rewrite (`{$NAME}`) and `-v` variable parsing.

use regex::Regex;
use std::collections::BTreeMap;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::sync::OnceLock;

use crate::error::BodsError;
use crate::media::{self, Segment};
use crate::messages::{CacheControl, ContentBlock, Message};
use crate::models::ModelId;

pub const MARKDOWN_INSTRUCTION: &str = "Format the response as markdown without enclosing backticks.";
/// Sent in place of the markdown instruction so the section count stays fixed
pub const PLAIN_PLACEHOLDER: &str = " \n . \n ";
/// Prompt caching needs roughly 1024 tokens before a checkpoint pays off
pub const CACHE_MIN_BYTES: usize = 5120;

const FILE_SCHEME: &str = "file://";

// ═══════════════════════════════════════════════════════════════
// CONTENT BUILDER
// ═══════════════════════════════════════════════════════════════

pub struct ContentBuilder<'a> {
    model: &'a ModelId,
    system: Option<String>,
    attachments: Vec<ContentBlock>,
    payload: Vec<u8>,
    prefix: String,
    environment: Option<String>,
    format: bool,
}

impl<'a> ContentBuilder<'a> {
    pub fn new(model: &'a ModelId) -> Self {
        Self {
            model,
            system: None,
            attachments: Vec::new(),
            payload: Vec::new(),
            prefix: String::new(),
            environment: None,
            format: true,
        }
    }

    /// Inline system prompt; only set for models lacking a system field
    pub fn with_system(mut self, system: Option<String>) -> Self {
        self.system = system.filter(|s| !s.is_empty());
        self
    }

    /// Already classified blocks that precede the stdin payload
    pub fn with_attachments(mut self, blocks: Vec<ContentBlock>) -> Self {
        self.attachments = blocks;
        self
    }

    pub fn with_payload(mut self, bytes: Vec<u8>) -> Self {
        self.payload = bytes;
        self
    }

    pub fn with_prefix(mut self, prefix: String) -> Self {
        self.prefix = prefix;
        self
    }

    pub fn with_environment(mut self, context: Option<String>) -> Self {
        self.environment = context;
        self
    }

    pub fn with_format(mut self, format: bool) -> Self {
        self.format = format;
        self
    }

    pub fn build(self) -> Result<Message, BodsError> {
        let mut blocks = Vec::new();

        if let Some(system) = self.system {
            blocks.push(ContentBlock::text(system));
        }

        blocks.extend(self.attachments);
        blocks.extend(classify_payload(self.model, &self.payload)?);

        blocks.push(ContentBlock::text(self.prefix));

        if let Some(context) = self.environment {
            blocks.push(ContentBlock::text(context));
        }

        let format = if self.format {
            MARKDOWN_INSTRUCTION
        } else {
            PLAIN_PLACEHOLDER
        };
        blocks.push(ContentBlock::text(format));

        if self.model.supports_prompt_caching() {
            for block in &mut blocks {
                mark_cacheable(block);
            }
        }

        tracing::debug!("built first user message with {} content blocks", blocks.len());
        Ok(Message::user(blocks))
    }
}

fn mark_cacheable(block: &mut ContentBlock) {
    if let ContentBlock::Text { text, cache_control } = block {
        if text.len() > CACHE_MIN_BYTES {
            *cache_control = Some(CacheControl::ephemeral());
        }
    }
}

/// `{template user} {command-line prefix}`
pub fn user_prefix(user: &str, cli_prefix: &str) -> String {
    format!("{} {}", user, cli_prefix)
}

/// First message plus the optional assistant prefill
pub fn conversation(first: Message, assistant: Option<&str>) -> Vec<Message> {
    let mut messages = vec![first];
    if let Some(prefill) = assistant {
        messages.push(Message::assistant(vec![ContentBlock::text(prefill)]));
    }
    messages
}

// ═══════════════════════════════════════════════════════════════
// PAYLOAD CLASSIFICATION
// ═══════════════════════════════════════════════════════════════

/// Blocks for the stdin payload: one image, or text interleaved with documents
pub fn classify_payload(model: &ModelId, bytes: &[u8]) -> Result<Vec<ContentBlock>, BodsError> {
    if let Some(image) = image_block(model, bytes)? {
        return Ok(vec![image]);
    }

    let mut blocks = Vec::new();
    for segment in media::split_segments(bytes) {
        match segment {
            Segment::Pdf(pdf) => match media::validate_pdf(pdf) {
                Ok(()) => {
                    tracing::debug!("embedded PDF of {} bytes", pdf.len());
                    blocks.push(ContentBlock::document(pdf));
                }
                Err(e) => {
                    tracing::warn!("treating PDF slice as text: {}", e);
                    push_text(&mut blocks, pdf);
                }
            },
            Segment::Text(text) => match image_block(model, text)? {
                Some(image) => blocks.push(image),
                None => push_text(&mut blocks, text),
            },
        }
    }
    Ok(blocks)
}

fn image_block(model: &ModelId, bytes: &[u8]) -> Result<Option<ContentBlock>, BodsError> {
    if !media::is_image_mime(media::detect_mime(bytes)) {
        return Ok(None);
    }
    if !model.supports_vision() {
        return Err(no_vision(model));
    }
    let mime = media::check_image(bytes)?;
    Ok(Some(ContentBlock::image(mime, bytes)))
}

fn push_text(blocks: &mut Vec<ContentBlock>, bytes: &[u8]) {
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim();
    if !text.is_empty() {
        blocks.push(ContentBlock::text(text));
    }
}

pub fn no_vision(model: &ModelId) -> BodsError {
    BodsError::InputClassification(format!(
        "{}: model does not have vision capability that allows Claude to understand and analyze images",
        model
    ))
}

/// `file://a.png,file://b.jpg` into image blocks; other entries are skipped
pub fn parse_image_list(model: &ModelId, input: &str) -> Result<Vec<ContentBlock>, BodsError> {
    let mut blocks = Vec::new();
    for entry in input.split(',').map(str::trim) {
        let Some(path) = entry.strip_prefix(FILE_SCHEME) else {
            tracing::warn!("skipping image entry without file:// scheme: {}", entry);
            continue;
        };
        if !model.supports_vision() {
            return Err(no_vision(model));
        }
        let path = trim_quotes(path);
        tracing::debug!("processing image {}", path);
        let bytes = read_input_file(Path::new(path))?;
        let mime = media::check_image(&bytes)
            .map_err(|e| BodsError::InputClassification(format!("{}: {}", path, e)))?;
        blocks.push(ContentBlock::image(mime, &bytes));
    }
    Ok(blocks)
}

fn read_input_file(path: &Path) -> Result<Vec<u8>, BodsError> {
    fs::read(path).map_err(|e| BodsError::InputClassification(format!("failed to read {}: {}", path.display(), e)))
}

fn trim_quotes(s: &str) -> &str {
    s.trim_matches('"').trim_matches('\'')
}

// ═══════════════════════════════════════════════════════════════
// ENVIRONMENT CONTEXT
// ═══════════════════════════════════════════════════════════════

/// What the model should know about the machine before editing files
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentContext {
    pub working_dir: String,
    pub is_git_repo: bool,
    pub platform: &'static str,
    pub date: chrono::NaiveDate,
}

impl EnvironmentContext {
    pub fn gather() -> Result<Self, BodsError> {
        let cwd = std::env::current_dir()
            .map_err(|e| BodsError::Config(format!("Error getting working directory: {}", e)))?;
        Ok(Self {
            is_git_repo: cwd.join(".git").exists(),
            working_dir: cwd.display().to_string(),
            platform: std::env::consts::OS,
            date: chrono::Local::now().date_naive(),
        })
    }

    pub fn render(&self) -> String {
        format!(
            "\nHere is useful information about the environment you are running in:\n\n<env>\n\
             Working directory: {}\n\
             Is directory a git repo: {}\n\
             Platform: {}\n\
             Today's date: {}\n\
             </env>\n\n",
            self.working_dir,
            if self.is_git_repo { "Yes" } else { "No" },
            self.platform,
            self.date.format("%-m/%-d/%Y"),
        )
    }
}

// ═══════════════════════════════════════════════════════════════
// TEMPLATES
// ═══════════════════════════════════════════════════════════════

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\.([a-zA-Z_]+)\}\}").unwrap())
}

fn metaprompt_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\$([A-Z_]+)\}").unwrap())
}

/// Distinct placeholder names in order of first appearance
pub fn placeholders(text: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for cap in placeholder_re().captures_iter(text) {
        let name = &cap[1];
        if !names.iter().any(|n| n == name) {
            names.push(name.to_string());
        }
    }
    names
}

/// Replace every `{{.NAME}}`; names without a value become empty
pub fn render(text: &str, values: &BTreeMap<String, String>) -> String {
    placeholder_re()
        .replace_all(text, |cap: &regex::Captures| values.get(&cap[1]).cloned().unwrap_or_default())
        .into_owned()
}

/// `{$TASK}` into `{{.TASK}}`
pub fn rewrite_metaprompt(text: &str) -> String {
    metaprompt_re()
        .replace_all(text, |cap: &regex::Captures| format!("{{{{.{}}}}}", cap[1].to_uppercase()))
        .into_owned()
}

/// `KEY=value,OTHER=file://path`; names uppercased, quotes trimmed, empty values dropped
pub fn parse_var_map(input: &str) -> Result<BTreeMap<String, String>, BodsError> {
    let mut vars = BTreeMap::new();
    for pair in input.split(',') {
        let Some((name, value)) = pair.split_once('=') else {
            continue;
        };
        let name = name.trim().to_uppercase();
        let value = value.trim();
        let value = match value.strip_prefix(FILE_SCHEME) {
            Some(path) => {
                let bytes = read_input_file(Path::new(trim_quotes(path)))?;
                String::from_utf8_lossy(&bytes).into_owned()
            }
            None => trim_quotes(value).to_string(),
        };
        if !value.is_empty() {
            vars.insert(name, value);
        }
    }
    Ok(vars)
}

/// Asks the user for a template value
pub trait VarPrompter {
    fn ask(&mut self, name: &str) -> Result<String, BodsError>;
}

/// Fill in every placeholder of `text` that `values` lacks, asking once per name
pub fn collect_values(
    text: &str,
    values: &mut BTreeMap<String, String>,
    prompter: &mut dyn VarPrompter,
) -> Result<(), BodsError> {
    for name in placeholders(text) {
        if values.contains_key(&name) {
            continue;
        }
        let value = prompter.ask(&name)?;
        values.insert(name, value);
    }
    Ok(())
}

/// Reads answers from the controlling terminal, since stdin is usually the payload
pub struct TtyPrompter;

impl VarPrompter for TtyPrompter {
    fn ask(&mut self, name: &str) -> Result<String, BodsError> {
        let failed = |e: std::io::Error| BodsError::Config(format!("text input failed: {}", e));
        let tty = fs::OpenOptions::new().read(true).write(true).open("/dev/tty").map_err(failed)?;

        let mut out = &tty;
        write!(out, "{} ", crossterm::style::Stylize::bold(format!("Input for {}:", name))).map_err(failed)?;
        out.flush().map_err(failed)?;

        let mut line = String::new();
        BufReader::new(&tty).read_line(&mut line).map_err(failed)?;
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }
}
