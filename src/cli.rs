//! Command-line interface
//!
//! Free positional words form the prompt prefix; everything else is a flag.
//! Shell completion is generated on demand with
//! `__BODS_CMP_ENABLED=1 bods completion <shell>`.

use clap::builder::PossibleValuesParser;
use clap::{ArgAction, CommandFactory, Parser};
use clap_complete::Shell;
use std::io::Write;

use crate::config::Overrides;
use crate::models::KNOWN_MODEL_IDS;

pub const COMPLETION_ENV: &str = "__BODS_CMP_ENABLED";
pub const COMPLETION_COMMAND: &str = "completion";

#[derive(Debug, Parser)]
#[command(name = "bods", version)]
#[command(about = "Pipe text, images and PDFs to Claude on Amazon Bedrock and stream the answer")]
pub struct Cli {
    /// Prompt prefix, placed after the piped input
    #[arg(value_name = "PREFIX")]
    pub prefix: Vec<String>,

    /// Model id or inference profile id
    #[arg(short, long)]
    pub model: Option<String>,

    /// System prompt; replaces the template's system prompt
    #[arg(short, long)]
    pub system: Option<String>,

    /// Assistant prefill; replaces the template's assistant text
    #[arg(short, long)]
    pub assistant: Option<String>,

    /// Prompt template from bods.yaml
    #[arg(short, long = "prompt", value_name = "NAME")]
    pub prompt: Option<String>,

    /// Maximum number of tokens to generate (default 2048)
    #[arg(short = 't', long = "tokens")]
    pub max_tokens: Option<u32>,

    /// Ask for a markdown-formatted response
    #[arg(
        short,
        long,
        action = ArgAction::Set,
        num_args = 0..=1,
        require_equals = true,
        default_value_t = true,
        default_missing_value = "true",
        value_name = "BOOL"
    )]
    pub format: bool,

    /// Treat {$VARIABLE} placeholders in the input as template variables
    #[arg(short = 'r', long = "metaprompt-mode")]
    pub metaprompt: bool,

    /// Write the content of this XML tag from the response to <TAG>.txt
    #[arg(short = 'x', long = "tag-content", value_name = "TAG")]
    pub tag: Option<String>,

    /// Print the prompt templates in use and exit
    #[arg(short = 'S', long = "show-config")]
    pub show_config: bool,

    /// Template variable values, e.g. RUBRIC="developer",RESUME=file://cv.txt
    #[arg(short = 'v', long = "variable-input", value_name = "KEY=VALUE,...")]
    pub variables: Option<String>,

    /// Images to send, e.g. file://a.png,file://b.jpg
    #[arg(short = 'i', long = "images", value_name = "file://PATH,...")]
    pub images: Option<String>,

    /// Use a cross-region inference profile when one exists for the model
    #[arg(
        short = 'c',
        long = "cross-region-inference",
        action = ArgAction::Set,
        num_args = 0..=1,
        require_equals = true,
        default_value_t = true,
        default_missing_value = "true",
        value_name = "BOOL"
    )]
    pub cross_region: bool,

    /// Enable extended thinking (ignored by models without it)
    #[arg(short = 'k', long)]
    pub think: bool,

    /// Thinking budget in tokens (default 1024, minimum 1024)
    #[arg(short, long = "budget")]
    pub budget: Option<u32>,

    /// Let the model view and edit files with the text editor tool
    #[arg(short = 'e', long = "text-editor")]
    pub text_editor: bool,

    /// Add the clipboard content to the prompt
    #[cfg(target_os = "macos")]
    #[arg(short = 'P', long)]
    pub pasteboard: bool,
}

impl Cli {
    pub fn prefix(&self) -> String {
        self.prefix.join(" ")
    }

    pub fn pasteboard(&self) -> bool {
        #[cfg(target_os = "macos")]
        {
            self.pasteboard
        }
        #[cfg(not(target_os = "macos"))]
        {
            false
        }
    }

    pub fn overrides(&self) -> Overrides {
        Overrides {
            model: self.model.clone().filter(|m| !m.is_empty()),
            system: self.system.clone().filter(|s| !s.is_empty()),
            assistant: self.assistant.clone().filter(|a| !a.is_empty()),
            max_tokens: self.max_tokens.filter(|t| *t > 0),
            think: self.think,
            budget_tokens: self.budget.filter(|b| *b > 0),
            text_editor: self.text_editor,
        }
    }
}

// ═══════════════════════════════════════════════════════════════
// COMPLETION
// ═══════════════════════════════════════════════════════════════

/// Shell name when invoked as `bods completion <shell>` with completion enabled
pub fn completion_request(args: &[String], enabled: bool) -> Option<Result<Shell, String>> {
    if !enabled || args.get(1).map(String::as_str) != Some(COMPLETION_COMMAND) {
        return None;
    }
    let Some(name) = args.get(2) else {
        return Some(Err("usage: bods completion <bash|zsh|fish|elvish|powershell>".to_string()));
    };
    Some(name.parse::<Shell>().map_err(|e| format!("unknown shell {}: {}", name, e)))
}

/// Completion script offering known model ids and template names
pub fn write_completion(shell: Shell, templates: &[String], out: &mut dyn Write) {
    let mut cmd = Cli::command()
        .mut_arg("model", |arg| arg.value_parser(PossibleValuesParser::new(KNOWN_MODEL_IDS)))
        .mut_arg("prompt", |arg| arg.value_parser(PossibleValuesParser::new(templates.to_vec())));
    clap_complete::generate(shell, &mut cmd, "bods", out);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("bods").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_defaults() {
        let cli = parse(&[]);
        assert!(cli.format);
        assert!(cli.cross_region);
        assert!(!cli.think && !cli.text_editor && !cli.metaprompt && !cli.show_config);
        assert_eq!(cli.prefix(), "");
    }

    #[test]
    fn test_prefix_words_and_flags() {
        let cli = parse(&["-m", "anthropic.claude-v2", "Summarize", "this", "-t", "500", "please"]);
        assert_eq!(cli.prefix(), "Summarize this please");
        assert_eq!(cli.model.as_deref(), Some("anthropic.claude-v2"));
        assert_eq!(cli.max_tokens, Some(500));
    }

    #[test]
    fn test_optional_bool_flags() {
        let cli = parse(&["-f=false", "--cross-region-inference=false"]);
        assert!(!cli.format);
        assert!(!cli.cross_region);

        let cli = parse(&["-f", "explain"]);
        assert!(cli.format);
        assert_eq!(cli.prefix(), "explain");
    }

    #[test]
    fn test_overrides_drop_empty_values() {
        let cli = parse(&["-s", "", "-k", "-b", "2000", "-e", "-a", "<answer>"]);
        let overrides = cli.overrides();
        assert_eq!(overrides.system, None);
        assert_eq!(overrides.budget_tokens, Some(2000));
        assert_eq!(overrides.assistant.as_deref(), Some("<answer>"));
        assert!(overrides.think && overrides.text_editor);
    }

    #[test]
    fn test_completion_request() {
        let args: Vec<String> = ["bods", "completion", "zsh"].iter().map(|s| s.to_string()).collect();
        assert_eq!(completion_request(&args, true), Some(Ok(Shell::Zsh)));
        assert_eq!(completion_request(&args, false), None);
        let words: Vec<String> = ["bods", "completion", "of", "this"].iter().map(|s| s.to_string()).collect();
        assert!(completion_request(&words, false).is_none());
        assert!(matches!(completion_request(&args[..2], true), Some(Err(_))));
    }

    #[test]
    fn test_completion_script_lists_models() {
        let mut out = Vec::new();
        write_completion(Shell::Bash, &["summarize".to_string()], &mut out);
        let script = String::from_utf8(out).unwrap();
        assert!(script.contains("anthropic.claude-3-7-sonnet-20250219-v1:0"));
        assert!(script.contains("summarize"));
    }
}
