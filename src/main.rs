//! bods - stream Claude responses from Amazon Bedrock into the terminal
//!
//! USAGE:
//!   cat notes.md | bods "Summarize"         # stdin plus prompt prefix
//!   bods -p translate -v language=German    # prompt template from bods.yaml
//!   bods -e "Fix the typo in /tmp/a.txt"    # let the model edit files
//!   bods -S                                 # print the prompt templates

use clap::Parser;
use std::collections::BTreeMap;
use std::io::{self, IsTerminal, Write};
use std::process::ExitCode;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

use bods::cli::{self, Cli};
use bods::client::BedrockClient;
use bods::config::{self, ConfigSource, PromptConfig, Settings};
use bods::content::{self, ContentBuilder, EnvironmentContext, TtyPrompter};
use bods::controller::Controller;
use bods::error::BodsError;
use bods::profile::{ProfileCache, ProfileResolver};
use bods::render::{self, TerminalRenderer};
use bods::{logging, pasteboard};

const DUMP_PROMPT_ENV: &str = "DUMP_PROMPT";

// ═══════════════════════════════════════════════════════════════
// MAIN
// ═══════════════════════════════════════════════════════════════

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    let completion_enabled = std::env::var(cli::COMPLETION_ENV).is_ok_and(|v| v == "1");
    if let Some(request) = cli::completion_request(&args, completion_enabled) {
        return run_completion(request);
    }

    if let Err(e) = logging::init() {
        eprintln!("Warning: debug logging disabled: {:#}", e);
    }

    let cli = Cli::parse();

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            render::print_error(&e);
            ExitCode::FAILURE
        }
    }
}

fn run_completion(request: Result<clap_complete::Shell, String>) -> ExitCode {
    let shell = match request {
        Ok(shell) => shell,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    let templates: Vec<String> = PromptConfig::load()
        .map(|c| c.names().map(str::to_string).collect())
        .unwrap_or_default();
    cli::write_completion(shell, &templates, &mut io::stdout());
    ExitCode::SUCCESS
}

// ═══════════════════════════════════════════════════════════════
// RUN
// ═══════════════════════════════════════════════════════════════

async fn run(cli: Cli) -> Result<(), BodsError> {
    let prompts = PromptConfig::load().map_err(|e| BodsError::Config(format!("{:#}", e)))?;
    if cli.show_config {
        return print_config(&prompts);
    }

    let template = cli.prompt.as_deref().filter(|p| !p.is_empty()).map(|name| prompts.template(name)).transpose()?;
    let settings = Settings::resolve(template, &cli.overrides())?;

    let stdin = read_stdin().await?;
    let prefix = cli.prefix();
    if stdin.is_empty() && prefix.trim().is_empty() && !cli.pasteboard() && cli.images.is_none() && template.is_none() {
        tracing::debug!("nothing to send");
        return Ok(());
    }

    let mut values = match cli.variables.as_deref() {
        Some(raw) => content::parse_var_map(raw)?,
        None => BTreeMap::new(),
    };
    let user = fill_template(&settings.user_template, &mut values)?;
    let payload = if cli.metaprompt {
        let rewritten = content::rewrite_metaprompt(&String::from_utf8_lossy(&stdin));
        fill_template(&rewritten, &mut values)?.into_bytes()
    } else {
        stdin
    };

    let mut attachments = Vec::new();
    if cli.pasteboard() {
        attachments.extend(pasteboard::read_blocks(&settings.model)?);
    }
    if let Some(images) = cli.images.as_deref().filter(|i| !i.is_empty()) {
        attachments.extend(content::parse_image_list(&settings.model, images)?);
    }

    let environment = if settings.text_editor {
        Some(EnvironmentContext::gather()?.render())
    } else {
        None
    };

    let first = ContentBuilder::new(&settings.model)
        .with_system(settings.inline_system.clone())
        .with_attachments(attachments)
        .with_payload(payload)
        .with_prefix(content::user_prefix(&user, &prefix))
        .with_environment(environment)
        .with_format(cli.format)
        .build()?;
    let mut conversation = content::conversation(first, settings.assistant.as_deref());

    if std::env::var_os(DUMP_PROMPT_ENV).is_some() {
        let body = serde_json::to_string_pretty(&settings.params.body(&conversation))
            .map_err(|e| BodsError::Config(format!("failed to serialize request: {}", e)))?;
        println!("{}", body);
        return Ok(());
    }

    let region = config::region();
    let client = BedrockClient::new(&region, config::get_api_key()?, config::endpoint_override().as_deref())?;

    let model = if cli.cross_region {
        let cache = ProfileCache::default_location()
            .map_err(|e| tracing::warn!("profile cache unavailable: {:#}", e))
            .ok();
        ProfileResolver::new(&client, cache).resolve(&settings.model, &region).await
    } else {
        settings.model.clone()
    };

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupted");
            on_interrupt.cancel();
        }
    });

    let mut controller = Controller::new(&client, model, settings.params)
        .with_format(cli.format)
        .with_cancellation(cancel)
        .with_tag_extraction(cli.tag.clone(), ".");
    let mut renderer = TerminalRenderer::stdout();
    controller.run(&mut conversation, &mut renderer).await?;
    Ok(())
}

async fn read_stdin() -> Result<Vec<u8>, BodsError> {
    if io::stdin().is_terminal() {
        return Ok(Vec::new());
    }
    let mut bytes = Vec::new();
    tokio::io::stdin()
        .read_to_end(&mut bytes)
        .await
        .map_err(|e| BodsError::InputClassification(format!("unable to read from stdin: {}", e)))?;
    tracing::debug!("read {} bytes from stdin", bytes.len());
    Ok(bytes)
}

/// Ask for missing placeholder values, then substitute them
fn fill_template(text: &str, values: &mut BTreeMap<String, String>) -> Result<String, BodsError> {
    if text.is_empty() {
        return Ok(String::new());
    }
    content::collect_values(text, values, &mut TtyPrompter)?;
    Ok(content::render(text, values))
}

fn print_config(prompts: &PromptConfig) -> Result<(), BodsError> {
    let failed = |e: io::Error| BodsError::Output(format!("failed to print config: {}", e));
    let mut out = io::stdout().lock();
    if out.is_terminal() {
        match &prompts.source {
            ConfigSource::Embedded => {
                writeln!(out, "Embedded bods.yaml will be used and printed unless own config file exists.")
                    .map_err(failed)?;
                if let Ok(path) = config::config_path() {
                    writeln!(
                        out,
                        "Config file path to replace embedded bods.yaml with own config: '{}'",
                        path.display()
                    )
                    .map_err(failed)?;
                }
            }
            ConfigSource::File(path) => {
                writeln!(out, "Config file in use: '{}'", path.display()).map_err(failed)?;
            }
        }
        writeln!(out).map_err(failed)?;
    }
    out.write_all(prompts.raw.as_bytes()).map_err(failed)?;
    out.flush().map_err(failed)
}
