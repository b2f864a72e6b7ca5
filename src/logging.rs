//! Debug logging
//!
//! Silent unless `DEBUG` is set. Then every span and event goes to
//! `$TMPDIR/bods.log`, truncated at the start of each run, so stdout stays
//! clean for the response.

use anyhow::{Context, Result};
use std::fs::File;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

pub const DEBUG_ENV: &str = "DEBUG";
pub const LOG_FILE: &str = "bods.log";

pub fn log_path() -> PathBuf {
    std::env::temp_dir().join(LOG_FILE)
}

/// Install the file subscriber when `DEBUG` is set; returns the log path
pub fn init() -> Result<Option<PathBuf>> {
    if std::env::var_os(DEBUG_ENV).is_none() {
        return Ok(None);
    }
    let path = log_path();
    let file = File::create(&path).with_context(|| format!("Failed to create {}", path.display()))?;
    install(file)?;

    eprintln!("DEBUG logging to file {}", path.display());
    tracing::debug!("bods {} starting", env!("CARGO_PKG_VERSION"));
    Ok(Some(path))
}

/// Fails when a global subscriber is already set
fn install(file: File) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("bods=debug,info"))
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!(e))
        .context("Failed to install the log subscriber")
}
