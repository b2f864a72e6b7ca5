//! Terminal output
//!
//! Response text goes to stdout as it streams in. Thinking is dimmed when
//! stdout is a terminal. Errors go to stderr as a header line and a detail
//! line.

use crossterm::style::Stylize;
use std::io::{self, IsTerminal, Write};

use crate::error::BodsError;
use crate::stream::DisplayDelta;

/// Receives display deltas in stream order
pub trait Renderer {
    fn delta(&mut self, delta: &DisplayDelta) -> io::Result<()>;

    /// Called once after the last delta of a successful run
    fn finish(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub struct TerminalRenderer<W: Write> {
    out: W,
    styled: bool,
    ends_with_newline: bool,
}

impl TerminalRenderer<io::Stdout> {
    pub fn stdout() -> Self {
        let styled = io::stdout().is_terminal();
        Self::new(io::stdout(), styled)
    }
}

impl<W: Write> TerminalRenderer<W> {
    pub fn new(out: W, styled: bool) -> Self {
        Self {
            out,
            styled,
            ends_with_newline: true,
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> Renderer for TerminalRenderer<W> {
    fn delta(&mut self, delta: &DisplayDelta) -> io::Result<()> {
        let text = match delta {
            DisplayDelta::Text(text) => {
                write!(self.out, "{}", text)?;
                text
            }
            DisplayDelta::Thinking(text) if self.styled => {
                write!(self.out, "{}", text.as_str().dim())?;
                text
            }
            DisplayDelta::Thinking(text) => {
                write!(self.out, "{}", text)?;
                text
            }
        };
        if !text.is_empty() {
            self.ends_with_newline = text.ends_with('\n');
        }
        self.out.flush()
    }

    fn finish(&mut self) -> io::Result<()> {
        if self.styled && !self.ends_with_newline {
            writeln!(self.out)?;
        }
        self.out.flush()
    }
}

// ═══════════════════════════════════════════════════════════════
// ERRORS
// ═══════════════════════════════════════════════════════════════

/// Two-line error report: styled header with the category, then the detail
pub fn format_error(err: &BodsError, styled: bool) -> String {
    let detail = err.to_string();
    if styled {
        format!(
            "\n  {} {}\n\n  {}\n\n",
            " ERROR ".white().on_red().bold(),
            err.reason(),
            detail.as_str().dark_grey()
        )
    } else {
        format!("\n  ERROR {}\n\n  {}\n\n", err.reason(), detail)
    }
}

pub fn print_error(err: &BodsError) {
    tracing::error!("{} reason: {}", err, err.reason());
    let stderr = io::stderr();
    let text = format_error(err, stderr.is_terminal());
    let _ = stderr.lock().write_all(text.as_bytes());
}
