//! Text editor tool
//!
//! Executes the model's `view`, `create`, `str_replace`, `insert` and
//! `undo_edit` calls against the local filesystem. Every mutating command
//! pushes the previous contents onto a per-path stack so `undo_edit` can walk
//! edits back one at a time. History lives for one process.

use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

use crate::messages::ToolDefinition;
use crate::models::ModelId;

/// Lines of context shown around an edit
const SNIPPET_LINES: usize = 4;

// ═══════════════════════════════════════════════════════════════
// ERRORS
// ═══════════════════════════════════════════════════════════════

/// Failures reported back to the model as `is_error` tool results
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("the path {} is not an absolute path, it should start with '/'", .0.display())]
    NotAbsolute(PathBuf),

    #[error("the path {} does not exist. Please provide a valid path", .0.display())]
    NotFound(PathBuf),

    #[error("file already exists at: {}. Cannot overwrite files using command 'create'", .0.display())]
    AlreadyExists(PathBuf),

    #[error("the path {} is a directory and only the 'view' command can be used on directories", .0.display())]
    IsDirectory(PathBuf),

    #[error("invalid tool call: {0}")]
    InvalidCall(String),

    /// A well-formed call the file contents cannot satisfy
    #[error("{0}")]
    Rejected(String),

    #[error("ran into {source} while trying to {action} {path}")]
    Io {
        action: &'static str,
        path: String,
        source: std::io::Error,
    },
}

impl ToolError {
    fn io(action: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            action,
            path: path.display().to_string(),
            source,
        }
    }
}

// ═══════════════════════════════════════════════════════════════
// CALLS
// ═══════════════════════════════════════════════════════════════

/// One decoded `tool_use` input
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ToolCall {
    View {
        path: PathBuf,
        #[serde(default)]
        view_range: Option<Vec<i64>>,
    },
    Create {
        path: PathBuf,
        file_text: String,
    },
    StrReplace {
        path: PathBuf,
        old_str: String,
        #[serde(default)]
        new_str: String,
    },
    /// Claude 4 sends `insert_text`, older schemas send `new_str`
    Insert {
        path: PathBuf,
        insert_line: i64,
        #[serde(alias = "insert_text")]
        new_str: String,
    },
    UndoEdit {
        path: PathBuf,
    },
}

impl ToolCall {
    pub fn from_input(input: &Value) -> Result<Self, ToolError> {
        Self::deserialize(input).map_err(|e| ToolError::InvalidCall(e.to_string()))
    }

    pub fn path(&self) -> &Path {
        match self {
            Self::View { path, .. }
            | Self::Create { path, .. }
            | Self::StrReplace { path, .. }
            | Self::Insert { path, .. }
            | Self::UndoEdit { path } => path,
        }
    }

    pub fn command(&self) -> &'static str {
        match self {
            Self::View { .. } => "view",
            Self::Create { .. } => "create",
            Self::StrReplace { .. } => "str_replace",
            Self::Insert { .. } => "insert",
            Self::UndoEdit { .. } => "undo_edit",
        }
    }
}

/// Tool declaration matching the model's editor schema, if it has one
pub fn tool_definition(model: &ModelId) -> Option<ToolDefinition> {
    model.editor_schema().map(ToolDefinition::text_editor)
}

// ═══════════════════════════════════════════════════════════════
// EDITOR
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
pub struct FileEditor {
    history: HashMap<PathBuf, Vec<String>>,
}

impl FileEditor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run a raw `tool_use` input and shape the outcome as tool-result content
    pub fn handle(&mut self, input: &Value) -> (String, bool) {
        match ToolCall::from_input(input).and_then(|call| self.execute(&call)) {
            Ok(output) => (output, false),
            Err(e) => {
                tracing::warn!("text editor call failed: {}", e);
                (format!("Error: {}", e), true)
            }
        }
    }

    pub fn execute(&mut self, call: &ToolCall) -> Result<String, ToolError> {
        let path = call.path();
        tracing::debug!(command = call.command(), path = %path.display(), "text editor");
        validate_path(call, path)?;

        match call {
            ToolCall::View { view_range, .. } => view(path, view_range.as_deref()),
            ToolCall::Create { file_text, .. } => self.create(path, file_text),
            ToolCall::StrReplace { old_str, new_str, .. } => self.str_replace(path, old_str, new_str),
            ToolCall::Insert {
                insert_line, new_str, ..
            } => self.insert(path, *insert_line, new_str),
            ToolCall::UndoEdit { .. } => self.undo_edit(path),
        }
    }

    /// Number of undo snapshots held for `path`
    pub fn history_len(&self, path: &Path) -> usize {
        self.history.get(path).map_or(0, Vec::len)
    }

    fn push_history(&mut self, path: &Path, contents: String) {
        self.history.entry(path.to_path_buf()).or_default().push(contents);
    }

    fn create(&mut self, path: &Path, file_text: &str) -> Result<String, ToolError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ToolError::io("create", parent, e))?;
        }
        write_file(path, file_text)?;
        self.push_history(path, file_text.to_string());
        Ok(format!("File created successfully at: {}", path.display()))
    }

    fn str_replace(&mut self, path: &Path, old_str: &str, new_str: &str) -> Result<String, ToolError> {
        if old_str.is_empty() {
            return Err(ToolError::Rejected(
                "parameter `old_str` must not be empty for command: str_replace".to_string(),
            ));
        }
        let contents = read_file(path)?;

        let offsets: Vec<usize> = contents.match_indices(old_str).map(|(i, _)| i).collect();
        match offsets.as_slice() {
            [] => {
                return Err(ToolError::Rejected(format!(
                    "No replacement was performed, old_str `{}` did not appear verbatim in {}",
                    old_str,
                    path.display()
                )))
            }
            [_] => {}
            many => {
                let lines: Vec<usize> = many.iter().map(|&i| line_of(&contents, i) + 1).collect();
                return Err(ToolError::Rejected(format!(
                    "No replacement was performed. Multiple occurrences of old_str `{}` in lines {:?}. Please ensure it is unique",
                    old_str, lines
                )));
            }
        }

        let updated = contents.replacen(old_str, new_str, 1);
        write_file(path, &updated)?;

        let replaced_at = line_of(&contents, offsets[0]);
        self.push_history(path, contents);

        let lines: Vec<&str> = updated.split('\n').collect();
        let start = replaced_at.saturating_sub(SNIPPET_LINES);
        let end = (replaced_at + SNIPPET_LINES + new_str.matches('\n').count()).min(lines.len() - 1);
        let snippet = lines[start..=end].join("\n");

        Ok(format!(
            "The file {} has been edited.\n{}Review the changes and make sure they are as expected. Edit the file again if necessary.",
            path.display(),
            numbered(&snippet, &format!("a snippet of {}", path.display()), start + 1)
        ))
    }

    fn insert(&mut self, path: &Path, insert_line: i64, text: &str) -> Result<String, ToolError> {
        let contents = read_file(path)?;
        let lines: Vec<&str> = contents.split('\n').collect();

        let at = usize::try_from(insert_line)
            .ok()
            .filter(|&n| n <= lines.len())
            .ok_or_else(|| {
                ToolError::Rejected(format!(
                    "invalid 'insert_line' parameter: {}. It should be within the range of lines of the file: [0, {}]",
                    insert_line,
                    lines.len()
                ))
            })?;

        let new_lines: Vec<&str> = text.split('\n').collect();
        let mut result = Vec::with_capacity(lines.len() + new_lines.len());
        result.extend_from_slice(&lines[..at]);
        result.extend_from_slice(&new_lines);
        result.extend_from_slice(&lines[at..]);

        let updated = result.join("\n");
        write_file(path, &updated)?;

        let start = at.saturating_sub(SNIPPET_LINES);
        let end = (at + new_lines.len() + SNIPPET_LINES).min(result.len());
        let snippet = result[start..end].join("\n");
        let message = format!(
            "The file {} has been edited.\n{}Review the changes and make sure they are as expected (correct indentation, no duplicate lines, etc). Edit the file again if necessary.",
            path.display(),
            numbered(&snippet, "a snippet of the edited file", start + 1)
        );

        self.push_history(path, contents);
        Ok(message)
    }

    fn undo_edit(&mut self, path: &Path) -> Result<String, ToolError> {
        let previous = self
            .history
            .get_mut(path)
            .and_then(Vec::pop)
            .ok_or_else(|| ToolError::Rejected(format!("No edit history found for {}", path.display())))?;

        write_file(path, &previous)?;
        Ok(format!(
            "Last edit to {} undone successfully.\n{}",
            path.display(),
            numbered(&previous, &path.display().to_string(), 1)
        ))
    }
}

// ═══════════════════════════════════════════════════════════════
// HELPERS
// ═══════════════════════════════════════════════════════════════

fn validate_path(call: &ToolCall, path: &Path) -> Result<(), ToolError> {
    if !path.is_absolute() {
        return Err(ToolError::NotAbsolute(path.to_path_buf()));
    }

    let creating = matches!(call, ToolCall::Create { .. });
    match std::fs::metadata(path) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            if creating {
                Ok(())
            } else {
                Err(ToolError::NotFound(path.to_path_buf()))
            }
        }
        Err(e) => Err(ToolError::io("stat", path, e)),
        Ok(_) if creating => Err(ToolError::AlreadyExists(path.to_path_buf())),
        Ok(meta) if meta.is_dir() && !matches!(call, ToolCall::View { .. }) => {
            Err(ToolError::IsDirectory(path.to_path_buf()))
        }
        Ok(_) => Ok(()),
    }
}

fn view(path: &Path, view_range: Option<&[i64]>) -> Result<String, ToolError> {
    if path.is_dir() {
        if view_range.is_some() {
            return Err(ToolError::Rejected(
                "the 'view_range' parameter is not allowed when 'path' points to a directory".to_string(),
            ));
        }
        return Ok(format!(
            "Here's the files and directories up to 2 levels deep in {}, excluding hidden items:\n{}\n",
            path.display(),
            list_directory(path)
        ));
    }

    let contents = read_file(path)?;
    let Some(range) = view_range else {
        return Ok(numbered(&contents, &path.display().to_string(), 1));
    };

    let [first, last] = range else {
        return Err(ToolError::Rejected(
            "invalid 'view_range'. It should be a list of two integers".to_string(),
        ));
    };
    let (first, last) = (*first, *last);
    let lines: Vec<&str> = contents.split('\n').collect();
    let count = lines.len() as i64;

    if first < 1 || first > count {
        return Err(ToolError::Rejected(format!(
            "invalid 'view_range': {:?}. Its first element '{}' should be within the range of lines of the file: [1, {}]",
            range, first, count
        )));
    }
    if last > count {
        return Err(ToolError::Rejected(format!(
            "invalid 'view_range': {:?}. Its second element '{}' should be smaller than the number of lines in the file: '{}'",
            range, last, count
        )));
    }
    if last != -1 && last < first {
        return Err(ToolError::Rejected(format!(
            "invalid 'view_range': {:?}. Its second element '{}' should be larger or equal than its first '{}'",
            range, last, first
        )));
    }

    let start = (first - 1) as usize;
    let end = if last == -1 { lines.len() } else { last as usize };
    Ok(numbered(&lines[start..end].join("\n"), &path.display().to_string(), start + 1))
}

/// Non-hidden entries up to two levels below `root`, root first
fn list_directory(root: &Path) -> String {
    WalkDir::new(root)
        .max_depth(2)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.'))
        .filter_map(|e| e.ok())
        .map(|e| e.path().display().to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

/// `cat -n` style rendering starting at `first_line`
fn numbered(contents: &str, descriptor: &str, first_line: usize) -> String {
    let body = contents
        .split('\n')
        .enumerate()
        .map(|(i, line)| format!("{:6}\t{}", first_line + i, line))
        .collect::<Vec<_>>()
        .join("\n");
    format!("Here's the result of running `cat -n` on {}:\n{}\n", descriptor, body)
}

/// Zero-based line containing byte offset `at`
fn line_of(contents: &str, at: usize) -> usize {
    contents[..at].matches('\n').count()
}

fn read_file(path: &Path) -> Result<String, ToolError> {
    std::fs::read_to_string(path).map_err(|e| ToolError::io("read", path, e))
}

fn write_file(path: &Path, contents: &str) -> Result<(), ToolError> {
    std::fs::write(path, contents).map_err(|e| ToolError::io("write to", path, e))
}

// ═══════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════
