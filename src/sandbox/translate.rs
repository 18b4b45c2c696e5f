//! Turning raw engine failures into user-facing execution errors.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::types::ExecutionMode;
use crate::error::ScriptError;

/// Lines the in-process wrapper places before the user's first line.
pub const WRAPPER_LINE_OFFSET: u32 = 1;

static STACK_LOCATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:<anonymous>|[\w.-]+\.js):(\d+):(\d+)").expect("valid regex")
});
static STACK_CODE_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Code:(\d+)").expect("valid regex"));
static MESSAGE_LOCATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*at line (\d+), col(?:umn)? (\d+)").expect("valid regex"));
static NOT_DEFINED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([\w$]+) is not defined$").expect("valid regex"));

/// A failure as reported by the engine or the task runner.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawScriptError {
    #[serde(default = "default_error_name")]
    pub name: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub stack: Option<String>,
    #[serde(default)]
    pub line: Option<u32>,
    #[serde(default)]
    pub column: Option<u32>,
}

fn default_error_name() -> String {
    "Error".to_string()
}

impl RawScriptError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            ..Default::default()
        }
    }

    /// Parse an engine message of the form `Name: details`.
    pub fn from_message(text: &str) -> Self {
        let text = text.trim();
        match text.split_once(": ") {
            Some((name, message)) if is_error_name(name) => Self::new(name, message),
            _ => Self::new("Error", text),
        }
    }
}

fn is_error_name(candidate: &str) -> bool {
    !candidate.is_empty() && candidate.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Relabels raw failures for one script.
#[derive(Debug, Clone)]
pub struct ErrorTranslator {
    mode: ExecutionMode,
    source: String,
    line_offset: u32,
}

impl ErrorTranslator {
    pub fn new(mode: ExecutionMode, source: impl Into<String>) -> Self {
        Self {
            mode,
            source: source.into(),
            line_offset: WRAPPER_LINE_OFFSET,
        }
    }

    /// Use a different wrapper offset, e.g. 0 for runners that report user lines.
    pub fn with_line_offset(mut self, offset: u32) -> Self {
        self.line_offset = offset;
        self
    }

    pub fn translate(&self, raw: &RawScriptError, item_index: Option<usize>) -> ScriptError {
        let (line, column) = self.locate(raw);

        let mut details = MESSAGE_LOCATION.replace(&raw.message, "").trim().to_string();
        if details.is_empty() {
            details = "Unknown error".to_string();
        }
        let details = self.with_hint(details);

        let message = match (line, item_index) {
            (Some(line), Some(item)) => format!("{details} [line {line}, for item {item}]"),
            (Some(line), None) => format!("{details} [line {line}]"),
            (None, _) => details,
        };

        ScriptError::Execution {
            message,
            description: (!raw.name.is_empty() && raw.name != "Error").then(|| raw.name.clone()),
            line_number: line,
            column,
            item_index,
        }
    }

    /// Location in the user's own source, if the failure carries one.
    fn locate(&self, raw: &RawScriptError) -> (Option<u32>, Option<u32>) {
        let (line, column) = match raw.line {
            Some(line) => (Some(line), raw.column),
            None => location_from_stack(raw.stack.as_deref())
                .or_else(|| location_from_message(&raw.message))
                .unwrap_or((None, None)),
        };

        let Some(line) = line else {
            return (None, None);
        };
        if line <= self.line_offset {
            return (None, None);
        }

        let user_lines = u32::try_from(self.source.lines().count().max(1)).unwrap_or(u32::MAX);
        let adjusted = (line - self.line_offset).min(user_lines);
        (Some(adjusted), column)
    }

    fn with_hint(&self, details: String) -> String {
        let Some(captures) = NOT_DEFINED.captures(&details) else {
            return details;
        };
        let name = &captures[1];

        let suggestion = match (self.mode, name) {
            (ExecutionMode::AllItems, "items") => "$input.all()",
            (ExecutionMode::AllItems, "item") => "$input.first()` / `$input.all()",
            (ExecutionMode::EachItem, "item") => "$input.item.json",
            (ExecutionMode::EachItem, "items") => "$input.item",
            _ => return details,
        };
        if self.declares(name) {
            return details;
        }

        format!("`{name}` is not defined. Did you mean `{suggestion}`?")
    }

    fn declares(&self, name: &str) -> bool {
        Regex::new(&format!(r"(let|const|var) +{} +=", regex::escape(name)))
            .map(|declaration| declaration.is_match(&self.source))
            .unwrap_or(false)
    }
}

fn location_from_stack(stack: Option<&str>) -> Option<(Option<u32>, Option<u32>)> {
    let stack = stack?;
    if let Some(captures) = STACK_LOCATION.captures(stack) {
        return Some((captures[1].parse().ok(), captures[2].parse().ok()));
    }
    STACK_CODE_LINE
        .captures(stack)
        .map(|captures| (captures[1].parse().ok(), None))
}

fn location_from_message(message: &str) -> Option<(Option<u32>, Option<u32>)> {
    MESSAGE_LOCATION
        .captures(message)
        .map(|captures| (captures[1].parse().ok(), captures[2].parse().ok()))
}
