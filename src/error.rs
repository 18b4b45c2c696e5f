use thiserror::Error;

use crate::config::types::{RunnerUnavailableReason, ScriptLanguage};

#[derive(Error, Debug)]
pub enum ScriptError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("TOML parse error: {0}")]
    TomlParse(String),

    #[error("{language} is not enabled for code steps")]
    LanguageDisabled { language: ScriptLanguage },

    #[error("The {language} task runner is unavailable: {reason}")]
    RunnerUnavailable {
        language: ScriptLanguage,
        reason: RunnerUnavailableReason,
    },

    // Script output errors
    #[error("{message}")]
    Validation {
        message: String,
        description: String,
        item_index: Option<usize>,
        line_number: Option<u32>,
    },

    #[error(
        "Invalid output format: an output item contains the reserved key '{key}' next to {}",
        .unknown_keys.iter().map(|k| format!("'{k}'")).collect::<Vec<_>>().join(", ")
    )]
    ReservedKeyFound {
        key: String,
        unknown_keys: Vec<String>,
        item_index: usize,
    },

    // Script execution errors
    #[error("{message}")]
    Execution {
        message: String,
        description: Option<String>,
        line_number: Option<u32>,
        column: Option<u32>,
        item_index: Option<usize>,
    },

    #[error("Script exceeded the time limit of {millis} ms")]
    Timeout { millis: u64 },

    #[error("Code is too large ({actual} bytes, limit is {max})")]
    CodeTooLarge { max: usize, actual: usize },

    #[error("Script engine failure: {0}")]
    Engine(String),

    #[error("Task runner error: {0}")]
    TaskRunner(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Generic wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ScriptError {
    pub fn validation(message: impl Into<String>, description: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            description: description.into(),
            item_index: None,
            line_number: None,
        }
    }

    /// Errors a step may turn into an error item under continue-on-failure.
    ///
    /// Configuration errors mean the step cannot run at all and always propagate.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Validation { .. }
                | Self::ReservedKeyFound { .. }
                | Self::Execution { .. }
                | Self::Timeout { .. }
                | Self::CodeTooLarge { .. }
                | Self::Engine(_)
                | Self::TaskRunner(_)
        )
    }

    pub fn item_index(&self) -> Option<usize> {
        match self {
            Self::Validation { item_index, .. } | Self::Execution { item_index, .. } => *item_index,
            Self::ReservedKeyFound { item_index, .. } => Some(*item_index),
            _ => None,
        }
    }

    /// Attach an item index unless the error already names one.
    pub fn at_item(mut self, index: Option<usize>) -> Self {
        match &mut self {
            Self::Validation { item_index, .. } | Self::Execution { item_index, .. } => {
                if item_index.is_none() {
                    *item_index = index;
                }
            }
            _ => {}
        }
        self
    }

    pub fn description(&self) -> Option<&str> {
        match self {
            Self::Validation { description, .. } => Some(description),
            Self::Execution { description, .. } => description.as_deref(),
            Self::ReservedKeyFound { .. } => Some(
                "To get around this, wrap each item in an object, under a key called `json`.",
            ),
            _ => None,
        }
    }

    pub fn line_number(&self) -> Option<u32> {
        match self {
            Self::Validation { line_number, .. } | Self::Execution { line_number, .. } => {
                *line_number
            }
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ScriptError>;
