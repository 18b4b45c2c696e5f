use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptStepConfig {
    pub code: CodeConfig,
    pub modules: ModulesConfig,
    pub limits: LimitsConfig,
}

/// The scripting language a code step is written in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "camelCase")]
pub enum ScriptLanguage {
    /// JavaScript, executed in-process or by the task runner
    #[default]
    #[value(name = "javascript")]
    JavaScript,
    /// Legacy Python, served by the task runner
    Python,
    /// Native Python, task runner only
    #[value(name = "python-native")]
    PythonNative,
}

impl fmt::Display for ScriptLanguage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::JavaScript => write!(f, "JavaScript"),
            Self::Python => write!(f, "Python"),
            Self::PythonNative => write!(f, "Python (native)"),
        }
    }
}

/// Whether a script runs once for the whole batch or once per item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
pub enum ExecutionMode {
    #[default]
    #[serde(rename = "runOnceForAllItems")]
    AllItems,
    #[serde(rename = "runOnceForEachItem")]
    EachItem,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AllItems => write!(f, "Run Once for All Items"),
            Self::EachItem => write!(f, "Run Once for Each Item"),
        }
    }
}

/// Where a script is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunnerKind {
    InProcess,
    TaskRunner,
}

/// Why the out-of-process runner cannot serve a language.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerUnavailableReason {
    RunnerDisabled,
    NotConfigured,
    Python3Missing,
    VenvMissing,
}

impl fmt::Display for RunnerUnavailableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RunnerDisabled => write!(f, "task runners are disabled"),
            Self::NotConfigured => write!(f, "no task runner client is configured"),
            Self::Python3Missing => write!(f, "Python 3 is missing from this system"),
            Self::VenvMissing => write!(f, "the runner's virtual environment is missing"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CodeConfig {
    /// Languages code steps may use at all
    pub enabled_languages: Vec<ScriptLanguage>,
    /// Log console output of non-manual executions
    pub enable_stdout: bool,
    /// Top-level keys that make an object an item rather than item data
    pub reserved_item_keys: Vec<String>,
    /// Out-of-process task runner settings
    pub runner: RunnerConfig,
}

impl Default for CodeConfig {
    fn default() -> Self {
        Self {
            enabled_languages: vec![
                ScriptLanguage::JavaScript,
                ScriptLanguage::Python,
                ScriptLanguage::PythonNative,
            ],
            enable_stdout: false,
            reserved_item_keys: vec![
                "json".to_string(),
                "binary".to_string(),
                "pairedItem".to_string(),
            ],
            runner: RunnerConfig::default(),
        }
    }
}

impl CodeConfig {
    pub fn is_enabled(&self, language: ScriptLanguage) -> bool {
        self.enabled_languages.contains(&language)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Route JavaScript through the task runner when a client is available
    pub enabled: bool,
    /// Allow the native Python runner
    pub python_native_enabled: bool,
    /// Reported by the host when the Python runner cannot start
    pub python_unavailable_reason: Option<RunnerUnavailableReason>,
    /// Timeout the runner applies per task, in seconds
    pub timeout_seconds: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            python_native_enabled: false,
            python_unavailable_reason: None,
            timeout_seconds: 300,
        }
    }
}

/// Module allow-lists for `require` inside in-process scripts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModulesConfig {
    /// Built-in modules scripts may require, `*` for all
    pub builtins: Vec<String>,
    /// External modules scripts may require, `None` disables external modules
    pub externals: Option<Vec<String>>,
    /// Let allowed external modules require further modules
    pub transitive: bool,
    /// Directory holding external modules as `<name>.js` files
    pub directory: Option<PathBuf>,
}

impl Default for ModulesConfig {
    fn default() -> Self {
        Self {
            builtins: Vec::new(),
            externals: None,
            transitive: true,
            directory: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Wall-clock limit for one in-process script call, in milliseconds
    pub timeout_ms: u64,
    /// Loop iterations allowed per script call
    pub loop_iteration_limit: u64,
    /// Maximum call depth
    pub recursion_limit: usize,
    /// Promise jobs (`then` callbacks, `await` resumptions) allowed per script call
    pub promise_job_limit: u64,
    /// Maximum script size in bytes
    pub max_code_bytes: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            loop_iteration_limit: 50_000_000,
            recursion_limit: 512,
            promise_job_limit: 1_000_000,
            max_code_bytes: 1_000_000,
        }
    }
}

impl LimitsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}
