use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::types::ScriptStepConfig;
use crate::error::{Result, ScriptError};

/// Built-in modules scripts may require (`*` or a comma separated list)
pub const ENV_ALLOW_BUILTIN: &str = "NODE_FUNCTION_ALLOW_BUILTIN";
/// External modules scripts may require (comma separated list)
pub const ENV_ALLOW_EXTERNAL: &str = "NODE_FUNCTION_ALLOW_EXTERNAL";
/// Log console output of non-manual executions
pub const ENV_ENABLE_STDOUT: &str = "CODE_ENABLE_STDOUT";
/// Route scripts through the task runner
pub const ENV_RUNNERS_ENABLED: &str = "SCRIPTSTEP_RUNNERS_ENABLED";

/// Get the default configuration file path
pub fn get_config_path() -> PathBuf {
    if let Some(proj_dirs) = directories::ProjectDirs::from("com", "scriptstep", "scriptstep") {
        proj_dirs.config_dir().join("config.toml")
    } else {
        dirs_fallback().join(".scriptstep").join("config.toml")
    }
}

fn dirs_fallback() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

/// Load configuration from file, then apply the process environment once.
pub fn load_config(config_path: Option<&Path>) -> Result<ScriptStepConfig> {
    let mut config = load_config_file(config_path)?;
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

/// Load configuration from file only, with defaults for missing values
pub fn load_config_file(config_path: Option<&Path>) -> Result<ScriptStepConfig> {
    let path = config_path
        .map(PathBuf::from)
        .unwrap_or_else(get_config_path);

    if !path.exists() {
        return Ok(ScriptStepConfig::default());
    }

    let content = std::fs::read_to_string(&path)?;
    let config: ScriptStepConfig =
        toml::from_str(&content).map_err(|e| ScriptError::TomlParse(e.to_string()))?;

    debug!(path = %path.display(), "Loaded configuration file");
    Ok(config)
}

/// Overlay environment settings on a loaded configuration.
///
/// `lookup` is consulted once per known variable; an unset variable leaves the
/// file value alone.
pub fn apply_env_overrides<F>(config: &mut ScriptStepConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(value) = lookup(ENV_ALLOW_BUILTIN) {
        config.modules.builtins = parse_module_list(&value);
    }

    if let Some(value) = lookup(ENV_ALLOW_EXTERNAL) {
        let modules = parse_module_list(&value);
        config.modules.externals = if modules.is_empty() {
            None
        } else {
            Some(modules)
        };
        config.modules.transitive = true;
    }

    if let Some(value) = lookup(ENV_ENABLE_STDOUT) {
        config.code.enable_stdout = parse_flag(&value);
    }

    if let Some(value) = lookup(ENV_RUNNERS_ENABLED) {
        config.code.runner.enabled = parse_flag(&value);
    }
}

/// Split a comma separated module list, dropping blanks.
pub fn parse_module_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes")
}
