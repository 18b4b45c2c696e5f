use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::Value;
use std::path::PathBuf;

use crate::config::types::{ExecutionMode, ScriptLanguage};

#[derive(Parser, Debug)]
#[clap(name = "scriptstep")]
#[clap(version, about = "Run workflow code steps against pipeline items")]
#[clap(propagate_version = true)]
pub struct Cli {
    #[clap(flatten)]
    pub global_opts: GlobalOpts,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug)]
pub struct GlobalOpts {
    /// Configuration file path
    #[clap(short, long, global = true, env = "SCRIPTSTEP_CONFIG")]
    pub config: Option<PathBuf>,

    /// Verbosity level (-v, -vv, -vvv)
    #[clap(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Output format
    #[clap(long, global = true, default_value = "text", value_enum)]
    pub format: OutputFormat,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a script against a file of input items
    Run(RunArgs),

    /// Check a script without running it
    Check(CheckArgs),

    /// Initialize a new scriptstep configuration
    Init(InitArgs),

    /// Manage configuration
    Config(ConfigArgs),
}

// ============================================================================
// Script Commands
// ============================================================================

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Script file to run
    pub script: PathBuf,

    /// JSON file with the input items (an array of objects); stdin when `-`
    #[clap(long, short = 'i')]
    pub input: Option<PathBuf>,

    /// Run once for all items or once for each item
    #[clap(long, short = 'm', default_value = "all-items", value_enum)]
    pub mode: ExecutionMode,

    /// Script language
    #[clap(long, short = 'l', default_value = "javascript", value_enum)]
    pub language: ScriptLanguage,

    /// Turn script failures into error items instead of failing
    #[clap(long)]
    pub continue_on_fail: bool,

    /// The script returns one array of items per output
    #[clap(long)]
    pub multi_output: bool,

    /// Run as a manual execution (console output is printed)
    #[clap(long)]
    pub manual: bool,

    /// Global made available to the script (name=JSON), e.g. `$vars={"region":"eu"}`
    #[clap(long = "binding", short = 'b', value_parser = parse_binding)]
    pub bindings: Vec<(String, Value)>,
}

#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Script file to check
    pub script: PathBuf,

    /// Mode the script is meant to run in
    #[clap(long, short = 'm', default_value = "all-items", value_enum)]
    pub mode: ExecutionMode,

    /// Script language
    #[clap(long, short = 'l', default_value = "javascript", value_enum)]
    pub language: ScriptLanguage,
}

// ============================================================================
// Config Commands
// ============================================================================

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Force overwrite existing configuration
    #[clap(short, long)]
    pub force: bool,
}

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[clap(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,
    /// Show configuration file path
    Path,
}

// ============================================================================
// Common Types
// ============================================================================

/// Parse `name=JSON`; a value that is not valid JSON is taken as a string.
fn parse_binding(s: &str) -> Result<(String, Value), String> {
    let (name, raw) = s
        .split_once('=')
        .ok_or_else(|| "Binding format: NAME=JSON".to_string())?;
    let name = name.trim();
    if name.is_empty() {
        return Err("Binding name must not be empty".to_string());
    }
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((name.to_string(), value))
}

#[derive(Debug, Clone, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_parse_binding() {
        assert_eq!(
            parse_binding(r#"$vars={"region":"eu"}"#).unwrap(),
            ("$vars".to_string(), json!({ "region": "eu" }))
        );
        assert_eq!(
            parse_binding("$env=staging").unwrap(),
            ("$env".to_string(), json!("staging"))
        );
        assert!(parse_binding("novalue").is_err());
        assert!(parse_binding("=1").is_err());
    }

    #[test]
    fn test_run_arguments() {
        let cli = Cli::parse_from([
            "scriptstep",
            "run",
            "step.js",
            "--mode",
            "each-item",
            "--continue-on-fail",
            "-b",
            "$runId=7",
        ]);
        let Commands::Run(args) = cli.command else {
            panic!("expected the run command");
        };
        assert_eq!(args.mode, ExecutionMode::EachItem);
        assert_eq!(args.language, ScriptLanguage::JavaScript);
        assert!(args.continue_on_fail);
        assert_eq!(args.bindings, vec![("$runId".to_string(), json!(7))]);
    }
}
