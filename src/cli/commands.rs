use std::io::Read;
use std::path::Path;

use serde_json::json;
use tracing::info;

use crate::cli::args::{CheckArgs, ConfigAction, ConfigArgs, InitArgs, OutputFormat, RunArgs};
use crate::config::loader::get_config_path;
use crate::config::types::ScriptStepConfig;
use crate::error::{Result, ScriptError};
use crate::host::{ExecutionHost, StaticHost, WorkflowMode};
use crate::item::{items_from_json, PipelineItem};
use crate::orchestrator::{
    code_parameter_name, CodeStep, StepOutput, PARAM_LANGUAGE, PARAM_MODE, PARAM_MULTI_OUTPUT,
};
use crate::sandbox::SandboxFactory;

// ============================================================================
// Script Commands
// ============================================================================

/// Run a script file as a code step
pub async fn run(args: RunArgs, config: ScriptStepConfig, format: OutputFormat) -> Result<()> {
    let code = std::fs::read_to_string(&args.script)?;
    let items = read_items(args.input.as_deref())?;
    info!(script = %args.script.display(), items = items.len(), "Running script");

    let workflow_mode = if args.manual {
        WorkflowMode::Manual
    } else {
        WorkflowMode::Production
    };

    let mut host = StaticHost::new(items)
        .with_parameter(PARAM_LANGUAGE, serde_json::to_value(args.language)?)
        .with_parameter(PARAM_MODE, serde_json::to_value(args.mode)?)
        .with_parameter(code_parameter_name(args.language), code)
        .with_parameter(PARAM_MULTI_OUTPUT, args.multi_output)
        .with_continue_on_fail(args.continue_on_fail)
        .with_workflow_mode(workflow_mode);
    for (name, value) in args.bindings {
        host = host.with_binding(&name, value);
    }

    let step = CodeStep::new(SandboxFactory::from_config(&config)?);
    let output = step.execute(&host).await?;

    output_step_result(&host, &output, format)
}

/// Check a script file without running it
pub async fn check(args: CheckArgs, config: ScriptStepConfig, format: OutputFormat) -> Result<()> {
    let code = std::fs::read_to_string(&args.script)?;
    let factory = SandboxFactory::from_config(&config)?;

    let error = match factory.check_source(args.language, args.mode, &code) {
        Ok(()) => None,
        Err(e) if e.is_recoverable() => Some(e),
        Err(e) => return Err(e),
    };

    match format {
        OutputFormat::Text => match &error {
            None => println!("{}: ok", args.script.display()),
            Some(e) => {
                eprintln!("{}: {}", args.script.display(), e);
                if let Some(description) = e.description() {
                    eprintln!("  {}", description);
                }
            }
        },
        OutputFormat::Json => {
            println!(
                "{}",
                json!({
                    "ok": error.is_none(),
                    "error": error.as_ref().map(ToString::to_string),
                    "description": error.as_ref().and_then(|e| e.description()),
                    "line": error.as_ref().and_then(|e| e.line_number()),
                })
            );
        }
    }

    if error.is_some() {
        std::process::exit(1);
    }
    Ok(())
}

// ============================================================================
// Config Commands
// ============================================================================

pub async fn init(args: InitArgs) -> Result<()> {
    let config_path = get_config_path();

    if config_path.exists() && !args.force {
        println!("Configuration already exists at: {}", config_path.display());
        println!("Use --force to overwrite");
        return Ok(());
    }

    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let toml_str = toml::to_string_pretty(&ScriptStepConfig::default())
        .map_err(|e| ScriptError::Config(e.to_string()))?;
    std::fs::write(&config_path, toml_str)?;

    println!("Created configuration at: {}", config_path.display());
    println!("\nQuick start:");
    println!("  # Transform every item at once");
    println!("  scriptstep run step.js --input items.json");
    println!();
    println!("  # Run once per item, keeping failures as error items");
    println!("  scriptstep run step.js --input items.json --mode each-item --continue-on-fail");
    println!();
    println!("  # Check a script without running it");
    println!("  scriptstep check step.js --mode each-item");

    Ok(())
}

pub async fn config(args: ConfigArgs, config: ScriptStepConfig) -> Result<()> {
    match args.action {
        ConfigAction::Show => {
            let toml_str =
                toml::to_string_pretty(&config).map_err(|e| ScriptError::Config(e.to_string()))?;
            println!("{}", toml_str);
        }
        ConfigAction::Path => {
            println!("{}", get_config_path().display());
        }
    }
    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Input items from a file, `-` for stdin. Without input the step sees one
/// empty item.
fn read_items(path: Option<&Path>) -> Result<Vec<PipelineItem>> {
    let content = match path {
        None => return Ok(vec![PipelineItem::default()]),
        Some(path) if path.as_os_str() == "-" => {
            let mut buffer = String::new();
            std::io::stdin().read_to_string(&mut buffer)?;
            buffer
        }
        Some(path) => std::fs::read_to_string(path)?,
    };

    items_from_json(serde_json::from_str(&content)?)
}

fn output_step_result(host: &StaticHost, output: &StepOutput, format: OutputFormat) -> Result<()> {
    let console = host.ui_messages();
    let hints = host.hints();

    match format {
        OutputFormat::Text => {
            for message in &console {
                eprintln!("[{}] {}", message.timestamp.format("%H:%M:%S"), message.render());
            }
            for hint in &hints {
                eprintln!("hint: {}", hint.message);
            }

            let multi = output.branches.len() > 1;
            for (index, branch) in output.branches.iter().enumerate() {
                if multi {
                    println!("# output {}", index);
                }
                for item in branch {
                    println!("{}", serde_json::to_string(item)?);
                }
            }
        }
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "branches": output.branches,
                    "hints": hints,
                    "console": console,
                    "inputItems": host.input_items().len(),
                }))?
            );
        }
    }

    Ok(())
}
