//! Drives one invocation of a code step.
//!
//! [`CodeStep`] reads the step parameters from the host, resolves an
//! [`ExecutionPlan`] before any script runs, then executes the script once
//! for the batch or once per item. Console output is routed per the host's
//! workflow mode after every sandbox call.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::types::{ExecutionMode, ScriptLanguage};
use crate::error::{Result, ScriptError};
use crate::host::{ExecutionHint, ExecutionHost, HintLocation, WorkflowMode};
use crate::item::{ItemLink, PairedItem, PipelineItem};
use crate::sandbox::{
    ConsoleMessage, ConsoleSink, ExecutionPlan, RunOptions, SandboxContext, SandboxFactory,
};

pub const PARAM_LANGUAGE: &str = "language";
pub const PARAM_MODE: &str = "mode";
pub const PARAM_JS_CODE: &str = "jsCode";
pub const PARAM_PYTHON_CODE: &str = "pythonCode";
pub const PARAM_MULTI_OUTPUT: &str = "multiOutput";

pub const PAIRING_HINT: &str =
    "To make sure expressions after this node work, return the input items that produced each output item.";

const CONSOLE_TARGET: &str = "scriptstep::console";

/// Items produced by one step invocation, one list per output branch.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StepOutput {
    pub branches: Vec<Vec<PipelineItem>>,
}

impl StepOutput {
    pub fn single(items: Vec<PipelineItem>) -> Self {
        Self {
            branches: vec![items],
        }
    }

    pub fn item_count(&self) -> usize {
        self.branches.iter().map(Vec::len).sum()
    }

    pub fn items(&self) -> impl Iterator<Item = &PipelineItem> {
        self.branches.iter().flatten()
    }
}

/// A code step bound to the sandboxes it may create.
pub struct CodeStep {
    factory: SandboxFactory,
}

impl CodeStep {
    pub fn new(factory: SandboxFactory) -> Self {
        Self { factory }
    }

    pub async fn execute(&self, host: &dyn ExecutionHost) -> Result<StepOutput> {
        let language: ScriptLanguage = parameter_or_default(host, PARAM_LANGUAGE)?;
        let mode: ExecutionMode = parameter_or_default(host, PARAM_MODE)?;
        let plan = self.factory.resolve_plan(language, mode)?;

        let input_count = host.input_items().len();
        info!(
            language = %plan.language,
            runner = ?plan.runner,
            mode = ?plan.mode,
            items = input_count,
            "Executing code step"
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        let output = match plan.mode {
            ExecutionMode::AllItems => self.run_all_items(host, &plan, &tx, &mut rx).await?,
            ExecutionMode::EachItem => self.run_each_item(host, &plan, &tx, &mut rx).await?,
        };

        if needs_pairing_hint(input_count, &output) {
            host.add_hint(ExecutionHint {
                message: PAIRING_HINT.to_string(),
                location: HintLocation::OutputPane,
            });
        }

        debug!(branches = output.branches.len(), items = output.item_count(), "Code step finished");
        Ok(output)
    }

    async fn run_all_items(
        &self,
        host: &dyn ExecutionHost,
        plan: &ExecutionPlan,
        console: &ConsoleSink,
        received: &mut mpsc::UnboundedReceiver<ConsoleMessage>,
    ) -> Result<StepOutput> {
        let code = code_parameter(host, plan.language, 0)?;
        let multi_output = host
            .parameter(PARAM_MULTI_OUTPUT, 0)
            .and_then(|value| value.as_bool())
            .unwrap_or(false);

        let context = SandboxContext::for_all_items(host.input_items())
            .with_run_index(host.run_index())
            .with_workflow_mode(host.workflow_mode())
            .with_bindings(host.bindings());
        let sandbox = self.factory.create(plan, &code, context)?;

        let result = sandbox
            .run_code_all_items(RunOptions { multi_output }, console)
            .await;
        self.route_console(host, received);

        match result {
            Ok(output) => Ok(StepOutput {
                branches: output.into_branches(),
            }),
            Err(e) if host.continue_on_fail() && e.is_recoverable() => {
                warn!(error = %e, "Script failed, continuing with an error item");
                Ok(StepOutput::single(vec![PipelineItem::error_item(
                    e.to_string(),
                    0,
                )]))
            }
            Err(e) => Err(e),
        }
    }

    async fn run_each_item(
        &self,
        host: &dyn ExecutionHost,
        plan: &ExecutionPlan,
        console: &ConsoleSink,
        received: &mut mpsc::UnboundedReceiver<ConsoleMessage>,
    ) -> Result<StepOutput> {
        let items = host.input_items();
        let bindings = host.bindings();
        let mut output = Vec::with_capacity(items.len());

        for (index, item) in items.iter().enumerate() {
            let code = code_parameter(host, plan.language, index)?;
            let context = SandboxContext::for_item(item.clone(), index)
                .with_run_index(host.run_index())
                .with_workflow_mode(host.workflow_mode())
                .with_bindings(bindings.clone());
            let sandbox = self.factory.create(plan, &code, context)?;

            let result = sandbox.run_code_for_each_item(index, console).await;
            self.route_console(host, received);

            match result {
                Ok(Some(mut produced)) => {
                    produced.paired_item = Some(PairedItem::Link(ItemLink::new(index)));
                    output.push(produced);
                }
                Ok(None) => debug!(item_index = index, "Script returned no item"),
                Err(e) if host.continue_on_fail() && e.is_recoverable() => {
                    warn!(item_index = index, error = %e, "Script failed for item, continuing");
                    output.push(PipelineItem::error_item(e.to_string(), index));
                }
                Err(e) => return Err(e.at_item(Some(index))),
            }
        }

        Ok(StepOutput::single(output))
    }

    fn route_console(
        &self,
        host: &dyn ExecutionHost,
        received: &mut mpsc::UnboundedReceiver<ConsoleMessage>,
    ) {
        let log_to_stdout = self.factory.code_config().enable_stdout;
        while let Ok(message) = received.try_recv() {
            match host.workflow_mode() {
                WorkflowMode::Manual => host.send_message_to_ui(message),
                WorkflowMode::Production if log_to_stdout => {
                    info!(target: CONSOLE_TARGET, level = ?message.level, "{}", message.render());
                }
                WorkflowMode::Production => {}
            }
        }
    }
}

fn needs_pairing_hint(input_count: usize, output: &StepOutput) -> bool {
    output.item_count() != input_count || output.items().any(|item| item.paired_item.is_none())
}

/// Read a step-level parameter, falling back to the type's default.
fn parameter_or_default<T>(host: &dyn ExecutionHost, name: &str) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    match host.parameter(name, 0) {
        None | Some(Value::Null) => Ok(T::default()),
        Some(value) => serde_json::from_value(value.clone()).map_err(|_| {
            ScriptError::Config(format!("Invalid value for parameter '{name}': {value}"))
        }),
    }
}

/// Name of the parameter holding the script for `language`.
pub fn code_parameter_name(language: ScriptLanguage) -> &'static str {
    match language {
        ScriptLanguage::JavaScript => PARAM_JS_CODE,
        ScriptLanguage::Python | ScriptLanguage::PythonNative => PARAM_PYTHON_CODE,
    }
}

fn code_parameter(host: &dyn ExecutionHost, language: ScriptLanguage, item_index: usize) -> Result<String> {
    let name = code_parameter_name(language);
    match host.parameter(name, item_index) {
        Some(Value::String(code)) => Ok(code),
        Some(other) => Err(ScriptError::Config(format!(
            "Parameter '{name}' must be a string, got {other}"
        ))),
        None => Err(ScriptError::Config(format!("No code given in parameter '{name}'"))),
    }
}
