use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::types::{ExecutionMode, RunnerKind, ScriptLanguage};
use crate::error::{Result, ScriptError};
use crate::item::PipelineItem;
use crate::sandbox::context::SandboxContext;
use crate::sandbox::traits::{AllItemsOutput, RunOptions, Sandbox};
use crate::sandbox::translate::{ErrorTranslator, RawScriptError};
use crate::sandbox::validation::{check_each_item_source, ShapeValidator};
use crate::sandbox::value::ScriptValue;
use crate::sandbox::{finalize_items, finalize_single, ConsoleMessage, ConsoleSink};

/// One script execution handed to the runner.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRequest {
    pub language: ScriptLanguage,
    pub mode: ExecutionMode,
    pub code: String,
    pub item_index: Option<usize>,
    pub context: SandboxContext,
    pub timeout_ms: u64,
    pub multi_output: bool,
}

/// What the runner sends back: a plain JSON result or an error, plus the
/// console calls the script made either way.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TaskResponse {
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub console: Vec<ConsoleMessage>,
    #[serde(default)]
    pub error: Option<RawScriptError>,
}

impl TaskResponse {
    pub fn ok(result: Value) -> Self {
        Self {
            result: Some(result),
            ..Default::default()
        }
    }

    pub fn failed(error: RawScriptError) -> Self {
        Self {
            error: Some(error),
            ..Default::default()
        }
    }
}

/// Connection to an out-of-process task runner.
///
/// The runner applies its own timeout; a transport failure is reported as
/// [`ScriptError::TaskRunner`].
#[async_trait]
pub trait TaskRunnerClient: Send + Sync {
    async fn execute(&self, request: TaskRequest) -> Result<TaskResponse>;
}

/// Delegates execution to a task runner and validates what comes back.
pub struct TaskRunnerSandbox {
    language: ScriptLanguage,
    code: String,
    context: SandboxContext,
    client: Arc<dyn TaskRunnerClient>,
    timeout: Duration,
    validator: ShapeValidator,
}

impl TaskRunnerSandbox {
    pub fn new(
        language: ScriptLanguage,
        code: impl Into<String>,
        context: SandboxContext,
        client: Arc<dyn TaskRunnerClient>,
        timeout: Duration,
        validator: ShapeValidator,
    ) -> Self {
        Self {
            language,
            code: code.into(),
            context,
            client,
            timeout,
            validator,
        }
    }

    async fn execute(&self, multi_output: bool, console: &ConsoleSink) -> Result<ScriptValue> {
        let request = TaskRequest {
            language: self.language,
            mode: self.context.mode,
            code: self.code.clone(),
            item_index: self.context.item_index,
            context: self.context.clone(),
            timeout_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
            multi_output,
        };

        debug!(
            language = %self.language,
            mode = ?self.context.mode,
            item_index = ?self.context.item_index,
            "Sending script to task runner"
        );

        // Grace period on top of the runner's own limit
        let deadline = self.timeout + Duration::from_secs(5);
        let response = match tokio::time::timeout(deadline, self.client.execute(request)).await {
            Ok(response) => response?,
            Err(_) => {
                warn!(timeout_ms = request_timeout_ms(deadline), "Task runner did not answer");
                return Err(ScriptError::Timeout {
                    millis: request_timeout_ms(deadline),
                });
            }
        };

        for message in response.console {
            if console.send(message).is_err() {
                break;
            }
        }

        if let Some(raw) = response.error {
            return Err(ErrorTranslator::new(self.context.mode, self.code.as_str())
                .with_line_offset(0)
                .translate(&raw, self.context.item_index));
        }

        Ok(response
            .result
            .map(|result| ScriptValue::from_json(&result))
            .unwrap_or(ScriptValue::Null))
    }
}

fn request_timeout_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[async_trait]
impl Sandbox for TaskRunnerSandbox {
    fn name(&self) -> &str {
        "task-runner"
    }

    fn runner(&self) -> RunnerKind {
        RunnerKind::TaskRunner
    }

    async fn run_code_all_items(
        &self,
        options: RunOptions,
        console: &ConsoleSink,
    ) -> Result<AllItemsOutput> {
        let root = self.execute(options.multi_output, console).await?;

        if options.multi_output {
            let branches = self
                .validator
                .validate_multi_output(&root)?
                .into_iter()
                .map(|branch| finalize_items(&root, branch))
                .collect::<Result<Vec<_>>>()?;
            return Ok(AllItemsOutput::Multi(branches));
        }

        let items = self.validator.validate_all_items(&root)?;
        Ok(AllItemsOutput::Single(finalize_items(&root, items)?))
    }

    async fn run_code_for_each_item(
        &self,
        item_index: usize,
        console: &ConsoleSink,
    ) -> Result<Option<PipelineItem>> {
        if self.language == ScriptLanguage::JavaScript {
            check_each_item_source(&self.code, Some(item_index))?;
        }

        let root = self.execute(false, console).await?;
        self.validator
            .validate_each_item(&root, item_index)?
            .map(|item| finalize_single(&root, item, item_index))
            .transpose()
    }
}
