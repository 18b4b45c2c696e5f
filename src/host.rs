//! The workflow host a code step runs inside.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::item::{JsonObject, PipelineItem};
use crate::sandbox::ConsoleMessage;

/// How the surrounding workflow was started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowMode {
    /// Started by a user from the editor; console output goes to the UI
    Manual,
    #[default]
    Production,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HintLocation {
    OutputPane,
    InputPane,
}

/// Advisory message shown next to a step's output. Never stops execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionHint {
    pub message: String,
    pub location: HintLocation,
}

/// What a code step needs from the workflow host.
pub trait ExecutionHost: Send + Sync {
    fn input_items(&self) -> Arc<[PipelineItem]>;

    /// A step parameter as seen for the given item.
    fn parameter(&self, name: &str, item_index: usize) -> Option<Value>;

    fn continue_on_fail(&self) -> bool;

    fn workflow_mode(&self) -> WorkflowMode;

    fn run_index(&self) -> usize {
        0
    }

    /// Named values exposed to scripts as globals (`$vars`, `$workflow`, ...).
    fn bindings(&self) -> JsonObject {
        JsonObject::new()
    }

    fn add_hint(&self, hint: ExecutionHint);

    fn send_message_to_ui(&self, message: ConsoleMessage);
}

/// In-memory host: fixed items and parameters, hints and UI messages
/// collected for inspection.
#[derive(Debug)]
pub struct StaticHost {
    items: Arc<[PipelineItem]>,
    parameters: HashMap<String, Value>,
    item_parameters: HashMap<(String, usize), Value>,
    continue_on_fail: bool,
    workflow_mode: WorkflowMode,
    run_index: usize,
    bindings: JsonObject,
    hints: Mutex<Vec<ExecutionHint>>,
    ui_messages: Mutex<Vec<ConsoleMessage>>,
}

impl StaticHost {
    pub fn new(items: impl Into<Arc<[PipelineItem]>>) -> Self {
        Self {
            items: items.into(),
            parameters: HashMap::new(),
            item_parameters: HashMap::new(),
            continue_on_fail: false,
            workflow_mode: WorkflowMode::default(),
            run_index: 0,
            bindings: JsonObject::new(),
            hints: Mutex::new(Vec::new()),
            ui_messages: Mutex::new(Vec::new()),
        }
    }

    pub fn with_parameter(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.parameters.insert(name.to_string(), value.into());
        self
    }

    /// Override a parameter for one item only.
    pub fn with_item_parameter(mut self, name: &str, item_index: usize, value: impl Into<Value>) -> Self {
        self.item_parameters
            .insert((name.to_string(), item_index), value.into());
        self
    }

    pub fn with_continue_on_fail(mut self, continue_on_fail: bool) -> Self {
        self.continue_on_fail = continue_on_fail;
        self
    }

    pub fn with_workflow_mode(mut self, workflow_mode: WorkflowMode) -> Self {
        self.workflow_mode = workflow_mode;
        self
    }

    pub fn with_run_index(mut self, run_index: usize) -> Self {
        self.run_index = run_index;
        self
    }

    pub fn with_binding(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.bindings.insert(name.to_string(), value.into());
        self
    }

    pub fn hints(&self) -> Vec<ExecutionHint> {
        self.hints
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn ui_messages(&self) -> Vec<ConsoleMessage> {
        self.ui_messages
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl ExecutionHost for StaticHost {
    fn input_items(&self) -> Arc<[PipelineItem]> {
        Arc::clone(&self.items)
    }

    fn parameter(&self, name: &str, item_index: usize) -> Option<Value> {
        self.item_parameters
            .get(&(name.to_string(), item_index))
            .or_else(|| self.parameters.get(name))
            .cloned()
    }

    fn continue_on_fail(&self) -> bool {
        self.continue_on_fail
    }

    fn workflow_mode(&self) -> WorkflowMode {
        self.workflow_mode
    }

    fn run_index(&self) -> usize {
        self.run_index
    }

    fn bindings(&self) -> JsonObject {
        self.bindings.clone()
    }

    fn add_hint(&self, hint: ExecutionHint) {
        self.hints
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(hint);
    }

    fn send_message_to_ui(&self, message: ConsoleMessage) {
        self.ui_messages
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(message);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_item_parameter_overrides_default() {
        let host = StaticHost::new(Vec::<PipelineItem>::new())
            .with_parameter("jsCode", "return 1;")
            .with_item_parameter("jsCode", 1, "return 2;");

        assert_eq!(host.parameter("jsCode", 0), Some(json!("return 1;")));
        assert_eq!(host.parameter("jsCode", 1), Some(json!("return 2;")));
        assert_eq!(host.parameter("mode", 0), None);
    }

    #[test]
    fn test_hints_are_collected() {
        let host = StaticHost::new(Vec::<PipelineItem>::new());
        host.add_hint(ExecutionHint {
            message: "check pairing".into(),
            location: HintLocation::OutputPane,
        });
        assert_eq!(host.hints().len(), 1);
        assert_eq!(
            serde_json::to_value(&host.hints()[0]).unwrap()["location"],
            json!("outputPane")
        );
    }
}
