use std::sync::Arc;

use serde::Serialize;

use crate::config::types::ExecutionMode;
use crate::host::WorkflowMode;
use crate::item::{JsonObject, PipelineItem};

/// The data a script can see.
///
/// Built fresh for every sandbox and dropped with it. In `EachItem` mode
/// `items` holds only the bound item.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxContext {
    pub mode: ExecutionMode,
    pub items: Arc<[PipelineItem]>,
    pub item_index: Option<usize>,
    pub run_index: usize,
    pub workflow_mode: WorkflowMode,
    /// Named host values (`$vars`, `$workflow`, ...), exposed as globals
    pub bindings: JsonObject,
}

impl SandboxContext {
    pub fn for_all_items(items: Arc<[PipelineItem]>) -> Self {
        Self {
            mode: ExecutionMode::AllItems,
            items,
            item_index: None,
            run_index: 0,
            workflow_mode: WorkflowMode::default(),
            bindings: JsonObject::new(),
        }
    }

    pub fn for_item(item: PipelineItem, item_index: usize) -> Self {
        Self {
            mode: ExecutionMode::EachItem,
            items: Arc::from(vec![item]),
            item_index: Some(item_index),
            run_index: 0,
            workflow_mode: WorkflowMode::default(),
            bindings: JsonObject::new(),
        }
    }

    pub fn with_run_index(mut self, run_index: usize) -> Self {
        self.run_index = run_index;
        self
    }

    pub fn with_workflow_mode(mut self, workflow_mode: WorkflowMode) -> Self {
        self.workflow_mode = workflow_mode;
        self
    }

    pub fn with_bindings(mut self, bindings: JsonObject) -> Self {
        self.bindings = bindings;
        self
    }
}
