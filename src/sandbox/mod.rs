mod backends;
mod context;
pub mod engine;
mod factory;
pub mod modules;
pub mod standardize;
mod tracking;
mod traits;
pub mod translate;
pub mod validation;
pub mod value;

pub use backends::{
    wrap_program, InProcessSandbox, TaskRequest, TaskResponse, TaskRunnerClient, TaskRunnerSandbox,
};
pub use context::SandboxContext;
pub use factory::{ExecutionPlan, SandboxFactory};
pub use traits::{AllItemsOutput, RunOptions, Sandbox};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::{Result, ScriptError};
use crate::item::PipelineItem;
use crate::sandbox::standardize::standardize_output;
use crate::sandbox::validation::ValidatedItem;
use crate::sandbox::value::{ContainerIndex, ScriptValue};

/// Receiving end of a script's console output for one call.
pub type ConsoleSink = mpsc::UnboundedSender<ConsoleMessage>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleLevel {
    Log,
    Info,
    Warn,
    Error,
    Debug,
}

/// One `console.*` call made by a script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsoleMessage {
    pub level: ConsoleLevel,
    pub args: Vec<Value>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl ConsoleMessage {
    pub fn new(level: ConsoleLevel, args: Vec<Value>) -> Self {
        Self {
            level,
            args,
            timestamp: Utc::now(),
        }
    }

    /// Arguments joined by spaces, strings unquoted.
    pub fn render(&self) -> String {
        self.args
            .iter()
            .map(|arg| match arg {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Standardize validated items and turn them into pipeline items.
///
/// `root` is the whole value the script returned; references inside an item
/// may point anywhere in it.
pub(crate) fn finalize_items(
    root: &ScriptValue,
    items: Vec<ValidatedItem>,
) -> Result<Vec<PipelineItem>> {
    let index = ContainerIndex::build(root);

    items
        .into_iter()
        .enumerate()
        .map(|(position, item)| finalize_item(&index, item, position))
        .collect()
}

/// [`finalize_items`] for the one item of an `EachItem` run.
pub(crate) fn finalize_single(
    root: &ScriptValue,
    item: ValidatedItem,
    item_index: usize,
) -> Result<PipelineItem> {
    finalize_item(&ContainerIndex::build(root), item, item_index)
}

fn finalize_item(
    index: &ContainerIndex<'_>,
    mut item: ValidatedItem,
    position: usize,
) -> Result<PipelineItem> {
    standardize_output(&mut item.json);

    let json = match index.render(&item.json) {
        Value::Object(map) => map,
        _ => return Err(invalid_field("json", position)),
    };

    let binary = item
        .binary
        .map(|binary| serde_json::from_value(index.render(&binary)))
        .transpose()
        .map_err(|_| invalid_field("binary", position))?;

    let paired_item = item
        .paired_item
        .map(|paired| serde_json::from_value(index.render(&paired)))
        .transpose()
        .map_err(|_| invalid_field("pairedItem", position))?;

    Ok(PipelineItem {
        json,
        binary,
        paired_item,
    })
}

fn invalid_field(field: &str, position: usize) -> ScriptError {
    ScriptError::validation(
        format!("A '{field}' property has an invalid format"),
        format!("The '{field}' value of the returned item could not be read."),
    )
    .at_item(Some(position))
}
