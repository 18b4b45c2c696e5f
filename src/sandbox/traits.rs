use async_trait::async_trait;

use crate::config::types::RunnerKind;
use crate::error::Result;
use crate::item::PipelineItem;
use crate::sandbox::ConsoleSink;

/// Options for a batch run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// The script returns one array of items per output branch
    pub multi_output: bool,
}

/// What a batch run produced.
#[derive(Debug, Clone, PartialEq)]
pub enum AllItemsOutput {
    Single(Vec<PipelineItem>),
    Multi(Vec<Vec<PipelineItem>>),
}

impl AllItemsOutput {
    pub fn into_branches(self) -> Vec<Vec<PipelineItem>> {
        match self {
            Self::Single(items) => vec![items],
            Self::Multi(branches) => branches,
        }
    }
}

/// One prepared script bound to its data context.
///
/// Implementations execute the script in isolation: calls never share state,
/// and a failing call leaves later calls unaffected. Console output of a call
/// is sent on the given sink, including when the call fails.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Returns the sandbox name (e.g., "in-process", "task-runner")
    fn name(&self) -> &str;

    fn runner(&self) -> RunnerKind;

    /// Run the script once for the whole batch.
    ///
    /// `null`/`undefined` gives an empty result.
    async fn run_code_all_items(
        &self,
        options: RunOptions,
        console: &ConsoleSink,
    ) -> Result<AllItemsOutput>;

    /// Run the script for the bound item. `None` means no output for it.
    async fn run_code_for_each_item(
        &self,
        item_index: usize,
        console: &ConsoleSink,
    ) -> Result<Option<PipelineItem>>;
}
