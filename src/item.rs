//! Pipeline items: the unit of data flowing between workflow steps.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, ScriptError};

pub type JsonObject = Map<String, Value>;

/// One item of pipeline data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineItem {
    pub json: JsonObject,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary: Option<BTreeMap<String, BinaryRef>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paired_item: Option<PairedItem>,
}

impl PipelineItem {
    pub fn new(json: JsonObject) -> Self {
        Self {
            json,
            binary: None,
            paired_item: None,
        }
    }

    /// The synthetic item a failing script leaves behind under continue-on-failure.
    pub fn error_item(message: impl Into<String>, item_index: usize) -> Self {
        let mut json = JsonObject::new();
        json.insert("error".to_string(), Value::String(message.into()));
        Self::new(json).paired_with(item_index)
    }

    pub fn paired_with(mut self, item_index: usize) -> Self {
        self.paired_item = Some(PairedItem::Link(ItemLink::new(item_index)));
        self
    }
}

/// Provenance back to the input item(s) an output item came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PairedItem {
    Index(usize),
    Link(ItemLink),
    Links(Vec<ItemLink>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemLink {
    pub item: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<usize>,
}

impl ItemLink {
    pub fn new(item: usize) -> Self {
        Self { item, input: None }
    }
}

/// Reference to a binary attachment. Fields the host adds are kept in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BinaryRef {
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_extension: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<String>,
    #[serde(flatten)]
    pub extra: JsonObject,
}

/// Read a list of items from JSON.
///
/// Entries carrying a `json` key are taken as items, anything else becomes
/// the `json` payload of a new item.
pub fn items_from_json(value: Value) -> Result<Vec<PipelineItem>> {
    let entries = match value {
        Value::Array(entries) => entries,
        Value::Object(_) => vec![value],
        other => {
            return Err(ScriptError::Config(format!(
                "Input items must be an object or an array of objects, got {other}"
            )))
        }
    };

    entries
        .into_iter()
        .enumerate()
        .map(|(index, entry)| match entry {
            Value::Object(object) if object.contains_key("json") => {
                Ok(serde_json::from_value(Value::Object(object))?)
            }
            Value::Object(object) => Ok(PipelineItem::new(object)),
            other => Err(ScriptError::Config(format!(
                "Input item {index} is not an object: {other}"
            ))),
        })
        .collect()
}
