//! Shape checks on script return values.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{Result, ScriptError};
use crate::sandbox::value::{ContainerIndex, ScriptValue};

static ALL_ITEMS_ACCESSOR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$input\.(first|last|all|itemMatching)\b").expect("valid regex")
});

/// One output item that passed the shape check, not yet standardized.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedItem {
    pub json: ScriptValue,
    pub binary: Option<ScriptValue>,
    pub paired_item: Option<ScriptValue>,
}

/// Checks a raw return value against the item shape each mode expects.
#[derive(Debug, Clone)]
pub struct ShapeValidator {
    reserved_keys: Vec<String>,
}

impl Default for ShapeValidator {
    fn default() -> Self {
        Self::new(["json", "binary", "pairedItem"])
    }
}

impl ShapeValidator {
    pub fn new<I, S>(reserved_keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            reserved_keys: reserved_keys.into_iter().map(Into::into).collect(),
        }
    }

    /// Validate an `AllItems` result that feeds a single output.
    pub fn validate_all_items(&self, result: &ScriptValue) -> Result<Vec<ValidatedItem>> {
        let index = ContainerIndex::build(result);
        self.validate_list(&index, result)
    }

    /// Validate an `AllItems` result that must be an array of arrays.
    pub fn validate_multi_output(&self, result: &ScriptValue) -> Result<Vec<Vec<ValidatedItem>>> {
        let index = ContainerIndex::build(result);

        if result.is_nullish() {
            return Ok(Vec::new());
        }

        let ScriptValue::Array { items: branches, .. } = result else {
            return Err(not_array_of_arrays());
        };
        let branches: Vec<&ScriptValue> = branches.iter().map(|b| index.resolve(b)).collect();
        if !branches
            .iter()
            .all(|branch| matches!(branch, ScriptValue::Array { .. }))
        {
            return Err(not_array_of_arrays());
        }

        branches
            .into_iter()
            .map(|branch| self.validate_list(&index, branch))
            .collect()
    }

    /// Validate an `EachItem` result. `None` means the item produced no output.
    pub fn validate_each_item(
        &self,
        result: &ScriptValue,
        item_index: usize,
    ) -> Result<Option<ValidatedItem>> {
        let at = Some(item_index);

        match result {
            ScriptValue::Undefined | ScriptValue::Null => Ok(None),
            ScriptValue::Array { items, .. } => {
                let first_sentence = match items.first() {
                    Some(first) => format!("An array of {}s was returned.", first.type_name()),
                    None => "An empty array was returned.".to_string(),
                };
                Err(ScriptError::validation(
                    "Code doesn't return a single object",
                    format!(
                        "{first_sentence} If you need to output multiple items, please use the 'Run Once for All Items' mode instead."
                    ),
                )
                .at_item(at))
            }
            ScriptValue::Object { .. } => {
                let index = ContainerIndex::build(result);
                let item_shaped = self.has_reserved_key(result);
                if item_shaped {
                    self.check_top_level_keys(result, item_index)?;
                }
                self.normalize(&index, result, item_shaped, item_index)
                    .map(Some)
            }
            other => Err(ScriptError::validation(
                "Code doesn't return an object",
                format!(
                    "Please return an object representing the output item. ('{}' was returned instead.)",
                    other.preview()
                ),
            )
            .at_item(at)),
        }
    }

    fn validate_list(
        &self,
        index: &ContainerIndex<'_>,
        result: &ScriptValue,
    ) -> Result<Vec<ValidatedItem>> {
        let elements: Vec<&ScriptValue> = match result {
            ScriptValue::Undefined | ScriptValue::Null => return Ok(Vec::new()),
            ScriptValue::Object { .. } => vec![result],
            ScriptValue::Array { items, .. } => items.iter().map(|e| index.resolve(e)).collect(),
            _ => {
                return Err(ScriptError::validation(
                    "Code doesn't return items properly",
                    "Please return an array of objects, one for each item you would like to output.",
                ))
            }
        };

        let item_shaped: Vec<bool> = elements.iter().map(|e| self.has_reserved_key(e)).collect();
        let any_item_shaped = item_shaped.iter().any(|shaped| *shaped);

        if any_item_shaped {
            for (position, element) in elements.iter().enumerate() {
                self.check_top_level_keys(element, position)?;
            }
            if item_shaped.iter().any(|shaped| !shaped) {
                return Err(ScriptError::validation(
                    "Inconsistent item format",
                    "Either return every item wrapped as `{ json: ... }` or none of them.",
                ));
            }
        }

        elements
            .into_iter()
            .enumerate()
            .map(|(position, element)| self.normalize(index, element, any_item_shaped, position))
            .collect()
    }

    fn has_reserved_key(&self, element: &ScriptValue) -> bool {
        element
            .entries()
            .is_some_and(|entries| entries.iter().any(|(key, _)| self.is_reserved(key)))
    }

    fn is_reserved(&self, key: &str) -> bool {
        self.reserved_keys.iter().any(|reserved| reserved == key)
    }

    /// Reject keys that are neither reserved nor nested under `json`.
    fn check_top_level_keys(&self, element: &ScriptValue, item_index: usize) -> Result<()> {
        let Some(entries) = element.entries() else {
            return Ok(());
        };

        let reserved = entries.iter().find(|(key, _)| self.is_reserved(key));
        let mut seen = HashSet::new();
        let unknown: Vec<String> = entries
            .iter()
            .filter(|(key, _)| !self.is_reserved(key) && seen.insert(key.as_str()))
            .map(|(key, _)| key.clone())
            .collect();

        let Some(first_unknown) = unknown.first().cloned() else {
            return Ok(());
        };

        match reserved {
            Some((key, _)) => Err(ScriptError::ReservedKeyFound {
                key: key.clone(),
                unknown_keys: unknown,
                item_index,
            }),
            None => Err(ScriptError::validation(
                format!("Unknown top-level item key: {first_unknown}"),
                "Access the properties of an item under `.json`, e.g. `item.json`",
            )
            .at_item(Some(item_index))),
        }
    }

    fn normalize(
        &self,
        index: &ContainerIndex<'_>,
        element: &ScriptValue,
        item_shaped: bool,
        item_index: usize,
    ) -> Result<ValidatedItem> {
        if !item_shaped {
            if !element.is_plain_object() {
                return Err(json_not_object(item_index));
            }
            return Ok(ValidatedItem {
                json: element.clone(),
                binary: None,
                paired_item: None,
            });
        }

        let binary = element.get("binary").map(|b| index.resolve(b));
        if let Some(binary) = binary {
            let is_object_of_objects = binary.entries().is_some_and(|entries| {
                entries
                    .iter()
                    .all(|(_, entry)| index.resolve(entry).is_plain_object())
            });
            if !is_object_of_objects {
                return Err(ScriptError::validation(
                    "A 'binary' property isn't an object",
                    "In the returned data, every key named 'binary' must point to an object.",
                )
                .at_item(Some(item_index)));
            }
        }

        let json = match element.get("json").map(|j| index.resolve(j)) {
            Some(json) if json.is_plain_object() => json.clone(),
            None if binary.is_some() => ScriptValue::Object {
                id: u32::MAX,
                entries: Vec::new(),
            },
            _ => return Err(json_not_object(item_index)),
        };

        Ok(ValidatedItem {
            json,
            binary: binary.cloned(),
            paired_item: element
                .get("pairedItem")
                .filter(|paired| !paired.is_nullish())
                .map(|paired| index.resolve(paired).clone()),
        })
    }
}

fn json_not_object(item_index: usize) -> ScriptError {
    ScriptError::validation(
        "A 'json' property isn't an object",
        "In the returned data, every key named 'json' must point to an object.",
    )
    .at_item(Some(item_index))
}

fn not_array_of_arrays() -> ScriptError {
    ScriptError::validation(
        "Code doesn't return an array of arrays",
        "Please return an array of arrays. One array for the different outputs and one for the different items that get returned.",
    )
}

/// Reject `EachItem` source that reaches for the whole batch.
///
/// Lines that start a comment are ignored. Runs on the source text before
/// anything is executed.
pub fn check_each_item_source(code: &str, item_index: Option<usize>) -> Result<()> {
    for (line_index, line) in code.lines().enumerate() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("//") || trimmed.starts_with("/*") || trimmed.starts_with('*') {
            continue;
        }
        if let Some(captures) = ALL_ITEMS_ACCESSOR.captures(line) {
            return Err(ScriptError::Validation {
                message: format!("Can't use .{}() here", &captures[1]),
                description: "This is only available in 'Run Once for All Items' mode".to_string(),
                item_index,
                line_number: u32::try_from(line_index + 1).ok(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    fn value(json: serde_json::Value) -> ScriptValue {
        ScriptValue::from_json(&json)
    }

    #[test]
    fn test_all_items_accepts_null_object_and_array() {
        let validator = ShapeValidator::default();

        assert!(validator
            .validate_all_items(&ScriptValue::Undefined)
            .unwrap()
            .is_empty());

        let single = validator.validate_all_items(&value(json!({ "a": 1 }))).unwrap();
        assert_eq!(single.len(), 1);
        assert_eq!(single[0].json.to_json(), json!({ "a": 1 }));

        let items = validator
            .validate_all_items(&value(json!([{ "a": 1 }, { "a": 2 }, { "a": 3 }])))
            .unwrap();
        let rendered: Vec<_> = items.iter().map(|i| i.json.to_json()).collect();
        assert_eq!(rendered, vec![json!({ "a": 1 }), json!({ "a": 2 }), json!({ "a": 3 })]);
    }

    #[test]
    fn test_all_items_rejects_scalars() {
        let err = ShapeValidator::default()
            .validate_all_items(&ScriptValue::Number(5.0))
            .unwrap_err();
        assert_eq!(err.to_string(), "Code doesn't return items properly");
    }

    #[test]
    fn test_all_items_names_offending_index() {
        let err = ShapeValidator::default()
            .validate_all_items(&value(json!([{ "json": {} }, { "json": 3 }])))
            .unwrap_err();
        assert_eq!(err.to_string(), "A 'json' property isn't an object");
        assert_eq!(err.item_index(), Some(1));
    }

    #[test]
    fn test_item_shaped_entries_keep_binary_and_pairing() {
        let items = ShapeValidator::default()
            .validate_all_items(&value(json!([
                { "json": { "a": 1 }, "pairedItem": { "item": 0 } },
                { "binary": { "file": { "data": "AA==", "mimeType": "text/plain" } } }
            ])))
            .unwrap();

        assert_eq!(items[0].paired_item.as_ref().unwrap().to_json(), json!({ "item": 0 }));
        assert_eq!(items[1].json.to_json(), json!({}));
        assert!(items[1].binary.is_some());
    }

    #[test]
    fn test_reserved_key_next_to_unknown_key() {
        let err = ShapeValidator::default()
            .validate_all_items(&value(json!([{ "json": { "a": 1 }, "extra": true }])))
            .unwrap_err();
        assert_matches!(
            err,
            ScriptError::ReservedKeyFound { ref key, ref unknown_keys, item_index: 0 }
                if key == "json" && unknown_keys == &vec!["extra".to_string()]
        );
    }

    #[test]
    fn test_only_unknown_keys_are_listed_next_to_reserved_keys() {
        let err = ShapeValidator::default()
            .validate_all_items(&value(json!([
                { "json": { "a": 1 }, "pairedItem": { "item": 0 }, "extra": 1 }
            ])))
            .unwrap_err();
        assert_matches!(
            err,
            ScriptError::ReservedKeyFound { ref unknown_keys, item_index: 0, .. }
                if unknown_keys == &vec!["extra".to_string()]
        );
    }

    #[test]
    fn test_unknown_key_in_batch_with_item_shaped_entries() {
        let err = ShapeValidator::default()
            .validate_all_items(&value(json!([{ "json": {} }, { "name": "x" }])))
            .unwrap_err();
        assert_eq!(err.to_string(), "Unknown top-level item key: name");
        assert_eq!(err.item_index(), Some(1));
    }

    #[test]
    fn test_binary_must_be_object_of_objects() {
        let err = ShapeValidator::default()
            .validate_all_items(&value(json!([{ "json": {}, "binary": { "file": "nope" } }])))
            .unwrap_err();
        assert_eq!(err.to_string(), "A 'binary' property isn't an object");
    }

    #[test]
    fn test_configured_reserved_keys() {
        let validator = ShapeValidator::new(["json"]);
        let err = validator
            .validate_all_items(&value(json!([{ "json": {}, "binary": {} }])))
            .unwrap_err();
        assert_matches!(err, ScriptError::ReservedKeyFound { .. });
    }

    #[test]
    fn test_multi_output() {
        let validator = ShapeValidator::default();
        let branches = validator
            .validate_multi_output(&value(json!([[{ "a": 1 }], [], [{ "b": 2 }, { "b": 3 }]])))
            .unwrap();
        assert_eq!(
            branches.iter().map(Vec::len).collect::<Vec<_>>(),
            vec![1, 0, 2]
        );

        let err = validator
            .validate_multi_output(&value(json!([[{ "a": 1 }], { "b": 2 }])))
            .unwrap_err();
        assert_matches!(err, ScriptError::Validation { .. });
        assert_eq!(err.to_string(), "Code doesn't return an array of arrays");
    }

    #[test]
    fn test_each_item_rejects_arrays() {
        let validator = ShapeValidator::default();

        let err = validator
            .validate_each_item(&value(json!([{ "a": 1 }])), 2)
            .unwrap_err();
        assert_eq!(err.to_string(), "Code doesn't return a single object");
        assert!(err.description().unwrap().starts_with("An array of objects was returned."));
        assert_eq!(err.item_index(), Some(2));

        let err = validator.validate_each_item(&value(json!([])), 0).unwrap_err();
        assert!(err.description().unwrap().starts_with("An empty array was returned."));
    }

    #[test]
    fn test_each_item_rejects_non_objects() {
        let err = ShapeValidator::default()
            .validate_each_item(&ScriptValue::String("hi".into()), 0)
            .unwrap_err();
        assert_eq!(err.to_string(), "Code doesn't return an object");
        assert!(err.description().unwrap().contains("('hi' was returned instead.)"));
    }

    #[test]
    fn test_each_item_null_and_object() {
        let validator = ShapeValidator::default();
        assert_eq!(validator.validate_each_item(&ScriptValue::Null, 0).unwrap(), None);

        let item = validator
            .validate_each_item(&value(json!({ "b": 2 })), 0)
            .unwrap()
            .unwrap();
        assert_eq!(item.json.to_json(), json!({ "b": 2 }));

        let err = validator
            .validate_each_item(&value(json!({ "json": { "b": 2 }, "c": 1 })), 4)
            .unwrap_err();
        assert_matches!(err, ScriptError::ReservedKeyFound { item_index: 4, .. });
    }

    #[test]
    fn test_shared_elements_are_resolved() {
        // const o = { a: 1 }; return [o, o];
        let result = ScriptValue::Array {
            id: 0,
            items: vec![
                ScriptValue::Object {
                    id: 1,
                    entries: vec![("a".into(), ScriptValue::Number(1.0))],
                },
                ScriptValue::Ref(1),
            ],
        };
        let items = ShapeValidator::default().validate_all_items(&result).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].json.to_json(), json!({ "a": 1 }));
    }

    #[test]
    fn test_static_check_reports_line() {
        let code = "const a = 1;\n// $input.all() is fine in a comment\nconst rows = $input.all();\nreturn rows[0];";
        let err = check_each_item_source(code, Some(3)).unwrap_err();
        assert_eq!(err.to_string(), "Can't use .all() here");
        assert_eq!(err.line_number(), Some(3));
        assert_eq!(err.item_index(), Some(3));
    }

    #[test]
    fn test_static_check_allows_item_access() {
        let code = "/* $input.first() */\n * $input.last()\nreturn { v: $input.item.json.v };";
        assert!(check_each_item_source(code, None).is_ok());
    }
}
