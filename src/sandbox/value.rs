//! Raw script values as they come out of the engine.
//!
//! The engine encodes a result as a tree in which every container carries an
//! identity id and a repeated reference to the same container is emitted as
//! `{"k": "r", "id": n}`. Decoding keeps that structure so validation and
//! standardization can tell plain objects from class instances and notice
//! shared or cyclic references before anything is turned into JSON.

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::error::{Result, ScriptError};

/// What a reference back to one of its own ancestors renders as.
pub const CIRCULAR_MARKER: &str = "[Circular Reference]";

#[derive(Debug, Clone, PartialEq)]
pub enum ScriptValue {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array {
        id: u32,
        items: Vec<ScriptValue>,
    },
    /// A plain mapping (prototype is `Object.prototype` or `null`)
    Object {
        id: u32,
        entries: Vec<(String, ScriptValue)>,
    },
    /// Any other object: a date, a pattern, a class instance
    Opaque {
        id: u32,
        class: String,
        repr: Option<String>,
    },
    /// A container already seen elsewhere in the same value
    Ref(u32),
}

impl ScriptValue {
    /// Decode the engine's tagged encoding.
    pub fn decode(encoded: &Value) -> Result<Self> {
        match encoded {
            Value::Null => Ok(Self::Null),
            Value::Bool(b) => Ok(Self::Bool(*b)),
            Value::Number(n) => n
                .as_f64()
                .map(Self::Number)
                .ok_or_else(|| malformed("number out of range")),
            Value::String(s) => Ok(Self::String(s.clone())),
            Value::Array(_) => Err(malformed("untagged array")),
            Value::Object(node) => decode_node(node),
        }
    }

    /// Build a value from plain JSON, numbering containers depth-first.
    pub fn from_json(value: &Value) -> Self {
        let mut next_id = 0;
        from_json_numbered(value, &mut next_id)
    }

    /// Render as JSON. See [`ContainerIndex::render`].
    pub fn to_json(&self) -> Value {
        ContainerIndex::build(self).render(self)
    }

    pub fn is_nullish(&self) -> bool {
        matches!(self, Self::Undefined | Self::Null)
    }

    pub fn is_plain_object(&self) -> bool {
        matches!(self, Self::Object { .. })
    }

    pub fn entries(&self) -> Option<&[(String, ScriptValue)]> {
        match self {
            Self::Object { entries, .. } => Some(entries),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&ScriptValue> {
        self.entries()?
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value)
    }

    /// The JavaScript `typeof`-style name used in user-facing messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::Array { .. } => "array",
            Self::Object { .. } | Self::Opaque { .. } | Self::Ref(_) => "object",
        }
    }

    /// Short display form, used when echoing a bad return value back.
    pub fn preview(&self) -> String {
        match self {
            Self::Undefined => "undefined".to_string(),
            Self::Null => "null".to_string(),
            Self::Bool(b) => b.to_string(),
            Self::Number(n) => format_number(*n),
            Self::String(s) => s.clone(),
            Self::Array { .. } => "[array]".to_string(),
            Self::Object { .. } | Self::Ref(_) => "[object Object]".to_string(),
            Self::Opaque { class, .. } => format!("[object {class}]"),
        }
    }

    fn id(&self) -> Option<u32> {
        match self {
            Self::Array { id, .. } | Self::Object { id, .. } | Self::Opaque { id, .. } => Some(*id),
            _ => None,
        }
    }
}

fn malformed(reason: impl Into<String>) -> ScriptError {
    ScriptError::Engine(format!("malformed script result: {}", reason.into()))
}

fn decode_node(node: &Map<String, Value>) -> Result<ScriptValue> {
    let kind = node
        .get("k")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed("missing node kind"))?;

    match kind {
        "u" => Ok(ScriptValue::Undefined),
        "n" => match node.get("v").and_then(Value::as_str) {
            Some("NaN") => Ok(ScriptValue::Number(f64::NAN)),
            Some("Infinity") => Ok(ScriptValue::Number(f64::INFINITY)),
            Some("-Infinity") => Ok(ScriptValue::Number(f64::NEG_INFINITY)),
            other => Err(malformed(format!("unknown number {other:?}"))),
        },
        "a" => {
            let items = node
                .get("v")
                .and_then(Value::as_array)
                .ok_or_else(|| malformed("array without items"))?
                .iter()
                .map(ScriptValue::decode)
                .collect::<Result<Vec<_>>>()?;
            Ok(ScriptValue::Array {
                id: node_id(node)?,
                items,
            })
        }
        "o" => {
            let pairs = node
                .get("v")
                .and_then(Value::as_array)
                .ok_or_else(|| malformed("object without entries"))?;
            let mut entries = Vec::with_capacity(pairs.len());
            for pair in pairs {
                match pair.as_array().map(Vec::as_slice) {
                    Some([Value::String(key), value]) => {
                        entries.push((key.clone(), ScriptValue::decode(value)?));
                    }
                    _ => return Err(malformed("object entry is not a [key, value] pair")),
                }
            }
            Ok(ScriptValue::Object {
                id: node_id(node)?,
                entries,
            })
        }
        "x" => Ok(ScriptValue::Opaque {
            id: node_id(node)?,
            class: node
                .get("c")
                .and_then(Value::as_str)
                .unwrap_or("Object")
                .to_string(),
            repr: node.get("s").and_then(Value::as_str).map(str::to_string),
        }),
        "r" => Ok(ScriptValue::Ref(node_id(node)?)),
        other => Err(malformed(format!("unknown node kind '{other}'"))),
    }
}

fn node_id(node: &Map<String, Value>) -> Result<u32> {
    node.get("id")
        .and_then(Value::as_u64)
        .and_then(|id| u32::try_from(id).ok())
        .ok_or_else(|| malformed("container without id"))
}

fn from_json_numbered(value: &Value, next_id: &mut u32) -> ScriptValue {
    match value {
        Value::Null => ScriptValue::Null,
        Value::Bool(b) => ScriptValue::Bool(*b),
        Value::Number(n) => ScriptValue::Number(n.as_f64().unwrap_or(f64::NAN)),
        Value::String(s) => ScriptValue::String(s.clone()),
        Value::Array(items) => {
            let id = take_id(next_id);
            ScriptValue::Array {
                id,
                items: items
                    .iter()
                    .map(|item| from_json_numbered(item, next_id))
                    .collect(),
            }
        }
        Value::Object(map) => {
            let id = take_id(next_id);
            ScriptValue::Object {
                id,
                entries: map
                    .iter()
                    .map(|(key, item)| (key.clone(), from_json_numbered(item, next_id)))
                    .collect(),
            }
        }
    }
}

fn take_id(next_id: &mut u32) -> u32 {
    let id = *next_id;
    *next_id += 1;
    id
}

fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

/// Containers of one decoded value, by id, so references can be followed.
pub struct ContainerIndex<'a> {
    nodes: HashMap<u32, &'a ScriptValue>,
}

impl<'a> ContainerIndex<'a> {
    pub fn build(root: &'a ScriptValue) -> Self {
        let mut nodes = HashMap::new();
        collect(root, &mut nodes);
        Self { nodes }
    }

    /// Follow a reference to the container it points at.
    pub fn resolve<'v>(&'v self, value: &'v ScriptValue) -> &'v ScriptValue {
        match value {
            ScriptValue::Ref(id) => match self.nodes.get(id) {
                Some(target) => *target,
                None => value,
            },
            _ => value,
        }
    }

    /// Render `value` as JSON, following references through this index.
    ///
    /// A reference to a container on the current path renders as
    /// [`CIRCULAR_MARKER`]; a reference to a container elsewhere is expanded
    /// in place. `undefined` is dropped from objects and becomes `null` in
    /// arrays. Opaque values render as their serialized form.
    pub fn render(&self, value: &ScriptValue) -> Value {
        let mut path = Vec::new();
        self.render_in(value, &mut path).unwrap_or(Value::Null)
    }

    fn render_in(&self, value: &ScriptValue, path: &mut Vec<u32>) -> Option<Value> {
        if let Some(id) = value.id() {
            if path.contains(&id) {
                return Some(Value::String(CIRCULAR_MARKER.to_string()));
            }
        }

        match value {
            ScriptValue::Undefined => None,
            ScriptValue::Null => Some(Value::Null),
            ScriptValue::Bool(b) => Some(Value::Bool(*b)),
            ScriptValue::Number(n) => Some(number_to_json(*n)),
            ScriptValue::String(s) => Some(Value::String(s.clone())),
            ScriptValue::Array { id, items } => {
                path.push(*id);
                let rendered = items
                    .iter()
                    .map(|item| self.render_in(item, path).unwrap_or(Value::Null))
                    .collect();
                path.pop();
                Some(Value::Array(rendered))
            }
            ScriptValue::Object { id, entries } => {
                path.push(*id);
                let mut map = Map::new();
                for (key, item) in entries {
                    if let Some(rendered) = self.render_in(item, path) {
                        map.insert(key.clone(), rendered);
                    }
                }
                path.pop();
                Some(Value::Object(map))
            }
            ScriptValue::Opaque { repr, .. } => repr
                .as_deref()
                .map(|text| serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))),
            ScriptValue::Ref(id) => {
                if path.contains(id) {
                    return Some(Value::String(CIRCULAR_MARKER.to_string()));
                }
                match self.nodes.get(id) {
                    Some(target) => self.render_in(target, path),
                    None => Some(Value::Null),
                }
            }
        }
    }
}

fn collect<'a>(value: &'a ScriptValue, nodes: &mut HashMap<u32, &'a ScriptValue>) {
    match value {
        ScriptValue::Array { id, items } => {
            nodes.entry(*id).or_insert(value);
            items.iter().for_each(|item| collect(item, nodes));
        }
        ScriptValue::Object { id, entries } => {
            nodes.entry(*id).or_insert(value);
            entries.iter().for_each(|(_, item)| collect(item, nodes));
        }
        ScriptValue::Opaque { id, .. } => {
            nodes.entry(*id).or_insert(value);
        }
        _ => {}
    }
}

fn number_to_json(n: f64) -> Value {
    if !n.is_finite() {
        return Value::Null;
    }
    if n.fract() == 0.0 && n.abs() <= 9_007_199_254_740_991.0 {
        return Value::from(n as i64);
    }
    serde_json::Number::from_f64(n)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_decode_tagged_object() {
        let encoded = json!({
            "k": "o", "id": 0, "v": [
                ["a", 1],
                ["when", { "k": "x", "id": 1, "c": "Date", "s": "\"2024-01-02T00:00:00.000Z\"" }],
                ["missing", { "k": "u" }],
                ["list", { "k": "a", "id": 2, "v": [true, null, { "k": "n", "v": "NaN" }] }]
            ]
        });

        let value = ScriptValue::decode(&encoded).unwrap();
        assert!(value.is_plain_object());
        assert_eq!(value.get("a"), Some(&ScriptValue::Number(1.0)));
        assert!(matches!(
            value.get("when"),
            Some(ScriptValue::Opaque { class, .. }) if class == "Date"
        ));

        assert_eq!(
            value.to_json(),
            json!({ "a": 1, "when": "2024-01-02T00:00:00.000Z", "list": [true, null, null] })
        );
    }

    #[test]
    fn test_decode_rejects_unknown_kind() {
        assert!(ScriptValue::decode(&json!({ "k": "?" })).is_err());
        assert!(ScriptValue::decode(&json!([1, 2])).is_err());
    }

    #[test]
    fn test_render_cycle_and_shared_reference() {
        // const shared = { n: 1 }; const root = { a: shared, b: shared }; root.self = root;
        let root = ScriptValue::Object {
            id: 0,
            entries: vec![
                (
                    "a".into(),
                    ScriptValue::Object {
                        id: 1,
                        entries: vec![("n".into(), ScriptValue::Number(1.0))],
                    },
                ),
                ("b".into(), ScriptValue::Ref(1)),
                ("self".into(), ScriptValue::Ref(0)),
            ],
        };

        assert_eq!(
            root.to_json(),
            json!({ "a": { "n": 1 }, "b": { "n": 1 }, "self": CIRCULAR_MARKER })
        );
    }

    #[test]
    fn test_from_json_numbers_containers() {
        let value = ScriptValue::from_json(&json!({ "a": [1, { "b": 2.5 }] }));
        assert_eq!(value.to_json(), json!({ "a": [1, { "b": 2.5 }] }));
        assert!(matches!(value, ScriptValue::Object { id: 0, .. }));
    }
}
