//! Normalize a result payload so it only holds JSON-representable data.

use std::collections::HashSet;

use crate::sandbox::value::ScriptValue;

/// Replace every non-plain value inside `value` by its JSON-stringified form.
///
/// Plain objects are walked; arrays, primitives and references are left as
/// they are. A container reached twice is only processed the first time.
pub fn standardize_output(value: &mut ScriptValue) {
    let mut seen = HashSet::new();
    standardize_in(value, &mut seen);
}

fn standardize_in(value: &mut ScriptValue, seen: &mut HashSet<u32>) {
    let ScriptValue::Object { id, entries } = value else {
        return;
    };
    if !seen.insert(*id) {
        return;
    }

    for (_, entry) in entries.iter_mut() {
        match entry {
            ScriptValue::Opaque { repr, .. } => *entry = stringified(repr.take()),
            ScriptValue::Object { .. } => standardize_in(entry, seen),
            _ => {}
        }
    }
}

fn stringified(repr: Option<String>) -> ScriptValue {
    match repr {
        // JSON.stringify of a date (or anything with a string toJSON) is a quoted string
        Some(text) => match serde_json::from_str::<String>(&text) {
            Ok(inner) => ScriptValue::String(inner),
            Err(_) => ScriptValue::String(text),
        },
        None => ScriptValue::Undefined,
    }
}
