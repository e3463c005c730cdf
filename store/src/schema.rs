//! JSON-Schema-guided traversal.
//!
//! Schemas are plain [`Value`] trees; the helpers here resolve `$ref` into
//! `#/$defs/…` and `#/properties/…`, walk `properties`/`items`/`anyOf`
//! down a path, extract defaults (use-site wins over the `$ref` target),
//! and read the two domain extensions: `asCell` (the position is a cell
//! handle, not an inlined value) and `ifc.classification` (a label lattice
//! propagated on writes).

use crate::path::{PathBuf, LENGTH};
use crate::value::{Object, Value};
use std::collections::BTreeSet;

const MAX_REF_HOPS: usize = 32;

/// A set of confidentiality labels forming a join semilattice under union.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Labels(BTreeSet<String>);

impl Labels {
    /// The bottom element: no classification.
    pub fn none() -> Self {
        Self::default()
    }

    /// Least upper bound.
    pub fn lub(&self, other: &Labels) -> Labels {
        Labels(self.0.union(&other.0).cloned().collect())
    }

    /// True if no label is present.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates the labels in order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for Labels {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Labels(iter.into_iter().map(Into::into).collect())
    }
}

/// Follows `$ref` chains, merging use-site keywords over the target so a
/// default declared at the use site overrides the definition's default.
pub fn resolve_ref(schema: &Value, root: Option<&Value>) -> Value {
    let mut current = schema.clone();
    for _ in 0..MAX_REF_HOPS {
        let reference = match current.get("$ref").and_then(Value::as_str) {
            Some(r) => r.to_string(),
            None => return current,
        };
        let target = match lookup_ref(&reference, root.unwrap_or(&current)) {
            Some(t) => t,
            None => return current,
        };
        let mut merged = match target {
            Value::Object(o) => o.clone(),
            other => return other.clone(),
        };
        if let Some(use_site) = current.as_object() {
            for (key, value) in use_site {
                if key != "$ref" {
                    merged.insert(key.clone(), value.clone());
                }
            }
        }
        current = Value::Object(merged);
    }
    tracing::error!("$ref chain exceeded {} hops", MAX_REF_HOPS);
    current
}

fn lookup_ref<'a>(reference: &str, root: &'a Value) -> Option<&'a Value> {
    let pointer = reference.strip_prefix("#/")?;
    let mut current = root;
    for component in pointer.split('/') {
        current = current.get(component)?;
    }
    Some(current)
}

/// Rewrites `$defs` names (and the `$ref`s pointing at them) using a rename
/// map, so two schemas with colliding definition names can be merged.
pub fn rename_defs(schema: &Value, renames: &Object) -> Value {
    match schema {
        Value::Object(o) => {
            let mut out = Object::new();
            for (key, value) in o {
                if key == "$defs" {
                    if let Some(defs) = value.as_object() {
                        let mut renamed = Object::new();
                        for (name, def) in defs {
                            let new_name = renames
                                .get(name)
                                .and_then(Value::as_str)
                                .unwrap_or(name)
                                .to_string();
                            renamed.insert(new_name, rename_defs(def, renames));
                        }
                        out.insert(key.clone(), Value::Object(renamed));
                        continue;
                    }
                }
                if key == "$ref" {
                    if let Some(reference) = value.as_str() {
                        if let Some(name) = reference.strip_prefix("#/$defs/") {
                            if let Some(new_name) = renames.get(name).and_then(Value::as_str) {
                                out.insert(
                                    key.clone(),
                                    Value::from(format!("#/$defs/{}", new_name)),
                                );
                                continue;
                            }
                        }
                    }
                }
                out.insert(key.clone(), rename_defs(value, renames));
            }
            Value::Object(out)
        }
        Value::Array(a) => Value::Array(a.iter().map(|v| rename_defs(v, renames)).collect()),
        other => other.clone(),
    }
}

/// Resolves the schema of a child position.
///
/// For objects this consults `properties` then `additionalProperties`; for
/// arrays `items`, with the `length` pseudo-component yielding a number
/// schema that inherits the array's classification; `anyOf` branches are
/// merged into a new `anyOf`.
pub fn schema_at_child(schema: &Value, root: Option<&Value>, component: &str) -> Option<Value> {
    let schema = resolve_ref(schema, root);
    if let Some(branches) = schema.get("anyOf").and_then(Value::as_array) {
        let hits: Vec<Value> = branches
            .iter()
            .filter_map(|branch| schema_at_child(branch, root, component))
            .collect();
        return match hits.len() {
            0 => None,
            1 => hits.into_iter().next(),
            _ => {
                let mut o = Object::new();
                o.insert("anyOf".into(), Value::Array(hits));
                Some(Value::Object(o))
            }
        };
    }
    match schema.get("type").and_then(Value::as_str) {
        Some("object") => {
            if let Some(found) = schema
                .get("properties")
                .and_then(|p| p.get(component))
            {
                return Some(resolve_ref(found, root));
            }
            match schema.get("additionalProperties") {
                Some(Value::Bool(false)) => None,
                Some(Value::Object(_)) => {
                    Some(resolve_ref(schema.get("additionalProperties").unwrap(), root))
                }
                _ => None,
            }
        }
        Some("array") => {
            if component == LENGTH {
                let mut o = Object::new();
                o.insert("type".into(), Value::from("number"));
                let labels = classification(&schema);
                if !labels.is_empty() {
                    let mut ifc = Object::new();
                    ifc.insert(
                        "classification".into(),
                        labels.iter().map(Value::from).collect(),
                    );
                    o.insert("ifc".into(), Value::Object(ifc));
                }
                return Some(Value::Object(o));
            }
            schema.get("items").map(|items| resolve_ref(items, root))
        }
        _ => None,
    }
}

/// Walks a schema down a path of components.
pub fn schema_at_path(schema: &Value, root: Option<&Value>, path: &PathBuf) -> Option<Value> {
    let mut current = resolve_ref(schema, root);
    for component in path.components() {
        current = schema_at_child(&current, root, component)?;
    }
    Some(current)
}

/// Extracts the default declared by a schema, if any. `resolve_ref` has
/// already arranged for use-site defaults to shadow the target's.
pub fn default_of(schema: &Value, root: Option<&Value>) -> Option<Value> {
    resolve_ref(schema, root).get("default").cloned()
}

/// True if the schema marks the position as a cell handle.
pub fn is_as_cell(schema: &Value) -> bool {
    schema.get("asCell").and_then(Value::as_bool).unwrap_or(false)
}

/// Reads the classification labels of a schema position.
pub fn classification(schema: &Value) -> Labels {
    schema
        .get("ifc")
        .and_then(|ifc| ifc.get("classification"))
        .and_then(Value::as_array)
        .map(|labels| {
            labels
                .iter()
                .filter_map(Value::as_str)
                .collect()
        })
        .unwrap_or_default()
}

/// Structural check that a value is admitted by a schema. Covers the
/// subset this runtime cares about: primitive types, `enum`, `anyOf`,
/// `properties` + `required`, `items`, `additionalProperties`.
pub fn admits(schema: &Value, root: Option<&Value>, value: &Value) -> bool {
    let schema = resolve_ref(schema, root);
    if let Some(options) = schema.get("enum").and_then(Value::as_array) {
        return options
            .iter()
            .any(|o| crate::value::deep_equal(Some(o), Some(value)));
    }
    if let Some(branches) = schema.get("anyOf").and_then(Value::as_array) {
        return branches.iter().any(|b| admits(b, root, value));
    }
    match schema.get("type").and_then(Value::as_str) {
        None => true,
        Some("null") => matches!(value, Value::Null),
        Some("boolean") => matches!(value, Value::Bool(_)),
        Some("number") | Some("integer") => matches!(value, Value::Number(_)),
        Some("string") => matches!(value, Value::String(_)),
        Some("array") => match value {
            Value::Array(elements) => match schema.get("items") {
                Some(items) => elements.iter().all(|e| admits(items, root, e)),
                None => true,
            },
            Value::Link(_) => true,
            _ => false,
        },
        Some("object") => match value {
            Value::Object(properties) => {
                if let Some(required) = schema.get("required").and_then(Value::as_array) {
                    for name in required.iter().filter_map(Value::as_str) {
                        if !properties.contains_key(name) {
                            return false;
                        }
                    }
                }
                let props = schema.get("properties").and_then(Value::as_object);
                for (key, child) in properties {
                    match props.and_then(|p| p.get(key)) {
                        Some(child_schema) => {
                            if !admits(child_schema, root, child) {
                                return false;
                            }
                        }
                        None => match schema.get("additionalProperties") {
                            Some(Value::Bool(false)) => return false,
                            Some(extra @ Value::Object(_)) => {
                                if !admits(extra, root, child) {
                                    return false;
                                }
                            }
                            _ => {}
                        },
                    }
                }
                true
            }
            Value::Link(_) => true,
            _ => false,
        },
        Some(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object;
    use crate::path;

    fn schema_json(s: &str) -> Value {
        serde_json::from_str(s).unwrap()
    }

    #[test]
    fn ref_resolution_with_use_site_default() {
        let root = schema_json(
            r##"{
                "type": "object",
                "properties": {
                    "count": { "$ref": "#/$defs/count", "default": 5 }
                },
                "$defs": {
                    "count": { "type": "number", "default": 1 }
                }
            }"##,
        );
        let count = schema_at_child(&root, Some(&root), "count").unwrap();
        assert_eq!(default_of(&count, Some(&root)), Some(Value::Number(5.0)));
    }

    #[test]
    fn array_length_inherits_classification() {
        let root = schema_json(
            r##"{
                "type": "array",
                "items": { "type": "string" },
                "ifc": { "classification": ["secret"] }
            }"##,
        );
        let length = schema_at_child(&root, Some(&root), LENGTH).unwrap();
        assert_eq!(classification(&length), ["secret"].into_iter().collect());
    }

    #[test]
    fn path_walk_through_items() {
        let root = schema_json(
            r##"{
                "type": "object",
                "properties": {
                    "rows": { "type": "array", "items": { "type": "number" } }
                }
            }"##,
        );
        let leaf = schema_at_path(&root, Some(&root), &path!("rows", "3")).unwrap();
        assert_eq!(leaf.get("type").and_then(Value::as_str), Some("number"));
    }

    #[test]
    fn lattice_lub_is_union() {
        let a: Labels = ["x"].into_iter().collect();
        let b: Labels = ["y"].into_iter().collect();
        assert_eq!(a.lub(&b), ["x", "y"].into_iter().collect());
    }

    #[test]
    fn admits_enum_and_required() {
        let schema = schema_json(
            r##"{
                "type": "object",
                "required": ["name"],
                "properties": {
                    "name": { "enum": ["a", "b"] }
                }
            }"##,
        );
        assert!(admits(&schema, None, &object! { "name" => "a" }));
        assert!(!admits(&schema, None, &object! { "name" => "c" }));
        assert!(!admits(&schema, None, &Value::object()));
    }
}
