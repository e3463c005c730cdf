use crate::link::Link;
use serde::de::Deserializer;
use serde::ser::{SerializeMap, SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Property map of an object value. Keys are kept sorted so canonical
/// serialization is stable.
pub type Object = BTreeMap<String, Value>;

/// A JSON document value.
///
/// Embedded links are first class: a value position can hold a [`Link`] to
/// `(space, entity, path)` instead of inlined data. Everything else follows
/// the JSON data model, with numbers as `f64`.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// JSON `null`.
    Null,
    /// JSON boolean.
    Bool(bool),
    /// JSON number.
    Number(f64),
    /// JSON string.
    String(String),
    /// JSON array.
    Array(Vec<Value>),
    /// JSON object.
    Object(Object),
    /// An embedded cross-document link.
    Link(Link),
}

impl Value {
    /// Returns the value kind as a static string, for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::Array(_) => "array",
            Self::Object(_) => "object",
            Self::Link(_) => "link",
        }
    }

    /// Creates an empty object value.
    pub fn object() -> Self {
        Self::Object(Object::new())
    }

    /// Creates an empty array value.
    pub fn array() -> Self {
        Self::Array(Vec::new())
    }

    /// Returns the boolean if this is a `Bool`.
    pub fn as_bool(&self) -> Option<bool> {
        if let Self::Bool(b) = self {
            Some(*b)
        } else {
            None
        }
    }

    /// Returns the number if this is a `Number`.
    pub fn as_number(&self) -> Option<f64> {
        if let Self::Number(n) = self {
            Some(*n)
        } else {
            None
        }
    }

    /// Returns the string if this is a `String`.
    pub fn as_str(&self) -> Option<&str> {
        if let Self::String(s) = self {
            Some(s.as_str())
        } else {
            None
        }
    }

    /// Returns the elements if this is an `Array`.
    pub fn as_array(&self) -> Option<&Vec<Value>> {
        if let Self::Array(a) = self {
            Some(a)
        } else {
            None
        }
    }

    /// Returns the elements mutably if this is an `Array`.
    pub fn as_array_mut(&mut self) -> Option<&mut Vec<Value>> {
        if let Self::Array(a) = self {
            Some(a)
        } else {
            None
        }
    }

    /// Returns the properties if this is an `Object`.
    pub fn as_object(&self) -> Option<&Object> {
        if let Self::Object(o) = self {
            Some(o)
        } else {
            None
        }
    }

    /// Returns the properties mutably if this is an `Object`.
    pub fn as_object_mut(&mut self) -> Option<&mut Object> {
        if let Self::Object(o) = self {
            Some(o)
        } else {
            None
        }
    }

    /// Returns the link if this is a `Link`.
    pub fn as_link(&self) -> Option<&Link> {
        if let Self::Link(l) = self {
            Some(l)
        } else {
            None
        }
    }

    /// Property lookup on objects; `None` for every other kind.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_object().and_then(|o| o.get(key))
    }

    /// Canonical byte encoding used for content hashing. Object keys are
    /// already sorted, so `serde_json` output is stable.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("value serialization is infallible")
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Number(n as f64)
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Self::Number(n as f64)
    }
}

impl From<usize> for Value {
    fn from(n: usize) -> Self {
        Self::Number(n as f64)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<Link> for Value {
    fn from(l: Link) -> Self {
        Self::Link(l)
    }
}

impl<V: Into<Value>> FromIterator<V> for Value {
    fn from_iter<I: IntoIterator<Item = V>>(iter: I) -> Self {
        Self::Array(iter.into_iter().map(Into::into).collect())
    }
}

/// Structural equality with `Object.is` semantics at number leaves:
/// `NaN` equals `NaN` and `0.0` differs from `-0.0`. A missing value
/// (`None`) never equals a present one, so `undefined` and `null` stay
/// distinguishable.
pub fn deep_equal(a: Option<&Value>, b: Option<&Value>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => deep_equal_value(a, b),
        _ => false,
    }
}

fn deep_equal_value(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Number(a), Value::Number(b)) => number_is(*a, *b),
        (Value::String(a), Value::String(b)) => a == b,
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(a, b)| deep_equal_value(a, b))
        }
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a.iter().zip(b).all(|((ka, va), (kb, vb))| {
                    ka == kb && deep_equal_value(va, vb)
                })
        }
        (Value::Link(a), Value::Link(b)) => a.same_target(b),
        _ => false,
    }
}

/// `Object.is` for numbers.
pub fn number_is(a: f64, b: f64) -> bool {
    if a.is_nan() && b.is_nan() {
        return true;
    }
    a == b && a.is_sign_positive() == b.is_sign_positive()
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Null => serializer.serialize_unit(),
            Self::Bool(b) => serializer.serialize_bool(*b),
            Self::Number(n) => {
                if !n.is_finite() {
                    // JSON cannot carry NaN or infinities.
                    serializer.serialize_unit()
                } else if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
                    serializer.serialize_i64(*n as i64)
                } else {
                    serializer.serialize_f64(*n)
                }
            }
            Self::String(s) => serializer.serialize_str(s),
            Self::Array(a) => {
                let mut seq = serializer.serialize_seq(Some(a.len()))?;
                for v in a {
                    seq.serialize_element(v)?;
                }
                seq.end()
            }
            Self::Object(o) => {
                let mut map = serializer.serialize_map(Some(o.len()))?;
                for (k, v) in o {
                    map.serialize_entry(k, v)?;
                }
                map.end()
            }
            Self::Link(l) => l.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = serde_json::Value::deserialize(deserializer)?;
        Ok(Self::from_json(raw))
    }
}

impl Value {
    /// Converts from `serde_json`, detecting link sigils on the way in.
    pub fn from_json(raw: serde_json::Value) -> Self {
        match raw {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => Self::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(a) => {
                Self::Array(a.into_iter().map(Self::from_json).collect())
            }
            serde_json::Value::Object(o) => {
                let value = Self::Object(
                    o.into_iter().map(|(k, v)| (k, Self::from_json(v))).collect(),
                );
                match Link::from_sigil(&value) {
                    Some(link) => Self::Link(link),
                    None => value,
                }
            }
        }
    }

    /// Converts to `serde_json`, rendering links as their sigil form.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("value serialization is infallible")
    }
}

/// Builds an object value from key/value pairs.
#[macro_export]
macro_rules! object {
    ($($key:expr => $value:expr),* $(,)?) => {{
        let mut map = $crate::value::Object::new();
        $(map.insert($key.to_string(), $crate::value::Value::from($value));)*
        $crate::value::Value::Object(map)
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_is_numbers() {
        assert!(deep_equal(
            Some(&Value::Number(f64::NAN)),
            Some(&Value::Number(f64::NAN))
        ));
        assert!(!deep_equal(
            Some(&Value::Number(0.0)),
            Some(&Value::Number(-0.0))
        ));
        assert!(deep_equal(Some(&Value::Number(1.5)), Some(&Value::Number(1.5))));
    }

    #[test]
    fn undefined_is_not_null() {
        assert!(!deep_equal(None, Some(&Value::Null)));
        assert!(deep_equal(None, None));
    }

    #[test]
    fn canonical_bytes_sort_keys() {
        let a = object! { "b" => 1i64, "a" => 2i64 };
        let b = object! { "a" => 2i64, "b" => 1i64 };
        assert_eq!(a.canonical_bytes(), b.canonical_bytes());
    }

    #[test]
    fn integral_numbers_serialize_without_fraction() {
        let v = Value::Number(4.0);
        assert_eq!(serde_json::to_string(&v).unwrap(), "4");
        let v = Value::Number(4.5);
        assert_eq!(serde_json::to_string(&v).unwrap(), "4.5");
    }
}
