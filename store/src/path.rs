use crate::value::{deep_equal, Value};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::borrow::Cow;
use std::cmp::Ordering;

/// Pseudo-component addressing an array's length.
pub const LENGTH: &str = "length";

/// An owned sequence of string components identifying a position inside a
/// document value. Array indices are decimal strings.
#[derive(Clone, Default, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PathBuf(SmallVec<[String; 8]>);

impl PathBuf {
    /// Creates an empty path addressing the document root.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a component.
    pub fn push(&mut self, component: impl Into<String>) {
        self.0.push(component.into());
    }

    /// Appends an array index component.
    pub fn push_index(&mut self, index: usize) {
        self.0.push(index.to_string());
    }

    /// Removes and returns the last component.
    pub fn pop(&mut self) -> Option<String> {
        self.0.pop()
    }

    /// Returns the path without its last component.
    pub fn parent(&self) -> Option<PathBuf> {
        if self.0.is_empty() {
            None
        } else {
            Some(Self(self.0[..self.0.len() - 1].iter().cloned().collect()))
        }
    }

    /// Returns a new path with `component` appended.
    pub fn child(&self, component: impl Into<String>) -> PathBuf {
        let mut path = self.clone();
        path.push(component);
        path
    }

    /// Concatenates two paths.
    pub fn join(&self, rest: &PathBuf) -> PathBuf {
        let mut path = self.clone();
        path.0.extend(rest.0.iter().cloned());
        path
    }

    /// True if the path has no components.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of components.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Borrowed view of the components.
    pub fn components(&self) -> &[String] {
        &self.0
    }

    /// Elementwise prefix test.
    pub fn starts_with(&self, prefix: &PathBuf) -> bool {
        self.0.len() >= prefix.0.len() && self.0[..prefix.0.len()] == prefix.0[..]
    }

    /// Returns the path with `prefix` removed, or `None` if it is not a
    /// prefix.
    pub fn strip_prefix(&self, prefix: &PathBuf) -> Option<PathBuf> {
        if self.starts_with(prefix) {
            Some(Self(self.0[prefix.0.len()..].iter().cloned().collect()))
        } else {
            None
        }
    }
}

impl std::fmt::Debug for PathBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "/{}", self.0.join("/"))
    }
}

impl std::fmt::Display for PathBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl<S: Into<String>> FromIterator<S> for PathBuf {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

impl From<&[&str]> for PathBuf {
    fn from(components: &[&str]) -> Self {
        components.iter().copied().collect()
    }
}

/// Builds a [`PathBuf`] from component literals.
#[macro_export]
macro_rules! path {
    ($($component:expr),* $(,)?) => {{
        #[allow(unused_mut)]
        let mut path = $crate::path::PathBuf::new();
        $(path.push($component);)*
        path
    }};
}

/// Lexicographic comparison by component, ties broken by length.
pub fn compare_paths(a: &PathBuf, b: &PathBuf) -> Ordering {
    for (ca, cb) in a.components().iter().zip(b.components()) {
        match ca.cmp(cb) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    a.len().cmp(&b.len())
}

/// Sorts paths and removes every path that extends another, since watching
/// the shorter path covers all of its extensions.
pub fn sort_and_compact_paths(mut paths: Vec<PathBuf>) -> Vec<PathBuf> {
    paths.sort_by(compare_paths);
    let mut compact: Vec<PathBuf> = Vec::with_capacity(paths.len());
    for path in paths {
        match compact.last() {
            Some(prev) if path.starts_with(prev) => {}
            _ => compact.push(path),
        }
    }
    compact
}

fn parse_index(component: &str) -> Option<usize> {
    if component.starts_with('+') || (component.starts_with('0') && component.len() > 1) {
        return None;
    }
    component.parse().ok()
}

/// Stepwise descent; a missing intermediate yields `None`. The `length`
/// pseudo-component on arrays reads as their element count.
pub fn get_value_at<'a>(value: &'a Value, path: &PathBuf) -> Option<Cow<'a, Value>> {
    let mut current = Cow::Borrowed(value);
    for component in path.components() {
        let next = match current {
            Cow::Borrowed(Value::Object(o)) => o.get(component).map(Cow::Borrowed),
            Cow::Borrowed(Value::Array(a)) => {
                if component == LENGTH {
                    Some(Cow::Owned(Value::from(a.len())))
                } else {
                    parse_index(component).and_then(|ix| a.get(ix)).map(Cow::Borrowed)
                }
            }
            Cow::Owned(Value::Object(mut o)) => o.remove(component).map(Cow::Owned),
            Cow::Owned(Value::Array(mut a)) => {
                if component == LENGTH {
                    Some(Cow::Owned(Value::from(a.len())))
                } else {
                    parse_index(component).and_then(|ix| {
                        if ix < a.len() {
                            Some(Cow::Owned(a.swap_remove(ix)))
                        } else {
                            None
                        }
                    })
                }
            }
            _ => None,
        };
        current = next?;
    }
    Some(current)
}

/// Writes `new_value` at `path`, creating intermediate objects as needed.
/// `None` removes the position. Returns whether the document changed by
/// deep-equal. Writing a number to an array's `length` truncates or pads
/// with nulls.
pub fn set_value_at(value: &mut Value, path: &PathBuf, new_value: Option<Value>) -> bool {
    if path.is_empty() {
        return match new_value {
            Some(new_value) => {
                if deep_equal(Some(value), Some(&new_value)) {
                    false
                } else {
                    *value = new_value;
                    true
                }
            }
            None => {
                if matches!(value, Value::Null) {
                    false
                } else {
                    *value = Value::Null;
                    true
                }
            }
        };
    }

    let mut current = value;
    for component in &path.components()[..path.len() - 1] {
        current = match current {
            Value::Object(o) => o
                .entry(component.clone())
                .or_insert_with(Value::object),
            Value::Array(a) => match parse_index(component) {
                Some(ix) => {
                    while a.len() <= ix {
                        a.push(Value::Null);
                    }
                    &mut a[ix]
                }
                None => return false,
            },
            other => {
                // Descending through a scalar replaces it.
                *other = Value::object();
                other
                    .as_object_mut()
                    .expect("just created an object")
                    .entry(component.clone())
                    .or_insert_with(Value::object)
            }
        };
    }

    let last = &path.components()[path.len() - 1];
    match current {
        Value::Object(o) => match new_value {
            Some(new_value) => match o.get(last) {
                Some(existing) if deep_equal(Some(existing), Some(&new_value)) => false,
                _ => {
                    o.insert(last.clone(), new_value);
                    true
                }
            },
            None => o.remove(last).is_some(),
        },
        Value::Array(a) => {
            if last == LENGTH {
                let new_len = new_value
                    .as_ref()
                    .and_then(Value::as_number)
                    .map(|n| n as usize);
                match new_len {
                    Some(new_len) if new_len != a.len() => {
                        a.resize(new_len, Value::Null);
                        true
                    }
                    _ => false,
                }
            } else {
                match parse_index(last) {
                    Some(ix) => match new_value {
                        Some(new_value) => {
                            if a.get(ix).map_or(false, |existing| {
                                deep_equal(Some(existing), Some(&new_value))
                            }) {
                                return false;
                            }
                            while a.len() <= ix {
                                a.push(Value::Null);
                            }
                            a[ix] = new_value;
                            true
                        }
                        None => {
                            if ix + 1 == a.len() {
                                a.pop();
                                true
                            } else if ix < a.len() {
                                let changed = !matches!(a[ix], Value::Null);
                                a[ix] = Value::Null;
                                changed
                            } else {
                                false
                            }
                        }
                    },
                    None => false,
                }
            }
        }
        other => {
            let mut object = Value::object();
            let changed = set_value_at(&mut object, &path!(last.clone()), new_value);
            if changed {
                *other = object;
            }
            changed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object;

    #[test]
    fn get_descends() {
        let v = object! { "a" => object! { "b" => 7i64 } };
        let got = get_value_at(&v, &path!("a", "b")).unwrap();
        assert_eq!(got.as_number(), Some(7.0));
        assert!(get_value_at(&v, &path!("a", "x", "y")).is_none());
    }

    #[test]
    fn set_creates_intermediates() {
        let mut v = Value::object();
        assert!(set_value_at(&mut v, &path!("a", "b"), Some(Value::from(1i64))));
        assert_eq!(
            get_value_at(&v, &path!("a", "b")).unwrap().as_number(),
            Some(1.0)
        );
        // same value again is a no-op
        assert!(!set_value_at(&mut v, &path!("a", "b"), Some(Value::from(1i64))));
    }

    #[test]
    fn array_length_reads_and_writes() {
        let mut v = Value::Array(vec![Value::from(1i64), Value::from(2i64), Value::from(3i64)]);
        assert_eq!(
            get_value_at(&v, &path!(LENGTH)).unwrap().as_number(),
            Some(3.0)
        );
        assert!(set_value_at(&mut v, &path!(LENGTH), Some(Value::from(1i64))));
        assert_eq!(v.as_array().unwrap().len(), 1);
    }

    #[test]
    fn compare_orders_by_component_then_length() {
        let a = path!("a");
        let ab = path!("a", "b");
        let b = path!("b");
        assert_eq!(compare_paths(&a, &ab), Ordering::Less);
        assert_eq!(compare_paths(&ab, &b), Ordering::Less);
    }

    #[test]
    fn compact_removes_covered() {
        let paths = vec![path!("a", "b"), path!("a"), path!("b"), path!("a", "c")];
        let compact = sort_and_compact_paths(paths);
        assert_eq!(compact, vec![path!("a"), path!("b")]);
    }
}
