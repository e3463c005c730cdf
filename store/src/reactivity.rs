//! Path-precise change detection.
//!
//! Every registered action carries a compacted set of paths it reads. When
//! a document changes, the engine decides which actions must re-run by
//! comparing the before and after values at exactly those paths, visiting
//! each subtree at most once per unique target path.

use crate::id::{EntityId, MediaType, SpaceId};
use crate::link::Address;
use crate::path::{compare_paths, sort_and_compact_paths, PathBuf, LENGTH};
use crate::value::{deep_equal, Value};
use fnv::FnvHashMap;
use std::borrow::Cow;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// The per-document part of a dependency address.
pub type DocKey = (SpaceId, EntityId, MediaType);

/// A sorted set of paths with every path that extends another removed,
/// since watching the shorter path covers the longer.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SortedAndCompactPaths(Vec<PathBuf>);

impl SortedAndCompactPaths {
    /// Sorts and compacts a set of paths.
    pub fn new(paths: Vec<PathBuf>) -> Self {
        Self(sort_and_compact_paths(paths))
    }

    /// The compacted paths in order.
    pub fn paths(&self) -> &[PathBuf] {
        &self.0
    }

    /// True if no path is watched.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True if `path` or one of its prefixes is watched.
    pub fn covers(&self, path: &PathBuf) -> bool {
        self.0.iter().any(|p| path.starts_with(p) || p.starts_with(path))
    }
}

impl FromIterator<PathBuf> for SortedAndCompactPaths {
    fn from_iter<I: IntoIterator<Item = PathBuf>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// Groups dependency addresses by document, compacting the paths per
/// document. Sorting is by `(space, id, media_type, path)` in that order.
pub fn group_by_document(
    addresses: impl IntoIterator<Item = Address>,
) -> FnvHashMap<DocKey, SortedAndCompactPaths> {
    let mut grouped: FnvHashMap<DocKey, Vec<PathBuf>> = FnvHashMap::default();
    let mut addresses: Vec<Address> = addresses.into_iter().collect();
    addresses.sort();
    for address in addresses {
        grouped.entry(address.doc_key()).or_default().push(address.path);
    }
    grouped
        .into_iter()
        .map(|(key, paths)| (key, SortedAndCompactPaths::new(paths)))
        .collect()
}

struct Pending<'s> {
    subscriber: usize,
    paths: Vec<&'s PathBuf>,
    cursor: usize,
}

impl Pending<'_> {
    fn current(&self) -> &PathBuf {
        self.paths[self.cursor]
    }
}

impl PartialEq for Pending<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Pending<'_> {}

impl Ord for Pending<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap pops the greatest path first, so descent shares the
        // longest possible prefix with the previously visited path.
        compare_paths(self.current(), other.current())
            .then_with(|| other.subscriber.cmp(&self.subscriber))
    }
}

impl PartialOrd for Pending<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

fn step<'a>(value: Option<&Cow<'a, Value>>, component: &str) -> Option<Cow<'a, Value>> {
    match value? {
        Cow::Borrowed(inner) => {
            let inner: &'a Value = *inner;
            match inner {
                Value::Object(o) => o.get(component).map(Cow::Borrowed),
                Value::Array(a) => {
                    if component == LENGTH {
                        Some(Cow::Owned(Value::from(a.len())))
                    } else {
                        component
                            .parse::<usize>()
                            .ok()
                            .and_then(|ix| a.get(ix))
                            .map(Cow::Borrowed)
                    }
                }
                _ => None,
            }
        }
        Cow::Owned(owned) => {
            let path: PathBuf = std::iter::once(component).collect();
            crate::path::get_value_at(owned, &path).map(|v| Cow::Owned(v.into_owned()))
        }
    }
}

/// Returns the subset of subscribers with at least one watched path where
/// the before and after values differ by deep-equal, in registration order.
///
/// When `start_path` is given, watched paths are filtered to those starting
/// with it and the before/after values are taken to be rooted at
/// `start_path`. A single pass visits each before/after subtree at most
/// once per unique target path; parallel value stacks carry the values
/// along the currently-traversed prefix so overlapping subscribers share
/// the descent.
pub fn determine_triggered_actions<K: Clone>(
    subscribers: &[(K, SortedAndCompactPaths)],
    before: Option<&Value>,
    after: Option<&Value>,
    start_path: Option<&PathBuf>,
) -> Vec<K> {
    let mut stripped: Vec<Vec<PathBuf>> = Vec::new();
    for (_, paths) in subscribers {
        let relevant: Vec<PathBuf> = match start_path {
            Some(start) => paths
                .paths()
                .iter()
                .filter_map(|p| {
                    if p.starts_with(start) {
                        p.strip_prefix(start)
                    } else if start.starts_with(p) {
                        // Watching a prefix of the changed subtree covers
                        // the whole subtree.
                        Some(PathBuf::new())
                    } else {
                        None
                    }
                })
                .collect(),
            None => paths.paths().to_vec(),
        };
        stripped.push(sort_and_compact_paths(relevant));
    }
    // Each subscriber consumes its paths longest-first, so the heap pops
    // in globally descending path order and the stacks never thrash.
    let mut heap: BinaryHeap<Pending> = stripped
        .iter()
        .enumerate()
        .filter(|(_, paths)| !paths.is_empty())
        .map(|(subscriber, paths)| Pending {
            subscriber,
            cursor: paths.len() - 1,
            paths: paths.iter().collect(),
        })
        .collect();

    let mut prefix: Vec<String> = Vec::new();
    let mut before_stack: Vec<Option<Cow<Value>>> = vec![before.map(Cow::Borrowed)];
    let mut after_stack: Vec<Option<Cow<Value>>> = vec![after.map(Cow::Borrowed)];
    let mut triggered: Vec<usize> = Vec::new();

    while let Some(mut pending) = heap.pop() {
        let target = pending.current().clone();
        let common = prefix
            .iter()
            .zip(target.components())
            .take_while(|(a, b)| a == b)
            .count();
        prefix.truncate(common);
        before_stack.truncate(common + 1);
        after_stack.truncate(common + 1);
        for component in &target.components()[common..] {
            let next_before = step(before_stack.last().unwrap().as_ref(), component);
            let next_after = step(after_stack.last().unwrap().as_ref(), component);
            before_stack.push(next_before);
            after_stack.push(next_after);
            prefix.push(component.clone());
        }
        let changed = !deep_equal(
            before_stack.last().unwrap().as_deref(),
            after_stack.last().unwrap().as_deref(),
        );
        if changed {
            triggered.push(pending.subscriber);
        } else if pending.cursor > 0 {
            pending.cursor -= 1;
            heap.push(pending);
        }
    }

    triggered.sort_unstable();
    triggered
        .into_iter()
        .map(|ix| subscribers[ix].0.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object;
    use crate::path;

    fn subs(specs: &[(&str, &[&[&str]])]) -> Vec<(String, SortedAndCompactPaths)> {
        specs
            .iter()
            .map(|(name, paths)| {
                (
                    name.to_string(),
                    paths
                        .iter()
                        .map(|p| p.iter().copied().collect::<PathBuf>())
                        .collect(),
                )
            })
            .collect()
    }

    #[test]
    fn fires_only_on_changed_paths() {
        let subscribers = subs(&[
            ("a", &[&["x"]]),
            ("b", &[&["y"]]),
            ("c", &[&["x", "deep"], &["y"]]),
        ]);
        let before = object! { "x" => object! { "deep" => 1i64 }, "y" => 2i64 };
        let after = object! { "x" => object! { "deep" => 9i64 }, "y" => 2i64 };
        let fired = determine_triggered_actions(&subscribers, Some(&before), Some(&after), None);
        assert_eq!(fired, vec!["a".to_string(), "c".to_string()]);
    }

    #[test]
    fn matches_naive_definition() {
        let subscribers = subs(&[
            ("r", &[&["list", "length"]]),
            ("s", &[&["list", "0"]]),
            ("t", &[&["other"]]),
        ]);
        let before = object! { "list" => Value::Array(vec![Value::from(1i64)]) };
        let after = object! {
            "list" => Value::Array(vec![Value::from(1i64), Value::from(2i64)]),
        };
        let fired = determine_triggered_actions(&subscribers, Some(&before), Some(&after), None);
        // length changed, element 0 did not, `other` stayed missing
        assert_eq!(fired, vec!["r".to_string()]);
    }

    #[test]
    fn start_path_filters_and_reroots() {
        let subscribers = subs(&[
            ("a", &[&["doc", "x"]]),
            ("b", &[&["doc"]]),
            ("c", &[&["elsewhere"]]),
        ]);
        // before/after are rooted at "doc"
        let before = object! { "x" => 1i64 };
        let after = object! { "x" => 2i64 };
        let fired = determine_triggered_actions(
            &subscribers,
            Some(&before),
            Some(&after),
            Some(&path!("doc")),
        );
        assert_eq!(fired, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn missing_vs_null_triggers() {
        let subscribers = subs(&[("a", &[&["k"]])]);
        let before = Value::object();
        let after = object! { "k" => Value::Null };
        let fired = determine_triggered_actions(&subscribers, Some(&before), Some(&after), None);
        assert_eq!(fired, vec!["a".to_string()]);
    }

    #[test]
    fn deterministic_and_set_equal() {
        let subscribers = subs(&[
            ("s1", &[&["a", "b"], &["c"]]),
            ("s2", &[&["a"]]),
            ("s3", &[&["c", "d", "e"]]),
        ]);
        let before = object! {
            "a" => object! { "b" => 1i64 },
            "c" => object! { "d" => object! { "e" => 1i64 } },
        };
        let after = object! {
            "a" => object! { "b" => 2i64 },
            "c" => object! { "d" => object! { "e" => 2i64 } },
        };
        let first = determine_triggered_actions(&subscribers, Some(&before), Some(&after), None);
        let second = determine_triggered_actions(&subscribers, Some(&before), Some(&after), None);
        assert_eq!(first, second);
        assert_eq!(
            first,
            vec!["s1".to_string(), "s2".to_string(), "s3".to_string()]
        );
    }
}
