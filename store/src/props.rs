//! Property tests over the core data structures.

use crate::id::EntityId;
use crate::link::{parse_link, Link, LinkContext, LinkId};
use crate::path::{compare_paths, sort_and_compact_paths, PathBuf};
use crate::reactivity::{determine_triggered_actions, SortedAndCompactPaths};
use crate::refs::create_ref;
use crate::replica::{Operation, PendingRead, Replica};
use crate::value::{deep_equal, Object, Value};
use proptest::prelude::*;

fn arb_value() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        (-1000i64..1000).prop_map(|n| Value::Number(n as f64)),
        "[a-z]{0,8}".prop_map(Value::String),
    ];
    leaf.prop_recursive(3, 24, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::btree_map("[a-z]{1,4}", inner, 0..4)
                .prop_map(|m| Value::Object(m.into_iter().collect::<Object>())),
        ]
    })
}

fn arb_path() -> impl Strategy<Value = PathBuf> {
    prop::collection::vec("[a-c]{1,2}", 0..4).prop_map(|v| v.into_iter().collect())
}

fn arb_entity_id() -> impl Strategy<Value = EntityId> {
    any::<[u8; 32]>().prop_map(EntityId::new)
}

proptest! {
    // Equal canonicalizable inputs always derive equal ids.
    #[test]
    fn identity_is_deterministic(source in arb_value(), cause in arb_value()) {
        let a = create_ref(&source, &cause);
        let b = create_ref(&source, &cause);
        prop_assert_eq!(a.unwrap(), b.unwrap());
    }

    #[test]
    fn entity_uri_round_trips(id in arb_entity_id()) {
        prop_assert_eq!(EntityId::from_uri(&id.to_uri()).unwrap(), id);
    }

    #[test]
    fn link_serialization_round_trips(id in arb_entity_id(), path in arb_path()) {
        let space: crate::id::SpaceId = "did:key:props".parse().unwrap();
        let link = Link {
            space: Some(space.clone()),
            id: LinkId::Entity(id),
            path,
            media_type: crate::id::MediaType::Json,
            schema: None,
            root_schema: None,
        };
        let json = serde_json::to_string(&Value::Link(link.clone())).unwrap();
        let back: Value = serde_json::from_str(&json).unwrap();
        let ctx = LinkContext { space: Some(space), root_schema: None };
        let normalized = parse_link(&back, &ctx).unwrap();
        prop_assert_eq!(normalized, crate::link::normalize_link(&link, &ctx).unwrap());
    }

    // Compaction keeps the set sorted, prefix-free, and coverage-equal.
    #[test]
    fn compaction_is_sorted_prefix_free_and_covering(
        paths in prop::collection::vec(arb_path(), 0..8)
    ) {
        let compact = sort_and_compact_paths(paths.clone());
        for window in compact.windows(2) {
            prop_assert!(compare_paths(&window[0], &window[1]).is_lt());
            prop_assert!(!window[1].starts_with(&window[0]));
        }
        let covered = |set: &[PathBuf], p: &PathBuf| set.iter().any(|q| p.starts_with(q));
        for p in &paths {
            prop_assert!(covered(&compact, p));
        }
        for p in &compact {
            prop_assert!(covered(&paths.iter().cloned().collect::<Vec<_>>(), p)
                || paths.iter().any(|q| q.starts_with(p)));
        }
    }

    // The engine agrees with the naive quantified definition.
    #[test]
    fn triggering_matches_naive_definition(
        before in arb_value(),
        after in arb_value(),
        dep_paths in prop::collection::vec(
            prop::collection::vec(arb_path(), 1..3),
            1..5,
        )
    ) {
        let subscribers: Vec<(usize, SortedAndCompactPaths)> = dep_paths
            .iter()
            .enumerate()
            .map(|(ix, paths)| (ix, paths.iter().cloned().collect()))
            .collect();
        let fired = determine_triggered_actions(&subscribers, Some(&before), Some(&after), None);
        let naive: Vec<usize> = subscribers
            .iter()
            .filter(|(_, paths)| {
                paths.paths().iter().any(|p| {
                    let b = crate::path::get_value_at(&before, p);
                    let a = crate::path::get_value_at(&after, p);
                    !deep_equal(b.as_deref(), a.as_deref())
                })
            })
            .map(|(ix, _)| *ix)
            .collect();
        prop_assert_eq!(fired, naive);
    }

    // Reads return the newest pending write, else confirmed.
    #[test]
    fn two_tier_read_ordering(values in prop::collection::vec(arb_value(), 1..5)) {
        let id = EntityId::new([1; 32]);
        let mut replica = Replica::new();
        let first = replica.commit(
            vec![Operation::Set { id, value: values[0].clone() }],
            vec![],
            vec![],
        );
        replica.confirm(first.hash, 1);
        for value in &values[1..] {
            replica.commit(
                vec![Operation::Set { id, value: value.clone() }],
                vec![],
                vec![],
            );
        }
        let read = replica.read(id).unwrap();
        let expected = values.last().unwrap();
        prop_assert!(deep_equal(read.value.as_ref(), Some(expected)));
    }

    // After a reject, no pending commit transitively depends on it.
    #[test]
    fn cascade_rejection_closes(chain_len in 1usize..6) {
        let mut replica = Replica::new();
        let mut hashes = Vec::new();
        for n in 0..chain_len {
            let id = EntityId::new([n as u8; 32]);
            let pending_reads = match hashes.last() {
                Some(prev) => vec![PendingRead { id: EntityId::new([(n - 1) as u8; 32]), from_commit: *prev }],
                None => vec![],
            };
            let receipt = replica.commit(
                vec![Operation::Set { id, value: Value::from(n as i64) }],
                vec![],
                pending_reads,
            );
            hashes.push(receipt.hash);
        }
        replica.reject(hashes[0]);
        prop_assert_eq!(replica.pending_len(), 0);
    }
}
