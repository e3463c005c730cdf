//! Deterministic entity ids from `(source, cause)` pairs.

use crate::error::{Error, Result};
use crate::id::EntityId;
use crate::link::LinkId;
use crate::value::{Object, Value};

/// Traversal bound of the normalizing pass. Revisiting deeper than this is
/// treated as a cycle and normalizes to null.
const MAX_NORMALIZE_DEPTH: usize = 64;

/// Computes a content-addressed entity id from a source value and the cause
/// that produced it.
///
/// Both inputs go through a normalizing traversal first: links are replaced
/// by their target's id sigil (or a random id when the target has no stable
/// identity yet), id sigils pass through untouched, and over-deep descent is
/// cut to null. Equal canonicalized pairs therefore produce equal ids; the
/// random fallback only guarantees progress, so callers relying on
/// determinism must pre-assign ids.
pub fn create_ref(source: &Value, cause: &Value) -> Result<EntityId> {
    let mut pair = Object::new();
    pair.insert("cause".into(), normalize(cause, 0)?);
    pair.insert("source".into(), normalize(source, 0)?);
    Ok(hash_value(&Value::Object(pair)))
}

/// Derives an id for a value produced from another entity, e.g. the result
/// document of an array-deriving operation.
pub fn derive_ref(parent: EntityId, operation: &str, cause: &Value) -> Result<EntityId> {
    let mut source = Object::new();
    source.insert("of".into(), Value::from(parent.to_uri()));
    source.insert("operation".into(), Value::from(operation));
    create_ref(&Value::Object(source), cause)
}

fn hash_value(value: &Value) -> EntityId {
    EntityId::new(blake3::hash(&value.canonical_bytes()).into())
}

fn normalize(value: &Value, depth: usize) -> Result<Value> {
    if depth > MAX_NORMALIZE_DEPTH {
        return Ok(Value::Null);
    }
    match value {
        Value::Link(link) => {
            let id = match &link.id {
                LinkId::Entity(id) => *id,
                // Inline data has no stable referent; fall back to a
                // random id so traversal makes progress.
                LinkId::Data(_) => EntityId::random()?,
            };
            let mut sigil = Object::new();
            sigil.insert("/".into(), Value::from(id.to_uri()));
            Ok(Value::Object(sigil))
        }
        Value::Object(o) => {
            if is_id_sigil(o) {
                return Ok(value.clone());
            }
            let mut out = Object::new();
            for (key, child) in o {
                out.insert(key.clone(), normalize(child, depth + 1)?);
            }
            Ok(Value::Object(out))
        }
        Value::Array(a) => Ok(Value::Array(
            a.iter()
                .map(|child| normalize(child, depth + 1))
                .collect::<Result<_>>()?,
        )),
        Value::Number(n) if !n.is_finite() => Err(Error::InvalidIdentity(
            "non-finite number cannot be canonicalized".into(),
        )),
        other => Ok(other.clone()),
    }
}

fn is_id_sigil(o: &Object) -> bool {
    o.len() == 1 && matches!(o.get("/"), Some(Value::String(_)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::SpaceId;
    use crate::link::Link;
    use crate::object;

    #[test]
    fn deterministic_for_equal_inputs() {
        let source = object! { "a" => 1i64, "b" => object! { "c" => "x" } };
        let cause = object! { "origin" => "test" };
        assert_eq!(
            create_ref(&source, &cause).unwrap(),
            create_ref(&source, &cause).unwrap()
        );
    }

    #[test]
    fn cause_participates() {
        let source = object! { "a" => 1i64 };
        let a = create_ref(&source, &Value::from("one")).unwrap();
        let b = create_ref(&source, &Value::from("two")).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn links_normalize_to_their_id() {
        let space: SpaceId = "did:key:test".parse().unwrap();
        let target = EntityId::new([4; 32]);
        let with_link = object! {
            "ref" => Value::Link(Link::to_entity(space, target)),
        };
        let with_sigil = object! {
            "ref" => object! { "/" => target.to_uri() },
        };
        assert_eq!(
            create_ref(&with_link, &Value::Null).unwrap(),
            create_ref(&with_sigil, &Value::Null).unwrap()
        );
    }

    #[test]
    fn non_finite_numbers_are_rejected() {
        let source = object! { "n" => f64::NAN };
        let err = create_ref(&source, &Value::Null).unwrap_err();
        assert!(matches!(err, Error::InvalidIdentity(_)));
    }
}
