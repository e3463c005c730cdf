use crate::error::{Error, Result};
use crate::id::{EntityId, MediaType, SpaceId};
use crate::path::{get_value_at, set_value_at, PathBuf};
use crate::refs::create_ref;
use crate::value::Value;
use fnv::FnvHashMap;
use parking_lot::RwLock;
use std::sync::{Arc, Weak};

/// Sweep dead slots after this many store mutations.
const SWEEP_INTERVAL: usize = 64;

/// Per-space map of entity id → document.
///
/// The store holds documents weakly: once every caller has dropped its
/// [`Doc`] handle the entry may be collected, and lookups that find a dead
/// slot treat it as absent. Clonable handle over shared state, so callers
/// across the runtime observe one store.
#[derive(Clone, Default)]
pub struct DocumentStore {
    inner: Arc<RwLock<StoreInner>>,
}

#[derive(Default)]
struct StoreInner {
    spaces: FnvHashMap<SpaceId, SpaceDocs>,
    mutations: usize,
}

#[derive(Default)]
struct SpaceDocs {
    docs: FnvHashMap<(EntityId, MediaType), Weak<DocShared>>,
}

impl DocumentStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up a document, optionally creating it when missing.
    ///
    /// `id` accepts either the bare hash, the `of:` URI form, or the
    /// `{"/": …}` sigil rendered as a string by the caller.
    pub fn get_by_entity_id(
        &self,
        space: &SpaceId,
        id: &str,
        create_if_not_found: bool,
        source_if_created: Option<EntityId>,
    ) -> Result<Option<Doc>> {
        let id = EntityId::parse_flexible(id)?;
        self.get(space, id, MediaType::Json, create_if_not_found, source_if_created)
    }

    /// Looks up a document by parsed id.
    pub fn get(
        &self,
        space: &SpaceId,
        id: EntityId,
        media_type: MediaType,
        create_if_not_found: bool,
        source_if_created: Option<EntityId>,
    ) -> Result<Option<Doc>> {
        let mut inner = self.inner.write();
        inner.maybe_sweep();
        let docs = inner.spaces.entry(space.clone()).or_default();
        if let Some(existing) = docs
            .docs
            .get(&(id, media_type.clone()))
            .and_then(Weak::upgrade)
        {
            return Ok(Some(Doc { shared: existing }));
        }
        if !create_if_not_found {
            return Ok(None);
        }
        let doc = Doc::new(space.clone(), id, media_type.clone(), None);
        if let Some(source) = source_if_created {
            doc.shared.state.write().source = Some(source);
        }
        docs.docs
            .insert((id, media_type), Arc::downgrade(&doc.shared));
        inner.mutations += 1;
        Ok(Some(doc))
    }

    /// Installs a mapping for an externally-constructed document. Fails if
    /// a different live document is already registered for the id.
    pub fn register(&self, space: &SpaceId, id: EntityId, doc: &Doc) -> Result<()> {
        let mut inner = self.inner.write();
        inner.maybe_sweep();
        let docs = inner.spaces.entry(space.clone()).or_default();
        let key = (id, doc.media_type().clone());
        if let Some(existing) = docs.docs.get(&key).and_then(Weak::upgrade) {
            if Arc::ptr_eq(&existing, &doc.shared) {
                return Ok(());
            }
            return Err(Error::InvalidIdentity(format!(
                "{} is already registered to a different document",
                id.to_uri()
            )));
        }
        docs.docs.insert(key, Arc::downgrade(&doc.shared));
        inner.mutations += 1;
        Ok(())
    }

    /// Returns the existing document whose id `(value, cause)` hashes to,
    /// or creates it with `value` as its initial contents.
    pub fn get_or_create(&self, value: Value, cause: &Value, space: &SpaceId) -> Result<Doc> {
        let id = create_ref(&value, cause)?;
        let doc = self
            .get(space, id, MediaType::Json, true, None)?
            .expect("create_if_not_found always yields a document");
        {
            let mut state = doc.shared.state.write();
            if state.value.is_none() {
                state.value = Some(value);
            }
        }
        Ok(doc)
    }

    /// Drops all entries.
    pub fn cleanup(&self) {
        self.inner.write().spaces.clear();
    }
}

impl StoreInner {
    fn maybe_sweep(&mut self) {
        if self.mutations < SWEEP_INTERVAL {
            return;
        }
        self.mutations = 0;
        for space in self.spaces.values_mut() {
            space.docs.retain(|_, slot| slot.strong_count() > 0);
        }
    }
}

/// An update delivered to document subscribers.
#[derive(Clone, Debug)]
pub struct DocUpdate {
    /// Space of the changed document.
    pub space: SpaceId,
    /// Id of the changed document.
    pub id: EntityId,
    /// Path of the change within the document.
    pub path: PathBuf,
    /// Value at `path` before the change.
    pub before: Option<Value>,
    /// Value at `path` after the change.
    pub after: Option<Value>,
}

type UpdateFn = Arc<dyn Fn(&DocUpdate) + Send + Sync>;

struct DocState {
    value: Option<Value>,
    source: Option<EntityId>,
    frozen: bool,
    ephemeral: bool,
    subscribers: Vec<(u64, UpdateFn)>,
    next_subscriber: u64,
}

struct DocShared {
    space: SpaceId,
    id: EntityId,
    media_type: MediaType,
    state: RwLock<DocState>,
}

/// A clonable document handle.
#[derive(Clone)]
pub struct Doc {
    shared: Arc<DocShared>,
}

impl Doc {
    fn new(space: SpaceId, id: EntityId, media_type: MediaType, value: Option<Value>) -> Self {
        Self {
            shared: Arc::new(DocShared {
                space,
                id,
                media_type,
                state: RwLock::new(DocState {
                    value,
                    source: None,
                    frozen: false,
                    ephemeral: false,
                    subscribers: Vec::new(),
                    next_subscriber: 0,
                }),
            }),
        }
    }

    /// Returns the entity id.
    pub fn id(&self) -> EntityId {
        self.shared.id
    }

    /// Returns the space.
    pub fn space(&self) -> &SpaceId {
        &self.shared.space
    }

    /// Returns the media type.
    pub fn media_type(&self) -> &MediaType {
        &self.shared.media_type
    }

    /// Reads the raw document value.
    pub fn get(&self) -> Option<Value> {
        self.shared.state.read().value.clone()
    }

    /// Reads the value at a path.
    pub fn get_at(&self, path: &PathBuf) -> Option<Value> {
        let state = self.shared.state.read();
        let value = state.value.as_ref()?;
        get_value_at(value, path).map(|v| v.into_owned())
    }

    /// Writes the value at a path, creating intermediate objects as needed.
    /// Returns whether the document changed. Notifies subscribers.
    pub fn set_at(&self, path: &PathBuf, new_value: Option<Value>) -> Result<bool> {
        if !self.shared.media_type.is_json() && !path.is_empty() {
            return Err(Error::UnsupportedMediaType(
                self.shared.media_type.as_str().to_string(),
            ));
        }
        let (update, subscribers) = {
            let mut state = self.shared.state.write();
            if state.frozen {
                return Err(Error::FrozenDocument);
            }
            let value = state.value.get_or_insert_with(Value::object);
            let before = get_value_at(value, path).map(|v| v.into_owned());
            if !set_value_at(value, path, new_value.clone()) {
                return Ok(false);
            }
            let after = get_value_at(value, path).map(|v| v.into_owned());
            let update = DocUpdate {
                space: self.shared.space.clone(),
                id: self.shared.id,
                path: path.clone(),
                before,
                after,
            };
            (update, state.subscribers.clone())
        };
        for (_, subscriber) in &subscribers {
            subscriber(&update);
        }
        Ok(true)
    }

    /// Replaces the whole document value.
    pub fn send(&self, value: Value) -> Result<bool> {
        self.set_at(&PathBuf::new(), Some(value))
    }

    /// Subscribes to updates. The returned guard cancels on demand; cancel
    /// is idempotent.
    pub fn subscribe(&self, subscriber: impl Fn(&DocUpdate) + Send + Sync + 'static) -> DocSubscription {
        let mut state = self.shared.state.write();
        let token = state.next_subscriber;
        state.next_subscriber += 1;
        state.subscribers.push((token, Arc::new(subscriber)));
        DocSubscription {
            doc: Arc::downgrade(&self.shared),
            token,
        }
    }

    /// Freezes the document. Frozen documents reject all writes and cannot
    /// be thawed.
    pub fn freeze(&self) {
        self.shared.state.write().frozen = true;
    }

    /// True if the document is frozen.
    pub fn is_frozen(&self) -> bool {
        self.shared.state.read().frozen
    }

    /// Marks the document as ephemeral. Ephemeral documents are never
    /// pushed to storage but still participate in local reactivity.
    pub fn set_ephemeral(&self, ephemeral: bool) {
        self.shared.state.write().ephemeral = ephemeral;
    }

    /// True if the document is ephemeral.
    pub fn is_ephemeral(&self) -> bool {
        self.shared.state.read().ephemeral
    }

    /// Renders the document as its id sigil.
    pub fn to_json(&self) -> Value {
        let mut sigil = crate::value::Object::new();
        sigil.insert("/".into(), Value::from(self.shared.id.to_uri()));
        Value::Object(sigil)
    }

    /// Returns the source document id, if set.
    pub fn source(&self) -> Option<EntityId> {
        self.shared.state.read().source
    }

    /// Sets the source document. The source may be set at most once and a
    /// source chain may not loop back to this document.
    pub fn set_source(&self, store: &DocumentStore, source: EntityId) -> Result<()> {
        if let Some(existing) = self.source() {
            if existing == source {
                return Ok(());
            }
            return Err(Error::CycleViolation(format!(
                "source of {} is already set to {}",
                self.shared.id.to_uri(),
                existing.to_uri()
            )));
        }
        // Walk the prospective chain to reject loops.
        let mut cursor = Some(source);
        let mut hops = 0;
        while let Some(current) = cursor {
            if current == self.shared.id {
                return Err(Error::CycleViolation(format!(
                    "setting source of {} to {} closes a cycle",
                    self.shared.id.to_uri(),
                    source.to_uri()
                )));
            }
            hops += 1;
            if hops > 1024 {
                return Err(Error::CycleViolation("source chain too deep".into()));
            }
            cursor = store
                .get(&self.shared.space, current, MediaType::Json, false, None)?
                .and_then(|doc| doc.source());
        }
        self.shared.state.write().source = Some(source);
        Ok(())
    }
}

impl std::fmt::Debug for Doc {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Doc")
            .field("space", &self.shared.space)
            .field("id", &self.shared.id)
            .finish_non_exhaustive()
    }
}

/// Guard for a document subscription.
pub struct DocSubscription {
    doc: Weak<DocShared>,
    token: u64,
}

impl DocSubscription {
    /// Cancels the subscription. Idempotent.
    pub fn cancel(&self) {
        if let Some(doc) = self.doc.upgrade() {
            doc.state
                .write()
                .subscribers
                .retain(|(token, _)| *token != self.token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object;
    use crate::path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn space() -> SpaceId {
        "did:key:test".parse().unwrap()
    }

    #[test]
    fn lookup_is_idempotent() {
        let store = DocumentStore::new();
        let id = EntityId::new([1; 32]);
        let a = store
            .get(&space(), id, MediaType::Json, true, None)
            .unwrap()
            .unwrap();
        let b = store
            .get(&space(), id, MediaType::Json, false, None)
            .unwrap()
            .unwrap();
        assert!(Arc::ptr_eq(&a.shared, &b.shared));
    }

    #[test]
    fn dead_entries_read_as_absent() {
        let store = DocumentStore::new();
        let id = EntityId::new([2; 32]);
        {
            let _doc = store
                .get(&space(), id, MediaType::Json, true, None)
                .unwrap()
                .unwrap();
        }
        assert!(store
            .get(&space(), id, MediaType::Json, false, None)
            .unwrap()
            .is_none());
    }

    #[test]
    fn get_or_create_returns_existing() {
        let store = DocumentStore::new();
        let value = object! { "a" => 1i64 };
        let cause = Value::from("test");
        let a = store.get_or_create(value.clone(), &cause, &space()).unwrap();
        a.set_at(&path!("a"), Some(Value::from(2i64))).unwrap();
        let b = store.get_or_create(value, &cause, &space()).unwrap();
        // Same document, with the later write still visible.
        assert_eq!(b.get_at(&path!("a")).unwrap().as_number(), Some(2.0));
    }

    #[test]
    fn frozen_rejects_writes() {
        let store = DocumentStore::new();
        let doc = store
            .get(&space(), EntityId::new([3; 32]), MediaType::Json, true, None)
            .unwrap()
            .unwrap();
        doc.freeze();
        let err = doc.send(Value::object()).unwrap_err();
        assert!(matches!(err, Error::FrozenDocument));
    }

    #[test]
    fn source_is_monotone() {
        let store = DocumentStore::new();
        let doc = store
            .get(&space(), EntityId::new([4; 32]), MediaType::Json, true, None)
            .unwrap()
            .unwrap();
        let s1 = EntityId::new([5; 32]);
        let s2 = EntityId::new([6; 32]);
        doc.set_source(&store, s1).unwrap();
        doc.set_source(&store, s1).unwrap();
        assert!(doc.set_source(&store, s2).is_err());
        assert_eq!(doc.source(), Some(s1));
    }

    #[test]
    fn cyclic_source_is_rejected() {
        let store = DocumentStore::new();
        let a = store
            .get(&space(), EntityId::new([7; 32]), MediaType::Json, true, None)
            .unwrap()
            .unwrap();
        let b = store
            .get(&space(), EntityId::new([8; 32]), MediaType::Json, true, None)
            .unwrap()
            .unwrap();
        a.set_source(&store, b.id()).unwrap();
        let err = b.set_source(&store, a.id()).unwrap_err();
        assert!(matches!(err, Error::CycleViolation(_)));
    }

    #[test]
    fn subscriptions_fire_and_cancel() {
        let store = DocumentStore::new();
        let doc = store
            .get(&space(), EntityId::new([9; 32]), MediaType::Json, true, None)
            .unwrap()
            .unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let observed = calls.clone();
        let sub = doc.subscribe(move |update| {
            assert_eq!(update.path, path!("x"));
            observed.fetch_add(1, Ordering::SeqCst);
        });
        doc.set_at(&path!("x"), Some(Value::from(1i64))).unwrap();
        // unchanged write does not notify
        doc.set_at(&path!("x"), Some(Value::from(1i64))).unwrap();
        sub.cancel();
        sub.cancel();
        doc.set_at(&path!("x"), Some(Value::from(2i64))).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
