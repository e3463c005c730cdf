//! Path-scoped views onto documents.
//!
//! A [`Cursor`] presents the value at a link as if it were a native data
//! structure: reads transparently follow links and log read invariants,
//! writes run a diff against the current value so only changed positions
//! produce write invariants, and array operations preserve element
//! identity across rearrangement because links are ordinary values here.

use crate::error::{Error, Result};
use crate::id::EntityId;
use crate::link::{normalize_link, Address, LinkContext, NormalizedFullLink};
use crate::path::PathBuf;
use crate::refs::{create_ref, derive_ref};
use crate::schema;
use crate::store::Doc;
use crate::transaction::Transaction;
use crate::value::{deep_equal, number_is, Object, Value};

/// Hard cap on link-following depth.
pub const MAX_RECURSION_DEPTH: usize = 100;

/// Property naming the identity field of an object being written. The
/// value of that field is matched against sibling link targets so the
/// matching entity is reused instead of a new one being minted.
pub const ID_FIELD: &str = "$NAME";

/// Property carrying an explicit identity for an object being written. A
/// new entity id is derived from it and the parent context.
pub const ID: &str = "$ID";

/// An opaque reference to a cursor's position, suitable for inclusion in
/// derivation graphs.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OpaqueRef {
    /// Target space.
    pub space: crate::id::SpaceId,
    /// Target entity.
    pub id: Option<EntityId>,
    /// Position within the target.
    pub path: PathBuf,
}

impl std::fmt::Display for OpaqueRef {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self.id {
            Some(id) => write!(f, "{}/{}{}", self.space, id.to_uri(), self.path),
            None => write!(f, "{}/data{}", self.space, self.path),
        }
    }
}

/// A path-scoped, link-following view onto a document.
#[derive(Clone)]
pub struct Cursor {
    tx: Transaction,
    link: NormalizedFullLink,
    depth: usize,
    read_only: bool,
}

impl Cursor {
    /// Creates a cursor at a link.
    pub fn new(tx: Transaction, link: NormalizedFullLink) -> Self {
        Self {
            tx,
            link,
            depth: 0,
            read_only: false,
        }
    }

    /// Creates a read-only cursor; all writes fail.
    pub fn read_only(tx: Transaction, link: NormalizedFullLink) -> Self {
        Self {
            tx,
            link,
            depth: 0,
            read_only: true,
        }
    }

    /// The link this cursor addresses, before link resolution.
    pub fn link(&self) -> &NormalizedFullLink {
        &self.link
    }

    /// An opaque reference to this position.
    pub fn opaque_ref(&self) -> OpaqueRef {
        OpaqueRef {
            space: self.link.space.clone(),
            id: self.link.id.entity(),
            path: self.link.path.clone(),
        }
    }

    /// The transaction this cursor reads and writes through.
    pub fn tx(&self) -> &Transaction {
        &self.tx
    }

    fn ctx(&self) -> LinkContext {
        LinkContext {
            space: Some(self.link.space.clone()),
            root_schema: self.link.root_schema.clone(),
        }
    }

    /// Follows the link chain at the current position until the value is
    /// no longer a link. Depth is capped.
    fn resolved(&self) -> Result<NormalizedFullLink> {
        let mut link = self.link.clone();
        let mut depth = self.depth;
        loop {
            if depth > MAX_RECURSION_DEPTH {
                return Err(Error::RecursionLimit);
            }
            let address = match link.address() {
                Some(address) => address,
                // Inline data links have nothing further to follow here.
                None => return Ok(link),
            };
            match self.tx.peek(&address)? {
                Some(Value::Link(inner)) => {
                    let ctx = LinkContext {
                        space: Some(link.space.clone()),
                        root_schema: link.root_schema.clone(),
                    };
                    link = normalize_link(&inner, &ctx)?;
                    depth += 1;
                }
                _ => return Ok(link),
            }
        }
    }

    /// Reads the value at the cursor, following links, and logs the read.
    pub fn get(&self) -> Result<Option<Value>> {
        let link = self.resolved()?;
        match link.address() {
            Some(address) => self.tx.read(&address),
            None => Ok(link.id.inline_value()),
        }
    }

    /// Reads without logging; plumbing for diffs and array mutators.
    fn peek(&self) -> Result<Option<Value>> {
        let link = self.resolved()?;
        match link.address() {
            Some(address) => self.tx.peek(&address),
            None => Ok(link.id.inline_value()),
        }
    }

    /// Descends one property, following links at the current position.
    pub fn key(&self, component: impl Into<String>) -> Result<Cursor> {
        if self.depth >= MAX_RECURSION_DEPTH {
            return Err(Error::RecursionLimit);
        }
        let component = component.into();
        let link = self.resolved()?;
        let schema = link.schema.as_ref().and_then(|s| {
            schema::schema_at_child(s, link.root_schema.as_deref(), &component).map(std::sync::Arc::new)
        });
        Ok(Cursor {
            tx: self.tx.clone(),
            link: NormalizedFullLink {
                path: link.path.child(component),
                schema,
                ..link
            },
            depth: self.depth + 1,
            read_only: self.read_only,
        })
    }

    /// Descends to an array index.
    pub fn index(&self, ix: usize) -> Result<Cursor> {
        self.key(ix.to_string())
    }

    /// Property names of the object at the cursor, reflecting pending
    /// writes of the transaction.
    pub fn keys(&self) -> Result<Vec<String>> {
        Ok(match self.peek()? {
            Some(Value::Object(o)) => o.keys().cloned().collect(),
            _ => Vec::new(),
        })
    }

    /// True if the object at the cursor has the property.
    pub fn has(&self, component: &str) -> Result<bool> {
        Ok(match self.peek()? {
            Some(Value::Object(o)) => o.contains_key(component),
            _ => false,
        })
    }

    /// Length of the array at the cursor. Zero when absent or not an
    /// array.
    pub fn len(&self) -> Result<usize> {
        Ok(match self.peek()? {
            Some(Value::Array(a)) => a.len(),
            _ => 0,
        })
    }

    /// True when `len()` is zero.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Iterates the array at the cursor, one child cursor per index. The
    /// length is re-read on every step so pending writes are reflected.
    pub fn iter(&self) -> CursorIter {
        CursorIter {
            cursor: self.clone(),
            index: 0,
        }
    }

    /// Materializes one cursor per element, logging a read per element.
    /// This is the shallow snapshot standard traversal code works on.
    pub fn to_vec(&self) -> Result<Vec<Cursor>> {
        let len = self.len()?;
        let mut children = Vec::with_capacity(len);
        for ix in 0..len {
            let child = self.index(ix)?;
            child.get()?;
            children.push(child);
        }
        Ok(children)
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(Error::InactiveTransaction);
        }
        Ok(())
    }

    /// Writes `new_value` at the cursor through the diff-and-update
    /// algorithm: only positions whose value actually changes produce
    /// write invariants, object identity is reused where an identity field
    /// matches, and array shrinkage writes an explicit length carrying the
    /// array's classification.
    pub fn set(&self, new_value: Option<Value>) -> Result<()> {
        self.ensure_writable()?;
        let link = self.resolved()?;
        let address = link
            .address()
            .ok_or_else(|| Error::InvalidIdentity("cannot write through a data link".into()))?;
        let current = self.tx.peek(&address)?;
        self.diff_update(
            &address,
            current.as_ref(),
            new_value.as_ref(),
            link.schema.as_deref(),
            link.root_schema.as_deref(),
            0,
        )
    }

    fn diff_update(
        &self,
        address: &Address,
        current: Option<&Value>,
        new_value: Option<&Value>,
        schema: Option<&Value>,
        root_schema: Option<&Value>,
        depth: usize,
    ) -> Result<()> {
        if depth > MAX_RECURSION_DEPTH {
            return Err(Error::RecursionLimit);
        }

        // Writes go through the logical target: a link at the current
        // position redirects the write into the linked document.
        if let Some(Value::Link(target)) = current {
            if !matches!(new_value, Some(Value::Link(_))) {
                let target = normalize_link(target, &self.ctx())?;
                if target.space != address.space {
                    return Err(Error::WriteIsolationViolation {
                        open: address.space.clone(),
                        requested: target.space,
                    });
                }
                let target_address = target.address().ok_or_else(|| {
                    Error::InvalidIdentity("cannot write through a data link".into())
                })?;
                let target_current = self.tx.peek(&target_address)?;
                return self.diff_update(
                    &target_address,
                    target_current.as_ref(),
                    new_value,
                    target.schema.as_deref(),
                    target.root_schema.as_deref(),
                    depth + 1,
                );
            }
        }

        match new_value {
            Some(Value::Object(o)) if o.contains_key(ID_FIELD) => {
                self.write_identified(address, o, depth)
            }
            Some(Value::Object(o)) if o.contains_key(ID) => {
                self.write_derived(address, o, depth)
            }
            Some(Value::Link(new_link)) => {
                let changed = match current {
                    Some(Value::Link(old_link)) => {
                        let old = normalize_link(old_link, &self.ctx())?;
                        let new = normalize_link(new_link, &self.ctx())?;
                        !(old.space == new.space && old.id == new.id && old.path == new.path)
                    }
                    _ => true,
                };
                if changed {
                    self.write_leaf(address, Some(Value::Link(new_link.clone())), schema, root_schema)?;
                }
                Ok(())
            }
            Some(Value::Array(new_elements)) => {
                let old_elements = match current {
                    Some(Value::Array(old)) => old.clone(),
                    _ => {
                        // Not previously an array: replace wholesale.
                        return self.write_leaf(
                            address,
                            Some(Value::Array(new_elements.clone())),
                            schema,
                            root_schema,
                        );
                    }
                };
                let shared = old_elements.len().min(new_elements.len());
                for ix in 0..new_elements.len() {
                    let child = address.at(&crate::path!(ix.to_string()));
                    let child_schema = schema.and_then(|s| {
                        schema::schema_at_child(s, root_schema, &ix.to_string())
                    });
                    let old = if ix < shared { Some(&old_elements[ix]) } else { None };
                    self.diff_update(
                        &child,
                        old,
                        Some(&new_elements[ix]),
                        child_schema.as_ref(),
                        root_schema,
                        depth + 1,
                    )?;
                }
                if new_elements.len() < old_elements.len() {
                    // Shrinking writes an explicit length so confidentiality
                    // on the array applies to its length, then evicts the
                    // removed indices.
                    let labels = schema.map(schema::classification).unwrap_or_default();
                    self.tx.write_labeled(
                        &address.at(&crate::path!(crate::path::LENGTH)),
                        Some(Value::from(new_elements.len())),
                        labels,
                    )?;
                    for ix in new_elements.len()..old_elements.len() {
                        self.tx
                            .write(&address.at(&crate::path!(ix.to_string())), None)?;
                    }
                }
                Ok(())
            }
            Some(Value::Object(new_properties)) => {
                let old_properties = match current {
                    Some(Value::Object(old)) => old.clone(),
                    _ => {
                        return self.write_leaf(
                            address,
                            Some(Value::Object(new_properties.clone())),
                            schema,
                            root_schema,
                        );
                    }
                };
                for (key, new_child) in new_properties {
                    let child = address.at(&crate::path!(key.clone()));
                    let child_schema =
                        schema.and_then(|s| schema::schema_at_child(s, root_schema, key));
                    self.diff_update(
                        &child,
                        old_properties.get(key),
                        Some(new_child),
                        child_schema.as_ref(),
                        root_schema,
                        depth + 1,
                    )?;
                }
                for key in old_properties.keys() {
                    if !new_properties.contains_key(key) {
                        // Removed keys are written as undefined.
                        self.tx.write(&address.at(&crate::path!(key.clone())), None)?;
                    }
                }
                Ok(())
            }
            Some(leaf) => {
                let changed = match (current, leaf) {
                    (Some(Value::Number(a)), Value::Number(b)) => !number_is(*a, *b),
                    (Some(old), new) => !deep_equal(Some(old), Some(new)),
                    (None, _) => true,
                };
                if changed {
                    self.write_leaf(address, Some(leaf.clone()), schema, root_schema)?;
                }
                Ok(())
            }
            None => {
                if current.is_some() {
                    self.write_leaf(address, None, schema, root_schema)?;
                }
                Ok(())
            }
        }
    }

    fn write_leaf(
        &self,
        address: &Address,
        value: Option<Value>,
        schema: Option<&Value>,
        _root_schema: Option<&Value>,
    ) -> Result<()> {
        let labels = schema.map(schema::classification).unwrap_or_default();
        self.tx.write_labeled(address, value, labels)
    }

    /// Identity-field write: reuse the sibling entity whose identity
    /// property matches, else mint a random id.
    fn write_identified(&self, address: &Address, new: &Object, depth: usize) -> Result<()> {
        let key_prop = new
            .get(ID_FIELD)
            .and_then(Value::as_str)
            .ok_or_else(|| Error::InvalidIdentity("identity field name must be a string".into()))?
            .to_string();
        let desired = new.get(&key_prop).cloned().unwrap_or(Value::Null);

        let mut reuse: Option<NormalizedFullLink> = None;
        if let Some(parent_path) = address.path.parent() {
            let parent = Address {
                path: parent_path,
                ..address.clone()
            };
            let siblings: Vec<Value> = match self.tx.peek(&parent)? {
                Some(Value::Array(elements)) => elements,
                Some(Value::Object(properties)) => properties.into_values().collect(),
                _ => Vec::new(),
            };
            for sibling in siblings {
                if let Value::Link(link) = sibling {
                    let normalized = normalize_link(&link, &self.ctx())?;
                    if let Some(target) = normalized.address() {
                        let target_value = self.tx.peek(&target)?;
                        let found = target_value
                            .as_ref()
                            .and_then(|v| v.get(&key_prop));
                        if deep_equal(found, Some(&desired)) {
                            reuse = Some(normalized);
                            break;
                        }
                    }
                }
            }
        }

        let target = match reuse {
            Some(target) => target,
            None => {
                let id = EntityId::random()?;
                NormalizedFullLink {
                    space: address.space.clone(),
                    id: crate::link::LinkId::Entity(id),
                    path: PathBuf::new(),
                    media_type: address.media_type.clone(),
                    schema: None,
                    root_schema: None,
                }
            }
        };
        self.write_into_entity(address, &target, strip_markers(new), depth)
    }

    /// Explicit-identity write: derive the entity id from the `$ID` value
    /// and the parent context.
    fn write_derived(&self, address: &Address, new: &Object, depth: usize) -> Result<()> {
        let id_value = new.get(ID).cloned().unwrap_or(Value::Null);
        let mut source = Object::new();
        source.insert(ID.into(), id_value);
        let mut cause = Object::new();
        cause.insert("of".into(), Value::from(address.id.to_uri()));
        cause.insert(
            "path".into(),
            address
                .path
                .components()
                .iter()
                .map(|c| Value::from(c.as_str()))
                .collect(),
        );
        let id = create_ref(&Value::Object(source), &Value::Object(cause))?;
        let target = NormalizedFullLink {
            space: address.space.clone(),
            id: crate::link::LinkId::Entity(id),
            path: PathBuf::new(),
            media_type: address.media_type.clone(),
            schema: None,
            root_schema: None,
        };
        self.write_into_entity(address, &target, strip_markers(new), depth)
    }

    fn write_into_entity(
        &self,
        address: &Address,
        target: &NormalizedFullLink,
        contents: Value,
        depth: usize,
    ) -> Result<()> {
        let target_address = target
            .address()
            .expect("entity targets always have an address");
        let target_current = self.tx.peek(&target_address)?;
        self.diff_update(
            &target_address,
            target_current.as_ref(),
            Some(&contents),
            target.schema.as_deref(),
            target.root_schema.as_deref(),
            depth + 1,
        )?;
        // Update the link in place if it changed.
        let link_value = Value::Link(target.to_link());
        let current = self.tx.peek(address)?;
        let changed = match &current {
            Some(Value::Link(existing)) => {
                let existing = normalize_link(existing, &self.ctx())?;
                !(existing.space == target.space
                    && existing.id == target.id
                    && existing.path == target.path)
            }
            _ => true,
        };
        if changed {
            self.tx.write(address, Some(link_value))?;
        }
        Ok(())
    }

    // Array mutators. The write-only family clones the slice, mutates it
    // and diffs back; untouched elements produce neither reads nor writes.

    fn current_array(&self) -> Result<Vec<Value>> {
        Ok(match self.peek()? {
            Some(Value::Array(elements)) => elements,
            _ => Vec::new(),
        })
    }

    /// Appends values; returns the new length.
    pub fn push(&self, values: impl IntoIterator<Item = Value>) -> Result<usize> {
        self.ensure_writable()?;
        let mut elements = self.current_array()?;
        elements.extend(values);
        let len = elements.len();
        self.set(Some(Value::Array(elements)))?;
        Ok(len)
    }

    /// Prepends values; returns the new length.
    pub fn unshift(&self, values: impl IntoIterator<Item = Value>) -> Result<usize> {
        self.ensure_writable()?;
        let mut new: Vec<Value> = values.into_iter().collect();
        new.extend(self.current_array()?);
        let len = new.len();
        self.set(Some(Value::Array(new)))?;
        Ok(len)
    }

    /// Fills `[start, end)` with a value.
    pub fn fill(&self, value: Value, start: usize, end: Option<usize>) -> Result<()> {
        self.ensure_writable()?;
        let mut elements = self.current_array()?;
        let end = end.unwrap_or(elements.len()).min(elements.len());
        for slot in elements.iter_mut().take(end).skip(start) {
            *slot = value.clone();
        }
        self.set(Some(Value::Array(elements)))
    }

    /// Removes and returns the last element.
    pub fn pop(&self) -> Result<Option<Value>> {
        self.ensure_writable()?;
        let mut elements = self.current_array()?;
        let removed = elements.pop();
        if removed.is_some() {
            self.set(Some(Value::Array(elements)))?;
        }
        Ok(removed)
    }

    /// Removes and returns the first element.
    pub fn shift(&self) -> Result<Option<Value>> {
        self.ensure_writable()?;
        let mut elements = self.current_array()?;
        if elements.is_empty() {
            return Ok(None);
        }
        let removed = elements.remove(0);
        self.set(Some(Value::Array(elements)))?;
        Ok(Some(removed))
    }

    /// Splices the array; returns the removed elements. Element identity
    /// is preserved across the rearrangement because links move as
    /// values.
    pub fn splice(
        &self,
        start: usize,
        delete_count: usize,
        items: impl IntoIterator<Item = Value>,
    ) -> Result<Vec<Value>> {
        self.ensure_writable()?;
        let mut elements = self.current_array()?;
        let start = start.min(elements.len());
        let delete_count = delete_count.min(elements.len() - start);
        let removed: Vec<Value> = elements
            .splice(start..start + delete_count, items)
            .collect();
        self.set(Some(Value::Array(elements)))?;
        Ok(removed)
    }

    /// Reverses the array in place.
    pub fn reverse(&self) -> Result<()> {
        self.ensure_writable()?;
        let mut elements = self.current_array()?;
        elements.reverse();
        self.set(Some(Value::Array(elements)))
    }

    /// Sorts the array by a caller-supplied ordering.
    pub fn sort_by(
        &self,
        mut compare: impl FnMut(&Value, &Value) -> std::cmp::Ordering,
    ) -> Result<()> {
        self.ensure_writable()?;
        let mut elements = self.current_array()?;
        elements.sort_by(&mut compare);
        self.set(Some(Value::Array(elements)))
    }

    /// Copies `[start, end)` to `target` within the array.
    pub fn copy_within(&self, target: usize, start: usize, end: Option<usize>) -> Result<()> {
        self.ensure_writable()?;
        let mut elements = self.current_array()?;
        let len = elements.len();
        let end = end.unwrap_or(len).min(len);
        if start >= end || target >= len {
            return Ok(());
        }
        let window: Vec<Value> = elements[start..end].to_vec();
        for (offset, value) in window.into_iter().enumerate() {
            if target + offset >= len {
                break;
            }
            elements[target + offset] = value;
        }
        self.set(Some(Value::Array(elements)))
    }

    // Deriving methods materialize a fresh document so the result
    // participates in reactivity.

    fn derive_doc(&self, operation: &str, cause: &Value, elements: Vec<Value>) -> Result<Cursor> {
        let link = self.resolved()?;
        let parent = link
            .id
            .entity()
            .ok_or_else(|| Error::InvalidIdentity("cannot derive from a data link".into()))?;
        let id = derive_ref(parent, operation, cause)?;
        let doc: Doc = self
            .tx
            .store()
            .get(&link.space, id, link.media_type.clone(), true, None)?
            .expect("create_if_not_found always yields a document");
        doc.set_ephemeral(true);
        if doc.source().is_none() {
            doc.set_source(self.tx.store(), parent)?;
        }
        let derived = NormalizedFullLink {
            space: link.space.clone(),
            id: crate::link::LinkId::Entity(id),
            path: PathBuf::new(),
            media_type: link.media_type.clone(),
            schema: None,
            root_schema: None,
        };
        let cursor = Cursor {
            tx: self.tx.clone(),
            link: derived,
            depth: 0,
            read_only: self.read_only,
        };
        if !self.read_only {
            cursor.set(Some(Value::Array(elements)))?;
        } else {
            doc.send(Value::Array(elements))?;
        }
        Ok(cursor)
    }

    /// Maps each element through `f` into a derived document whose id is
    /// derived from the parent id, the operation name and the call-site
    /// cause.
    pub fn map(
        &self,
        cause: &Value,
        mut f: impl FnMut(&Cursor) -> Result<Value>,
    ) -> Result<Cursor> {
        let mut out = Vec::new();
        for child in self.to_vec()? {
            out.push(f(&child)?);
        }
        self.derive_doc("map", cause, out)
    }

    /// Filters elements through `f` into a derived document.
    pub fn filter(
        &self,
        cause: &Value,
        mut f: impl FnMut(&Cursor) -> Result<bool>,
    ) -> Result<Cursor> {
        let mut out = Vec::new();
        for child in self.to_vec()? {
            if f(&child)? {
                if let Some(value) = child.get()? {
                    out.push(value);
                }
            }
        }
        self.derive_doc("filter", cause, out)
    }
}

fn strip_markers(o: &Object) -> Value {
    let mut out = o.clone();
    out.remove(ID);
    out.remove(ID_FIELD);
    Value::Object(out)
}

/// Lazy iterator over an array cursor. Each step re-reads the live length
/// from the transaction snapshot.
pub struct CursorIter {
    cursor: Cursor,
    index: usize,
}

impl Iterator for CursorIter {
    type Item = Result<Cursor>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.cursor.len() {
            Ok(len) if self.index < len => {
                let child = self.cursor.index(self.index);
                self.index += 1;
                Some(child)
            }
            Ok(_) => None,
            Err(err) => Some(Err(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{MediaType, SpaceId};
    use crate::link::{Link, LinkId};
    use crate::object;
    use crate::path;
    use crate::replica::ReplicaSet;
    use crate::store::DocumentStore;
    use crate::transaction::InvariantKind;

    fn space() -> SpaceId {
        "did:key:cursor".parse().unwrap()
    }

    fn id(byte: u8) -> EntityId {
        EntityId::new([byte; 32])
    }

    fn root_link(byte: u8) -> NormalizedFullLink {
        NormalizedFullLink {
            space: space(),
            id: LinkId::Entity(id(byte)),
            path: PathBuf::new(),
            media_type: MediaType::Json,
            schema: None,
            root_schema: None,
        }
    }

    fn fixture() -> (DocumentStore, ReplicaSet, Transaction) {
        let store = DocumentStore::new();
        let replicas = ReplicaSet::new();
        let tx = Transaction::new(store.clone(), replicas.clone(), Value::from("test"));
        (store, replicas, tx)
    }

    #[test]
    fn set_then_get_round_trips() {
        let (_, _, tx) = fixture();
        let cursor = Cursor::new(tx, root_link(1));
        cursor
            .set(Some(object! { "title" => "hello" }))
            .unwrap();
        let value = cursor.get().unwrap().unwrap();
        assert_eq!(value.get("title").unwrap().as_str(), Some("hello"));
    }

    #[test]
    fn reads_follow_links() {
        let (_, _, tx) = fixture();
        let target = Cursor::new(tx.clone(), root_link(2));
        target.set(Some(object! { "v" => 7i64 })).unwrap();
        let source = Cursor::new(tx, root_link(3));
        source
            .set(Some(object! {
                "ref" => Value::Link(Link::to_entity(space(), id(2))),
            }))
            .unwrap();
        let through = source.key("ref").unwrap().key("v").unwrap();
        assert_eq!(through.get().unwrap().unwrap().as_number(), Some(7.0));
    }

    #[test]
    fn writes_redirect_through_links() {
        let (_, _, tx) = fixture();
        let target = Cursor::new(tx.clone(), root_link(2));
        target.set(Some(object! { "v" => 7i64 })).unwrap();
        let source = Cursor::new(tx.clone(), root_link(3));
        source
            .set(Some(object! {
                "ref" => Value::Link(Link::to_entity(space(), id(2))),
            }))
            .unwrap();
        // writing through the link lands in the target document
        source
            .key("ref")
            .unwrap()
            .set(Some(object! { "v" => 8i64 }))
            .unwrap();
        assert_eq!(
            target.key("v").unwrap().get().unwrap().unwrap().as_number(),
            Some(8.0)
        );
        // the link itself is untouched
        let raw = source.tx().peek(&Address::root(space(), id(3)).at(&path!("ref"))).unwrap();
        assert!(matches!(raw, Some(Value::Link(_))));
    }

    #[test]
    fn unchanged_writes_produce_no_invariants() {
        let (_, _, tx) = fixture();
        let cursor = Cursor::new(tx.clone(), root_link(1));
        cursor.set(Some(object! { "a" => 1i64, "b" => 2i64 })).unwrap();
        let writes_before = tx
            .log()
            .iter()
            .filter(|i| i.kind == InvariantKind::Write)
            .count();
        cursor.set(Some(object! { "a" => 1i64, "b" => 3i64 })).unwrap();
        let writes_after = tx
            .log()
            .iter()
            .filter(|i| i.kind == InvariantKind::Write)
            .count();
        // only the changed property was written
        assert_eq!(writes_after - writes_before, 1);
    }

    #[test]
    fn array_shrink_writes_length_and_evicts() {
        let (_, _, tx) = fixture();
        let cursor = Cursor::new(tx.clone(), root_link(1));
        cursor
            .set(Some(object! {
                "list" => Value::from_iter([1i64, 2i64, 3i64]),
            }))
            .unwrap();
        cursor
            .key("list")
            .unwrap()
            .set(Some(Value::from_iter([1i64])))
            .unwrap();
        let value = cursor.key("list").unwrap().get().unwrap().unwrap();
        assert_eq!(value.as_array().unwrap().len(), 1);
        let length_writes: Vec<_> = tx
            .log()
            .iter()
            .filter(|i| {
                i.kind == InvariantKind::Write
                    && i.address.path.components().last().map(String::as_str)
                        == Some(crate::path::LENGTH)
            })
            .cloned()
            .collect();
        assert_eq!(length_writes.len(), 1);
    }

    #[test]
    fn recursion_limit_is_enforced() {
        let (_, _, tx) = fixture();
        // two documents linking at each other in a loop
        let a = Cursor::new(tx.clone(), root_link(1));
        a.set(Some(Value::Link(Link::to_entity(space(), id(2)))))
            .unwrap();
        let b = Cursor::new(tx.clone(), root_link(2));
        b.set(Some(Value::Link(Link::to_entity(space(), id(1)))))
            .unwrap();
        let err = a.get().unwrap_err();
        assert!(matches!(err, Error::RecursionLimit));
    }

    #[test]
    fn push_and_splice_keep_identity() {
        let (_, _, tx) = fixture();
        let cursor = Cursor::new(tx.clone(), root_link(1));
        cursor.set(Some(Value::array())).unwrap();
        cursor
            .push([Value::from("a"), Value::from("b"), Value::from("c")])
            .unwrap();
        assert_eq!(cursor.len().unwrap(), 3);
        let removed = cursor.splice(1, 1, [Value::from("B")]).unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].as_str(), Some("b"));
        let value = cursor.get().unwrap().unwrap();
        let strings: Vec<&str> = value
            .as_array()
            .unwrap()
            .iter()
            .filter_map(Value::as_str)
            .collect();
        assert_eq!(strings, vec!["a", "B", "c"]);
    }

    #[test]
    fn identity_field_reuses_sibling_entity() {
        let (_, _, tx) = fixture();
        let member = Cursor::new(tx.clone(), root_link(9));
        member
            .set(Some(object! { "name" => "alice", "score" => 1i64 }))
            .unwrap();
        let list = Cursor::new(tx.clone(), root_link(1));
        list.set(Some(Value::Array(vec![Value::Link(Link::to_entity(
            space(),
            id(9),
        ))])))
        .unwrap();
        // a write carrying the identity field reuses the matching entity
        list.index(1)
            .unwrap()
            .set(Some(object! {
                ID_FIELD => "name",
                "name" => "alice",
                "score" => 5i64,
            }))
            .unwrap();
        assert_eq!(
            member.key("score").unwrap().get().unwrap().unwrap().as_number(),
            Some(5.0)
        );
    }

    #[test]
    fn derived_map_document_is_ephemeral() {
        let (store, _, tx) = fixture();
        let cursor = Cursor::new(tx.clone(), root_link(1));
        cursor
            .set(Some(Value::from_iter([1i64, 2i64, 3i64])))
            .unwrap();
        let doubled = cursor
            .map(&Value::from("call-site"), |child| {
                let n = child.get()?.and_then(|v| v.as_number()).unwrap_or(0.0);
                Ok(Value::Number(n * 2.0))
            })
            .unwrap();
        let value = doubled.get().unwrap().unwrap();
        let numbers: Vec<f64> = value
            .as_array()
            .unwrap()
            .iter()
            .filter_map(Value::as_number)
            .collect();
        assert_eq!(numbers, vec![2.0, 4.0, 6.0]);
        let derived_id = doubled.link().id.entity().unwrap();
        let doc = store
            .get(&space(), derived_id, MediaType::Json, false, None)
            .unwrap()
            .unwrap();
        assert!(doc.is_ephemeral());
        assert_eq!(doc.source(), Some(id(1)));
        // deterministic: mapping again with the same cause reuses the id
        let again = cursor
            .map(&Value::from("call-site"), |child| Ok(child.get()?.unwrap()))
            .unwrap();
        assert_eq!(again.link().id.entity(), Some(derived_id));
    }

    #[test]
    fn iteration_reflects_pending_writes() {
        let (_, _, tx) = fixture();
        let cursor = Cursor::new(tx.clone(), root_link(1));
        cursor.set(Some(Value::from_iter([1i64, 2i64]))).unwrap();
        let mut seen = 0;
        for child in cursor.iter() {
            let child = child.unwrap();
            seen += 1;
            if seen == 1 {
                // a write mid-iteration extends the live array
                cursor.push([Value::from(3i64)]).unwrap();
            }
            child.get().unwrap();
        }
        assert_eq!(seen, 3);
    }
}
