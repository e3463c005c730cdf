use crate::error::{Error, Result};
use crate::id::{EntityId, MediaType, SpaceId};
use crate::link::{discover_links, Address, LinkContext};
use crate::path::{get_value_at, set_value_at, PathBuf};
use crate::replica::{
    CommitReceipt, ConfirmedRead, Operation, PendingRead, ReadSource, ReplicaSet,
};
use crate::store::DocumentStore;
use crate::value::{deep_equal, Value};
use parking_lot::Mutex;
use std::sync::Arc;

/// Lifecycle of a transaction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Status {
    /// Accepting reads and writes.
    Open,
    /// Committed.
    Done,
    /// Aborted or failed.
    Error,
}

/// Whether an invariant records a read or a write.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InvariantKind {
    /// The transaction observed a value.
    Read,
    /// The transaction wrote a value.
    Write,
}

/// Which replication tier served a base read.
#[derive(Clone, Copy, Debug)]
pub enum ReadTier {
    /// Served from a confirmed entry at this version.
    Confirmed {
        /// Observed version.
        version: u64,
    },
    /// Served from the write of a pending commit.
    Pending {
        /// Commit whose write was observed.
        from_commit: crate::replica::CommitHash,
    },
    /// Served from a local document never seen by storage.
    Local,
}

/// One entry of the transaction log.
#[derive(Clone, Debug)]
pub struct Invariant {
    /// Read or write.
    pub kind: InvariantKind,
    /// The address touched.
    pub address: Address,
    /// The value observed or written.
    pub value: Option<Value>,
    /// The cause the transaction runs under.
    pub cause: Value,
    /// For reads: the tier that served it, when the transaction's own
    /// writes did not shadow the address.
    pub tier: Option<ReadTier>,
    /// For reads: true if the transaction's own writes shadowed the
    /// address, making the invariant self-consistent.
    pub overlaid: bool,
    /// Classification labels propagated onto this write from the schema.
    pub labels: crate::schema::Labels,
}

/// The outcome handed back by a successful commit.
#[derive(Debug)]
pub struct TxCommit {
    /// Space the writes went to, if there were writes.
    pub write_space: Option<SpaceId>,
    /// Replica receipt, if operations were queued.
    pub receipt: Option<CommitReceipt>,
    /// Per-document before/after of everything this commit changed
    /// locally, for driving reactivity.
    pub doc_changes: Vec<DocChange>,
    /// The transaction log, in append order.
    pub log: Vec<Invariant>,
}

/// Before/after of one document changed by a commit.
#[derive(Clone, Debug)]
pub struct DocChange {
    /// Space of the document.
    pub space: SpaceId,
    /// Entity id.
    pub id: EntityId,
    /// Whole-document value before.
    pub before: Option<Value>,
    /// Whole-document value after.
    pub after: Option<Value>,
    /// True if the document is ephemeral and was not queued to storage.
    pub ephemeral: bool,
}

struct TxState {
    status: Status,
    write_space: Option<SpaceId>,
    log: Vec<Invariant>,
    writes: Vec<(Address, Option<Value>)>,
}

struct TxShared {
    store: DocumentStore,
    replicas: ReplicaSet,
    cause: Value,
    state: Mutex<TxState>,
}

/// A read/write transaction over one or more spaces.
///
/// Readers may span any subset of spaces; the first writer binds the
/// transaction's single write space. Reads observe the transaction's own
/// earlier writes. Commit validates every read invariant against the
/// current confirmed-plus-pending state, applies the writes to the
/// document store and queues one pending commit per write space.
#[derive(Clone)]
pub struct Transaction {
    shared: Arc<TxShared>,
}

impl Transaction {
    /// Opens a transaction.
    pub fn new(store: DocumentStore, replicas: ReplicaSet, cause: Value) -> Self {
        Self {
            shared: Arc::new(TxShared {
                store,
                replicas,
                cause,
                state: Mutex::new(TxState {
                    status: Status::Open,
                    write_space: None,
                    log: Vec::new(),
                    writes: Vec::new(),
                }),
            }),
        }
    }

    /// The store this transaction reads through.
    pub fn store(&self) -> &DocumentStore {
        &self.shared.store
    }

    /// Current lifecycle state.
    pub fn status(&self) -> Status {
        self.shared.state.lock().status
    }

    /// The cause this transaction runs under.
    pub fn cause(&self) -> &Value {
        &self.shared.cause
    }

    /// Returns a reader for a space. Readers may be opened in any number
    /// of spaces.
    pub fn reader(&self, space: &SpaceId) -> Result<Reader> {
        self.ensure_open()?;
        Ok(Reader {
            tx: self.clone(),
            space: space.clone(),
        })
    }

    /// Returns a writer for a space. The first writer binds the write
    /// space; requesting a writer for any other space afterwards fails.
    pub fn writer(&self, space: &SpaceId) -> Result<Writer> {
        self.ensure_open()?;
        self.bind_write_space(space)?;
        Ok(Writer {
            tx: self.clone(),
            space: space.clone(),
        })
    }

    fn bind_write_space(&self, space: &SpaceId) -> Result<()> {
        let mut state = self.shared.state.lock();
        match &state.write_space {
            None => {
                state.write_space = Some(space.clone());
                Ok(())
            }
            Some(open) if open == space => Ok(()),
            Some(open) => Err(Error::WriteIsolationViolation {
                open: open.clone(),
                requested: space.clone(),
            }),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.shared.state.lock().status != Status::Open {
            return Err(Error::InactiveTransaction);
        }
        Ok(())
    }

    /// Reads the value at an address, observing the transaction's own
    /// earlier writes, and appends a read invariant to the log.
    pub fn read(&self, address: &Address) -> Result<Option<Value>> {
        self.ensure_open()?;
        let (base, tier) = self.base_value(address);
        let mut state = self.shared.state.lock();
        let (value, overlaid) = overlay(&base, &state.writes, address);
        state.log.push(Invariant {
            kind: InvariantKind::Read,
            address: address.clone(),
            value: value.clone(),
            cause: self.shared.cause.clone(),
            tier: if overlaid { None } else { tier },
            overlaid,
            labels: crate::schema::Labels::none(),
        });
        Ok(value)
    }

    /// Reads without logging an invariant. Used for plumbing that must not
    /// add consistency constraints, e.g. diff computation.
    pub fn peek(&self, address: &Address) -> Result<Option<Value>> {
        self.ensure_open()?;
        let (base, _) = self.base_value(address);
        let state = self.shared.state.lock();
        let (value, _) = overlay(&base, &state.writes, address);
        Ok(value)
    }

    /// Writes a value (or removal, with `None`) at an address, binding the
    /// write space and appending a write invariant.
    pub fn write(&self, address: &Address, value: Option<Value>) -> Result<()> {
        self.write_labeled(address, value, crate::schema::Labels::none())
    }

    /// Like [`Transaction::write`], carrying classification labels derived
    /// from the schema at the written position.
    pub fn write_labeled(
        &self,
        address: &Address,
        value: Option<Value>,
        labels: crate::schema::Labels,
    ) -> Result<()> {
        self.ensure_open()?;
        self.bind_write_space(&address.space)?;
        if !address.media_type.is_json() && !address.path.is_empty() {
            return Err(Error::UnsupportedMediaType(
                address.media_type.as_str().to_string(),
            ));
        }
        // A frozen document rejects writes outright.
        if let Some(doc) = self.shared.store.get(
            &address.space,
            address.id,
            address.media_type.clone(),
            false,
            None,
        )? {
            if doc.is_frozen() {
                return Err(Error::FrozenDocument);
            }
        }
        // Writes may not smuggle links into a different space.
        if let Some(value) = &value {
            let ctx = LinkContext {
                space: Some(address.space.clone()),
                root_schema: None,
            };
            for (link, _) in discover_links(value, &ctx)? {
                if link.space != address.space {
                    return Err(Error::WriteIsolationViolation {
                        open: address.space.clone(),
                        requested: link.space,
                    });
                }
            }
        }
        self.check_parent(address)?;
        let mut state = self.shared.state.lock();
        state.log.push(Invariant {
            kind: InvariantKind::Write,
            address: address.clone(),
            value: value.clone(),
            cause: self.shared.cause.clone(),
            tier: None,
            overlaid: false,
            labels,
        });
        state.writes.push((address.clone(), value));
        Ok(())
    }

    fn check_parent(&self, address: &Address) -> Result<()> {
        if address.path.len() <= 1 {
            // Root writes create the document; single-component writes only
            // need the root, which a write brings into being.
            return Ok(());
        }
        let root = Address {
            path: PathBuf::new(),
            ..address.clone()
        };
        let (base, _) = self.base_value(&root);
        let state = self.shared.state.lock();
        let (current, _) = overlay(&base, &state.writes, &root);
        let current = match current {
            Some(current) => current,
            None => return Err(Error::not_found(PathBuf::new())),
        };
        let parent = address.path.parent().expect("len > 1 has a parent");
        let mut prefix = PathBuf::new();
        let mut value = &current;
        for component in parent.components() {
            let next = match value {
                Value::Object(o) => o.get(component),
                Value::Array(a) => component.parse::<usize>().ok().and_then(|ix| a.get(ix)),
                _ => None,
            };
            match next {
                Some(next) if matches!(next, Value::Object(_) | Value::Array(_)) => {
                    prefix.push(component.clone());
                    value = next;
                }
                Some(_) | None => return Err(Error::not_found(prefix)),
            }
        }
        Ok(())
    }

    fn base_value(&self, address: &Address) -> (Option<Value>, Option<ReadTier>) {
        if let Ok(Some(doc)) = self.shared.store.get(
            &address.space,
            address.id,
            address.media_type.clone(),
            false,
            None,
        ) {
            if let Some(value) = doc.get() {
                let tier = match self.shared.replicas.read(&address.space, address.id) {
                    Some(read) => Some(match read.source {
                        ReadSource::Confirmed => ReadTier::Confirmed {
                            version: read.version.unwrap_or(0),
                        },
                        ReadSource::Pending => ReadTier::Pending {
                            from_commit: read.hash,
                        },
                    }),
                    None => Some(ReadTier::Local),
                };
                return (Some(value), tier);
            }
        }
        match self.shared.replicas.read(&address.space, address.id) {
            Some(read) => {
                let tier = match read.source {
                    ReadSource::Confirmed => ReadTier::Confirmed {
                        version: read.version.unwrap_or(0),
                    },
                    ReadSource::Pending => ReadTier::Pending {
                        from_commit: read.hash,
                    },
                };
                (read.value, Some(tier))
            }
            None => (None, None),
        }
    }

    /// Validates the read invariants, applies the writes, queues a pending
    /// commit for the write space and completes the transaction.
    pub fn commit(&self) -> Result<TxCommit> {
        self.ensure_open()?;
        let (log, writes, write_space) = {
            let state = self.shared.state.lock();
            (
                state.log.clone(),
                state.writes.clone(),
                state.write_space.clone(),
            )
        };

        // 1. Every read invariant must still hold against the current
        //    confirmed-plus-pending state.
        let mut violations = Vec::new();
        for invariant in &log {
            if invariant.kind != InvariantKind::Read || invariant.overlaid {
                continue;
            }
            let (current, _) = self.base_value_at(&invariant.address);
            if !deep_equal(current.as_ref(), invariant.value.as_ref()) {
                violations.push(invariant.address.to_string());
            }
        }
        if !violations.is_empty() {
            self.shared.state.lock().status = Status::Error;
            return Err(Error::Inconsistent { reads: violations });
        }

        // 2. Group writes into per-entity final values.
        let mut order: Vec<(EntityId, MediaType)> = Vec::new();
        for (address, _) in &writes {
            let key = (address.id, address.media_type.clone());
            if !order.contains(&key) {
                order.push(key);
            }
        }

        let mut doc_changes = Vec::new();
        let mut operations = Vec::new();
        let mut space_of_writes = None;
        for (id, media_type) in order {
            let space = write_space.clone().expect("writes imply a write space");
            space_of_writes = Some(space.clone());
            let doc = self
                .shared
                .store
                .get(&space, id, media_type.clone(), true, None)?
                .expect("create_if_not_found always yields a document");
            let before = doc.get();
            // 3. Apply this entity's writes, in issue order.
            for (address, value) in &writes {
                if address.id != id || address.media_type != media_type {
                    continue;
                }
                doc.set_at(&address.path, value.clone())?;
            }
            let after = doc.get();
            let ephemeral = doc.is_ephemeral();
            if !ephemeral {
                operations.push(match &after {
                    Some(value) => Operation::Set {
                        id,
                        value: value.clone(),
                    },
                    None => Operation::Delete { id },
                });
            }
            doc_changes.push(DocChange {
                space,
                id,
                before,
                after,
                ephemeral,
            });
        }

        // 4. Hand the commit to the replica as a pending commit.
        let receipt = match (&write_space, operations.is_empty()) {
            (Some(space), false) => {
                let mut confirmed_reads = Vec::new();
                let mut pending_reads = Vec::new();
                for invariant in &log {
                    if invariant.kind != InvariantKind::Read {
                        continue;
                    }
                    if invariant.address.space != *space {
                        continue;
                    }
                    match invariant.tier {
                        Some(ReadTier::Confirmed { version }) => {
                            let read = ConfirmedRead {
                                id: invariant.address.id,
                                version,
                            };
                            if !confirmed_reads.contains(&read) {
                                confirmed_reads.push(read);
                            }
                        }
                        Some(ReadTier::Pending { from_commit }) => {
                            let read = PendingRead {
                                id: invariant.address.id,
                                from_commit,
                            };
                            if !pending_reads.contains(&read) {
                                pending_reads.push(read);
                            }
                        }
                        _ => {}
                    }
                }
                Some(self.shared.replicas.with(space, |replica| {
                    replica.commit(operations, confirmed_reads, pending_reads)
                }))
            }
            _ => None,
        };

        self.shared.state.lock().status = Status::Done;
        Ok(TxCommit {
            write_space: space_of_writes,
            receipt,
            doc_changes,
            log,
        })
    }

    fn base_value_at(&self, address: &Address) -> (Option<Value>, Option<ReadTier>) {
        let root = Address {
            path: PathBuf::new(),
            ..address.clone()
        };
        let (base, tier) = self.base_value(&root);
        let value = base
            .as_ref()
            .and_then(|v| get_value_at(v, &address.path).map(|c| c.into_owned()));
        (value, tier)
    }

    /// Aborts the transaction, discarding its invariants. No shared state
    /// is affected.
    pub fn abort(&self, reason: Option<&str>) -> Result<()> {
        self.ensure_open()?;
        if let Some(reason) = reason {
            tracing::debug!("transaction aborted: {}", reason);
        }
        let mut state = self.shared.state.lock();
        state.status = Status::Error;
        state.log.clear();
        state.writes.clear();
        Ok(())
    }

    /// The invariant log in append order. Intended for consumption after
    /// the transaction completed, e.g. by telemetry.
    pub fn log(&self) -> Vec<Invariant> {
        self.shared.state.lock().log.clone()
    }
}

fn overlay(
    base: &Option<Value>,
    writes: &[(Address, Option<Value>)],
    address: &Address,
) -> (Option<Value>, bool) {
    let relevant: Vec<&(Address, Option<Value>)> = writes
        .iter()
        .filter(|(written, _)| {
            written.space == address.space
                && written.id == address.id
                && written.media_type == address.media_type
        })
        .collect();
    if relevant.is_empty() {
        let value = base
            .as_ref()
            .and_then(|v| get_value_at(v, &address.path).map(|c| c.into_owned()));
        return (value, false);
    }
    // Materialize the document with the transaction's writes applied in
    // issue order, then read at the requested path.
    let mut current = base.clone().unwrap_or_else(Value::object);
    let mut shadowed = false;
    for (written, value) in relevant {
        set_value_at(&mut current, &written.path, value.clone());
        if address.path.starts_with(&written.path) || written.path.starts_with(&address.path) {
            shadowed = true;
        }
    }
    let value = get_value_at(&current, &address.path).map(|c| c.into_owned());
    (value, shadowed)
}

/// A read handle bound to one space.
pub struct Reader {
    tx: Transaction,
    space: SpaceId,
}

impl Reader {
    /// Reads `path` of an entity in this reader's space.
    pub fn read(&self, id: EntityId, path: &PathBuf) -> Result<Option<Value>> {
        self.tx.read(&Address {
            space: self.space.clone(),
            id,
            media_type: MediaType::Json,
            path: path.clone(),
        })
    }
}

/// A write handle bound to the transaction's single write space.
pub struct Writer {
    tx: Transaction,
    space: SpaceId,
}

impl Writer {
    /// Writes `path` of an entity in the write space.
    pub fn write(&self, id: EntityId, path: &PathBuf, value: Option<Value>) -> Result<()> {
        self.tx.write(
            &Address {
                space: self.space.clone(),
                id,
                media_type: MediaType::Json,
                path: path.clone(),
            },
            value,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object;
    use crate::path;

    fn space(n: u8) -> SpaceId {
        format!("did:key:s{}", n).parse().unwrap()
    }

    fn id(byte: u8) -> EntityId {
        EntityId::new([byte; 32])
    }

    fn tx() -> Transaction {
        Transaction::new(DocumentStore::new(), ReplicaSet::new(), Value::from("test"))
    }

    #[test]
    fn read_your_writes() {
        let tx = tx();
        let addr = Address::root(space(1), id(1)).at(&path!("value", "test"));
        tx.write(&addr, Some(Value::from("t1"))).unwrap();
        let read = tx.read(&addr).unwrap();
        assert_eq!(read.unwrap().as_str(), Some("t1"));
    }

    #[test]
    fn first_writer_binds_the_space() {
        let tx = tx();
        tx.writer(&space(1)).unwrap();
        let err = tx.writer(&space(2)).unwrap_err();
        match err {
            Error::WriteIsolationViolation { open, requested } => {
                assert_eq!(open, space(1));
                assert_eq!(requested, space(2));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn cross_space_link_write_is_rejected() {
        let tx = tx();
        let foreign = crate::link::Link::to_entity(space(2), id(9));
        let err = tx
            .write(
                &Address::root(space(1), id(1)),
                Some(object! { "ref" => Value::Link(foreign) }),
            )
            .unwrap_err();
        assert!(matches!(err, Error::WriteIsolationViolation { .. }));
    }

    #[test]
    fn deep_write_needs_a_record_parent() {
        let tx = tx();
        tx.write(
            &Address::root(space(1), id(1)),
            Some(object! { "a" => 1i64 }),
        )
        .unwrap();
        let err = tx
            .write(
                &Address::root(space(1), id(1)).at(&path!("a", "b", "c")),
                Some(Value::from(1i64)),
            )
            .unwrap_err();
        match err {
            Error::NotFound { prefix } => assert_eq!(prefix, path!()),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn commit_applies_and_queues() {
        let store = DocumentStore::new();
        let replicas = ReplicaSet::new();
        let tx = Transaction::new(store.clone(), replicas.clone(), Value::Null);
        let addr = Address::root(space(1), id(1)).at(&path!("value"));
        tx.write(&addr, Some(Value::from(42i64))).unwrap();
        let outcome = tx.commit().unwrap();
        assert!(outcome.receipt.is_some());
        assert_eq!(outcome.doc_changes.len(), 1);
        // visible in a fresh transaction
        let tx2 = Transaction::new(store, replicas, Value::Null);
        let read = tx2.read(&addr).unwrap();
        assert_eq!(read.unwrap().as_number(), Some(42.0));
    }

    #[test]
    fn operations_fail_after_completion() {
        let tx = tx();
        tx.commit().unwrap();
        let addr = Address::root(space(1), id(1));
        assert!(matches!(
            tx.read(&addr).unwrap_err(),
            Error::InactiveTransaction
        ));
        assert!(matches!(
            tx.write(&addr, None).unwrap_err(),
            Error::InactiveTransaction
        ));
        assert!(matches!(tx.commit().unwrap_err(), Error::InactiveTransaction));
    }

    #[test]
    fn stale_read_makes_commit_inconsistent() {
        let store = DocumentStore::new();
        let replicas = ReplicaSet::new();
        let addr = Address::root(space(1), id(1));

        let setup = Transaction::new(store.clone(), replicas.clone(), Value::Null);
        setup
            .write(&addr, Some(object! { "v" => 1i64 }))
            .unwrap();
        setup.commit().unwrap();

        let tx = Transaction::new(store.clone(), replicas.clone(), Value::Null);
        tx.read(&addr.at(&path!("v"))).unwrap();

        // concurrent writer changes the value
        let other = Transaction::new(store, replicas, Value::Null);
        other
            .write(&addr.at(&path!("v")), Some(Value::from(2i64)))
            .unwrap();
        other.commit().unwrap();

        tx.write(&addr.at(&path!("w")), Some(Value::from(3i64)))
            .unwrap();
        let err = tx.commit().unwrap_err();
        assert!(matches!(err, Error::Inconsistent { .. }));
        assert_eq!(tx.status(), Status::Error);
    }

    #[test]
    fn ephemeral_docs_are_not_queued() {
        let store = DocumentStore::new();
        let replicas = ReplicaSet::new();
        let doc = store
            .get(&space(1), id(1), MediaType::Json, true, None)
            .unwrap()
            .unwrap();
        doc.set_ephemeral(true);
        let tx = Transaction::new(store, replicas, Value::Null);
        tx.write(&Address::root(space(1), id(1)), Some(Value::object()))
            .unwrap();
        let outcome = tx.commit().unwrap();
        assert!(outcome.receipt.is_none());
        assert!(outcome.doc_changes[0].ephemeral);
    }

    #[test]
    fn abort_discards_invariants() {
        let tx = tx();
        tx.write(&Address::root(space(1), id(1)), Some(Value::object()))
            .unwrap();
        tx.abort(Some("changed my mind")).unwrap();
        assert_eq!(tx.status(), Status::Error);
        assert!(tx.log().is_empty());
    }
}
