//! Client-side two-tier replication state.
//!
//! Each space keeps server-confirmed entries plus an ordered queue of
//! optimistic pending commits. Reads see the newest pending write first;
//! rejection of a commit cascades to every later commit that read from it.

use crate::id::{EntityId, SpaceId};
use crate::value::{Object, Value};
use fnv::{FnvHashMap, FnvHashSet};
use parking_lot::RwLock;
use std::sync::Arc;

/// Identifier of a commit: blake3 over its reads and operations.
#[derive(Clone, Copy, Eq, Hash, PartialEq, Ord, PartialOrd)]
#[repr(transparent)]
pub struct CommitHash([u8; 32]);

impl CommitHash {
    /// Creates a hash from raw bytes.
    pub fn new(hash: [u8; 32]) -> Self {
        Self(hash)
    }

    /// Parses the hex form used on the wire.
    pub fn from_hex(s: &str) -> crate::error::Result<Self> {
        let bytes = hex::decode(s)
            .map_err(|err| crate::error::Error::InvalidIdentity(err.to_string()))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| crate::error::Error::InvalidIdentity("bad commit hash length".into()))?;
        Ok(Self(bytes))
    }
}

impl std::fmt::Debug for CommitHash {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0[0..2]))
    }
}

impl std::fmt::Display for CommitHash {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// A write operation within a commit.
#[derive(Clone, Debug, PartialEq)]
pub enum Operation {
    /// Replace the entity value.
    Set {
        /// Target entity.
        id: EntityId,
        /// New value.
        value: Value,
    },
    /// Delete the entity.
    Delete {
        /// Target entity.
        id: EntityId,
    },
    /// Server-side merge; the client does not materialize a value.
    Patch {
        /// Target entity.
        id: EntityId,
        /// Patch body, interpreted by the server.
        patch: Value,
    },
    /// Assert the entity exists without changing it.
    Claim {
        /// Target entity.
        id: EntityId,
    },
}

impl Operation {
    /// Target entity of the operation.
    pub fn id(&self) -> EntityId {
        match self {
            Self::Set { id, .. }
            | Self::Delete { id }
            | Self::Patch { id, .. }
            | Self::Claim { id } => *id,
        }
    }

    fn to_value(&self) -> Value {
        let mut o = Object::new();
        match self {
            Self::Set { id, value } => {
                o.insert("op".into(), Value::from("set"));
                o.insert("id".into(), Value::from(id.to_uri()));
                o.insert("value".into(), value.clone());
            }
            Self::Delete { id } => {
                o.insert("op".into(), Value::from("delete"));
                o.insert("id".into(), Value::from(id.to_uri()));
            }
            Self::Patch { id, patch } => {
                o.insert("op".into(), Value::from("patch"));
                o.insert("id".into(), Value::from(id.to_uri()));
                o.insert("value".into(), patch.clone());
            }
            Self::Claim { id } => {
                o.insert("op".into(), Value::from("claim"));
                o.insert("id".into(), Value::from(id.to_uri()));
            }
        }
        Value::Object(o)
    }
}

/// A read of a server-confirmed entry, pinned to its version.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ConfirmedRead {
    /// Entity that was read.
    pub id: EntityId,
    /// Version the read observed.
    pub version: u64,
}

/// A read that observed the write of a still-pending commit.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PendingRead {
    /// Entity that was read.
    pub id: EntityId,
    /// Commit whose write was observed.
    pub from_commit: CommitHash,
}

/// Server-acknowledged state of an entity. An absent value is a tombstone.
#[derive(Clone, Debug)]
pub struct ConfirmedEntry {
    /// Monotonically non-decreasing server version.
    pub version: u64,
    /// Hash of the commit that produced this state.
    pub hash: CommitHash,
    /// The value, or `None` for a tombstone.
    pub value: Option<Value>,
}

/// The provisional write a pending commit holds for one entity.
#[derive(Clone, Debug)]
pub struct PendingWrite {
    /// Provisional value; `None` for deletes and unmaterialized patches.
    pub value: Option<Value>,
    /// Hash of the owning commit.
    pub hash: CommitHash,
}

/// A locally-queued, server-unacknowledged commit.
#[derive(Clone, Debug)]
pub struct PendingCommit {
    /// Content hash of reads and operations.
    pub hash: CommitHash,
    /// Confirmed entries the commit read.
    pub confirmed_reads: Vec<ConfirmedRead>,
    /// Pending writes the commit read.
    pub pending_reads: Vec<PendingRead>,
    /// The operations, in order.
    pub operations: Vec<Operation>,
    /// Provisional per-entity writes.
    pub writes: FnvHashMap<EntityId, PendingWrite>,
}

/// Which tier served a read.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReadSource {
    /// The newest pending write.
    Pending,
    /// The confirmed entry.
    Confirmed,
}

/// A successful read: the value (absent for tombstones and unmaterialized
/// patches) and the tier it came from.
#[derive(Clone, Debug)]
pub struct ReadResult {
    /// The value read.
    pub value: Option<Value>,
    /// Tier that served the read.
    pub source: ReadSource,
    /// Commit the value came from.
    pub hash: CommitHash,
    /// Version, for confirmed reads.
    pub version: Option<u64>,
}

/// Net effect of a replica state change on one entity.
#[derive(Clone, Debug)]
pub struct EntityChange {
    /// The changed entity.
    pub id: EntityId,
    /// Readable value before.
    pub before: Option<Value>,
    /// Readable value after.
    pub after: Option<Value>,
}

/// Result of queueing a commit.
#[derive(Clone, Debug)]
pub struct CommitReceipt {
    /// The provisional commit hash.
    pub hash: CommitHash,
    /// Per-entity changes the commit caused.
    pub changes: Vec<EntityChange>,
}

/// Two-tier state for a single space.
#[derive(Debug, Default)]
pub struct Replica {
    branch: Option<String>,
    confirmed: FnvHashMap<EntityId, ConfirmedEntry>,
    pending: Vec<PendingCommit>,
}

impl Replica {
    /// Creates an empty replica.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads an entity: the newest pending write if any, else confirmed.
    /// `None` means the entity is entirely unknown.
    pub fn read(&self, id: EntityId) -> Option<ReadResult> {
        for commit in self.pending.iter().rev() {
            if let Some(write) = commit.writes.get(&id) {
                return Some(ReadResult {
                    value: write.value.clone(),
                    source: ReadSource::Pending,
                    hash: write.hash,
                    version: None,
                });
            }
        }
        self.confirmed.get(&id).map(|entry| ReadResult {
            value: entry.value.clone(),
            source: ReadSource::Confirmed,
            hash: entry.hash,
            version: Some(entry.version),
        })
    }

    /// Readable value of an entity, across both tiers.
    pub fn read_value(&self, id: EntityId) -> Option<Value> {
        self.read(id).and_then(|r| r.value)
    }

    /// The confirmed entry of an entity.
    pub fn confirmed(&self, id: EntityId) -> Option<&ConfirmedEntry> {
        self.confirmed.get(&id)
    }

    /// Number of queued pending commits.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// The queued pending commits, oldest first.
    pub fn pending(&self) -> &[PendingCommit] {
        &self.pending
    }

    /// Queues a commit and returns its provisional hash plus the entity
    /// changes it causes.
    pub fn commit(
        &mut self,
        operations: Vec<Operation>,
        confirmed_reads: Vec<ConfirmedRead>,
        pending_reads: Vec<PendingRead>,
    ) -> CommitReceipt {
        let hash = commit_hash(&operations, &confirmed_reads, &pending_reads);
        let mut writes: FnvHashMap<EntityId, PendingWrite> = FnvHashMap::default();
        let mut changes = Vec::with_capacity(operations.len());
        for operation in &operations {
            let id = operation.id();
            let before = self.read_value(id);
            let value = match operation {
                Operation::Set { value, .. } => Some(value.clone()),
                Operation::Delete { .. } => None,
                // The server resolves the post-patch value.
                Operation::Patch { .. } => None,
                Operation::Claim { .. } => before.clone(),
            };
            changes.push(EntityChange {
                id,
                before,
                after: value.clone(),
            });
            writes.insert(id, PendingWrite { value, hash });
        }
        self.pending.push(PendingCommit {
            hash,
            confirmed_reads,
            pending_reads,
            operations,
            writes,
        });
        CommitReceipt { hash, changes }
    }

    /// Confirms a pending commit: removes it from the queue and promotes
    /// its writes into confirmed state under the server-assigned version.
    /// Unknown hashes are a no-op, so re-confirming is idempotent.
    pub fn confirm(&mut self, hash: CommitHash, server_version: u64) -> Vec<EntityChange> {
        let position = match self.pending.iter().position(|c| c.hash == hash) {
            Some(position) => position,
            None => return Vec::new(),
        };
        let affected: Vec<EntityId> = self.pending[position].writes.keys().copied().collect();
        let before: FnvHashMap<EntityId, Option<Value>> = affected
            .iter()
            .map(|id| (*id, self.read_value(*id)))
            .collect();
        let commit = self.pending.remove(position);
        for (id, write) in &commit.writes {
            let entry = self.confirmed.entry(*id).or_insert(ConfirmedEntry {
                version: 0,
                hash,
                value: None,
            });
            if server_version < entry.version {
                tracing::error!(
                    "ignoring version regression for {}: {} < {}",
                    id.to_uri(),
                    server_version,
                    entry.version
                );
                continue;
            }
            entry.version = server_version;
            entry.hash = hash;
            entry.value = write.value.clone();
        }
        self.changes_for(affected, before)
    }

    /// Rejects a pending commit and, transitively, every later commit
    /// whose pending reads depend on a rejected one. Returns the net
    /// revert to the remaining state.
    pub fn reject(&mut self, hash: CommitHash) -> Vec<EntityChange> {
        let mut rejected: FnvHashSet<CommitHash> = FnvHashSet::default();
        rejected.insert(hash);
        // Pending is ordered, so one forward pass closes the set.
        for commit in &self.pending {
            if commit
                .pending_reads
                .iter()
                .any(|read| rejected.contains(&read.from_commit))
            {
                rejected.insert(commit.hash);
            }
        }
        if !self.pending.iter().any(|c| rejected.contains(&c.hash)) {
            return Vec::new();
        }
        let mut affected: Vec<EntityId> = Vec::new();
        let mut before: FnvHashMap<EntityId, Option<Value>> = FnvHashMap::default();
        for commit in &self.pending {
            if rejected.contains(&commit.hash) {
                for id in commit.writes.keys() {
                    if !before.contains_key(id) {
                        affected.push(*id);
                        before.insert(*id, self.read_value(*id));
                    }
                }
            }
        }
        self.pending.retain(|c| !rejected.contains(&c.hash));
        self.changes_for(affected, before)
    }

    /// Applies a commit pushed by the server on behalf of another client
    /// into the confirmed tier.
    pub fn integrate(
        &mut self,
        hash: CommitHash,
        version: u64,
        values: impl IntoIterator<Item = (EntityId, Option<Value>)>,
    ) -> Vec<EntityChange> {
        let mut affected = Vec::new();
        let mut before = FnvHashMap::default();
        for (id, value) in values {
            before.insert(id, self.read_value(id));
            affected.push(id);
            let entry = self.confirmed.entry(id).or_insert(ConfirmedEntry {
                version: 0,
                hash,
                value: None,
            });
            if version < entry.version {
                tracing::error!(
                    "ignoring stale integration for {}: {} < {}",
                    id.to_uri(),
                    version,
                    entry.version
                );
                continue;
            }
            entry.version = version;
            entry.hash = hash;
            entry.value = value;
        }
        self.changes_for(affected, before)
    }

    /// Switches branches, discarding all confirmed and pending state.
    pub fn switch_branch(&mut self, name: &str) {
        self.branch = Some(name.to_string());
        self.confirmed.clear();
        self.pending.clear();
    }

    /// The current branch name, if one was selected.
    pub fn branch(&self) -> Option<&str> {
        self.branch.as_deref()
    }

    fn changes_for(
        &self,
        affected: Vec<EntityId>,
        before: FnvHashMap<EntityId, Option<Value>>,
    ) -> Vec<EntityChange> {
        affected
            .into_iter()
            .map(|id| EntityChange {
                id,
                before: before.get(&id).cloned().flatten(),
                after: self.read_value(id),
            })
            .collect()
    }
}

/// Content hash of a commit: blake3 over the canonical encoding of its
/// reads and operations. The server and the client derive the same hash
/// for the same commit.
pub fn commit_hash(
    operations: &[Operation],
    confirmed_reads: &[ConfirmedRead],
    pending_reads: &[PendingRead],
) -> CommitHash {
    let mut reads = Object::new();
    reads.insert(
        "confirmed".into(),
        confirmed_reads
            .iter()
            .map(|read| {
                let mut o = Object::new();
                o.insert("id".into(), Value::from(read.id.to_uri()));
                o.insert("version".into(), Value::from(read.version));
                Value::Object(o)
            })
            .collect(),
    );
    reads.insert(
        "pending".into(),
        pending_reads
            .iter()
            .map(|read| {
                let mut o = Object::new();
                o.insert("fromCommit".into(), Value::from(read.from_commit.to_string()));
                o.insert("id".into(), Value::from(read.id.to_uri()));
                Value::Object(o)
            })
            .collect(),
    );
    let mut body = Object::new();
    body.insert(
        "operations".into(),
        operations.iter().map(Operation::to_value).collect(),
    );
    body.insert("reads".into(), Value::Object(reads));
    CommitHash(blake3::hash(&Value::Object(body).canonical_bytes()).into())
}

/// Clonable set of per-space replicas.
#[derive(Clone, Default)]
pub struct ReplicaSet {
    inner: Arc<RwLock<FnvHashMap<SpaceId, Replica>>>,
}

impl ReplicaSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` with the replica of `space`, creating it on first use.
    pub fn with<R>(&self, space: &SpaceId, f: impl FnOnce(&mut Replica) -> R) -> R {
        let mut spaces = self.inner.write();
        f(spaces.entry(space.clone()).or_default())
    }

    /// Reads an entity in a space.
    pub fn read(&self, space: &SpaceId, id: EntityId) -> Option<ReadResult> {
        self.inner.read().get(space).and_then(|r| r.read(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object;

    fn id(byte: u8) -> EntityId {
        EntityId::new([byte; 32])
    }

    #[test]
    fn newest_pending_wins_over_confirmed() {
        let mut replica = Replica::new();
        let receipt = replica.commit(
            vec![Operation::Set {
                id: id(1),
                value: object! { "v" => 1i64 },
            }],
            vec![],
            vec![],
        );
        replica.confirm(receipt.hash, 1);
        replica.commit(
            vec![Operation::Set {
                id: id(1),
                value: object! { "v" => 2i64 },
            }],
            vec![],
            vec![],
        );
        let read = replica.read(id(1)).unwrap();
        assert_eq!(read.source, ReadSource::Pending);
        assert_eq!(read.value.unwrap().get("v").unwrap().as_number(), Some(2.0));
    }

    #[test]
    fn confirm_is_idempotent() {
        let mut replica = Replica::new();
        let receipt = replica.commit(
            vec![Operation::Set {
                id: id(1),
                value: object! { "v" => 1i64 },
            }],
            vec![],
            vec![],
        );
        let first = replica.confirm(receipt.hash, 3);
        assert_eq!(first.len(), 1);
        let second = replica.confirm(receipt.hash, 3);
        assert!(second.is_empty());
        assert_eq!(replica.confirmed(id(1)).unwrap().version, 3);
    }

    #[test]
    fn reject_cascades_through_pending_reads() {
        let mut replica = Replica::new();
        let p1 = replica.commit(
            vec![Operation::Set {
                id: id(1),
                value: object! { "a" => 1i64 },
            }],
            vec![],
            vec![],
        );
        let p2 = replica.commit(
            vec![Operation::Set {
                id: id(2),
                value: object! { "b" => 2i64 },
            }],
            vec![],
            vec![PendingRead {
                id: id(1),
                from_commit: p1.hash,
            }],
        );
        // and a third depending on the second
        replica.commit(
            vec![Operation::Set {
                id: id(3),
                value: object! { "c" => 3i64 },
            }],
            vec![],
            vec![PendingRead {
                id: id(2),
                from_commit: p2.hash,
            }],
        );
        let changes = replica.reject(p1.hash);
        assert_eq!(replica.pending_len(), 0);
        assert_eq!(changes.len(), 3);
        assert!(replica.read(id(2)).is_none());
        assert!(replica.read(id(3)).is_none());
    }

    #[test]
    fn patch_is_unmaterialized_until_server_resolves() {
        let mut replica = Replica::new();
        replica.commit(
            vec![Operation::Patch {
                id: id(1),
                patch: object! { "inc" => 1i64 },
            }],
            vec![],
            vec![],
        );
        let read = replica.read(id(1)).unwrap();
        assert_eq!(read.source, ReadSource::Pending);
        assert!(read.value.is_none());
    }

    #[test]
    fn integrate_bumps_versions_monotonically() {
        let mut replica = Replica::new();
        let h1 = CommitHash::new([1; 32]);
        let h2 = CommitHash::new([2; 32]);
        replica.integrate(h1, 5, vec![(id(1), Some(object! { "v" => 1i64 }))]);
        replica.integrate(h2, 4, vec![(id(1), Some(object! { "v" => 0i64 }))]);
        let entry = replica.confirmed(id(1)).unwrap();
        assert_eq!(entry.version, 5);
        assert_eq!(
            entry.value.as_ref().unwrap().get("v").unwrap().as_number(),
            Some(1.0)
        );
    }

    #[test]
    fn switch_branch_clears_state() {
        let mut replica = Replica::new();
        replica.commit(
            vec![Operation::Set {
                id: id(1),
                value: Value::object(),
            }],
            vec![],
            vec![],
        );
        replica.switch_branch("draft");
        assert_eq!(replica.pending_len(), 0);
        assert!(replica.read(id(1)).is_none());
        assert_eq!(replica.branch(), Some("draft"));
    }
}
