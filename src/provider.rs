//! The abstract storage provider contract and its in-memory rendition.
//!
//! A provider speaks the wire shape of the memory service: commits carry
//! `{reads: {confirmed, pending}, operations}`, receipts are
//! `{hash, version}` on confirm and `{hash, reason}` on reject. The
//! in-memory provider implements the authoritative-server rules and is
//! what tests and local development run against.

use anyhow::Result;
use async_trait::async_trait;
use fnv::FnvHashMap;
use mnemo_store::{
    commit_hash, CommitHash, ConfirmedRead, EntityId, Operation, PendingRead, Value,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// Schema-and-path selector accompanying a sync request.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Selector {
    /// Schema context guiding the server-side closure query.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
    /// Path of interest within the entity.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path: Vec<String>,
}

/// A confirmed read pinned to a version, in wire form.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WireConfirmedRead {
    /// Entity URI.
    pub id: String,
    /// Observed version.
    pub version: u64,
}

/// A pending read naming the commit it observed, in wire form.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WirePendingRead {
    /// Entity URI.
    pub id: String,
    /// Hash of the observed commit.
    pub from_commit: String,
}

/// The reads section of a wire commit.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WireReads {
    /// Confirmed reads.
    #[serde(default)]
    pub confirmed: Vec<WireConfirmedRead>,
    /// Pending reads.
    #[serde(default)]
    pub pending: Vec<WirePendingRead>,
}

/// Operation kinds accepted by the server.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireOp {
    /// Replace the entity value.
    Set,
    /// Delete the entity.
    Delete,
    /// Server-side merge.
    Patch,
    /// Assert existence.
    Claim,
}

/// One operation of a wire commit.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WireOperation {
    /// Operation kind.
    pub op: WireOp,
    /// Entity URI.
    pub id: String,
    /// Payload for `set` and `patch`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

/// A commit as sent to the server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WireCommit {
    /// The reads the commit depends on.
    pub reads: WireReads,
    /// The operations, in order.
    pub operations: Vec<WireOperation>,
}

impl WireCommit {
    /// Builds the wire form from core commit parts.
    pub fn from_parts(
        operations: &[Operation],
        confirmed_reads: &[ConfirmedRead],
        pending_reads: &[PendingRead],
    ) -> Self {
        Self {
            reads: WireReads {
                confirmed: confirmed_reads
                    .iter()
                    .map(|read| WireConfirmedRead {
                        id: read.id.to_uri(),
                        version: read.version,
                    })
                    .collect(),
                pending: pending_reads
                    .iter()
                    .map(|read| WirePendingRead {
                        id: read.id.to_uri(),
                        from_commit: read.from_commit.to_string(),
                    })
                    .collect(),
            },
            operations: operations
                .iter()
                .map(|operation| match operation {
                    Operation::Set { id, value } => WireOperation {
                        op: WireOp::Set,
                        id: id.to_uri(),
                        value: Some(value.clone()),
                    },
                    Operation::Delete { id } => WireOperation {
                        op: WireOp::Delete,
                        id: id.to_uri(),
                        value: None,
                    },
                    Operation::Patch { id, patch } => WireOperation {
                        op: WireOp::Patch,
                        id: id.to_uri(),
                        value: Some(patch.clone()),
                    },
                    Operation::Claim { id } => WireOperation {
                        op: WireOp::Claim,
                        id: id.to_uri(),
                        value: None,
                    },
                })
                .collect(),
        }
    }

    /// Converts back to core commit parts.
    pub fn to_parts(&self) -> Result<(Vec<Operation>, Vec<ConfirmedRead>, Vec<PendingRead>)> {
        let mut operations = Vec::with_capacity(self.operations.len());
        for operation in &self.operations {
            let id = EntityId::from_uri(&operation.id)?;
            operations.push(match operation.op {
                WireOp::Set => Operation::Set {
                    id,
                    value: operation.value.clone().unwrap_or(Value::Null),
                },
                WireOp::Delete => Operation::Delete { id },
                WireOp::Patch => Operation::Patch {
                    id,
                    patch: operation.value.clone().unwrap_or(Value::Null),
                },
                WireOp::Claim => Operation::Claim { id },
            });
        }
        let mut confirmed = Vec::with_capacity(self.reads.confirmed.len());
        for read in &self.reads.confirmed {
            confirmed.push(ConfirmedRead {
                id: EntityId::from_uri(&read.id)?,
                version: read.version,
            });
        }
        let mut pending = Vec::with_capacity(self.reads.pending.len());
        for read in &self.reads.pending {
            pending.push(PendingRead {
                id: EntityId::from_uri(&read.id)?,
                from_commit: CommitHash::from_hex(&read.from_commit)?,
            });
        }
        Ok((operations, confirmed, pending))
    }
}

/// A server receipt for a commit.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "lowercase")]
pub enum Receipt {
    /// The commit was accepted at this version.
    Confirm {
        /// Commit hash, hex.
        hash: String,
        /// Server-assigned version.
        version: u64,
    },
    /// The commit was rejected.
    Reject {
        /// Commit hash, hex.
        hash: String,
        /// Human-readable reason.
        reason: String,
    },
}

/// A server-held entry for one entity.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WireEntry {
    /// Entity URI.
    pub id: String,
    /// Current value; `None` is a tombstone.
    pub value: Option<Value>,
    /// Current version.
    pub version: u64,
}

/// Provider-level events surfaced to subscribers.
#[derive(Clone, Debug)]
pub enum ProviderEvent {
    /// The connection came up or went down.
    ConnectionUpdate {
        /// True when connected.
        connected: bool,
    },
    /// The server applied a commit pushed by some client.
    Committed {
        /// Commit hash, hex.
        hash: String,
        /// Server-assigned version.
        version: u64,
        /// Entries the commit changed.
        entries: Vec<WireEntry>,
    },
}

/// Callback invoked with server-side changes to a sunk entity.
pub type SinkFn = Arc<dyn Fn(&WireEntry) + Send + Sync>;
/// Callback invoked with provider-level events.
pub type SubscriptionFn = Arc<dyn Fn(&ProviderEvent) + Send + Sync>;

/// Cancels a sink registration. Idempotent.
pub struct SinkHandle {
    cancel: Box<dyn Fn() + Send + Sync>,
    cancelled: AtomicBool,
}

impl SinkHandle {
    fn new(cancel: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Box::new(cancel),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Cancels the sink.
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            (self.cancel)();
        }
    }
}

/// The abstract storage provider for one space.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Requests the current server state of an entity, with an optional
    /// schema selector for the server-side closure query.
    async fn sync(&self, uri: &str, selector: Option<&Selector>) -> Result<Option<WireEntry>>;

    /// Sends a commit; resolves to the server's receipt.
    async fn send(&self, commit: WireCommit) -> Result<Receipt>;

    /// Reads the provider's cached value for an entity.
    async fn get(&self, uri: &str) -> Result<Option<Value>>;

    /// Registers a callback for server-side changes to an entity.
    fn sink(&self, uri: &str, callback: SinkFn) -> SinkHandle;

    /// Registers a provider-event subscriber.
    fn subscribe(&self, subscription: SubscriptionFn);

    /// Tears the provider down.
    fn destroy(&self);
}

#[derive(Default)]
struct ServerState {
    entries: FnvHashMap<String, WireEntry>,
    next_version: u64,
    sinks: Vec<(u64, String, SinkFn)>,
    next_sink: u64,
    subscribers: Vec<SubscriptionFn>,
    connected: bool,
    destroyed: bool,
}

/// An in-memory authoritative server, one per space.
///
/// Implements the server rules the real service follows: versions are
/// monotonic per entity, stale confirmed reads reject the commit, and
/// every applied commit is fanned out to the registered sinks.
#[derive(Clone, Default)]
pub struct MemoryProvider {
    state: Arc<Mutex<ServerState>>,
}

impl MemoryProvider {
    /// Creates a connected in-memory provider.
    pub fn new() -> Self {
        let provider = Self::default();
        provider.state.lock().connected = true;
        provider
    }

    /// Simulates a connection drop.
    pub fn disconnect(&self) {
        let subscribers = {
            let mut state = self.state.lock();
            state.connected = false;
            state.subscribers.clone()
        };
        let event = ProviderEvent::ConnectionUpdate { connected: false };
        for subscriber in subscribers {
            subscriber(&event);
        }
    }

    /// Simulates the connection coming back.
    pub fn reconnect(&self) {
        let subscribers = {
            let mut state = self.state.lock();
            state.connected = true;
            state.subscribers.clone()
        };
        let event = ProviderEvent::ConnectionUpdate { connected: true };
        for subscriber in subscribers {
            subscriber(&event);
        }
    }

    /// True while connected.
    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    /// Applies a commit as if another client had pushed it, fanning the
    /// result out through sinks and subscribers. Returns the receipt.
    pub fn apply_remote(&self, commit: WireCommit) -> Result<Receipt> {
        self.apply(commit)
    }

    /// Current version of an entity on the server, if known.
    pub fn version_of(&self, uri: &str) -> Option<u64> {
        self.state.lock().entries.get(uri).map(|e| e.version)
    }

    fn apply(&self, commit: WireCommit) -> Result<Receipt> {
        let (operations, confirmed_reads, pending_reads) = commit.to_parts()?;
        let hash = commit_hash(&operations, &confirmed_reads, &pending_reads);
        let hash_hex = hash.to_string();

        let (receipt, changed, sinks, subscribers) = {
            let mut state = self.state.lock();
            anyhow::ensure!(!state.destroyed, "provider is destroyed");
            anyhow::ensure!(state.connected, "provider is disconnected");

            // The server is authoritative: a confirmed read whose version
            // moved on rejects the whole commit.
            for read in &confirmed_reads {
                let uri = read.id.to_uri();
                let current = state.entries.get(&uri).map(|e| e.version).unwrap_or(0);
                if current != read.version {
                    return Ok(Receipt::Reject {
                        hash: hash_hex.clone(),
                        reason: format!(
                            "conflict on {}: read version {}, server at {}",
                            uri, read.version, current
                        ),
                    });
                }
            }
            for operation in &operations {
                if let Operation::Claim { id } = operation {
                    let uri = id.to_uri();
                    if !state.entries.contains_key(&uri) {
                        return Ok(Receipt::Reject {
                            hash: hash_hex.clone(),
                            reason: format!("claim of unknown entity {}", uri),
                        });
                    }
                }
            }

            state.next_version += 1;
            let version = state.next_version;
            let mut changed = Vec::new();
            for operation in &operations {
                let uri = operation.id().to_uri();
                let value = match operation {
                    Operation::Set { value, .. } => Some(value.clone()),
                    Operation::Delete { .. } => None,
                    Operation::Patch { patch, .. } => {
                        let current =
                            state.entries.get(&uri).and_then(|e| e.value.clone());
                        Some(merge(current, patch.clone()))
                    }
                    Operation::Claim { .. } => continue,
                };
                let entry = WireEntry {
                    id: uri.clone(),
                    value,
                    version,
                };
                state.entries.insert(uri, entry.clone());
                changed.push(entry);
            }
            (
                Receipt::Confirm {
                    hash: hash_hex.clone(),
                    version,
                },
                changed,
                state.sinks.clone(),
                state.subscribers.clone(),
            )
        };

        for entry in &changed {
            for (_, uri, sink) in &sinks {
                if *uri == entry.id {
                    sink(entry);
                }
            }
        }
        if let Receipt::Confirm { version, .. } = &receipt {
            let event = ProviderEvent::Committed {
                hash: hash_hex,
                version: *version,
                entries: changed,
            };
            for subscriber in &subscribers {
                subscriber(&event);
            }
        }
        Ok(receipt)
    }
}

/// Shallow-into-deep JSON merge used for `patch` operations: objects merge
/// recursively, everything else replaces.
fn merge(current: Option<Value>, patch: Value) -> Value {
    match (current, patch) {
        (Some(Value::Object(mut current)), Value::Object(patch)) => {
            for (key, value) in patch {
                let merged = merge(current.remove(&key), value);
                current.insert(key, merged);
            }
            Value::Object(current)
        }
        (_, patch) => patch,
    }
}

#[async_trait]
impl Provider for MemoryProvider {
    async fn sync(&self, uri: &str, _selector: Option<&Selector>) -> Result<Option<WireEntry>> {
        let state = self.state.lock();
        anyhow::ensure!(state.connected, "provider is disconnected");
        Ok(state.entries.get(uri).cloned())
    }

    async fn send(&self, commit: WireCommit) -> Result<Receipt> {
        self.apply(commit)
    }

    async fn get(&self, uri: &str) -> Result<Option<Value>> {
        Ok(self.state.lock().entries.get(uri).and_then(|e| e.value.clone()))
    }

    fn sink(&self, uri: &str, callback: SinkFn) -> SinkHandle {
        let token = {
            let mut state = self.state.lock();
            let token = state.next_sink;
            state.next_sink += 1;
            state.sinks.push((token, uri.to_string(), callback));
            token
        };
        let state = self.state.clone();
        SinkHandle::new(move || {
            state.lock().sinks.retain(|(t, _, _)| *t != token);
        })
    }

    fn subscribe(&self, subscription: SubscriptionFn) {
        self.state.lock().subscribers.push(subscription);
    }

    fn destroy(&self) {
        let mut state = self.state.lock();
        state.destroyed = true;
        state.sinks.clear();
        state.subscribers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mnemo_store::object;

    fn set_op(uri: &str, value: Value) -> WireCommit {
        WireCommit {
            reads: WireReads::default(),
            operations: vec![WireOperation {
                op: WireOp::Set,
                id: uri.to_string(),
                value: Some(value),
            }],
        }
    }

    #[async_std::test]
    async fn send_then_sync_round_trips() -> Result<()> {
        let provider = MemoryProvider::new();
        let uri = EntityId::new([1; 32]).to_uri();
        let receipt = provider.send(set_op(&uri, object! { "v" => 1i64 })).await?;
        assert!(matches!(receipt, Receipt::Confirm { .. }));
        let entry = provider.sync(&uri, None).await?.unwrap();
        assert_eq!(entry.version, 1);
        assert_eq!(entry.value.unwrap().get("v").unwrap().as_number(), Some(1.0));
        Ok(())
    }

    #[async_std::test]
    async fn stale_confirmed_read_rejects() -> Result<()> {
        let provider = MemoryProvider::new();
        let id = EntityId::new([1; 32]);
        let uri = id.to_uri();
        provider.send(set_op(&uri, object! { "v" => 1i64 })).await?;
        provider.send(set_op(&uri, object! { "v" => 2i64 })).await?;
        let stale = WireCommit {
            reads: WireReads {
                confirmed: vec![WireConfirmedRead {
                    id: uri.clone(),
                    version: 1,
                }],
                pending: vec![],
            },
            operations: vec![WireOperation {
                op: WireOp::Set,
                id: uri,
                value: Some(object! { "v" => 3i64 }),
            }],
        };
        let receipt = provider.send(stale).await?;
        assert!(matches!(receipt, Receipt::Reject { .. }));
        Ok(())
    }

    #[async_std::test]
    async fn patch_merges_on_the_server() -> Result<()> {
        let provider = MemoryProvider::new();
        let uri = EntityId::new([1; 32]).to_uri();
        provider
            .send(set_op(&uri, object! { "a" => 1i64, "nested" => object! { "x" => 1i64 } }))
            .await?;
        let patch = WireCommit {
            reads: WireReads::default(),
            operations: vec![WireOperation {
                op: WireOp::Patch,
                id: uri.clone(),
                value: Some(object! { "nested" => object! { "y" => 2i64 } }),
            }],
        };
        provider.send(patch).await?;
        let value = provider.get(&uri).await?.unwrap();
        assert_eq!(
            value.get("nested").unwrap().get("x").unwrap().as_number(),
            Some(1.0)
        );
        assert_eq!(
            value.get("nested").unwrap().get("y").unwrap().as_number(),
            Some(2.0)
        );
        Ok(())
    }

    #[async_std::test]
    async fn sinks_fan_out_and_cancel() -> Result<()> {
        let provider = MemoryProvider::new();
        let uri = EntityId::new([1; 32]).to_uri();
        let seen = Arc::new(Mutex::new(0usize));
        let observed = seen.clone();
        let handle = provider.sink(
            &uri,
            Arc::new(move |_entry| {
                *observed.lock() += 1;
            }),
        );
        provider.send(set_op(&uri, object! { "v" => 1i64 })).await?;
        handle.cancel();
        handle.cancel();
        provider.send(set_op(&uri, object! { "v" => 2i64 })).await?;
        assert_eq!(*seen.lock(), 1);
        Ok(())
    }
}
