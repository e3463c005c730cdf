//! Space-to-provider routing and the sync loop.
//!
//! The manager opens one provider per space on first use and keeps both
//! directions of every document subscription: local changes enter a dirty
//! set and are pushed as commits, server changes are applied back to the
//! documents without echoing into the push path. `sync_cell` joins
//! concurrent loads by key and expands the link closure of what it loads;
//! `synced` resolves once loading, pushing and the scheduler are all
//! drained.

use crate::notify::{Notification, NotificationBus};
use crate::provider::{
    Provider, ProviderEvent, Receipt, Selector, SinkHandle, WireCommit, WireEntry,
};
use crate::scheduler::Scheduler;
use anyhow::{Context as _, Result};
use fnv::{FnvHashMap, FnvHashSet};
use futures::channel::oneshot;
use futures::future::{Either, Shared};
use futures::FutureExt;
use mnemo_store::{
    deep_equal, discover_links, CommitHash, ConfirmedRead, DocumentStore, EntityId, Error,
    LinkContext, LinkId, MediaType, NormalizedFullLink, Operation, PendingCommit, ReplicaSet,
    SpaceId, Value,
};
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, Waker};
use std::time::Duration;

/// Default bound on provider sync waits.
pub const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(30);

/// Creates the provider for a space on first use.
pub type ProviderFactory = Box<dyn Fn(&SpaceId) -> Arc<dyn Provider> + Send + Sync>;

type SyncKey = (SpaceId, EntityId, Option<String>);
type Loading = Shared<oneshot::Receiver<()>>;

#[derive(Default)]
struct ManagerState {
    providers: FnvHashMap<SpaceId, Arc<dyn Provider>>,
    dirty: FnvHashSet<(SpaceId, EntityId)>,
    loading: FnvHashMap<SyncKey, Loading>,
    doc_subs: FnvHashMap<(SpaceId, EntityId), mnemo_store::DocSubscription>,
    sink_subs: FnvHashMap<(SpaceId, EntityId), SinkHandle>,
    applying: FnvHashSet<(SpaceId, EntityId)>,
    synced_keys: FnvHashSet<SyncKey>,
    push_spaces: FnvHashSet<SpaceId>,
    needs_resync: bool,
    sync_timeout: Option<Duration>,
}

struct ManagerInner {
    store: DocumentStore,
    replicas: ReplicaSet,
    scheduler: Scheduler,
    bus: NotificationBus,
    factory: ProviderFactory,
    sync_timeout: Duration,
    state: Mutex<ManagerState>,
    gate: Gate,
}

/// Clonable handle onto the storage manager.
#[derive(Clone)]
pub struct StorageManager {
    inner: Arc<ManagerInner>,
}

impl StorageManager {
    /// Creates a manager over the given core state.
    pub fn new(
        store: DocumentStore,
        replicas: ReplicaSet,
        scheduler: Scheduler,
        bus: NotificationBus,
        factory: ProviderFactory,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                store,
                replicas,
                scheduler,
                bus,
                factory,
                sync_timeout: DEFAULT_SYNC_TIMEOUT,
                state: Mutex::new(ManagerState::default()),
                gate: Gate::default(),
            }),
        }
    }

    /// Overrides the bound on provider sync waits.
    pub fn set_sync_timeout(&self, timeout: Duration) {
        self.inner.state.lock().sync_timeout = Some(timeout);
    }

    fn sync_timeout(&self) -> Duration {
        self.inner
            .state
            .lock()
            .sync_timeout
            .unwrap_or(self.inner.sync_timeout)
    }

    /// Opens (or returns the cached) provider of a space.
    pub fn provider(&self, space: &SpaceId) -> Arc<dyn Provider> {
        if let Some(provider) = self.inner.state.lock().providers.get(space).cloned() {
            return provider;
        }
        let provider = (self.inner.factory)(space);
        let weak = Arc::downgrade(&self.inner);
        let event_space = space.clone();
        provider.subscribe(Arc::new(move |event| {
            if let Some(inner) = weak.upgrade() {
                handle_provider_event(&inner, &event_space, event);
            }
        }));
        self.inner
            .state
            .lock()
            .providers
            .insert(space.clone(), provider.clone());
        provider
    }

    /// Records that a committed transaction queued work for a space and
    /// feeds the document diffs into the reactive engine.
    pub fn handle_commit(&self, outcome: &mnemo_store::TxCommit) {
        for change in &outcome.doc_changes {
            let key = (change.space.clone(), change.id, MediaType::Json);
            self.inner
                .scheduler
                .notify_change(&key, change.before.as_ref(), change.after.as_ref());
        }
        if let (Some(space), Some(receipt)) = (&outcome.write_space, &outcome.receipt) {
            self.inner.state.lock().push_spaces.insert(space.clone());
            self.inner.bus.publish(&Notification::Commit {
                space: space.clone(),
                hash: receipt.hash,
            });
        }
        self.inner.scheduler.run_pending();
    }

    /// Ensures a document is synced: current server state integrated or
    /// confirmed absent, subscriptions established in both directions, and
    /// the targets of its links recursively ensured (bounded by the
    /// observed links). Concurrent calls for the same key join the same
    /// load.
    pub async fn sync_cell(&self, link: &NormalizedFullLink) -> Result<()> {
        let id = match &link.id {
            LinkId::Entity(id) => *id,
            // Inline data needs no server round trip.
            LinkId::Data(_) => return Ok(()),
        };
        let key: SyncKey = (
            link.space.clone(),
            id,
            link.schema
                .as_ref()
                .map(|schema| serde_json::to_string(schema.as_ref()).unwrap_or_default()),
        );

        // Join an in-flight load of the same key.
        let existing = self.inner.state.lock().loading.get(&key).cloned();
        if let Some(loading) = existing {
            loading.await.ok();
            return Ok(());
        }
        let (resolve, joined) = oneshot::channel();
        self.inner
            .state
            .lock()
            .loading
            .insert(key.clone(), joined.shared());

        let result = self.sync_cell_inner(link, id).await;

        {
            let mut state = self.inner.state.lock();
            state.loading.remove(&key);
            if result.is_ok() {
                state.synced_keys.insert(key);
            }
        }
        resolve.send(()).ok();
        result
    }

    async fn sync_cell_inner(&self, link: &NormalizedFullLink, id: EntityId) -> Result<()> {
        let space = link.space.clone();
        let provider = self.provider(&space);
        let selector = Selector {
            schema: link.schema.as_ref().map(|s| s.as_ref().clone()),
            path: link.path.components().to_vec(),
        };

        let entry = match timeout(
            provider.sync(&id.to_uri(), Some(&selector)),
            self.sync_timeout(),
        )
        .await
        {
            Ok(Ok(entry)) => entry,
            Ok(Err(err)) => {
                // A storage failure degrades the document: readable but
                // frozen and no longer pushed.
                if let Some(doc) =
                    self.inner
                        .store
                        .get(&space, id, MediaType::Json, false, None)?
                {
                    doc.set_ephemeral(true);
                    doc.freeze();
                }
                self.inner.bus.publish(&Notification::Error {
                    detail: format!("sync of {} failed: {}", id.to_uri(), err),
                });
                return Err(err);
            }
            Err(_) => return Err(Error::SyncTimeout.into()),
        };

        match entry {
            Some(entry) => self.apply_server_entry(&space, &entry, true)?,
            None => {
                // Nothing on the server yet; a local value becomes a push.
                let doc = self
                    .inner
                    .store
                    .get(&space, id, MediaType::Json, false, None)?;
                if doc.and_then(|d| d.get()).is_some() {
                    self.inner.state.lock().dirty.insert((space.clone(), id));
                    self.inner.state.lock().push_spaces.insert(space.clone());
                }
            }
        }
        self.ensure_subscribed(&space, id)?;

        // Expand the closure of linked entities from the local value and
        // the provider cache.
        let mut seen: FnvHashSet<(SpaceId, EntityId)> = FnvHashSet::default();
        seen.insert((space.clone(), id));
        let mut work: Vec<(SpaceId, EntityId)> = vec![(space.clone(), id)];
        while let Some((current_space, current_id)) = work.pop() {
            let value = match self.inner.store.get(
                &current_space,
                current_id,
                MediaType::Json,
                false,
                None,
            )? {
                Some(doc) => doc.get(),
                None => None,
            };
            let value = match value {
                Some(value) => value,
                None => continue,
            };
            let ctx = LinkContext {
                space: Some(current_space.clone()),
                root_schema: None,
            };
            for (found, _path) in discover_links(&value, &ctx)? {
                let found_id = match found.id.entity() {
                    Some(found_id) => found_id,
                    None => continue,
                };
                if !seen.insert((found.space.clone(), found_id)) {
                    continue;
                }
                let provider = self.provider(&found.space);
                let server_value = provider.get(&found_id.to_uri()).await?;
                let doc = self
                    .inner
                    .store
                    .get(&found.space, found_id, MediaType::Json, true, None)?
                    .expect("create_if_not_found always yields a document");
                match (server_value, doc.get()) {
                    (Some(server_value), local) => {
                        if !deep_equal(Some(&server_value), local.as_ref()) {
                            let entry = WireEntry {
                                id: found_id.to_uri(),
                                value: Some(server_value),
                                version: 0,
                            };
                            self.apply_server_entry(&found.space, &entry, true)?;
                        }
                    }
                    (None, Some(_)) => {
                        let mut state = self.inner.state.lock();
                        state.dirty.insert((found.space.clone(), found_id));
                        state.push_spaces.insert(found.space.clone());
                    }
                    (None, None) => {}
                }
                self.ensure_subscribed(&found.space, found_id)?;
                work.push((found.space.clone(), found_id));
            }
        }
        Ok(())
    }

    fn ensure_subscribed(&self, space: &SpaceId, id: EntityId) -> Result<()> {
        let key = (space.clone(), id);
        {
            let state = self.inner.state.lock();
            if state.doc_subs.contains_key(&key) && state.sink_subs.contains_key(&key) {
                return Ok(());
            }
        }
        let doc = self
            .inner
            .store
            .get(space, id, MediaType::Json, true, None)?
            .expect("create_if_not_found always yields a document");

        // doc → storage: local changes enter the dirty set, unless they
        // are the application of incoming server state.
        let weak = Arc::downgrade(&self.inner);
        let sub_space = space.clone();
        let doc_sub = doc.subscribe(move |update| {
            if let Some(inner) = weak.upgrade() {
                let key = (sub_space.clone(), update.id);
                let mut state = inner.state.lock();
                if state.applying.contains(&key) {
                    return;
                }
                state.push_spaces.insert(sub_space.clone());
                state.dirty.insert(key);
            }
        });

        // storage → doc: apply server values without echoing back.
        let provider = self.provider(space);
        let weak = Arc::downgrade(&self.inner);
        let sink_space = space.clone();
        let sink = provider.sink(
            &id.to_uri(),
            Arc::new(move |entry| {
                if let Some(inner) = weak.upgrade() {
                    let manager = StorageManager { inner };
                    if let Err(err) = manager.apply_server_entry(&sink_space, entry, true) {
                        tracing::error!("failed to apply server entry: {}", err);
                    }
                }
            }),
        );

        let mut state = self.inner.state.lock();
        state.doc_subs.insert(key.clone(), doc_sub);
        state.sink_subs.insert(key, sink);
        drop(state);
        self.inner.bus.publish(&Notification::Subscription {
            space: space.clone(),
            id,
            established: true,
        });
        Ok(())
    }

    /// Applies a server-held entry to the replica and the local document,
    /// bypassing the push path.
    fn apply_server_entry(
        &self,
        space: &SpaceId,
        entry: &WireEntry,
        integrate_confirmed: bool,
    ) -> Result<()> {
        let id = EntityId::from_uri(&entry.id)?;
        let key = (space.clone(), id);

        // Skip entries that echo one of our own in-flight commits; the
        // receipt path promotes those.
        let ours = self.inner.replicas.with(space, |replica| {
            replica
                .pending()
                .iter()
                .any(|commit| commit.writes.contains_key(&id))
        });

        let _guard = self.inner.gate.acquire();
        {
            let mut state = self.inner.state.lock();
            state.applying.insert(key.clone());
        }
        let result = (|| -> Result<()> {
            let hash = CommitHash::new(
                *blake3::hash(format!("{}@{}", entry.id, entry.version).as_bytes()).as_bytes(),
            );
            if integrate_confirmed && !ours {
                self.inner.replicas.with(space, |replica| {
                    replica.integrate(hash, entry.version, [(id, entry.value.clone())]);
                });
            }
            // The document reflects the two-tier read: a newer local
            // pending write is not clobbered by older server state.
            let effective = self
                .inner
                .replicas
                .with(space, |replica| replica.read(id))
                .map(|read| read.value)
                .unwrap_or_else(|| entry.value.clone());
            let doc = self
                .inner
                .store
                .get(space, id, MediaType::Json, true, None)?
                .expect("create_if_not_found always yields a document");
            let before = doc.get();
            let incoming = effective.unwrap_or(Value::Null);
            if !deep_equal(before.as_ref(), Some(&incoming)) {
                doc.send(incoming)?;
                let after = doc.get();
                self.inner.scheduler.notify_change(
                    &(space.clone(), id, MediaType::Json),
                    before.as_ref(),
                    after.as_ref(),
                );
            }
            Ok(())
        })();
        self.inner.state.lock().applying.remove(&key);
        self.inner.scheduler.run_pending();
        self.inner.bus.publish(&Notification::Pull {
            space: space.clone(),
            id,
        });
        result
    }

    /// Pushes everything queued: synthesizes commits for dirty documents
    /// not already covered by a pending commit, then sends the pending
    /// queue in order, applying confirmations and cascade rejections.
    pub async fn flush_pushes(&self) -> Result<()> {
        // Incoming server state must not be interleaved with pushes.
        self.inner.gate.wait_zero().await;

        let spaces: Vec<SpaceId> = {
            let state = self.inner.state.lock();
            state.push_spaces.iter().cloned().collect()
        };
        for space in spaces {
            self.flush_space(&space).await?;
        }
        Ok(())
    }

    async fn flush_space(&self, space: &SpaceId) -> Result<()> {
        // 1. Synthesize commits for dirty documents whose change did not
        //    come through a transaction.
        let dirty: Vec<EntityId> = {
            let mut state = self.inner.state.lock();
            let ids: Vec<EntityId> = state
                .dirty
                .iter()
                .filter(|(s, _)| s == space)
                .map(|(_, id)| *id)
                .collect();
            state.dirty.retain(|(s, _)| s != space);
            ids
        };
        for id in dirty {
            let doc = self
                .inner
                .store
                .get(space, id, MediaType::Json, false, None)?;
            let doc = match doc {
                Some(doc) if !doc.is_ephemeral() => doc,
                _ => continue,
            };
            let value = match doc.get() {
                Some(value) => value,
                None => continue,
            };
            self.inner.replicas.with(space, |replica| {
                let covered = replica.pending().iter().any(|commit| {
                    commit
                        .writes
                        .get(&id)
                        .map_or(false, |w| deep_equal(w.value.as_ref(), Some(&value)))
                });
                if !covered {
                    let version = replica.confirmed(id).map(|e| e.version).unwrap_or(0);
                    replica.commit(
                        vec![Operation::Set {
                            id,
                            value: value.clone(),
                        }],
                        vec![ConfirmedRead { id, version }],
                        vec![],
                    );
                }
            });
        }

        // 2. Send the pending queue in order.
        loop {
            let next: Option<PendingCommit> = self
                .inner
                .replicas
                .with(space, |replica| replica.pending().first().cloned());
            let commit = match next {
                Some(commit) => commit,
                None => break,
            };
            let provider = self.provider(space);
            let wire = WireCommit::from_parts(
                &commit.operations,
                &commit.confirmed_reads,
                &commit.pending_reads,
            );
            self.inner.bus.publish(&Notification::PushSent {
                space: space.clone(),
                hash: commit.hash,
            });
            let receipt = provider
                .send(wire)
                .await
                .with_context(|| format!("push to {} failed", space))?;
            match receipt {
                Receipt::Confirm { hash, version } => {
                    let hash = CommitHash::from_hex(&hash)?;
                    self.inner
                        .replicas
                        .with(space, |replica| replica.confirm(hash, version));
                    self.inner.bus.publish(&Notification::PushConfirmed {
                        space: space.clone(),
                        hash,
                        version,
                    });
                }
                Receipt::Reject { hash, reason } => {
                    let hash = CommitHash::from_hex(&hash)?;
                    let changes = self
                        .inner
                        .replicas
                        .with(space, |replica| replica.reject(hash));
                    // Revert the affected documents to what remains.
                    for change in changes {
                        let entry = WireEntry {
                            id: change.id.to_uri(),
                            value: change.after.clone(),
                            version: 0,
                        };
                        self.apply_server_entry(space, &entry, false)?;
                    }
                    self.inner.bus.publish(&Notification::PushRejected {
                        space: space.clone(),
                        hash,
                        reason,
                    });
                }
            }
        }
        Ok(())
    }

    /// Resolves once loading promises and pending pushes are drained. The
    /// scheduler must be idle before pushes are flushed so mid-update
    /// writes are never sent.
    pub async fn synced(&self) -> Result<()> {
        loop {
            self.inner.scheduler.run_pending();
            self.inner.scheduler.idle().await;

            if self.take_resync_flag() {
                self.resync().await?;
            }

            self.flush_pushes().await?;

            let (loading_empty, dirty_empty, spaces) = {
                let state = self.inner.state.lock();
                (
                    state.loading.is_empty(),
                    state.dirty.is_empty(),
                    state.push_spaces.iter().cloned().collect::<Vec<_>>(),
                )
            };
            let pending_empty = spaces.iter().all(|space| {
                self.inner
                    .replicas
                    .with(space, |replica| replica.pending_len() == 0)
            });
            if loading_empty && dirty_empty && pending_empty && self.inner.scheduler.is_idle() {
                return Ok(());
            }
            futures_timer::Delay::new(Duration::from_millis(10)).await;
        }
    }

    fn take_resync_flag(&self) -> bool {
        let mut state = self.inner.state.lock();
        std::mem::take(&mut state.needs_resync)
    }

    /// Re-subscribes and re-synchronizes every synced key, used after a
    /// reconnect.
    async fn resync(&self) -> Result<()> {
        let keys: Vec<SyncKey> = {
            let mut state = self.inner.state.lock();
            // Sinks of the old connection are stale; drop them so
            // ensure_subscribed builds fresh ones.
            for (_, sink) in state.sink_subs.drain() {
                sink.cancel();
            }
            for (_, sub) in state.doc_subs.drain() {
                sub.cancel();
            }
            state.synced_keys.iter().cloned().collect()
        };
        for (space, id, schema) in keys {
            let link = NormalizedFullLink {
                space,
                id: LinkId::Entity(id),
                path: mnemo_store::PathBuf::new(),
                media_type: MediaType::Json,
                schema: schema
                    .as_deref()
                    .and_then(|s| serde_json::from_str(s).ok())
                    .map(Arc::new),
                root_schema: None,
            };
            self.sync_cell(&link).await?;
        }
        Ok(())
    }
}

fn handle_provider_event(inner: &Arc<ManagerInner>, space: &SpaceId, event: &ProviderEvent) {
    match event {
        ProviderEvent::ConnectionUpdate { connected } => {
            if *connected {
                inner.state.lock().needs_resync = true;
            }
            inner.bus.publish(&Notification::ConnectionUpdate {
                space: space.clone(),
                connected: *connected,
            });
        }
        ProviderEvent::Committed { hash, version, entries } => {
            // Our own commits are promoted by the receipt path.
            let hash = match CommitHash::from_hex(hash) {
                Ok(hash) => hash,
                Err(err) => {
                    tracing::error!("bad commit hash from provider: {}", err);
                    return;
                }
            };
            let ours = inner.replicas.with(space, |replica| {
                replica.pending().iter().any(|commit| commit.hash == hash)
            });
            if ours {
                return;
            }
            let values: Vec<(EntityId, Option<Value>)> = entries
                .iter()
                .filter_map(|entry| {
                    EntityId::from_uri(&entry.id)
                        .ok()
                        .map(|id| (id, entry.value.clone()))
                })
                .collect();
            inner.replicas.with(space, |replica| {
                replica.integrate(hash, *version, values);
            });
        }
    }
}

async fn timeout<T>(
    future: impl Future<Output = T>,
    duration: Duration,
) -> std::result::Result<T, ()> {
    futures::pin_mut!(future);
    match futures::future::select(future, futures_timer::Delay::new(duration)).await {
        Either::Left((value, _)) => Ok(value),
        Either::Right(_) => Err(()),
    }
}

/// Counting semaphore whose `wait_zero` resolves while no guard is held.
/// Guards the application of incoming server state against concurrent
/// local pushes.
#[derive(Clone, Default)]
pub struct Gate {
    inner: Arc<Mutex<GateInner>>,
}

#[derive(Default)]
struct GateInner {
    count: usize,
    wakers: Vec<Waker>,
}

impl Gate {
    /// Takes a guard, incrementing the count.
    pub fn acquire(&self) -> GateGuard {
        self.inner.lock().count += 1;
        GateGuard {
            inner: self.inner.clone(),
        }
    }

    /// Resolves when the count is zero.
    pub fn wait_zero(&self) -> WaitZero {
        WaitZero {
            inner: self.inner.clone(),
        }
    }
}

/// Guard returned by [`Gate::acquire`].
pub struct GateGuard {
    inner: Arc<Mutex<GateInner>>,
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        let mut inner = self.inner.lock();
        inner.count -= 1;
        if inner.count == 0 {
            for waker in inner.wakers.drain(..) {
                waker.wake();
            }
        }
    }
}

/// Future resolving once the gate count reaches zero.
pub struct WaitZero {
    inner: Arc<Mutex<GateInner>>,
}

impl Future for WaitZero {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<()> {
        let mut inner = self.inner.lock();
        if inner.count == 0 {
            Poll::Ready(())
        } else {
            inner.wakers.push(cx.waker().clone());
            Poll::Pending
        }
    }
}
