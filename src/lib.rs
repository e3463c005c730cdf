//! # mnemo — a reactive memory runtime
//!
//! Documents live in named spaces, addressed by content-derived entity
//! ids. Recipes read and write them through transactions and cursors; the
//! runtime keeps derived values consistent with their inputs, persists
//! state through optimistic commits layered over server-confirmed state,
//! and synchronizes with a remote memory service through pluggable
//! providers.
mod manager;
mod notify;
mod provider;
mod scheduler;

pub use crate::manager::{Gate, ProviderFactory, StorageManager, DEFAULT_SYNC_TIMEOUT};
pub use crate::notify::{Notification, NotificationBus, Subscriber};
pub use crate::provider::{
    MemoryProvider, Provider, ProviderEvent, Receipt, Selector, SinkFn, SinkHandle,
    SubscriptionFn, WireCommit, WireConfirmedRead, WireEntry, WireOp, WireOperation,
    WirePendingRead, WireReads,
};
pub use crate::scheduler::{ActionHandle, ActionId, Idle, Scheduler};
pub use mnemo_store::{
    create_ref, deep_equal, derive_ref, discover_links, is_link, normalize_link, parse_link,
    Address, Cursor, Doc, DocumentStore, EntityId, Error, Link, LinkContext, LinkId, MediaType,
    NormalizedFullLink, Object, PathBuf, ReplicaSet, SpaceId, Status, Transaction, TxCommit,
    Value,
};

use anyhow::Result;
use fnv::FnvHashMap;
use mnemo_store::{group_by_document, InvariantKind};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// The runtime: document store, replicas, scheduler, storage manager and
/// notification bus behind one clonable handle.
#[derive(Clone)]
pub struct Runtime {
    store: DocumentStore,
    replicas: ReplicaSet,
    scheduler: Scheduler,
    bus: NotificationBus,
    manager: StorageManager,
}

impl Runtime {
    /// Creates a runtime with a provider factory that is consulted once
    /// per space.
    pub fn new(factory: ProviderFactory) -> Self {
        let store = DocumentStore::new();
        let replicas = ReplicaSet::new();
        let scheduler = Scheduler::new();
        let bus = NotificationBus::new();
        let manager = StorageManager::new(
            store.clone(),
            replicas.clone(),
            scheduler.clone(),
            bus.clone(),
            factory,
        );
        Self {
            store,
            replicas,
            scheduler,
            bus,
            manager,
        }
    }

    /// Creates a runtime backed by in-memory providers, one per space,
    /// and installs test logging. Returns the pool so tests can reach the
    /// per-space servers.
    pub fn memory() -> (Self, MemoryPool) {
        tracing_log::LogTracer::init().ok();
        let env = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_else(|_| "info".to_owned());
        let subscriber = tracing_subscriber::FmtSubscriber::builder()
            .with_span_events(FmtSpan::ACTIVE | FmtSpan::CLOSE)
            .with_env_filter(EnvFilter::new(env))
            .with_writer(std::io::stderr)
            .finish();
        tracing::subscriber::set_global_default(subscriber).ok();
        log_panics::init();

        let pool = MemoryPool::default();
        let factory_pool = pool.clone();
        let runtime = Self::new(Box::new(move |space| {
            Arc::new(factory_pool.open(space)) as Arc<dyn Provider>
        }));
        (runtime, pool)
    }

    /// The document store.
    pub fn store(&self) -> &DocumentStore {
        &self.store
    }

    /// The replica set.
    pub fn replicas(&self) -> &ReplicaSet {
        &self.replicas
    }

    /// The scheduler.
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// The storage manager.
    pub fn manager(&self) -> &StorageManager {
        &self.manager
    }

    /// Opens a transaction.
    pub fn edit(&self) -> Transaction {
        self.edit_as(Value::Null)
    }

    /// Opens a transaction under an explicit cause.
    pub fn edit_as(&self, cause: Value) -> Transaction {
        Transaction::new(self.store.clone(), self.replicas.clone(), cause)
    }

    /// Commits a transaction and routes the outcome: document diffs feed
    /// the reactive engine, queued operations are announced for push.
    pub fn commit(&self, tx: &Transaction) -> Result<TxCommit, Error> {
        let outcome = tx.commit()?;
        self.manager.handle_commit(&outcome);
        Ok(outcome)
    }

    /// A cell handle onto the root of an entity.
    pub fn cell(&self, space: &SpaceId, id: EntityId) -> Cell {
        Cell {
            runtime: self.clone(),
            link: NormalizedFullLink {
                space: space.clone(),
                id: LinkId::Entity(id),
                path: PathBuf::new(),
                media_type: MediaType::Json,
                schema: None,
                root_schema: None,
            },
        }
    }

    /// Creates (or finds) the entity `(value, cause)` hashes to and
    /// returns a cell onto it.
    pub fn create_cell(&self, space: &SpaceId, value: Value, cause: &Value) -> Result<Cell, Error> {
        let doc = self.store.get_or_create(value, cause, space)?;
        Ok(self.cell(space, doc.id()))
    }

    /// Subscribes to runtime notifications. Return `Ok(true)` to
    /// unsubscribe; errors unsubscribe too.
    pub fn subscribe(&self, subscriber: Subscriber) {
        self.bus.subscribe(subscriber);
    }

    /// Registers a reactive action. The body runs once immediately to
    /// establish its dependency set, which is refreshed from its read log
    /// after every run; it re-runs whenever a watched path changes.
    pub fn register_action(
        &self,
        body: impl Fn(&Transaction) -> Result<()> + Send + Sync + 'static,
    ) -> ActionHandle {
        let runtime = self.clone();
        let slot: Arc<Mutex<Option<ActionId>>> = Arc::new(Mutex::new(None));
        let id_slot = slot.clone();
        let handle = self.scheduler.register(
            move || {
                let tx = runtime.edit();
                if let Err(err) = body(&tx) {
                    tracing::error!("action failed: {}", err);
                    tx.abort(Some("action failed")).ok();
                    return;
                }
                match runtime.commit(&tx) {
                    Ok(outcome) => {
                        if let Some(id) = *id_slot.lock() {
                            let deps = dependencies_of(&outcome);
                            runtime.scheduler.set_dependencies(id, deps);
                        }
                    }
                    Err(err) => {
                        tracing::error!("action commit failed: {}", err);
                    }
                }
            },
            FnvHashMap::default(),
        );
        *slot.lock() = Some(handle.id());
        self.scheduler.enqueue(handle.id());
        self.scheduler.run_pending();
        handle
    }

    /// Resolves when loading, pushes and the scheduler are all drained.
    pub async fn synced(&self) -> Result<()> {
        self.manager.synced().await
    }
}

fn dependencies_of(
    outcome: &TxCommit,
) -> FnvHashMap<mnemo_store::DocKey, mnemo_store::SortedAndCompactPaths> {
    group_by_document(
        outcome
            .log
            .iter()
            .filter(|invariant| invariant.kind == InvariantKind::Read)
            .map(|invariant| invariant.address.clone()),
    )
}

/// A lightweight, addressable view onto `(document, path, schema)`.
#[derive(Clone)]
pub struct Cell {
    runtime: Runtime,
    link: NormalizedFullLink,
}

impl Cell {
    /// The cell's normalized link.
    pub fn link(&self) -> &NormalizedFullLink {
        &self.link
    }

    /// A cell one property deeper.
    pub fn key(&self, component: impl Into<String>) -> Cell {
        Cell {
            runtime: self.runtime.clone(),
            link: NormalizedFullLink {
                path: self.link.path.child(component),
                ..self.link.clone()
            },
        }
    }

    /// A cell with a schema context attached.
    pub fn with_schema(&self, schema: Value) -> Cell {
        let schema = Arc::new(schema);
        Cell {
            runtime: self.runtime.clone(),
            link: NormalizedFullLink {
                schema: Some(schema.clone()),
                root_schema: Some(schema),
                ..self.link.clone()
            },
        }
    }

    /// A cursor over this cell within a transaction.
    pub fn cursor(&self, tx: &Transaction) -> Cursor {
        Cursor::new(tx.clone(), self.link.clone())
    }

    /// One-shot read through a throwaway transaction.
    pub fn get(&self) -> Result<Option<Value>, Error> {
        let tx = self.runtime.edit();
        let value = Cursor::read_only(tx.clone(), self.link.clone()).get()?;
        tx.abort(None).ok();
        Ok(value)
    }

    /// One-shot write-and-commit.
    pub fn set(&self, value: Value) -> Result<(), Error> {
        let tx = self.runtime.edit();
        self.cursor(&tx).set(Some(value))?;
        self.runtime.commit(&tx)?;
        Ok(())
    }

    /// Ensures this cell is synced with storage.
    pub async fn sync(&self) -> Result<()> {
        self.runtime.manager.sync_cell(&self.link).await
    }
}

/// Per-space in-memory providers, reachable by tests.
#[derive(Clone, Default)]
pub struct MemoryPool {
    providers: Arc<Mutex<FnvHashMap<SpaceId, MemoryProvider>>>,
}

impl MemoryPool {
    /// Opens (or returns) the provider of a space.
    pub fn open(&self, space: &SpaceId) -> MemoryProvider {
        self.providers
            .lock()
            .entry(space.clone())
            .or_insert_with(MemoryProvider::new)
            .clone()
    }

    /// Returns the provider of a space if it was opened.
    pub fn get(&self, space: &SpaceId) -> Option<MemoryProvider> {
        self.providers.lock().get(space).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mnemo_store::{object, path};

    fn space() -> SpaceId {
        "did:key:runtime".parse().unwrap()
    }

    fn id(byte: u8) -> EntityId {
        EntityId::new([byte; 32])
    }

    #[test]
    fn cell_set_get_round_trips() {
        let (runtime, _) = Runtime::memory();
        let cell = runtime.cell(&space(), id(1));
        cell.set(object! { "title" => "hi" }).unwrap();
        let value = cell.key("title").get().unwrap().unwrap();
        assert_eq!(value.as_str(), Some("hi"));
    }

    #[test]
    fn actions_rerun_on_watched_changes() {
        let (runtime, _) = Runtime::memory();
        let input = runtime.cell(&space(), id(1));
        input.set(object! { "n" => 1i64 }).unwrap();
        let output = runtime.cell(&space(), id(2));

        let source = input.clone();
        let target = output.clone();
        runtime.register_action(move |tx| {
            let n = source
                .cursor(tx)
                .key("n")?
                .get()?
                .and_then(|v| v.as_number())
                .unwrap_or(0.0);
            target.cursor(tx).set(Some(object! { "double" => n * 2.0 }))?;
            Ok(())
        });
        assert_eq!(
            output.key("double").get().unwrap().unwrap().as_number(),
            Some(2.0)
        );

        input.set(object! { "n" => 5i64 }).unwrap();
        runtime.scheduler().run_pending();
        assert_eq!(
            output.key("double").get().unwrap().unwrap().as_number(),
            Some(10.0)
        );
    }

    #[test]
    fn unrelated_writes_do_not_rerun_actions() {
        let (runtime, _) = Runtime::memory();
        let input = runtime.cell(&space(), id(1));
        input
            .set(object! { "watched" => 1i64, "ignored" => 1i64 })
            .unwrap();
        let runs = Arc::new(Mutex::new(0usize));
        let counted = runs.clone();
        let source = input.clone();
        runtime.register_action(move |tx| {
            *counted.lock() += 1;
            source.cursor(tx).key("watched")?.get()?;
            Ok(())
        });
        assert_eq!(*runs.lock(), 1);
        // writing an unwatched path does not re-run
        let tx = runtime.edit();
        tx.write(
            &Address::root(space(), id(1)).at(&path!("ignored")),
            Some(Value::from(2i64)),
        )
        .unwrap();
        runtime.commit(&tx).unwrap();
        runtime.scheduler().run_pending();
        assert_eq!(*runs.lock(), 1);
        // writing the watched path does
        let tx = runtime.edit();
        tx.write(
            &Address::root(space(), id(1)).at(&path!("watched")),
            Some(Value::from(2i64)),
        )
        .unwrap();
        runtime.commit(&tx).unwrap();
        runtime.scheduler().run_pending();
        assert_eq!(*runs.lock(), 2);
    }

    #[async_std::test]
    async fn synced_pushes_commits() -> Result<()> {
        let (runtime, pool) = Runtime::memory();
        let cell = runtime.cell(&space(), id(1));
        cell.set(object! { "v" => 1i64 }).unwrap();
        cell.sync().await?;
        runtime.synced().await?;
        let provider = pool.get(&space()).unwrap();
        let value = provider.get(&id(1).to_uri()).await?.unwrap();
        assert_eq!(value.get("v").unwrap().as_number(), Some(1.0));
        // pending queue drained into confirmed
        let confirmed = runtime.replicas().read(&space(), id(1)).unwrap();
        assert!(matches!(
            confirmed.source,
            mnemo_store::ReadSource::Confirmed
        ));
        Ok(())
    }

    #[async_std::test]
    async fn pull_applies_remote_changes() -> Result<()> {
        let (runtime, pool) = Runtime::memory();
        let cell = runtime.cell(&space(), id(1));
        cell.set(object! { "v" => 1i64 }).unwrap();
        cell.sync().await?;
        runtime.synced().await?;

        // another client updates the entity on the server
        let provider = pool.get(&space()).unwrap();
        provider.apply_remote(WireCommit {
            reads: WireReads::default(),
            operations: vec![WireOperation {
                op: WireOp::Set,
                id: id(1).to_uri(),
                value: Some(object! { "v" => 9i64 }),
            }],
        })?;

        assert_eq!(cell.key("v").get().unwrap().unwrap().as_number(), Some(9.0));
        Ok(())
    }
}
