//! Cooperative action scheduler.
//!
//! Actions are computations registered together with the set of document
//! paths they read. Document changes are matched against those sets; the
//! affected actions are queued and run to fixpoint. An action that writes
//! re-enters the scheduler and produces a follow-up wave. Within one wave
//! actions run in registration order.

use fnv::{FnvHashMap, FnvHashSet};
use mnemo_store::{determine_triggered_actions, DocKey, SortedAndCompactPaths, Value};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, Waker};

/// Identifier of a registered action.
pub type ActionId = u64;

type ActionFn = Arc<dyn Fn() + Send + Sync>;
type EventFn = Box<dyn FnOnce() + Send>;

struct Registered {
    id: ActionId,
    action: ActionFn,
    deps: FnvHashMap<DocKey, SortedAndCompactPaths>,
    cancelled: Arc<AtomicBool>,
}

enum Work {
    Action(ActionId),
    Event(EventFn),
}

#[derive(Default)]
struct SchedulerInner {
    actions: Vec<Registered>,
    queue: VecDeque<Work>,
    queued: FnvHashSet<ActionId>,
    next_id: ActionId,
    running: bool,
    idle_wakers: Vec<Waker>,
}

/// Clonable handle onto the scheduler.
#[derive(Clone, Default)]
pub struct Scheduler {
    inner: Arc<Mutex<SchedulerInner>>,
}

impl Scheduler {
    /// Creates an empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an action with its dependency set. The action is not run
    /// until a dependency changes or it is enqueued explicitly.
    pub fn register(
        &self,
        action: impl Fn() + Send + Sync + 'static,
        deps: FnvHashMap<DocKey, SortedAndCompactPaths>,
    ) -> ActionHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.actions.push(Registered {
            id,
            action: Arc::new(action),
            deps,
            cancelled: cancelled.clone(),
        });
        ActionHandle {
            id,
            cancelled,
            scheduler: Arc::downgrade(&self.inner),
        }
    }

    /// Replaces an action's dependency set; actions re-declare their reads
    /// after every run.
    pub fn set_dependencies(
        &self,
        id: ActionId,
        deps: FnvHashMap<DocKey, SortedAndCompactPaths>,
    ) {
        let mut inner = self.inner.lock();
        if let Some(registered) = inner.actions.iter_mut().find(|a| a.id == id) {
            registered.deps = deps;
        }
    }

    /// Queues an action to run in the next wave.
    pub fn enqueue(&self, id: ActionId) {
        let mut inner = self.inner.lock();
        if inner.queued.insert(id) {
            inner.queue.push_back(Work::Action(id));
        }
    }

    /// Queues a one-shot event.
    pub fn enqueue_event(&self, event: impl FnOnce() + Send + 'static) {
        self.inner.lock().queue.push_back(Work::Event(Box::new(event)));
    }

    /// Consults the dependency sets for a changed document and queues the
    /// actions with a watched difference, in registration order.
    pub fn notify_change(
        &self,
        doc: &DocKey,
        before: Option<&Value>,
        after: Option<&Value>,
    ) -> usize {
        let subscribers: Vec<(ActionId, SortedAndCompactPaths)> = {
            let inner = self.inner.lock();
            inner
                .actions
                .iter()
                .filter(|a| !a.cancelled.load(Ordering::SeqCst))
                .filter_map(|a| a.deps.get(doc).map(|paths| (a.id, paths.clone())))
                .collect()
        };
        if subscribers.is_empty() {
            return 0;
        }
        let triggered = determine_triggered_actions(&subscribers, before, after, None);
        let count = triggered.len();
        for id in triggered {
            self.enqueue(id);
        }
        count
    }

    /// Runs queued work to fixpoint. Actions queued by running actions are
    /// processed in the same call, as follow-up waves.
    pub fn run_pending(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.running {
                // Re-entrant call from inside an action; the outer loop
                // will drain whatever got queued.
                return;
            }
            inner.running = true;
        }
        loop {
            let work = {
                let mut inner = self.inner.lock();
                match inner.queue.pop_front() {
                    Some(work) => {
                        if let Work::Action(id) = &work {
                            inner.queued.remove(id);
                        }
                        Some(work)
                    }
                    None => {
                        inner.running = false;
                        for waker in inner.idle_wakers.drain(..) {
                            waker.wake();
                        }
                        None
                    }
                }
            };
            match work {
                Some(Work::Action(id)) => {
                    let action = {
                        let inner = self.inner.lock();
                        inner
                            .actions
                            .iter()
                            .find(|a| a.id == id && !a.cancelled.load(Ordering::SeqCst))
                            .map(|a| a.action.clone())
                    };
                    if let Some(action) = action {
                        action();
                    }
                }
                Some(Work::Event(event)) => event(),
                None => break,
            }
        }
    }

    /// Resolves when the queue is empty and no action has re-armed
    /// another.
    pub fn idle(&self) -> Idle {
        Idle {
            inner: self.inner.clone(),
        }
    }

    /// True when nothing is queued or running.
    pub fn is_idle(&self) -> bool {
        let inner = self.inner.lock();
        inner.queue.is_empty() && !inner.running
    }
}

/// Cancel handle returned by [`Scheduler::register`]. Once cancelled the
/// action is not invoked again, even if already queued. Idempotent.
pub struct ActionHandle {
    id: ActionId,
    cancelled: Arc<AtomicBool>,
    scheduler: Weak<Mutex<SchedulerInner>>,
}

impl ActionHandle {
    /// The action's id.
    pub fn id(&self) -> ActionId {
        self.id
    }

    /// Cancels the action.
    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(inner) = self.scheduler.upgrade() {
            let mut inner = inner.lock();
            inner.actions.retain(|a| a.id != self.id);
            inner.queued.remove(&self.id);
        }
    }
}

/// Future resolving once the scheduler has drained.
pub struct Idle {
    inner: Arc<Mutex<SchedulerInner>>,
}

impl Future for Idle {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<()> {
        let mut inner = self.inner.lock();
        if inner.queue.is_empty() && !inner.running {
            Poll::Ready(())
        } else {
            inner.idle_wakers.push(cx.waker().clone());
            Poll::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mnemo_store::{object, EntityId, MediaType, PathBuf, SpaceId};
    use std::sync::atomic::AtomicUsize;

    fn doc_key(byte: u8) -> DocKey {
        let space: SpaceId = "did:key:sched".parse().unwrap();
        (space, EntityId::new([byte; 32]), MediaType::Json)
    }

    fn deps(byte: u8, paths: &[&[&str]]) -> FnvHashMap<DocKey, SortedAndCompactPaths> {
        let mut map = FnvHashMap::default();
        map.insert(
            doc_key(byte),
            paths
                .iter()
                .map(|p| p.iter().copied().collect::<PathBuf>())
                .collect(),
        );
        map
    }

    #[test]
    fn change_triggers_dependent_actions_in_order() {
        let scheduler = Scheduler::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let o1 = order.clone();
        let o2 = order.clone();
        // registered second, fires second, regardless of queue pokes
        scheduler.register(move || o1.lock().push("first"), deps(1, &[&["x"]]));
        scheduler.register(move || o2.lock().push("second"), deps(1, &[&["x"]]));
        let before = object! { "x" => 1i64 };
        let after = object! { "x" => 2i64 };
        let triggered = scheduler.notify_change(&doc_key(1), Some(&before), Some(&after));
        assert_eq!(triggered, 2);
        scheduler.run_pending();
        assert_eq!(*order.lock(), vec!["first", "second"]);
        assert!(scheduler.is_idle());
    }

    #[test]
    fn unrelated_changes_do_not_fire() {
        let scheduler = Scheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let observed = runs.clone();
        scheduler.register(
            move || {
                observed.fetch_add(1, Ordering::SeqCst);
            },
            deps(1, &[&["x"]]),
        );
        let before = object! { "y" => 1i64 };
        let after = object! { "y" => 2i64 };
        scheduler.notify_change(&doc_key(1), Some(&before), Some(&after));
        scheduler.run_pending();
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cancelled_actions_are_not_invoked() {
        let scheduler = Scheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let observed = runs.clone();
        let handle = scheduler.register(
            move || {
                observed.fetch_add(1, Ordering::SeqCst);
            },
            deps(1, &[&["x"]]),
        );
        scheduler.enqueue(handle.id());
        handle.cancel();
        handle.cancel();
        scheduler.run_pending();
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn events_and_follow_up_waves_drain() {
        let scheduler = Scheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let observed = runs.clone();
        let chained = scheduler.clone();
        scheduler.enqueue_event(move || {
            observed.fetch_add(1, Ordering::SeqCst);
            let observed = observed.clone();
            chained.enqueue_event(move || {
                observed.fetch_add(1, Ordering::SeqCst);
            });
        });
        scheduler.run_pending();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[async_std::test]
    async fn idle_resolves_after_drain() {
        let scheduler = Scheduler::new();
        scheduler.enqueue_event(|| {});
        scheduler.run_pending();
        scheduler.idle().await;
        assert!(scheduler.is_idle());
    }
}
