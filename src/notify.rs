//! Runtime notification bus.

use mnemo_store::{CommitHash, EntityId, SpaceId};
use parking_lot::Mutex;
use std::sync::Arc;

/// Payloads delivered to runtime subscribers.
#[derive(Clone, Debug)]
pub enum Notification {
    /// A transaction committed locally.
    Commit {
        /// Write space of the commit.
        space: SpaceId,
        /// Provisional commit hash.
        hash: CommitHash,
    },
    /// A commit was sent to storage.
    PushSent {
        /// Space pushed to.
        space: SpaceId,
        /// Commit hash.
        hash: CommitHash,
    },
    /// Storage confirmed a commit.
    PushConfirmed {
        /// Space pushed to.
        space: SpaceId,
        /// Commit hash.
        hash: CommitHash,
        /// Server-assigned version.
        version: u64,
    },
    /// Storage rejected a commit; dependents were cascaded.
    PushRejected {
        /// Space pushed to.
        space: SpaceId,
        /// Commit hash.
        hash: CommitHash,
        /// Server-stated reason.
        reason: String,
    },
    /// A server-side value was applied to a local document.
    Pull {
        /// Space pulled from.
        space: SpaceId,
        /// Updated entity.
        id: EntityId,
    },
    /// The connection of a space's provider changed.
    ConnectionUpdate {
        /// Affected space.
        space: SpaceId,
        /// True when connected.
        connected: bool,
    },
    /// A storage subscription was established or dropped.
    Subscription {
        /// Affected space.
        space: SpaceId,
        /// Subscribed entity.
        id: EntityId,
        /// True on establish, false on drop.
        established: bool,
    },
    /// A subscriber or subsystem failed; telemetry detail.
    Error {
        /// Human-readable detail.
        detail: String,
    },
}

/// Return `Ok(true)` to unsubscribe; errors also unsubscribe and surface
/// as an [`Notification::Error`] telemetry event.
pub type Subscriber = Box<dyn FnMut(&Notification) -> anyhow::Result<bool> + Send>;

#[derive(Default)]
struct BusInner {
    subscribers: Vec<(u64, Subscriber)>,
    next: u64,
}

/// Clonable fan-out bus.
#[derive(Clone, Default)]
pub struct NotificationBus {
    inner: Arc<Mutex<BusInner>>,
}

impl NotificationBus {
    /// Creates an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a subscriber.
    pub fn subscribe(&self, subscriber: Subscriber) {
        let mut inner = self.inner.lock();
        let token = inner.next;
        inner.next += 1;
        inner.subscribers.push((token, subscriber));
    }

    /// Publishes a notification to every subscriber, dropping those that
    /// are done or that fail.
    pub fn publish(&self, notification: &Notification) {
        let mut failed = Vec::new();
        {
            let mut inner = self.inner.lock();
            inner.subscribers.retain_mut(|(token, subscriber)| {
                match subscriber(notification) {
                    Ok(done) => !done,
                    Err(err) => {
                        failed.push((*token, err.to_string()));
                        false
                    }
                }
            });
        }
        for (_, detail) in failed {
            tracing::error!("notification subscriber failed: {}", detail);
            self.publish(&Notification::Error { detail });
        }
    }
}
