//! Subscriber registries and isolated listener invocation

use bitsync_types::{Bit, TransferSnapshot};
use parking_lot::{Mutex, ReentrantMutex};
use std::cell::Cell;
use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::warn;

/// Receives throttled progress snapshots for one bit
pub type ProgressListener = Arc<dyn Fn(&TransferSnapshot) + Send + Sync>;

/// Receives the requested bit and everything it resolved to, once per
/// completed real transfer
pub type CompletionListener = Arc<dyn Fn(&Bit, &[Bit]) + Send + Sync>;

type Cleanup = Box<dyn FnOnce() + Send>;

/// Handle returned by every subscription
///
/// Calling [`Subscription::unsubscribe`] more than once is a no-op. Clones
/// share the same underlying registration. Dropping the handle does NOT
/// unsubscribe.
#[derive(Clone)]
pub struct Subscription {
    cleanup: Arc<Mutex<Option<Cleanup>>>,
}

impl Subscription {
    pub(crate) fn new(cleanup: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cleanup: Arc::new(Mutex::new(Some(Box::new(cleanup)))),
        }
    }

    /// Remove the listener
    pub fn unsubscribe(&self) {
        // Take first so the cleanup never runs under our own lock
        let cleanup = self.cleanup.lock().take();
        if let Some(cleanup) = cleanup {
            cleanup();
        }
    }

    /// Whether the listener is still registered through this handle
    pub fn is_active(&self) -> bool {
        self.cleanup.lock().is_some()
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}

/// A progress listener and the stamp of the newest snapshot it was given
///
/// Stamps are handed out under the coordinator lock, so a listener never
/// sees a snapshot older than one it already received, even when two
/// threads race to deliver.
pub(crate) struct Registered {
    listener: ProgressListener,
    seen: ReentrantMutex<Cell<u64>>,
}

impl Registered {
    pub fn new(listener: ProgressListener) -> Arc<Self> {
        Arc::new(Self {
            listener,
            seen: ReentrantMutex::new(Cell::new(0)),
        })
    }

    /// Call the listener unless a newer snapshot already reached it
    fn deliver(&self, stamp: u64, snapshot: &TransferSnapshot) -> bool {
        let seen = self.seen.lock();
        if stamp <= seen.get() {
            return false;
        }
        seen.set(stamp);

        if catch_unwind(AssertUnwindSafe(|| (self.listener)(snapshot))).is_err() {
            warn!(
                hash = %snapshot.parent().hash,
                "Progress listener panicked, continuing with the remaining listeners"
            );
        }
        true
    }
}

/// Progress listeners keyed by bit hash, in registration order
#[derive(Default)]
pub(crate) struct ProgressListeners {
    by_hash: HashMap<String, BTreeMap<u64, Arc<Registered>>>,
}

impl ProgressListeners {
    pub fn add(&mut self, hash: &str, id: u64, listener: Arc<Registered>) {
        self.by_hash
            .entry(hash.to_string())
            .or_default()
            .insert(id, listener);
    }

    /// Remove a listener, dropping the hash entry once it is empty
    pub fn remove(&mut self, hash: &str, id: u64) -> bool {
        let Some(set) = self.by_hash.get_mut(hash) else {
            return false;
        };
        let removed = set.remove(&id).is_some();
        if set.is_empty() {
            self.by_hash.remove(hash);
        }
        removed
    }

    /// Clone the current listener set so it can be invoked without a lock
    pub fn get(&self, hash: &str) -> Vec<Arc<Registered>> {
        self.by_hash
            .get(hash)
            .map(|set| set.values().cloned().collect())
            .unwrap_or_default()
    }

    #[cfg(test)]
    pub fn contains_hash(&self, hash: &str) -> bool {
        self.by_hash.contains_key(hash)
    }

    pub fn clear(&mut self) {
        self.by_hash.clear();
    }
}

/// Deliver a stamped snapshot to each listener; a panicking listener is
/// skipped, a listener that already saw something newer is passed over
pub(crate) fn notify_progress(listeners: &[Arc<Registered>], stamp: u64, snapshot: &TransferSnapshot) {
    for listener in listeners {
        listener.deliver(stamp, snapshot);
    }
}

pub(crate) fn notify_complete(listeners: &[CompletionListener], bit: &Bit, resolved: &[Bit]) {
    for listener in listeners {
        if catch_unwind(AssertUnwindSafe(|| listener(bit, resolved))).is_err() {
            warn!(hash = %bit.hash, "Completion listener panicked");
        }
    }
}
