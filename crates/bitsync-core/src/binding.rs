//! Per-consumer binding to a coordinator
//!
//! A [`BitBinding`] is what a UI surface or application component holds. It
//! forwards the coordinator operations, exposes observable per-bit state via
//! `watch` channels, and owns every subscription it creates so they are all
//! released when the consumer goes away.

use crate::engine::{BitDownload, Coordinator, ProgressListener, Subscription};
use crate::transport::BitTransport;
use bitsync_types::{Bit, SpeedReport, TransferSnapshot};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Observable latest snapshot of one bit; `None` until something is known
pub type BitWatch = watch::Receiver<Option<TransferSnapshot>>;

pub struct BitBinding {
    coordinator: Coordinator,
    subscriptions: Mutex<Vec<Subscription>>,
    watchers: Mutex<HashMap<String, Arc<watch::Sender<Option<TransferSnapshot>>>>>,
}

impl BitBinding {
    pub fn new(coordinator: Coordinator) -> Self {
        Self {
            coordinator,
            subscriptions: Mutex::new(Vec::new()),
            watchers: Mutex::new(HashMap::new()),
        }
    }

    /// Bind to the process-wide coordinator
    pub fn global() -> Self {
        Self::new(crate::global().clone())
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    /// Swap the transport of the underlying coordinator
    pub fn set_backend(&self, backend: Arc<dyn BitTransport>) {
        self.coordinator.set_backend(backend);
    }

    pub fn download(&self, bit: Bit, on_progress: Option<ProgressListener>) -> BitDownload {
        self.coordinator.download(bit, on_progress)
    }

    /// Progress subscription owned by this binding
    pub fn on_progress<F>(&self, hash: &str, listener: F) -> Subscription
    where
        F: Fn(&TransferSnapshot) + Send + Sync + 'static,
    {
        self.track(self.coordinator.on_progress(hash, listener))
    }

    /// Completion subscription owned by this binding
    pub fn on_complete<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Bit, &[Bit]) + Send + Sync + 'static,
    {
        self.track(self.coordinator.on_complete(listener))
    }

    pub fn is_queued(&self, hash: &str) -> bool {
        self.coordinator.is_queued(hash)
    }

    pub fn latest_pct(&self, hash: &str) -> Option<f64> {
        self.coordinator.latest_pct(hash)
    }

    pub fn speed(&self, filter: Option<&HashSet<String>>) -> SpeedReport {
        self.coordinator.speed(filter)
    }

    /// Observe the throttled snapshots of a bit as a `watch` channel
    ///
    /// All watchers of the same hash in this binding share one subscription.
    pub fn watch(&self, hash: &str) -> BitWatch {
        let mut watchers = self.watchers.lock();
        if let Some(sender) = watchers.get(hash) {
            return sender.subscribe();
        }

        let (sender, receiver) = watch::channel(None);
        let sender = Arc::new(sender);
        watchers.insert(hash.to_string(), sender.clone());
        drop(watchers);

        // Replay of an existing snapshot lands in the channel right away
        let subscription = self.coordinator.on_progress(hash, move |snapshot| {
            sender.send_replace(Some(snapshot.clone()));
        });
        self.track(subscription);

        receiver
    }

    /// Release every subscription made through this binding
    pub fn close(&self) {
        let subscriptions = std::mem::take(&mut *self.subscriptions.lock());
        let count = subscriptions.len();
        for subscription in subscriptions {
            subscription.unsubscribe();
        }
        self.watchers.lock().clear();

        if count > 0 {
            debug!(count, "Binding released its subscriptions");
        }
    }

    fn track(&self, subscription: Subscription) -> Subscription {
        self.subscriptions.lock().push(subscription.clone());
        subscription
    }
}

impl Drop for BitBinding {
    fn drop(&mut self) {
        self.close();
    }
}
