//! Download Coordinator - single-flight registry of bit transfers
//!
//! This is the top-level coordinator that:
//! - Runs at most one transfer per hash, shared by every concurrent caller
//! - Fans throttled progress out to every subscriber of a hash
//! - Purges per-hash bookkeeping as soon as a transfer settles

use super::listeners::{
    notify_complete, notify_progress, CompletionListener, ProgressListener, ProgressListeners,
    Registered, Subscription,
};
use super::speed::{self, Measure};
use super::throttle::{Offer, ThrottleState};
use crate::error::BitsyncError;
use crate::transport::BitTransport;
use bitsync_types::{Bit, BitPack, BitTotals, EngineSettings, SpeedReport, TransferSnapshot};
use futures::future::{self, BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Shared result of one transfer. Every caller of the same hash gets a clone.
pub type BitDownload = Shared<BoxFuture<'static, Result<Vec<Bit>, BitsyncError>>>;

/// Bookkeeping for the transfer currently running for a hash
struct InFlight {
    generation: u64,
    future: BitDownload,
    /// Runtime the transfer was started on; throttle timers are spawned here
    runtime: Handle,
    /// Listeners handed to `download()`, dropped on settlement
    scoped: Vec<u64>,
}

/// All per-hash maps, guarded by one lock
#[derive(Default)]
struct State {
    pending: HashMap<String, TransferSnapshot>,
    settled: HashMap<String, TransferSnapshot>,
    listeners: ProgressListeners,
    queued: HashSet<String>,
    in_flight: HashMap<String, InFlight>,
    throttle: HashMap<String, ThrottleState>,
    last_measure: HashMap<String, Measure>,
    completion: BTreeMap<u64, CompletionListener>,
    next_id: u64,
    next_generation: u64,
    next_stamp: u64,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Order of an emission; taken under the lock together with the
    /// listener set it is delivered to
    fn stamp(&mut self) -> u64 {
        self.next_stamp += 1;
        self.next_stamp
    }

    fn is_current(&self, hash: &str, generation: u64) -> bool {
        self.in_flight
            .get(hash)
            .is_some_and(|flight| flight.generation == generation)
    }

    fn latest(&self, hash: &str) -> Option<&TransferSnapshot> {
        self.pending.get(hash).or_else(|| self.settled.get(hash))
    }
}

struct Inner {
    state: Mutex<State>,
    backend: RwLock<Option<Arc<dyn BitTransport>>>,
    settings: EngineSettings,
}

/// Coordinates bit downloads across every consumer in the process
///
/// Cloning is cheap and every clone shares the same state.
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    /// Create a coordinator without a transport; see [`Coordinator::set_backend`]
    pub fn new(settings: EngineSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                backend: RwLock::new(None),
                settings,
            }),
        }
    }

    pub fn with_backend(settings: EngineSettings, backend: Arc<dyn BitTransport>) -> Self {
        let coordinator = Self::new(settings);
        coordinator.set_backend(backend);
        coordinator
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.inner.settings
    }

    /// Swap the transport. Transfers already running keep their transport.
    pub fn set_backend(&self, backend: Arc<dyn BitTransport>) {
        *self.inner.backend.write() = Some(backend);
        debug!("Transport backend replaced");
    }

    pub fn has_backend(&self) -> bool {
        self.inner.backend.read().is_some()
    }

    // ========================================================================
    // Downloads
    // ========================================================================

    /// Download a bit, or join the transfer already running for its hash
    ///
    /// `on_progress` receives the throttled snapshots of this transfer and is
    /// released once it settles. Real transfers are spawned on the current
    /// tokio runtime and progress even if the returned future is never
    /// polled.
    pub fn download(&self, bit: Bit, on_progress: Option<ProgressListener>) -> BitDownload {
        if bit.is_virtual() {
            return self.download_virtual(bit, on_progress);
        }

        let Ok(runtime) = Handle::try_current() else {
            return ready(Err(BitsyncError::NoRuntime));
        };

        let hash = bit.hash.clone();
        let backend = self.inner.backend.read().clone();
        let mut state = self.inner.state.lock();

        if let Some(future) = state.in_flight.get(&hash).map(|flight| flight.future.clone()) {
            let replay = on_progress.map(|listener| {
                let id = state.next_id();
                let listener = Registered::new(listener);
                state.listeners.add(&hash, id, listener.clone());
                if let Some(flight) = state.in_flight.get_mut(&hash) {
                    flight.scoped.push(id);
                }
                let stamp = state.stamp();
                (listener, stamp, state.pending.get(&hash).cloned())
            });
            drop(state);

            debug!(hash = %hash, "Joining in-flight transfer");
            if let Some((listener, stamp, Some(snapshot))) = replay {
                notify_progress(&[listener], stamp, &snapshot);
            }
            return future;
        }

        let Some(backend) = backend else {
            return ready(Err(BitsyncError::NoBackend));
        };

        state.next_generation += 1;
        let generation = state.next_generation;

        // A new attempt starts from a clean slate
        state.settled.remove(&hash);
        state.queued.insert(hash.clone());

        let mut scoped = Vec::new();
        if let Some(listener) = on_progress {
            let id = state.next_id();
            state.listeners.add(&hash, id, Registered::new(listener));
            scoped.push(id);
        }

        let sink = ProgressSink {
            inner: Arc::downgrade(&self.inner),
            hash: hash.clone(),
            generation,
        };
        let coordinator = self.clone();
        let task = runtime.spawn(async move {
            let result = AssertUnwindSafe(backend.fetch(bit.clone(), sink))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(anyhow::anyhow!("transport panicked")));
            coordinator.settle(&bit, generation, result)
        });

        let task_hash = hash.clone();
        let future = async move {
            task.await.unwrap_or_else(|e| {
                warn!(hash = %task_hash, error = %e, "Transfer task did not finish");
                Err(BitsyncError::Aborted { hash: task_hash })
            })
        }
        .boxed()
        .shared();

        state.in_flight.insert(
            hash.clone(),
            InFlight {
                generation,
                future: future.clone(),
                runtime,
                scoped,
            },
        );
        drop(state);

        info!(hash = %hash, generation, "Starting transfer");
        future
    }

    /// Nothing to transfer: publish a completed snapshot and resolve now
    ///
    /// While a real transfer of the same hash is running only the caller's
    /// own callback hears about the virtual completion; the subscribers of
    /// the hash keep following the real transfer.
    fn download_virtual(&self, bit: Bit, on_progress: Option<ProgressListener>) -> BitDownload {
        debug!(hash = %bit.hash, "Bit is virtual, resolving without a transfer");
        let snapshot = TransferSnapshot::completed(bit.clone());

        let (mut listeners, stamp) = {
            let mut state = self.inner.state.lock();
            let listeners = if state.in_flight.contains_key(&bit.hash) {
                Vec::new()
            } else {
                state.settled.insert(bit.hash.clone(), snapshot.clone());
                state.listeners.get(&bit.hash)
            };
            (listeners, state.stamp())
        };
        listeners.extend(on_progress.map(Registered::new));
        notify_progress(&listeners, stamp, &snapshot);

        ready(Ok(vec![bit]))
    }

    /// Download every bit of a pack concurrently
    ///
    /// Duplicate hashes are fetched once, virtual bits resolve immediately and
    /// bits lacking a size or file name are skipped. Fails if any member
    /// fails.
    pub async fn download_pack(
        &self,
        pack: &BitPack,
        on_progress: Option<ProgressListener>,
    ) -> Result<Vec<Bit>, BitsyncError> {
        let plan = pack.plan();
        for bit in &plan.skipped {
            warn!(hash = %bit.hash, "Skipping bit without size or file name");
        }

        info!(
            downloadable = plan.downloadable.len(),
            virtual_bits = plan.virtual_bits.len(),
            "Downloading pack"
        );

        let downloads: Vec<_> = plan
            .downloadable
            .into_iter()
            .chain(plan.virtual_bits)
            .map(|bit| self.download(bit, on_progress.clone()))
            .collect();

        let mut resolved = Vec::new();
        for result in future::join_all(downloads).await {
            resolved.extend(result?);
        }
        Ok(resolved)
    }

    /// Finish a transfer: flush the throttle, purge bookkeeping, notify
    fn settle(
        &self,
        bit: &Bit,
        generation: u64,
        result: anyhow::Result<Vec<Bit>>,
    ) -> Result<Vec<Bit>, BitsyncError> {
        let hash = bit.hash.as_str();
        let result = result.map_err(|e| BitsyncError::transport(hash, e));

        let mut state = self.inner.state.lock();
        if !state.is_current(hash, generation) {
            debug!(hash, generation, "Transfer settled after its bookkeeping was torn down");
            return result;
        }
        let Some(flight) = state.in_flight.remove(hash) else {
            return result;
        };

        let mut terminal = state.throttle.remove(hash).and_then(ThrottleState::flush);
        let pending = state.pending.remove(hash);

        // A transport that never reported still owes listeners a terminal state
        if let (Ok(resolved), None) = (&result, &pending) {
            let size = bit.size.unwrap_or(1);
            terminal = Some(TransferSnapshot::new(
                bit.clone(),
                resolved.clone(),
                1.0,
                BitTotals::new(size, size),
            ));
        }

        let listeners = if terminal.is_some() {
            state.listeners.get(hash)
        } else {
            Vec::new()
        };
        for id in flight.scoped {
            state.listeners.remove(hash, id);
        }

        state.queued.remove(hash);
        state.last_measure.remove(hash);
        if let Some(snapshot) = terminal.clone().or(pending) {
            state.settled.insert(hash.to_string(), snapshot);
        }

        let completion: Vec<_> = if result.is_ok() {
            state.completion.values().cloned().collect()
        } else {
            Vec::new()
        };
        let stamp = state.stamp();
        drop(state);

        if let Some(snapshot) = terminal {
            notify_progress(&listeners, stamp, &snapshot);
        }

        match &result {
            Ok(resolved) => {
                info!(hash, bits = resolved.len(), "Transfer complete");
                notify_complete(&completion, bit, resolved);
            }
            Err(e) => warn!(hash, error = %e, "Transfer failed"),
        }

        result
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    /// Subscribe to the progress of a hash
    ///
    /// If a snapshot is already known the listener is called with it right
    /// away.
    pub fn on_progress<F>(&self, hash: &str, listener: F) -> Subscription
    where
        F: Fn(&TransferSnapshot) + Send + Sync + 'static,
    {
        self.subscribe(hash, Arc::new(listener))
    }

    /// Same as [`Coordinator::on_progress`] for an already shared listener
    pub fn subscribe(&self, hash: &str, listener: ProgressListener) -> Subscription {
        let listener = Registered::new(listener);
        let (id, stamp, current) = {
            let mut state = self.inner.state.lock();
            let id = state.next_id();
            state.listeners.add(hash, id, listener.clone());
            (id, state.stamp(), state.latest(hash).cloned())
        };

        // Anything emitted after this point carries a newer stamp, so the
        // replay can never overwrite it
        if let Some(snapshot) = current {
            notify_progress(&[listener], stamp, &snapshot);
        }

        let inner = Arc::downgrade(&self.inner);
        let hash = hash.to_string();
        Subscription::new(move || {
            if let Some(inner) = inner.upgrade() {
                inner.state.lock().listeners.remove(&hash, id);
            }
        })
    }

    /// Subscribe to every completed real transfer
    pub fn on_complete<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Bit, &[Bit]) + Send + Sync + 'static,
    {
        let id = {
            let mut state = self.inner.state.lock();
            let id = state.next_id();
            state.completion.insert(id, Arc::new(listener));
            id
        };

        let inner = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = inner.upgrade() {
                inner.state.lock().completion.remove(&id);
            }
        })
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Requested but no snapshot received yet
    pub fn is_queued(&self, hash: &str) -> bool {
        self.inner.state.lock().queued.contains(hash)
    }

    /// Latest known percentage: `0` while queued, `None` if untracked
    pub fn latest_pct(&self, hash: &str) -> Option<f64> {
        let state = self.inner.state.lock();
        if state.queued.contains(hash) {
            return Some(0.0);
        }
        state.latest(hash).map(TransferSnapshot::percent)
    }

    /// Copy of the latest known snapshot
    pub fn latest(&self, hash: &str) -> Option<TransferSnapshot> {
        self.inner.state.lock().latest(hash).cloned()
    }

    /// Hashes with a transfer in flight, sorted
    pub fn active(&self) -> Vec<String> {
        let mut hashes: Vec<_> = self.inner.state.lock().in_flight.keys().cloned().collect();
        hashes.sort();
        hashes
    }

    /// Aggregate speed and progress over tracked bits, optionally filtered
    ///
    /// Moves the measurement baseline of every included bit to now.
    pub fn speed(&self, filter: Option<&HashSet<String>>) -> SpeedReport {
        let now = Instant::now();
        let mut guard = self.inner.state.lock();
        let state: &mut State = &mut guard;
        let pending = &state.pending;
        let settled = &state.settled;

        let entries: Vec<(&str, BitTotals)> = pending
            .iter()
            .chain(settled.iter().filter(|(hash, _)| !pending.contains_key(*hash)))
            .filter(|(hash, _)| filter.map_or(true, |filter| filter.contains(*hash)))
            .map(|(hash, snapshot)| (hash.as_str(), snapshot.total()))
            .collect();

        speed::measure(entries, &mut state.last_measure, now)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Forget the settled snapshot and speed baseline of a hash
    ///
    /// Returns false if there was nothing to clear.
    pub fn clear(&self, hash: &str) -> bool {
        let mut state = self.inner.state.lock();
        let settled = state.settled.remove(hash).is_some();
        let measured = state.last_measure.remove(hash).is_some();
        settled || measured
    }

    /// Cancel every timer and drop all bookkeeping
    ///
    /// Running transports are not stopped; their results still reach callers
    /// already holding a [`BitDownload`].
    pub fn teardown(&self) {
        let mut state = self.inner.state.lock();
        let in_flight = state.in_flight.len();

        for (_, throttle) in state.throttle.drain() {
            let _ = throttle.flush();
        }
        state.pending.clear();
        state.settled.clear();
        state.listeners.clear();
        state.queued.clear();
        state.in_flight.clear();
        state.last_measure.clear();
        state.completion.clear();

        info!(in_flight, "Coordinator torn down");
    }

    // ========================================================================
    // Throttled progress pipeline
    // ========================================================================

    fn ingest(&self, hash: &str, generation: u64, snapshot: TransferSnapshot) {
        let interval = self.inner.settings.throttle_interval();
        let now = Instant::now();

        let mut state = self.inner.state.lock();
        if !state.is_current(hash, generation) {
            debug!(hash, generation, "Dropping progress from a stale transfer");
            return;
        }

        state.queued.remove(hash);
        state.pending.insert(hash.to_string(), snapshot.clone());

        let offer = state
            .throttle
            .entry(hash.to_string())
            .or_default()
            .offer(snapshot, now, interval);

        match offer {
            Offer::Emit(snapshot) => {
                let listeners = state.listeners.get(hash);
                let stamp = state.stamp();
                drop(state);
                notify_progress(&listeners, stamp, &snapshot);
            }
            Offer::Arm(wait) => {
                let Some(runtime) = state.in_flight.get(hash).map(|f| f.runtime.clone()) else {
                    return;
                };
                let coordinator = self.clone();
                let key = hash.to_string();
                let timer = runtime.spawn(async move {
                    tokio::time::sleep(wait).await;
                    coordinator.fire(&key, generation);
                });
                if let Some(throttle) = state.throttle.get_mut(hash) {
                    throttle.arm(timer);
                }
            }
            Offer::Coalesced => {}
        }
    }

    fn fire(&self, hash: &str, generation: u64) {
        let mut state = self.inner.state.lock();
        if !state.is_current(hash, generation) {
            return;
        }
        let Some(snapshot) = state
            .throttle
            .get_mut(hash)
            .and_then(|throttle| throttle.fire(Instant::now()))
        else {
            return;
        };
        let listeners = state.listeners.get(hash);
        let stamp = state.stamp();
        drop(state);

        notify_progress(&listeners, stamp, &snapshot);
    }

    #[cfg(test)]
    fn has_timer(&self, hash: &str) -> bool {
        self.inner
            .state
            .lock()
            .throttle
            .get(hash)
            .is_some_and(ThrottleState::has_timer)
    }
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new(EngineSettings::default())
    }
}

impl Clone for Coordinator {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

fn ready(result: Result<Vec<Bit>, BitsyncError>) -> BitDownload {
    future::ready(result).boxed().shared()
}

/// Raw progress channel handed to a transport for one transfer
///
/// Reports after the transfer settled, or after teardown, are ignored.
#[derive(Clone)]
pub struct ProgressSink {
    inner: Weak<Inner>,
    hash: String,
    generation: u64,
}

impl ProgressSink {
    /// A sink that is not connected to any coordinator
    pub fn detached(hash: impl Into<String>) -> Self {
        Self {
            inner: Weak::new(),
            hash: hash.into(),
            generation: 0,
        }
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn report(&self, snapshot: TransferSnapshot) {
        if let Some(inner) = self.inner.upgrade() {
            let coordinator = Coordinator { inner };
            coordinator.ingest(&self.hash, self.generation, snapshot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Reports `steps` percent values 10ms apart, then resolves to the bit
    struct Scripted {
        steps: Vec<u64>,
        fail: bool,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(steps: Vec<u64>) -> Arc<Self> {
            Arc::new(Self {
                steps,
                fail: false,
                calls: AtomicUsize::new(0),
            })
        }

        fn failing(steps: Vec<u64>) -> Arc<Self> {
            Arc::new(Self {
                steps,
                fail: true,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl BitTransport for Scripted {
        async fn fetch(&self, bit: Bit, progress: ProgressSink) -> anyhow::Result<Vec<Bit>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            for (i, pct) in self.steps.iter().enumerate() {
                if i > 0 {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                progress.report(TransferSnapshot::from_totals(
                    bit.clone(),
                    vec![bit.clone()],
                    BitTotals::new(*pct, 100),
                ));
            }
            if self.fail {
                anyhow::bail!("connection reset");
            }
            Ok(vec![bit])
        }
    }

    fn model(hash: &str) -> Bit {
        Bit::new(hash)
            .with_link(format!("https://example.com/{hash}"))
            .with_size(100)
            .with_file_name("model.bin")
    }

    fn recorder() -> (ProgressListener, Arc<Mutex<Vec<f64>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let listener: ProgressListener = Arc::new(move |s: &TransferSnapshot| sink.lock().push(s.percent()));
        (listener, seen)
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_until_first_snapshot() {
        let coordinator = Coordinator::with_backend(EngineSettings::default(), Scripted::new(vec![30, 100]));
        let download = coordinator.download(model("m"), None);

        assert!(coordinator.is_queued("m"));
        assert_eq!(coordinator.latest_pct("m"), Some(0.0));

        download.await.unwrap();
        assert!(!coordinator.is_queued("m"));
        assert_eq!(coordinator.latest_pct("m"), Some(100.0));
        assert!(!coordinator.has_timer("m"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_download_callback_released_on_settle() {
        let coordinator = Coordinator::with_backend(EngineSettings::default(), Scripted::new(vec![50, 100]));
        let (listener, seen) = recorder();

        coordinator.download(model("m"), Some(listener)).await.unwrap();
        assert_eq!(*seen.lock(), vec![50.0, 100.0]);

        // Second transfer of the same hash does not reach the old callback
        coordinator.download(model("m"), None).await.unwrap();
        assert_eq!(seen.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_purges_state_and_allows_retry() {
        let coordinator = Coordinator::with_backend(EngineSettings::default(), Scripted::failing(vec![37]));
        let error = coordinator.download(model("m"), None).await.unwrap_err();
        assert!(matches!(error, BitsyncError::Transport { ref hash, .. } if hash == "m"));

        assert!(!coordinator.is_queued("m"));
        assert!(coordinator.active().is_empty());
        assert_eq!(coordinator.latest_pct("m"), Some(37.0));

        let retry = Scripted::new(vec![100]);
        coordinator.set_backend(retry.clone());
        coordinator.download(model("m"), None).await.unwrap();
        assert_eq!(retry.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_transport_still_yields_terminal_snapshot() {
        let coordinator = Coordinator::with_backend(EngineSettings::default(), Scripted::new(vec![]));
        let (listener, seen) = recorder();
        let _subscription = coordinator.subscribe("m", listener);

        coordinator.download(model("m"), None).await.unwrap();
        assert_eq!(*seen.lock(), vec![100.0]);
        assert_eq!(coordinator.latest_pct("m"), Some(100.0));
    }

    #[tokio::test]
    async fn test_missing_backend_fails_without_state() {
        let coordinator = Coordinator::default();
        let error = coordinator.download(model("m"), None).await.unwrap_err();
        assert!(matches!(error, BitsyncError::NoBackend));
        assert!(!coordinator.is_queued("m"));
        assert_eq!(coordinator.latest_pct("m"), None);
    }

    #[test]
    fn test_real_download_outside_runtime_fails() {
        let coordinator = Coordinator::with_backend(EngineSettings::default(), Scripted::new(vec![]));
        let result = coordinator.download(model("m"), None).now_or_never();
        assert!(matches!(result, Some(Err(BitsyncError::NoRuntime))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_forgets_settled_snapshot() {
        let coordinator = Coordinator::with_backend(EngineSettings::default(), Scripted::new(vec![100]));
        coordinator.download(model("m"), None).await.unwrap();

        assert!(coordinator.clear("m"));
        assert_eq!(coordinator.latest_pct("m"), None);
        assert!(!coordinator.clear("m"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_clears_everything() {
        let coordinator = Coordinator::with_backend(EngineSettings::default(), Scripted::new(vec![10, 20, 30, 100]));
        let (listener, seen) = recorder();
        let _subscription = coordinator.subscribe("m", listener);
        let download = coordinator.download(model("m"), None);

        tokio::time::sleep(Duration::from_millis(15)).await;
        coordinator.teardown();
        assert!(coordinator.active().is_empty());
        assert_eq!(coordinator.latest_pct("m"), None);
        assert!(!coordinator.has_timer("m"));

        // The transport still finishes for whoever holds the future
        download.await.unwrap();
        assert_eq!(*seen.lock(), vec![10.0]);
        assert_eq!(coordinator.latest_pct("m"), None);
    }
}
