//! Per-bit progress throttling
//!
//! Raw snapshots arrive as fast as the transport produces them. At most one
//! snapshot per interval reaches the listeners:
//! - the first snapshot of a transfer is emitted immediately
//! - snapshots inside the interval overwrite a single buffered slot and arm
//!   one timer for the remaining wait
//! - on settlement the timer is cancelled and the buffered slot is flushed

use bitsync_types::TransferSnapshot;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// What the caller has to do after offering a snapshot
#[derive(Debug)]
pub(crate) enum Offer {
    /// Deliver this snapshot now
    Emit(TransferSnapshot),
    /// Snapshot buffered, arm a timer that fires after the given wait
    Arm(Duration),
    /// Snapshot buffered, a timer is already armed
    Coalesced,
}

/// Throttle bookkeeping for one bit
#[derive(Default)]
pub(crate) struct ThrottleState {
    last_emit: Option<Instant>,
    buffered: Option<TransferSnapshot>,
    timer: Option<JoinHandle<()>>,
}

impl ThrottleState {
    pub fn offer(&mut self, snapshot: TransferSnapshot, now: Instant, interval: Duration) -> Offer {
        let elapsed = self.last_emit.map(|at| now.saturating_duration_since(at));

        match elapsed {
            Some(elapsed) if elapsed < interval => {
                self.buffered = Some(snapshot);
                if self.timer.is_some() {
                    Offer::Coalesced
                } else {
                    Offer::Arm(interval - elapsed)
                }
            }
            _ => {
                // Anything buffered is older than this snapshot
                self.buffered = None;
                self.cancel_timer();
                self.last_emit = Some(now);
                Offer::Emit(snapshot)
            }
        }
    }

    pub fn arm(&mut self, timer: JoinHandle<()>) {
        self.cancel_timer();
        self.timer = Some(timer);
    }

    /// Timer elapsed: hand out the most recent buffered snapshot
    pub fn fire(&mut self, now: Instant) -> Option<TransferSnapshot> {
        self.timer = None;
        let snapshot = self.buffered.take()?;
        self.last_emit = Some(now);
        Some(snapshot)
    }

    /// Cancel the timer and return whatever is still buffered
    pub fn flush(mut self) -> Option<TransferSnapshot> {
        self.cancel_timer();
        self.buffered.take()
    }

    #[cfg(test)]
    pub fn has_timer(&self) -> bool {
        self.timer.is_some()
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitsync_types::{Bit, BitTotals};

    const INTERVAL: Duration = Duration::from_millis(200);

    fn at(downloaded: u64) -> TransferSnapshot {
        TransferSnapshot::from_totals(Bit::new("h"), vec![], BitTotals::new(downloaded, 100))
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_snapshot_is_emitted_immediately() {
        let mut throttle = ThrottleState::default();
        let offer = throttle.offer(at(1), Instant::now(), INTERVAL);
        assert!(matches!(offer, Offer::Emit(s) if s == at(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_is_coalesced_into_latest() {
        let mut throttle = ThrottleState::default();
        let start = Instant::now();
        throttle.offer(at(1), start, INTERVAL);

        let offer = throttle.offer(at(2), start + Duration::from_millis(50), INTERVAL);
        match offer {
            Offer::Arm(wait) => assert_eq!(wait, Duration::from_millis(150)),
            other => panic!("expected a timer to be armed, got {other:?}"),
        }
        throttle.arm(tokio::spawn(async {}));

        let offer = throttle.offer(at(3), start + Duration::from_millis(80), INTERVAL);
        assert!(matches!(offer, Offer::Coalesced));

        assert_eq!(throttle.fire(start + INTERVAL), Some(at(3)));
        assert!(!throttle.has_timer());
        // Nothing left to deliver on a spurious second fire
        assert_eq!(throttle.fire(start + INTERVAL), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_after_interval_replaces_buffer() {
        let mut throttle = ThrottleState::default();
        let start = Instant::now();
        throttle.offer(at(1), start, INTERVAL);
        throttle.offer(at(2), start + Duration::from_millis(10), INTERVAL);
        throttle.arm(tokio::spawn(async {}));

        let offer = throttle.offer(at(3), start + INTERVAL, INTERVAL);
        assert!(matches!(offer, Offer::Emit(s) if s == at(3)));
        assert!(!throttle.has_timer());
        assert_eq!(throttle.flush(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_returns_buffered_terminal_state() {
        let mut throttle = ThrottleState::default();
        let start = Instant::now();
        throttle.offer(at(10), start, INTERVAL);
        throttle.offer(at(100), start + Duration::from_millis(5), INTERVAL);
        throttle.arm(tokio::spawn(std::future::pending::<()>()));

        assert_eq!(throttle.flush(), Some(at(100)));
    }
}
