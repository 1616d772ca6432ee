//! Progress bar utilities for CLI downloads

use crate::output::format_speed;
use bitsync_core::{Coordinator, Subscription};
use bitsync_types::{Bit, TransferSnapshot};
use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Manages one progress bar per bit plus an aggregate speed line
pub struct PackProgress {
    multi: MultiProgress,
    bars: Arc<Mutex<HashMap<String, ProgressBar>>>,
    summary: ProgressBar,
    subscriptions: Vec<Subscription>,
    ticker: Option<JoinHandle<()>>,
}

impl PackProgress {
    pub fn new() -> Self {
        let multi = MultiProgress::new();
        let summary = multi.add(ProgressBar::new_spinner());
        summary.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );

        Self {
            multi,
            bars: Arc::new(Mutex::new(HashMap::new())),
            summary,
            subscriptions: Vec::new(),
            ticker: None,
        }
    }

    /// Create a bar for a bit and follow its snapshots
    pub fn track(&mut self, coordinator: &Coordinator, bit: &Bit) {
        let pb = self.multi.add(ProgressBar::new(bit.size.unwrap_or(0)));
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{msg:20} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("█▓▒░  "),
        );
        pb.set_message(short_hash(&bit.hash));
        self.bars.lock().insert(bit.hash.clone(), pb);

        let bars = self.bars.clone();
        let subscription = coordinator.on_progress(&bit.hash, move |snapshot| {
            if let Some(pb) = bars.lock().get(&snapshot.parent().hash) {
                update_bar(pb, snapshot);
            }
        });
        self.subscriptions.push(subscription);
    }

    /// Refresh the aggregate line from the coordinator's speed report
    pub fn start_ticker(&mut self, coordinator: Coordinator, hashes: HashSet<String>) {
        let summary = self.summary.clone();
        self.ticker = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(500));
            loop {
                interval.tick().await;
                let report = coordinator.speed(Some(&hashes));
                let active = coordinator
                    .active()
                    .into_iter()
                    .filter(|hash| hashes.contains(hash))
                    .count();
                summary.set_message(format!(
                    "{:.1}% at {} ({} active)",
                    report.progress_pct,
                    format_speed(report.bytes_per_second as u64),
                    active
                ));
                summary.tick();
            }
        }));
    }

    /// Mark a bit's bar as done or failed
    pub fn finish(&self, hash: &str, error: Option<&str>) {
        let bars = self.bars.lock();
        let Some(pb) = bars.get(hash) else {
            return;
        };
        match error {
            None => pb.finish_with_message(format!(
                "{} {}",
                style("✓").green().bold(),
                short_hash(hash)
            )),
            Some(error) => pb.abandon_with_message(format!(
                "{} {}: {}",
                style("✗").red().bold(),
                short_hash(hash),
                error
            )),
        }
    }

    /// Stop the ticker, release subscriptions and clear the summary line
    pub fn clear(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
        for subscription in self.subscriptions.drain(..) {
            subscription.unsubscribe();
        }
        self.summary.finish_and_clear();
    }
}

impl Default for PackProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PackProgress {
    fn drop(&mut self) {
        self.clear();
    }
}

fn update_bar(pb: &ProgressBar, snapshot: &TransferSnapshot) {
    let total = snapshot.total();
    if total.max > 0 {
        pb.set_length(total.max);
    }
    pb.set_position(total.downloaded);
}

fn short_hash(hash: &str) -> String {
    hash.chars().take(12).collect()
}
