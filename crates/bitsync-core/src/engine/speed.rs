//! Aggregate throughput over tracked bits

use bitsync_types::{BitTotals, SpeedReport};
use std::collections::HashMap;
use tokio::time::Instant;

/// Baseline taken the last time a bit was measured
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Measure {
    pub at: Instant,
    pub downloaded: u64,
}

/// Sum the totals of `entries` and their throughput since the previous
/// measurement, then move every baseline to `now`.
///
/// A bit contributes to the rate only when it has a baseline, time has
/// passed, and its counter did not go backwards.
pub(crate) fn measure<'a>(
    entries: impl IntoIterator<Item = (&'a str, BitTotals)>,
    baselines: &mut HashMap<String, Measure>,
    now: Instant,
) -> SpeedReport {
    let mut report = SpeedReport::default();

    for (hash, totals) in entries {
        report.downloaded += totals.downloaded;
        report.max += totals.max;

        if let Some(last) = baselines.get(hash) {
            if now > last.at && totals.downloaded >= last.downloaded {
                let elapsed = now.duration_since(last.at).as_secs_f64();
                report.bytes_per_second += (totals.downloaded - last.downloaded) as f64 / elapsed;
            }
        }

        baselines.insert(
            hash.to_string(),
            Measure {
                at: now,
                downloaded: totals.downloaded,
            },
        );
    }

    report.progress_pct = if report.max > 0 {
        report.downloaded as f64 / report.max as f64 * 100.0
    } else {
        0.0
    };

    report
}
