//! Shared types for bitsync
//!
//! This crate contains the value types passed between the download
//! coordinator, the transports that feed it, and the CLI.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

// ============================================================================
// Bit Types
// ============================================================================

/// Descriptor of a content-addressed artifact ("bit")
///
/// The `hash` is the content address and the unique key the coordinator
/// tracks state under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Bit {
    pub hash: String,
    #[serde(default)]
    pub download_link: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub file_name: Option<String>,
}

impl Bit {
    pub fn new(hash: impl Into<String>) -> Self {
        Self {
            hash: hash.into(),
            download_link: None,
            size: None,
            file_name: None,
        }
    }

    pub fn with_link(mut self, link: impl Into<String>) -> Self {
        self.download_link = Some(link.into());
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = Some(file_name.into());
        self
    }

    /// A virtual bit is hosted remotely or empty: there is nothing to transfer
    pub fn is_virtual(&self) -> bool {
        self.download_link.is_none() || self.size == Some(0)
    }
}

/// Aggregate byte counters of a transfer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitTotals {
    pub downloaded: u64,
    pub max: u64,
}

impl BitTotals {
    pub fn new(downloaded: u64, max: u64) -> Self {
        Self { downloaded, max }
    }

    /// Fraction in [0, 1]; zero when the size is unknown
    pub fn fraction(&self) -> f64 {
        if self.max == 0 {
            return 0.0;
        }
        (self.downloaded as f64 / self.max as f64).clamp(0.0, 1.0)
    }
}

/// Immutable point-in-time view of one transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferSnapshot {
    parent: Bit,
    bits: Vec<Bit>,
    progress: f64,
    total: BitTotals,
}

impl TransferSnapshot {
    /// Build a snapshot. `progress` is clamped into [0, 1].
    pub fn new(parent: Bit, bits: Vec<Bit>, progress: f64, total: BitTotals) -> Self {
        let progress = if progress.is_nan() {
            0.0
        } else {
            progress.clamp(0.0, 1.0)
        };

        Self {
            parent,
            bits,
            progress,
            total,
        }
    }

    /// Snapshot whose progress is derived from the byte counters
    pub fn from_totals(parent: Bit, bits: Vec<Bit>, total: BitTotals) -> Self {
        let progress = total.fraction();
        Self::new(parent, bits, progress, total)
    }

    /// Terminal snapshot used for bits that need no transfer
    pub fn completed(bit: Bit) -> Self {
        Self {
            bits: vec![bit.clone()],
            parent: bit,
            progress: 1.0,
            total: BitTotals::new(1, 1),
        }
    }

    pub fn progress(&self) -> f64 {
        self.progress
    }

    /// Progress as a percentage in [0, 100]
    pub fn percent(&self) -> f64 {
        self.progress * 100.0
    }

    pub fn total(&self) -> BitTotals {
        self.total
    }

    pub fn bits(&self) -> &[Bit] {
        &self.bits
    }

    pub fn parent(&self) -> &Bit {
        &self.parent
    }

    pub fn is_complete(&self) -> bool {
        self.progress >= 1.0
    }
}

/// Aggregate throughput across a set of tracked bits
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SpeedReport {
    pub bytes_per_second: f64,
    pub downloaded: u64,
    pub max: u64,
    pub progress_pct: f64,
}

// ============================================================================
// Pack Types
// ============================================================================

/// A group of bits that make up one installable unit (e.g. a model and its
/// dependencies)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitPack {
    pub bits: Vec<Bit>,
}

/// How the bits of a pack are going to be handled
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackPlan {
    /// Unique bits that need a real transfer
    pub downloadable: Vec<Bit>,
    /// Unique bits with nothing to transfer
    pub virtual_bits: Vec<Bit>,
    /// Bits that have a link but lack a size or file name
    pub skipped: Vec<Bit>,
}

impl BitPack {
    pub fn new(bits: Vec<Bit>) -> Self {
        Self { bits }
    }

    /// Total size in bytes, counting each hash once
    pub fn size(&self) -> u64 {
        let mut seen = HashSet::new();
        self.bits
            .iter()
            .filter(|bit| seen.insert(bit.hash.as_str()))
            .filter_map(|bit| bit.size)
            .sum()
    }

    /// Partition the pack, dropping duplicate hashes (first one wins)
    pub fn plan(&self) -> PackPlan {
        let mut plan = PackPlan::default();
        let mut seen = HashSet::new();

        for bit in &self.bits {
            if !seen.insert(bit.hash.as_str()) {
                continue;
            }

            if bit.is_virtual() {
                plan.virtual_bits.push(bit.clone());
            } else if bit.size.is_none() || bit.file_name.is_none() {
                plan.skipped.push(bit.clone());
            } else {
                plan.downloadable.push(bit.clone());
            }
        }

        plan
    }
}

// ============================================================================
// Settings
// ============================================================================

/// Engine and reference transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Minimum interval between two progress emissions for the same bit
    #[serde(default = "default_throttle_interval_ms")]
    pub throttle_interval_ms: u64,
    /// Retry attempts for retryable transport failures
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Where transports store fetched bits
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
}

impl EngineSettings {
    pub fn throttle_interval(&self) -> Duration {
        Duration::from_millis(self.throttle_interval_ms)
    }
}

fn default_throttle_interval_ms() -> u64 {
    200
}

fn default_max_retries() -> u32 {
    3
}

fn default_download_dir() -> PathBuf {
    dirs::data_dir()
        .map(|p| p.join("bitsync").join("bits"))
        .unwrap_or_else(|| PathBuf::from(".bitsync"))
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            throttle_interval_ms: default_throttle_interval_ms(),
            max_retries: default_max_retries(),
            download_dir: default_download_dir(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn real(hash: &str, size: u64) -> Bit {
        Bit::new(hash)
            .with_link(format!("https://example.com/{hash}"))
            .with_size(size)
            .with_file_name(format!("{hash}.bin"))
    }

    #[test]
    fn test_virtual_bits() {
        assert!(Bit::new("proxied").with_size(123).is_virtual());
        assert!(Bit::new("empty").with_link("https://example.com/e").with_size(0).is_virtual());
        assert!(!real("model", 10).is_virtual());
        // Unknown size with a link still counts as a real transfer
        assert!(!Bit::new("unknown").with_link("https://example.com/u").is_virtual());
    }

    #[test]
    fn test_snapshot_clamps_progress() {
        let bit = real("a", 10);
        assert_eq!(TransferSnapshot::new(bit.clone(), vec![], 1.7, BitTotals::default()).progress(), 1.0);
        assert_eq!(TransferSnapshot::new(bit.clone(), vec![], -0.2, BitTotals::default()).progress(), 0.0);
        assert_eq!(TransferSnapshot::new(bit, vec![], f64::NAN, BitTotals::default()).progress(), 0.0);
    }

    #[test]
    fn test_completed_snapshot() {
        let snapshot = TransferSnapshot::completed(Bit::new("v"));
        assert!(snapshot.is_complete());
        assert_eq!(snapshot.total(), BitTotals::new(1, 1));
        assert_eq!(snapshot.bits(), &[Bit::new("v")]);
        assert_eq!(snapshot.percent(), 100.0);
    }

    #[test]
    fn test_pack_size_counts_each_hash_once() {
        let pack = BitPack::new(vec![real("a", 10), real("a", 10), real("b", 5), Bit::new("c")]);
        assert_eq!(pack.size(), 15);
    }

    #[test]
    fn test_pack_plan() {
        let no_name = Bit::new("n").with_link("https://example.com/n").with_size(4);
        let pack = BitPack::new(vec![
            real("a", 10),
            real("a", 10),
            Bit::new("proxied").with_size(3),
            no_name.clone(),
        ]);

        let plan = pack.plan();
        assert_eq!(plan.downloadable, vec![real("a", 10)]);
        assert_eq!(plan.virtual_bits, vec![Bit::new("proxied").with_size(3)]);
        assert_eq!(plan.skipped, vec![no_name]);
    }

    #[test]
    fn test_settings_defaults_fill_missing_fields() {
        let settings: EngineSettings = serde_json::from_str(r#"{"max_retries": 7}"#).unwrap();
        assert_eq!(settings.max_retries, 7);
        assert_eq!(settings.throttle_interval(), Duration::from_millis(200));
    }
}
