//! CLI command implementations

use crate::output::{print_plan, print_resolved, print_settings};
use crate::progress::PackProgress;
use crate::OutputFormat;
use anyhow::{Context, Result};
use bitsync_core::Coordinator;
use bitsync_types::{Bit, BitPack, EngineSettings};
use console::style;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

/// A catalog is either a bare list of bits or an object wrapping one
#[derive(Deserialize)]
#[serde(untagged)]
enum Catalog {
    Pack(BitPack),
    Bits(Vec<Bit>),
}

impl From<Catalog> for BitPack {
    fn from(catalog: Catalog) -> Self {
        match catalog {
            Catalog::Pack(pack) => pack,
            Catalog::Bits(bits) => BitPack::new(bits),
        }
    }
}

pub async fn load_catalog(path: &Path) -> Result<BitPack> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read catalog {}", path.display()))?;
    parse_catalog(&content).with_context(|| format!("invalid catalog {}", path.display()))
}

fn parse_catalog(content: &str) -> Result<BitPack> {
    let catalog: Catalog = serde_json::from_str(content)?;
    Ok(catalog.into())
}

// ============================================================================
// Fetch
// ============================================================================

pub async fn fetch(coordinator: &Coordinator, catalog: &Path, format: OutputFormat) -> Result<()> {
    let pack = load_catalog(catalog).await?;
    let plan = pack.plan();

    for bit in &plan.skipped {
        eprintln!(
            "{} Skipping {}: missing size or file name",
            style("!").yellow().bold(),
            bit.hash
        );
    }

    if !matches!(format, OutputFormat::Human) {
        let resolved = coordinator.download_pack(&pack, None).await?;
        return print_resolved(&resolved, format);
    }

    let mut progress = PackProgress::new();
    for bit in plan.downloadable.iter().chain(&plan.virtual_bits) {
        progress.track(coordinator, bit);
    }
    let hashes: HashSet<String> = plan.downloadable.iter().map(|b| b.hash.clone()).collect();
    progress.start_ticker(coordinator.clone(), hashes);

    let progress = Arc::new(Mutex::new(progress));
    let finished = progress.clone();
    let completion = coordinator.on_complete(move |bit, _| {
        finished.lock().finish(&bit.hash, None);
    });

    let result = coordinator.download_pack(&pack, None).await;
    completion.unsubscribe();

    {
        let mut progress = progress.lock();
        for bit in &plan.virtual_bits {
            progress.finish(&bit.hash, None);
        }
        if let Err(e) = &result {
            let reason = e.to_string();
            for bit in &plan.downloadable {
                let done = coordinator
                    .latest(&bit.hash)
                    .is_some_and(|snapshot| snapshot.is_complete());
                if !done {
                    progress.finish(&bit.hash, Some(&reason));
                }
            }
        }
        progress.clear();
    }

    print_resolved(&result?, format)
}

// ============================================================================
// Plan
// ============================================================================

pub async fn plan(catalog: &Path, format: OutputFormat) -> Result<()> {
    let pack = load_catalog(catalog).await?;
    print_plan(&pack.plan(), pack.size(), format)
}

// ============================================================================
// Config
// ============================================================================

pub fn show_config(settings: &EngineSettings, format: OutputFormat) -> Result<()> {
    print_settings(settings, format)
}
