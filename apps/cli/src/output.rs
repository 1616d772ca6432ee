//! Output formatting utilities

use crate::OutputFormat;
use bitsync_types::{Bit, EngineSettings, PackPlan};
use console::style;
use serde::Serialize;
use tabled::{Table, Tabled};

/// Format bytes as human-readable
pub fn format_bytes(bytes: u64) -> String {
    human_bytes::human_bytes(bytes as f64)
}

/// Format speed as human-readable
pub fn format_speed(bytes_per_sec: u64) -> String {
    format!("{}/s", human_bytes::human_bytes(bytes_per_sec as f64))
}

#[derive(Tabled)]
struct BitRow {
    hash: String,
    kind: &'static str,
    file: String,
    size: String,
}

impl BitRow {
    fn new(bit: &Bit, kind: &'static str) -> Self {
        Self {
            hash: bit.hash.clone(),
            kind,
            file: bit.file_name.clone().unwrap_or_else(|| "-".to_string()),
            size: bit
                .size
                .map(format_bytes)
                .unwrap_or_else(|| "?".to_string()),
        }
    }
}

#[derive(Tabled)]
struct SettingRow {
    key: &'static str,
    value: String,
}

fn describe(bit: &Bit) -> String {
    let name = bit.file_name.as_deref().unwrap_or("-");
    match bit.size {
        Some(size) => format!("{} {} ({})", bit.hash, name, format_bytes(size)),
        None => format!("{} {}", bit.hash, name),
    }
}

#[derive(Serialize)]
struct PlanOutput<'a> {
    size: u64,
    downloadable: &'a [Bit],
    virtual_bits: &'a [Bit],
    skipped: &'a [Bit],
}

pub fn print_plan(plan: &PackPlan, size: u64, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => {
            let output = PlanOutput {
                size,
                downloadable: &plan.downloadable,
                virtual_bits: &plan.virtual_bits,
                skipped: &plan.skipped,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            let rows: Vec<BitRow> = plan
                .downloadable
                .iter()
                .map(|bit| BitRow::new(bit, "download"))
                .chain(plan.virtual_bits.iter().map(|bit| BitRow::new(bit, "virtual")))
                .chain(plan.skipped.iter().map(|bit| BitRow::new(bit, "skipped")))
                .collect();
            println!("{}", Table::new(rows));
            println!("Pack size: {}", format_bytes(size));
        }
        OutputFormat::Human => {
            println!("Pack size: {}", style(format_bytes(size)).cyan());
            let sections = [
                ("Download", &plan.downloadable),
                ("Virtual", &plan.virtual_bits),
                ("Skipped", &plan.skipped),
            ];
            for (title, bits) in sections {
                println!("{} ({})", style(title).bold(), bits.len());
                for bit in bits.iter() {
                    println!("  {}", describe(bit));
                }
            }
        }
    }
    Ok(())
}

pub fn print_resolved(resolved: &[Bit], format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(resolved)?);
        }
        OutputFormat::Table => {
            let rows: Vec<BitRow> = resolved
                .iter()
                .map(|bit| {
                    let kind = if bit.is_virtual() { "virtual" } else { "stored" };
                    BitRow::new(bit, kind)
                })
                .collect();
            println!("{}", Table::new(rows));
        }
        OutputFormat::Human => {
            println!(
                "{} {} bits ready",
                style("✓").green().bold(),
                resolved.len()
            );
            for bit in resolved {
                println!("  {}", describe(bit));
            }
        }
    }
    Ok(())
}

pub fn print_settings(settings: &EngineSettings, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(settings)?);
        }
        OutputFormat::Table => {
            println!("{}", Table::new(setting_rows(settings)));
        }
        OutputFormat::Human => {
            println!("throttle_interval_ms = {}", settings.throttle_interval_ms);
            println!("max_retries          = {}", settings.max_retries);
            println!("download_dir         = {}", settings.download_dir.display());
        }
    }
    Ok(())
}

fn setting_rows(settings: &EngineSettings) -> Vec<SettingRow> {
    vec![
        SettingRow {
            key: "throttle_interval_ms",
            value: settings.throttle_interval_ms.to_string(),
        },
        SettingRow {
            key: "max_retries",
            value: settings.max_retries.to_string(),
        },
        SettingRow {
            key: "download_dir",
            value: settings.download_dir.display().to_string(),
        },
    ]
}
