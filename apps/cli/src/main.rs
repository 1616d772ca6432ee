//! bitsync CLI - fetch content-addressed bits
//!
//! Downloads every bit of a catalog through the shared coordinator, with one
//! progress bar per bit and an aggregate speed line.

mod commands;
mod output;
mod progress;
mod transport;

use anyhow::Result;
use bitsync_types::EngineSettings;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use transport::HttpTransport;

/// bitsync - Content-addressed bit fetcher
#[derive(Parser)]
#[command(name = "bitsync")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Directory bits are stored in
    #[arg(long, env = "BITSYNC_DIR")]
    dir: Option<PathBuf>,

    /// Minimum interval between progress updates for one bit, in milliseconds
    #[arg(long, env = "BITSYNC_THROTTLE_MS")]
    throttle_ms: Option<u64>,

    /// Retry attempts for failed transfers
    #[arg(long, env = "BITSYNC_RETRIES")]
    retries: Option<u32>,

    /// Output format
    #[arg(long, default_value = "human")]
    output: OutputFormat,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum OutputFormat {
    Human,
    Json,
    Table,
}

#[derive(Subcommand)]
enum Commands {
    /// Download every bit listed in a catalog
    Fetch {
        /// Path to a JSON catalog of bits
        catalog: PathBuf,
    },

    /// Show how a catalog would be downloaded
    Plan {
        /// Path to a JSON catalog of bits
        catalog: PathBuf,
    },

    /// Show the effective settings
    Config,

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

impl Cli {
    fn settings(&self) -> EngineSettings {
        let mut settings = EngineSettings::default();
        if let Some(dir) = &self.dir {
            settings.download_dir = dir.clone();
        }
        if let Some(ms) = self.throttle_ms {
            settings.throttle_interval_ms = ms;
        }
        if let Some(retries) = self.retries {
            settings.max_retries = retries;
        }
        settings
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "bitsync=debug,info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let settings = cli.settings();

    match cli.command {
        Commands::Fetch { catalog } => {
            let coordinator = bitsync_core::init_global(settings.clone())?;
            let transport = HttpTransport::new(settings.download_dir, settings.max_retries)?;
            coordinator.set_backend(Arc::new(transport));

            let result = commands::fetch(coordinator, &catalog, cli.output).await;
            bitsync_core::shutdown();
            result?
        }

        Commands::Plan { catalog } => commands::plan(&catalog, cli.output).await?,

        Commands::Config => commands::show_config(&settings, cli.output)?,

        Commands::Completions { shell } => {
            use clap::CommandFactory;
            clap_complete::generate(shell, &mut Cli::command(), "bitsync", &mut std::io::stdout());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_defaults() {
        let cli = Cli::parse_from([
            "bitsync",
            "--dir",
            "/tmp/bits",
            "--throttle-ms",
            "50",
            "config",
        ]);
        let settings = cli.settings();
        assert_eq!(settings.download_dir, PathBuf::from("/tmp/bits"));
        assert_eq!(settings.throttle_interval_ms, 50);
        assert_eq!(settings.max_retries, EngineSettings::default().max_retries);
    }
}
