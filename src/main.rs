//! # Channel Mart CLI (`mart`)
//!
//! ## Usage
//!
//! ```bash
//! mart --config ./config/mart.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `mart init` | Create the SQLite database and schema |
//! | `mart load messages [path]` | Replace raw messages with a scrape snapshot |
//! | `mart load detections [dir]` | Append detections from prediction files |
//! | `mart manifest <metadata_dir>` | Write image manifests from downloader metadata |
//! | `mart enrich` | Run the detector over the image tree |
//! | `mart build` | Rebuild dimension and fact tables |
//! | `mart check` | Verify mart invariants |
//! | `mart serve` | Start the HTTP API |
//! | `mart stats` | Row counts and per-channel breakdown |
//! | `mart run` | Full pipeline in fixed order |
//!
//! Logging goes to stderr and is controlled by `RUST_LOG`
//! (default `channel_mart=info`); command summaries go to stdout.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use channel_mart::progress::ProgressMode;
use channel_mart::{
    config, enrich, loader, manifest, marts, migrate, pipeline, server, stats,
};

/// Channel Mart CLI: load channel scrapes, enrich images, build marts and
/// serve them.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/mart.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "mart",
    about = "Channel Mart: scraped channel messages and image detections as queryable marts",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/mart.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Load raw records into the store.
    Load {
        #[command(subcommand)]
        target: LoadTarget,
    },

    /// Write `<image_root>/<channel>/manifest.json` files from the image
    /// downloader's per-channel metadata.
    Manifest {
        /// Directory of `<channel>.json` metadata files.
        metadata_dir: PathBuf,
    },

    /// Run the configured detector over every image under the image root.
    Enrich {
        /// Progress on stderr: `off`, `human`, or `json`.
        /// Defaults to `human` when stderr is a terminal.
        #[arg(long)]
        progress: Option<String>,
    },

    /// Rebuild dimension and fact tables from the raw tables.
    Build,

    /// Verify referential completeness and value ranges in the marts.
    Check,

    /// Start the read-only HTTP API.
    Serve,

    /// Show row counts and a per-channel breakdown.
    Stats,

    /// Run the full pipeline: init, scrape, load, download, enrich, build,
    /// transform, check.
    Run,
}

#[derive(Subcommand)]
enum LoadTarget {
    /// Replace raw messages with a CSV file, a JSON file, or a directory of
    /// per-channel JSON files. Defaults to `[paths].messages`.
    Messages { path: Option<PathBuf> },

    /// Append detections from per-channel prediction files.
    /// Defaults to `[paths].predictions_dir`.
    Detections { dir: Option<PathBuf> },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("channel_mart=info,tower_http=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized: {}", cfg.db.path.display());
        }
        Commands::Load { target } => match target {
            LoadTarget::Messages { path } => loader::run_load_messages(&cfg, path).await?,
            LoadTarget::Detections { dir } => loader::run_load_detections(&cfg, dir).await?,
        },
        Commands::Manifest { metadata_dir } => {
            manifest::run_build_manifests(&cfg, &metadata_dir)?;
        }
        Commands::Enrich { progress } => {
            let mode = match progress.as_deref() {
                None => None,
                Some(s) => Some(ProgressMode::parse(s).ok_or_else(|| {
                    anyhow::anyhow!("Invalid --progress '{}'. Use off, human, or json.", s)
                })?),
            };
            enrich::run_enrich(&cfg, mode).await?;
        }
        Commands::Build => marts::run_build(&cfg).await?,
        Commands::Check => marts::run_check(&cfg).await?,
        Commands::Serve => server::run_server(&cfg).await?,
        Commands::Stats => stats::run_stats(&cfg).await?,
        Commands::Run => pipeline::run_pipeline(&cfg).await?,
    }

    Ok(())
}
