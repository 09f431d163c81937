//! CLI Entry Point for rust-station
//!
//! Provides command-line access to the station engine:
//! - `validate`: check a station document and print every violation
//! - `load`: load a document with the mock driver catalog and print the
//!   station snapshot
//! - `drivers`: list the registered driver classes
//!
//! # Usage
//!
//! ```bash
//! rust-station validate stations/lab.yaml
//! rust-station load stations/lab.yaml --only dmm --only dac
//! rust-station --log-format json load
//! ```

// Global allocator (Microsoft Rust Guidelines: M-MIMALLOC-APPS)
#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use rust_station::config::{self, SchemaValidator};
use rust_station::logging::{self, LoggingConfig, OutputFormat};
use rust_station::{DriverCatalog, Station, StationError, StationSettings};
use serde_json::Map;
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "rust-station")]
#[command(about = "Load and inspect instrument station documents", long_about = None)]
struct Cli {
    /// Settings file (defaults to ./rust_station.toml)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Log level; overrides the settings file
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Pretty)]
    log_format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a station document against the schema
    Validate {
        /// Path to the station document (YAML or JSON)
        file: PathBuf,
    },

    /// Load a station document and print its snapshot
    Load {
        /// Path to the station document; defaults to `default_file` from settings
        file: Option<PathBuf>,

        /// Load only these instruments (repeatable), in the order given
        #[arg(long)]
        only: Vec<String>,

        /// Do not read parameter values for the snapshot
        #[arg(long)]
        no_update: bool,
    },

    /// List registered driver classes
    Drivers,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = match &cli.settings {
        Some(path) => StationSettings::load_from(path)?,
        None => StationSettings::load()?,
    };
    if let Some(level) = &cli.log_level {
        settings.log_level = level.clone();
        settings.validate()?;
    }

    let logging_config = LoggingConfig::from_settings(&settings)
        .map_err(|e| anyhow!(e))?
        .with_format(cli.log_format);
    logging::init(logging_config).map_err(|e| anyhow!(e))?;

    let mut catalog = DriverCatalog::new();
    station_driver_mock::register_all(&mut catalog);

    match cli.command {
        Commands::Validate { file } => validate(file),
        Commands::Load {
            file,
            only,
            no_update,
        } => load(catalog, settings, file, only, !no_update).await,
        Commands::Drivers => {
            list_drivers(&catalog);
            Ok(())
        }
    }
}

fn validate(file: PathBuf) -> Result<()> {
    let text = std::fs::read_to_string(&file)
        .with_context(|| format!("reading {}", file.display()))?;
    let value = config::parse_document_str(&text)?;
    let validator = SchemaValidator::new()?;

    match validator.validate(&value) {
        Ok(()) => {
            println!("{}: ok", file.display());
            Ok(())
        }
        Err(StationError::SchemaValidation { violations }) => {
            println!("{}: {} violation(s)", file.display(), violations.len());
            for violation in violations.iter() {
                println!("{}", violation);
            }
            Err(anyhow!("{} is not a valid station document", file.display()))
        }
        Err(e) => Err(e.into()),
    }
}

async fn load(
    catalog: DriverCatalog,
    settings: StationSettings,
    file: Option<PathBuf>,
    only: Vec<String>,
    update: bool,
) -> Result<()> {
    let file = file
        .or_else(|| settings.default_file.clone())
        .ok_or_else(|| anyhow!("no station document given and no default_file configured"))?;
    let document = config::load_document_file(&file)?;

    let mut station = Station::with_settings(catalog, settings);
    station.load_config(document);

    let loaded = if only.is_empty() {
        station.load_all().await
    } else {
        let mut result = Ok(());
        for name in &only {
            if let Err(e) = station.load_instrument(name, Map::new()).await {
                result = Err(e);
                break;
            }
        }
        result
    };

    if let Err(e) = loaded {
        if let Err(close) = station.close_all().await {
            warn!(error = %close, "cleanup after failed load");
        }
        return Err(e.into());
    }

    info!(instruments = station.len(), "station loaded");
    let snapshot = station.snapshot(update).await;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);

    station.close_all().await?;
    Ok(())
}

fn list_drivers(catalog: &DriverCatalog) {
    for factory in catalog.factories() {
        let mut accepts = Vec::new();
        if factory.accepts_address() {
            accepts.push("address");
        }
        if factory.accepts_port() {
            accepts.push("port");
        }
        println!(
            "{:<36} {:<28} {}",
            factory.class_path(),
            factory.name(),
            accepts.join(", ")
        );
    }
}
