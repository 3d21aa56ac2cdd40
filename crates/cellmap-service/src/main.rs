//! Cellmap Service - duty-cycled signal and location sampler.
//!
//! Run with: `cargo run -p cellmap-service`

use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{info, warn};

use cellmap_core::{LocationProvider, SampleJoiner, Telephony, shared_store};
use cellmap_service::{
    Config, PreferenceStore, Scheduler, SimulatedLocation, SimulatedTelephony,
};
use cellmap_store::Store;

/// Cellmap Service - samples cellular signal strength against location.
#[derive(Parser, Debug)]
#[command(name = "cellmap-service")]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Database path (overrides config).
    #[arg(short, long, global = true)]
    database: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the sampler in the foreground (default behavior).
    Run,

    /// Show the number of stored samples and the latest one.
    Status {
        /// Print as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Dump every stored sample to a CSV file, oldest first.
    Export {
        /// Output file.
        #[arg(short, long)]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("cellmap_service=info".parse()?)
                .add_directive("cellmap_core=info".parse()?)
                .add_directive("cellmap_store=info".parse()?),
        )
        .init();

    let config = load_config(&args)?;

    match args.command {
        Some(Command::Status { json }) => show_status(&config, json),
        Some(Command::Export { output }) => export(&config, output),
        Some(Command::Run) | None => run(config, args.config).await,
    }
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default().unwrap_or_default(),
    };

    if let Some(db_path) = &args.database {
        config.storage.path = db_path.clone();
    }

    config.validate()?;
    Ok(config)
}

async fn run(config: Config, config_path: Option<PathBuf>) -> anyhow::Result<()> {
    info!("Opening database at {:?}", config.storage.path);
    let store = shared_store(Store::open(&config.storage.path)?);

    let location: Arc<dyn LocationProvider> = Arc::new(SimulatedLocation::new(
        config.simulator.latitude,
        config.simulator.longitude,
    ));
    let telephony: Arc<dyn Telephony> =
        Arc::new(SimulatedTelephony::new(config.simulator.carrier.clone()));

    let joiner = Arc::new(SampleJoiner::new(
        Arc::clone(&store),
        Arc::clone(&location),
        Arc::clone(&telephony),
        config.device_context(),
        config.join.options(),
    ));
    let prefs = PreferenceStore::new(config.sampling.clone());

    let scheduler = Scheduler::new(joiner, location, telephony, &prefs)
        .with_max_location_age(config.join.max_location_age())
        .spawn();
    scheduler.start().await?;
    info!("Sampler started");

    let mut hangup = Hangup::new();
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!("Failed to listen for Ctrl-C: {}", e);
                }
                info!("Shutting down");
                break;
            }
            _ = hangup.recv() => {
                info!("SIGHUP received, reloading configuration");
                reload(&prefs, config_path.as_ref());
            }
        }
    }

    let stats = scheduler.stats();
    scheduler.shutdown().await;
    info!(
        "Stored {} samples ({} kept, {} rejected for drift, {} without signal, {} in airplane mode, {} failed)",
        stats.stored,
        stats.kept,
        stats.rejected_drift,
        stats.rejected_no_signal,
        stats.rejected_airplane,
        stats.persistence_failures
    );

    store.lock().await.close()?;
    Ok(())
}

/// Re-read the configuration file and publish its sampling preferences.
///
/// Storage, join and simulator settings only apply on restart.
fn reload(prefs: &PreferenceStore, config_path: Option<&PathBuf>) {
    let loaded = match config_path {
        Some(path) => Config::load_validated(path),
        None => Config::load_default().and_then(|config| {
            config.validate()?;
            Ok(config)
        }),
    };

    match loaded {
        Ok(config) => {
            if prefs.replace(config.sampling) {
                info!("Sampling preferences changed, restarting schedule");
            } else {
                info!("Sampling preferences unchanged");
            }
        }
        Err(e) => warn!("Keeping current configuration: {}", e),
    }
}

fn show_status(config: &Config, json: bool) -> anyhow::Result<()> {
    let mut store = Store::open(&config.storage.path)?;
    let rows = store.row_count()?;
    let latest_entry = store.latest_entry_string()?;

    if json {
        let status = serde_json::json!({
            "database": config.storage.path,
            "rows": rows,
            "latest_entry": latest_entry,
            "latest": store.latest_sample()?,
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("Database: {}", config.storage.path.display());
    println!("Rows:     {}", rows);
    match latest_entry {
        Some(entry) => {
            println!("Latest:   {}", entry);
            println!();
            print!("{}", store.latest_row_formatted()?);
        }
        None => println!("Latest:   none"),
    }
    Ok(())
}

fn export(config: &Config, output: PathBuf) -> anyhow::Result<()> {
    let mut store = Store::open(&config.storage.path)?;
    let writer = BufWriter::new(File::create(&output)?);
    let count = store.export_csv(writer)?;
    println!("Exported {} samples to {}", count, output.display());
    Ok(())
}

/// SIGHUP listener. Never fires where hangup signals do not exist.
struct Hangup {
    #[cfg(unix)]
    signal: Option<tokio::signal::unix::Signal>,
}

impl Hangup {
    fn new() -> Self {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};

            let signal = match signal(SignalKind::hangup()) {
                Ok(signal) => Some(signal),
                Err(e) => {
                    warn!("Failed to register SIGHUP handler: {}", e);
                    None
                }
            };
            Self { signal }
        }

        #[cfg(not(unix))]
        {
            Self {}
        }
    }

    async fn recv(&mut self) {
        #[cfg(unix)]
        if let Some(signal) = self.signal.as_mut()
            && signal.recv().await.is_some()
        {
            return;
        }

        std::future::pending::<()>().await
    }
}
