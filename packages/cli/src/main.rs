#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! `patrol` command line entry point.
//!
//! `resolve` and `check` are one-shot zone queries. `run` starts the full
//! alert core and prints every alert event as a JSON line, fed either from
//! a recorded track or from `lat,lng` lines on stdin. On stdin a `refresh`
//! line reloads zone definitions from the backend.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::{Parser, Subcommand};
use patrol_channel::WebSocketTransport;
use patrol_cli::config::AppConfig;
use patrol_cli::{App, build_registry, forward_events, load_track};
use patrol_geofence::HttpLocationSink;
use patrol_geofence_models::GeoPoint;
use patrol_position::{Position, SimulatedProvider};
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser)]
#[command(name = "patrol", about = "Geofence and alert core for field security officers")]
struct Cli {
    /// Path to a TOML config file (defaults to `patrol.toml` if present)
    #[arg(long, env = "PATROL_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve a zone name and print the matching definition
    Resolve {
        /// Zone name (exact, case-insensitive or partial)
        name: String,
    },
    /// Check whether a point lies inside a zone
    Check {
        /// Latitude in degrees
        #[arg(allow_hyphen_values = true)]
        lat: f64,
        /// Longitude in degrees
        #[arg(allow_hyphen_values = true)]
        lng: f64,
        /// Zone name
        zone: String,
    },
    /// Run the alert core until the input ends or Ctrl-C
    Run {
        /// JSON array of positions to replay instead of reading stdin
        #[arg(long)]
        track: Option<PathBuf>,
        /// Delay between replayed fixes, in milliseconds
        #[arg(long, default_value = "1000")]
        pace_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    pretty_env_logger::init_custom_env("RUST_LOG");

    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref())?;

    match cli.command {
        Some(Commands::Resolve { name }) => {
            let registry = build_registry(&config).await?;
            let resolved = registry.require(&name)?;
            println!("{}", serde_json::to_string_pretty(&resolved)?);
        }
        Some(Commands::Check { lat, lng, zone }) => {
            let registry = build_registry(&config).await?;
            let resolved = registry.require(&zone)?;
            let inside = patrol_spatial::contains(&GeoPoint::new(lat, lng), &resolved.area);
            println!(
                "({lat}, {lng}) is {} {} [{}]",
                if inside { "inside" } else { "outside" },
                resolved.area.name,
                resolved.provenance
            );
        }
        Some(Commands::Run { track, pace_ms }) => {
            run(&config, track, Duration::from_millis(pace_ms)).await?;
        }
        None => {
            println!("Nothing to do. Try `patrol --help`.");
        }
    }

    Ok(())
}

async fn run(
    config: &AppConfig,
    track: Option<PathBuf>,
    pace: Duration,
) -> Result<(), Box<dyn std::error::Error>> {
    let registry = build_registry(config).await?;
    let reports = HttpLocationSink::new(&config.api_base_url, config.api_token.clone())?;
    let provider = SimulatedProvider::new();
    let mut app = App::start(
        config,
        registry,
        Arc::new(provider.clone()),
        Arc::new(WebSocketTransport),
        Some(Arc::new(reports)),
    )?;

    let printer = tokio::spawn(forward_events(app.subscribe(), |event| {
        match serde_json::to_string(&event) {
            Ok(line) => println!("{line}"),
            Err(e) => log::error!("Failed to encode event {}: {e}", event.id),
        }
    }));

    let feed = async {
        match track {
            Some(path) => {
                let fixes = load_track(&path)?;
                provider.replay(fixes, pace).await;
            }
            None => read_stdin(&provider, &mut app).await?,
        }
        Ok::<(), Box<dyn std::error::Error>>(())
    };

    tokio::select! {
        result = feed => result?,
        _ = tokio::signal::ctrl_c() => log::info!("Interrupted"),
    }

    let snapshot = app.shutdown().await;
    printer.abort();
    eprintln!("{}", serde_json::to_string_pretty(&snapshot)?);

    Ok(())
}

/// Pushes one fix per `lat,lng` line read from stdin. A `refresh` line
/// reloads zone definitions from the backend.
async fn read_stdin(provider: &SimulatedProvider, app: &mut App) -> std::io::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line.eq_ignore_ascii_case("refresh") {
            match app.refresh_zones().await {
                Ok(count) => log::info!("Now tracking {count} zone(s)"),
                Err(e) => log::warn!("Zone refresh failed, keeping current zones: {e}"),
            }
            continue;
        }
        let Some((lat, lng)) = line
            .split_once(',')
            .and_then(|(lat, lng)| Some((lat.trim().parse::<f64>().ok()?, lng.trim().parse::<f64>().ok()?)))
        else {
            log::warn!("Ignoring malformed line {line:?}, expected `lat,lng`");
            continue;
        };
        provider.push(Ok(Position::new(lat, lng, 0.0, Utc::now())));
    }

    Ok(())
}
