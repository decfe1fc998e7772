use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use avoidzones::pipeline::{CommandEngine, Orchestrator, PbfProvider, ProcessStageRunner};
use avoidzones::{Settings, VersionRef, VersionStore};

#[derive(Parser)]
#[command(name = "avoidzones")]
#[command(about = "Tag roads against avoidance zones and rebuild the routing graph", long_about = None)]
struct Cli {
    /// Settings file (TOML). Defaults apply when the file does not exist.
    #[arg(long, default_value = "avoidzones.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store a zone configuration without rebuilding
    Save {
        /// GeoJSON FeatureCollection of zone polygons
        geojson: PathBuf,
    },
    /// Store a configuration (if given) and rebuild the routing graph
    Apply {
        /// GeoJSON file to store and apply; omit to apply a stored version
        #[arg(long)]
        geojson: Option<PathBuf>,
        /// Stored version to apply ("latest", "v3", or "3")
        #[arg(default_value = "latest")]
        version: String,
    },
    /// Rebuild from a historical version
    Revert {
        /// Stored version ("v3" or "3")
        version: String,
    },
    /// List stored configuration versions, newest first
    List,
    /// Print a stored configuration, or write it to a file
    Show {
        /// Stored version ("latest", "v3", or "3")
        #[arg(default_value = "latest")]
        version: String,
        /// Write the GeoJSON here instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Show the serving version and job state
    Status,
}

fn load_settings(path: &Path) -> Result<Settings> {
    if path.exists() {
        Ok(Settings::from_file(path)?)
    } else {
        Ok(Settings::default())
    }
}

fn build_orchestrator(settings: &Settings) -> Result<Orchestrator> {
    let store = VersionStore::open(settings.history_dir())?;
    Ok(Orchestrator::new(
        settings.clone(),
        store,
        Box::new(PbfProvider::new(settings.base_pbf_path())),
        Box::new(ProcessStageRunner::new(settings.clone())),
        Box::new(CommandEngine::new(settings.clone())),
    ))
}

fn run_rebuild(orchestrator: &Orchestrator, version: VersionRef) -> Result<()> {
    let start = Instant::now();
    let summary = orchestrator.apply(version)?;

    if summary.reused {
        println!("Version v{} is already serving, nothing to do", summary.version_id);
        return Ok(());
    }
    if let Some(stats) = summary.stats {
        println!(
            "Tagged {} of {} roads ({} contained, {} boundary)",
            stats.tagged(),
            stats.roads,
            stats.contained,
            stats.boundary
        );
    }
    for log in &summary.stage_logs {
        println!("Stage {} completed", log.stage);
    }
    println!(
        "Engine serving v{} ({:.2}s total)",
        summary.version_id,
        start.elapsed().as_secs_f64()
    );
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let settings = load_settings(&cli.config)?;

    match cli.command {
        Commands::Save { geojson } => {
            let text = fs::read_to_string(&geojson)
                .with_context(|| format!("reading {}", geojson.display()))?;
            let store = VersionStore::open(settings.history_dir())?;
            let (id, reused) = store.save(&text)?;
            if reused {
                println!("Identical configuration already stored as v{id}");
            } else {
                println!("Stored configuration as v{id}");
            }
        }
        Commands::Apply { geojson, version } => {
            let orchestrator = build_orchestrator(&settings)?;
            let target = match geojson {
                Some(path) => {
                    let text = fs::read_to_string(&path)
                        .with_context(|| format!("reading {}", path.display()))?;
                    let (id, reused) = orchestrator.store().save(&text)?;
                    if reused {
                        println!("Identical configuration already stored as v{id}");
                    } else {
                        println!("Stored configuration as v{id}");
                    }
                    VersionRef::Id(id)
                }
                None => version.parse()?,
            };
            run_rebuild(&orchestrator, target)?;
        }
        Commands::Revert { version } => {
            let orchestrator = build_orchestrator(&settings)?;
            run_rebuild(&orchestrator, version.parse()?)?;
        }
        Commands::List => {
            let store = VersionStore::open(settings.history_dir())?;
            let versions = store.list()?;
            if versions.is_empty() {
                println!("No stored configurations");
            }
            for info in versions {
                println!(
                    "v{}  {} zones  {} bytes",
                    info.id, info.zone_count, info.size_bytes
                );
            }
        }
        Commands::Show { version, output } => {
            let store = VersionStore::open(settings.history_dir())?;
            let (id, text) = store.read_raw(version.parse()?)?;
            match output {
                Some(path) => {
                    fs::write(&path, &text)
                        .with_context(|| format!("writing {}", path.display()))?;
                    println!("Wrote v{id} to {}", path.display());
                }
                None => print!("{text}"),
            }
        }
        Commands::Status => {
            let orchestrator = build_orchestrator(&settings)?;
            match orchestrator.serving_version() {
                Some(id) => println!("Serving: v{id}"),
                None => println!("Serving: unknown (no marker recorded)"),
            }
            println!("Job state: {}", orchestrator.state());
            println!("Stored versions: {}", orchestrator.store().list()?.len());
        }
    }

    Ok(())
}
