//! Ripple CLI
//!
//! Sentiment contagion modelling and signal arbitration over location networks.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::de::DeserializeOwned;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use ripple_core::{
    AnalyticSignal, EngineConfig, GraphBuilder, LocationNode, LocationSnapshot, LocationStore,
    Observation, PerturbationSeed,
};
use ripple_runtime::{CycleReport, Engine, ScopeStatus, TargetScope};
use ripple_signals::StaticSignalProducer;

#[derive(Parser)]
#[command(name = "ripple")]
#[command(author, version, about = "Ripple: sentiment contagion and signal arbitration", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbosity level (0-3)
    #[arg(short, long, default_value = "1")]
    verbose: u8,

    /// Engine configuration (TOML); defaults apply when omitted
    #[arg(short, long, global = true, env = "RIPPLE_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one evaluation cycle
    Run {
        /// Location nodes (JSON array)
        #[arg(short, long)]
        locations: PathBuf,

        /// Perturbation seeds (JSON array)
        #[arg(short, long)]
        seeds: Option<PathBuf>,

        /// Sentiment observations to apply before the snapshot (JSON array)
        #[arg(long)]
        observations: Option<PathBuf>,

        /// Analytic signals per entity id (JSON object of arrays)
        #[arg(long)]
        signals: Option<PathBuf>,

        /// Target scope: all, brand:<id>, category:<id>, location:<id>[:<km>], region:<lat>,<lon>:<km>
        #[arg(long = "scope", default_value = "all")]
        scopes: Vec<String>,

        /// Evaluation time (RFC 3339); defaults to now
        #[arg(long)]
        at: Option<DateTime<Utc>>,

        /// Write the cycle report (JSON) here
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Print the cycle report as JSON instead of a summary
        #[arg(long)]
        json: bool,
    },

    /// Build and describe the relationship graph of each scope
    Graph {
        /// Location nodes (JSON array)
        #[arg(short, long)]
        locations: PathBuf,

        #[arg(long = "scope", default_value = "all")]
        scopes: Vec<String>,

        /// Evaluation time (RFC 3339); defaults to now
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = match cli.verbose {
        0 => Level::ERROR,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            locations,
            seeds,
            observations,
            signals,
            scopes,
            at,
            output,
            json,
        } => {
            let inputs = RunInputs {
                locations,
                seeds,
                observations,
                signals,
                scopes,
                at,
            };
            let report = run_cycle(config, inputs).await?;

            if let Some(path) = &output {
                fs::write(path, serde_json::to_string_pretty(&report)?)
                    .with_context(|| format!("writing report to {}", path.display()))?;
                info!("Report saved to {}", path.display());
            }

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_summary(&report);
            }
        }
        Commands::Graph {
            locations,
            scopes,
            at,
        } => {
            describe_graphs(&config, &locations, &scopes, at)?;
        }
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

struct RunInputs {
    locations: PathBuf,
    seeds: Option<PathBuf>,
    observations: Option<PathBuf>,
    signals: Option<PathBuf>,
    scopes: Vec<String>,
    at: Option<DateTime<Utc>>,
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => Ok(EngineConfig::default()),
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content =
        fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))
}

fn parse_scopes(scopes: &[String]) -> Result<Vec<TargetScope>> {
    scopes
        .iter()
        .map(|s| s.parse::<TargetScope>().map_err(anyhow::Error::from))
        .collect()
}

fn load_snapshot(
    config: &EngineConfig,
    locations: &Path,
    observations: Option<&Path>,
    at: Option<DateTime<Utc>>,
) -> Result<(std::sync::Arc<LocationSnapshot>, Vec<PerturbationSeed>)> {
    let nodes: Vec<LocationNode> = read_json(locations)?;
    let mut store = LocationStore::from_nodes(nodes);

    let mut seeds = Vec::new();
    if let Some(path) = observations {
        let batch: Vec<Observation> = read_json(path)?;
        let result = store.apply_observations(&batch);
        info!(
            "Applied {} observation(s): {} shock(s), {} unknown, {} out of order",
            result.applied,
            result.seeds.len(),
            result.unknown,
            result.out_of_order
        );
        seeds = result.seeds;
    }

    let snapshot = store.snapshot(at.unwrap_or_else(Utc::now), config.store.staleness_window());
    let stale = snapshot.stale_count();
    if stale > 0 {
        warn!("{} stale location(s) excluded from graphs", stale);
    }

    Ok((snapshot, seeds))
}

async fn run_cycle(config: EngineConfig, inputs: RunInputs) -> Result<CycleReport> {
    let scopes = parse_scopes(&inputs.scopes)?;
    let (snapshot, mut seeds) = load_snapshot(
        &config,
        &inputs.locations,
        inputs.observations.as_deref(),
        inputs.at,
    )?;

    if let Some(path) = &inputs.seeds {
        let explicit: Vec<PerturbationSeed> = read_json(path)?;
        seeds.extend(explicit);
    }

    let producers = match &inputs.signals {
        Some(path) => {
            let batch: HashMap<String, Vec<AnalyticSignal>> = read_json(path)?;
            StaticSignalProducer::from_batch(batch)
        }
        None => Vec::new(),
    };

    info!(
        "Loaded {} location(s), {} seed(s), {} signal source(s)",
        snapshot.nodes().len(),
        seeds.len(),
        producers.len()
    );

    let engine = Engine::new(config, producers);
    let report = engine.run_cycle(snapshot, seeds, scopes).await?;
    Ok(report)
}

fn describe_graphs(
    config: &EngineConfig,
    locations: &Path,
    scopes: &[String],
    at: Option<DateTime<Utc>>,
) -> Result<()> {
    config.validate()?;
    let scopes = parse_scopes(scopes)?;
    let (snapshot, _) = load_snapshot(config, locations, None, at)?;
    let builder = GraphBuilder::new(config.graph.clone());

    for scope in scopes {
        let selected = scope.select(&snapshot);
        match builder.build(selected.iter().copied()) {
            Ok(graph) => {
                let stats = graph.stats();
                println!("{}", scope);
                println!("   Nodes: {} ({} isolated)", stats.nodes, stats.isolated_nodes);
                println!("   Edges: {}", stats.edges);
                for (kind, count) in &stats.edges_by_kind {
                    println!("     {:?}: {}", kind, count);
                }
                println!("   Max degree: {}", stats.max_degree);
                println!("   Mean weighted degree: {:.3}", stats.mean_weighted_degree);
            }
            Err(e) => {
                println!("{}", scope);
                println!("   Skipped: {}", e);
            }
        }
    }

    Ok(())
}

fn print_summary(report: &CycleReport) {
    let (decided, undecided, skipped) = report.counts();
    println!("Cycle {}", report.cycle_id);
    println!(
        "   {} location(s), {} seed(s) | {} decided, {} without decision, {} skipped\n",
        report.snapshot_nodes, report.seeds, decided, undecided, skipped
    );

    for scope in &report.scopes {
        let regime = scope
            .regime()
            .map(|r| r.to_string())
            .unwrap_or_else(|| "-".to_string());

        match &scope.status {
            ScopeStatus::Decided {
                decision,
                consensus,
            } => {
                println!(
                    "{}: {} (confidence {:.2}, agreement {:.2}, {}/{} members) | regime {}",
                    scope.entity_id,
                    decision.direction,
                    decision.confidence,
                    consensus.agreement,
                    consensus.succeeded,
                    consensus.size,
                    regime
                );
            }
            ScopeStatus::NoDecision { reason } => {
                println!("{}: NO DECISION ({}) | regime {}", scope.entity_id, reason, regime);
            }
            ScopeStatus::Skipped { error, message, .. } => {
                println!("{}: SKIPPED [{}] {}", scope.entity_id, error, message);
            }
        }

        if let Some(overflow) = &scope.overflow {
            println!(
                "   Overflow at step {} (|delta| {:.3} > {})",
                overflow.step, overflow.magnitude, overflow.bound
            );
        }
        for candidate in scope.contagion() {
            println!(
                "   Contagion candidate {} [{}] weighted degree {:.3}",
                candidate.node_id, candidate.regime, candidate.weighted_degree
            );
        }
    }
}
