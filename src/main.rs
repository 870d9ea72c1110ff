//! Payload Evolver CLI - evolve failure-inducing payloads against a JSON API.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use payload_evolver::{DiscoveryDriver, schema::RunConfig};

#[derive(Parser)]
#[command(name = "payload-evolver")]
#[command(version)]
#[command(about = "Genetic search for failure-inducing HTTP JSON payloads", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Evolve payloads against the configured target
    Run {
        /// Path to the JSON run configuration
        #[arg(long)]
        config: PathBuf,

        /// Override the target URL
        #[arg(long)]
        target: Option<String>,

        /// Override the population size
        #[arg(long)]
        population: Option<usize>,

        /// Override the number of generations
        #[arg(long)]
        generations: Option<usize>,

        /// Random seed for a reproducible run
        #[arg(long)]
        seed: Option<u64>,

        /// Directory for the report, statistics and archived payloads
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Print an example configuration for a user-creation endpoint
    Example,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Example => print_example_config(),
        Commands::Run {
            config,
            target,
            population,
            generations,
            seed,
            output,
        } => {
            let text = fs::read_to_string(&config)
                .with_context(|| format!("reading config file {}", config.display()))?;
            let mut config: RunConfig = serde_json::from_str(&text)
                .with_context(|| format!("parsing config file {}", config.display()))?;

            if let Some(target) = target {
                config.evaluation.target_url = target;
            }
            if let Some(size) = population {
                config.population.size = size;
            }
            if let Some(generations) = generations {
                config.population.max_generations = generations;
            }
            if seed.is_some() {
                config.random_seed = seed;
            }
            let output = output.or_else(|| config.archive.output_dir.clone().map(PathBuf::from));

            run(config, output)
        }
    }
}

fn run(config: RunConfig, output: Option<PathBuf>) -> Result<()> {
    println!("Payload Evolver");
    println!("===============");
    println!("Target: {}", config.evaluation.target_url);
    println!(
        "Population: {}, generations: {}",
        config.population.size, config.population.max_generations
    );
    println!(
        "Fields: {}",
        config
            .grammar
            .iter()
            .map(|f| f.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );
    println!();

    let mut driver = DiscoveryDriver::from_config(config).context("preparing discovery run")?;

    // Stop between generations on Ctrl-C; the partial report is still written.
    let cancel = driver.cancel_handle();
    if let Err(err) = ctrlc::set_handler(move || {
        log::warn!("Interrupt received, stopping after the current generation");
        cancel.store(true, Ordering::Relaxed);
    }) {
        log::error!("Failed to set Ctrl-C handler: {err}");
    }

    let start = Instant::now();
    let report = driver
        .run_with_callback(|progress| {
            if let Some(stats) = &progress.stats {
                println!(
                    "  Generation {}/{}: best={:.3} mean={:.3} evaluations={}",
                    progress.generation,
                    progress.total_generations,
                    progress.best_fitness,
                    stats.mean,
                    progress.evaluations_total
                );
            }
        })
        .context("running discovery")?;

    println!();
    println!(
        "Stopped: {:?} after {} generations ({} evaluations, {:.2}s)",
        report.stats.stop_reason,
        report.stats.generations,
        report.stats.total_evaluations,
        start.elapsed().as_secs_f32()
    );
    println!();
    println!("Top payloads:");
    for entry in &report.top {
        let status = entry
            .diagnostics
            .as_ref()
            .and_then(|d| d.status)
            .map_or_else(|| "-".to_string(), |s| s.to_string());
        println!(
            "  #{:<2} fitness={:.3} status={} tags=[{}]",
            entry.rank,
            entry.fitness,
            status,
            entry.tags.join(", ")
        );
        println!("      {}", serde_json::Value::Object(entry.payload.clone()));
    }

    if let Some(dir) = output {
        let path = report
            .write_to_dir(&dir)
            .with_context(|| format!("writing report to {}", dir.display()))?;
        let archived = driver
            .export_archive(dir.join("archive"))
            .with_context(|| format!("exporting archive to {}", dir.display()))?;
        println!();
        println!("Report: {}", path.display());
        println!("Archived payloads: {}", archived.len());
    }

    Ok(())
}

fn print_example_config() -> Result<()> {
    let config = RunConfig::user_api_example();
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}
