//! DOMES Sim - cluster scenarios in virtual time
//!
//! - `run` - Run one scenario
//! - `suite` - Run every scenario
//! - `list` - List scenario names

use clap::{Parser, Subcommand};
use domes_sim::metrics::Report;
use domes_sim::scenarios;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "domes-sim")]
#[command(about = "Virtual-time simulation of DOMES pod coordination")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single scenario
    Run {
        /// Scenario to run
        #[arg(short, long, default_value = "election")]
        scenario: String,

        /// Number of pods (default depends on the scenario)
        #[arg(short, long)]
        pods: Option<usize>,

        /// Seed for radio loss and jitter
        #[arg(long, default_value = "1")]
        seed: u64,

        /// Path to write the JSON report
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Run every scenario
    Suite {
        /// Seed for radio loss and jitter
        #[arg(long, default_value = "1")]
        seed: u64,

        /// Path to write the JSON report
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List scenario names
    List,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let (report, output) = match cli.command {
        Commands::Run {
            scenario,
            pods,
            seed,
            output,
        } => {
            let config = scenarios::get_scenario(&scenario)?;
            let result = tokio::task::spawn_blocking(move || scenarios::run_scenario(config, pods, seed)).await??;
            (Report::new(vec![result]), output)
        }

        Commands::Suite { seed, output } => {
            info!("Running full scenario suite (seed {})", seed);
            let report = tokio::task::spawn_blocking(move || scenarios::run_suite(seed)).await??;
            (report, output)
        }

        Commands::List => {
            for name in scenarios::list_scenarios() {
                let config = scenarios::get_scenario(name)?;
                println!("  {:<12} {}", config.name, config.description);
            }
            return Ok(());
        }
    };

    println!("\nScenario Results:");
    for scenario in &report.scenarios {
        println!(
            "  {:<12} {}  (virtual {} ms, wall {} ms)",
            scenario.scenario,
            if scenario.passed { "PASS" } else { "FAIL" },
            scenario.metrics.virtual_ms,
            scenario.wall_ms
        );
        for check in scenario.checks.iter().filter(|c| !c.passed) {
            println!("      - {}: {}", check.name, check.detail);
        }
    }
    println!("  Total: {}  Passed: {}  Failed: {}", report.total, report.passed, report.failed);

    if let Some(path) = output {
        std::fs::write(&path, report.export_json()?)?;
        info!("Report written to: {}", path.display());
    }

    if report.failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}
