//! Staggered DiD CLI

mod config;
mod pipeline;
mod report;

use anyhow::Result;
use clap::{Parser, Subcommand};
use sd_inference::did::{aggregate_dynamic, estimate_att_gt, run_power_analysis, simulate_panel};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "staggered")]
#[command(about = "Staggered DiD - simulation, IPW event studies and power analysis")]
#[command(version)]
struct Cli {
    /// Log verbosity level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    log_level: tracing::Level,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Simulate a panel and print it with its ground truth
    Simulate {
        /// Run configuration (YAML or JSON). Defaults apply when omitted.
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Output file for results (pretty JSON). Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Full pipeline: propensity, weights, balance, event study, aggregation
    Pipeline {
        /// Run configuration (YAML or JSON). Defaults apply when omitted.
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Output file for results (pretty JSON). Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Directory for cached event-study fits (reused when present).
        #[arg(long)]
        cache_dir: Option<PathBuf>,
    },

    /// Group-time ATT (Callaway & Sant'Anna) on a simulated panel
    AttGt {
        /// Run configuration (YAML or JSON). Defaults apply when omitted.
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Output file for results (pretty JSON). Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Monte-Carlo power curve of the dynamic ATT test
    Power {
        /// Run configuration (YAML or JSON). Defaults apply when omitted.
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Output file for results (pretty JSON). Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Override `power.n_trials`.
        #[arg(long)]
        n_trials: Option<usize>,

        /// Omit per-trial records from the output.
        #[arg(long)]
        summary_only: bool,
    },

    /// Show version information
    Version,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt().with_max_level(cli.log_level).with_target(false).init();

    match cli.command {
        Commands::Simulate { config, output } => cmd_simulate(config.as_ref(), output.as_ref()),
        Commands::Pipeline { config, output, cache_dir } => {
            cmd_pipeline(config.as_ref(), output.as_ref(), cache_dir.as_ref())
        }
        Commands::AttGt { config, output } => cmd_att_gt(config.as_ref(), output.as_ref()),
        Commands::Power { config, output, n_trials, summary_only } => {
            cmd_power(config.as_ref(), output.as_ref(), n_trials, summary_only)
        }
        Commands::Version => {
            println!("staggered {}", sd_core::VERSION);
            Ok(())
        }
    }
}

fn cmd_simulate(config: Option<&PathBuf>, output: Option<&PathBuf>) -> Result<()> {
    let cfg = config::read_run_config(config.map(PathBuf::as_path))?;
    let sim = simulate_panel(&cfg.simulation)?;
    tracing::info!(units = sim.panel.n_units(), periods = sim.panel.n_periods(), "panel simulated");
    write_json(output, serde_json::to_value(&sim)?)
}

fn cmd_pipeline(
    config: Option<&PathBuf>,
    output: Option<&PathBuf>,
    cache_dir: Option<&PathBuf>,
) -> Result<()> {
    let cfg = config::read_run_config(config.map(PathBuf::as_path))?;
    let report = pipeline::run_pipeline(&cfg, cache_dir.map(PathBuf::as_path))?;
    tracing::info!(wall_s = report.wall_s, "pipeline complete");
    write_json(output, serde_json::to_value(&report)?)
}

fn cmd_att_gt(config: Option<&PathBuf>, output: Option<&PathBuf>) -> Result<()> {
    let cfg = config::read_run_config(config.map(PathBuf::as_path))?;
    let sim = simulate_panel(&cfg.simulation)?;
    let result = estimate_att_gt(&sim.panel, &cfg.att_gt)?;
    let dynamic = aggregate_dynamic(&result)?;
    tracing::info!(estimates = result.estimates.len(), overall_att = dynamic.overall_att, "att_gt");

    let output_json = serde_json::json!({
        "n_units": result.n_units,
        "conf_level": result.conf_level,
        "control_group": cfg.att_gt.control_group,
        "base_period": cfg.att_gt.base_period,
        "method": cfg.att_gt.method,
        "group_time": result.estimates,
        "dynamic": dynamic,
        "ground_truth": sim.ground_truth,
    });
    write_json(output, output_json)
}

fn cmd_power(
    config: Option<&PathBuf>,
    output: Option<&PathBuf>,
    n_trials: Option<usize>,
    summary_only: bool,
) -> Result<()> {
    let cfg = config::read_run_config(config.map(PathBuf::as_path))?;
    let mut power = cfg.power_config();
    if let Some(n) = n_trials {
        power.n_trials = n;
    }
    let mut result = run_power_analysis(&power)?;
    tracing::info!(points = result.points.len(), wall_s = result.wall_s, "power analysis complete");
    if summary_only {
        result.trials.clear();
    }
    write_json(output, serde_json::to_value(&result)?)
}

fn write_json(output: Option<&PathBuf>, value: serde_json::Value) -> Result<()> {
    if let Some(path) = output {
        std::fs::write(path, serde_json::to_string_pretty(&value)?)?;
    } else {
        println!("{}", serde_json::to_string_pretty(&value)?);
    }
    Ok(())
}
