//! SLURM Sweep Harness CLI
//!
//! Submits training runs to SLURM and launches the trainer inside each
//! allocation.

use std::{
    path::{Path, PathBuf},
    process::ExitCode,
};

use clap::{Parser, Subcommand};
use sweep_harness::{
    Launcher, Submitter, config::SweepConfig, launcher::LaunchOutcome, slurm::Slurm,
};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "sweep-harness", about = "SLURM Training Sweep Harness")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit runs to the scheduler
    Submit {
        /// Path to sweep.toml config file
        #[arg(short, long, default_value = "sweep.toml")]
        config: PathBuf,

        /// Runs to submit (all runs if omitted)
        #[arg(short, long = "run")]
        runs: Vec<String>,

        /// Print the batch scripts instead of submitting
        #[arg(long)]
        dry_run: bool,
    },

    /// Job step inside an allocation: record accounting, then train
    Job {
        /// Path to sweep.toml config file
        #[arg(short, long, default_value = "sweep.toml")]
        config: PathBuf,

        /// Run to execute
        #[arg(short, long)]
        run: String,
    },

    /// Launch the trainer directly, without the scheduler
    Launch {
        /// Path to sweep.toml config file
        #[arg(short, long, default_value = "sweep.toml")]
        config: PathBuf,

        /// Run to execute
        #[arg(short, long)]
        run: String,
    },

    /// Print the trainer arguments for a run
    Args {
        /// Path to sweep.toml config file
        #[arg(short, long, default_value = "sweep.toml")]
        config: PathBuf,

        /// Run to render
        #[arg(short, long)]
        run: String,

        /// Print as a JSON array
        #[arg(long)]
        json: bool,
    },

    /// Print the batch script for a run
    Script {
        /// Path to sweep.toml config file
        #[arg(short, long, default_value = "sweep.toml")]
        config: PathBuf,

        /// Run to render
        #[arg(short, long)]
        run: String,
    },
}

/// Load config with an absolute path so job scripts work from any directory.
fn load_config(path: &Path) -> Result<SweepConfig, Box<dyn std::error::Error>> {
    let path = std::path::absolute(path)?;
    Ok(SweepConfig::load(path)?)
}

fn harness_binary() -> Result<PathBuf, Box<dyn std::error::Error>> {
    Ok(std::env::current_exe()?)
}

/// Trainer status as this process's exit status.
fn outcome_exit(outcome: &LaunchOutcome) -> ExitCode {
    println!(
        "{}: exit {} (log: {})",
        outcome.name,
        outcome.exit_code,
        outcome.log_path.display()
    );
    u8::try_from(outcome.exit_code).map_or(ExitCode::FAILURE, ExitCode::from)
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive(tracing::Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Submit {
            config,
            runs,
            dry_run,
        } => {
            let sweep = load_config(&config)?;
            let submitter = Submitter::new(&sweep, Slurm::default(), harness_binary()?);
            let selected = sweep.select(&runs)?;

            if dry_run {
                println!("=== Dry Run: {} jobs ===", selected.len());
                for run in selected {
                    println!();
                    println!("# {}", run.name);
                    print!("{}", submitter.render_script(run));
                }
                return Ok(ExitCode::SUCCESS);
            }

            let mut failed = 0;
            for run in &selected {
                match submitter.submit(run).await {
                    Ok(submission) => {
                        println!("{}: job {}", submission.run, submission.job_id);
                    }
                    Err(e) => {
                        eprintln!("{}: {e}", run.name);
                        failed += 1;
                    }
                }
            }

            println!();
            println!("=== Submitted {} / {} ===", selected.len() - failed, selected.len());
            if failed > 0 {
                return Ok(ExitCode::FAILURE);
            }
        }

        Commands::Job { config, run } => {
            let sweep = load_config(&config)?;
            let run = sweep.run(&run)?;
            let submitter = Submitter::new(&sweep, Slurm::default(), harness_binary()?);
            let outcome = submitter.run_job(run).await?;
            return Ok(outcome_exit(&outcome));
        }

        Commands::Launch { config, run } => {
            let sweep = load_config(&config)?;
            let run = sweep.run(&run)?;
            let outcome = Launcher::new(&sweep.launcher).launch(run).await?;
            return Ok(outcome_exit(&outcome));
        }

        Commands::Args { config, run, json } => {
            let sweep = load_config(&config)?;
            let run = sweep.run(&run)?;
            let args = run.to_args();
            if json {
                println!("{}", serde_json::to_string(&args)?);
            } else {
                println!("{}", args.join(" "));
                println!(
                    "# log: {}",
                    run.log_path(&sweep.launcher.log_dir).display()
                );
            }
        }

        Commands::Script { config, run } => {
            let sweep = load_config(&config)?;
            let run = sweep.run(&run)?;
            let submitter = Submitter::new(&sweep, Slurm::default(), harness_binary()?);
            print!("{}", submitter.render_script(run));
        }
    }

    Ok(ExitCode::SUCCESS)
}
