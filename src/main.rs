//! Repartir CLI - distributed-inference coordination
//!
//! Spawns a full world of ranks over an in-process fabric and drives one
//! coordinated inference invocation: topology construction, collective
//! handle bootstrap, warm-up, a timed pass, and the root-rank report.
//!
//! # Commands
//!
//! - `run` - Coordinate a multi-rank inference run

use clap::{Parser, Subcommand};
use repartir::cli::{run_command, RunArgs};

/// Repartir - distributed-inference coordination for sharded models
#[derive(Parser)]
#[command(name = "repartir")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Coordinate a multi-rank inference run over a local fabric
    ///
    /// Examples:
    ///   repartir run --tensor-para-size 2 --pipeline-para-size 2
    ///   repartir run --batch-size 2 --beam-width 4 --input-csv start_ids.csv
    Run(RunArgs),
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => match run_command(&args) {
            Ok(report) => {
                if args.json {
                    match serde_json::to_string_pretty(&report) {
                        Ok(rendered) => println!("{rendered}"),
                        Err(e) => {
                            eprintln!("[ERROR] could not render report: {e}");
                            std::process::exit(1);
                        }
                    }
                }
            }
            Err(e) => {
                eprintln!("[ERROR] {e}");
                std::process::exit(1);
            }
        },
    }
}
