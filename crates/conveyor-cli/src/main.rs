//! Conveyor command-line driver
//!
//! Runs synthetic workloads against the scheduler and manages its
//! configuration files.

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "conveyor")]
#[command(about = "Cooperative stage scheduler workload driver", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run many tasks that sleep a random time between stages
    Bench {
        /// Number of tasks
        #[arg(short, long, default_value_t = 100_000)]
        tasks: usize,
        /// Number of lines; defaults to the configuration or the CPU count
        #[arg(short, long)]
        lines: Option<usize>,
        /// Delayed stages per task
        #[arg(short, long, default_value_t = 4)]
        stages: usize,
        /// Shortest delay in milliseconds
        #[arg(long, default_value_t = 500)]
        min_ms: u64,
        /// Longest delay in milliseconds
        #[arg(long, default_value_t = 1_500)]
        max_ms: u64,
        /// Scheduler configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Seconds to wait for shutdown after the last task reported
        #[arg(long, default_value_t = 60)]
        timeout: u64,
    },

    /// Print the default configuration
    Config {
        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_thread_names(true)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Bench {
            tasks,
            lines,
            stages,
            min_ms,
            max_ms,
            config,
            timeout,
        } => commands::bench::execute(commands::bench::BenchArgs {
            tasks,
            lines,
            stages,
            min_ms,
            max_ms,
            config,
            timeout,
        }),

        Commands::Config { output } => commands::config::execute(output),
    }
}
