mod config;
mod pipeline;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use pipeline::{SummaryArgs, TrainArgs};

/// gq-recal: train a neural genotype-quality recalibrator for structural variants.
#[derive(Parser)]
#[command(name = "gq-recal", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Train the recalibrator, resuming from a checkpoint when given one.
    Train(TrainArgs),
    /// Print the loss history and loader cursor stored in a checkpoint.
    Summary(SummaryArgs),
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Train(args) => pipeline::run_train(args),
        Command::Summary(args) => pipeline::run_summary(args),
    }
}
