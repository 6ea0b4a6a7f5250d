use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

#[derive(Parser)]
#[command(name = "quickchat")]
#[command(about = "QuickChat CLI - conversation sync engine playground", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Play a two-user conversation against an in-memory store
    Demo {
        /// Settings file (defaults to the user config directory)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Demo { config } => commands::demo::run(config.as_deref()).await?,
    }

    Ok(())
}
