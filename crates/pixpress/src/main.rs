//! Pixpress CLI - queue-driven batch image compression worker.
//!
//! Pixpress transcodes uploaded images to a compact format in batches pulled
//! from a work queue, keeping per-file retry state in a SQLite task table.
//!
//! # Usage
//!
//! ```bash
//! # Register an image as a pending task
//! pixpress add ./photo.png
//!
//! # Run the queue consumer until Ctrl-C
//! pixpress serve
//!
//! # Compress specific tasks directly
//! pixpress compress 1 2 3
//!
//! # View configuration
//! pixpress config show
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use pixpress_core::Config;

mod cli;
mod logging;

/// Pixpress - queue-driven batch image compression worker.
#[derive(Parser, Debug)]
#[command(name = "pixpress")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose (debug) logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output logs in JSON format
    #[arg(long, global = true)]
    json_logs: bool,

    /// Config file to use instead of the default location
    #[arg(long, global = true, env = "PIXPRESS_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Commands {
    /// Consume the work queue and compress batches until interrupted
    Serve(cli::serve::ServeArgs),

    /// Copy an image into storage and register it as a pending task
    Add(cli::add::AddArgs),

    /// Compress the given task ids once and print the report
    Compress(cli::compress::CompressArgs),

    /// Delete transcoded sources that are awaiting cleanup
    Sweep,

    /// View and manage configuration
    Config(cli::config::ConfigArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logging isn't initialized yet, so use eprintln for config warnings.
    let config = match &cli.config {
        Some(path) => Config::load_from(&cli::expand_path(path))?,
        None => match Config::load() {
            Ok(config) => config,
            Err(e) => {
                eprintln!(
                    "Warning: Failed to load config: {e}\n  \
                     Using default configuration. Check your config file with `pixpress config path`."
                );
                Config::default()
            }
        },
    };
    logging::init_from_config(&config, cli.verbose, cli.json_logs);

    tracing::debug!("Pixpress v{}", pixpress_core::VERSION);

    match cli.command {
        Commands::Serve(args) => cli::serve::execute(args, config).await,
        Commands::Add(args) => cli::add::execute(args, &config).await,
        Commands::Compress(args) => cli::compress::execute(args, config).await,
        Commands::Sweep => cli::sweep::execute(&config).await,
        Commands::Config(args) => cli::config::execute(args, &config, cli.config.as_deref()).await,
    }
}
