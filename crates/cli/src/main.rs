//! Skein CLI, the main entry point.
//!
//! Commands:
//! - `status`  Show the effective configuration
//! - `config`  Print, locate, or validate configuration
//! - `replay`  Translate a recorded provider stream into SSE frames
//! - `runs`    Show the run registry summary

use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "skein",
    about = "Skein: agent orchestration runtime",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the effective configuration
    Status,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },

    /// Replay a JSONL recording of provider chunks as SSE frames
    Replay {
        /// Path to the recording, one chunk per line
        file: PathBuf,

        /// Override the model context window used for truncation
        #[arg(long)]
        context_window: Option<usize>,
    },

    /// Print the run registry summary as JSON
    Runs {
        /// Register a few sample runs first
        #[arg(long)]
        demo: bool,
    },
}

#[derive(Subcommand, Clone, Copy)]
enum ConfigAction {
    /// Print the default configuration as TOML
    Default,
    /// Print the loaded configuration as TOML
    Show,
    /// Print the config file path
    Path,
    /// Load and validate the config file
    Validate,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Logs go to stderr so replayed frames stay clean on stdout
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Status => commands::status::run().await?,
        Commands::Config { action } => match action.unwrap_or(ConfigAction::Default) {
            ConfigAction::Default => commands::config_cmd::default().await?,
            ConfigAction::Show => commands::config_cmd::show().await?,
            ConfigAction::Path => commands::config_cmd::path().await?,
            ConfigAction::Validate => commands::config_cmd::validate().await?,
        },
        Commands::Replay {
            file,
            context_window,
        } => commands::replay::run(&file, context_window).await?,
        Commands::Runs { demo } => commands::runs::run(demo).await?,
    }

    Ok(())
}
