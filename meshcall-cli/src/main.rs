//! Meshcall CLI Application

use anyhow::Result;
use clap::{Parser, Subcommand};
use meshcall_core::types::CallType;
use simulation::SimulationOptions;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod config;
mod simulation;

const DEFAULT_LOG_FILTER: &str = "meshcall=info";

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// TOML engine configuration
    #[arg(short, long, env = "MESHCALL_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Log filter, e.g. "meshcall_core=debug" (falls back to RUST_LOG)
    #[arg(long, global = true)]
    log: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a call between in-process participants
    Simulate {
        /// Number of participants, initiator included
        #[arg(short, long, default_value_t = 3)]
        participants: usize,

        /// Start a video call instead of audio only
        #[arg(long)]
        video: bool,

        /// Seconds the call runs before the initiator ends it
        #[arg(long, default_value_t = 5)]
        duration_secs: u64,
    },

    /// Print the effective configuration
    Config,
}

fn init_tracing(directive: Option<&str>) {
    let filter = match directive {
        Some(directive) => EnvFilter::new(directive),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log.as_deref());

    let engine_config = config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Simulate {
            participants,
            video,
            duration_secs,
        } => {
            let options = SimulationOptions {
                participants,
                call_type: if video { CallType::Video } else { CallType::Audio },
                duration: Duration::from_secs(duration_secs),
            };
            println!(
                "🔗 Simulating a {} call with {} participants",
                options.call_type.as_str(),
                options.participants
            );
            let summaries = simulation::run(&engine_config, &options).await?;
            let connected = summaries.iter().filter(|s| s.fully_connected()).count();
            println!("✅ {connected}/{} participants fully connected", summaries.len());
        }
        Commands::Config => {
            print!("{}", config::render(&engine_config)?);
        }
    }

    Ok(())
}
