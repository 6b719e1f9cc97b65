mod commands;
mod file_store;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "machineflow")]
#[command(about = "Converge Azure machines from declarative definitions", long_about = None)]
struct Cli {
    /// Configuration file (default: discovered)
    #[arg(short, long, global = true, env = "MACHINEFLOW_CONFIG")]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Machine operations
    #[command(subcommand)]
    Machine(MachineCommand),
    /// Cluster infrastructure operations
    #[command(subcommand)]
    Cluster(ClusterCommand),
    /// Show version information
    Version,
}

#[derive(Subcommand)]
pub enum MachineCommand {
    /// Create or converge a machine
    Reconcile {
        namespace: String,
        name: String,
        /// Keep going while the VM is still provisioning
        #[arg(short, long)]
        wait: bool,
    },
    /// Delete a machine and its cloud resources
    Delete { namespace: String, name: String },
    /// Show the recorded status of a machine
    Status { namespace: String, name: String },
}

#[derive(Subcommand)]
pub enum ClusterCommand {
    /// Create the resource group and virtual network
    Reconcile { namespace: String, name: String },
    /// Delete the cluster infrastructure it owns
    Delete { namespace: String, name: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    if matches!(cli.command, Commands::Version) {
        println!("machineflow {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let settings = machineflow_config::Settings::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Machine(command) => commands::machine::handle(&settings, command).await,
        Commands::Cluster(command) => commands::cluster::handle(&settings, command).await,
        Commands::Version => Ok(()),
    }
}
