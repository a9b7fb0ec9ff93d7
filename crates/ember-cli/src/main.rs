//! Ember CLI - run and manage the local inference server.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

/// Ember - local AI chat server manager
#[derive(Parser)]
#[command(name = "ember")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the inference server and keep it running until Ctrl-C
    Serve {
        /// Model identifier passed to the server
        #[arg(short, long)]
        model: String,
        /// First port to try
        #[arg(short, long)]
        port: Option<u16>,
        /// Run the server module from a source checkout
        #[arg(long)]
        dev: bool,
        /// Project root holding the server module (implies --dev)
        #[arg(long)]
        server_dir: Option<PathBuf>,
        /// Adapter weights to load on top of the model
        #[arg(long)]
        adapter_file: Option<PathBuf>,
        /// Print status as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the first free port at or above a starting port
    FindPort {
        /// Port to start searching from
        #[arg(long, default_value_t = ember_server::DEFAULT_PORT)]
        from: u16,
        /// Number of ports to try
        #[arg(long, default_value_t = 1000)]
        attempts: u16,
    },

    /// Kill processes left listening on a port
    Cleanup {
        /// Port to clear
        #[arg(short, long)]
        port: u16,
    },

    /// Show the resolved server configuration
    Info,
}

fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let filter = if cli.verbose { "debug" } else { "info" };
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .without_time()
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();

    match cli.command {
        Commands::Serve {
            model,
            port,
            dev,
            server_dir,
            adapter_file,
            json,
        } => {
            let options = commands::serve::ServeOptions {
                model,
                port,
                dev,
                server_dir,
                adapter_file,
                json,
            };
            runtime()?.block_on(commands::serve::run(options))
        }
        Commands::FindPort { from, attempts } => {
            runtime()?.block_on(commands::find_port::run(from, attempts))
        }
        Commands::Cleanup { port } => commands::cleanup::run(port),
        Commands::Info => commands::info::run(),
    }
}

fn runtime() -> miette::Result<tokio::runtime::Runtime> {
    tokio::runtime::Runtime::new()
        .map_err(|e| miette::miette!("Failed to start async runtime: {}", e))
}
