mod config;
mod logging;
mod serve;

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};

use crate::config::{FileConfig, Overrides, Settings};

/// Scenario tooling fabric and pipeline state server.
#[derive(Parser)]
#[command(
    name = "fabric",
    version,
    about = "Scenario tooling fabric and pipeline state server"
)]
struct Cli {
    /// Optional TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level (overrides RUST_LOG)
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Name of the hosting scenario
    #[arg(long, global = true, env = "FABRIC_SCENARIO")]
    scenario: Option<String>,

    /// State directory root (default: $HOME/.vrooli/<scenario>)
    #[arg(long, global = true, env = "DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Peer scenario whose tools are discovered (repeatable or comma separated)
    #[arg(
        long = "peer",
        global = true,
        env = "FABRIC_PEERS",
        value_delimiter = ','
    )]
    peers: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Port to listen on (default: 8095)
        #[arg(long, env = "FABRIC_PORT")]
        port: Option<u16>,
    },

    /// Print availability of every peer scenario as JSON
    Status,

    /// Print the aggregated tool definitions of every peer as JSON
    Tools,
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let file = match &cli.config {
        Some(path) => match config::load_file(path) {
            Ok(file) => file,
            Err(e) => {
                eprintln!("error: {}", e);
                process::exit(1);
            }
        },
        None => FileConfig::default(),
    };
    let port = match &cli.command {
        Commands::Serve { port } => *port,
        _ => None,
    };
    let overrides = Overrides {
        port,
        scenario: cli.scenario,
        data_dir: cli.data_dir,
        peers: cli.peers,
    };
    let settings = match Settings::resolve(overrides, file) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("error: {}", e);
            process::exit(1);
        }
    };

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: failed to create tokio runtime: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Serve { .. } => rt.block_on(serve::start_server(settings)),
        Commands::Status => rt.block_on(cmd_status(settings)),
        Commands::Tools => rt.block_on(cmd_tools(settings)),
    };
    if let Err(e) = result {
        eprintln!("error: {}", e);
        process::exit(1);
    }
}

async fn cmd_status(settings: Settings) -> Result<(), Box<dyn std::error::Error>> {
    let (registry, _) = serve::build_tooling(&settings);
    let statuses = serve::tools::scenario_statuses(&registry).await;
    println!("{}", serde_json::to_string_pretty(&statuses)?);
    Ok(())
}

async fn cmd_tools(settings: Settings) -> Result<(), Box<dyn std::error::Error>> {
    let (registry, _) = serve::build_tooling(&settings);
    let report = registry.refresh().await;
    for (scenario, error) in &report.errors {
        eprintln!("warning: {}: {}", scenario, error);
    }
    println!(
        "{}",
        serde_json::to_string_pretty(&registry.tool_definitions())?
    );
    Ok(())
}
