//! Demo server hosting `TestCallset`.
//!
//! Run with: cargo run --bin test-rpc-server -- --bind 127.0.0.1:13001

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tokio::signal;
use tracing::{error, info};

use protorpc::callsets::test_rpc;
use protorpc::logging::init_logging;
use protorpc::{Result, Server, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "test-rpc-server")]
#[command(about = "RPC server hosting TestCallset")]
struct Args {
    /// Address to listen on
    #[arg(short, long)]
    bind: Option<String>,

    /// JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log filter, e.g. "debug"
    #[arg(short, long)]
    log_level: Option<String>,
}

async fn run(config: ServerConfig) -> Result<()> {
    let mut server = Server::new(config.clone());
    let addr = server.bind(&config.bind_address).await?;
    test_rpc::install(&server).await?;
    server.serve().await?;

    info!("Server is running on {}. Press Ctrl+C to stop...", addr);
    signal::ctrl_c().await?;
    server.shutdown().await
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => match ServerConfig::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Exiting due to error: {}", e);
                return ExitCode::from(1);
            }
        },
        None => ServerConfig::default(),
    };
    if let Some(bind) = args.bind {
        config.bind_address = bind;
    }
    if let Some(level) = args.log_level {
        config.log_level = level;
    }

    if let Err(e) = init_logging(&config.log_level) {
        eprintln!("Exiting due to error: {}", e);
        return ExitCode::from(1);
    }

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Exiting due to error: {}", e);
            ExitCode::from(1)
        }
    }
}
