//! CLI application for calling Test RPCs.
//!
//! Run with: cargo run --bin test-rpc -- 192.168.1.20 --port 13001

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::error;

use protorpc::callsets::test_rpc;
use protorpc::logging::init_logging;
use protorpc::{ClientConfig, Result};

#[derive(Parser, Debug)]
#[command(name = "test-rpc")]
#[command(about = "CLI application for calling Test RPCs")]
struct Args {
    /// Remote address of the RPC server (ip, ip:port, host or host:port)
    ip: Option<String>,

    /// Remote port when the address does not carry one
    #[arg(short, long)]
    port: Option<u16>,

    /// JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log filter, e.g. "debug" or "protorpc=trace"
    #[arg(short, long)]
    log_level: Option<String>,

    /// Per-call timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Send setstruct without waiting for its reply
    #[arg(long)]
    no_reply: bool,
}

fn load_config(args: &Args) -> Result<ClientConfig> {
    let mut config = match &args.config {
        Some(path) => ClientConfig::from_file(path)?,
        None => ClientConfig::default(),
    };
    if let Some(ip) = &args.ip {
        config.address = Some(ip.clone());
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(level) = &args.log_level {
        config.log_level = level.clone();
    }
    if let Some(timeout) = args.timeout_ms {
        config.call_timeout_ms = Some(timeout);
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            let _ = init_logging("info");
            error!("Exiting due to error: {}", e);
            return ExitCode::from(1);
        }
    };
    if let Err(e) = init_logging(&config.log_level) {
        eprintln!("Exiting due to error: {}", e);
        return ExitCode::from(1);
    }

    match test_rpc::run_client(&config, args.no_reply).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Exiting due to error: {}", e);
            ExitCode::from(1)
        }
    }
}
