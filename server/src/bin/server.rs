//! Echo server binary.

use clap::Parser;
use server::{Config, logging, signal};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "echo-server")]
#[command(about = "Round-robin accept-and-echo server")]
struct Args {
    /// Path to configuration file
    config: Option<PathBuf>,

    /// Override the listen port from the configuration
    #[arg(long)]
    port: Option<u16>,
}

fn main() {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("failed to load config: {e}");
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };
    if let Some(port) = args.port {
        config.listener.address = None;
        config.listener.port = port;
    }

    logging::init(&config.logging);

    let shutdown = signal::install_signal_handler();
    if let Err(e) = server::run(&config, shutdown) {
        tracing::error!("server error: {e}");
        std::process::exit(1);
    }
}
