//! # zipdrop
//!
//! A small HTTP service that accepts ZIP archive uploads and stores them in a
//! local directory.
//!
//! Uploads are streamed: the multipart body is parsed as it arrives, the
//! declared content type is checked before the first byte is written, the
//! size ceiling is enforced chunk by chunk, and a client that disconnects
//! mid-transfer leaves nothing behind on disk. The `run` function parses the
//! command line, loads the configuration, sets up logging and serves until
//! the process is stopped.
pub mod cli;
pub mod config;
pub mod error;
pub mod handlers;
pub mod http;
pub mod lifecycle;
pub mod middleware;
pub mod multipart;
pub mod naming;
pub mod outcome;
pub mod router;
pub mod server;
pub mod storage;
pub mod upload;
pub mod utils;
pub mod validation;

use crate::cli::Cli;
use crate::config::Config;
use clap::Parser;
use env_logger::Env;
use log::error;

/// Parses the command line, loads the configuration (CLI > INI > defaults),
/// initializes logging and runs the server. Exits the process on failure.
pub fn run() {
    let cli = Cli::parse();

    let config = match Config::load(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(1);
        }
    };

    // RUST_LOG still wins over the configured level
    let log_level = config.log_level();
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level)).init();
    log::debug!("Log level set to: {log_level}");
    config.log_source();

    if config.verbose {
        config.print_summary();
    }

    if let Err(e) = server::run_server(config, None, None) {
        error!("Server error: {e}");
        std::process::exit(1);
    }
}
