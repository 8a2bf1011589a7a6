//! PeerSync CLI - clipboard and file-drop synchronization between peers
//!
//! Runs one sync engine over TCP and drives it from an interactive prompt.
//!
//! ## Quick Start
//!
//! ```bash
//! # On the desk
//! peersync run --id desk --listen 0.0.0.0:52600 --peer laptop=192.168.1.20:52600
//!
//! # On the laptop
//! peersync run --id laptop --listen 0.0.0.0:52600 --peer desk=192.168.1.10:52600
//! ```

#![allow(clippy::doc_markdown)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::unused_async)]

use anyhow::Result;
use clap::Parser;

mod commands;
pub mod ui;

use commands::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Command::Run(args) => commands::run::run(args).await,
        Command::Config(args) => commands::config::run(&args),
    }
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let default = if verbose {
        "info,peersync=debug,peersync_core=debug"
    } else {
        "warn,peersync=info,peersync_core=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).without_time())
        .with(filter)
        .init();
}
