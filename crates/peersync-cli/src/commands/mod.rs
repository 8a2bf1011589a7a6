//! CLI command definitions and handlers.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub mod config;
pub mod run;

/// Load configuration with graceful fallback to defaults.
///
/// If the config file doesn't exist or can't be parsed, the defaults are used.
pub fn load_config() -> peersync_core::config::Config {
    match peersync_core::config::Config::load() {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!("Ignoring configuration file: {}", e);
            peersync_core::config::Config::default()
        }
    }
}

/// PeerSync - clipboard and file-drop synchronization between peers
#[derive(Parser)]
#[command(name = "peersync")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Detailed logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand)]
pub enum Command {
    /// Run the sync engine with an interactive prompt
    Run(RunArgs),

    /// Manage configuration
    Config(ConfigArgs),
}

/// Arguments for the run command
#[derive(Parser)]
pub struct RunArgs {
    /// Identity of this device on the overlay
    #[arg(long, env = "PEERSYNC_ID")]
    pub id: String,

    /// Address the stream listener binds to
    #[arg(long, default_value = "0.0.0.0:52600")]
    pub listen: SocketAddr,

    /// Peer to connect to, as ID=HOST:PORT (repeatable)
    #[arg(long = "peer", value_parser = run::parse_peer)]
    pub peers: Vec<(String, SocketAddr)>,

    /// Directory for received files
    #[arg(short = 'd', long)]
    pub download_dir: Option<PathBuf>,

    /// Accept every incoming file drop without asking
    #[arg(long)]
    pub auto_accept: bool,

    /// Do not replicate the clipboard
    #[arg(long)]
    pub no_clipboard: bool,

    /// Output events in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the config command
#[derive(Parser)]
pub struct ConfigArgs {
    /// Config subcommand
    #[command(subcommand)]
    pub action: ConfigAction,
}

/// Config subcommands
#[derive(Subcommand)]
pub enum ConfigAction {
    /// Show all configuration
    Show,

    /// Show the configuration file path
    Path,

    /// Write the default configuration if none exists
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}
