//! CLI arguments module
//!
//! Defines command-line argument parsing using clap.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use crate::config::ClientConfig;

/// CLI arguments for the swarm client
#[derive(Debug, Parser)]
#[command(name = "swarm-torrent")]
#[command(about = "Download and seed a torrent", long_about = None)]
pub struct CliArgs {
    /// Path to the .torrent file
    #[arg(value_name = "TORRENT_FILE")]
    pub torrent_file: PathBuf,

    /// JSON configuration file; flags override its values
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Download directory
    #[arg(short, long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Listening port for incoming connections
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Maximum number of peer connections
    #[arg(short, long)]
    pub max_peers: Option<usize>,

    /// Do not accept inbound peer connections
    #[arg(long)]
    pub no_listen: bool,

    /// Extra peer to dial (host:port); may be repeated
    #[arg(long = "peer", value_name = "ADDR")]
    pub peers: Vec<String>,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Quiet mode (no output except errors)
    #[arg(short, long)]
    pub quiet: bool,
}

impl CliArgs {
    /// Parse CLI arguments from command line
    pub fn parse_args() -> Self {
        Self::parse()
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Get the log level based on verbosity settings
    pub fn log_level(&self) -> tracing::Level {
        if self.verbose {
            tracing::Level::DEBUG
        } else if self.quiet {
            tracing::Level::ERROR
        } else {
            tracing::Level::INFO
        }
    }

    /// Build the client configuration: file (or defaults), then flags
    pub fn to_config(&self) -> Result<ClientConfig> {
        let mut config = match &self.config {
            Some(path) => ClientConfig::from_file(path)?,
            None => ClientConfig::default(),
        };

        if let Some(dir) = &self.output_dir {
            config.output_dir = dir.clone();
        }
        if let Some(port) = self.port {
            config.listen_port = port;
        }
        if let Some(max_peers) = self.max_peers {
            config.max_peers = max_peers;
        }
        if self.no_listen {
            config.accept_inbound = false;
        }

        config.validate()?;
        Ok(config)
    }
}
