//! CLI module
//!
//! Command-line interface for the swarm client.

pub mod args;

pub use args::CliArgs;
