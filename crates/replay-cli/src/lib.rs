//! `replayctl` library.
//!
//! Argument parsing, configuration and the subcommands behind the binary.

mod cli;
pub mod commands;
mod config;

pub use cli::{Cli, Commands, SessionAction, SimulateArgs};
pub use config::Config;
