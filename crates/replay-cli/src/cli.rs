//! Command-line argument definitions.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Session replay engine driver.
///
/// Replays scripted page timelines through the recording engine and inspects
/// the sticky session it leaves behind.
#[derive(Debug, Parser)]
#[command(name = "replayctl", version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to config file.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run a JSON-lines page timeline through the engine.
    ///
    /// Each run is one page load; running again against the same database
    /// behaves like a reload.
    Simulate(SimulateArgs),

    /// Inspect or clear the persisted session.
    #[command(subcommand)]
    Session(SessionAction),
}

#[derive(Debug, Args)]
pub struct SimulateArgs {
    /// Timeline script, one JSON step per line.
    pub script: PathBuf,

    /// Upload segments to this URL instead of only listing them.
    #[arg(long)]
    pub endpoint: Option<String>,

    /// Output as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Session subcommands.
#[derive(Debug, Subcommand)]
pub enum SessionAction {
    /// Print the persisted session.
    Show {
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Remove the persisted session.
    Clear,
}

#[cfg(test)]
mod tests {
    use super::*;

    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_simulate_with_endpoint() {
        let cli = Cli::parse_from([
            "replayctl",
            "simulate",
            "page.jsonl",
            "--endpoint",
            "http://localhost:9000/replay",
            "--json",
        ]);
        let Some(Commands::Simulate(args)) = cli.command else {
            panic!("expected simulate");
        };
        assert_eq!(args.script, PathBuf::from("page.jsonl"));
        assert_eq!(args.endpoint.as_deref(), Some("http://localhost:9000/replay"));
        assert!(args.json);
    }

    #[test]
    fn parses_session_show() {
        let cli = Cli::parse_from(["replayctl", "-v", "session", "show", "--json"]);
        assert!(cli.verbose);
        assert!(matches!(
            cli.command,
            Some(Commands::Session(SessionAction::Show { json: true }))
        ));
    }
}
