use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use replay_cli::commands::{session, simulate};
use replay_cli::{Cli, Commands, Config, SessionAction};

/// Load config, ensuring the database directory exists.
fn load_config(config_path: Option<&Path>) -> Result<Config> {
    let config = Config::load_from(config_path).context("failed to load configuration")?;
    tracing::debug!(?config, "loaded configuration");

    if let Some(parent) = config.database_path.parent() {
        std::fs::create_dir_all(parent).context("failed to create database directory")?;
    }
    Ok(config)
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env()
    };
    // try_init so a second initialization (e.g. in tests) is not fatal
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();

    let mut stdout = std::io::stdout().lock();
    match &cli.command {
        Some(Commands::Simulate(args)) => {
            let config = load_config(cli.config.as_deref())?;
            simulate::run(&mut stdout, &config, args)?;
        }
        Some(Commands::Session(action)) => {
            let config = load_config(cli.config.as_deref())?;
            match action {
                SessionAction::Show { json } => session::show(&mut stdout, &config, *json)?,
                SessionAction::Clear => session::clear(&mut stdout, &config)?,
            }
        }
        None => {
            use clap::CommandFactory;
            Cli::command().print_help()?;
            println!();
        }
    }

    Ok(())
}
