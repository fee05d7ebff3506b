//! CLI subcommand implementations.

pub mod session;
pub mod simulate;
