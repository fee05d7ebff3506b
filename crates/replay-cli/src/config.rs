//! Configuration loading.

use std::fmt;
use std::path::{Path, PathBuf};

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use replay_core::ReplayOptions;
use serde::{Deserialize, Serialize};

/// Application configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path to the session database.
    pub database_path: PathBuf,

    /// Ingest URL for recorded segments. Without one, segments are only listed.
    pub endpoint: Option<String>,

    /// Engine tunables.
    #[serde(default)]
    pub replay: ReplayOptions,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("database_path", &self.database_path)
            .field("endpoint", &self.endpoint)
            .field("session_sample_rate", &self.replay.session_sample_rate)
            .field("error_sample_rate", &self.replay.error_sample_rate)
            .finish_non_exhaustive()
    }
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs_data_path().unwrap_or_else(|| PathBuf::from("."));
        Self {
            database_path: data_dir.join("replay.db"),
            endpoint: None,
            replay: ReplayOptions::default(),
        }
    }
}

impl Config {
    /// Loads configuration, optionally from a specific file.
    ///
    /// Later sources win: defaults, the user config file, `path`, then
    /// `REPLAYCTL_*` variables (`__` separates nested keys, as in
    /// `REPLAYCTL_REPLAY__SESSION_SAMPLE_RATE`).
    #[expect(
        clippy::result_large_err,
        reason = "figment::Error is large but only returned at startup"
    )]
    pub fn load_from(path: Option<&Path>) -> Result<Self, figment::Error> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Some(config_dir) = dirs_config_path() {
            figment = figment.merge(Toml::file(config_dir.join("config.toml")));
        }

        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }

        figment = figment.merge(Env::prefixed("REPLAYCTL_").split("__"));

        figment.extract()
    }
}

/// Returns the platform-specific config directory for replayctl.
fn dirs_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("replayctl"))
}

/// Returns the platform-specific data directory for replayctl.
///
/// On Linux: `~/.local/share/replayctl`
pub fn dirs_data_path() -> Option<PathBuf> {
    dirs::data_dir().map(|p| p.join("replayctl"))
}
