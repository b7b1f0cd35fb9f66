//! Upgrade configuration, loaded from an optional TOML file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::schema::{Placeholders, SchemaVersion};

/// Every knob the controllers consult. Missing keys fall back to [UpgradeConfig::default].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct UpgradeConfig {
    /// Path of the forum database.
    pub database: PathBuf,
    /// Where the maintenance state is persisted between invocations.
    pub state_file: PathBuf,
    /// Tool entry point disabled once the tool finishes. Left alone when unset.
    pub script_path: Option<PathBuf>,
    /// Forum installation directory, substituted for `{$boarddir}`.
    pub board_dir: PathBuf,
    /// Public forum URL, substituted for `{$boardurl}`.
    pub board_url: String,
    /// Wall-clock seconds a single invocation may spend before yielding.
    pub time_budget_secs: u64,
    /// Rows processed per batch by data-conversion steps.
    pub batch_size: u64,
    /// Seconds after which another operator may take over an abandoned run.
    pub inactivity_timeout_secs: u64,
    /// How long a statement waits on a locked database.
    pub busy_timeout_ms: u64,
    /// Copy every table before migrating.
    pub backup: bool,
    pub backup_prefix: String,
    /// Put the forum into maintenance mode while upgrading.
    pub maintenance_mode: bool,
    /// Analyze tables after migrating.
    pub optimize: bool,
    /// Version to upgrade or install to.
    pub target: SchemaVersion,
    /// Log every executed step and keep debug detail in the state file.
    pub debug: bool,
    /// Administrator created by the installer.
    pub admin: Option<AdminAccount>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AdminAccount {
    pub name: String,
    pub email: String,
    /// Already-hashed password; the installer stores it verbatim.
    pub password_hash: String,
}

impl Default for UpgradeConfig {
    fn default() -> Self {
        Self {
            database: PathBuf::from("forum.db"),
            state_file: PathBuf::from("upgrade_state.json"),
            script_path: None,
            board_dir: PathBuf::from("."),
            board_url: "http://localhost".to_string(),
            time_budget_secs: 30,
            batch_size: 500,
            inactivity_timeout_secs: 600,
            busy_timeout_ms: 5_000,
            backup: false,
            backup_prefix: "backup_".to_string(),
            maintenance_mode: true,
            optimize: false,
            target: SchemaVersion::latest(),
            debug: false,
            admin: None,
        }
    }
}

impl UpgradeConfig {
    pub fn from_toml(contents: &str) -> Result<Self, Error> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load the configuration at `path`, or the defaults if the file does not exist.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        match std::fs::read_to_string(path.as_ref()) {
            Ok(contents) => Self::from_toml(&contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.batch_size == 0 {
            return Err(Error::fatal("batch-size must be at least 1"));
        }
        if self.backup && self.backup_prefix.is_empty() {
            return Err(Error::fatal("backup-prefix must not be empty when backups are enabled"));
        }
        Ok(())
    }

    pub fn time_budget(&self) -> Duration {
        Duration::from_secs(self.time_budget_secs)
    }

    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout_secs)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    /// Values for the placeholders found in seed rows.
    pub fn placeholders(&self, now: DateTime<Utc>) -> Placeholders {
        Placeholders::new()
            .with("boarddir", self.board_dir.to_string_lossy())
            .with("boardurl", self.board_url.trim_end_matches('/'))
            .with("current_time", now.timestamp().to_string())
            .with("db_prefix", "")
    }
}
