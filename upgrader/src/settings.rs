//! Typed access to the forum's `settings(variable, value)` table.

use crate::db::{DatabaseApi, InsertMode, Value};
use crate::error::Error;

pub const SETTINGS_TABLE: &str = "settings";

/// Settings the upgrade engine reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SettingKey {
    /// Release string of the installed schema, eg. "2.1.4".
    SmfVersion,
    /// Maintenance mode: 0 off, 1 on with a notice, 2 closed.
    Maintenance,
    /// Set once attachment hashes have been filled in for every attachment.
    AttachmentsDone21,
    /// JSON list of custom profile fields shown on the profile and in posts.
    DisplayFields,
    /// Default forum language.
    Language,
    BoardUrl,
    /// Days after which read alerts are purged.
    AlertsAutoPurge,
    /// Unix timestamp written at install time.
    InstalledTime,
    /// Whether the forum collects and displays alerts.
    EnableAlerts,
    /// Gravatar support, defaulted on by the 2.1 upgrade.
    GravatarEnabled,
    /// Legacy 2.0 setting that 2.1 removed.
    EnableOpenId,
    /// Legacy 2.0 setting that 2.1 removed.
    SecretQuestion,
}

impl SettingKey {
    pub const fn as_str(&self) -> &'static str {
        match self {
            SettingKey::SmfVersion => "smfVersion",
            SettingKey::Maintenance => "maintenance_mode",
            SettingKey::AttachmentsDone21 => "attachments_21_done",
            SettingKey::DisplayFields => "displayFields",
            SettingKey::Language => "language",
            SettingKey::BoardUrl => "boardurl",
            SettingKey::AlertsAutoPurge => "alerts_auto_purge",
            SettingKey::InstalledTime => "installed_time",
            SettingKey::EnableAlerts => "enable_alerts",
            SettingKey::GravatarEnabled => "gravatarEnabled",
            SettingKey::EnableOpenId => "enableOpenID",
            SettingKey::SecretQuestion => "enable_secret_question",
        }
    }
}

impl std::fmt::Display for SettingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Settings store over a borrowed database handle.
pub struct Settings<'a> {
    db: &'a mut dyn DatabaseApi,
}

impl<'a> Settings<'a> {
    pub fn new(db: &'a mut dyn DatabaseApi) -> Self {
        Self { db }
    }

    pub fn get(&mut self, key: SettingKey) -> Result<Option<String>, Error> {
        self.get_raw(key.as_str())
    }

    /// Read a setting by its raw variable name. Missing settings table reads as unset.
    pub fn get_raw(&mut self, variable: &str) -> Result<Option<String>, Error> {
        if !self.db.table_exists(SETTINGS_TABLE)? {
            return Ok(None);
        }
        let rows = self.db.query(
            "SELECT value FROM settings WHERE variable = ?1",
            &[Value::from(variable)],
        )?;
        rows.first().map(|row| row.text("value")).transpose()
    }

    pub fn set(&mut self, key: SettingKey, value: impl Into<String>) -> Result<(), Error> {
        self.write(InsertMode::Replace, key.as_str(), value.into())?;
        Ok(())
    }

    /// Store `value` unless the setting already exists. Returns whether it was written.
    pub fn set_if_missing(
        &mut self,
        key: SettingKey,
        value: impl Into<String>,
    ) -> Result<bool, Error> {
        Ok(self.write(InsertMode::Ignore, key.as_str(), value.into())? > 0)
    }

    pub fn remove(&mut self, key: SettingKey) -> Result<bool, Error> {
        self.remove_raw(key.as_str())
    }

    pub fn remove_raw(&mut self, variable: &str) -> Result<bool, Error> {
        let removed = self.db.execute(
            "DELETE FROM settings WHERE variable = ?1",
            &[Value::from(variable)],
        )?;
        Ok(removed > 0)
    }

    fn write(&mut self, mode: InsertMode, variable: &str, value: String) -> Result<usize, Error> {
        self.db.insert(
            mode,
            SETTINGS_TABLE,
            &["variable", "value"],
            &[vec![Value::from(variable), Value::from(value)]],
            &["variable"],
        )
    }
}
