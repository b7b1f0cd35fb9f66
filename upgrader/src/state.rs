//! The persisted maintenance state: the single source of truth for where an interrupted
//! install or upgrade resumes.

use std::fmt;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Which tool owns a maintenance state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolKind {
    Install,
    Upgrade,
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolKind::Install => f.write_str("install"),
            ToolKind::Upgrade => f.write_str("upgrade"),
        }
    }
}

/// The person driving the tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operator {
    pub id: i64,
    pub name: String,
}

impl Operator {
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

/// Progress of an install or upgrade, saved after every unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaintenanceState {
    pub tool: ToolKind,
    pub started: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    #[serde(default)]
    pub debug: bool,
    /// Steps found to be already applied, as `namespace/name`.
    #[serde(default)]
    pub skipped: Vec<String>,
    pub user_id: i64,
    pub user_name: String,
    /// Index of the current phase.
    #[serde(default)]
    pub step: usize,
    /// Position inside the current phase: a table index, or a registry index while migrating.
    #[serde(default)]
    pub substep: usize,
    /// Row offset inside the current migration step.
    #[serde(default)]
    pub start: u64,
    /// Progress denominator for the current phase.
    #[serde(default)]
    pub total_items: u64,
    /// Maintenance mode the forum was in before the tool switched it on.
    #[serde(default)]
    pub maint: Option<i64>,
    /// Fingerprint of the migration plan being executed.
    #[serde(default)]
    pub plan: Option<String>,
}

impl MaintenanceState {
    pub fn new(tool: ToolKind, operator: &Operator, now: DateTime<Utc>) -> Self {
        Self {
            tool,
            started: now,
            updated: now,
            debug: false,
            skipped: Vec::new(),
            user_id: operator.id,
            user_name: operator.name.clone(),
            step: 0,
            substep: 0,
            start: 0,
            total_items: 0,
            maint: None,
            plan: None,
        }
    }

    pub fn current_step(&self) -> usize {
        self.step
    }

    pub fn set_current_step(&mut self, step: usize) {
        self.step = step;
    }

    pub fn current_substep(&self) -> usize {
        self.substep
    }

    pub fn set_current_substep(&mut self, substep: usize) {
        self.substep = substep;
    }

    pub fn current_start(&self) -> u64 {
        self.start
    }

    pub fn set_current_start(&mut self, start: u64) {
        self.start = start;
    }

    /// Move to the next phase, clearing every per-phase counter.
    pub fn advance_step(&mut self) {
        self.step += 1;
        self.substep = 0;
        self.start = 0;
        self.total_items = 0;
    }

    /// Move to the next unit of the current phase.
    pub fn advance_substep(&mut self) {
        self.substep += 1;
        self.start = 0;
    }

    /// Fraction of the current phase that is done, in `[0, 1]`.
    pub fn substep_fraction(&self) -> f64 {
        if self.total_items == 0 {
            return 0.0;
        }
        (self.substep as f64 / self.total_items as f64).clamp(0.0, 1.0)
    }

    pub fn record_skipped(&mut self, id: impl Into<String>) {
        let id = id.into();
        if !self.skipped.contains(&id) {
            self.skipped.push(id);
        }
    }
}

/// A maintenance state kept in a JSON file.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the state. A missing or empty file means no operation is in progress.
    pub fn load(&self) -> Result<Option<MaintenanceState>, Error> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if content.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&content)?))
    }

    /// Write the state through a synced temporary file and a rename, so a crash mid-write
    /// leaves the previous state intact.
    pub fn save(&self, state: &MaintenanceState) -> Result<(), Error> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(state)?;

        let tmp_path = self.temp_path();
        let mut tmp_file = File::create(&tmp_path)?;
        tmp_file.write_all(json.as_bytes())?;
        tmp_file.sync_all()?;
        drop(tmp_file);

        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    /// Forget any operation in progress.
    pub fn reset(&self) -> Result<(), Error> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Take ownership of the maintenance state for `operator`.
    ///
    /// A state owned by someone else is refused while its owner was active within
    /// `inactivity`; once that window has passed the run is taken over. A state belonging to
    /// the other tool is always refused.
    pub fn claim(
        &self,
        tool: ToolKind,
        operator: &Operator,
        now: DateTime<Utc>,
        inactivity: Duration,
    ) -> Result<MaintenanceState, Error> {
        let mut state = match self.load()? {
            None => {
                tracing::info!(%tool, operator = %operator.name, "Starting new maintenance run");
                MaintenanceState::new(tool, operator, now)
            }
            Some(state) => {
                if state.tool != tool {
                    return Err(Error::fatal(format!(
                        "an {} started by {} is in progress; reset it before running the {}",
                        state.tool, state.user_name, tool
                    )));
                }
                state
            }
        };

        if state.user_id != operator.id {
            let seconds_ago = (now - state.updated).num_seconds();
            if seconds_ago <= inactivity.as_secs() as i64 {
                return Err(Error::InProgress {
                    user_name: state.user_name,
                    seconds_ago,
                });
            }
            tracing::warn!(
                previous = %state.user_name,
                operator = %operator.name,
                seconds_ago,
                "Taking over inactive maintenance run"
            );
            state.user_id = operator.id;
            state.user_name = operator.name.clone();
        }

        state.updated = now;
        self.save(&state)?;
        Ok(state)
    }

    fn temp_path(&self) -> PathBuf {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        PathBuf::from(tmp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn missing_and_empty_files_load_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        assert_eq!(store.load().unwrap(), None);
        fs::write(store.path(), "  \n").unwrap();
        assert_eq!(store.load().unwrap(), None);
        fs::write(store.path(), "{not json").unwrap();
        assert!(store.load().unwrap_err().is_fatal());
    }

    #[test]
    fn save_then_load_keeps_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("nested").join("state.json"));
        let mut state = MaintenanceState::new(ToolKind::Upgrade, &Operator::new(1, "alice"), t0());
        state.set_current_step(3);
        state.set_current_substep(4);
        state.set_current_start(5000);
        state.record_skipped("v2_1/Adding new tables");
        state.record_skipped("v2_1/Adding new tables");
        store.save(&state).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded, state);
        assert_eq!(loaded.skipped.len(), 1);
        assert!(!dir.path().join("nested").join("state.json.tmp").exists());

        store.reset().unwrap();
        store.reset().unwrap();
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn second_operator_is_refused_until_inactive() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        let alice = Operator::new(1, "alice");
        let bob = Operator::new(2, "bob");
        let timeout = Duration::from_secs(10);

        store.claim(ToolKind::Upgrade, &alice, t0(), timeout).unwrap();

        let refused = store
            .claim(ToolKind::Upgrade, &bob, t0() + chrono::Duration::seconds(5), timeout)
            .unwrap_err();
        assert_eq!(
            refused,
            Error::InProgress {
                user_name: "alice".to_string(),
                seconds_ago: 5
            }
        );

        let state = store
            .claim(ToolKind::Upgrade, &bob, t0() + chrono::Duration::seconds(11), timeout)
            .unwrap();
        assert_eq!(state.user_id, 2);
        assert_eq!(state.user_name, "bob");
        assert_eq!(store.load().unwrap().unwrap().user_name, "bob");
    }

    #[test]
    fn owner_may_always_resume() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        let alice = Operator::new(1, "alice");
        let timeout = Duration::from_secs(10);
        let mut state = store.claim(ToolKind::Upgrade, &alice, t0(), timeout).unwrap();
        state.substep = 2;
        store.save(&state).unwrap();

        let resumed = store
            .claim(ToolKind::Upgrade, &alice, t0() + chrono::Duration::seconds(1), timeout)
            .unwrap();
        assert_eq!(resumed.substep, 2);
        assert_eq!(resumed.started, t0());
    }

    #[test]
    fn other_tool_state_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        let alice = Operator::new(1, "alice");
        store
            .claim(ToolKind::Install, &alice, t0(), Duration::from_secs(10))
            .unwrap();
        let error = store
            .claim(ToolKind::Upgrade, &alice, t0(), Duration::from_secs(10))
            .unwrap_err();
        assert!(error.is_fatal());
    }
}
