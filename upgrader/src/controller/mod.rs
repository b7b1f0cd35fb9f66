//! The install and upgrade tools: a fixed sequence of phases driven one bounded invocation
//! at a time.
//!
//! Each call to [Controller::invoke] claims the maintenance state for an operator, runs
//! phases until the time budget is spent, a phase asks to be called again or a phase fails,
//! and reports where it stopped. Everything needed to resume lives in the state file, so the
//! driving loop can be interrupted at any point.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::config::UpgradeConfig;
use crate::db::{DatabaseApi, InsertMode, Value};
use crate::error::Error;
use crate::registry::Registry;
use crate::runner::{MigrationRunner, StepPreview};
use crate::schema::{SchemaRegistry, SchemaVersion};
use crate::settings::{SettingKey, Settings};
use crate::state::{MaintenanceState, Operator, StateStore, ToolKind};
use crate::step::{system_clock, Clock, StepContext, TimeBudget};

pub mod install;
pub mod upgrade;

/// Everything a phase handler may touch.
pub struct ToolContext<'a> {
    pub db: &'a mut dyn DatabaseApi,
    pub state: &'a mut MaintenanceState,
    pub store: &'a StateStore,
    pub budget: &'a TimeBudget,
    pub config: &'a UpgradeConfig,
    pub schema: &'a SchemaRegistry,
    pub registry: &'a Registry,
    pub clock: &'a Clock,
}

impl<'a> ToolContext<'a> {
    pub fn settings(&mut self) -> Settings<'_> {
        Settings::new(&mut *self.db)
    }

    pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
        (self.clock)()
    }

    /// Stamp and persist the maintenance state.
    pub fn save(&mut self) -> Result<(), Error> {
        self.state.updated = self.now();
        self.store.save(self.state)
    }

    /// Finish one unit of the current phase and persist the position.
    pub fn advance_substep(&mut self) -> Result<(), Error> {
        self.state.advance_substep();
        self.save()
    }

    /// Borrow this context as the narrower context migration steps run in.
    pub fn step_context(&mut self) -> StepContext<'_> {
        StepContext {
            db: &mut *self.db,
            state: &mut *self.state,
            store: Some(self.store),
            budget: self.budget,
            config: self.config,
            schema: self.schema,
            clock: self.clock,
        }
    }
}

/// Returns true when the phase is complete, false when it must be invoked again.
pub type PhaseHandler = fn(&mut ToolContext<'_>) -> Result<bool, Error>;

/// One coarse stage of a tool.
#[derive(Clone, Copy)]
pub struct Phase {
    pub id: &'static str,
    pub name: &'static str,
    pub title: Option<&'static str>,
    pub handler: PhaseHandler,
    /// Share of the overall progress bar.
    pub weight: u32,
}

impl std::fmt::Debug for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Phase")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("weight", &self.weight)
            .finish()
    }
}

/// How an invocation ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Outcome {
    /// Work remains; invoke again.
    Continue,
    /// Every phase is done and the maintenance state has been cleared.
    Finished,
    /// The current phase failed. Fatal failures need operator action before retrying.
    Failed { message: String, fatal: bool },
    /// Another operator holds the maintenance state.
    Refused { message: String },
}

/// What one invocation did, in the shape the driving loop polls for.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvocationReport {
    pub tool: ToolKind,
    pub phase: String,
    pub phase_name: String,
    pub substep: usize,
    pub total_items: u64,
    pub progress: f64,
    pub skipped: Vec<String>,
    pub outcome: Outcome,
}

/// Drives the phases of one tool.
pub struct Controller {
    tool: ToolKind,
    phases: Vec<Phase>,
    config: UpgradeConfig,
    store: StateStore,
    schema: SchemaRegistry,
    registry: Registry,
    clock: Clock,
    on_phase_complete: Option<Box<dyn Fn(&Phase) + Send + Sync>>,
}

// Manual Debug implementation because closures don't implement Debug
impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("tool", &self.tool)
            .field("phases", &self.phases)
            .field("config", &self.config)
            .field("store", &self.store)
            .field("on_phase_complete", &self.on_phase_complete.is_some())
            .finish()
    }
}

impl Controller {
    fn new(tool: ToolKind, phases: Vec<Phase>, config: UpgradeConfig) -> Self {
        let store = StateStore::new(config.state_file.clone());
        Self {
            tool,
            phases,
            config,
            store,
            schema: SchemaRegistry::builtin(),
            registry: Registry::builtin(),
            clock: system_clock(),
            on_phase_complete: None,
        }
    }

    pub fn upgrade(config: UpgradeConfig) -> Self {
        Self::new(ToolKind::Upgrade, upgrade::phases(), config)
    }

    pub fn install(config: UpgradeConfig) -> Self {
        Self::new(ToolKind::Install, install::phases(), config)
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_registry(mut self, registry: Registry) -> Self {
        self.registry = registry;
        self
    }

    /// Set a callback invoked every time a phase completes.
    pub fn on_phase_complete<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Phase) + Send + Sync + 'static,
    {
        self.on_phase_complete = Some(Box::new(callback));
        self
    }

    pub fn tool(&self) -> ToolKind {
        self.tool
    }

    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    pub fn config(&self) -> &UpgradeConfig {
        &self.config
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// The persisted state of a run in progress, if any.
    pub fn status(&self) -> Result<Option<MaintenanceState>, Error> {
        self.store.load()
    }

    /// Forget the run in progress so the next invocation starts from the first phase.
    pub fn reset(&self) -> Result<(), Error> {
        tracing::warn!(tool = %self.tool, path = %self.store.path().display(), "Resetting maintenance state");
        self.store.reset()
    }

    /// List the migration steps still ahead of the installed forum, without running any.
    /// A run paused inside its migrate phase is previewed from where it will resume.
    pub fn preview(&self, db: &mut dyn DatabaseApi) -> Result<Vec<StepPreview>, Error> {
        let from = installed_version(db)?
            .ok_or_else(|| Error::fatal("no forum installation found in this database"))?;
        let runner = MigrationRunner::new(self.registry.plan(from, self.config.target));

        let now = (self.clock)();
        let mut state = MaintenanceState::new(self.tool, &Operator::new(0, "preview"), now);
        let migrate = self.phases.iter().position(|p| p.id == upgrade::MIGRATE);
        if let Some(saved) = self.store.load()? {
            if saved.tool == self.tool && Some(saved.step) == migrate {
                state.substep = saved.substep;
                state.start = saved.start;
            }
        }

        let budget = TimeBudget::unlimited();
        let mut ctx = StepContext {
            db,
            state: &mut state,
            store: None,
            budget: &budget,
            config: &self.config,
            schema: &self.schema,
            clock: &self.clock,
        };
        runner.preview(&mut ctx)
    }

    /// Overall completion of `state`, weighting each phase by [Phase::weight].
    pub fn progress(&self, state: &MaintenanceState) -> f64 {
        let total: u32 = self.phases.iter().map(|p| p.weight).sum();
        if total == 0 || state.step >= self.phases.len() {
            return 1.0;
        }
        let done: u32 = self.phases[..state.step].iter().map(|p| p.weight).sum();
        let current = self.phases[state.step].weight as f64 * state.substep_fraction();
        ((done as f64 + current) / total as f64).clamp(0.0, 1.0)
    }

    /// Run one bounded invocation on behalf of `operator`.
    pub fn invoke(&self, db: &mut dyn DatabaseApi, operator: &Operator) -> InvocationReport {
        let now = (self.clock)();
        let mut state = match self
            .store
            .claim(self.tool, operator, now, self.config.inactivity_timeout())
        {
            Ok(state) => state,
            Err(error) => {
                let outcome = match error {
                    Error::InProgress { .. } => Outcome::Refused {
                        message: error.to_string(),
                    },
                    _ => Outcome::Failed {
                        message: error.to_string(),
                        fatal: error.is_fatal(),
                    },
                };
                tracing::warn!(tool = %self.tool, operator = %operator.name, "{}", error);
                return self.report(&MaintenanceState::new(self.tool, operator, now), outcome);
            }
        };
        if self.config.debug {
            state.debug = true;
        }

        let outcome = match self.run_phases(db, &mut state) {
            Ok(outcome) => outcome,
            Err(error) => Outcome::Failed {
                message: error.to_string(),
                fatal: error.is_fatal(),
            },
        };
        self.report(&state, outcome)
    }

    fn run_phases(
        &self,
        db: &mut dyn DatabaseApi,
        state: &mut MaintenanceState,
    ) -> Result<Outcome, Error> {
        let budget = TimeBudget::new(self.config.time_budget());
        loop {
            let Some(phase) = self.phases.get(state.step) else {
                self.store.reset()?;
                return Ok(Outcome::Finished);
            };
            let _span = tracing::info_span!("phase", tool = %self.tool, phase = phase.id).entered();

            let result = {
                let mut ctx = ToolContext {
                    db: &mut *db,
                    state: &mut *state,
                    store: &self.store,
                    budget: &budget,
                    config: &self.config,
                    schema: &self.schema,
                    registry: &self.registry,
                    clock: &self.clock,
                };
                (phase.handler)(&mut ctx)
            };

            match result {
                Ok(true) => {
                    tracing::info!("Phase complete");
                    if let Some(ref callback) = self.on_phase_complete {
                        callback(phase);
                    }
                    state.advance_step();
                    if state.step >= self.phases.len() {
                        self.store.reset()?;
                        tracing::info!(tool = %self.tool, "Finished");
                        return Ok(Outcome::Finished);
                    }
                    state.updated = (self.clock)();
                    self.store.save(state)?;
                    if budget.expired() {
                        return Ok(Outcome::Continue);
                    }
                }
                Ok(false) => {
                    state.updated = (self.clock)();
                    self.store.save(state)?;
                    return Ok(Outcome::Continue);
                }
                Err(error) => {
                    tracing::error!(error = %error, fatal = error.is_fatal(), "Phase failed");
                    state.updated = (self.clock)();
                    self.store.save(state)?;
                    return Ok(Outcome::Failed {
                        message: error.to_string(),
                        fatal: error.is_fatal(),
                    });
                }
            }
        }
    }

    fn report(&self, state: &MaintenanceState, outcome: Outcome) -> InvocationReport {
        let phase = self
            .phases
            .get(state.step)
            .or_else(|| self.phases.last());
        InvocationReport {
            tool: self.tool,
            phase: phase.map(|p| p.id.to_string()).unwrap_or_default(),
            phase_name: phase.map(|p| p.name.to_string()).unwrap_or_default(),
            substep: state.substep,
            total_items: state.total_items,
            progress: self.progress(state),
            skipped: state.skipped.clone(),
            outcome,
        }
    }
}

/// The version recorded in the `smfVersion` setting, if the forum is installed.
pub(crate) fn installed_version(db: &mut dyn DatabaseApi) -> Result<Option<SchemaVersion>, Error> {
    let Some(release) = Settings::new(db).get(SettingKey::SmfVersion)? else {
        return Ok(None);
    };
    SchemaVersion::from_release(&release)
        .map(Some)
        .ok_or_else(|| Error::fatal(format!("unsupported installed version '{}'", release)))
}

/// Shared last phase: restore maintenance mode, log the run and disable the tool script.
pub(crate) fn finish(ctx: &mut ToolContext<'_>) -> Result<bool, Error> {
    if let Some(maint) = ctx.state.maint {
        ctx.settings().set(SettingKey::Maintenance, maint.to_string())?;
    }

    let tool = ctx.state.tool.to_string();
    let extra = serde_json::json!({
        "version": ctx.config.target.release(),
        "skipped": ctx.state.skipped.len(),
    })
    .to_string();
    let log_time = ctx.now().timestamp();
    let id_member = ctx.state.user_id;
    let started = ctx.state.started.timestamp();

    // a finish replayed after a crash must not log the run twice
    let logged = ctx.db.query(
        "SELECT COUNT(*) AS n FROM log_actions WHERE id_log = 3 AND action = ?1 AND id_member = ?2 AND log_time >= ?3",
        &[Value::from(tool.as_str()), Value::from(id_member), Value::from(started)],
    )?;
    let already_logged = match logged.first() {
        Some(row) => row.int("n")? > 0,
        None => false,
    };
    if already_logged {
        tracing::info!(%tool, "Run already logged");
    } else {
        ctx.db.insert(
            InsertMode::Insert,
            "log_actions",
            &["id_log", "log_time", "id_member", "ip", "action", "extra"],
            &[vec![
                Value::from(3),
                Value::from(log_time),
                Value::from(id_member),
                Value::from(""),
                Value::from(tool),
                Value::from(extra),
            ]],
            &["id_action"],
        )?;
    }

    if let Some(script) = &ctx.config.script_path {
        disable_script(script);
    }
    Ok(true)
}

/// Remove the tool's entry point, or rename it out of the way if it cannot be removed.
fn disable_script(script: &Path) {
    match std::fs::remove_file(script) {
        Ok(()) => tracing::info!(path = %script.display(), "Removed tool script"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            let mut disabled = PathBuf::from(script);
            disabled.as_mut_os_string().push(".disabled");
            if let Err(rename) = std::fs::rename(script, &disabled) {
                tracing::warn!(
                    path = %script.display(),
                    remove_error = %e,
                    rename_error = %rename,
                    "Could not disable tool script; remove it by hand"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::SqliteDatabase;
    use chrono::{DateTime, Duration, Utc};
    use std::sync::{Arc, Mutex};

    fn fixed_clock(now: Arc<Mutex<DateTime<Utc>>>) -> Clock {
        Arc::new(move || *now.lock().unwrap())
    }

    fn legacy_forum() -> SqliteDatabase {
        let mut db = SqliteDatabase::open_in_memory().unwrap();
        for table in SchemaRegistry::builtin().tables(SchemaVersion::V2_0) {
            db.create_table(table).unwrap();
        }
        Settings::new(&mut db)
            .set(SettingKey::SmfVersion, SchemaVersion::V2_0.release())
            .unwrap();
        db
    }

    fn config(dir: &tempfile::TempDir) -> UpgradeConfig {
        UpgradeConfig {
            state_file: dir.path().join("state.json"),
            inactivity_timeout_secs: 10,
            time_budget_secs: 0,
            ..UpgradeConfig::default()
        }
    }

    #[test]
    fn second_operator_is_refused_until_the_first_goes_idle() {
        let dir = tempfile::tempdir().unwrap();
        let t0 = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let now = Arc::new(Mutex::new(t0));
        let controller = Controller::upgrade(config(&dir)).with_clock(fixed_clock(now.clone()));
        let mut db = legacy_forum();

        let alice = Operator::new(1, "alice");
        let bob = Operator::new(2, "bob");
        assert_eq!(controller.invoke(&mut db, &alice).outcome, Outcome::Continue);

        *now.lock().unwrap() = t0 + Duration::seconds(5);
        let refused = controller.invoke(&mut db, &bob);
        assert!(matches!(refused.outcome, Outcome::Refused { .. }));

        *now.lock().unwrap() = t0 + Duration::seconds(11);
        let accepted = controller.invoke(&mut db, &bob);
        assert_eq!(accepted.outcome, Outcome::Continue);
        let state = controller.status().unwrap().unwrap();
        assert_eq!(state.user_name, "bob");
    }

    #[test]
    fn install_state_blocks_upgrade() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        StateStore::new(config.state_file.clone())
            .save(&MaintenanceState::new(
                ToolKind::Install,
                &Operator::new(1, "alice"),
                Utc::now(),
            ))
            .unwrap();

        let report = Controller::upgrade(config).invoke(&mut legacy_forum(), &Operator::new(1, "alice"));
        assert!(matches!(report.outcome, Outcome::Failed { fatal: true, .. }));
    }

    #[test]
    fn progress_weights_phases() {
        let dir = tempfile::tempdir().unwrap();
        let controller = Controller::upgrade(config(&dir));
        let total: u32 = controller.phases().iter().map(|p| p.weight).sum();
        let mut state = MaintenanceState::new(ToolKind::Upgrade, &Operator::new(1, "alice"), Utc::now());
        assert_eq!(controller.progress(&state), 0.0);

        let migrate = controller
            .phases()
            .iter()
            .position(|p| p.id == "migrate")
            .unwrap();
        state.step = migrate;
        state.total_items = 4;
        state.substep = 2;
        let done: u32 = controller.phases()[..migrate].iter().map(|p| p.weight).sum();
        let expected = (done as f64 + controller.phases()[migrate].weight as f64 * 0.5) / total as f64;
        assert!((controller.progress(&state) - expected).abs() < 1e-9);

        state.substep = 10;
        assert!(controller.progress(&state) <= 1.0);
        state.step = controller.phases().len();
        assert_eq!(controller.progress(&state), 1.0);
    }

    #[test]
    fn failing_phase_does_not_advance() {
        fn broken(_: &mut ToolContext<'_>) -> Result<bool, Error> {
            Err(Error::Generic("disk hiccup".to_string()))
        }
        let dir = tempfile::tempdir().unwrap();
        let mut controller = Controller::upgrade(config(&dir));
        controller.phases = vec![Phase {
            id: "broken",
            name: "Broken",
            title: None,
            handler: broken,
            weight: 1,
        }];

        let mut db = legacy_forum();
        let alice = Operator::new(1, "alice");
        for _ in 0..2 {
            let report = controller.invoke(&mut db, &alice);
            assert_eq!(
                report.outcome,
                Outcome::Failed {
                    message: "disk hiccup".to_string(),
                    fatal: false
                }
            );
            assert_eq!(report.phase, "broken");
        }
        assert_eq!(controller.status().unwrap().unwrap().step, 0);
    }

    #[test]
    fn finish_disables_the_script_and_logs_once() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("upgrade.php");
        std::fs::write(&script, "<?php").unwrap();
        let config = UpgradeConfig {
            script_path: Some(script.clone()),
            ..config(&dir)
        };
        let store = StateStore::new(config.state_file.clone());
        let mut state = MaintenanceState::new(ToolKind::Upgrade, &Operator::new(7, "alice"), Utc::now());
        state.maint = Some(0);
        let mut db = legacy_forum();
        let schema = SchemaRegistry::builtin();
        let registry = Registry::builtin();
        let clock = system_clock();
        let budget = TimeBudget::unlimited();
        let mut ctx = ToolContext {
            db: &mut db,
            state: &mut state,
            store: &store,
            budget: &budget,
            config: &config,
            schema: &schema,
            registry: &registry,
            clock: &clock,
        };

        assert!(finish(&mut ctx).unwrap());
        assert!(!script.exists());
        assert_eq!(
            ctx.settings().get(SettingKey::Maintenance).unwrap().as_deref(),
            Some("0")
        );
        let rows = ctx
            .db
            .query("SELECT id_member, action FROM log_actions", &[])
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].int("id_member").unwrap(), 7);
        assert_eq!(rows[0].text("action").unwrap(), "upgrade");

        // crashed before the state was cleared: finish runs again
        assert!(finish(&mut ctx).unwrap());
        let rows = ctx.db.query("SELECT id_action FROM log_actions", &[]).unwrap();
        assert_eq!(rows.len(), 1);
    }
}
