use std::time::{Duration, Instant};

use serde::Serialize;

use crate::error::Error;
use crate::registry::MigrationPlan;
use crate::step::StepContext;

/// Whether a run reached the end of its plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// More work remains; invoke again.
    Continue,
    Complete,
}

/// Represents a failure of one step during a run.
#[derive(Debug, PartialEq)]
pub struct StepFailure {
    pub id: String,
    pub position: usize,
    pub error: Error,
}

/// A report of actions performed during one run.
#[derive(Debug, PartialEq)]
pub struct RunReport {
    pub status: RunStatus,
    pub completed: Vec<String>,
    pub skipped: Vec<String>,
    pub failing_step: Option<StepFailure>,
}

/// One line of [MigrationRunner::preview].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepPreview {
    pub position: usize,
    pub id: String,
    pub description: Option<&'static str>,
    pub candidate: bool,
    /// Whether this is the step a partially finished run will resume.
    pub resuming: bool,
}

/// Executes a [MigrationPlan] against a [StepContext], resuming at the saved position.
pub struct MigrationRunner {
    plan: MigrationPlan,
    on_step_start: Option<Box<dyn Fn(&str) + Send + Sync>>,
    on_step_complete: Option<Box<dyn Fn(&str, Duration) + Send + Sync>>,
    on_step_skipped: Option<Box<dyn Fn(&str) + Send + Sync>>,
    on_step_error: Option<Box<dyn Fn(&str, &Error) + Send + Sync>>,
}

// Manual Debug implementation because closures don't implement Debug
impl std::fmt::Debug for MigrationRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationRunner")
            .field("plan", &self.plan)
            .field("on_step_start", &self.on_step_start.is_some())
            .field("on_step_complete", &self.on_step_complete.is_some())
            .field("on_step_skipped", &self.on_step_skipped.is_some())
            .field("on_step_error", &self.on_step_error.is_some())
            .finish()
    }
}

impl MigrationRunner {
    pub fn new(plan: MigrationPlan) -> Self {
        Self {
            plan,
            on_step_start: None,
            on_step_complete: None,
            on_step_skipped: None,
            on_step_error: None,
        }
    }

    pub fn plan(&self) -> &MigrationPlan {
        &self.plan
    }

    /// Set a callback invoked before a candidate step executes.
    pub fn on_step_start<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_step_start = Some(Box::new(callback));
        self
    }

    /// Set a callback invoked when a step reports completion, with the time spent in its
    /// final invocation.
    pub fn on_step_complete<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str, Duration) + Send + Sync + 'static,
    {
        self.on_step_complete = Some(Box::new(callback));
        self
    }

    /// Set a callback invoked when a step is found to be already applied.
    pub fn on_step_skipped<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_step_skipped = Some(Box::new(callback));
        self
    }

    pub fn on_step_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str, &Error) + Send + Sync + 'static,
    {
        self.on_step_error = Some(Box::new(callback));
        self
    }

    /// Run steps from `ctx.state.substep` until the plan is exhausted, a step asks to be
    /// called again, the budget runs out, or a step fails.
    ///
    /// Step failures are reported in [RunReport::failing_step] without advancing, so the
    /// next invocation retries the same step from its saved offset.
    pub fn run(&self, ctx: &mut StepContext<'_>) -> Result<RunReport, Error> {
        let fingerprint = self.plan.fingerprint();
        match &ctx.state.plan {
            Some(saved) if *saved != fingerprint => {
                return Err(Error::fatal(format!(
                    "the migration plan changed since this upgrade started (saved {}, now {}); reset the upgrade to start over",
                    saved, fingerprint
                )));
            }
            Some(_) => {}
            None => {
                ctx.state.plan = Some(fingerprint);
                ctx.save()?;
            }
        }

        let mut report = RunReport {
            status: RunStatus::Continue,
            completed: Vec::new(),
            skipped: Vec::new(),
            failing_step: None,
        };

        tracing::debug!(
            position = ctx.state.substep,
            start = ctx.state.start,
            total = self.plan.len(),
            "Resuming migration plan"
        );

        while let Some(planned) = self.plan.get(ctx.state.substep) {
            let position = ctx.state.substep;
            let id = planned.id();
            let _span = tracing::info_span!("migration_step", position, id = %id).entered();

            let candidate = match planned.step.is_candidate(ctx) {
                Ok(candidate) => candidate,
                Err(error) => {
                    tracing::error!(error = %error, "Candidacy check failed");
                    if let Some(ref callback) = self.on_step_error {
                        callback(&id, &error);
                    }
                    report.failing_step = Some(StepFailure {
                        id,
                        position,
                        error,
                    });
                    return Ok(report);
                }
            };

            if !candidate {
                tracing::debug!("Skipping step (already applied)");
                if let Some(ref callback) = self.on_step_skipped {
                    callback(&id);
                }
                ctx.state.record_skipped(id.clone());
                ctx.state.advance_substep();
                ctx.save()?;
                report.skipped.push(id);
                continue;
            }

            if ctx.state.debug || ctx.config.debug {
                tracing::info!(start = ctx.state.start, "Executing step");
            } else {
                tracing::debug!(start = ctx.state.start, "Executing step");
            }
            if let Some(ref callback) = self.on_step_start {
                callback(&id);
            }

            let started = Instant::now();
            match planned.step.execute(ctx) {
                Ok(true) => {
                    let duration = started.elapsed();
                    tracing::info!(duration_ms = duration.as_millis() as u64, "Step complete");
                    if let Some(ref callback) = self.on_step_complete {
                        callback(&id, duration);
                    }
                    ctx.state.advance_substep();
                    ctx.save()?;
                    report.completed.push(id);
                    if ctx.budget.expired() {
                        break;
                    }
                }
                Ok(false) => {
                    tracing::info!(start = ctx.state.start, "Step yielded; will resume");
                    ctx.save()?;
                    return Ok(report);
                }
                Err(error) => {
                    tracing::error!(error = %error, start = ctx.state.start, "Step failed");
                    if let Some(ref callback) = self.on_step_error {
                        callback(&id, &error);
                    }
                    report.failing_step = Some(StepFailure {
                        id,
                        position,
                        error,
                    });
                    return Ok(report);
                }
            }
        }

        if ctx.state.substep >= self.plan.len() {
            report.status = RunStatus::Complete;
        }
        Ok(report)
    }

    /// Report which of the remaining steps would run, without executing anything.
    pub fn preview(&self, ctx: &mut StepContext<'_>) -> Result<Vec<StepPreview>, Error> {
        let resume_at = ctx.state.substep;
        let mut previews = Vec::new();
        for (position, planned) in self.plan.steps().iter().enumerate().skip(resume_at) {
            previews.push(StepPreview {
                position,
                id: planned.id(),
                description: planned.step.description(),
                candidate: planned.step.is_candidate(ctx)?,
                resuming: position == resume_at && ctx.state.start > 0,
            });
        }
        Ok(previews)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UpgradeConfig;
    use crate::registry::{Namespace, Registry};
    use crate::schema::{SchemaRegistry, SchemaVersion};
    use crate::sqlite::SqliteDatabase;
    use crate::state::{MaintenanceState, Operator, StateStore, ToolKind};
    use crate::step::{system_clock, BatchProgress, MigrationStep, TimeBudget};
    use chrono::Utc;
    use std::sync::{Arc, Mutex};

    // Steps keep their bookkeeping in a table so that candidacy survives fresh construction.
    fn ensure_journal(ctx: &mut StepContext<'_>) -> Result<(), Error> {
        ctx.db.execute(
            "CREATE TABLE IF NOT EXISTS journal (step TEXT NOT NULL, n INTEGER NOT NULL)",
            &[],
        )?;
        Ok(())
    }

    fn journal_has(ctx: &mut StepContext<'_>, step: &str) -> Result<bool, Error> {
        ensure_journal(ctx)?;
        let rows = ctx.db.query(
            "SELECT COUNT(*) AS n FROM journal WHERE step = ?1",
            &[step.into()],
        )?;
        Ok(rows[0].int("n")? > 0)
    }

    struct Mark(&'static str);

    impl MigrationStep for Mark {
        fn name(&self) -> String {
            self.0.to_string()
        }
        fn is_candidate(&self, ctx: &mut StepContext<'_>) -> Result<bool, Error> {
            Ok(!journal_has(ctx, self.0)?)
        }
        fn execute(&self, ctx: &mut StepContext<'_>) -> Result<bool, Error> {
            ctx.db.execute(
                "INSERT INTO journal (step, n) VALUES (?1, 0)",
                &[self.0.into()],
            )?;
            Ok(true)
        }
    }

    /// Three batches of work, one per invocation when the budget is exhausted.
    struct Slow;

    impl MigrationStep for Slow {
        fn name(&self) -> String {
            "slow".to_string()
        }
        fn is_candidate(&self, ctx: &mut StepContext<'_>) -> Result<bool, Error> {
            Ok(!journal_has(ctx, "slow")?)
        }
        fn execute(&self, ctx: &mut StepContext<'_>) -> Result<bool, Error> {
            ctx.batched(|ctx, batch| {
                if batch.start >= 2 {
                    ctx.db.execute(
                        "INSERT INTO journal (step, n) VALUES ('slow', ?1)",
                        &[batch.start.into()],
                    )?;
                    return Ok(BatchProgress::Done);
                }
                Ok(BatchProgress::Next(batch.start + 1))
            })
        }
    }

    struct Broken;

    impl MigrationStep for Broken {
        fn name(&self) -> String {
            "broken".to_string()
        }
        fn is_candidate(&self, _ctx: &mut StepContext<'_>) -> Result<bool, Error> {
            Ok(true)
        }
        fn execute(&self, _ctx: &mut StepContext<'_>) -> Result<bool, Error> {
            Err(Error::Generic("database is locked".to_string()))
        }
    }

    fn marks() -> Vec<Box<dyn MigrationStep>> {
        vec![Box::new(Mark("first")), Box::new(Slow), Box::new(Mark("last"))]
    }

    fn with_broken() -> Vec<Box<dyn MigrationStep>> {
        vec![Box::new(Mark("first")), Box::new(Broken), Box::new(Mark("last"))]
    }

    fn runner(steps: fn() -> Vec<Box<dyn MigrationStep>>) -> MigrationRunner {
        let registry = Registry::try_new(vec![Namespace {
            version: SchemaVersion::V2_1,
            steps,
        }])
        .unwrap();
        MigrationRunner::new(registry.plan(SchemaVersion::V2_0, SchemaVersion::V2_1))
    }

    struct Fixture {
        db: SqliteDatabase,
        state: MaintenanceState,
        config: UpgradeConfig,
        schema: SchemaRegistry,
        clock: crate::step::Clock,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                db: SqliteDatabase::open_in_memory().unwrap(),
                state: MaintenanceState::new(ToolKind::Upgrade, &Operator::new(1, "alice"), Utc::now()),
                config: UpgradeConfig::default(),
                schema: SchemaRegistry::builtin(),
                clock: system_clock(),
            }
        }

        fn run(&mut self, runner: &MigrationRunner, budget: TimeBudget, store: Option<&StateStore>) -> RunReport {
            let mut ctx = StepContext {
                db: &mut self.db,
                state: &mut self.state,
                store,
                budget: &budget,
                config: &self.config,
                schema: &self.schema,
                clock: &self.clock,
            };
            runner.run(&mut ctx).unwrap()
        }
    }

    #[test]
    fn runs_in_order_and_yields_inside_batched_steps() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let recorded = order.clone();
        let runner = runner(marks).on_step_start(move |id| recorded.lock().unwrap().push(id.to_string()));
        let mut fixture = Fixture::new();

        let report = fixture.run(&runner, TimeBudget::exhausted(), None);
        assert_eq!(report.status, RunStatus::Continue);
        assert_eq!(report.completed, vec!["v2_1/first".to_string()]);
        assert_eq!((fixture.state.substep, fixture.state.start), (1, 0));

        let report = fixture.run(&runner, TimeBudget::exhausted(), None);
        assert_eq!(report.status, RunStatus::Continue);
        assert!(report.completed.is_empty());
        assert_eq!((fixture.state.substep, fixture.state.start), (1, 1));

        let report = fixture.run(&runner, TimeBudget::exhausted(), None);
        assert_eq!((fixture.state.substep, fixture.state.start), (1, 2));
        assert!(report.completed.is_empty());

        let report = fixture.run(&runner, TimeBudget::unlimited(), None);
        assert_eq!(report.status, RunStatus::Complete);
        assert_eq!(report.completed, vec!["v2_1/slow".to_string(), "v2_1/last".to_string()]);
        assert_eq!(fixture.state.substep, 3);

        assert_eq!(
            *order.lock().unwrap(),
            vec!["v2_1/first", "v2_1/slow", "v2_1/slow", "v2_1/slow", "v2_1/last"]
        );
    }

    #[test]
    fn applied_steps_are_skipped_on_a_fresh_state() {
        let runner = runner(marks);
        let mut fixture = Fixture::new();
        let report = fixture.run(&runner, TimeBudget::unlimited(), None);
        assert_eq!(report.status, RunStatus::Complete);

        fixture.state = MaintenanceState::new(ToolKind::Upgrade, &Operator::new(1, "alice"), Utc::now());
        let report = fixture.run(&runner, TimeBudget::unlimited(), None);
        assert_eq!(report.status, RunStatus::Complete);
        assert!(report.completed.is_empty());
        assert_eq!(report.skipped.len(), 3);
        assert_eq!(fixture.state.skipped, report.skipped);
    }

    #[test]
    fn failure_stops_without_advancing() {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let recorded = errors.clone();
        let runner = runner(with_broken)
            .on_step_error(move |id, error| recorded.lock().unwrap().push(format!("{}: {}", id, error)));
        let mut fixture = Fixture::new();

        let report = fixture.run(&runner, TimeBudget::unlimited(), None);
        let failure = report.failing_step.unwrap();
        assert_eq!(failure.id, "v2_1/broken");
        assert_eq!(failure.position, 1);
        assert!(!failure.error.is_fatal());
        assert_eq!(fixture.state.substep, 1);
        assert_eq!(*errors.lock().unwrap(), vec!["v2_1/broken: database is locked"]);

        // retried, not skipped, on the next run
        let report = fixture.run(&runner, TimeBudget::unlimited(), None);
        assert_eq!(report.failing_step.unwrap().id, "v2_1/broken");
        assert_eq!(fixture.state.substep, 1);
    }

    #[test]
    fn changed_plan_is_fatal() {
        let mut fixture = Fixture::new();
        fixture.run(&runner(marks), TimeBudget::exhausted(), None);
        assert!(fixture.state.plan.is_some());

        let other = runner(with_broken);
        let budget = TimeBudget::unlimited();
        let mut ctx = StepContext {
            db: &mut fixture.db,
            state: &mut fixture.state,
            store: None,
            budget: &budget,
            config: &fixture.config,
            schema: &fixture.schema,
            clock: &fixture.clock,
        };
        assert!(other.run(&mut ctx).unwrap_err().is_fatal());
    }

    #[test]
    fn offsets_are_persisted_after_each_unit() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        let runner = runner(marks);
        let mut fixture = Fixture::new();

        fixture.run(&runner, TimeBudget::exhausted(), Some(&store));
        fixture.run(&runner, TimeBudget::exhausted(), Some(&store));
        let saved = store.load().unwrap().unwrap();
        assert_eq!((saved.substep, saved.start), (1, 1));
        assert_eq!(saved.plan, fixture.state.plan);
    }

    #[test]
    fn preview_lists_remaining_steps() {
        let runner = runner(marks);
        let mut fixture = Fixture::new();
        fixture.run(&runner, TimeBudget::exhausted(), None);
        fixture.run(&runner, TimeBudget::exhausted(), None);

        let budget = TimeBudget::unlimited();
        let mut ctx = StepContext {
            db: &mut fixture.db,
            state: &mut fixture.state,
            store: None,
            budget: &budget,
            config: &fixture.config,
            schema: &fixture.schema,
            clock: &fixture.clock,
        };
        let preview = runner.preview(&mut ctx).unwrap();
        let ids: Vec<&str> = preview.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["v2_1/slow", "v2_1/last"]);
        assert!(preview[0].resuming);
        assert!(preview.iter().all(|p| p.candidate));
        assert_eq!(ctx.state.substep, 1);
    }
}
