use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::config::UpgradeConfig;
use crate::db::DatabaseApi;
use crate::error::Error;
use crate::schema::SchemaRegistry;
use crate::settings::Settings;
use crate::state::{MaintenanceState, StateStore};

/// Source of the current time. Injected so that inactivity windows can be tested.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}

/// A trait that must be implemented to define one migration step.
///
/// Steps are stateless: everything a step needs to resume lives in the [MaintenanceState]
/// reachable through the [StepContext], never in the step itself. The runner builds the
/// steps afresh on every invocation.
///
/// [MigrationStep::is_candidate] must be a cheap, side-effect free check that turns false
/// once the step's transformation is complete, and stays true while it is only partially
/// done. [MigrationStep::execute] returns `Ok(true)` once the step is finished and
/// `Ok(false)` when it should be called again with its saved offset.
pub trait MigrationStep {
    /// A stable human readable title, used in logs and in the list of skipped steps.
    fn name(&self) -> String;

    fn description(&self) -> Option<&'static str> {
        None
    }

    fn is_candidate(&self, ctx: &mut StepContext<'_>) -> Result<bool, Error>;

    fn execute(&self, ctx: &mut StepContext<'_>) -> Result<bool, Error>;
}

impl std::fmt::Debug for dyn MigrationStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationStep")
            .field("name", &self.name())
            .finish()
    }
}

/// Wall-clock allowance of one invocation.
#[derive(Debug, Clone, Copy)]
pub struct TimeBudget {
    started: Instant,
    limit: Option<Duration>,
}

impl TimeBudget {
    pub fn new(limit: Duration) -> Self {
        Self {
            started: Instant::now(),
            limit: Some(limit),
        }
    }

    pub fn unlimited() -> Self {
        Self {
            started: Instant::now(),
            limit: None,
        }
    }

    /// A budget that is already spent: every batched step processes exactly one batch.
    pub fn exhausted() -> Self {
        Self::new(Duration::ZERO)
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn expired(&self) -> bool {
        self.limit.is_some_and(|limit| self.elapsed() >= limit)
    }
}

/// One window of rows handed to a batched step body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Batch {
    pub start: u64,
    pub size: u64,
}

impl Batch {
    pub fn end(&self) -> u64 {
        self.start + self.size
    }
}

/// What a batch body reports back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchProgress {
    /// Continue from this offset.
    Next(u64),
    /// Nothing left to process.
    Done,
}

/// Everything a step may touch while it runs.
pub struct StepContext<'a> {
    pub db: &'a mut dyn DatabaseApi,
    pub state: &'a mut MaintenanceState,
    /// Where offsets are flushed. `None` keeps the state in memory only.
    pub store: Option<&'a StateStore>,
    pub budget: &'a TimeBudget,
    pub config: &'a UpgradeConfig,
    pub schema: &'a SchemaRegistry,
    pub clock: &'a Clock,
}

impl<'a> StepContext<'a> {
    pub fn settings(&mut self) -> Settings<'_> {
        Settings::new(&mut *self.db)
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    /// Stamp and persist the maintenance state.
    pub fn save(&mut self) -> Result<(), Error> {
        self.state.updated = self.now();
        if let Some(store) = self.store {
            store.save(self.state)?;
        }
        Ok(())
    }

    /// Record that the current step has processed everything before `start`, and persist it.
    pub fn checkpoint(&mut self, start: u64) -> Result<(), Error> {
        if start < self.state.start {
            return Err(Error::Generic(format!(
                "offset may not move backwards (from {} to {})",
                self.state.start, start
            )));
        }
        self.state.start = start;
        self.save()
    }

    /// Drive `body` over consecutive batches starting at the saved offset, checkpointing after
    /// each one. Stops with `Ok(false)` once the budget is spent, so every call processes at
    /// least one batch; returns `Ok(true)` when `body` reports [BatchProgress::Done].
    pub fn batched<F>(&mut self, mut body: F) -> Result<bool, Error>
    where
        F: FnMut(&mut Self, Batch) -> Result<BatchProgress, Error>,
    {
        loop {
            let batch = Batch {
                start: self.state.start,
                size: self.config.batch_size.max(1),
            };
            match body(self, batch)? {
                BatchProgress::Done => return Ok(true),
                BatchProgress::Next(next) => {
                    if next <= batch.start {
                        return Err(Error::Generic(format!(
                            "batch at offset {} made no progress",
                            batch.start
                        )));
                    }
                    tracing::debug!(from = batch.start, to = next, "Batch complete");
                    self.checkpoint(next)?;
                    if self.budget.expired() {
                        return Ok(false);
                    }
                }
            }
        }
    }
}
