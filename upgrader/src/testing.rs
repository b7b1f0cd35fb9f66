//! Testing utilities for migration step development and verification.
//!
//! [StepHarness] drives a single step (or a whole plan) against an in-memory SQLite forum at a
//! chosen schema version, and offers the idempotence and schema checks every step is expected
//! to pass.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::config::UpgradeConfig;
use crate::db::{DatabaseApi, Value};
use crate::error::Error;
use crate::registry::Registry;
use crate::runner::{MigrationRunner, RunReport, RunStatus};
use crate::schema::{ColumnInfo, IndexDef, SchemaRegistry, SchemaVersion, TableDef};
use crate::settings::{SettingKey, Settings};
use crate::sqlite::SqliteDatabase;
use crate::state::{MaintenanceState, Operator, ToolKind};
use crate::step::{system_clock, Clock, MigrationStep, StepContext, TimeBudget};

/// Upper bound on invocations before a step is considered stuck.
const MAX_INVOCATIONS: usize = 10_000;

/// A test harness for migration steps that provides state control and assertion helpers.
///
/// # Example
///
/// ```ignore
/// use upgrader::testing::StepHarness;
/// use upgrader::schema::SchemaVersion;
/// use upgrader::versions::v2_1::AddModifiedReason;
///
/// let mut harness = StepHarness::at(SchemaVersion::V2_0);
/// assert!(harness.is_candidate(&AddModifiedReason).unwrap());
/// harness.run_to_completion(&AddModifiedReason).unwrap();
/// harness.assert_column_exists("messages", "modified_reason").unwrap();
/// harness.assert_idempotent(&AddModifiedReason);
/// ```
pub struct StepHarness {
    db: SqliteDatabase,
    state: MaintenanceState,
    config: UpgradeConfig,
    schema: SchemaRegistry,
    exhausted: bool,
    clock: Clock,
}

/// Represents a captured database schema for comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    /// Map of table name to table definitions
    pub tables: BTreeMap<String, TableSchema>,
}

/// Represents a table's schema. Columns are ordered by name, so tables that gained columns
/// through `ALTER TABLE` compare equal to freshly created ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub columns: Vec<ColumnInfo>,
    pub indexes: Vec<IndexInfo>,
}

/// Information about an index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexInfo {
    pub name: String,
    pub unique: bool,
    pub primary: bool,
    pub columns: Vec<String>,
}

impl From<&IndexDef> for IndexInfo {
    fn from(index: &IndexDef) -> Self {
        use crate::schema::IndexKind;
        Self {
            name: index.name.clone(),
            unique: index.kind != IndexKind::Index,
            primary: index.kind == IndexKind::Primary,
            columns: index.columns.clone(),
        }
    }
}

impl SchemaSnapshot {
    /// Describe every difference from `expected`, one per line.
    pub fn differences(&self, expected: &SchemaSnapshot) -> Vec<String> {
        let mut differences = Vec::new();
        for (name, want) in &expected.tables {
            let Some(have) = self.tables.get(name) else {
                differences.push(format!("table '{}' is missing", name));
                continue;
            };
            for column in &want.columns {
                match have.columns.iter().find(|c| c.name == column.name) {
                    None => differences.push(format!("column '{}.{}' is missing", name, column.name)),
                    Some(c) if c != column => differences.push(format!(
                        "column '{}.{}' differs: expected {:?}, found {:?}",
                        name, column.name, column, c
                    )),
                    Some(_) => {}
                }
            }
            for column in &have.columns {
                if !want.columns.iter().any(|c| c.name == column.name) {
                    differences.push(format!("column '{}.{}' is unexpected", name, column.name));
                }
            }
            if have.indexes != want.indexes {
                differences.push(format!(
                    "indexes of '{}' differ: expected {:?}, found {:?}",
                    name, want.indexes, have.indexes
                ));
            }
        }
        for name in self.tables.keys() {
            if !expected.tables.contains_key(name) {
                differences.push(format!("table '{}' is unexpected", name));
            }
        }
        differences
    }
}

/// Capture the schema of every table in `db`.
pub fn capture_schema(db: &mut dyn DatabaseApi) -> Result<SchemaSnapshot, Error> {
    let mut tables = BTreeMap::new();
    for table in db.list_tables()? {
        let mut columns = db.list_columns(&table)?;
        columns.sort_by(|a, b| a.name.cmp(&b.name));
        let mut indexes: Vec<IndexInfo> = db.list_indexes(&table)?.iter().map(IndexInfo::from).collect();
        indexes.sort_by(|a, b| a.name.cmp(&b.name));
        tables.insert(table, TableSchema { columns, indexes });
    }
    Ok(SchemaSnapshot { tables })
}

/// The schema a database holds once exactly `tables` have been created from their descriptors.
pub fn expected_schema(tables: &[TableDef]) -> Result<SchemaSnapshot, Error> {
    let mut scratch = SqliteDatabase::open_in_memory()?;
    for table in tables {
        scratch.create_table(table)?;
    }
    capture_schema(&mut scratch)
}

impl StepHarness {
    /// Create a harness over an empty in-memory database.
    pub fn new() -> Self {
        let db = SqliteDatabase::open_in_memory().expect("Failed to create in-memory test database");
        Self::with_database(db)
    }

    /// Create a harness over an existing database.
    pub fn with_database(db: SqliteDatabase) -> Self {
        Self {
            db,
            state: MaintenanceState::new(ToolKind::Upgrade, &Operator::new(1, "tester"), Utc::now()),
            config: UpgradeConfig::default(),
            schema: SchemaRegistry::builtin(),
            exhausted: false,
            clock: system_clock(),
        }
    }

    /// Create a harness whose database holds the empty forum schema of `version`, with the
    /// `smfVersion` setting recording it.
    pub fn at(version: SchemaVersion) -> Self {
        let mut harness = Self::new();
        harness
            .install_schema(version)
            .expect("Failed to create baseline schema");
        harness
    }

    fn install_schema(&mut self, version: SchemaVersion) -> Result<(), Error> {
        let tables = self.schema.tables(version).to_vec();
        for table in &tables {
            self.db.create_table(table)?;
        }
        Settings::new(&mut self.db).set(SettingKey::SmfVersion, version.release())
    }

    pub fn with_batch_size(mut self, batch_size: u64) -> Self {
        self.config.batch_size = batch_size;
        self
    }

    /// Make every invocation yield after its first batch.
    pub fn with_exhausted_budget(mut self) -> Self {
        self.exhausted = true;
        self
    }

    pub fn with_config(mut self, config: UpgradeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn db(&mut self) -> &mut SqliteDatabase {
        &mut self.db
    }

    pub fn state(&self) -> &MaintenanceState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut MaintenanceState {
        &mut self.state
    }

    /// Run `f` with a step context over the harness database and state.
    pub fn with_context<T>(&mut self, f: impl FnOnce(&mut StepContext<'_>) -> T) -> T {
        let budget = if self.exhausted {
            TimeBudget::exhausted()
        } else {
            TimeBudget::unlimited()
        };
        let mut ctx = StepContext {
            db: &mut self.db,
            state: &mut self.state,
            store: None,
            budget: &budget,
            config: &self.config,
            schema: &self.schema,
            clock: &self.clock,
        };
        f(&mut ctx)
    }

    pub fn is_candidate(&mut self, step: &dyn MigrationStep) -> Result<bool, Error> {
        self.with_context(|ctx| step.is_candidate(ctx))
    }

    /// One invocation of `step`, as the runner would perform it.
    pub fn execute_once(&mut self, step: &dyn MigrationStep) -> Result<bool, Error> {
        self.with_context(|ctx| step.execute(ctx))
    }

    /// Invoke `step` until it reports completion, then reset its offset as the runner does.
    /// Returns the number of invocations it took.
    pub fn run_to_completion(&mut self, step: &dyn MigrationStep) -> Result<usize, Error> {
        for invocation in 1..=MAX_INVOCATIONS {
            if self.execute_once(step)? {
                self.state.start = 0;
                return Ok(invocation);
            }
        }
        Err(Error::Generic(format!(
            "step '{}' did not complete within {} invocations",
            step.name(),
            MAX_INVOCATIONS
        )))
    }

    /// Run the builtin plan from `from` to `to` until it completes, failing on the first step
    /// error. Returns the report of every invocation.
    pub fn run_plan(&mut self, from: SchemaVersion, to: SchemaVersion) -> Result<Vec<RunReport>, Error> {
        let runner = MigrationRunner::new(Registry::builtin().plan(from, to));
        let mut reports = Vec::new();
        for _ in 0..MAX_INVOCATIONS {
            let report = self.with_context(|ctx| runner.run(ctx))?;
            let status = report.status;
            if let Some(failure) = report.failing_step {
                return Err(Error::Step {
                    step: failure.id,
                    source: Box::new(failure.error),
                });
            }
            reports.push(report);
            if status == RunStatus::Complete {
                return Ok(reports);
            }
        }
        Err(Error::Generic("plan did not complete".to_string()))
    }

    pub fn capture_schema(&mut self) -> Result<SchemaSnapshot, Error> {
        capture_schema(&mut self.db)
    }

    /// Every row of `table`, in rowid order.
    pub fn capture_data(&mut self, table: &str) -> Result<Vec<BTreeMap<String, Value>>, Error> {
        let rows = self
            .db
            .query(&format!("SELECT * FROM \"{}\" ORDER BY rowid", table), &[])?;
        Ok(rows.iter().map(|row| row.to_map()).collect())
    }

    fn capture_all_data(&mut self) -> Result<BTreeMap<String, Vec<BTreeMap<String, Value>>>, Error> {
        let mut data = BTreeMap::new();
        for table in self.db.list_tables()? {
            let rows = self.capture_data(&table)?;
            data.insert(table, rows);
        }
        Ok(data)
    }

    pub fn query_int(&mut self, sql: &str) -> Result<i64, Error> {
        let rows = self.db.query(sql, &[])?;
        let row = rows
            .first()
            .ok_or_else(|| Error::Generic(format!("no rows returned by '{}'", sql)))?;
        row.get(0)
            .and_then(Value::as_i64)
            .ok_or_else(|| Error::Generic(format!("'{}' did not return an integer", sql)))
    }

    pub fn assert_column_exists(&mut self, table: &str, column: &str) -> Result<(), Error> {
        if !self.db.column_exists(table, column)? {
            return Err(Error::Generic(format!(
                "Column '{}' does not exist in table '{}'",
                column, table
            )));
        }
        Ok(())
    }

    pub fn assert_column_not_exists(&mut self, table: &str, column: &str) -> Result<(), Error> {
        if self.db.column_exists(table, column)? {
            return Err(Error::Generic(format!(
                "Column '{}' exists in table '{}' but should not",
                column, table
            )));
        }
        Ok(())
    }

    /// Assert the database schema equals the descriptors of `version`.
    pub fn assert_schema_matches(&mut self, version: SchemaVersion) -> Result<(), Error> {
        let expected = expected_schema(self.schema.tables(version))?;
        let differences = self.capture_schema()?.differences(&expected);
        if !differences.is_empty() {
            return Err(Error::Generic(format!(
                "Schema does not match {}:\n{}",
                version,
                differences.join("\n")
            )));
        }
        Ok(())
    }

    /// Run `step` to completion, then check that it is no longer a candidate and that running
    /// it again changes neither the schema nor any row.
    pub fn assert_idempotent(&mut self, step: &dyn MigrationStep) {
        self.run_to_completion(step).expect("step failed");
        assert!(
            !self.is_candidate(step).expect("candidacy check failed"),
            "step '{}' is still a candidate after completing",
            step.name()
        );
        let schema = self.capture_schema().expect("schema capture failed");
        let data = self.capture_all_data().expect("data capture failed");

        self.run_to_completion(step).expect("second run failed");
        assert_eq!(
            self.capture_schema().expect("schema capture failed"),
            schema,
            "step '{}' changed the schema on its second run",
            step.name()
        );
        assert_eq!(
            self.capture_all_data().expect("data capture failed"),
            data,
            "step '{}' changed data on its second run",
            step.name()
        );
    }

    /// Run `step` twice over databases prepared by `setup` at `version`: once yielding after
    /// every batch of `batch_size`, once in a single unbounded invocation. Both runs must end
    /// with the same schema and the same rows. Returns how many invocations the interrupted
    /// run took.
    pub fn assert_resumable(
        version: SchemaVersion,
        step: &dyn MigrationStep,
        batch_size: u64,
        setup: impl Fn(&mut StepHarness),
    ) -> usize {
        let mut interrupted = StepHarness::at(version)
            .with_batch_size(batch_size)
            .with_exhausted_budget();
        setup(&mut interrupted);
        let invocations = interrupted
            .run_to_completion(step)
            .expect("interrupted run failed");

        let mut reference = StepHarness::at(version);
        setup(&mut reference);
        reference.run_to_completion(step).expect("unbounded run failed");

        assert_eq!(
            interrupted.capture_schema().expect("schema capture failed"),
            reference.capture_schema().expect("schema capture failed"),
            "step '{}' left a different schema when interrupted",
            step.name()
        );
        assert_eq!(
            interrupted.capture_all_data().expect("data capture failed"),
            reference.capture_all_data().expect("data capture failed"),
            "step '{}' left different data when interrupted",
            step.name()
        );
        invocations
    }
}

impl Default for StepHarness {
    fn default() -> Self {
        Self::new()
    }
}
