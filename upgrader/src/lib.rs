#![cfg_attr(docsrs, feature(doc_cfg))]
//! `upgrader` moves a live forum database from one schema version to another, one short
//! invocation at a time.
//!
//! Core concepts:
//! - A [MigrationStep] is a small transformation with a cheap [MigrationStep::is_candidate]
//!   check and an [MigrationStep::execute] that may be called many times, resuming from an
//!   offset saved in the [MaintenanceState].
//! - The [Registry] lists steps per version namespace and builds a [MigrationPlan] for any
//!   upgrade path. The [MigrationRunner] walks the plan, skipping steps that are already applied.
//! - A [Controller] drives the install or upgrade tool through its phases, claiming the
//!   maintenance state for one operator and refusing a second one while the first is active.
//!
//! # Resumability
//!
//! Nothing is held in memory between invocations. Every unit of work ends by persisting the
//! maintenance state, so a crash or a timeout at any point is recovered by invoking again: the
//! interrupted step sees its saved offset and, since each step is idempotent, replaying the
//! last batch is harmless.
//!
//! # Database support
//!
//! Steps talk to the database through [DatabaseApi]. [SqliteDatabase] implements it on top of
//! `rusqlite`.
//!
//! # Testing
//!
//! The `testing` feature exposes [testing::StepHarness], which runs single steps or whole plans
//! against an in-memory database and checks idempotence and schema equivalence.

mod config;
pub use config::{AdminAccount, UpgradeConfig};

mod error;
pub use error::Error;

pub mod db;
pub use db::{DatabaseApi, InsertMode, Row, TransactionOp, Value};

pub mod schema;
pub use schema::{ColumnDef, IndexDef, SchemaRegistry, SchemaVersion, TableDef};

mod settings;
pub use settings::{SettingKey, Settings};

mod sqlite;
pub use sqlite::SqliteDatabase;

mod state;
pub use state::{MaintenanceState, Operator, StateStore, ToolKind};

mod step;
pub use step::{system_clock, Batch, BatchProgress, Clock, MigrationStep, StepContext, TimeBudget};

mod registry;
pub use registry::{MigrationPlan, Namespace, PlannedStep, Registry, StepFactory};

mod runner;
pub use runner::{MigrationRunner, RunReport, RunStatus, StepFailure, StepPreview};

pub mod controller;
pub use controller::{Controller, InvocationReport, Outcome, Phase, ToolContext};

pub mod versions;

#[cfg(any(test, feature = "testing"))]
#[cfg_attr(docsrs, doc(cfg(feature = "testing")))]
pub mod testing;
