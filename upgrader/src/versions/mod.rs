//! Migration steps, one module per target version.
//!
//! The steps shared by every version live here: creating the tables a version introduces and
//! reconciling every table with its descriptor once the data conversions are done.

use crate::error::Error;
use crate::schema::{sync_table, table_diff, SchemaVersion};
use crate::step::{MigrationStep, StepContext};

pub mod v2_1;
pub mod v3_0;

/// Creates every table `version` introduces, with its seed rows.
pub struct CreateNewTables(pub SchemaVersion);

impl MigrationStep for CreateNewTables {
    fn name(&self) -> String {
        "Adding new tables".to_string()
    }

    fn description(&self) -> Option<&'static str> {
        Some("Creates the tables introduced by this version")
    }

    fn is_candidate(&self, ctx: &mut StepContext<'_>) -> Result<bool, Error> {
        for table in ctx.schema.new_tables(self.0) {
            if !ctx.db.table_exists(&table.name)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn execute(&self, ctx: &mut StepContext<'_>) -> Result<bool, Error> {
        let placeholders = ctx.config.placeholders(ctx.now());
        let schema = ctx.schema;
        for table in schema.new_tables(self.0) {
            let outcome = sync_table(ctx.db, table, &placeholders)?;
            if outcome.created {
                tracing::info!(table = %table.name, "Created table");
            }
        }
        Ok(true)
    }
}

/// Adds any column or index still missing from a table of `version`.
///
/// Runs last in a namespace, after every data conversion has had its chance to reshape the
/// tables it owns. The table index is kept in the step offset.
pub struct SyncSchema(pub SchemaVersion);

impl MigrationStep for SyncSchema {
    fn name(&self) -> String {
        "Synchronizing table structure".to_string()
    }

    fn is_candidate(&self, ctx: &mut StepContext<'_>) -> Result<bool, Error> {
        let schema = ctx.schema;
        for table in schema.tables(self.0) {
            if !table_diff(ctx.db, table)?.is_empty() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn execute(&self, ctx: &mut StepContext<'_>) -> Result<bool, Error> {
        let placeholders = ctx.config.placeholders(ctx.now());
        let schema = ctx.schema;
        let tables = schema.tables(self.0);
        while let Some(table) = tables.get(ctx.state.start as usize) {
            sync_table(ctx.db, table, &placeholders)?;
            ctx.checkpoint(ctx.state.start + 1)?;
            if ctx.budget.expired() && (ctx.state.start as usize) < tables.len() {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::DatabaseApi;
    use crate::testing::StepHarness;

    #[test]
    fn new_tables_are_created_once() {
        let mut harness = StepHarness::at(SchemaVersion::V2_0);
        let step = CreateNewTables(SchemaVersion::V2_1);
        assert!(harness.is_candidate(&step).unwrap());
        assert!(harness.run_to_completion(&step).unwrap() >= 1);
        assert!(!harness.is_candidate(&step).unwrap());
        for table in ["pm_labels", "pm_labeled_messages", "user_alerts", "background_tasks"] {
            assert!(harness.db().table_exists(table).unwrap(), "{} missing", table);
        }
        harness.assert_idempotent(&step);
    }

    #[test]
    fn sync_schema_resumes_by_table() {
        let mut harness = StepHarness::at(SchemaVersion::V2_0).with_exhausted_budget();
        let step = SyncSchema(SchemaVersion::V2_1);
        assert!(harness.is_candidate(&step).unwrap());
        assert!(!harness.execute_once(&step).unwrap());
        assert_eq!(harness.state().start, 1);
        harness.assert_idempotent(&step);
    }
}
