//! Phases of the upgrade tool.

use super::{finish, installed_version, Phase, ToolContext};
use crate::error::Error;
use crate::runner::{MigrationRunner, RunStatus};
use crate::settings::SettingKey;

pub const MIGRATE: &str = "migrate";

pub fn phases() -> Vec<Phase> {
    vec![
        Phase {
            id: "welcome",
            name: "Checking the installation",
            title: Some("Welcome"),
            handler: welcome,
            weight: 2,
        },
        Phase {
            id: "options",
            name: "Preparing the forum",
            title: Some("Upgrade options"),
            handler: options,
            weight: 2,
        },
        Phase {
            id: "backup",
            name: "Backing up tables",
            title: Some("Backup"),
            handler: backup,
            weight: 15,
        },
        Phase {
            id: MIGRATE,
            name: "Migrating the database",
            title: Some("Database changes"),
            handler: migrate,
            weight: 70,
        },
        Phase {
            id: "cleanup",
            name: "Cleaning up",
            title: None,
            handler: cleanup,
            weight: 8,
        },
        Phase {
            id: "finish",
            name: "Finishing",
            title: Some("Upgrade complete"),
            handler: finish,
            weight: 3,
        },
    ]
}

fn welcome(ctx: &mut ToolContext<'_>) -> Result<bool, Error> {
    let version = ctx.db.engine_version()?;
    tracing::info!(engine = ctx.db.engine(), %version, "Connected to database");
    ctx.db.check_privileges()?;

    let installed = installed_version(ctx.db)?.ok_or_else(|| {
        Error::fatal("no forum installation found in this database; run the installer instead")
    })?;
    if installed > ctx.config.target {
        return Err(Error::fatal(format!(
            "the forum is at {}, newer than the upgrade target {}",
            installed, ctx.config.target
        )));
    }
    tracing::info!(from = %installed, to = %ctx.config.target, "Upgrade planned");
    Ok(true)
}

fn options(ctx: &mut ToolContext<'_>) -> Result<bool, Error> {
    if !ctx.config.maintenance_mode {
        return Ok(true);
    }
    // remember the operator's own setting only once, a resumed run sees our own value
    if ctx.state.maint.is_none() {
        let current = ctx
            .settings()
            .get(SettingKey::Maintenance)?
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0);
        ctx.state.maint = Some(current);
        ctx.save()?;
    }
    ctx.settings().set(SettingKey::Maintenance, "1")?;
    Ok(true)
}

/// Copies every table that is not itself a backup, one table per substep.
fn backup(ctx: &mut ToolContext<'_>) -> Result<bool, Error> {
    if !ctx.config.backup {
        return Ok(true);
    }
    let config = ctx.config;
    let prefix = config.backup_prefix.as_str();
    let mut tables: Vec<String> = ctx
        .db
        .list_tables()?
        .into_iter()
        .filter(|t| !t.starts_with(prefix))
        .collect();
    tables.sort();
    ctx.state.total_items = tables.len() as u64;

    while let Some(table) = tables.get(ctx.state.substep) {
        let destination = format!("{}{}", prefix, table);
        ctx.db.copy_table(table, &destination)?;
        tracing::info!(%table, %destination, "Backed up table");
        ctx.advance_substep()?;
        if ctx.budget.expired() && ctx.state.substep < tables.len() {
            return Ok(false);
        }
    }
    Ok(true)
}

fn migrate(ctx: &mut ToolContext<'_>) -> Result<bool, Error> {
    let from = installed_version(ctx.db)?
        .ok_or_else(|| Error::fatal("the forum version disappeared during the upgrade"))?;
    let plan = ctx.registry.plan(from, ctx.config.target);
    ctx.state.total_items = plan.len() as u64;
    let runner = MigrationRunner::new(plan);

    let report = runner.run(&mut ctx.step_context())?;
    if let Some(failure) = report.failing_step {
        return Err(Error::Step {
            step: failure.id,
            source: Box::new(failure.error),
        });
    }
    Ok(report.status == RunStatus::Complete)
}

fn cleanup(ctx: &mut ToolContext<'_>) -> Result<bool, Error> {
    let target = ctx.config.target;
    ctx.settings().set(SettingKey::SmfVersion, target.release())?;
    tracing::info!(version = target.release(), "Recorded new version");

    if ctx.config.optimize {
        let config = ctx.config;
        for table in ctx.db.list_tables()? {
            if !table.starts_with(&config.backup_prefix) {
                ctx.db.optimize_table(&table)?;
            }
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UpgradeConfig;
    use crate::controller::{Controller, Outcome};
    use crate::db::DatabaseApi;
    use crate::schema::{SchemaRegistry, SchemaVersion};
    use crate::settings::Settings;
    use crate::sqlite::SqliteDatabase;
    use crate::state::Operator;
    use crate::testing::capture_schema;

    fn forum_at(version: SchemaVersion) -> SqliteDatabase {
        let mut db = SqliteDatabase::open_in_memory().unwrap();
        for table in SchemaRegistry::builtin().tables(version) {
            db.create_table(table).unwrap();
        }
        Settings::new(&mut db)
            .set(SettingKey::SmfVersion, version.release())
            .unwrap();
        db
    }

    fn drive(controller: &Controller, db: &mut SqliteDatabase) -> Vec<Outcome> {
        let alice = Operator::new(1, "alice");
        let mut outcomes = Vec::new();
        for _ in 0..200 {
            let report = controller.invoke(db, &alice);
            let outcome = report.outcome.clone();
            outcomes.push(outcome.clone());
            if outcome != Outcome::Continue {
                break;
            }
        }
        outcomes
    }

    #[test]
    fn upgrade_runs_to_completion_and_restores_maintenance() {
        let dir = tempfile::tempdir().unwrap();
        let config = UpgradeConfig {
            state_file: dir.path().join("state.json"),
            time_budget_secs: 0,
            batch_size: 2,
            ..UpgradeConfig::default()
        };
        let mut db = forum_at(SchemaVersion::V2_0);
        Settings::new(&mut db).set(SettingKey::Maintenance, "2").unwrap();

        let controller = Controller::upgrade(config);
        let outcomes = drive(&controller, &mut db);
        assert_eq!(outcomes.last(), Some(&Outcome::Finished));
        assert!(outcomes.len() > 1, "a zero budget yields after every phase");

        let mut settings = Settings::new(&mut db);
        assert_eq!(
            settings.get(SettingKey::SmfVersion).unwrap().as_deref(),
            Some(SchemaVersion::V3_0.release())
        );
        assert_eq!(settings.get(SettingKey::Maintenance).unwrap().as_deref(), Some("2"));
        assert!(controller.status().unwrap().is_none());
    }

    #[test]
    fn backup_copies_one_table_per_invocation() {
        let dir = tempfile::tempdir().unwrap();
        let config = UpgradeConfig {
            state_file: dir.path().join("state.json"),
            time_budget_secs: 0,
            backup: true,
            target: SchemaVersion::V2_1,
            ..UpgradeConfig::default()
        };
        let mut db = forum_at(SchemaVersion::V2_0);
        let tables = db.list_tables().unwrap();

        let controller = Controller::upgrade(config);
        let alice = Operator::new(1, "alice");
        // welcome, options, then the first backup table
        for _ in 0..3 {
            controller.invoke(&mut db, &alice);
        }
        let state = controller.status().unwrap().unwrap();
        assert_eq!(state.step, 2);
        assert_eq!(state.substep, 1);
        assert_eq!(state.total_items, tables.len() as u64);

        let outcomes = drive(&controller, &mut db);
        assert_eq!(outcomes.last(), Some(&Outcome::Finished));
        for table in tables {
            assert!(db.table_exists(&format!("backup_{}", table)).unwrap());
        }
        assert!(!db.table_exists("backup_backup_settings").unwrap());
    }

    #[test]
    fn newer_forum_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let config = UpgradeConfig {
            state_file: dir.path().join("state.json"),
            target: SchemaVersion::V2_1,
            ..UpgradeConfig::default()
        };
        let mut db = forum_at(SchemaVersion::V3_0);
        let report = Controller::upgrade(config).invoke(&mut db, &Operator::new(1, "alice"));
        assert_eq!(report.phase, "welcome");
        assert!(matches!(report.outcome, Outcome::Failed { fatal: true, .. }));
    }

    #[test]
    fn missing_installation_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let config = UpgradeConfig {
            state_file: dir.path().join("state.json"),
            ..UpgradeConfig::default()
        };
        let mut db = SqliteDatabase::open_in_memory().unwrap();
        let report = Controller::upgrade(config).invoke(&mut db, &Operator::new(1, "alice"));
        assert!(matches!(report.outcome, Outcome::Failed { fatal: true, .. }));
    }

    #[test]
    fn upgraded_forum_matches_fresh_schema() {
        let dir = tempfile::tempdir().unwrap();
        let config = UpgradeConfig {
            state_file: dir.path().join("state.json"),
            ..UpgradeConfig::default()
        };
        let mut db = forum_at(SchemaVersion::V2_0);
        let controller = Controller::upgrade(config);
        assert_eq!(drive(&controller, &mut db).last(), Some(&Outcome::Finished));

        let mut fresh = forum_at(SchemaVersion::V3_0);
        let differences = capture_schema(&mut db)
            .unwrap()
            .differences(&capture_schema(&mut fresh).unwrap());
        assert!(differences.is_empty(), "{}", differences.join("\n"));
    }
}
