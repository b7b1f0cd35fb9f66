//! Phases of the installer, which creates a forum from scratch at the configured target.

use super::{finish, installed_version, Phase, ToolContext};
use crate::db::{InsertMode, Value};
use crate::error::Error;
use crate::schema::sync_table;
use crate::settings::SettingKey;

/// Oldest SQLite able to drop columns, which later upgrades rely on.
const MIN_SQLITE: (u32, u32) = (3, 35);

pub fn phases() -> Vec<Phase> {
    vec![
        Phase {
            id: "welcome",
            name: "Checking for an existing forum",
            title: Some("Welcome"),
            handler: welcome,
            weight: 2,
        },
        Phase {
            id: "database",
            name: "Checking the database",
            title: Some("Database settings"),
            handler: database,
            weight: 3,
        },
        Phase {
            id: "tables",
            name: "Creating tables",
            title: Some("Database population"),
            handler: tables,
            weight: 80,
        },
        Phase {
            id: "settings",
            name: "Saving settings",
            title: None,
            handler: settings,
            weight: 5,
        },
        Phase {
            id: "admin",
            name: "Creating the administrator account",
            title: Some("Administrator account"),
            handler: admin,
            weight: 5,
        },
        Phase {
            id: "finish",
            name: "Finishing",
            title: Some("Installation complete"),
            handler: finish,
            weight: 5,
        },
    ]
}

fn welcome(ctx: &mut ToolContext<'_>) -> Result<bool, Error> {
    if let Some(version) = installed_version(ctx.db)? {
        return Err(Error::fatal(format!(
            "a {} forum is already installed in this database; run the upgrade instead",
            version
        )));
    }
    Ok(true)
}

fn database(ctx: &mut ToolContext<'_>) -> Result<bool, Error> {
    let version = ctx.db.engine_version()?;
    if ctx.db.engine() == "sqlite" && !at_least(&version, MIN_SQLITE) {
        return Err(Error::fatal(format!(
            "SQLite {}.{} or newer is required, found {}",
            MIN_SQLITE.0, MIN_SQLITE.1, version
        )));
    }
    ctx.db.check_privileges()?;
    tracing::info!(engine = ctx.db.engine(), %version, "Database is usable");
    Ok(true)
}

fn at_least(version: &str, (major, minor): (u32, u32)) -> bool {
    let mut parts = version.split('.').map(|p| p.trim().parse::<u32>().unwrap_or(0));
    let found = (parts.next().unwrap_or(0), parts.next().unwrap_or(0));
    found >= (major, minor)
}

/// Creates the target tables with their seed rows, one table per substep.
fn tables(ctx: &mut ToolContext<'_>) -> Result<bool, Error> {
    let schema = ctx.schema;
    let tables = schema.tables(ctx.config.target);
    let placeholders = ctx.config.placeholders(ctx.now());
    ctx.state.total_items = tables.len() as u64;

    while let Some(table) = tables.get(ctx.state.substep) {
        let outcome = sync_table(ctx.db, table, &placeholders)?;
        tracing::info!(table = %table.name, created = outcome.created, seeded = outcome.seeded, "Table ready");
        ctx.advance_substep()?;
        if ctx.budget.expired() && ctx.state.substep < tables.len() {
            return Ok(false);
        }
    }
    Ok(true)
}

fn settings(ctx: &mut ToolContext<'_>) -> Result<bool, Error> {
    let target = ctx.config.target;
    let board_url = ctx.config.board_url.trim_end_matches('/').to_string();
    let installed_time = ctx.now().timestamp().to_string();

    let mut settings = ctx.settings();
    settings.set_if_missing(SettingKey::BoardUrl, board_url)?;
    settings.set_if_missing(SettingKey::InstalledTime, installed_time)?;
    settings.set_if_missing(SettingKey::Maintenance, "0")?;
    // written last: its presence marks the forum as installed
    settings.set(SettingKey::SmfVersion, target.release())?;
    Ok(true)
}

fn admin(ctx: &mut ToolContext<'_>) -> Result<bool, Error> {
    let config = ctx.config;
    let Some(account) = &config.admin else {
        return Err(Error::fatal(
            "no administrator account configured; add an [admin] section to the configuration",
        ));
    };

    let existing = ctx.db.query(
        "SELECT id_member FROM members WHERE member_name = ?1",
        &[account.name.as_str().into()],
    )?;
    if !existing.is_empty() {
        tracing::info!(name = %account.name, "Administrator already exists");
        return Ok(true);
    }

    let registered = ctx.now().timestamp();
    ctx.db.insert(
        InsertMode::Insert,
        "members",
        &[
            "member_name",
            "real_name",
            "email_address",
            "passwd",
            "date_registered",
            "id_group",
        ],
        &[vec![
            Value::from(account.name.as_str()),
            Value::from(account.name.as_str()),
            Value::from(account.email.as_str()),
            Value::from(account.password_hash.as_str()),
            Value::from(registered),
            Value::from(1),
        ]],
        &["id_member"],
    )?;
    let id_member = ctx.db.insert_id()?;
    tracing::info!(name = %account.name, id_member, "Created administrator");
    Ok(true)
}
