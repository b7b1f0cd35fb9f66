//! Steps taking a 2.0 forum to 2.1.

use std::collections::HashMap;

use serde::Serialize;
use sha2::{Digest, Sha256};

use super::{CreateNewTables, SyncSchema};
use crate::db::{transactional, DatabaseApi, InsertMode, Value};
use crate::error::Error;
use crate::schema::SchemaVersion;
use crate::settings::SettingKey;
use crate::step::{Batch, BatchProgress, MigrationStep, StepContext};

const VERSION: SchemaVersion = SchemaVersion::V2_1;

pub fn steps() -> Vec<Box<dyn MigrationStep>> {
    vec![
        Box::new(CreateNewTables(VERSION)),
        Box::new(AddModifiedReason),
        Box::new(WidenIpColumns),
        Box::new(PmLabels),
        Box::new(AttachmentHashes),
        Box::new(CustomFieldsDisplay),
        Box::new(SettingsDefaults),
        Box::new(SyncSchema(VERSION)),
    ]
}

pub struct AddModifiedReason;

impl MigrationStep for AddModifiedReason {
    fn name(&self) -> String {
        "Adding messages.modified_reason".to_string()
    }

    fn is_candidate(&self, ctx: &mut StepContext<'_>) -> Result<bool, Error> {
        Ok(!ctx.db.column_exists("messages", "modified_reason")?)
    }

    fn execute(&self, ctx: &mut StepContext<'_>) -> Result<bool, Error> {
        let column = ctx.schema.column(VERSION, "messages", "modified_reason")?;
        ctx.db.add_column("messages", column)?;
        Ok(true)
    }
}

/// IPv6 addresses do not fit the 2.0 columns.
pub struct WidenIpColumns;

const IP_COLUMNS: [(&str, &str); 1] = [("log_actions", "ip")];

impl MigrationStep for WidenIpColumns {
    fn name(&self) -> String {
        "Widening IP address columns".to_string()
    }

    fn is_candidate(&self, ctx: &mut StepContext<'_>) -> Result<bool, Error> {
        for (table, column) in IP_COLUMNS {
            let target = ctx.schema.column(VERSION, table, column)?;
            let current = ctx.db.list_columns(table)?;
            if let Some(info) = current.iter().find(|c| c.name == column) {
                if info.type_name != target.type_sql() {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    fn execute(&self, ctx: &mut StepContext<'_>) -> Result<bool, Error> {
        for (table, column) in IP_COLUMNS {
            let target = ctx.schema.column(VERSION, table, column)?;
            ctx.db.change_column(table, column, target)?;
        }
        Ok(true)
    }
}

/// Moves personal message labels out of the comma separated `members.message_labels` and
/// `pm_recipients.labels` columns into `pm_labels` and `pm_labeled_messages`.
///
/// Members are converted a batch at a time, each batch in its own transaction. A member's
/// labels are deleted and recreated, so replaying a batch after a lost checkpoint is harmless.
/// The legacy columns are dropped only once every member has been converted.
pub struct PmLabels;

impl MigrationStep for PmLabels {
    fn name(&self) -> String {
        "Converting personal message labels".to_string()
    }

    fn description(&self) -> Option<&'static str> {
        Some("Moves labels into their own tables and records which messages are in the inbox")
    }

    fn is_candidate(&self, ctx: &mut StepContext<'_>) -> Result<bool, Error> {
        Ok(ctx.db.column_exists("members", "message_labels")?
            || ctx.db.column_exists("pm_recipients", "labels")?)
    }

    fn execute(&self, ctx: &mut StepContext<'_>) -> Result<bool, Error> {
        let in_inbox = ctx.schema.column(VERSION, "pm_recipients", "in_inbox")?;
        ctx.db.add_column("pm_recipients", in_inbox)?;

        if ctx.db.column_exists("members", "message_labels")? {
            let finished = ctx.batched(|ctx, batch| convert_member_labels(ctx.db, batch))?;
            if !finished {
                return Ok(false);
            }
            ctx.db.drop_column("members", "message_labels")?;
        }

        if ctx.db.column_exists("pm_recipients", "labels")? {
            ctx.db.execute(
                "UPDATE pm_recipients SET in_inbox = CASE WHEN (',' || labels || ',') LIKE '%,-1,%' THEN 1 ELSE 0 END",
                &[],
            )?;
            ctx.db.drop_column("pm_recipients", "labels")?;
        }
        Ok(true)
    }
}

fn convert_member_labels(db: &mut dyn DatabaseApi, batch: Batch) -> Result<BatchProgress, Error> {
    let members = db.query(
        "SELECT id_member, message_labels FROM members WHERE message_labels != '' ORDER BY id_member LIMIT ?1 OFFSET ?2",
        &[batch.size.into(), batch.start.into()],
    )?;

    transactional(db, |db| {
        for member in &members {
            let id_member = member.int("id_member")?;
            db.execute(
                "DELETE FROM pm_labeled_messages WHERE id_label IN (SELECT id_label FROM pm_labels WHERE id_member = ?1)",
                &[id_member.into()],
            )?;
            db.execute("DELETE FROM pm_labels WHERE id_member = ?1", &[id_member.into()])?;

            // recipients refer to labels by their position in the member's list;
            // a repeated name keeps one label and every position points at it
            let names = member.text("message_labels")?;
            let mut by_name: HashMap<&str, i64> = HashMap::new();
            let mut label_ids = Vec::new();
            for name in names.split(',') {
                let name = name.trim();
                if name.is_empty() {
                    label_ids.push(None);
                    continue;
                }
                if let Some(id_label) = by_name.get(name) {
                    label_ids.push(Some(*id_label));
                    continue;
                }
                db.insert(
                    InsertMode::Insert,
                    "pm_labels",
                    &["id_member", "name"],
                    &[vec![id_member.into(), name.into()]],
                    &["id_label"],
                )?;
                let id_label = db.insert_id()?;
                by_name.insert(name, id_label);
                label_ids.push(Some(id_label));
            }

            let recipients = db.query(
                "SELECT id_pm, labels FROM pm_recipients WHERE id_member = ?1 AND labels NOT IN ('', '-1')",
                &[id_member.into()],
            )?;
            let mut links = Vec::new();
            for recipient in &recipients {
                let id_pm = recipient.int("id_pm")?;
                for position in recipient.text("labels")?.split(',') {
                    let Ok(position) = position.trim().parse::<usize>() else {
                        continue;
                    };
                    if let Some(Some(id_label)) = label_ids.get(position) {
                        links.push(vec![Value::from(*id_label), Value::from(id_pm)]);
                    }
                }
            }
            db.insert(
                InsertMode::Ignore,
                "pm_labeled_messages",
                &["id_label", "id_pm"],
                &links,
                &["id_label", "id_pm"],
            )?;
        }
        Ok(())
    })?;

    let fetched = members.len() as u64;
    Ok(if fetched < batch.size {
        BatchProgress::Done
    } else {
        BatchProgress::Next(batch.start + fetched)
    })
}

/// Fills in `attachments.file_hash` for attachments stored before hashes were recorded.
/// The offset is the last processed `id_attach`.
pub struct AttachmentHashes;

impl MigrationStep for AttachmentHashes {
    fn name(&self) -> String {
        "Filling in attachment hashes".to_string()
    }

    fn is_candidate(&self, ctx: &mut StepContext<'_>) -> Result<bool, Error> {
        Ok(ctx.db.table_exists("attachments")?
            && ctx.settings().get(SettingKey::AttachmentsDone21)?.is_none())
    }

    fn execute(&self, ctx: &mut StepContext<'_>) -> Result<bool, Error> {
        let finished = ctx.batched(|ctx, batch| {
            let attachments = ctx.db.query(
                "SELECT id_attach, filename FROM attachments WHERE id_attach > ?1 AND file_hash = '' ORDER BY id_attach LIMIT ?2",
                &[batch.start.into(), batch.size.into()],
            )?;
            let mut last = batch.start;
            transactional(ctx.db, |db| {
                for attachment in &attachments {
                    let id_attach = attachment.int("id_attach")?;
                    let hash = file_hash(id_attach, &attachment.text("filename")?);
                    db.execute(
                        "UPDATE attachments SET file_hash = ?1 WHERE id_attach = ?2",
                        &[hash.into(), id_attach.into()],
                    )?;
                    last = id_attach as u64;
                }
                Ok(())
            })?;
            Ok(if (attachments.len() as u64) < batch.size {
                BatchProgress::Done
            } else {
                BatchProgress::Next(last)
            })
        })?;
        if finished {
            ctx.settings().set(SettingKey::AttachmentsDone21, "1")?;
        }
        Ok(finished)
    }
}

fn file_hash(id_attach: i64, filename: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(id_attach.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(filename.as_bytes());
    let mut hash = format!("{:x}", hasher.finalize());
    hash.truncate(40);
    hash
}

#[derive(Debug, Serialize)]
struct DisplayField {
    col_name: String,
    title: String,
    #[serde(rename = "type")]
    field_type: String,
    placement: i64,
    enclose: String,
    mlist: bool,
    private: i64,
}

/// Caches the custom fields shown alongside posts in the `displayFields` setting.
pub struct CustomFieldsDisplay;

impl MigrationStep for CustomFieldsDisplay {
    fn name(&self) -> String {
        "Updating custom field display settings".to_string()
    }

    fn is_candidate(&self, ctx: &mut StepContext<'_>) -> Result<bool, Error> {
        Ok(ctx.settings().get(SettingKey::DisplayFields)?.is_none())
    }

    fn execute(&self, ctx: &mut StepContext<'_>) -> Result<bool, Error> {
        let placement = ctx.schema.column(VERSION, "custom_fields", "placement")?;
        ctx.db.add_column("custom_fields", placement)?;

        let rows = ctx.db.query(
            "SELECT col_name, field_name, field_type, placement, enclose, show_profile, private FROM custom_fields WHERE active = 1 AND show_display = 1 ORDER BY id_field",
            &[],
        )?;
        let fields = rows
            .iter()
            .map(|row| {
                Ok(DisplayField {
                    col_name: row.text("col_name")?,
                    title: row.text("field_name")?,
                    field_type: row.text("field_type")?,
                    placement: row.int("placement")?,
                    enclose: row.text("enclose")?,
                    mlist: row.int("show_profile")? != 0,
                    private: row.int("private")?,
                })
            })
            .collect::<Result<Vec<_>, Error>>()?;

        let json = serde_json::to_string(&fields)?;
        ctx.settings().set(SettingKey::DisplayFields, json)?;
        Ok(true)
    }
}

/// Settings introduced by 2.1, and their defaults.
const NEW_SETTINGS: [(SettingKey, &str); 3] = [
    (SettingKey::EnableAlerts, "1"),
    (SettingKey::AlertsAutoPurge, "30"),
    (SettingKey::GravatarEnabled, "1"),
];

const REMOVED_SETTINGS: [SettingKey; 2] = [SettingKey::EnableOpenId, SettingKey::SecretQuestion];

pub struct SettingsDefaults;

impl MigrationStep for SettingsDefaults {
    fn name(&self) -> String {
        "Updating settings".to_string()
    }

    fn is_candidate(&self, ctx: &mut StepContext<'_>) -> Result<bool, Error> {
        let mut settings = ctx.settings();
        for (key, _) in NEW_SETTINGS {
            if settings.get(key)?.is_none() {
                return Ok(true);
            }
        }
        for key in REMOVED_SETTINGS {
            if settings.get(key)?.is_some() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn execute(&self, ctx: &mut StepContext<'_>) -> Result<bool, Error> {
        let mut settings = ctx.settings();
        for (key, value) in NEW_SETTINGS {
            settings.set_if_missing(key, value)?;
        }
        for key in REMOVED_SETTINGS {
            settings.remove(key)?;
        }
        Ok(true)
    }
}
