//! The 2.1 schema, expressed as changes over the 2.0 baseline.

use super::v2_0;
use super::{ColumnDef, ColumnKind, IndexDef, TableDef};

pub fn members() -> TableDef {
    v2_0::members().without_column("message_labels")
}

pub fn messages() -> TableDef {
    v2_0::messages().column(ColumnDef::varchar("modified_reason", 255).default(""))
}

pub fn pm_recipients() -> TableDef {
    v2_0::pm_recipients()
        .without_column("labels")
        .column(ColumnDef::counter("in_inbox", ColumnKind::TinyInt).default(1))
}

pub fn log_actions() -> TableDef {
    v2_0::log_actions().replace_column(ColumnDef::varchar("ip", 64).default(""))
}

pub fn custom_fields() -> TableDef {
    v2_0::custom_fields().column(ColumnDef::counter("placement", ColumnKind::TinyInt))
}

pub fn pm_labels() -> TableDef {
    TableDef::new("pm_labels")
        .column(ColumnDef::id("id_label", ColumnKind::Int))
        .column(ColumnDef::counter("id_member", ColumnKind::MediumInt))
        .column(ColumnDef::varchar("name", 30).default(""))
        .primary(&["id_label"])
        .index(IndexDef::index(&["id_member"]))
}

pub fn pm_labeled_messages() -> TableDef {
    TableDef::new("pm_labeled_messages")
        .column(ColumnDef::counter("id_label", ColumnKind::Int))
        .column(ColumnDef::counter("id_pm", ColumnKind::Int))
        .primary(&["id_label", "id_pm"])
}

pub fn user_alerts() -> TableDef {
    TableDef::new("user_alerts")
        .column(ColumnDef::id("id_alert", ColumnKind::Int))
        .column(ColumnDef::counter("alert_time", ColumnKind::Int))
        .column(ColumnDef::counter("id_member", ColumnKind::MediumInt))
        .column(ColumnDef::counter("id_member_started", ColumnKind::MediumInt))
        .column(ColumnDef::varchar("member_name", 255).default(""))
        .column(ColumnDef::varchar("content_type", 255).default(""))
        .column(ColumnDef::counter("content_id", ColumnKind::Int))
        .column(ColumnDef::varchar("content_action", 255).default(""))
        .column(ColumnDef::counter("is_read", ColumnKind::Int))
        .column(ColumnDef::text("extra"))
        .primary(&["id_alert"])
        .index(IndexDef::index(&["id_member"]))
        .index(IndexDef::index(&["alert_time"]))
}

pub fn background_tasks() -> TableDef {
    TableDef::new("background_tasks")
        .column(ColumnDef::id("id_task", ColumnKind::Int))
        .column(ColumnDef::varchar("task_file", 255).default(""))
        .column(ColumnDef::varchar("task_class", 255).default(""))
        .column(ColumnDef::new("task_data", ColumnKind::MediumText))
        .column(ColumnDef::counter("claimed_time", ColumnKind::Int))
        .primary(&["id_task"])
}

/// Tables that do not exist in 2.0.
pub fn new_tables() -> Vec<TableDef> {
    vec![pm_labels(), pm_labeled_messages(), user_alerts(), background_tasks()]
}

pub fn tables() -> Vec<TableDef> {
    let mut tables = vec![
        v2_0::settings(),
        members(),
        messages(),
        v2_0::topics(),
        v2_0::boards(),
        v2_0::personal_messages(),
        pm_recipients(),
        log_actions(),
        custom_fields(),
        v2_0::attachments(),
    ];
    tables.extend(new_tables());
    tables
}
