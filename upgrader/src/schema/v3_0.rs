//! The 3.0 schema. Also the layout a fresh install creates, so the seed rows live here.

use super::{v2_0, v2_1};
use super::{ColumnDef, ColumnKind, TableDef};
use crate::db::Value;

pub fn settings() -> TableDef {
    let rows = [
        ("language", "en_US"),
        ("boardurl", "{$boardurl}"),
        ("attachmentUploadDir", "{$boarddir}/attachments"),
        ("installed_time", "{$current_time}"),
        ("maintenance_mode", "0"),
        ("enable_alerts", "1"),
        ("alerts_auto_purge", "30"),
        ("gravatarEnabled", "1"),
        ("requireAgreement", "1"),
    ];
    v2_0::settings().seed(
        &["variable", "value"],
        rows.iter()
            .map(|(variable, value)| vec![Value::from(*variable), Value::from(*value)])
            .collect(),
        &["variable"],
    )
}

pub fn members() -> TableDef {
    v2_1::members().without_column("secret_question")
}

pub fn boards() -> TableDef {
    v2_0::boards().seed(
        &["id_cat", "board_order", "name", "description"],
        vec![vec![
            Value::from(1),
            Value::from(1),
            Value::from("General Discussion"),
            Value::from("Feel free to talk about anything and everything in this board."),
        ]],
        &["id_board"],
    )
}

pub fn log_agreement_accept() -> TableDef {
    TableDef::new("log_agreement_accept")
        .column(ColumnDef::varchar("version", 20).default(""))
        .column(ColumnDef::counter("id_member", ColumnKind::MediumInt))
        .column(ColumnDef::counter("accepted_time", ColumnKind::Int))
        .column(ColumnDef::varchar("accepted_ip", 255).default(""))
        .primary(&["version", "id_member"])
}

/// Tables that do not exist in 2.1.
pub fn new_tables() -> Vec<TableDef> {
    vec![log_agreement_accept()]
}

pub fn tables() -> Vec<TableDef> {
    let mut tables = vec![
        settings(),
        members(),
        v2_1::messages(),
        v2_0::topics(),
        boards(),
        v2_0::personal_messages(),
        v2_1::pm_recipients(),
        v2_1::log_actions(),
        v2_1::custom_fields(),
        v2_0::attachments(),
    ];
    tables.extend(v2_1::new_tables());
    tables.extend(new_tables());
    tables
}
