//! The 2.0 baseline schema, the oldest layout an upgrade can start from.

use super::{ColumnDef, ColumnKind, IndexDef, TableDef};

pub fn settings() -> TableDef {
    TableDef::new("settings")
        .column(ColumnDef::varchar("variable", 255).default(""))
        .column(ColumnDef::text("value"))
        .primary(&["variable"])
}

pub fn members() -> TableDef {
    TableDef::new("members")
        .column(ColumnDef::id("id_member", ColumnKind::MediumInt))
        .column(ColumnDef::varchar("member_name", 80).default(""))
        .column(ColumnDef::varchar("real_name", 255).default(""))
        .column(ColumnDef::varchar("email_address", 255).default(""))
        .column(ColumnDef::varchar("passwd", 64).default(""))
        .column(ColumnDef::counter("date_registered", ColumnKind::Int))
        .column(ColumnDef::counter("id_group", ColumnKind::SmallInt))
        .column(ColumnDef::varchar("lngfile", 255).default(""))
        .column(ColumnDef::text("message_labels"))
        .column(ColumnDef::varchar("secret_question", 255).default(""))
        .column(ColumnDef::counter("is_activated", ColumnKind::TinyInt).default(1))
        .primary(&["id_member"])
        .index(IndexDef::index(&["member_name"]))
        .index(IndexDef::index(&["id_group"]))
}

pub fn messages() -> TableDef {
    TableDef::new("messages")
        .column(ColumnDef::id("id_msg", ColumnKind::Int))
        .column(ColumnDef::counter("id_topic", ColumnKind::MediumInt))
        .column(ColumnDef::counter("id_board", ColumnKind::SmallInt))
        .column(ColumnDef::counter("poster_time", ColumnKind::Int))
        .column(ColumnDef::counter("id_member", ColumnKind::MediumInt))
        .column(ColumnDef::varchar("subject", 255).default(""))
        .column(ColumnDef::varchar("poster_name", 255).default(""))
        .column(ColumnDef::counter("modified_time", ColumnKind::Int))
        .column(ColumnDef::varchar("modified_name", 255).default(""))
        .column(ColumnDef::text("body"))
        .primary(&["id_msg"])
        .index(IndexDef::index(&["id_topic", "id_msg"]).named("topic"))
        .index(IndexDef::index(&["id_member", "id_msg"]).named("id_member_msg"))
}

pub fn topics() -> TableDef {
    TableDef::new("topics")
        .column(ColumnDef::id("id_topic", ColumnKind::MediumInt))
        .column(ColumnDef::counter("id_board", ColumnKind::SmallInt))
        .column(ColumnDef::counter("id_first_msg", ColumnKind::Int))
        .column(ColumnDef::counter("id_last_msg", ColumnKind::Int))
        .column(ColumnDef::counter("num_replies", ColumnKind::Int))
        .column(ColumnDef::counter("is_sticky", ColumnKind::TinyInt))
        .primary(&["id_topic"])
        .index(IndexDef::unique(&["id_board", "id_topic"]).named("board_topic"))
}

pub fn boards() -> TableDef {
    TableDef::new("boards")
        .column(ColumnDef::id("id_board", ColumnKind::SmallInt))
        .column(ColumnDef::counter("id_cat", ColumnKind::TinyInt))
        .column(ColumnDef::counter("board_order", ColumnKind::SmallInt))
        .column(ColumnDef::varchar("name", 255).default(""))
        .column(ColumnDef::text("description"))
        .column(ColumnDef::varchar("member_groups", 255).default("-1,0"))
        .primary(&["id_board"])
        .index(IndexDef::unique(&["id_cat", "id_board"]).named("categories"))
}

pub fn personal_messages() -> TableDef {
    TableDef::new("personal_messages")
        .column(ColumnDef::id("id_pm", ColumnKind::Int))
        .column(ColumnDef::counter("id_member_from", ColumnKind::MediumInt))
        .column(ColumnDef::counter("msgtime", ColumnKind::Int))
        .column(ColumnDef::varchar("subject", 255).default(""))
        .column(ColumnDef::text("body"))
        .primary(&["id_pm"])
        .index(IndexDef::index(&["id_member_from"]))
}

pub fn pm_recipients() -> TableDef {
    TableDef::new("pm_recipients")
        .column(ColumnDef::counter("id_pm", ColumnKind::Int))
        .column(ColumnDef::counter("id_member", ColumnKind::MediumInt))
        .column(ColumnDef::varchar("labels", 60).default("-1"))
        .column(ColumnDef::counter("is_read", ColumnKind::TinyInt))
        .column(ColumnDef::counter("deleted", ColumnKind::TinyInt))
        .primary(&["id_pm", "id_member"])
        .index(IndexDef::unique(&["id_member", "deleted", "id_pm"]).named("id_member"))
}

pub fn log_actions() -> TableDef {
    TableDef::new("log_actions")
        .column(ColumnDef::id("id_action", ColumnKind::Int))
        .column(ColumnDef::counter("id_log", ColumnKind::TinyInt).default(1))
        .column(ColumnDef::counter("log_time", ColumnKind::Int))
        .column(ColumnDef::counter("id_member", ColumnKind::MediumInt))
        .column(ColumnDef::varchar("ip", 16).default(""))
        .column(ColumnDef::varchar("action", 30).default(""))
        .column(ColumnDef::text("extra"))
        .primary(&["id_action"])
        .index(IndexDef::index(&["id_log"]))
        .index(IndexDef::index(&["log_time"]))
}

pub fn custom_fields() -> TableDef {
    TableDef::new("custom_fields")
        .column(ColumnDef::id("id_field", ColumnKind::SmallInt))
        .column(ColumnDef::varchar("col_name", 12).default(""))
        .column(ColumnDef::varchar("field_name", 40).default(""))
        .column(ColumnDef::varchar("field_type", 8).default("text"))
        .column(ColumnDef::counter("show_display", ColumnKind::TinyInt))
        .column(ColumnDef::counter("show_profile", ColumnKind::TinyInt))
        .column(ColumnDef::counter("active", ColumnKind::TinyInt).default(1))
        .column(ColumnDef::counter("private", ColumnKind::TinyInt))
        .column(ColumnDef::text("enclose"))
        .primary(&["id_field"])
        .index(IndexDef::unique(&["col_name"]))
}

pub fn attachments() -> TableDef {
    TableDef::new("attachments")
        .column(ColumnDef::id("id_attach", ColumnKind::Int))
        .column(ColumnDef::counter("id_msg", ColumnKind::Int))
        .column(ColumnDef::counter("id_member", ColumnKind::MediumInt))
        .column(ColumnDef::varchar("filename", 255).default(""))
        .column(ColumnDef::varchar("file_hash", 40).default(""))
        .column(ColumnDef::counter("size", ColumnKind::Int))
        .primary(&["id_attach"])
        .index(IndexDef::index(&["id_msg"]))
}

pub fn tables() -> Vec<TableDef> {
    vec![
        settings(),
        members(),
        messages(),
        topics(),
        boards(),
        personal_messages(),
        pm_recipients(),
        log_actions(),
        custom_fields(),
        attachments(),
    ]
}
