//! Declarative table descriptors for every supported schema version.
//!
//! A [TableDef] describes the desired end state of a table. Nothing here issues DDL blindly:
//! [table_diff] compares a descriptor with what the database reports and [sync_table] applies
//! only the missing pieces.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::db::{DatabaseApi, InsertMode, Value};
use crate::error::Error;

pub mod v2_0;
pub mod v2_1;
pub mod v3_0;

/// A schema version of the forum database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SchemaVersion {
    #[serde(rename = "2.0")]
    V2_0,
    #[serde(rename = "2.1")]
    V2_1,
    #[serde(rename = "3.0")]
    V3_0,
}

impl SchemaVersion {
    pub const ALL: [SchemaVersion; 3] = [SchemaVersion::V2_0, SchemaVersion::V2_1, SchemaVersion::V3_0];

    pub const fn latest() -> Self {
        SchemaVersion::V3_0
    }

    pub const fn previous(&self) -> Option<Self> {
        match self {
            SchemaVersion::V2_0 => None,
            SchemaVersion::V2_1 => Some(SchemaVersion::V2_0),
            SchemaVersion::V3_0 => Some(SchemaVersion::V2_1),
        }
    }

    /// Namespace under which this version's migration steps are registered.
    pub const fn namespace(&self) -> &'static str {
        match self {
            SchemaVersion::V2_0 => "v2_0",
            SchemaVersion::V2_1 => "v2_1",
            SchemaVersion::V3_0 => "v3_0",
        }
    }

    /// Release string stored in the `smfVersion` setting once this version is installed.
    pub const fn release(&self) -> &'static str {
        match self {
            SchemaVersion::V2_0 => "2.0.19",
            SchemaVersion::V2_1 => "2.1.4",
            SchemaVersion::V3_0 => "3.0.0",
        }
    }

    /// Map a release string such as "2.1.4" or "3.0 Alpha 1" to its schema version.
    pub fn from_release(release: &str) -> Option<Self> {
        let mut parts = release.trim().split(|c: char| c == '.' || c.is_whitespace());
        let major = parts.next()?.parse::<u32>().ok()?;
        let minor = parts.next()?.parse::<u32>().ok()?;
        match (major, minor) {
            (2, 0) => Some(SchemaVersion::V2_0),
            (2, 1) => Some(SchemaVersion::V2_1),
            (3, 0) => Some(SchemaVersion::V3_0),
            _ => None,
        }
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SchemaVersion::V2_0 => "2.0",
            SchemaVersion::V2_1 => "2.1",
            SchemaVersion::V3_0 => "3.0",
        };
        f.write_str(text)
    }
}

impl std::str::FromStr for SchemaVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_release(s).ok_or_else(|| format!("unknown schema version '{}'", s))
    }
}

/// Column storage types, named after the forum's reference dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    TinyInt,
    SmallInt,
    MediumInt,
    Int,
    BigInt,
    Float,
    Char,
    VarChar,
    Text,
    MediumText,
}

impl ColumnKind {
    pub const fn sql_name(&self) -> &'static str {
        match self {
            ColumnKind::TinyInt => "tinyint",
            ColumnKind::SmallInt => "smallint",
            ColumnKind::MediumInt => "mediumint",
            ColumnKind::Int => "int",
            ColumnKind::BigInt => "bigint",
            ColumnKind::Float => "float",
            ColumnKind::Char => "char",
            ColumnKind::VarChar => "varchar",
            ColumnKind::Text => "text",
            ColumnKind::MediumText => "mediumtext",
        }
    }

    pub const fn is_numeric(&self) -> bool {
        matches!(
            self,
            ColumnKind::TinyInt
                | ColumnKind::SmallInt
                | ColumnKind::MediumInt
                | ColumnKind::Int
                | ColumnKind::BigInt
                | ColumnKind::Float
        )
    }
}

/// Target definition of a column.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDef {
    pub name: String,
    pub kind: ColumnKind,
    pub size: Option<u32>,
    pub not_null: bool,
    pub default: Option<Value>,
    pub auto_increment: bool,
    pub unsigned: bool,
}

impl ColumnDef {
    /// A NOT NULL column without a default.
    pub fn new(name: impl Into<String>, kind: ColumnKind) -> Self {
        Self {
            name: name.into(),
            kind,
            size: None,
            not_null: true,
            default: None,
            auto_increment: false,
            unsigned: false,
        }
    }

    pub fn varchar(name: impl Into<String>, size: u32) -> Self {
        Self::new(name, ColumnKind::VarChar).size(size)
    }

    pub fn text(name: impl Into<String>) -> Self {
        Self::new(name, ColumnKind::Text)
    }

    /// An unsigned auto-increment identifier.
    pub fn id(name: impl Into<String>, kind: ColumnKind) -> Self {
        Self::new(name, kind).unsigned().auto_increment()
    }

    /// An unsigned integer column defaulting to zero.
    pub fn counter(name: impl Into<String>, kind: ColumnKind) -> Self {
        Self::new(name, kind).unsigned().default(0)
    }

    pub fn size(mut self, size: u32) -> Self {
        self.size = Some(size);
        self
    }

    pub fn nullable(mut self) -> Self {
        self.not_null = false;
        self
    }

    pub fn default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }

    pub fn unsigned(mut self) -> Self {
        self.unsigned = true;
        self
    }

    /// The declared type, eg. `varchar(64)`. Text types never carry a size.
    pub fn type_sql(&self) -> String {
        match self.size {
            Some(size) if !matches!(self.kind, ColumnKind::Text | ColumnKind::MediumText) => {
                format!("{}({})", self.kind.sql_name(), size)
            }
            _ => self.kind.sql_name().to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum IndexKind {
    Primary,
    Unique,
    Index,
}

/// Target definition of an index.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct IndexDef {
    pub name: String,
    pub kind: IndexKind,
    pub columns: Vec<String>,
}

impl IndexDef {
    pub const PRIMARY: &'static str = "primary";

    pub fn primary(columns: &[&str]) -> Self {
        Self {
            name: Self::PRIMARY.to_string(),
            kind: IndexKind::Primary,
            columns: columns.iter().map(|c| c.to_string()).collect(),
        }
    }

    /// A plain index, named `idx_` followed by its columns unless renamed with [IndexDef::named].
    pub fn index(columns: &[&str]) -> Self {
        Self {
            name: format!("idx_{}", columns.join("_")),
            kind: IndexKind::Index,
            columns: columns.iter().map(|c| c.to_string()).collect(),
        }
    }

    pub fn unique(columns: &[&str]) -> Self {
        Self {
            kind: IndexKind::Unique,
            ..Self::index(columns)
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// Rows inserted right after a table is created. Text values may contain placeholders.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SeedRows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub keys: Vec<String>,
}

/// Target definition of a table.
#[derive(Debug, Clone, PartialEq)]
pub struct TableDef {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    pub indexes: Vec<IndexDef>,
    pub seeds: Option<SeedRows>,
}

impl TableDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            indexes: Vec::new(),
            seeds: None,
        }
    }

    pub fn column(mut self, column: ColumnDef) -> Self {
        self.columns.push(column);
        self
    }

    pub fn index(mut self, index: IndexDef) -> Self {
        self.indexes.push(index);
        self
    }

    pub fn primary(self, columns: &[&str]) -> Self {
        self.index(IndexDef::primary(columns))
    }

    /// Remove a column along with every index that references it.
    pub fn without_column(mut self, name: &str) -> Self {
        self.columns.retain(|c| c.name != name);
        self.indexes.retain(|i| !i.columns.iter().any(|c| c == name));
        self
    }

    /// Replace the definition of an existing column in place.
    pub fn replace_column(mut self, column: ColumnDef) -> Self {
        if let Some(existing) = self.columns.iter_mut().find(|c| c.name == column.name) {
            *existing = column;
        }
        self
    }

    pub fn seed(mut self, columns: &[&str], rows: Vec<Vec<Value>>, keys: &[&str]) -> Self {
        self.seeds = Some(SeedRows {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows,
            keys: keys.iter().map(|k| k.to_string()).collect(),
        });
        self
    }

    pub fn column_def(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn primary_index(&self) -> Option<&IndexDef> {
        self.indexes.iter().find(|i| i.kind == IndexKind::Primary)
    }
}

/// A column as reported by the database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub type_name: String,
    pub not_null: bool,
    pub default_value: Option<String>,
    pub primary_key: bool,
}

/// Values substituted for `{$name}` placeholders in seed rows.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Placeholders {
    values: BTreeMap<String, String>,
}

impl Placeholders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }

    pub fn substitute(&self, text: &str) -> String {
        let mut result = text.to_string();
        for (name, value) in &self.values {
            result = result.replace(&format!("{{${}}}", name), value);
        }
        result
    }

    fn apply(&self, value: &Value) -> Value {
        match value {
            Value::Text(text) => Value::Text(self.substitute(text)),
            other => other.clone(),
        }
    }
}

/// Difference between a target descriptor and the live table.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TableDiff {
    pub missing_table: bool,
    pub missing_columns: Vec<ColumnDef>,
    pub missing_indexes: Vec<IndexDef>,
    /// Indexes present under the target name but over different columns or with a different kind.
    pub changed_indexes: Vec<IndexDef>,
}

impl TableDiff {
    pub fn is_empty(&self) -> bool {
        !self.missing_table
            && self.missing_columns.is_empty()
            && self.missing_indexes.is_empty()
            && self.changed_indexes.is_empty()
    }
}

/// Compare `target` against the live database.
pub fn table_diff(db: &mut dyn DatabaseApi, target: &TableDef) -> Result<TableDiff, Error> {
    if !db.table_exists(&target.name)? {
        return Ok(TableDiff {
            missing_table: true,
            ..TableDiff::default()
        });
    }

    let columns = db.list_columns(&target.name)?;
    let indexes = db.list_indexes(&target.name)?;

    let missing_columns = target
        .columns
        .iter()
        .filter(|c| !columns.iter().any(|existing| existing.name == c.name))
        .cloned()
        .collect();

    let mut missing_indexes = Vec::new();
    let mut changed_indexes = Vec::new();
    for index in &target.indexes {
        match indexes.iter().find(|existing| existing.name == index.name) {
            None => missing_indexes.push(index.clone()),
            Some(existing) if existing.columns != index.columns || existing.kind != index.kind => {
                changed_indexes.push(index.clone())
            }
            Some(_) => {}
        }
    }

    Ok(TableDiff {
        missing_table: false,
        missing_columns,
        missing_indexes,
        changed_indexes,
    })
}

/// What [sync_table] changed.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SyncOutcome {
    pub created: bool,
    pub seeded: usize,
    pub columns_added: Vec<String>,
    pub indexes_added: Vec<String>,
}

impl SyncOutcome {
    pub fn changed(&self) -> bool {
        self.created || !self.columns_added.is_empty() || !self.indexes_added.is_empty()
    }
}

/// Bring one table in line with its descriptor: create it (and seed it) if missing, otherwise
/// add missing columns and indexes. Existing columns are never dropped or redefined here.
pub fn sync_table(
    db: &mut dyn DatabaseApi,
    target: &TableDef,
    placeholders: &Placeholders,
) -> Result<SyncOutcome, Error> {
    let diff = table_diff(db, target)?;
    let mut outcome = SyncOutcome::default();

    if diff.missing_table {
        db.create_table(target)?;
        outcome.created = true;
        outcome.seeded = seed_table(db, target, placeholders)?;
        tracing::debug!(table = %target.name, seeded = outcome.seeded, "Created table");
        return Ok(outcome);
    }

    for column in &diff.missing_columns {
        if db.add_column(&target.name, column)? {
            outcome.columns_added.push(column.name.clone());
        }
    }
    for index in &diff.changed_indexes {
        if index.kind == IndexKind::Primary {
            tracing::warn!(table = %target.name, "Primary key differs from target; leaving it unchanged");
            continue;
        }
        db.drop_index(&target.name, &index.name)?;
        db.add_index(&target.name, index)?;
        outcome.indexes_added.push(index.name.clone());
    }
    for index in &diff.missing_indexes {
        if db.add_index(&target.name, index)? {
            outcome.indexes_added.push(index.name.clone());
        }
    }

    if outcome.changed() {
        tracing::debug!(
            table = %target.name,
            columns = ?outcome.columns_added,
            indexes = ?outcome.indexes_added,
            "Synchronized table"
        );
    }
    Ok(outcome)
}

fn seed_table(
    db: &mut dyn DatabaseApi,
    target: &TableDef,
    placeholders: &Placeholders,
) -> Result<usize, Error> {
    let Some(seeds) = &target.seeds else {
        return Ok(0);
    };
    let rows: Vec<Vec<Value>> = seeds
        .rows
        .iter()
        .map(|row| row.iter().map(|v| placeholders.apply(v)).collect())
        .collect();
    let columns: Vec<&str> = seeds.columns.iter().map(String::as_str).collect();
    let keys: Vec<&str> = seeds.keys.iter().map(String::as_str).collect();
    db.insert(InsertMode::Ignore, &target.name, &columns, &rows, &keys)
}

/// Descriptors for every schema version, resolved once at startup.
#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    versions: BTreeMap<SchemaVersion, Vec<TableDef>>,
}

impl SchemaRegistry {
    pub fn builtin() -> Self {
        let mut versions = BTreeMap::new();
        versions.insert(SchemaVersion::V2_0, v2_0::tables());
        versions.insert(SchemaVersion::V2_1, v2_1::tables());
        versions.insert(SchemaVersion::V3_0, v3_0::tables());
        Self { versions }
    }

    pub fn tables(&self, version: SchemaVersion) -> &[TableDef] {
        self.versions
            .get(&version)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn table(&self, version: SchemaVersion, name: &str) -> Option<&TableDef> {
        self.tables(version).iter().find(|t| t.name == name)
    }

    /// Tables introduced by `version`.
    pub fn new_tables(&self, version: SchemaVersion) -> Vec<&TableDef> {
        let previous = version.previous().map(|v| self.tables(v)).unwrap_or_default();
        self.tables(version)
            .iter()
            .filter(|t| !previous.iter().any(|p| p.name == t.name))
            .collect()
    }

    /// Look up a column definition, failing if the descriptors do not know it.
    pub fn column(
        &self,
        version: SchemaVersion,
        table: &str,
        column: &str,
    ) -> Result<&ColumnDef, Error> {
        self.table(version, table)
            .and_then(|t| t.column_def(column))
            .ok_or_else(|| {
                Error::fatal(format!(
                    "no {} descriptor for column '{}.{}'",
                    version, table, column
                ))
            })
    }
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::SqliteDatabase;

    #[test]
    fn release_strings_map_to_versions() {
        assert_eq!(SchemaVersion::from_release("2.0.19"), Some(SchemaVersion::V2_0));
        assert_eq!(SchemaVersion::from_release("2.1"), Some(SchemaVersion::V2_1));
        assert_eq!(SchemaVersion::from_release("3.0 Alpha 1"), Some(SchemaVersion::V3_0));
        assert_eq!(SchemaVersion::from_release("1.1.21"), None);
        assert_eq!(SchemaVersion::from_release("garbage"), None);
        assert!(SchemaVersion::V2_0 < SchemaVersion::V3_0);
    }

    #[test]
    fn placeholders_are_substituted() {
        let placeholders = Placeholders::new()
            .with("boarddir", "/var/www/forum")
            .with("boardurl", "https://example.org");
        assert_eq!(
            placeholders.substitute("{$boarddir}/attachments at {$boardurl} {$unknown}"),
            "/var/www/forum/attachments at https://example.org {$unknown}"
        );
    }

    #[test]
    fn without_column_drops_dependent_indexes() {
        let table = TableDef::new("t")
            .column(ColumnDef::id("id", ColumnKind::Int))
            .column(ColumnDef::varchar("a", 10).default(""))
            .primary(&["id"])
            .index(IndexDef::index(&["a", "id"]))
            .without_column("a");
        assert_eq!(table.columns.len(), 1);
        assert_eq!(table.indexes, vec![IndexDef::primary(&["id"])]);
    }

    #[test]
    fn diff_and_sync_only_touch_missing_parts() {
        let mut db = SqliteDatabase::open_in_memory().unwrap();
        let v1 = TableDef::new("widgets")
            .column(ColumnDef::id("id_widget", ColumnKind::Int))
            .column(ColumnDef::varchar("name", 40).default(""))
            .primary(&["id_widget"])
            .seed(
                &["name"],
                vec![vec![Value::from("{$boarddir}/w")]],
                &["id_widget"],
            );
        let placeholders = Placeholders::new().with("boarddir", "/srv");

        let outcome = sync_table(&mut db, &v1, &placeholders).unwrap();
        assert!(outcome.created);
        assert_eq!(outcome.seeded, 1);
        let rows = db.query("SELECT name FROM widgets", &[]).unwrap();
        assert_eq!(rows[0].text("name").unwrap(), "/srv/w");

        let v2 = v1
            .clone()
            .column(ColumnDef::counter("size", ColumnKind::Int))
            .index(IndexDef::index(&["name"]));
        let diff = table_diff(&mut db, &v2).unwrap();
        assert!(!diff.missing_table);
        assert_eq!(diff.missing_columns.len(), 1);
        assert_eq!(diff.missing_indexes, vec![IndexDef::index(&["name"])]);

        let outcome = sync_table(&mut db, &v2, &placeholders).unwrap();
        assert_eq!(outcome.columns_added, vec!["size".to_string()]);
        assert_eq!(outcome.indexes_added, vec!["idx_name".to_string()]);
        assert!(table_diff(&mut db, &v2).unwrap().is_empty());

        // a second sync is a no-op and does not re-seed
        let outcome = sync_table(&mut db, &v2, &placeholders).unwrap();
        assert!(!outcome.changed());
        let rows = db.query("SELECT COUNT(*) AS n FROM widgets", &[]).unwrap();
        assert_eq!(rows[0].int("n").unwrap(), 1);
    }

    #[test]
    fn builtin_registry_resolves_tables_by_version() {
        let registry = SchemaRegistry::builtin();
        assert!(registry.table(SchemaVersion::V2_0, "members").is_some());
        assert!(registry.table(SchemaVersion::V2_0, "pm_labels").is_none());
        assert!(registry.table(SchemaVersion::V2_1, "pm_labels").is_some());
        let members = registry.table(SchemaVersion::V2_1, "members").unwrap();
        assert!(members.column_def("message_labels").is_none());
        let new: Vec<&str> = registry
            .new_tables(SchemaVersion::V3_0)
            .iter()
            .map(|t| t.name.as_str())
            .collect();
        assert_eq!(new, vec!["log_agreement_accept"]);
        assert_eq!(registry.new_tables(SchemaVersion::V2_1).len(), 4);
        assert_eq!(
            registry
                .column(SchemaVersion::V2_1, "log_actions", "ip")
                .unwrap()
                .type_sql(),
            "varchar(64)"
        );
        assert!(registry.column(SchemaVersion::V2_0, "log_actions", "nope").is_err());
        for version in SchemaVersion::ALL {
            for table in registry.tables(version) {
                assert!(
                    table.primary_index().is_some(),
                    "{} table {} has no primary key",
                    version,
                    table.name
                );
            }
        }
    }
}
