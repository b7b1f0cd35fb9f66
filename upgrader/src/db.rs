//! The database contract consumed by migration steps and tool phases.
//!
//! Steps never talk to a driver directly. They go through [DatabaseApi], which exposes
//! parametrized queries, schema introspection and the DDL operations an upgrade needs.
//! Every DDL method reports whether it changed anything, so callers can stay idempotent
//! without checking first.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::schema::{ColumnDef, ColumnInfo, IndexDef, TableDef};

/// A single value bound to or read from a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl Value {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            Value::Real(f) => Some(*f as i64),
            Value::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Integer(value.into())
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Value::Integer(value.into())
    }
}

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        Value::Integer(value as i64)
    }
}

impl From<usize> for Value {
    fn from(value: usize) -> Self {
        Value::Integer(value as i64)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Integer(value as i64)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Real(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

/// One row of a result set, addressable by position (`fetch_row`) or by name (`fetch_assoc`).
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<Value>,
}

impl Row {
    pub fn new(columns: Arc<[String]>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Positional access to every value in the row.
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn get_named(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|i| self.values.get(i))
    }

    /// Read a column as an integer, failing if it is missing or not numeric.
    pub fn int(&self, column: &str) -> Result<i64, Error> {
        self.get_named(column)
            .and_then(Value::as_i64)
            .ok_or_else(|| Error::Generic(format!("column '{}' is not an integer", column)))
    }

    /// Read a column as text. NULL reads as an empty string.
    pub fn text(&self, column: &str) -> Result<String, Error> {
        match self.get_named(column) {
            Some(Value::Text(s)) => Ok(s.clone()),
            Some(Value::Null) => Ok(String::new()),
            Some(Value::Integer(i)) => Ok(i.to_string()),
            Some(Value::Real(f)) => Ok(f.to_string()),
            Some(Value::Blob(b)) => Ok(String::from_utf8_lossy(b).into_owned()),
            None => Err(Error::Generic(format!("column '{}' not in result", column))),
        }
    }

    /// The row as a column name to value map.
    pub fn to_map(&self) -> BTreeMap<String, Value> {
        self.columns
            .iter()
            .cloned()
            .zip(self.values.iter().cloned())
            .collect()
    }
}

/// Conflict behavior of [DatabaseApi::insert].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertMode {
    /// Plain insert; conflicts are errors.
    Insert,
    /// Rows that collide with an existing key are dropped.
    Ignore,
    /// Rows that collide with an existing key replace it.
    Replace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionOp {
    Begin,
    Commit,
    Rollback,
}

/// The capability set the upgrade engine needs from a database, independent of SQL dialect.
pub trait DatabaseApi {
    /// Short engine name, eg. "sqlite".
    fn engine(&self) -> &'static str;

    /// Version string reported by the server or library.
    fn engine_version(&mut self) -> Result<String, Error>;

    /// Run a statement that returns rows.
    fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>, Error>;

    /// Run a statement that does not return rows, returning the number of affected rows.
    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<usize, Error>;

    /// Insert many rows. `keys` names the unique key used to detect conflicts for engines
    /// that cannot infer it.
    fn insert(
        &mut self,
        mode: InsertMode,
        table: &str,
        columns: &[&str],
        rows: &[Vec<Value>],
        keys: &[&str],
    ) -> Result<usize, Error>;

    /// Row id generated by the most recent successful insert.
    fn insert_id(&mut self) -> Result<i64, Error>;

    fn list_tables(&mut self) -> Result<Vec<String>, Error>;

    fn list_columns(&mut self, table: &str) -> Result<Vec<ColumnInfo>, Error>;

    fn list_indexes(&mut self, table: &str) -> Result<Vec<IndexDef>, Error>;

    /// Create a table. Returns false if it already existed.
    fn create_table(&mut self, table: &TableDef) -> Result<bool, Error>;

    /// Drop a table. Returns false if it did not exist.
    fn drop_table(&mut self, table: &str) -> Result<bool, Error>;

    /// Add a column. Returns false if it already existed.
    fn add_column(&mut self, table: &str, column: &ColumnDef) -> Result<bool, Error>;

    /// Drop a column. Returns false if it did not exist.
    fn drop_column(&mut self, table: &str, column: &str) -> Result<bool, Error>;

    /// Rename and/or redefine `old_name` as `column`. Returns false if `old_name` did not exist.
    fn change_column(
        &mut self,
        table: &str,
        old_name: &str,
        column: &ColumnDef,
    ) -> Result<bool, Error>;

    /// Add an index. Returns false if an index with that name already existed.
    fn add_index(&mut self, table: &str, index: &IndexDef) -> Result<bool, Error>;

    /// Drop an index by name. Returns false if it did not exist.
    fn drop_index(&mut self, table: &str, name: &str) -> Result<bool, Error>;

    /// Replace `destination` with a full copy of `source` (structure and rows).
    fn copy_table(&mut self, source: &str, destination: &str) -> Result<(), Error>;

    fn optimize_table(&mut self, table: &str) -> Result<(), Error>;

    fn transaction(&mut self, op: TransactionOp) -> Result<(), Error>;

    fn table_exists(&mut self, table: &str) -> Result<bool, Error> {
        Ok(self.list_tables()?.iter().any(|t| t == table))
    }

    fn column_exists(&mut self, table: &str, column: &str) -> Result<bool, Error> {
        Ok(self.list_columns(table)?.iter().any(|c| c.name == column))
    }

    /// Verify the connected account may create, alter and drop tables.
    /// Failure is fatal: an upgrade cannot run without these privileges.
    fn check_privileges(&mut self) -> Result<(), Error> {
        use crate::schema::ColumnKind;

        const SCRATCH: &str = "upgrader_privilege_check";
        let scratch = TableDef::new(SCRATCH).column(ColumnDef::new("id", ColumnKind::Int).default(0));
        let result = (|| {
            self.drop_table(SCRATCH)?;
            self.create_table(&scratch)?;
            self.add_column(SCRATCH, &ColumnDef::varchar("label", 16).default(""))?;
            self.drop_table(SCRATCH)?;
            Ok::<_, Error>(())
        })();
        result.map_err(|e| {
            Error::Fatal(format!(
                "the database account lacks CREATE, ALTER or DROP privileges: {}",
                e
            ))
        })
    }
}

/// Run `f` inside a transaction, committing on success and rolling back on failure.
pub fn transactional<T>(
    db: &mut dyn DatabaseApi,
    f: impl FnOnce(&mut dyn DatabaseApi) -> Result<T, Error>,
) -> Result<T, Error> {
    db.transaction(TransactionOp::Begin)?;
    match f(&mut *db) {
        Ok(value) => {
            db.transaction(TransactionOp::Commit)?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback) = db.transaction(TransactionOp::Rollback) {
                tracing::warn!(error = %rollback, "Rollback failed");
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_access_by_name_and_position() {
        let columns: Arc<[String]> = vec!["id".to_string(), "name".to_string()].into();
        let row = Row::new(columns, vec![Value::Integer(7), Value::from("alice")]);
        assert_eq!(row.int("id").unwrap(), 7);
        assert_eq!(row.text("name").unwrap(), "alice");
        assert_eq!(row.get(1), Some(&Value::Text("alice".to_string())));
        assert!(row.int("missing").is_err());
        assert_eq!(row.to_map().get("id"), Some(&Value::Integer(7)));
    }

    #[test]
    fn numeric_text_reads_as_integer() {
        assert_eq!(Value::from(" 42 ").as_i64(), Some(42));
        assert_eq!(Value::from("x").as_i64(), None);
        assert_eq!(Value::from(None::<i64>), Value::Null);
    }
}
