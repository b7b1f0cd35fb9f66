//! [DatabaseApi] over a SQLite connection.
//!
//! Index names are namespaced per table on disk (`{table}_{index}`), since SQLite index names
//! are global to the database. The primary key is reported from `PRAGMA table_info` under the
//! name [IndexDef::PRIMARY].

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rusqlite::types::{ToSql, ToSqlOutput, Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection, OptionalExtension};

use crate::db::{DatabaseApi, InsertMode, Row, TransactionOp, Value};
use crate::error::Error;
use crate::schema::{ColumnDef, ColumnInfo, IndexDef, IndexKind, TableDef};

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(SqlValue::Null),
            Value::Integer(i) => ToSqlOutput::Owned(SqlValue::Integer(*i)),
            Value::Real(f) => ToSqlOutput::Owned(SqlValue::Real(*f)),
            Value::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            Value::Blob(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
        })
    }
}

impl From<ValueRef<'_>> for Value {
    fn from(value: ValueRef<'_>) -> Self {
        match value {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(i) => Value::Integer(i),
            ValueRef::Real(f) => Value::Real(f),
            ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => Value::Blob(b.to_vec()),
        }
    }
}

/// A forum database stored in SQLite.
#[derive(Debug)]
pub struct SqliteDatabase {
    conn: Connection,
}

impl SqliteDatabase {
    /// Open (or create) a database file. `busy_timeout` bounds how long a statement waits on a
    /// lock held by another connection before failing.
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self, Error> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, Error> {
        Ok(Self {
            conn: Connection::open_in_memory()?,
        })
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self { conn }
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    fn index_exists(&self, full_name: &str) -> Result<bool, Error> {
        let found = self
            .conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'index' AND name = ?1",
                [full_name],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn table_sql(&self, table: &str) -> Result<String, Error> {
        let sql: Option<String> = self
            .conn
            .query_row(
                "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [table],
                |row| row.get(0),
            )
            .optional()?;
        sql.ok_or_else(|| Error::Generic(format!("table '{}' does not exist", table)))
    }

    fn primary_columns(&self, table: &str) -> Result<Vec<String>, Error> {
        let mut stmt = self
            .conn
            .prepare(&format!("PRAGMA table_info({})", quote(table)))?;
        let mut columns = stmt
            .query_map([], |row| Ok((row.get::<_, i64>(5)?, row.get::<_, String>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        columns.retain(|(pk, _)| *pk > 0);
        columns.sort_by_key(|(pk, _)| *pk);
        Ok(columns.into_iter().map(|(_, name)| name).collect())
    }

    /// Recreate `table` with `column` redefined, keeping its rows, primary key and indexes.
    fn rebuild_with(&mut self, table: &str, column: &ColumnDef) -> Result<(), Error> {
        let columns = self.list_columns(table)?;
        let primary = self.primary_columns(table)?;
        let autoincrement = self.table_sql(table)?.to_uppercase().contains("AUTOINCREMENT");
        let single_integer_pk = primary.len() == 1
            && columns
                .iter()
                .any(|c| c.name == primary[0] && c.type_name == "integer");

        let mut defs = Vec::with_capacity(columns.len() + 1);
        for info in &columns {
            if info.name == column.name {
                defs.push(column_sql(column, false));
            } else if single_integer_pk && autoincrement && info.name == primary[0] {
                defs.push(format!("{} INTEGER PRIMARY KEY AUTOINCREMENT", quote(&info.name)));
            } else {
                let mut def = format!("{} {}", quote(&info.name), info.type_name);
                if info.not_null {
                    def.push_str(" NOT NULL");
                }
                if let Some(default) = &info.default_value {
                    def.push_str(&format!(" DEFAULT {}", default));
                }
                defs.push(def);
            }
        }
        if !primary.is_empty() && !(single_integer_pk && autoincrement) {
            defs.push(format!("PRIMARY KEY ({})", quote_list(&primary)));
        }

        let index_sql: Vec<String> = {
            let mut stmt = self.conn.prepare(
                "SELECT sql FROM sqlite_master WHERE type = 'index' AND tbl_name = ?1 AND sql IS NOT NULL",
            )?;
            let rows = stmt.query_map([table], |row| row.get(0))?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        let staging = format!("{}__rebuild", table);
        let names: Vec<String> = columns.iter().map(|c| c.name.clone()).collect();
        let column_list = quote_list(&names);

        self.conn.execute_batch("SAVEPOINT change_column")?;
        let result = (|| -> Result<(), Error> {
            self.conn.execute(&format!("DROP TABLE IF EXISTS {}", quote(&staging)), [])?;
            self.conn.execute(
                &format!("CREATE TABLE {} ({})", quote(&staging), defs.join(", ")),
                [],
            )?;
            self.conn.execute(
                &format!(
                    "INSERT INTO {} ({}) SELECT {} FROM {}",
                    quote(&staging),
                    column_list,
                    column_list,
                    quote(table)
                ),
                [],
            )?;
            self.conn.execute(&format!("DROP TABLE {}", quote(table)), [])?;
            self.conn.execute(
                &format!("ALTER TABLE {} RENAME TO {}", quote(&staging), quote(table)),
                [],
            )?;
            for sql in &index_sql {
                self.conn.execute(sql, [])?;
            }
            Ok(())
        })();

        match result {
            Ok(()) => {
                self.conn.execute_batch("RELEASE change_column")?;
                Ok(())
            }
            Err(e) => {
                self.conn
                    .execute_batch("ROLLBACK TO change_column; RELEASE change_column")?;
                Err(e)
            }
        }
    }
}

impl DatabaseApi for SqliteDatabase {
    fn engine(&self) -> &'static str {
        "sqlite"
    }

    fn engine_version(&mut self) -> Result<String, Error> {
        Ok(self
            .conn
            .query_row("SELECT sqlite_version()", [], |row| row.get(0))?)
    }

    fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>, Error> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        let columns: Arc<[String]> = stmt.column_names().into_iter().map(String::from).collect();
        let width = columns.len();
        let mut rows = stmt.query(params_from_iter(params.iter()))?;
        let mut result = Vec::new();
        while let Some(row) = rows.next()? {
            let values = (0..width)
                .map(|i| row.get_ref(i).map(Value::from))
                .collect::<Result<Vec<_>, _>>()?;
            result.push(Row::new(Arc::clone(&columns), values));
        }
        Ok(result)
    }

    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<usize, Error> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        Ok(stmt.execute(params_from_iter(params.iter()))?)
    }

    fn insert(
        &mut self,
        mode: InsertMode,
        table: &str,
        columns: &[&str],
        rows: &[Vec<Value>],
        _keys: &[&str],
    ) -> Result<usize, Error> {
        if rows.is_empty() {
            return Ok(0);
        }
        let verb = match mode {
            InsertMode::Insert => "INSERT",
            InsertMode::Ignore => "INSERT OR IGNORE",
            InsertMode::Replace => "INSERT OR REPLACE",
        };
        let placeholders = vec!["?"; columns.len()].join(", ");
        let sql = format!(
            "{} INTO {} ({}) VALUES ({})",
            verb,
            quote(table),
            quote_list(columns),
            placeholders
        );
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let mut inserted = 0;
        for row in rows {
            if row.len() != columns.len() {
                return Err(Error::Generic(format!(
                    "insert into '{}' has {} columns but a row with {} values",
                    table,
                    columns.len(),
                    row.len()
                )));
            }
            inserted += stmt.execute(params_from_iter(row.iter()))?;
        }
        Ok(inserted)
    }

    fn insert_id(&mut self) -> Result<i64, Error> {
        Ok(self.conn.last_insert_rowid())
    }

    fn list_tables(&mut self) -> Result<Vec<String>, Error> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )?;
        let tables = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(tables)
    }

    fn list_columns(&mut self, table: &str) -> Result<Vec<ColumnInfo>, Error> {
        let mut stmt = self
            .conn
            .prepare(&format!("PRAGMA table_info({})", quote(table)))?;
        let columns = stmt
            .query_map([], |row| {
                Ok(ColumnInfo {
                    name: row.get(1)?,
                    type_name: row.get::<_, String>(2)?.to_lowercase(),
                    not_null: row.get::<_, i64>(3)? != 0,
                    default_value: row.get(4)?,
                    primary_key: row.get::<_, i64>(5)? > 0,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(columns)
    }

    fn list_indexes(&mut self, table: &str) -> Result<Vec<IndexDef>, Error> {
        let mut indexes = Vec::new();
        let primary = self.primary_columns(table)?;
        if !primary.is_empty() {
            let columns: Vec<&str> = primary.iter().map(String::as_str).collect();
            indexes.push(IndexDef::primary(&columns));
        }

        let listed: Vec<(String, bool, String)> = {
            let mut stmt = self
                .conn
                .prepare(&format!("PRAGMA index_list({})", quote(table)))?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get(1)?, row.get::<_, i64>(2)? != 0, row.get(3)?))
            })?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        let prefix = format!("{}_", table);
        for (full_name, unique, origin) in listed {
            if origin != "c" {
                continue;
            }
            let mut stmt = self
                .conn
                .prepare(&format!("PRAGMA index_info({})", quote(&full_name)))?;
            let mut columns = stmt
                .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(2)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            columns.sort_by_key(|(seq, _)| *seq);
            indexes.push(IndexDef {
                name: full_name
                    .strip_prefix(&prefix)
                    .unwrap_or(&full_name)
                    .to_string(),
                kind: if unique { IndexKind::Unique } else { IndexKind::Index },
                columns: columns.into_iter().map(|(_, name)| name).collect(),
            });
        }
        indexes.sort_by(|a, b| a.kind.cmp(&b.kind).then_with(|| a.name.cmp(&b.name)));
        Ok(indexes)
    }

    fn create_table(&mut self, table: &TableDef) -> Result<bool, Error> {
        if self.table_exists(&table.name)? {
            return Ok(false);
        }
        let primary = table.primary_index();
        let mut defs = Vec::with_capacity(table.columns.len() + 1);
        let mut inline_primary = false;
        for column in &table.columns {
            let is_rowid = column.auto_increment
                && primary.is_some_and(|p| p.columns.len() == 1 && p.columns[0] == column.name);
            inline_primary |= is_rowid;
            defs.push(column_sql(column, is_rowid));
        }
        if let (Some(primary), false) = (primary, inline_primary) {
            defs.push(format!("PRIMARY KEY ({})", quote_list(&primary.columns)));
        }
        self.conn.execute(
            &format!("CREATE TABLE {} ({})", quote(&table.name), defs.join(", ")),
            [],
        )?;
        for index in table.indexes.iter().filter(|i| i.kind != IndexKind::Primary) {
            self.add_index(&table.name, index)?;
        }
        Ok(true)
    }

    fn drop_table(&mut self, table: &str) -> Result<bool, Error> {
        if !self.table_exists(table)? {
            return Ok(false);
        }
        self.conn.execute(&format!("DROP TABLE {}", quote(table)), [])?;
        Ok(true)
    }

    fn add_column(&mut self, table: &str, column: &ColumnDef) -> Result<bool, Error> {
        if self.column_exists(table, &column.name)? {
            return Ok(false);
        }
        if column.auto_increment {
            return Err(Error::Generic(format!(
                "cannot add auto-increment column '{}' to existing table '{}'",
                column.name, table
            )));
        }
        // SQLite refuses NOT NULL columns without a default on populated tables
        let mut column = column.clone();
        if column.not_null && column.default.is_none() {
            column.default = Some(if column.kind.is_numeric() {
                Value::Integer(0)
            } else {
                Value::Text(String::new())
            });
        }
        self.conn.execute(
            &format!(
                "ALTER TABLE {} ADD COLUMN {}",
                quote(table),
                column_sql(&column, false)
            ),
            [],
        )?;
        Ok(true)
    }

    fn drop_column(&mut self, table: &str, column: &str) -> Result<bool, Error> {
        if !self.column_exists(table, column)? {
            return Ok(false);
        }
        for index in self.list_indexes(table)? {
            if index.kind != IndexKind::Primary && index.columns.iter().any(|c| c == column) {
                self.drop_index(table, &index.name)?;
            }
        }
        self.conn.execute(
            &format!("ALTER TABLE {} DROP COLUMN {}", quote(table), quote(column)),
            [],
        )?;
        Ok(true)
    }

    fn change_column(
        &mut self,
        table: &str,
        old_name: &str,
        column: &ColumnDef,
    ) -> Result<bool, Error> {
        if !self.column_exists(table, old_name)? {
            return Ok(false);
        }
        if old_name != column.name {
            if self.column_exists(table, &column.name)? {
                return Err(Error::Generic(format!(
                    "cannot rename '{}.{}' to '{}': column exists",
                    table, old_name, column.name
                )));
            }
            self.conn.execute(
                &format!(
                    "ALTER TABLE {} RENAME COLUMN {} TO {}",
                    quote(table),
                    quote(old_name),
                    quote(&column.name)
                ),
                [],
            )?;
        }

        let current = self
            .list_columns(table)?
            .into_iter()
            .find(|c| c.name == column.name)
            .ok_or_else(|| Error::Generic(format!("column '{}.{}' vanished", table, column.name)))?;
        let wanted_default = column.default.as_ref().map(default_literal);
        let unchanged = current.type_name == column.type_sql()
            && current.not_null == column.not_null
            && current.default_value == wanted_default;
        if !unchanged {
            self.rebuild_with(table, column)?;
        }
        Ok(true)
    }

    fn add_index(&mut self, table: &str, index: &IndexDef) -> Result<bool, Error> {
        if index.kind == IndexKind::Primary {
            let existing = self.primary_columns(table)?;
            if existing == index.columns {
                return Ok(false);
            }
            return Err(Error::Generic(format!(
                "cannot change the primary key of '{}' in place",
                table
            )));
        }
        let full_name = format!("{}_{}", table, index.name);
        if self.index_exists(&full_name)? {
            return Ok(false);
        }
        let unique = if index.kind == IndexKind::Unique {
            "UNIQUE "
        } else {
            ""
        };
        self.conn.execute(
            &format!(
                "CREATE {}INDEX {} ON {} ({})",
                unique,
                quote(&full_name),
                quote(table),
                quote_list(&index.columns)
            ),
            [],
        )?;
        Ok(true)
    }

    fn drop_index(&mut self, table: &str, name: &str) -> Result<bool, Error> {
        if name == IndexDef::PRIMARY {
            return Err(Error::Generic(format!(
                "cannot drop the primary key of '{}'",
                table
            )));
        }
        let full_name = format!("{}_{}", table, name);
        if !self.index_exists(&full_name)? {
            return Ok(false);
        }
        self.conn
            .execute(&format!("DROP INDEX {}", quote(&full_name)), [])?;
        Ok(true)
    }

    fn copy_table(&mut self, source: &str, destination: &str) -> Result<(), Error> {
        self.conn
            .execute(&format!("DROP TABLE IF EXISTS {}", quote(destination)), [])?;
        self.conn.execute(
            &format!(
                "CREATE TABLE {} AS SELECT * FROM {}",
                quote(destination),
                quote(source)
            ),
            [],
        )?;
        Ok(())
    }

    fn optimize_table(&mut self, table: &str) -> Result<(), Error> {
        self.conn.execute(&format!("ANALYZE {}", quote(table)), [])?;
        Ok(())
    }

    fn transaction(&mut self, op: TransactionOp) -> Result<(), Error> {
        let sql = match op {
            TransactionOp::Begin => "BEGIN",
            TransactionOp::Commit => "COMMIT",
            TransactionOp::Rollback => "ROLLBACK",
        };
        self.conn.execute_batch(sql)?;
        Ok(())
    }
}

fn column_sql(column: &ColumnDef, rowid: bool) -> String {
    if rowid {
        return format!("{} INTEGER PRIMARY KEY AUTOINCREMENT", quote(&column.name));
    }
    let mut sql = format!("{} {}", quote(&column.name), column.type_sql());
    if column.not_null {
        sql.push_str(" NOT NULL");
    }
    if let Some(default) = &column.default {
        sql.push_str(" DEFAULT ");
        sql.push_str(&default_literal(default));
    }
    sql
}

fn default_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Real(f) => f.to_string(),
        Value::Text(s) => format!("'{}'", s.replace('\'', "''")),
        Value::Blob(b) => {
            let hex: String = b.iter().map(|byte| format!("{:02x}", byte)).collect();
            format!("X'{}'", hex)
        }
    }
}

fn quote(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

fn quote_list<S: AsRef<str>>(identifiers: &[S]) -> String {
    identifiers
        .iter()
        .map(|i| quote(i.as_ref()))
        .collect::<Vec<_>>()
        .join(", ")
}
