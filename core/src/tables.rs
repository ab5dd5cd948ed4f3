//! Server-side row storage behind the remote tabular API.
//!
//! Every table shares one SQLite relation keyed by (table, user, natural key);
//! the full row is kept as a JSON body with the filterable identity columns
//! lifted out next to it.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Context;
use async_trait::async_trait;
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use serde_json::{Map, Value};

use crate::clock::Clock;
use crate::models::{Timestamp, format_timestamp, parse_timestamp};
use crate::remote::{FilterOp, RemoteError, RemoteStore, RemoteTable, RowQuery};

#[derive(Debug, thiserror::Error)]
pub enum TableError {
    #[error("{0}")]
    Invalid(String),
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("corrupt row body: {0}")]
    Body(#[from] serde_json::Error),
}

struct RowIdentity {
    user_id: String,
    key: String,
    date: Option<String>,
    updated_at: String,
}

pub struct TableStore {
    conn: Connection,
}

impl TableStore {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open table store: {}", path.display()))?;
        let store = TableStore { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = TableStore { conn };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> anyhow::Result<()> {
        let version: i64 = self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))?;

        if version < 1 {
            self.conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS rows (
                    table_name TEXT NOT NULL,
                    user_id TEXT NOT NULL,
                    row_key TEXT NOT NULL,
                    date TEXT,
                    updated_at TEXT NOT NULL,
                    body TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    PRIMARY KEY (table_name, user_id, row_key)
                );

                CREATE INDEX IF NOT EXISTS idx_rows_updated ON rows(table_name, user_id, updated_at);
                CREATE INDEX IF NOT EXISTS idx_rows_date ON rows(table_name, user_id, date);

                PRAGMA user_version = 1;",
            )?;
        }

        Ok(())
    }

    fn text_field(body: &Map<String, Value>, field: &str) -> Option<String> {
        match body.get(field)? {
            Value::String(s) => Some(s.clone()),
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }

    /// Lift the identity columns out of a row body, stamping `updated_at`
    /// with `now` when the row carries none.
    fn identity(
        table: RemoteTable,
        body: &mut Map<String, Value>,
        now: &Timestamp,
    ) -> Result<RowIdentity, TableError> {
        let user_id = Self::text_field(body, table.user_column()).ok_or_else(|| {
            TableError::Invalid(format!(
                "{table} row is missing '{}'",
                table.user_column()
            ))
        })?;
        let key = Self::text_field(body, table.key_column()).ok_or_else(|| {
            TableError::Invalid(format!("{table} row is missing '{}'", table.key_column()))
        })?;
        let updated_at = match Self::text_field(body, "updated_at") {
            Some(raw) => parse_timestamp(&raw).map_err(|e| TableError::Invalid(e.to_string()))?,
            None => {
                body.insert("updated_at".to_string(), serde_json::to_value(now)?);
                *now
            }
        };
        Ok(RowIdentity {
            user_id,
            key,
            date: Self::text_field(body, "date"),
            updated_at: format_timestamp(&updated_at),
        })
    }

    fn object(row: Value) -> Result<Map<String, Value>, TableError> {
        match row {
            Value::Object(map) => Ok(map),
            _ => Err(TableError::Invalid("row must be a JSON object".to_string())),
        }
    }

    fn is_identifier(name: &str) -> bool {
        let mut chars = name.chars();
        chars
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    }

    /// SQL expression and bound value for one filterable column.
    fn column_expr(
        table: RemoteTable,
        column: &str,
        params: &mut Vec<SqlValue>,
    ) -> Result<String, TableError> {
        if !Self::is_identifier(column) {
            return Err(TableError::Invalid(format!("Invalid column '{column}'")));
        }
        let expr = if column == table.key_column() {
            "row_key".to_string()
        } else if column == table.user_column() {
            "user_id".to_string()
        } else if column == "updated_at" || column == "date" {
            column.to_string()
        } else {
            params.push(SqlValue::Text(format!("$.{column}")));
            format!("json_extract(body, ?{})", params.len())
        };
        Ok(expr)
    }

    fn operand(column: &str, raw: &str) -> SqlValue {
        if column == "updated_at" {
            return parse_timestamp(raw)
                .map_or_else(|_| SqlValue::Text(raw.to_string()), |ts| {
                    SqlValue::Text(format_timestamp(&ts))
                });
        }
        match raw {
            "true" => SqlValue::Integer(1),
            "false" => SqlValue::Integer(0),
            _ => {
                if let Ok(n) = raw.parse::<i64>() {
                    SqlValue::Integer(n)
                } else if let Ok(f) = raw.parse::<f64>() {
                    SqlValue::Real(f)
                } else {
                    SqlValue::Text(raw.to_string())
                }
            }
        }
    }

    fn where_clause(
        table: RemoteTable,
        query: &RowQuery,
        params: &mut Vec<SqlValue>,
    ) -> Result<String, TableError> {
        params.push(SqlValue::Text(table.name().to_string()));
        let mut clause = "table_name = ?1".to_string();
        for filter in &query.filters {
            let expr = Self::column_expr(table, &filter.column, params)?;
            // Key and user columns are stored as text even when they look numeric.
            let value = if expr == "row_key" || expr == "user_id" || expr == "date" {
                SqlValue::Text(filter.value.clone())
            } else {
                Self::operand(&filter.column, &filter.value)
            };
            params.push(value);
            let op = match filter.op {
                FilterOp::Eq => "=",
                FilterOp::Gte => ">=",
                FilterOp::Lte => "<=",
            };
            clause.push_str(&format!(" AND {expr} {op} ?{}", params.len()));
        }
        Ok(clause)
    }

    pub fn select(&self, table: RemoteTable, query: &RowQuery) -> Result<Vec<Value>, TableError> {
        let mut params = Vec::new();
        let mut sql = format!(
            "SELECT body FROM rows WHERE {}",
            Self::where_clause(table, query, &mut params)?
        );
        match &query.order {
            Some(order) => {
                let expr = Self::column_expr(table, &order.column, &mut params)?;
                let dir = if order.descending { "DESC" } else { "ASC" };
                sql.push_str(&format!(" ORDER BY {expr} {dir}, row_key ASC"));
            }
            None => sql.push_str(" ORDER BY user_id, row_key"),
        }
        if let Some(limit) = query.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let mut stmt = self.conn.prepare(&sql)?;
        let bodies = stmt
            .query_map(params_from_iter(params.iter()), |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        bodies
            .iter()
            .map(|b| serde_json::from_str(b).map_err(TableError::from))
            .collect()
    }

    fn read_body(
        conn: &Connection,
        table: RemoteTable,
        user_id: &str,
        key: &str,
    ) -> Result<Option<Map<String, Value>>, TableError> {
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM rows WHERE table_name = ?1 AND user_id = ?2 AND row_key = ?3",
                params![table.name(), user_id, key],
                |row| row.get(0),
            )
            .optional()?;
        body.map(|b| Self::object(serde_json::from_str(&b)?))
            .transpose()
    }

    fn write_row(
        conn: &Connection,
        table: RemoteTable,
        id: &RowIdentity,
        body: &Map<String, Value>,
        now: &Timestamp,
    ) -> Result<(), TableError> {
        conn.execute(
            "INSERT INTO rows (table_name, user_id, row_key, date, updated_at, body, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(table_name, user_id, row_key) DO UPDATE SET
                date = excluded.date,
                updated_at = excluded.updated_at,
                body = excluded.body",
            params![
                table.name(),
                id.user_id,
                id.key,
                id.date,
                id.updated_at,
                serde_json::to_string(body)?,
                format_timestamp(now),
            ],
        )?;
        Ok(())
    }

    /// Insert a new row. Returns `None` if the key is already taken.
    pub fn insert(
        &self,
        table: RemoteTable,
        row: Value,
        now: &Timestamp,
    ) -> Result<Option<Value>, TableError> {
        let mut body = Self::object(row)?;
        let id = Self::identity(table, &mut body, now)?;
        if Self::read_body(&self.conn, table, &id.user_id, &id.key)?.is_some() {
            return Ok(None);
        }
        Self::write_row(&self.conn, table, &id, &body, now)?;
        Ok(Some(Value::Object(body)))
    }

    /// Insert rows, merging each into an existing row with the same key.
    /// All or nothing.
    pub fn upsert(
        &self,
        table: RemoteTable,
        rows: Vec<Value>,
        now: &Timestamp,
    ) -> Result<usize, TableError> {
        let tx = self.conn.unchecked_transaction()?;
        let count = rows.len();
        for row in rows {
            let mut body = Self::object(row)?;
            let id = Self::identity(table, &mut body, now)?;
            let merged = match Self::read_body(&tx, table, &id.user_id, &id.key)? {
                Some(mut existing) => {
                    existing.extend(body);
                    existing
                }
                None => body,
            };
            Self::write_row(&tx, table, &id, &merged, now)?;
        }
        tx.commit()?;
        Ok(count)
    }

    /// Merge `patch` into every matching row. `updated_at` is taken from the
    /// patch when present, otherwise set to `now`.
    pub fn update(
        &self,
        table: RemoteTable,
        query: &RowQuery,
        patch: Value,
        now: &Timestamp,
    ) -> Result<Vec<Value>, TableError> {
        let mut patch = Self::object(patch)?;
        if !patch.contains_key("updated_at") {
            patch.insert("updated_at".to_string(), serde_json::to_value(now)?);
        }

        let tx = self.conn.unchecked_transaction()?;
        let mut updated = Vec::new();
        for row in self.select(table, query)? {
            let mut body = Self::object(row)?;
            let before = Self::identity(table, &mut body, now)?;
            body.extend(patch.clone());
            let after = Self::identity(table, &mut body, now)?;
            if before.user_id != after.user_id || before.key != after.key {
                return Err(TableError::Invalid(format!(
                    "Cannot change '{}' of an existing row",
                    table.key_column()
                )));
            }
            Self::write_row(&tx, table, &after, &body, now)?;
            updated.push(Value::Object(body));
        }
        tx.commit()?;
        Ok(updated)
    }

    /// Delete every matching row and return what was removed.
    pub fn delete(&self, table: RemoteTable, query: &RowQuery) -> Result<Vec<Value>, TableError> {
        let tx = self.conn.unchecked_transaction()?;
        let rows = self.select(table, query)?;
        for row in &rows {
            let mut body = Self::object(row.clone())?;
            let id = Self::identity(table, &mut body, &crate::models::epoch())?;
            tx.execute(
                "DELETE FROM rows WHERE table_name = ?1 AND user_id = ?2 AND row_key = ?3",
                params![table.name(), id.user_id, id.key],
            )?;
        }
        tx.commit()?;
        Ok(rows)
    }
}

/// A remote backed directly by a [`TableStore`] in this process.
#[derive(Clone)]
pub struct EmbeddedRemote {
    tables: Arc<Mutex<TableStore>>,
    clock: Arc<dyn Clock>,
}

impl EmbeddedRemote {
    pub fn new(tables: Arc<Mutex<TableStore>>, clock: Arc<dyn Clock>) -> Self {
        Self { tables, clock }
    }

    fn with_tables<T>(
        &self,
        f: impl FnOnce(&TableStore, &Timestamp) -> Result<T, TableError>,
    ) -> Result<T, RemoteError> {
        let now = self.clock.now();
        let tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        f(&tables, &now).map_err(|e| match e {
            TableError::Invalid(message) => RemoteError::Rejected {
                status: 400,
                message,
            },
            other => RemoteError::Rejected {
                status: 500,
                message: other.to_string(),
            },
        })
    }
}

#[async_trait]
impl RemoteStore for EmbeddedRemote {
    async fn ping(&self) -> Result<(), RemoteError> {
        Ok(())
    }

    async fn select(&self, table: RemoteTable, query: &RowQuery) -> Result<Vec<Value>, RemoteError> {
        self.with_tables(|t, _| t.select(table, query))
    }

    async fn insert(&self, table: RemoteTable, row: Value) -> Result<Value, RemoteError> {
        self.with_tables(|t, now| t.insert(table, row, now))?
            .ok_or(RemoteError::Conflict)
    }

    async fn upsert(&self, table: RemoteTable, rows: Vec<Value>) -> Result<(), RemoteError> {
        self.with_tables(|t, now| t.upsert(table, rows, now))
            .map(|_| ())
    }

    async fn update(
        &self,
        table: RemoteTable,
        query: &RowQuery,
        patch: Value,
    ) -> Result<Vec<Value>, RemoteError> {
        self.with_tables(|t, now| t.update(table, query, patch, now))
    }

    async fn delete(&self, table: RemoteTable, query: &RowQuery) -> Result<Vec<Value>, RemoteError> {
        self.with_tables(|t, _| t.delete(table, query))
    }
}
