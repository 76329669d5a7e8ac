use std::path::{Path, PathBuf};
use std::time::Instant;

use analyst_center_domain::Deadline;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection, ErrorCode, OpenFlags};
use serde_json::{Map, Number, Value};

use crate::{DataStore, DataStoreError, GuardedQuery, QueryRows, SqlGuard};

/// Virtual machine instructions between deadline checks.
const PROGRESS_INTERVAL_OPS: i32 = 1_000;

const SCHEMA_SQL: &str = "SELECT name, type, sql FROM sqlite_master \
     WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%' ORDER BY name";

/// Read-only SQLite database backing the query capability.
#[derive(Debug, Clone)]
pub struct SqliteDataStore {
    path: PathBuf,
}

impl SqliteDataStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self, deadline: &Deadline) -> Result<Connection, DataStoreError> {
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY
                | OpenFlags::SQLITE_OPEN_NO_MUTEX
                | OpenFlags::SQLITE_OPEN_URI,
        )
        .map_err(|err| {
            DataStoreError::Unavailable(format!("failed to open {}: {err}", self.path.display()))
        })?;

        if let Some(expires_at) = deadline.expires_at() {
            conn.progress_handler(
                PROGRESS_INTERVAL_OPS,
                Some(move || Instant::now() >= expires_at),
            );
        }
        Ok(conn)
    }
}

impl DataStore for SqliteDataStore {
    fn execute(
        &self,
        query: &GuardedQuery,
        params: &[Value],
        deadline: &Deadline,
    ) -> Result<QueryRows, DataStoreError> {
        let started = Instant::now();
        let conn = self.open(deadline)?;
        let mut stmt = conn.prepare(query.sql()).map_err(map_sqlite_error)?;

        let columns: Vec<String> = stmt
            .column_names()
            .into_iter()
            .map(str::to_string)
            .collect();
        let bound: Vec<SqlValue> = params.iter().map(json_to_sql).collect();
        let mut rows = stmt
            .query(params_from_iter(bound.iter()))
            .map_err(map_sqlite_error)?;

        let row_cap = usize::try_from(query.row_cap()).unwrap_or(usize::MAX);
        let mut out = Vec::new();
        let mut truncated = false;
        while let Some(row) = rows.next().map_err(map_sqlite_error)? {
            if out.len() >= row_cap {
                truncated = true;
                break;
            }
            let mut record = Map::new();
            for (index, column) in columns.iter().enumerate() {
                let value = row.get_ref(index).map_err(map_sqlite_error)?;
                record.insert(column.clone(), sql_to_json(value));
            }
            out.push(record);
        }

        Ok(QueryRows {
            columns,
            rows: out,
            truncated,
            elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        })
    }

    fn describe_schema(
        &self,
        guard: &SqlGuard,
        deadline: &Deadline,
    ) -> Result<String, DataStoreError> {
        let query = guard
            .check(SCHEMA_SQL)
            .map_err(|rejection| DataStoreError::Statement(rejection.to_string()))?;
        let rows = self.execute(&query, &[], deadline)?;

        let mut lines = Vec::with_capacity(rows.rows.len());
        for row in &rows.rows {
            let name = row.get("name").and_then(Value::as_str).unwrap_or_default();
            let kind = row.get("type").and_then(Value::as_str).unwrap_or_default();
            match row.get("sql").and_then(Value::as_str) {
                Some(ddl) => lines.push(format!("-- {kind} {name}\n{ddl};")),
                None => lines.push(format!("-- {kind} {name}")),
            }
        }
        Ok(lines.join("\n\n"))
    }
}

fn map_sqlite_error(err: rusqlite::Error) -> DataStoreError {
    match err.sqlite_error_code() {
        Some(ErrorCode::OperationInterrupted) => DataStoreError::Interrupted,
        Some(
            ErrorCode::CannotOpen
            | ErrorCode::NotADatabase
            | ErrorCode::DatabaseCorrupt
            | ErrorCode::SystemIoFailure,
        ) => DataStoreError::Unavailable(err.to_string()),
        _ => DataStoreError::Statement(err.to_string()),
    }
}

fn json_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(flag) => SqlValue::Integer(i64::from(*flag)),
        Value::Number(number) => number.as_i64().map_or_else(
            || SqlValue::Real(number.as_f64().unwrap_or_default()),
            SqlValue::Integer,
        ),
        Value::String(text) => SqlValue::Text(text.clone()),
        Value::Array(_) | Value::Object(_) => SqlValue::Text(value.to_string()),
    }
}

fn sql_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(number) => Value::from(number),
        ValueRef::Real(number) => Number::from_f64(number).map_or(Value::Null, Value::Number),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(format!("0x{}", hex::encode(bytes))),
    }
}
