#![forbid(unsafe_code)]

use std::path::Path;
use std::str::FromStr;

use analyst_center_domain::{now_utc, ExecutionTraceRecord, MessageStatus, RunId};
use analyst_center_trace::{ArchivedMessage, ArchivedRun, RunArchive};
use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use time::OffsetDateTime;
use ulid::Ulid;

const ARCHIVE_SCHEMA_VERSION: i64 = 1;

const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS runs (
  run_id TEXT PRIMARY KEY,
  created_at TEXT NOT NULL,
  user_query TEXT NOT NULL,
  enabled_capabilities_json TEXT NOT NULL,
  config_hash TEXT NOT NULL,
  plan_json TEXT NOT NULL,
  models_used_json TEXT NOT NULL,
  answer TEXT NOT NULL,
  step_count INTEGER NOT NULL CHECK (step_count >= 0),
  replan_count INTEGER NOT NULL CHECK (replan_count >= 0),
  response_hash TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS run_messages (
  run_id TEXT NOT NULL,
  seq INTEGER NOT NULL CHECK (seq >= 1),
  author TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('completed','failed')),
  content TEXT NOT NULL,
  content_hash TEXT NOT NULL,
  prev_message_hash TEXT,
  message_hash TEXT NOT NULL,
  PRIMARY KEY (run_id, seq),
  FOREIGN KEY (run_id) REFERENCES runs(run_id)
);

CREATE TABLE IF NOT EXISTS run_trace_records (
  run_id TEXT NOT NULL,
  ordinal INTEGER NOT NULL CHECK (ordinal >= 1),
  step INTEGER NOT NULL,
  agent TEXT NOT NULL,
  record_type TEXT NOT NULL,
  record_json TEXT NOT NULL,
  PRIMARY KEY (run_id, ordinal),
  FOREIGN KEY (run_id) REFERENCES runs(run_id)
);

CREATE INDEX IF NOT EXISTS idx_runs_created ON runs(created_at);
CREATE INDEX IF NOT EXISTS idx_trace_records_agent ON run_trace_records(agent, record_type);

CREATE TRIGGER IF NOT EXISTS trg_runs_no_update
BEFORE UPDATE ON runs
BEGIN
  SELECT RAISE(FAIL, 'runs is append-only');
END;
CREATE TRIGGER IF NOT EXISTS trg_runs_no_delete
BEFORE DELETE ON runs
BEGIN
  SELECT RAISE(FAIL, 'runs is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_run_messages_no_update
BEFORE UPDATE ON run_messages
BEGIN
  SELECT RAISE(FAIL, 'run_messages is append-only');
END;
CREATE TRIGGER IF NOT EXISTS trg_run_messages_no_delete
BEFORE DELETE ON run_messages
BEGIN
  SELECT RAISE(FAIL, 'run_messages is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_run_trace_records_no_update
BEFORE UPDATE ON run_trace_records
BEGIN
  SELECT RAISE(FAIL, 'run_trace_records is append-only');
END;
CREATE TRIGGER IF NOT EXISTS trg_run_trace_records_no_delete
BEFORE DELETE ON run_trace_records
BEGIN
  SELECT RAISE(FAIL, 'run_trace_records is append-only');
END;
";

const RUN_COLUMNS: &str = "run_id, created_at, user_query, enabled_capabilities_json, config_hash,
     plan_json, models_used_json, answer, step_count, replan_count, response_hash";

pub struct SqliteRunArchive {
    conn: Connection,
}

impl SqliteRunArchive {
    /// Open or create a `SQLite` archive database and configure local pragmas.
    ///
    /// # Errors
    /// Returns an error if opening the database or applying pragmas fails.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }
}

impl RunArchive for SqliteRunArchive {
    fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(SCHEMA_V1)
            .context("failed to apply archive schema")?;

        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![ARCHIVE_SCHEMA_VERSION, rfc3339(now_utc())?],
            )
            .context("failed to record archive migration")?;
        Ok(())
    }

    fn insert_run(&self, run: &ArchivedRun) -> Result<()> {
        self.conn
            .execute(
                &format!(
                    "INSERT INTO runs({RUN_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
                ),
                params![
                    run.run_id.to_string(),
                    rfc3339(run.created_at)?,
                    run.user_query,
                    serde_json::to_string(&run.enabled_capabilities)?,
                    run.config_hash,
                    serde_json::to_string(&run.plan)?,
                    serde_json::to_string(&run.models_used)?,
                    run.answer,
                    i64::try_from(run.step_count)?,
                    i64::from(run.replan_count),
                    run.response_hash,
                ],
            )
            .context("failed to insert run")?;
        Ok(())
    }

    fn append_message(&self, message: &ArchivedMessage) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO run_messages(
                    run_id, seq, author, status, content,
                    content_hash, prev_message_hash, message_hash
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    message.run_id.to_string(),
                    i64::from(message.seq),
                    message.author,
                    message.status.as_str(),
                    message.content,
                    message.content_hash,
                    message.prev_message_hash,
                    message.message_hash,
                ],
            )
            .context("failed to append run message")?;
        Ok(())
    }

    fn append_trace_record(
        &self,
        run_id: RunId,
        ordinal: usize,
        record: &ExecutionTraceRecord,
    ) -> Result<()> {
        let record_json = serde_json::to_value(record)?;
        let record_type = record_json
            .get("type")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        self.conn
            .execute(
                "INSERT INTO run_trace_records(
                    run_id, ordinal, step, agent, record_type, record_json
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    run_id.to_string(),
                    i64::try_from(ordinal)?,
                    i64::try_from(record.step)?,
                    record.agent,
                    record_type,
                    serde_json::to_string(&record_json)?,
                ],
            )
            .context("failed to append trace record")?;
        Ok(())
    }

    fn list_runs(&self) -> Result<Vec<ArchivedRun>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM runs ORDER BY created_at DESC, run_id ASC"
        ))?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(run_from_row(row)?);
        }
        Ok(out)
    }

    fn get_run(&self, run_id: RunId) -> Result<Option<ArchivedRun>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {RUN_COLUMNS} FROM runs WHERE run_id = ?1"))?;
        let row = stmt
            .query_row(params![run_id.to_string()], |row| {
                Ok(run_from_row(row))
            })
            .optional()?;
        row.transpose()
    }

    fn list_messages(&self, run_id: RunId) -> Result<Vec<ArchivedMessage>> {
        let mut stmt = self.conn.prepare(
            "SELECT
                run_id, seq, author, status, content,
                content_hash, prev_message_hash, message_hash
             FROM run_messages
             WHERE run_id = ?1
             ORDER BY seq ASC",
        )?;
        let mut rows = stmt.query(params![run_id.to_string()])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let status_raw: String = row.get(3)?;
            out.push(ArchivedMessage {
                run_id: parse_run_id(&row.get::<_, String>(0)?)?,
                seq: u32::try_from(row.get::<_, i64>(1)?)?,
                author: row.get(2)?,
                status: MessageStatus::parse(&status_raw)
                    .ok_or_else(|| anyhow!("unknown message status: {status_raw}"))?,
                content: row.get(4)?,
                content_hash: row.get(5)?,
                prev_message_hash: row.get(6)?,
                message_hash: row.get(7)?,
            });
        }
        Ok(out)
    }

    fn list_trace_records(&self, run_id: RunId) -> Result<Vec<ExecutionTraceRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT record_json FROM run_trace_records WHERE run_id = ?1 ORDER BY ordinal ASC",
        )?;
        let mut rows = stmt.query(params![run_id.to_string()])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let raw: String = row.get(0)?;
            out.push(serde_json::from_str(&raw).context("invalid record_json")?);
        }
        Ok(out)
    }
}

fn run_from_row(row: &Row<'_>) -> Result<ArchivedRun> {
    let enabled_raw: String = row.get(3)?;
    let plan_raw: String = row.get(5)?;
    let models_raw: String = row.get(6)?;
    Ok(ArchivedRun {
        run_id: parse_run_id(&row.get::<_, String>(0)?)?,
        created_at: parse_rfc3339(&row.get::<_, String>(1)?)?,
        user_query: row.get(2)?,
        enabled_capabilities: serde_json::from_str(&enabled_raw)
            .context("invalid enabled_capabilities_json")?,
        config_hash: row.get(4)?,
        plan: serde_json::from_str(&plan_raw).context("invalid plan_json")?,
        models_used: serde_json::from_str(&models_raw).context("invalid models_used_json")?,
        answer: row.get(7)?,
        step_count: usize::try_from(row.get::<_, i64>(8)?)?,
        replan_count: u32::try_from(row.get::<_, i64>(9)?)?,
        response_hash: row.get(10)?,
    })
}

fn parse_run_id(value: &str) -> Result<RunId> {
    let ulid = Ulid::from_str(value).map_err(|err| anyhow!("invalid run_id ULID: {err}"))?;
    Ok(RunId(ulid))
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| anyhow!("invalid datetime format: {err}"))
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| anyhow!("invalid RFC3339 datetime: {err}"))
}
