#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use analyst_center_domain::{
    hash_bytes, hash_json, DateTimeUtc, ExecutionTraceRecord, Message,
    MessageStatus, RunId,
};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

mod aggregate;

pub use aggregate::{aggregate_trace, extract_visualizations};

/// One completed run as stored in the archive.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArchivedRun {
    pub run_id: RunId,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: DateTimeUtc,
    pub user_query: String,
    pub enabled_capabilities: Vec<String>,
    pub config_hash: String,
    pub plan: Value,
    pub models_used: BTreeMap<String, String>,
    pub answer: String,
    pub step_count: usize,
    pub replan_count: u32,
    pub response_hash: String,
}

/// History message plus its position in the run's hash chain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArchivedMessage {
    pub run_id: RunId,
    pub seq: u32,
    pub author: String,
    pub status: MessageStatus,
    pub content: String,
    pub content_hash: String,
    pub prev_message_hash: Option<String>,
    pub message_hash: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AuditReport {
    pub run_id: RunId,
    pub messages: usize,
    pub chain_valid: bool,
    /// Sequence number of the first message that failed verification.
    pub first_invalid_seq: Option<u32>,
}

pub trait RunArchive {
    #[allow(clippy::missing_errors_doc)]
    fn migrate(&self) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn insert_run(&self, run: &ArchivedRun) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn append_message(&self, message: &ArchivedMessage) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn append_trace_record(
        &self,
        run_id: RunId,
        ordinal: usize,
        record: &ExecutionTraceRecord,
    ) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn list_runs(&self) -> Result<Vec<ArchivedRun>>;

    #[allow(clippy::missing_errors_doc)]
    fn get_run(&self, run_id: RunId) -> Result<Option<ArchivedRun>>;

    #[allow(clippy::missing_errors_doc)]
    fn list_messages(&self, run_id: RunId) -> Result<Vec<ArchivedMessage>>;

    #[allow(clippy::missing_errors_doc)]
    fn list_trace_records(&self, run_id: RunId) -> Result<Vec<ExecutionTraceRecord>>;
}

fn message_hash(
    run_id: RunId,
    seq: u32,
    author: &str,
    status: MessageStatus,
    content_hash: &str,
    prev_message_hash: Option<&str>,
) -> Result<String> {
    hash_json(&json!({
        "run_id": run_id,
        "seq": seq,
        "author": author,
        "status": status,
        "content_hash": content_hash,
        "prev_message_hash": prev_message_hash,
    }))
}

/// Link `history` into a SHA-256 hash chain rooted at the first message.
///
/// # Errors
/// Returns an error if hash material cannot be serialized.
pub fn chain_messages(run_id: RunId, history: &[Message]) -> Result<Vec<ArchivedMessage>> {
    let mut prev: Option<String> = None;
    let mut out = Vec::with_capacity(history.len());
    for (seq, message) in (1u32..).zip(history) {
        let content_hash = hash_bytes(message.content.as_bytes());
        let hash = message_hash(
            run_id,
            seq,
            &message.author,
            message.status,
            &content_hash,
            prev.as_deref(),
        )?;
        out.push(ArchivedMessage {
            run_id,
            seq,
            author: message.author.clone(),
            status: message.status,
            content: message.content.clone(),
            content_hash,
            prev_message_hash: prev.clone(),
            message_hash: hash.clone(),
        });
        prev = Some(hash);
    }
    Ok(out)
}

/// Persist a completed run: run row, chained history, then trace records.
///
/// # Errors
/// Returns an error when hashing or any archive write fails.
pub fn archive_completed_run(
    archive: &dyn RunArchive,
    run: &ArchivedRun,
    history: &[Message],
    trace_records: &[ExecutionTraceRecord],
) -> Result<()> {
    archive.insert_run(run)?;
    for message in chain_messages(run.run_id, history)? {
        archive.append_message(&message)?;
    }
    for (ordinal, record) in trace_records.iter().enumerate() {
        archive.append_trace_record(run.run_id, ordinal + 1, record)?;
    }
    Ok(())
}

/// Recompute every content and message hash and verify the chain links.
///
/// # Errors
/// Returns an error when archived messages cannot be read.
pub fn audit_run(archive: &dyn RunArchive, run_id: RunId) -> Result<AuditReport> {
    let messages = archive.list_messages(run_id)?;
    let mut prev: Option<String> = None;
    for message in &messages {
        let content_hash = hash_bytes(message.content.as_bytes());
        let expected = message_hash(
            run_id,
            message.seq,
            &message.author,
            message.status,
            &content_hash,
            prev.as_deref(),
        )?;
        if message.prev_message_hash != prev
            || message.content_hash != content_hash
            || message.message_hash != expected
        {
            return Ok(AuditReport {
                run_id,
                messages: messages.len(),
                chain_valid: false,
                first_invalid_seq: Some(message.seq),
            });
        }
        prev = Some(message.message_hash.clone());
    }

    Ok(AuditReport {
        run_id,
        messages: messages.len(),
        chain_valid: true,
        first_invalid_seq: None,
    })
}
