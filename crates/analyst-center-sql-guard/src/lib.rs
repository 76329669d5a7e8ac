#![forbid(unsafe_code)]

//! SELECT-only policy for model-generated SQL.
//!
//! Text is tokenized with `sqlparser` so comments, whitespace, and string
//! literals never influence statement counting or keyword detection. A data
//! store only accepts a [`GuardedQuery`], which only [`SqlGuard::check`] can
//! construct.

use analyst_center_domain::{Deadline, OrchestratorError, DEFAULT_ROW_CAP};
use serde::Serialize;
use serde_json::{Map, Value};
use sqlparser::dialect::SQLiteDialect;
use sqlparser::tokenizer::{Location, Token, TokenWithSpan, Tokenizer};
use tracing::{debug, warn};

mod sqlite;

pub use sqlite::SqliteDataStore;

/// Keywords that may not appear anywhere inside a `WITH` statement.
const CTE_FORBIDDEN_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "ALTER", "CREATE", "TRUNCATE", "ATTACH", "DETACH",
    "PRAGMA", "VACUUM",
];

#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RejectionKind {
    Unparseable,
    EmptyStatement,
    MultipleStatements,
    NoLeadingToken,
    NotReadOnly,
    ExecutionFailed,
}

impl RejectionKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unparseable => "unparseable",
            Self::EmptyStatement => "empty_statement",
            Self::MultipleStatements => "multiple_statements",
            Self::NoLeadingToken => "no_leading_token",
            Self::NotReadOnly => "not_read_only",
            Self::ExecutionFailed => "execution_failed",
        }
    }
}

/// Structured, non-exceptional rejection fed back to the calling capability.
#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct SqlRejection {
    pub kind: RejectionKind,
    pub message: String,
}

impl SqlRejection {
    fn new(kind: RejectionKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for SqlRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum LeadingKeyword {
    Select,
    With,
}

/// SQL text that passed the read-only policy, with the row cap applied.
#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct GuardedQuery {
    sql: String,
    leading_keyword: LeadingKeyword,
    limit_injected: bool,
    row_cap: u64,
}

impl GuardedQuery {
    #[must_use]
    pub fn sql(&self) -> &str {
        &self.sql
    }

    #[must_use]
    pub fn leading_keyword(&self) -> LeadingKeyword {
        self.leading_keyword
    }

    #[must_use]
    pub fn limit_injected(&self) -> bool {
        self.limit_injected
    }

    #[must_use]
    pub fn row_cap(&self) -> u64 {
        self.row_cap
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryRows {
    pub columns: Vec<String>,
    pub rows: Vec<Map<String, Value>>,
    /// Set when the store stopped reading at the row cap.
    pub truncated: bool,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryExecution {
    pub query: GuardedQuery,
    pub params: Vec<Value>,
    pub rows: QueryRows,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GuardOutcome {
    Executed(QueryExecution),
    Rejected(SqlRejection),
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum DataStoreError {
    #[error("statement interrupted by request deadline")]
    Interrupted,
    #[error("{0}")]
    Statement(String),
    #[error("data store unavailable: {0}")]
    Unavailable(String),
}

impl DataStoreError {
    /// Map a store failure outside guarded execution (e.g. schema reads) to a fatal error.
    #[must_use]
    pub fn into_orchestrator_error(self, stage: &str) -> OrchestratorError {
        match self {
            Self::Interrupted => OrchestratorError::Timeout(stage.to_string()),
            Self::Statement(detail) | Self::Unavailable(detail) => {
                OrchestratorError::Transport(format!("{stage}: {detail}"))
            }
        }
    }
}

pub trait DataStore: Send + Sync {
    #[allow(clippy::missing_errors_doc)]
    fn execute(
        &self,
        query: &GuardedQuery,
        params: &[Value],
        deadline: &Deadline,
    ) -> Result<QueryRows, DataStoreError>;

    /// Human-readable schema for prompting. Implementations read it through `guard`.
    #[allow(clippy::missing_errors_doc)]
    fn describe_schema(&self, guard: &SqlGuard, deadline: &Deadline)
        -> Result<String, DataStoreError>;
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct SqlGuard {
    row_cap: u64,
}

impl Default for SqlGuard {
    fn default() -> Self {
        Self {
            row_cap: DEFAULT_ROW_CAP,
        }
    }
}

impl SqlGuard {
    #[must_use]
    pub fn new(row_cap: u64) -> Self {
        Self {
            row_cap: row_cap.max(1),
        }
    }

    #[must_use]
    pub fn row_cap(&self) -> u64 {
        self.row_cap
    }

    /// Classify untrusted SQL and apply the row cap.
    ///
    /// # Errors
    /// Returns a [`SqlRejection`] when the text is not exactly one read-only
    /// `SELECT`/`WITH` statement.
    pub fn check(&self, sql: &str) -> Result<GuardedQuery, SqlRejection> {
        let located = tokenize(sql)?;
        let tokens: Vec<Token> = located.iter().map(|located| located.token.clone()).collect();
        let statements: Vec<&[Token]> = tokens
            .split(|token| matches!(token, Token::SemiColon))
            .filter(|chunk| chunk.iter().any(|token| !is_trivia(token)))
            .collect();

        let statement = match statements.as_slice() {
            [] => {
                return Err(SqlRejection::new(
                    RejectionKind::EmptyStatement,
                    "no SQL statement found",
                ))
            }
            [single] => *single,
            many => {
                return Err(SqlRejection::new(
                    RejectionKind::MultipleStatements,
                    format!("multiple statements not allowed (found {})", many.len()),
                ))
            }
        };

        let leading = statement
            .iter()
            .find(|token| !is_trivia(token))
            .ok_or_else(|| {
                SqlRejection::new(RejectionKind::NoLeadingToken, "statement has no leading token")
            })?;

        let leading_keyword = if keyword_is(leading, "SELECT") {
            LeadingKeyword::Select
        } else if keyword_is(leading, "WITH") {
            LeadingKeyword::With
        } else {
            return Err(SqlRejection::new(
                RejectionKind::NotReadOnly,
                format!("only SELECT or WITH queries are allowed; statement starts with `{leading}`"),
            ));
        };

        if leading_keyword == LeadingKeyword::With {
            check_cte_body(statement)?;
        }

        let has_limit = statement.iter().any(|token| keyword_is(token, "LIMIT"));
        let body = strip_trailing_semicolons(sql, &located);
        let guarded_sql = if has_limit {
            body.to_string()
        } else {
            format!("{body}\nLIMIT {}", self.row_cap)
        };

        Ok(GuardedQuery {
            sql: guarded_sql,
            leading_keyword,
            limit_injected: !has_limit,
            row_cap: self.row_cap,
        })
    }

    /// Check `sql` and, when accepted, run it with bound `params`.
    ///
    /// Policy violations and statement errors come back as
    /// [`GuardOutcome::Rejected`] so the caller can self-correct.
    ///
    /// # Errors
    /// Returns `Timeout` when the deadline interrupts execution and `Transport`
    /// when the store itself is unreachable.
    pub fn execute(
        &self,
        store: &dyn DataStore,
        sql: &str,
        params: &[Value],
        deadline: &Deadline,
    ) -> Result<GuardOutcome, OrchestratorError> {
        let query = match self.check(sql) {
            Ok(query) => query,
            Err(rejection) => {
                warn!(kind = rejection.kind.as_str(), reason = %rejection.message, "sql rejected by guard");
                return Ok(GuardOutcome::Rejected(rejection));
            }
        };
        deadline.remaining("sql execution")?;

        debug!(
            limit_injected = query.limit_injected,
            params = params.len(),
            "executing guarded query"
        );
        match store.execute(&query, params, deadline) {
            Ok(rows) => Ok(GuardOutcome::Executed(QueryExecution {
                query,
                params: params.to_vec(),
                rows,
            })),
            Err(DataStoreError::Interrupted) => {
                Err(OrchestratorError::Timeout("sql execution".to_string()))
            }
            Err(DataStoreError::Statement(detail)) => {
                warn!(reason = %detail, "guarded query failed in data store");
                Ok(GuardOutcome::Rejected(SqlRejection::new(
                    RejectionKind::ExecutionFailed,
                    detail,
                )))
            }
            Err(DataStoreError::Unavailable(detail)) => Err(OrchestratorError::Transport(
                format!("data store unavailable: {detail}"),
            )),
        }
    }
}

fn tokenize(sql: &str) -> Result<Vec<TokenWithSpan>, SqlRejection> {
    let dialect = SQLiteDialect {};
    Tokenizer::new(&dialect, sql).tokenize_with_location().map_err(|err| {
        SqlRejection::new(
            RejectionKind::Unparseable,
            format!("SQL could not be tokenized: {err}"),
        )
    })
}

fn is_trivia(token: &Token) -> bool {
    matches!(token, Token::Whitespace(_) | Token::EOF)
}

fn keyword_is(token: &Token, keyword: &str) -> bool {
    match token {
        Token::Word(word) => word.quote_style.is_none() && word.value.eq_ignore_ascii_case(keyword),
        _ => false,
    }
}

fn check_cte_body(statement: &[Token]) -> Result<(), SqlRejection> {
    if !statement.iter().any(|token| keyword_is(token, "SELECT")) {
        return Err(SqlRejection::new(
            RejectionKind::NotReadOnly,
            "WITH statement must contain a SELECT",
        ));
    }

    let meaningful: Vec<&Token> = statement.iter().filter(|token| !is_trivia(token)).collect();
    for (index, token) in meaningful.iter().enumerate() {
        if let Some(keyword) = CTE_FORBIDDEN_KEYWORDS
            .iter()
            .find(|keyword| keyword_is(token, keyword))
        {
            return Err(SqlRejection::new(
                RejectionKind::NotReadOnly,
                format!("WITH statement may not contain {keyword}"),
            ));
        }
        // `replace(...)` is a scalar function; only `REPLACE INTO` writes.
        if keyword_is(token, "REPLACE")
            && meaningful
                .get(index + 1)
                .is_some_and(|next| keyword_is(next, "INTO"))
        {
            return Err(SqlRejection::new(
                RejectionKind::NotReadOnly,
                "WITH statement may not contain REPLACE INTO",
            ));
        }
    }
    Ok(())
}

/// Cut the text at the first semicolon token after the last meaningful
/// token. Semicolons inside literals or comments are never tokens.
fn strip_trailing_semicolons<'s>(sql: &'s str, tokens: &[TokenWithSpan]) -> &'s str {
    let tail_start = tokens
        .iter()
        .rposition(|located| !is_trivia(&located.token) && located.token != Token::SemiColon)
        .map_or(0, |index| index + 1);
    let terminator = tokens[tail_start..]
        .iter()
        .find(|located| located.token == Token::SemiColon)
        .and_then(|located| byte_offset(sql, located.span.start));
    match terminator {
        Some(offset) => sql[..offset].trim_end(),
        None => sql.trim_end(),
    }
}

/// Byte offset of a tokenizer location; lines and columns are 1-based and
/// columns count chars.
fn byte_offset(sql: &str, location: Location) -> Option<usize> {
    let (mut line, mut column) = (1u64, 1u64);
    for (offset, ch) in sql.char_indices() {
        if line == location.line && column == location.column {
            return Some(offset);
        }
        if ch == '\n' {
            line += 1;
            column = 1;
        } else {
            column += 1;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::{GuardOutcome, LeadingKeyword, RejectionKind, SqlGuard};

    fn rejection_kind(sql: &str) -> Option<RejectionKind> {
        SqlGuard::default().check(sql).err().map(|rejection| rejection.kind)
    }

    #[test]
    fn data_modifying_statements_are_rejected_regardless_of_prefix() {
        let statements = [
            "DROP TABLE sales",
            "delete from sales",
            "  \n\tUpdate sales SET amount = 0",
            "-- tidy up\nINSERT INTO sales VALUES (1)",
            "/* multi\nline */ ALTER TABLE sales ADD COLUMN x",
            "/* a */ -- b\n  CrEaTe TABLE x (id INTEGER)",
            "TRUNCATE TABLE sales",
        ];
        for sql in statements {
            assert_eq!(
                rejection_kind(sql),
                Some(RejectionKind::NotReadOnly),
                "expected rejection for {sql:?}"
            );
        }
    }

    #[test]
    fn stacked_statements_are_rejected() {
        assert_eq!(
            rejection_kind("SELECT 1; DROP TABLE t"),
            Some(RejectionKind::MultipleStatements)
        );
    }

    #[test]
    fn semicolons_inside_literals_and_comments_do_not_split() {
        let guard = SqlGuard::default();
        assert!(guard.check("SELECT 'a;b' AS v").is_ok());
        assert!(guard.check("SELECT 1 -- trailing; comment").is_ok());
        assert!(guard.check("SELECT 1 /* ; DROP TABLE t */").is_ok());
        assert!(guard.check("SELECT 1;;  ").is_ok());
    }

    #[test]
    fn empty_input_is_rejected() {
        assert_eq!(rejection_kind("  -- nothing\n ; "), Some(RejectionKind::EmptyStatement));
        assert_eq!(rejection_kind(""), Some(RejectionKind::EmptyStatement));
    }

    #[test]
    fn unterminated_literal_is_unparseable() {
        assert_eq!(
            rejection_kind("SELECT 'oops FROM t"),
            Some(RejectionKind::Unparseable)
        );
    }

    #[test]
    fn cte_select_is_accepted() {
        let query = SqlGuard::default().check("WITH x AS (SELECT 1) SELECT * FROM x");
        assert!(query.is_ok());
        let query = query.unwrap_or_else(|_| unreachable!());
        assert_eq!(query.leading_keyword(), LeadingKeyword::With);
        assert_eq!(query.sql(), "WITH x AS (SELECT 1) SELECT * FROM x\nLIMIT 10000");
    }

    #[test]
    fn cte_with_data_modification_is_rejected() {
        assert_eq!(
            rejection_kind("WITH x AS (SELECT 1) DELETE FROM t WHERE id IN (SELECT * FROM x)"),
            Some(RejectionKind::NotReadOnly)
        );
        assert_eq!(
            rejection_kind("WITH x AS (SELECT 1) REPLACE INTO t SELECT * FROM x"),
            Some(RejectionKind::NotReadOnly)
        );
        assert!(SqlGuard::default()
            .check("WITH x AS (SELECT replace(name, 'a', 'b') AS n FROM t) SELECT n FROM x")
            .is_ok());
    }

    #[test]
    fn quoted_identifier_named_select_is_not_a_keyword() {
        assert_eq!(
            rejection_kind("\"SELECT\" FROM t"),
            Some(RejectionKind::NotReadOnly)
        );
    }

    #[test]
    fn missing_limit_is_appended_exactly_once() {
        let query = SqlGuard::default().check("select region, sum(amount) from sales group by region;");
        assert!(query.is_ok());
        let query = query.unwrap_or_else(|_| unreachable!());
        assert!(query.limit_injected());
        assert_eq!(query.sql().matches("LIMIT 10000").count(), 1);
        assert!(query
            .sql()
            .ends_with("group by region\nLIMIT 10000"));

        for (sql, expected) in [
            ("SELECT 'done; --' AS note", "SELECT 'done; --' AS note\nLIMIT 10000"),
            ("SELECT 'a;b' AS x; ;  -- end", "SELECT 'a;b' AS x\nLIMIT 10000"),
            (
                "SELECT\n  'é;' AS accent;\n",
                "SELECT\n  'é;' AS accent\nLIMIT 10000",
            ),
        ] {
            let query = SqlGuard::default().check(sql);
            assert!(query.is_ok(), "expected {sql:?} to be accepted");
            let query = query.unwrap_or_else(|_| unreachable!());
            assert_eq!(query.sql(), expected);
        }
    }

    #[test]
    fn limit_after_trailing_comment_stays_effective() {
        let query = SqlGuard::new(50).check("SELECT * FROM t -- newest first");
        assert!(query.is_ok());
        let query = query.unwrap_or_else(|_| unreachable!());
        assert_eq!(query.sql(), "SELECT * FROM t -- newest first\nLIMIT 50");
    }

    #[test]
    fn existing_limit_is_preserved() {
        let query = SqlGuard::default().check("SELECT * FROM t LIMIT 5");
        assert!(query.is_ok());
        let query = query.unwrap_or_else(|_| unreachable!());
        assert!(!query.limit_injected());
        assert_eq!(query.sql(), "SELECT * FROM t LIMIT 5");
    }

    #[test]
    fn rejected_sql_never_reaches_the_store() {
        struct PanickingStore;

        impl super::DataStore for PanickingStore {
            fn execute(
                &self,
                _query: &super::GuardedQuery,
                _params: &[serde_json::Value],
                _deadline: &analyst_center_domain::Deadline,
            ) -> Result<super::QueryRows, super::DataStoreError> {
                panic!("store must not be reached for rejected SQL");
            }

            fn describe_schema(
                &self,
                _guard: &SqlGuard,
                _deadline: &analyst_center_domain::Deadline,
            ) -> Result<String, super::DataStoreError> {
                Ok(String::new())
            }
        }

        let outcome = SqlGuard::default().execute(
            &PanickingStore,
            "SELECT 1; DROP TABLE t",
            &[],
            &analyst_center_domain::Deadline::none(),
        );
        assert!(matches!(
            outcome,
            Ok(GuardOutcome::Rejected(ref rejection))
                if rejection.kind == RejectionKind::MultipleStatements
        ));
    }
}
