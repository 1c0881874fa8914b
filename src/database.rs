use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rusqlite::fallible_iterator::FallibleIterator;
use rusqlite::types::Value;
use rusqlite::{Batch, Connection, ErrorCode};
use thiserror::Error;
use tracing::{debug, warn};

/// How long a statement waits on a locked database before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between interrupt attempts once a query has timed out.
const INTERRUPT_RETRY: Duration = Duration::from_millis(50);

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database is not connected")]
    NotConnected,

    #[error("Query text is empty")]
    EmptyQuery,

    #[error("Only one SQL statement per message is supported")]
    MultipleStatements,

    #[error("Query timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error("Database task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Rows returned by a single query, in the order the database produced them.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl QueryResult {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Connection lifecycle used by the dispatcher for one query cycle.
///
/// An implementation holds at most one live connection. `connect` must come
/// before `execute_query`, and `disconnect` fails with `NotConnected` when
/// nothing is held.
#[async_trait]
pub trait Gateway: Send {
    async fn connect(&mut self) -> Result<(), DbError>;

    /// Run `sql` verbatim inside a transaction and return every row.
    async fn execute_query(&mut self, sql: &str) -> Result<QueryResult, DbError>;

    async fn disconnect(&mut self) -> Result<(), DbError>;
}

/// SQLite gateway. `address` is a file path or a `file:` URI.
pub struct SqliteGateway {
    address: String,
    query_timeout: Duration,
    conn: Option<Connection>,
}

impl SqliteGateway {
    pub fn new(address: impl Into<String>, query_timeout: Duration) -> Self {
        Self {
            address: address.into(),
            query_timeout,
            conn: None,
        }
    }

    #[cfg(test)]
    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }
}

#[async_trait]
impl Gateway for SqliteGateway {
    async fn connect(&mut self) -> Result<(), DbError> {
        if let Some(previous) = self.conn.take() {
            warn!("connect() called while already connected, closing previous connection");
            close_connection(previous)?;
        }

        let address = self.address.clone();
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection, DbError> {
            let conn = Connection::open(&address)?;
            conn.busy_timeout(BUSY_TIMEOUT)?;
            Ok(conn)
        })
        .await??;

        debug!("Connected to database: {}", self.address);
        self.conn = Some(conn);
        Ok(())
    }

    async fn execute_query(&mut self, sql: &str) -> Result<QueryResult, DbError> {
        let conn = self.conn.take().ok_or(DbError::NotConnected)?;
        if sql.trim().is_empty() {
            self.conn = Some(conn);
            return Err(DbError::EmptyQuery);
        }

        let interrupt = conn.get_interrupt_handle();
        let cancelled = Arc::new(AtomicBool::new(false));
        let query_timeout = self.query_timeout;
        let sql = sql.to_string();
        let started = Instant::now();

        let mut task = tokio::task::spawn_blocking({
            let cancelled = Arc::clone(&cancelled);
            move || {
                let mut conn = conn;
                let result = run_unless_cancelled(&mut conn, &sql, &cancelled, query_timeout);
                (conn, result)
            }
        });

        let (conn, result) = match tokio::time::timeout(query_timeout, &mut task).await {
            Ok(joined) => joined?,
            Err(_) => {
                warn!("Query exceeded {:?}, interrupting statement", query_timeout);
                cancelled.store(true, Ordering::SeqCst);
                // The interrupt is a no-op while no statement runs, so repeat it
                // until the task hands the connection back.
                let (conn, result) = loop {
                    interrupt.interrupt();
                    if let Ok(joined) = tokio::time::timeout(INTERRUPT_RETRY, &mut task).await {
                        break joined?;
                    }
                };
                (conn, settle_interrupted(result, query_timeout))
            }
        };
        self.conn = Some(conn);

        if let Ok(rows) = &result {
            debug!(
                "Query returned {} row(s) with columns {:?} in {:?}",
                rows.len(),
                rows.columns,
                started.elapsed()
            );
        }
        result
    }

    async fn disconnect(&mut self) -> Result<(), DbError> {
        let conn = self.conn.take().ok_or(DbError::NotConnected)?;
        close_connection(conn)?;
        debug!("Disconnected from database: {}", self.address);
        Ok(())
    }
}

fn close_connection(conn: Connection) -> Result<(), DbError> {
    conn.close().map_err(|(_, e)| DbError::Sqlite(e))
}

fn run_unless_cancelled(
    conn: &mut Connection,
    sql: &str,
    cancelled: &AtomicBool,
    query_timeout: Duration,
) -> Result<QueryResult, DbError> {
    if cancelled.load(Ordering::SeqCst) {
        return Err(DbError::Timeout(query_timeout));
    }
    run_query(conn, sql)
}

/// Outcome of a query whose timeout fired: a statement that completed before
/// the interrupt landed keeps its result, an interrupted one becomes `Timeout`.
fn settle_interrupted(
    result: Result<QueryResult, DbError>,
    query_timeout: Duration,
) -> Result<QueryResult, DbError> {
    match result {
        Ok(rows) => Ok(rows),
        Err(DbError::Sqlite(e))
            if e.sqlite_error_code() != Some(ErrorCode::OperationInterrupted) =>
        {
            Err(DbError::Sqlite(e))
        }
        Err(_) => Err(DbError::Timeout(query_timeout)),
    }
}

fn run_query(conn: &mut Connection, sql: &str) -> Result<QueryResult, DbError> {
    let tx = conn.transaction()?;

    let result = {
        // Batch skips comment-only fragments; anything after the first real
        // statement is rejected before the first one runs.
        let mut batch = Batch::new(&tx, sql);
        let mut stmt = batch.next()?.ok_or(DbError::EmptyQuery)?;
        if batch.next()?.is_some() {
            return Err(DbError::MultipleStatements);
        }
        let columns: Vec<String> = stmt
            .column_names()
            .into_iter()
            .map(String::from)
            .collect();
        let width = stmt.column_count();

        let mut rows = stmt.query([])?;
        let mut collected = Vec::new();
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(width);
            for idx in 0..width {
                values.push(row.get::<_, Value>(idx)?);
            }
            collected.push(values);
        }

        QueryResult {
            columns,
            rows: collected,
        }
    };

    tx.commit()?;
    Ok(result)
}

/// Render a row as a tuple, e.g. `(1, 'alice', None)` or `(42,)`.
pub fn render_row(row: &[Value]) -> String {
    let mut out = String::from("(");
    for (idx, value) in row.iter().enumerate() {
        if idx > 0 {
            out.push_str(", ");
        }
        render_value(&mut out, value);
    }
    if row.len() == 1 {
        out.push(',');
    }
    out.push(')');
    out
}

fn render_value(out: &mut String, value: &Value) {
    match value {
        Value::Null => out.push_str("None"),
        Value::Integer(i) => {
            let _ = write!(out, "{}", i);
        }
        Value::Real(f) => {
            let _ = write!(out, "{:?}", f);
        }
        Value::Text(s) => {
            out.push('\'');
            for c in s.chars() {
                match c {
                    '\\' => out.push_str("\\\\"),
                    '\'' => out.push_str("\\'"),
                    '\n' => out.push_str("\\n"),
                    '\r' => out.push_str("\\r"),
                    '\t' => out.push_str("\\t"),
                    c => out.push(c),
                }
            }
            out.push('\'');
        }
        Value::Blob(bytes) => {
            out.push_str("b'");
            for &b in bytes {
                match b {
                    b'\\' => out.push_str("\\\\"),
                    b'\'' => out.push_str("\\'"),
                    0x20..=0x7e => out.push(b as char),
                    _ => {
                        let _ = write!(out, "\\x{:02x}", b);
                    }
                }
            }
            out.push('\'');
        }
    }
}
