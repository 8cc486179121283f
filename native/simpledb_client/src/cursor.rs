/// Cursor-based statement execution and row retrieval
///
/// A cursor executes statements on its connection and reads the rows of the
/// most recent one. Rows are streamed from the server as they are fetched:
/// nothing is buffered ahead, so abandoning a large result after a few rows
/// costs nothing until the connection's next request drains it.
use std::sync::Arc;

use tracing::debug;

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::models::{rows_from_tag, Column, CursorState, Row, Value};
use crate::result::{ResultStream, Rows};

/// Execution and result-retrieval handle bound to a connection.
#[derive(Debug)]
pub struct Cursor<'conn> {
    conn: &'conn Connection,
    query: Option<String>,
    description: Option<Arc<[Column]>>,
    stream: Option<ResultStream>,
    state: CursorState,
    rows_fetched: u64,
    command_tag: Option<String>,
}

impl<'conn> Cursor<'conn> {
    pub(crate) fn new(conn: &'conn Connection) -> Self {
        Self {
            conn,
            query: None,
            description: None,
            stream: None,
            state: CursorState::Idle,
            rows_fetched: 0,
            command_tag: None,
        }
    }

    /// Execute a statement, discarding any unconsumed rows of the previous one.
    ///
    /// Parameters bind positionally to `$1`, `$2`, ...
    pub fn execute(&mut self, sql: &str, params: &[Value]) -> Result<()> {
        if self.state == CursorState::Closed {
            return Err(Error::ConnectionClosed);
        }

        if self.stream.take().is_some_and(|s| !s.is_finished()) {
            debug!("cursor re-executed before its result was consumed");
        }
        self.query = Some(sql.to_string());
        self.description = None;
        self.command_tag = None;
        self.rows_fetched = 0;
        // a failed execute leaves nothing to fetch
        self.state = CursorState::Idle;

        let handle = self.conn.execute(sql, params)?;
        match (handle.description, handle.result_id) {
            (Some(columns), Some(result_id)) => {
                self.stream = Some(ResultStream::new(result_id));
                self.description = Some(columns);
                self.state = CursorState::HasResult;
            }
            _ => {
                self.command_tag = handle.command_tag;
                self.state = CursorState::Exhausted;
            }
        }
        Ok(())
    }

    /// Next row of the current result, or `None` at end of results.
    pub fn fetch_one(&mut self) -> Result<Option<Row>> {
        match self.state {
            CursorState::Closed => return Err(Error::ConnectionClosed),
            CursorState::Idle => {
                return Err(Error::CursorState(
                    "fetch called before a statement was executed".to_string(),
                ))
            }
            CursorState::Exhausted => return self.end_of_results(),
            CursorState::HasResult => {}
        }

        let Some(stream) = self.stream.as_mut() else {
            self.state = CursorState::Exhausted;
            return Ok(None);
        };
        match stream.next(self.conn) {
            Ok(Some(row)) => {
                self.rows_fetched += 1;
                Ok(Some(row))
            }
            Ok(None) => {
                self.command_tag = stream.command_tag().map(str::to_string);
                self.state = CursorState::Exhausted;
                Ok(None)
            }
            Err(e) => {
                self.state = CursorState::Exhausted;
                Err(e)
            }
        }
    }

    /// End of results is only reported while the connection is usable; once
    /// the transport has failed or the connection was closed every fetch
    /// fails.
    fn end_of_results(&self) -> Result<Option<Row>> {
        if self.conn.is_broken() || self.conn.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        Ok(None)
    }

    /// Up to `n` rows; fewer only at end of results.
    pub fn fetch_many(&mut self, n: usize) -> Result<Vec<Row>> {
        let mut rows = Vec::with_capacity(n.min(1024));
        while rows.len() < n {
            match self.fetch_one()? {
                Some(row) => rows.push(row),
                None => break,
            }
        }
        Ok(rows)
    }

    /// All remaining rows.
    pub fn fetch_all(&mut self) -> Result<Vec<Row>> {
        self.iter().collect()
    }

    /// Lazy iterator over the remaining rows. Shares the cursor's position.
    pub fn iter(&mut self) -> Rows<'_, 'conn> {
        Rows::new(self)
    }

    /// Result descriptor of the current statement; `None` when it returns no rows.
    pub fn description(&self) -> Option<&[Column]> {
        self.description.as_deref()
    }

    /// Server-reported row count of the current statement.
    ///
    /// Known immediately for statements without rows (rows affected) and
    /// after end of results for row-returning ones.
    pub fn row_count(&self) -> Option<u64> {
        self.command_tag.as_deref().and_then(rows_from_tag)
    }

    /// Rows returned to the caller since the last execute.
    pub fn rows_fetched(&self) -> u64 {
        self.rows_fetched
    }

    pub fn command_tag(&self) -> Option<&str> {
        self.command_tag.as_deref()
    }

    /// Text of the last executed statement.
    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    pub fn state(&self) -> CursorState {
        self.state
    }

    pub fn connection(&self) -> &'conn Connection {
        self.conn
    }

    /// Close the cursor, silently discarding unconsumed rows. Idempotent.
    pub fn close(&mut self) {
        if self.state == CursorState::Closed {
            return;
        }
        // the connection drains the stream before its next request
        self.stream = None;
        self.description = None;
        self.state = CursorState::Closed;
    }
}

impl Drop for Cursor<'_> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<'c, 'conn> IntoIterator for &'c mut Cursor<'conn> {
    type Item = Result<Row>;
    type IntoIter = Rows<'c, 'conn>;

    fn into_iter(self) -> Self::IntoIter {
        Rows::new(self)
    }
}
