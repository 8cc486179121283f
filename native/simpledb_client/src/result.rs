/// Lazy result iteration
///
/// A `ResultStream` is the pull-based iterator behind a cursor. Each `next`
/// reads at most one row off the connection's transport, so memory use does
/// not depend on the size of the result. End of results is reported exactly
/// once by the server and remembered afterwards; later pulls do no I/O.
use std::iter::FusedIterator;

use crate::connection::Connection;
use crate::cursor::Cursor;
use crate::error::Result;
use crate::models::Row;
use crate::query::Pull;

#[derive(Debug)]
pub(crate) struct ResultStream {
    result_id: u64,
    finished: bool,
    command_tag: Option<String>,
}

impl ResultStream {
    pub(crate) fn new(result_id: u64) -> Self {
        Self {
            result_id,
            finished: false,
            command_tag: None,
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished
    }

    /// Command tag of the finished statement, if the server's was received.
    pub(crate) fn command_tag(&self) -> Option<&str> {
        self.command_tag.as_deref()
    }

    /// Pull the next row. `Ok(None)` is end of results.
    ///
    /// An error also ends the stream: the rows after it are unreachable.
    pub(crate) fn next(&mut self, conn: &Connection) -> Result<Option<Row>> {
        if self.finished {
            return Ok(None);
        }
        let pulled = conn
            .lock("result stream")
            .and_then(|mut inner| inner.next_row(self.result_id));
        match pulled {
            Ok(Pull::Row(row)) => Ok(Some(row)),
            Ok(Pull::Done { command_tag }) => {
                self.finished = true;
                self.command_tag = command_tag;
                Ok(None)
            }
            Err(e) => {
                self.finished = true;
                Err(e)
            }
        }
    }
}

/// Single-pass iterator over the rows of a cursor's current result.
///
/// Equivalent to calling [`Cursor::fetch_one`] until it returns `None`, and
/// shares its position. Yields nothing once the result is exhausted, and
/// stops after the first error.
#[derive(Debug)]
pub struct Rows<'c, 'conn> {
    cursor: &'c mut Cursor<'conn>,
    done: bool,
}

impl<'c, 'conn> Rows<'c, 'conn> {
    pub(crate) fn new(cursor: &'c mut Cursor<'conn>) -> Self {
        Self {
            cursor,
            done: false,
        }
    }
}

impl Iterator for Rows<'_, '_> {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.cursor.fetch_one() {
            Ok(Some(row)) => Some(Ok(row)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

impl FusedIterator for Rows<'_, '_> {}
