/// Explicit transaction scopes
///
/// Statements normally open a transaction implicitly and the caller ends it
/// with `Connection::commit`. A `Transaction` guard makes the scope explicit:
/// it sends BEGIN up front and rolls back on drop unless committed, so an
/// early return or `?` never leaves work half-applied.
use std::fmt;

use tracing::{debug, warn};

use crate::connection::Connection;
use crate::cursor::Cursor;
use crate::error::{Error, Result};
use crate::models::{StatementHandle, Value};

/// Isolation level requested by the BEGIN statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionBehavior {
    /// Whatever the server uses by default.
    #[default]
    ServerDefault,
    ReadCommitted,
    RepeatableRead,
    /// The loopback server takes its write lock at BEGIN for this level.
    Serializable,
}

impl TransactionBehavior {
    pub fn as_sql(self) -> &'static str {
        match self {
            TransactionBehavior::ServerDefault => "BEGIN",
            TransactionBehavior::ReadCommitted => "BEGIN ISOLATION LEVEL READ COMMITTED",
            TransactionBehavior::RepeatableRead => "BEGIN ISOLATION LEVEL REPEATABLE READ",
            TransactionBehavior::Serializable => "BEGIN ISOLATION LEVEL SERIALIZABLE",
        }
    }
}

/// An open transaction that rolls back on drop unless committed.
pub struct Transaction<'conn> {
    conn: &'conn Connection,
    finished: bool,
}

impl<'conn> Transaction<'conn> {
    /// Run statements of this transaction through a cursor.
    pub fn cursor(&self) -> Result<Cursor<'conn>> {
        self.ensure_active()?;
        self.conn.cursor()
    }

    pub fn execute(&self, sql: &str, params: &[Value]) -> Result<StatementHandle> {
        self.ensure_active()?;
        self.conn.execute(sql, params)
    }

    pub fn connection(&self) -> &'conn Connection {
        self.conn
    }

    /// Commit and end the scope.
    pub fn commit(mut self) -> Result<()> {
        self.finished = true;
        self.conn.commit()
    }

    /// Roll back and end the scope.
    pub fn rollback(mut self) -> Result<()> {
        self.finished = true;
        self.conn.rollback()
    }

    fn ensure_active(&self) -> Result<()> {
        if self.finished {
            return Err(Error::CursorState("transaction already finished".to_string()));
        }
        Ok(())
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        debug!(session = %self.conn.session_id(), "transaction dropped without commit");
        if let Err(e) = self.conn.rollback() {
            warn!(
                session = %self.conn.session_id(),
                "rollback of dropped transaction failed: {}",
                e
            );
        }
    }
}

impl fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("session_id", &self.conn.session_id())
            .field("finished", &self.finished)
            .finish()
    }
}

impl Connection {
    /// Open a transaction scope at the server's default isolation level.
    pub fn transaction(&self) -> Result<Transaction<'_>> {
        self.transaction_with(TransactionBehavior::ServerDefault)
    }

    /// Open a transaction scope with the given isolation level.
    ///
    /// Fails with `Error::CursorState` when a transaction is already open.
    pub fn transaction_with(&self, behavior: TransactionBehavior) -> Result<Transaction<'_>> {
        self.lock("transaction")?.begin(behavior.as_sql())?;
        Ok(Transaction {
            conn: self,
            finished: false,
        })
    }
}
