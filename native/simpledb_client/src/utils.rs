/// Utility functions and helpers for SimpleDB
///
/// This module provides commonly used helper functions for locking and for
/// classifying SQL statements by their leading keyword.
use std::sync::{Mutex, MutexGuard};

use crate::error::{Error, Result};

/// Safely lock a mutex with proper error handling
///
/// Returns `Error::LockPoisoned` naming the caller if the mutex is poisoned.
pub fn safe_lock<'a, T>(mutex: &'a Mutex<T>, context: &str) -> Result<MutexGuard<'a, T>> {
    mutex
        .lock()
        .map_err(|e| Error::LockPoisoned(format!("{context}: {e}")))
}

/// Statement classification by leading keyword
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryType {
    Select,
    Insert,
    Update,
    Delete,
    Create,
    Drop,
    Alter,
    Begin,
    Commit,
    Rollback,
    Other,
}

impl QueryType {
    /// BEGIN, COMMIT or ROLLBACK: statements that never get an implicit BEGIN.
    pub fn is_transaction_control(self) -> bool {
        matches!(self, QueryType::Begin | QueryType::Commit | QueryType::Rollback)
    }

    /// Statements allowed while the transaction is failed.
    pub fn ends_transaction(self) -> bool {
        matches!(self, QueryType::Commit | QueryType::Rollback)
    }
}

/// Detect the query type from a SQL statement
///
/// Examines the first keyword to categorize the statement. `ROLLBACK TO` is a
/// savepoint operation and does not end the transaction, so it is `Other`.
pub fn detect_query_type(query: &str) -> QueryType {
    let mut words = query.split_whitespace();
    let keyword = words.next().unwrap_or("").to_ascii_uppercase();
    let keyword = keyword.trim_end_matches(';');

    match keyword {
        "SELECT" | "WITH" | "VALUES" => QueryType::Select,
        "INSERT" => QueryType::Insert,
        "UPDATE" => QueryType::Update,
        "DELETE" => QueryType::Delete,
        "CREATE" => QueryType::Create,
        "DROP" => QueryType::Drop,
        "ALTER" => QueryType::Alter,
        "BEGIN" | "START" => QueryType::Begin,
        "COMMIT" | "END" => QueryType::Commit,
        "ROLLBACK" | "ABORT" => {
            let next = words.next().unwrap_or("");
            if next.eq_ignore_ascii_case("TO") {
                QueryType::Other
            } else {
                QueryType::Rollback
            }
        }
        _ => QueryType::Other,
    }
}

/// Build the CommandComplete tag for a finished statement.
///
/// `rows` is the number of rows returned (SELECT) or affected (DML).
pub fn command_tag(query: &str, rows: u64) -> String {
    match detect_query_type(query) {
        QueryType::Select => format!("SELECT {rows}"),
        QueryType::Insert => format!("INSERT 0 {rows}"),
        QueryType::Update => format!("UPDATE {rows}"),
        QueryType::Delete => format!("DELETE {rows}"),
        QueryType::Begin => "BEGIN".to_string(),
        QueryType::Commit => "COMMIT".to_string(),
        QueryType::Rollback => "ROLLBACK".to_string(),
        QueryType::Create | QueryType::Drop | QueryType::Alter => {
            // CREATE TABLE, DROP INDEX, ...
            let mut words = query
                .split_whitespace()
                .map(|w| w.trim_end_matches(';').to_ascii_uppercase());
            let verb = words.next().unwrap_or_default();
            match words.next() {
                Some(object) => format!("{verb} {object}"),
                None => verb,
            }
        }
        QueryType::Other => query
            .split_whitespace()
            .next()
            .unwrap_or("")
            .trim_end_matches(';')
            .to_ascii_uppercase(),
    }
}

