//! Tests for utils.rs - Query type detection and command tags
//!
//! These tests verify the correctness of:
//! - `detect_query_type()` - Categorizes SQL statements by leading keyword
//! - `command_tag()` - Builds the CommandComplete tag the server reports
//! - `safe_lock()` - Maps mutex poisoning to an error

#![allow(clippy::unwrap_used)]

use std::sync::{Arc, Mutex};
use std::thread;

use crate::error::Error;
use crate::models::rows_from_tag;
use crate::utils::{command_tag, detect_query_type, safe_lock, QueryType};

/// Tests for query type detection
mod query_type_detection {
    use super::*;

    #[test]
    fn test_detect_select_query() {
        assert_eq!(detect_query_type("SELECT * FROM users"), QueryType::Select);
        assert_eq!(
            detect_query_type("  SELECT id FROM posts"),
            QueryType::Select
        );
        assert_eq!(
            detect_query_type("\nSELECT name FROM items"),
            QueryType::Select
        );
        assert_eq!(detect_query_type("select * from users"), QueryType::Select);
    }

    #[test]
    fn test_detect_row_returning_forms() {
        assert_eq!(
            detect_query_type("WITH t AS (SELECT 1) SELECT * FROM t"),
            QueryType::Select
        );
        assert_eq!(detect_query_type("VALUES (1), (2)"), QueryType::Select);
    }

    #[test]
    fn test_detect_dml() {
        assert_eq!(
            detect_query_type("INSERT INTO users (name) VALUES ('Alice')"),
            QueryType::Insert
        );
        assert_eq!(
            detect_query_type("update users SET name = 'Bob'"),
            QueryType::Update
        );
        assert_eq!(
            detect_query_type("DELETE FROM users WHERE id = 1"),
            QueryType::Delete
        );
    }

    #[test]
    fn test_detect_ddl() {
        assert_eq!(
            detect_query_type("CREATE TABLE t (id INTEGER)"),
            QueryType::Create
        );
        assert_eq!(detect_query_type("DROP TABLE t"), QueryType::Drop);
        assert_eq!(
            detect_query_type("ALTER TABLE t ADD COLUMN x TEXT"),
            QueryType::Alter
        );
    }

    #[test]
    fn test_detect_transaction_control() {
        assert_eq!(detect_query_type("BEGIN"), QueryType::Begin);
        assert_eq!(detect_query_type("begin immediate"), QueryType::Begin);
        assert_eq!(detect_query_type("START TRANSACTION"), QueryType::Begin);
        assert_eq!(detect_query_type("COMMIT"), QueryType::Commit);
        assert_eq!(detect_query_type("END"), QueryType::Commit);
        assert_eq!(detect_query_type("ROLLBACK"), QueryType::Rollback);
        assert_eq!(detect_query_type("abort"), QueryType::Rollback);
    }

    #[test]
    fn test_trailing_semicolon_is_ignored() {
        assert_eq!(detect_query_type("COMMIT;"), QueryType::Commit);
        assert_eq!(detect_query_type("rollback;"), QueryType::Rollback);
    }

    #[test]
    fn test_rollback_to_savepoint_is_other() {
        assert_eq!(detect_query_type("ROLLBACK TO sp1"), QueryType::Other);
        assert_eq!(detect_query_type("rollback to savepoint sp1"), QueryType::Other);
    }

    #[test]
    fn test_empty_and_unknown() {
        assert_eq!(detect_query_type(""), QueryType::Other);
        assert_eq!(detect_query_type("   \n\t"), QueryType::Other);
        assert_eq!(detect_query_type("PRAGMA foreign_keys"), QueryType::Other);
        assert_eq!(detect_query_type("SELECTED"), QueryType::Other);
    }

    #[test]
    fn test_transaction_control_classification() {
        assert!(QueryType::Begin.is_transaction_control());
        assert!(QueryType::Commit.is_transaction_control());
        assert!(QueryType::Rollback.is_transaction_control());
        assert!(!QueryType::Select.is_transaction_control());

        assert!(QueryType::Commit.ends_transaction());
        assert!(QueryType::Rollback.ends_transaction());
        assert!(!QueryType::Begin.ends_transaction());
        assert!(!QueryType::Other.ends_transaction());
    }
}

/// Tests for CommandComplete tags
mod command_tags {
    use super::*;

    #[test]
    fn test_row_count_tags() {
        assert_eq!(command_tag("SELECT * FROM t", 3), "SELECT 3");
        assert_eq!(command_tag("INSERT INTO t VALUES (1)", 1), "INSERT 0 1");
        assert_eq!(command_tag("UPDATE t SET x = 1", 0), "UPDATE 0");
        assert_eq!(command_tag("DELETE FROM t", 7), "DELETE 7");
    }

    #[test]
    fn test_ddl_tags_name_the_object_kind() {
        assert_eq!(command_tag("create table t (id int)", 0), "CREATE TABLE");
        assert_eq!(command_tag("DROP INDEX idx", 0), "DROP INDEX");
        assert_eq!(command_tag("DROP;", 0), "DROP");
    }

    #[test]
    fn test_transaction_tags() {
        assert_eq!(command_tag("BEGIN IMMEDIATE", 0), "BEGIN");
        assert_eq!(command_tag("END", 0), "COMMIT");
        assert_eq!(command_tag("ABORT", 0), "ROLLBACK");
    }

    #[test]
    fn test_other_tags_use_first_keyword() {
        assert_eq!(command_tag("pragma user_version = 3;", 0), "PRAGMA");
        assert_eq!(command_tag("", 0), "");
    }

    #[test]
    fn test_rows_from_tag() {
        assert_eq!(rows_from_tag("SELECT 3"), Some(3));
        assert_eq!(rows_from_tag("INSERT 0 12"), Some(12));
        assert_eq!(rows_from_tag("CREATE TABLE"), None);
        assert_eq!(rows_from_tag("COMMIT"), None);
    }
}

/// Tests for poisoned-lock handling
mod locking {
    use super::*;

    #[test]
    fn test_safe_lock_ok() {
        let mutex = Mutex::new(5);
        assert_eq!(*safe_lock(&mutex, "test").unwrap(), 5);
    }

    #[test]
    fn test_safe_lock_poisoned_names_context() {
        let mutex = Arc::new(Mutex::new(0));
        let poisoner = Arc::clone(&mutex);
        let _ = thread::spawn(move || {
            let _guard = poisoner.lock().unwrap();
            panic!("poison the lock");
        })
        .join();

        match safe_lock(&mutex, "fetch_one") {
            Err(Error::LockPoisoned(msg)) => assert!(msg.contains("fetch_one")),
            other => panic!("expected LockPoisoned, got {other:?}"),
        };
    }
}
