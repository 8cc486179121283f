//! Integration tests against the loopback server
//!
//! Each test starts a loopback server over a fresh temporary database and
//! talks to it through real TCP connections. They verify statement
//! execution, lazy row streaming, parameter binding and the transaction
//! state machine end to end.

#![allow(clippy::unwrap_used)]

use std::time::Duration;

use super::test_utils::{setup_test_db_with_prefix, TestServer};
use crate::config::ConnectOptions;
use crate::connection::Connection;
use crate::error::Error;
use crate::models::{ColumnType, CursorState, TransactionState, Value};
use crate::server::ServerConfig;
use crate::transaction::TransactionBehavior;

fn count_rows(conn: &Connection, table: &str) -> i64 {
    let mut cur = conn.cursor().unwrap();
    cur.execute(&format!("SELECT count(*) FROM {table}"), &[])
        .unwrap();
    let count = cur.fetch_one().unwrap().unwrap()[0].as_i64().unwrap();
    drop(cur);
    conn.rollback().unwrap();
    count
}

// ============================================================================
// BASIC STATEMENT FLOW
// ============================================================================

#[test]
fn test_create_insert_select_commit() {
    let server = TestServer::start("basic");
    let conn = server.connect();
    let mut cur = conn.cursor().unwrap();

    cur.execute("CREATE TABLE t (id INT, name VARCHAR(10))", &[])
        .unwrap();
    assert_eq!(cur.state(), CursorState::Exhausted);
    assert!(cur.description().is_none());

    cur.execute("INSERT INTO t VALUES (100, 'taro')", &[])
        .unwrap();
    assert_eq!(cur.row_count(), Some(1));

    cur.execute("SELECT * FROM t", &[]).unwrap();
    let columns = cur.description().unwrap();
    assert_eq!(columns.len(), 2);
    assert_eq!(columns[0].name, "id");
    assert_eq!(columns[0].column_type, ColumnType::Integer);
    assert_eq!(columns[1].column_type, ColumnType::Text);

    let row = cur.fetch_one().unwrap().unwrap();
    assert_eq!(row[0], Value::Integer(100));
    assert_eq!(row.get_by_name("name"), Some(&Value::from("taro")));
    assert_eq!(cur.iter().count(), 0);

    assert_eq!(conn.transaction_state().unwrap(), TransactionState::Open);
    conn.commit().unwrap();
    assert_eq!(conn.transaction_state().unwrap(), TransactionState::Idle);
}

#[test]
fn test_malformed_statement_then_recovery() {
    let server = TestServer::start("recovery");
    let conn = server.connect();
    let mut cur = conn.cursor().unwrap();

    let err = cur.execute("SELEC 1", &[]).unwrap_err();
    assert_eq!(err.code(), Some("42601"));
    assert_eq!(conn.transaction_state().unwrap(), TransactionState::Failed);

    assert!(matches!(
        cur.execute("SELECT 1", &[]),
        Err(Error::TransactionAborted)
    ));

    conn.rollback().unwrap();
    assert_eq!(conn.transaction_state().unwrap(), TransactionState::Idle);

    cur.execute("SELECT 1", &[]).unwrap();
    assert_eq!(cur.fetch_one().unwrap().unwrap()[0], Value::Integer(1));
}

#[test]
fn test_commit_of_failed_transaction_discards_work() {
    let server = TestServer::start("failed_commit");
    let conn = server.connect();

    conn.execute("CREATE TABLE t (id INTEGER PRIMARY KEY)", &[])
        .unwrap();
    conn.commit().unwrap();

    conn.execute("INSERT INTO t VALUES (1)", &[]).unwrap();
    let err = conn.execute("INSERT INTO t VALUES (1)", &[]).unwrap_err();
    assert_eq!(err.code(), Some("23505"));

    assert!(matches!(conn.commit(), Err(Error::TransactionAborted)));
    assert_eq!(conn.transaction_state().unwrap(), TransactionState::Idle);
    assert_eq!(count_rows(&conn, "t"), 0);
}

#[test]
fn test_server_error_codes() {
    let server = TestServer::start("codes");
    let conn = server.connect();
    conn.set_autocommit(true).unwrap();

    let err = conn.execute("SELECT * FROM missing", &[]).unwrap_err();
    assert_eq!(err.code(), Some("42P01"));

    conn.execute("CREATE TABLE t (id INTEGER NOT NULL)", &[])
        .unwrap();
    let err = conn
        .execute("CREATE TABLE t (id INTEGER)", &[])
        .unwrap_err();
    assert_eq!(err.code(), Some("42P07"));

    let err = conn
        .execute("INSERT INTO t VALUES (NULL)", &[])
        .unwrap_err();
    assert_eq!(err.code(), Some("23502"));

    let err = conn.execute("SELECT nope FROM t", &[]).unwrap_err();
    assert_eq!(err.code(), Some("42703"));
    assert_eq!(conn.transaction_state().unwrap(), TransactionState::Idle);
}

#[test]
fn test_multi_statement_query() {
    let server = TestServer::start("multi");
    let conn = server.connect();
    let mut cur = conn.cursor().unwrap();

    cur.execute(
        "CREATE TABLE m (x INTEGER); INSERT INTO m VALUES (1); INSERT INTO m VALUES (2)",
        &[],
    )
    .unwrap();
    assert_eq!(cur.row_count(), Some(1));

    // only the first result set is returned
    cur.execute("SELECT x FROM m ORDER BY x; SELECT 99 AS y", &[])
        .unwrap();
    assert_eq!(cur.description().unwrap()[0].name, "x");
    let xs: Vec<Value> = cur
        .fetch_all()
        .unwrap()
        .into_iter()
        .map(|r| r[0].clone())
        .collect();
    assert_eq!(xs, vec![Value::Integer(1), Value::Integer(2)]);
    assert_eq!(cur.row_count(), Some(2));
    assert!(!conn.is_broken());
    drop(cur);
    conn.commit().unwrap();

    // the first failure stops the remaining statements
    let err = conn
        .execute(
            "INSERT INTO m VALUES (3); INSERT INTO nope VALUES (1); INSERT INTO m VALUES (4)",
            &[],
        )
        .unwrap_err();
    assert_eq!(err.code(), Some("42P01"));
    assert_eq!(conn.transaction_state().unwrap(), TransactionState::Failed);
    conn.rollback().unwrap();
    assert_eq!(count_rows(&conn, "m"), 2);
}

#[test]
fn test_multiple_commands_rejected_with_parameters() {
    let server = TestServer::start("multi_params");
    let conn = server.connect();
    conn.execute("CREATE TABLE m (x INTEGER)", &[]).unwrap();
    conn.commit().unwrap();

    let err = conn
        .execute(
            "INSERT INTO m VALUES ($1); INSERT INTO m VALUES ($1)",
            &[Value::Integer(1)],
        )
        .unwrap_err();
    assert_eq!(err.code(), Some("42601"));
    assert_eq!(conn.transaction_state().unwrap(), TransactionState::Failed);
    assert!(matches!(
        conn.execute("SELECT 1", &[]),
        Err(Error::TransactionAborted)
    ));

    conn.rollback().unwrap();
    assert_eq!(count_rows(&conn, "m"), 0);
}

// ============================================================================
// LAZY STREAMING
// ============================================================================

#[test]
fn test_large_result_abandoned_after_one_row() {
    let server = TestServer::start("large");
    let conn = server.connect();

    conn.execute("CREATE TABLE big (id INTEGER)", &[]).unwrap();
    let handle = conn
        .execute(
            "INSERT INTO big WITH RECURSIVE c(x) AS \
             (SELECT 1 UNION ALL SELECT x + 1 FROM c WHERE x < 10000) SELECT x FROM c",
            &[],
        )
        .unwrap();
    assert_eq!(handle.rows_affected(), Some(10_000));

    {
        let mut cur = conn.cursor().unwrap();
        cur.execute("SELECT id FROM big ORDER BY id", &[]).unwrap();
        assert_eq!(cur.fetch_one().unwrap().unwrap()[0], Value::Integer(1));
        assert_eq!(cur.rows_fetched(), 1);
        cur.close();
    }

    // the connection is still usable once the rest of the stream is discarded
    conn.commit().unwrap();
    assert_eq!(count_rows(&conn, "big"), 10_000);
}

#[test]
fn test_iteration_count_matches_row_count() {
    let server = TestServer::start("rowcount");
    let conn = server.connect();
    let mut cur = conn.cursor().unwrap();

    cur.execute("CREATE TABLE t (id INTEGER)", &[]).unwrap();
    for i in 0..7i64 {
        cur.execute("INSERT INTO t VALUES ($1)", &[Value::from(i)])
            .unwrap();
    }

    cur.execute("SELECT id FROM t", &[]).unwrap();
    let rows = cur.iter().collect::<crate::Result<Vec<_>>>().unwrap();
    assert_eq!(rows.len(), 7);
    assert_eq!(cur.row_count(), Some(7));
    assert_eq!(cur.rows_fetched(), 7);

    assert_eq!(cur.iter().count(), 0);
    assert_eq!(cur.iter().count(), 0);
    assert!(cur.fetch_one().unwrap().is_none());
}

#[test]
fn test_fetch_one_and_iter_share_position() {
    let server = TestServer::start("position");
    let conn = server.connect();
    let mut cur = conn.cursor().unwrap();

    cur.execute(
        "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c WHERE x < 5) \
         SELECT x FROM c",
        &[],
    )
    .unwrap();
    assert_eq!(cur.fetch_one().unwrap().unwrap()[0], Value::Integer(1));
    let rest: Vec<i64> = cur
        .iter()
        .take(2)
        .map(|r| r.unwrap()[0].as_i64().unwrap())
        .collect();
    assert_eq!(rest, vec![2, 3]);
    assert_eq!(cur.fetch_many(10).unwrap().len(), 2);
    assert_eq!(cur.state(), CursorState::Exhausted);
}

#[test]
fn test_reexecute_discards_unconsumed_rows() {
    let server = TestServer::start("reexecute");
    let conn = server.connect();
    let mut cur = conn.cursor().unwrap();

    cur.execute(
        "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c WHERE x < 100) \
         SELECT x FROM c",
        &[],
    )
    .unwrap();
    cur.fetch_one().unwrap();

    cur.execute("SELECT 'again'", &[]).unwrap();
    let rows = cur.fetch_all().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0][0], Value::from("again"));
}

// ============================================================================
// TRANSACTIONS
// ============================================================================

#[test]
fn test_state_alternates_with_commit() {
    let server = TestServer::start("alternate");
    let conn = server.connect();

    conn.execute("CREATE TABLE t (id INTEGER)", &[]).unwrap();
    conn.commit().unwrap();

    for i in 0..5i64 {
        assert_eq!(conn.transaction_state().unwrap(), TransactionState::Idle);
        conn.execute("INSERT INTO t VALUES ($1)", &[Value::from(i)])
            .unwrap();
        assert_eq!(conn.transaction_state().unwrap(), TransactionState::Open);
        conn.commit().unwrap();
    }
    assert_eq!(count_rows(&conn, "t"), 5);
}

#[test]
fn test_close_rolls_back_uncommitted_writes() {
    let server = TestServer::start("close_rollback");

    let conn = server.connect();
    conn.execute("CREATE TABLE t (id INTEGER)", &[]).unwrap();
    conn.commit().unwrap();
    conn.execute("INSERT INTO t VALUES (1)", &[]).unwrap();
    conn.close();

    let dropped = server.connect();
    dropped.execute("INSERT INTO t VALUES (2)", &[]).unwrap();
    drop(dropped);

    let check = server.connect();
    assert_eq!(count_rows(&check, "t"), 0);
}

#[test]
fn test_transaction_guard() {
    let server = TestServer::start("guard");
    let conn = server.connect();
    conn.set_autocommit(true).unwrap();
    conn.execute("CREATE TABLE t (id INTEGER)", &[]).unwrap();

    let tx = conn.transaction().unwrap();
    tx.execute("INSERT INTO t VALUES (1)", &[]).unwrap();
    assert_eq!(conn.transaction_state().unwrap(), TransactionState::Open);
    tx.commit().unwrap();

    {
        let tx = conn.transaction().unwrap();
        let mut cur = tx.cursor().unwrap();
        cur.execute("INSERT INTO t VALUES (2)", &[]).unwrap();
        // dropped without commit
    }
    assert_eq!(conn.transaction_state().unwrap(), TransactionState::Idle);

    let mut cur = conn.cursor().unwrap();
    cur.execute("SELECT id FROM t", &[]).unwrap();
    let ids: Vec<Value> = cur
        .fetch_all()
        .unwrap()
        .into_iter()
        .map(|r| r[0].clone())
        .collect();
    assert_eq!(ids, vec![Value::Integer(1)]);
}

#[test]
fn test_transaction_with_isolation_level() {
    let server = TestServer::start("isolation");
    let conn = server.connect();
    conn.set_autocommit(true).unwrap();
    conn.execute("CREATE TABLE t (id INTEGER)", &[]).unwrap();

    for behavior in [
        TransactionBehavior::ServerDefault,
        TransactionBehavior::ReadCommitted,
        TransactionBehavior::RepeatableRead,
        TransactionBehavior::Serializable,
    ] {
        let tx = conn.transaction_with(behavior).unwrap();
        tx.execute("INSERT INTO t VALUES (1)", &[]).unwrap();
        tx.commit().unwrap();
    }
    assert_eq!(count_rows(&conn, "t"), 4);
}

#[test]
fn test_autocommit_makes_writes_visible() {
    let server = TestServer::start("autocommit");
    let writer = Connection::connect(&server.options().autocommit(true)).unwrap();
    assert!(writer.autocommit().unwrap());

    writer.execute("CREATE TABLE t (id INTEGER)", &[]).unwrap();
    writer.execute("INSERT INTO t VALUES (1)", &[]).unwrap();
    assert_eq!(writer.transaction_state().unwrap(), TransactionState::Idle);

    let reader = server.connect();
    assert_eq!(count_rows(&reader, "t"), 1);
}

// ============================================================================
// PARAMETERS AND TYPES
// ============================================================================

#[test]
fn test_parameter_binding_round_trip() {
    let server = TestServer::start("params");
    let conn = server.connect();
    let mut cur = conn.cursor().unwrap();

    cur.execute(
        "CREATE TABLE items (id INTEGER, price REAL, name TEXT, data BLOB, flag BOOLEAN)",
        &[],
    )
    .unwrap();
    cur.execute(
        "INSERT INTO items VALUES ($1, $2, $3, $4, $5)",
        &[
            Value::from(1),
            Value::from(19.99),
            Value::from("it's"),
            Value::from(vec![0u8, 1, 255]),
            Value::from(true),
        ],
    )
    .unwrap();
    cur.execute(
        "INSERT INTO items VALUES ($1, $2, $3, $4, $5)",
        &[
            Value::from(2),
            Value::Null,
            Value::Null,
            Value::Null,
            Value::from(false),
        ],
    )
    .unwrap();

    cur.execute(
        "SELECT id, price, name, data, flag FROM items WHERE id = $1",
        &[Value::from(1)],
    )
    .unwrap();
    let row = cur.fetch_one().unwrap().unwrap();
    assert_eq!(row[0], Value::Integer(1));
    assert!((row[1].as_f64().unwrap() - 19.99).abs() < 1e-9);
    assert_eq!(row[2], Value::from("it's"));
    assert_eq!(row[3], Value::Blob(vec![0, 1, 255]));
    assert_eq!(row[4], Value::Integer(1));
    assert!(cur.fetch_one().unwrap().is_none());

    cur.execute(
        "SELECT price, name, flag FROM items WHERE id = $1",
        &[Value::from(2)],
    )
    .unwrap();
    let row = cur.fetch_one().unwrap().unwrap();
    assert!(row[0].is_null());
    assert!(row[1].is_null());
    assert_eq!(row[2], Value::Integer(0));
}

// ============================================================================
// SESSION
// ============================================================================

#[test]
fn test_server_parameters_and_ping() {
    let server = TestServer::start("session");
    let conn = Connection::connect(&server.options().application_name("itest")).unwrap();

    assert_eq!(
        conn.server_parameter("client_encoding").unwrap().as_deref(),
        Some("UTF8")
    );
    assert_eq!(
        conn.server_parameter("application_name").unwrap().as_deref(),
        Some("itest")
    );
    assert!(conn.server_parameter("server_version").unwrap().is_some());
    assert!(conn.backend_key().unwrap().unwrap().process_id >= 1);

    conn.ping().unwrap();
    assert_eq!(conn.transaction_state().unwrap(), TransactionState::Idle);
}

#[test]
fn test_password_authentication() {
    let server = TestServer::start_with(
        ServerConfig::new(setup_test_db_with_prefix("auth")).password("hunter2"),
    );

    let wrong = Connection::connect(&server.options().password("nope"));
    match wrong {
        Err(Error::Connection(msg)) => assert!(msg.contains("28P01")),
        other => panic!("expected Connection error, got {other:?}"),
    }
    assert!(matches!(
        Connection::connect(&server.options()),
        Err(Error::Connection(_))
    ));

    let conn = Connection::connect(&server.options().password("hunter2")).unwrap();
    conn.ping().unwrap();
}

#[test]
fn test_connect_refused() {
    let options = ConnectOptions::new()
        .port(1)
        .connect_timeout(Duration::from_secs(1));
    assert!(matches!(
        Connection::connect(&options),
        Err(Error::Connection(_))
    ));
}

#[test]
fn test_connection_drop_while_streaming() {
    let server = TestServer::start("drop_stream");
    let conn = server.connect();
    conn.execute("CREATE TABLE t (id INTEGER)", &[]).unwrap();
    conn.execute(
        "INSERT INTO t WITH RECURSIVE c(x) AS \
         (SELECT 1 UNION ALL SELECT x + 1 FROM c WHERE x < 5000) SELECT x FROM c",
        &[],
    )
    .unwrap();
    conn.commit().unwrap();

    let mut cur = conn.cursor().unwrap();
    cur.execute("SELECT id FROM t", &[]).unwrap();
    cur.fetch_one().unwrap();
    conn.close();
    assert!(matches!(cur.fetch_one(), Err(Error::ConnectionClosed)));
    drop(cur);

    let check = server.connect();
    assert_eq!(count_rows(&check, "t"), 5000);
}
