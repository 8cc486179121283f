/// Server side of one loopback session
///
/// Each session runs on its own thread with a current-thread tokio runtime
/// driving its libsql connection. Socket I/O is blocking; nothing else is
/// scheduled on the runtime, so blocking inside it is harmless.
///
/// Transaction status is tracked here rather than asked of SQLite: a failed
/// statement inside a transaction aborts it until ROLLBACK, as clients of
/// this protocol expect.
use std::io::{self, BufWriter, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::codec::{Frame, FrameBuffer};
use crate::constants::*;
use crate::decode::{
    libsql_value_to_text, oid_for_decl_type, oid_for_libsql_value, param_to_libsql_value,
};
use crate::message::{
    BackendMessage, DescribeTarget, ErrorFields, FieldDescription, FrontendMessage,
    TransactionStatus,
};
use crate::server::{ServerConfig, ServerError};
use crate::utils::{command_tag, detect_query_type, QueryType};

/// Serve one client connection until it terminates or disconnects.
pub(crate) fn run(
    stream: TcpStream,
    config: Arc<ServerConfig>,
    process_id: i32,
) -> Result<(), ServerError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let db = libsql::Builder::new_local(&config.database_path)
            .build()
            .await
            .map_err(|e| ServerError::Database(e.to_string()))?;
        let conn = db
            .connect()
            .map_err(|e| ServerError::Database(e.to_string()))?;
        conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))
            .map_err(|e| ServerError::Database(e.to_string()))?;

        let mut session = Session::new(stream, conn, config, process_id)?;
        let result = session.serve().await;
        session.finish().await;
        result
    })
}

/// Statement text and parameter types from the last Parse.
struct Prepared {
    sql: String,
    param_types: Vec<u32>,
}

/// A bound statement waiting for Execute.
struct Portal {
    sql: String,
    params: Vec<libsql::Value>,
    describe: bool,
}

/// Which descriptions accompany a statement's results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Describe {
    /// Simple protocol: RowDescription before rows, nothing otherwise.
    Simple,
    /// Described portal: RowDescription or NoData.
    Portal,
    /// Undescribed portal: rows only.
    Silent,
}

struct Session {
    reader: TcpStream,
    writer: BufWriter<TcpStream>,
    frames: FrameBuffer,
    read_buf: Box<[u8]>,
    conn: libsql::Connection,
    config: Arc<ServerConfig>,
    process_id: i32,
    in_transaction: bool,
    aborted: bool,
    prepared: Option<Prepared>,
    portal: Option<Portal>,
    /// After an error in the extended protocol, discard messages until Sync.
    skip_until_sync: bool,
}

impl Session {
    fn new(
        stream: TcpStream,
        conn: libsql::Connection,
        config: Arc<ServerConfig>,
        process_id: i32,
    ) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        let writer = BufWriter::new(stream.try_clone()?);
        Ok(Self {
            reader: stream,
            writer,
            frames: FrameBuffer::new(),
            read_buf: vec![0u8; READ_CHUNK_SIZE].into_boxed_slice(),
            conn,
            config,
            process_id,
            in_transaction: false,
            aborted: false,
            prepared: None,
            portal: None,
            skip_until_sync: false,
        })
    }

    async fn serve(&mut self) -> Result<(), ServerError> {
        if !self.startup()? {
            return Ok(());
        }

        while let Some(frame) = self.read_frame()? {
            let msg = FrontendMessage::decode(frame)?;
            let resumes = matches!(msg, FrontendMessage::Sync | FrontendMessage::Terminate);
            if self.skip_until_sync && !resumes {
                continue;
            }
            match msg {
                FrontendMessage::Query { sql } => {
                    self.simple_query(&sql).await?;
                    self.ready()?;
                }
                FrontendMessage::Parse {
                    sql, param_types, ..
                } => {
                    self.prepared = Some(Prepared { sql, param_types });
                    self.send(&BackendMessage::ParseComplete)?;
                }
                FrontendMessage::Bind { params, .. } => self.bind(params)?,
                FrontendMessage::Describe { target, .. } => self.describe(target)?,
                FrontendMessage::Execute { .. } => self.execute_portal().await?,
                FrontendMessage::Sync => {
                    self.skip_until_sync = false;
                    self.portal = None;
                    self.ready()?;
                }
                FrontendMessage::Flush => self.writer.flush()?,
                FrontendMessage::Terminate => {
                    debug!("Session {} terminated by client", self.process_id);
                    return Ok(());
                }
                other => {
                    self.send(&BackendMessage::ErrorResponse(ErrorFields::error(
                        SQLSTATE_PROTOCOL_VIOLATION,
                        format!("unexpected message {other:?}"),
                    )))?;
                    self.writer.flush()?;
                }
            }
        }
        debug!("Session {} disconnected", self.process_id);
        Ok(())
    }

    /// Roll back whatever the client left open.
    async fn finish(&mut self) {
        if self.in_transaction {
            debug!("Session {} rolling back open transaction", self.process_id);
            if let Err(e) = self.conn.execute("ROLLBACK", ()).await {
                warn!("Session {} rollback failed: {}", self.process_id, e);
            }
            self.in_transaction = false;
        }
        if let Err(e) = self.writer.flush() {
            debug!("Session {} final flush failed: {}", self.process_id, e);
        }
    }

    /// Run the startup phase. Returns false if the client gave up or was
    /// rejected.
    fn startup(&mut self) -> Result<bool, ServerError> {
        let params = loop {
            let Some(body) = self.read_untagged()? else {
                return Ok(false);
            };
            match FrontendMessage::decode_startup(body)? {
                FrontendMessage::SslRequest => {
                    self.writer.write_all(&[SSL_NOT_SUPPORTED])?;
                    self.writer.flush()?;
                }
                FrontendMessage::Startup { params, .. } => break params,
                _ => return Ok(false),
            }
        };
        let param = |key: &str| {
            params
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
        };
        let user = param("user").unwrap_or_default();
        debug!("Session {} startup for user {:?}", self.process_id, user);

        if let Some(expected) = self.config.password.clone() {
            self.send(&BackendMessage::AuthenticationCleartextPassword)?;
            self.writer.flush()?;
            let password = match self.read_frame()? {
                Some(frame) => match FrontendMessage::decode(frame)? {
                    FrontendMessage::PasswordMessage { password } => password,
                    _ => String::new(),
                },
                None => return Ok(false),
            };
            if password != expected {
                warn!("Session {} password authentication failed", self.process_id);
                self.send(&BackendMessage::ErrorResponse(ErrorFields::fatal(
                    SQLSTATE_INVALID_PASSWORD,
                    format!("password authentication failed for user \"{user}\""),
                )))?;
                self.writer.flush()?;
                return Ok(false);
            }
        }

        self.send(&BackendMessage::AuthenticationOk)?;
        let mut status = vec![
            ("client_encoding".to_string(), "UTF8".to_string()),
            (
                "server_version".to_string(),
                env!("CARGO_PKG_VERSION").to_string(),
            ),
            ("session_authorization".to_string(), user),
        ];
        if let Some(name) = param("application_name") {
            status.push(("application_name".to_string(), name));
        }
        for (name, value) in status {
            self.send(&BackendMessage::ParameterStatus { name, value })?;
        }
        self.send(&BackendMessage::BackendKeyData {
            process_id: self.process_id,
            secret_key: Uuid::new_v4().as_u128() as i32,
        })?;
        self.ready()?;
        Ok(true)
    }

    fn transaction_status(&self) -> TransactionStatus {
        if self.aborted {
            TransactionStatus::Failed
        } else if self.in_transaction {
            TransactionStatus::InTransaction
        } else {
            TransactionStatus::Idle
        }
    }

    fn ready(&mut self) -> io::Result<()> {
        self.send(&BackendMessage::ReadyForQuery(self.transaction_status()))?;
        self.writer.flush()
    }

    fn send(&mut self, msg: &BackendMessage) -> io::Result<()> {
        let mut buf = BytesMut::new();
        msg.encode(&mut buf)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.writer.write_all(&buf)
    }

    fn send_error(&mut self, fields: ErrorFields) -> io::Result<()> {
        debug!(
            "Session {} statement failed [{}]: {}",
            self.process_id, fields.code, fields.message
        );
        self.send(&BackendMessage::ErrorResponse(fields))
    }

    fn fill(&mut self) -> io::Result<bool> {
        loop {
            match self.reader.read(&mut self.read_buf) {
                Ok(0) => return Ok(false),
                Ok(n) => {
                    self.frames.extend(&self.read_buf[..n]);
                    return Ok(true);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn read_frame(&mut self) -> Result<Option<Frame>, ServerError> {
        loop {
            if let Some(frame) = self.frames.next_frame()? {
                return Ok(Some(frame));
            }
            if !self.fill()? {
                return Ok(None);
            }
        }
    }

    fn read_untagged(&mut self) -> Result<Option<bytes::Bytes>, ServerError> {
        loop {
            if let Some(body) = self.frames.next_untagged()? {
                return Ok(Some(body));
            }
            if !self.fill()? {
                return Ok(None);
            }
        }
    }

    /// Run each statement of a simple query in order. The first failure is
    /// reported and the rest are skipped.
    async fn simple_query(&mut self, sql: &str) -> io::Result<()> {
        let statements = split_statements(sql);
        if statements.is_empty() {
            return self.send(&BackendMessage::EmptyQueryResponse);
        }
        for statement in statements {
            if let Err(fields) = self
                .run_statement(statement, Vec::new(), Describe::Simple)
                .await?
            {
                return self.send_error(fields);
            }
        }
        Ok(())
    }

    fn bind(&mut self, raw_params: Vec<Option<bytes::Bytes>>) -> io::Result<()> {
        let Some(prepared) = self.prepared.as_ref() else {
            return self.extended_error(ErrorFields::error(
                SQLSTATE_PROTOCOL_VIOLATION,
                "unnamed prepared statement does not exist",
            ));
        };
        let converted: Result<Vec<_>, String> = raw_params
            .iter()
            .enumerate()
            .map(|(i, raw)| {
                let oid = prepared.param_types.get(i).copied().unwrap_or(0);
                param_to_libsql_value(raw.as_deref(), oid)
            })
            .collect();
        match converted {
            Ok(params) => {
                self.portal = Some(Portal {
                    sql: prepared.sql.clone(),
                    params,
                    describe: false,
                });
                self.send(&BackendMessage::BindComplete)
            }
            Err(message) => self.extended_error(ErrorFields::error(
                SQLSTATE_INVALID_TEXT_REPRESENTATION,
                message,
            )),
        }
    }

    fn describe(&mut self, target: DescribeTarget) -> io::Result<()> {
        if target == DescribeTarget::Statement {
            return self.extended_error(ErrorFields::error(
                SQLSTATE_FEATURE_NOT_SUPPORTED,
                "describing a prepared statement is not supported",
            ));
        }
        match self.portal.as_mut() {
            // the description is sent with the rows at Execute time
            Some(portal) => {
                portal.describe = true;
                Ok(())
            }
            None => self.extended_error(ErrorFields::error(
                SQLSTATE_PROTOCOL_VIOLATION,
                "unnamed portal does not exist",
            )),
        }
    }

    async fn execute_portal(&mut self) -> io::Result<()> {
        let Some(portal) = self.portal.take() else {
            return self.extended_error(ErrorFields::error(
                SQLSTATE_PROTOCOL_VIOLATION,
                "unnamed portal does not exist",
            ));
        };
        if is_empty_query(&portal.sql) {
            return self.send(&BackendMessage::EmptyQueryResponse);
        }
        if split_statements(&portal.sql).len() > 1 {
            return self.extended_error(ErrorFields::error(
                SQLSTATE_SYNTAX_ERROR,
                "cannot insert multiple commands into a prepared statement",
            ));
        }
        let sql = numbered_placeholders(&portal.sql);
        let describe = if portal.describe {
            Describe::Portal
        } else {
            Describe::Silent
        };
        if let Err(fields) = self
            .run_statement(&sql, portal.params, describe)
            .await?
        {
            self.extended_error(fields)?;
        }
        Ok(())
    }

    fn extended_error(&mut self, fields: ErrorFields) -> io::Result<()> {
        self.skip_until_sync = true;
        if self.in_transaction {
            self.aborted = true;
        }
        self.send_error(fields)
    }

    /// Execute one statement, streaming its rows.
    ///
    /// The outer result is a socket failure; the inner one a statement error
    /// to report to the client.
    async fn run_statement(
        &mut self,
        sql: &str,
        params: Vec<libsql::Value>,
        describe: Describe,
    ) -> io::Result<Result<(), ErrorFields>> {
        let query_type = detect_query_type(sql);

        if self.aborted {
            if !matches!(query_type, QueryType::Commit | QueryType::Rollback) {
                return Ok(Err(ErrorFields::error(
                    SQLSTATE_IN_FAILED_TRANSACTION,
                    "current transaction is aborted, commands ignored until end of transaction block",
                )));
            }
            // COMMIT of an aborted transaction rolls it back
            if let Err(fields) = self.end_transaction("ROLLBACK").await {
                debug!(
                    "Session {} rollback of aborted transaction failed: {}",
                    self.process_id, fields.message
                );
            }
            self.send(&BackendMessage::CommandComplete("ROLLBACK".to_string()))?;
            return Ok(Ok(()));
        }

        match query_type {
            QueryType::Begin => {
                if self.in_transaction {
                    self.notice(
                        SQLSTATE_ACTIVE_TRANSACTION,
                        "there is already a transaction in progress",
                    )?;
                } else {
                    if let Err(e) = self.conn.execute(sqlite_begin(sql), ()).await {
                        return Ok(Err(map_error(&e)));
                    }
                    self.in_transaction = true;
                }
                self.send(&BackendMessage::CommandComplete("BEGIN".to_string()))?;
                return Ok(Ok(()));
            }
            QueryType::Commit | QueryType::Rollback => {
                let (statement, tag) = if query_type == QueryType::Commit {
                    ("COMMIT", "COMMIT")
                } else {
                    ("ROLLBACK", "ROLLBACK")
                };
                if !self.in_transaction {
                    self.notice(
                        SQLSTATE_NO_ACTIVE_TRANSACTION,
                        "there is no transaction in progress",
                    )?;
                } else if let Err(fields) = self.end_transaction(statement).await {
                    return Ok(Err(fields));
                }
                self.send(&BackendMessage::CommandComplete(tag.to_string()))?;
                return Ok(Ok(()));
            }
            _ => {}
        }

        let outcome = self.stream_statement(sql, params, describe).await?;
        if outcome.is_err() && self.in_transaction {
            self.aborted = true;
        }
        Ok(outcome)
    }

    /// End the open transaction with COMMIT or ROLLBACK.
    ///
    /// A failed COMMIT is followed by a ROLLBACK, so the session is never
    /// left inside a transaction it reported as ended.
    async fn end_transaction(&mut self, statement: &str) -> Result<(), ErrorFields> {
        let result = self.conn.execute(statement, ()).await;
        self.in_transaction = false;
        self.aborted = false;
        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                if !self.conn.is_autocommit() {
                    if let Err(e) = self.conn.execute("ROLLBACK", ()).await {
                        warn!(
                            "Session {} rollback after failed {} failed: {}",
                            self.process_id, statement, e
                        );
                    }
                }
                Err(map_error(&e))
            }
        }
    }

    fn notice(&mut self, code: &str, message: &str) -> io::Result<()> {
        self.send(&BackendMessage::NoticeResponse(ErrorFields {
            severity: "WARNING".to_string(),
            ..ErrorFields::error(code, message)
        }))
    }

    async fn stream_statement(
        &mut self,
        sql: &str,
        params: Vec<libsql::Value>,
        describe: Describe,
    ) -> io::Result<Result<(), ErrorFields>> {
        let mut stmt = match self.conn.prepare(sql).await {
            Ok(stmt) => stmt,
            Err(e) => return Ok(Err(map_error(&e))),
        };
        let columns: Vec<(String, Option<u32>)> = stmt
            .columns()
            .iter()
            .map(|c| (c.name().to_string(), c.decl_type().and_then(oid_for_decl_type)))
            .collect();

        if columns.is_empty() {
            let affected = match stmt.execute(params).await {
                Ok(n) => n as u64,
                Err(e) => return Ok(Err(map_error(&e))),
            };
            if describe == Describe::Portal {
                self.send(&BackendMessage::NoData)?;
            }
            self.send(&BackendMessage::CommandComplete(command_tag(sql, affected)))?;
            return Ok(Ok(()));
        }

        let mut rows = match stmt.query(params).await {
            Ok(rows) => rows,
            Err(e) => return Ok(Err(map_error(&e))),
        };
        // the first row settles the type of undeclared columns
        let first = match rows.next().await {
            Ok(row) => row,
            Err(e) => return Ok(Err(map_error(&e))),
        };
        let first_values = match first.as_ref().map(|row| row_values(row, columns.len())) {
            Some(Ok(values)) => Some(values),
            Some(Err(e)) => return Ok(Err(map_error(&e))),
            None => None,
        };
        let oids: Vec<u32> = columns
            .iter()
            .enumerate()
            .map(|(i, (_, declared))| {
                declared.unwrap_or_else(|| {
                    first_values
                        .as_ref()
                        .and_then(|values| values.get(i))
                        .map_or(TEXT_OID, oid_for_libsql_value)
                })
            })
            .collect();

        if describe != Describe::Silent {
            let fields = columns
                .iter()
                .zip(&oids)
                .enumerate()
                .map(|(i, ((name, _), oid))| {
                    FieldDescription::new(name.clone(), (i + 1) as i16, *oid, type_size(*oid))
                })
                .collect();
            self.send(&BackendMessage::RowDescription(fields))?;
        }

        let mut count = 0u64;
        if let Some(values) = first_values {
            self.send_row(&values, &oids)?;
            count += 1;
        }
        loop {
            match rows.next().await {
                Ok(Some(row)) => match row_values(&row, columns.len()) {
                    Ok(values) => {
                        self.send_row(&values, &oids)?;
                        count += 1;
                    }
                    Err(e) => return Ok(Err(map_error(&e))),
                },
                Ok(None) => break,
                Err(e) => return Ok(Err(map_error(&e))),
            }
        }
        self.send(&BackendMessage::CommandComplete(command_tag(sql, count)))?;
        Ok(Ok(()))
    }

    fn send_row(&mut self, values: &[libsql::Value], oids: &[u32]) -> io::Result<()> {
        let row = values
            .iter()
            .zip(oids)
            .map(|(value, oid)| libsql_value_to_text(value, *oid))
            .collect();
        self.send(&BackendMessage::DataRow(row))
    }
}

fn row_values(row: &libsql::Row, count: usize) -> Result<Vec<libsql::Value>, libsql::Error> {
    (0..count).map(|i| row.get_value(i as i32)).collect()
}

/// Rewrite `$n` parameter markers to SQLite's `?n`, leaving quoted text alone.
fn numbered_placeholders(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut quote: Option<char> = None;
    let mut chars = sql.chars().peekable();
    while let Some(c) = chars.next() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == '\'' || c == '"' => quote = Some(c),
            None if c == '$' && chars.peek().is_some_and(char::is_ascii_digit) => {
                out.push('?');
                continue;
            }
            None => {}
        }
        out.push(c);
    }
    out
}

/// Split query text at semicolons outside quotes and `--` comments,
/// dropping statements that are empty or only comments.
fn split_statements(sql: &str) -> Vec<&str> {
    let bytes = sql.as_bytes();
    let mut statements = Vec::new();
    let mut start = 0;
    let mut quote: Option<u8> = None;
    let mut in_comment = false;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if in_comment {
            in_comment = b != b'\n';
        } else if let Some(q) = quote {
            if b == q {
                quote = None;
            }
        } else if b == b'\'' || b == b'"' {
            quote = Some(b);
        } else if b == b'-' && bytes.get(i + 1) == Some(&b'-') {
            in_comment = true;
            i += 1;
        } else if b == b';' {
            statements.push(&sql[start..i]);
            start = i + 1;
        }
        i += 1;
    }
    statements.push(&sql[start..]);
    statements.retain(|s| has_statement_text(s));
    statements
}

/// False for text holding nothing but whitespace, semicolons and comments.
fn has_statement_text(sql: &str) -> bool {
    sql.lines().any(|line| {
        let code = line.split("--").next().unwrap_or_default();
        !is_empty_query(code)
    })
}

/// SQLite spelling of a BEGIN or START TRANSACTION statement.
///
/// SQLite's own DEFERRED/IMMEDIATE/EXCLUSIVE forms pass through. SQLite
/// transactions are always serializable, so isolation clauses are dropped;
/// SERIALIZABLE takes the write lock up front.
fn sqlite_begin(sql: &str) -> &str {
    let upper = sql.to_ascii_uppercase();
    let mut words = upper
        .split(|c: char| c.is_whitespace() || c == ';')
        .filter(|w| !w.is_empty())
        .skip(1)
        .filter(|w| !matches!(*w, "TRANSACTION" | "WORK"));
    match words.next() {
        Some("DEFERRED" | "IMMEDIATE" | "EXCLUSIVE") => sql,
        _ if upper.contains("SERIALIZABLE") => "BEGIN IMMEDIATE",
        _ => "BEGIN",
    }
}

fn is_empty_query(sql: &str) -> bool {
    sql.trim_matches(|c: char| c.is_whitespace() || c == ';').is_empty()
}

fn type_size(oid: u32) -> i16 {
    match oid {
        BOOL_OID => 1,
        INT2_OID => 2,
        INT4_OID | FLOAT4_OID => 4,
        INT8_OID | FLOAT8_OID => 8,
        _ => -1,
    }
}

/// Map a libsql error to a SQLSTATE by its message.
fn map_error(err: &libsql::Error) -> ErrorFields {
    let message = err.to_string();
    let lower = message.to_ascii_lowercase();
    let code = if lower.contains("syntax error") || lower.contains("incomplete input") {
        SQLSTATE_SYNTAX_ERROR
    } else if lower.contains("no such table") {
        SQLSTATE_UNDEFINED_TABLE
    } else if lower.contains("no such column") {
        SQLSTATE_UNDEFINED_COLUMN
    } else if lower.contains("already exists") {
        SQLSTATE_DUPLICATE_TABLE
    } else if lower.contains("unique constraint failed") {
        SQLSTATE_UNIQUE_VIOLATION
    } else if lower.contains("not null constraint failed") {
        SQLSTATE_NOT_NULL_VIOLATION
    } else {
        SQLSTATE_INTERNAL_ERROR
    };
    ErrorFields::error(code, message)
}
