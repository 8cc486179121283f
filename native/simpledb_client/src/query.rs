/// Statement execution over an established session
///
/// `ConnectionInner` is the protocol state machine behind a `Connection`:
/// it frames requests, reads responses under the statement deadline, keeps
/// the transaction state in step with the server, and hands out result rows
/// one at a time.
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::codec::FrameBuffer;
use crate::config::ConnectOptions;
use crate::constants::SQLSTATE_CONNECTION_FAILURE;
use crate::decode::{column, decode_text_value, encode_param, param_type_oid};
use crate::error::{Error, Result};
use crate::message::{
    BackendMessage, DescribeTarget, ErrorFields, FieldDescription, FrontendMessage,
    TransactionStatus,
};
use crate::models::{BackendKey, Column, Row, StatementHandle, TransactionState, Value};
use crate::transport::Transport;
use crate::utils::{detect_query_type, QueryType};

/// Where the session is in the request/response cycle.
#[derive(Debug)]
pub(crate) enum Status {
    /// Ready for the next request.
    Ready,
    /// Rows of a result are still pending on the transport.
    Streaming {
        result_id: u64,
        columns: Arc<[Column]>,
    },
    /// The transport failed; nothing more can be sent.
    Broken,
    Closed,
}

/// Outcome of one pull from a result stream.
#[derive(Debug)]
pub(crate) enum Pull {
    Row(Row),
    /// End of results, with the server's command tag when it was received.
    Done { command_tag: Option<String> },
}

pub(crate) struct ConnectionInner {
    transport: Box<dyn Transport>,
    frames: FrameBuffer,
    pub(crate) session_id: Uuid,
    pub(crate) tx_state: TransactionState,
    pub(crate) autocommit: bool,
    pub(crate) status: Status,
    pub(crate) statement_timeout: Option<Duration>,
    pub(crate) server_params: HashMap<String, String>,
    pub(crate) backend_key: Option<BackendKey>,
    next_result_id: u64,
    deadline: Option<(Instant, Duration)>,
}

impl ConnectionInner {
    pub(crate) fn new(
        transport: Box<dyn Transport>,
        options: &ConnectOptions,
        session_id: Uuid,
    ) -> Self {
        Self {
            transport,
            frames: FrameBuffer::new(),
            session_id,
            tx_state: TransactionState::Idle,
            autocommit: options.autocommit,
            status: Status::Ready,
            statement_timeout: options.statement_timeout,
            server_params: HashMap::new(),
            backend_key: None,
            next_result_id: 1,
            deadline: None,
        }
    }

    pub(crate) fn is_usable(&self) -> bool {
        !matches!(self.status, Status::Broken | Status::Closed)
    }

    pub(crate) fn ensure_usable(&self) -> Result<()> {
        if self.is_usable() {
            Ok(())
        } else {
            Err(Error::ConnectionClosed)
        }
    }

    /// Bound every read until `clear_deadline` by `timeout` from now.
    pub(crate) fn set_deadline(&mut self, timeout: Option<Duration>) {
        self.deadline = timeout.map(|t| (Instant::now() + t, t));
    }

    pub(crate) fn clear_deadline(&mut self) {
        self.deadline = None;
    }

    fn mark_broken(&mut self) {
        if self.is_usable() {
            warn!(session = %self.session_id, "connection is broken, discarding session");
            self.status = Status::Broken;
            self.frames.clear();
            if self.tx_state == TransactionState::Open {
                self.tx_state = TransactionState::Failed;
            }
        }
    }

    pub(crate) fn send(&mut self, messages: &[FrontendMessage]) -> Result<()> {
        let mut buf = BytesMut::new();
        for msg in messages {
            msg.encode(&mut buf)?;
        }
        if let Err(e) = self.transport.send(&buf) {
            self.mark_broken();
            return Err(Error::Io(e));
        }
        Ok(())
    }

    /// Read the next message that needs the caller's attention.
    ///
    /// ParameterStatus and NoticeResponse are absorbed here. Any transport or
    /// framing failure marks the connection broken.
    pub(crate) fn recv(&mut self) -> Result<BackendMessage> {
        loop {
            let frame = match self.frames.next_frame() {
                Ok(frame) => frame,
                Err(e) => {
                    self.mark_broken();
                    return Err(e.into());
                }
            };
            let Some(frame) = frame else {
                self.fill()?;
                continue;
            };
            let msg = match BackendMessage::decode(frame) {
                Ok(msg) => msg,
                Err(e) => {
                    self.mark_broken();
                    return Err(e.into());
                }
            };
            match msg {
                BackendMessage::ParameterStatus { name, value } => {
                    self.server_params.insert(name, value);
                }
                BackendMessage::NoticeResponse(notice) => {
                    debug!(
                        session = %self.session_id,
                        code = %notice.code,
                        "server notice: {}",
                        notice.message
                    );
                }
                msg => return Ok(msg),
            }
        }
    }

    fn fill(&mut self) -> Result<()> {
        let timeout = match self.deadline {
            Some((deadline, configured)) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    self.mark_broken();
                    return Err(Error::Timeout(configured));
                }
                Some(remaining)
            }
            None => None,
        };
        if let Err(e) = self.transport.set_read_timeout(timeout) {
            self.mark_broken();
            return Err(Error::Io(e));
        }
        match self.transport.receive() {
            Ok(Some(chunk)) => {
                self.frames.extend(&chunk);
                Ok(())
            }
            Ok(None) => {
                self.mark_broken();
                Err(Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "server closed the connection",
                )))
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                self.mark_broken();
                let configured = self.deadline.map_or(Duration::ZERO, |(_, t)| t);
                Err(Error::Timeout(configured))
            }
            Err(e) => {
                self.mark_broken();
                Err(Error::Io(e))
            }
        }
    }

    fn unexpected(&mut self, msg: &BackendMessage, context: &str) -> Error {
        self.mark_broken();
        Error::Protocol(format!("unexpected {msg:?} {context}"))
    }

    fn apply_ready(&mut self, status: TransactionStatus) {
        self.status = Status::Ready;
        self.tx_state = match status {
            TransactionStatus::Idle => TransactionState::Idle,
            TransactionStatus::InTransaction => TransactionState::Open,
            TransactionStatus::Failed => TransactionState::Failed,
        };
    }

    /// Record a server-reported statement failure.
    fn statement_failed(&mut self, fields: ErrorFields) -> Error {
        self.fail_transaction();
        Error::query(fields.code, fields.message)
    }

    /// In autocommit mode outside a transaction the server has already
    /// discarded the failed statement, so only the explicit case fails.
    fn fail_transaction(&mut self) {
        if !self.autocommit || self.tx_state != TransactionState::Idle {
            self.tx_state = TransactionState::Failed;
        }
    }

    /// Drain an abandoned result stream up to ReadyForQuery without keeping rows.
    fn settle(&mut self) -> Result<()> {
        let Status::Streaming { result_id, .. } = self.status else {
            return Ok(());
        };
        debug!(session = %self.session_id, result_id, "discarding unconsumed rows");
        let mut error = None;
        loop {
            match self.recv()? {
                BackendMessage::RowDescription(_)
                | BackendMessage::DataRow(_)
                | BackendMessage::CommandComplete(_)
                | BackendMessage::EmptyQueryResponse => {}
                BackendMessage::ErrorResponse(fields) => error = Some(fields),
                BackendMessage::ReadyForQuery(status) => {
                    self.apply_ready(status);
                    break;
                }
                other => return Err(self.unexpected(&other, "while draining a result")),
            }
        }
        if let Some(fields) = error {
            debug!(
                session = %self.session_id,
                code = %fields.code,
                "abandoned statement failed: {}",
                fields.message
            );
            self.fail_transaction();
        }
        Ok(())
    }

    /// Run a statement whose rows, if any, are discarded. Returns the tag.
    pub(crate) fn simple_command(&mut self, sql: &str) -> Result<Option<String>> {
        self.send(&[FrontendMessage::Query {
            sql: sql.to_string(),
        }])?;
        let mut tag = None;
        let mut error = None;
        loop {
            match self.recv()? {
                BackendMessage::CommandComplete(t) => tag = Some(t),
                BackendMessage::ErrorResponse(fields) => error = Some(fields),
                BackendMessage::ReadyForQuery(status) => {
                    self.apply_ready(status);
                    break;
                }
                BackendMessage::RowDescription(_)
                | BackendMessage::DataRow(_)
                | BackendMessage::EmptyQueryResponse => {}
                other => return Err(self.unexpected(&other, "in command response")),
            }
        }
        match error {
            Some(fields) => Err(Error::query(fields.code, fields.message)),
            None => Ok(tag),
        }
    }

    /// Submit one statement.
    ///
    /// Opens a transaction first when autocommit is off and none is open. A
    /// row-returning statement leaves its rows pending on the transport.
    pub(crate) fn execute(&mut self, sql: &str, params: &[Value]) -> Result<StatementHandle> {
        self.ensure_usable()?;
        let query_type = detect_query_type(sql);
        if self.tx_state == TransactionState::Failed && !query_type.ends_transaction() {
            return Err(Error::TransactionAborted);
        }

        self.set_deadline(self.statement_timeout);
        let result = self.execute_inner(sql, params, query_type);
        self.clear_deadline();
        result
    }

    fn execute_inner(
        &mut self,
        sql: &str,
        params: &[Value],
        query_type: QueryType,
    ) -> Result<StatementHandle> {
        self.settle()?;
        if self.tx_state == TransactionState::Failed && !query_type.ends_transaction() {
            return Err(Error::TransactionAborted);
        }

        if !self.autocommit
            && self.tx_state == TransactionState::Idle
            && !query_type.is_transaction_control()
        {
            debug!(session = %self.session_id, "opening implicit transaction");
            self.simple_command("BEGIN")?;
        }

        if params.is_empty() {
            self.send(&[FrontendMessage::Query {
                sql: sql.to_string(),
            }])?;
        } else {
            self.send(&[
                FrontendMessage::Parse {
                    name: String::new(),
                    sql: sql.to_string(),
                    param_types: params.iter().map(param_type_oid).collect(),
                },
                FrontendMessage::Bind {
                    portal: String::new(),
                    statement: String::new(),
                    params: params.iter().map(encode_param).collect(),
                },
                FrontendMessage::Describe {
                    target: DescribeTarget::Portal,
                    name: String::new(),
                },
                FrontendMessage::Execute {
                    portal: String::new(),
                    max_rows: 0,
                },
                FrontendMessage::Sync,
            ])?;
        }

        self.read_statement_response()
    }

    fn read_statement_response(&mut self) -> Result<StatementHandle> {
        let mut command_tag = None;
        let mut error = None;
        loop {
            match self.recv()? {
                BackendMessage::ParseComplete
                | BackendMessage::BindComplete
                | BackendMessage::NoData
                | BackendMessage::EmptyQueryResponse => {}
                BackendMessage::RowDescription(fields) if error.is_none() => {
                    let columns = describe(&fields);
                    let result_id = self.next_result_id;
                    self.next_result_id += 1;
                    self.status = Status::Streaming {
                        result_id,
                        columns: Arc::clone(&columns),
                    };
                    return Ok(StatementHandle {
                        description: Some(columns),
                        result_id: Some(result_id),
                        command_tag: None,
                    });
                }
                BackendMessage::CommandComplete(tag) => command_tag = Some(tag),
                BackendMessage::ErrorResponse(fields) => error = Some(fields),
                BackendMessage::ReadyForQuery(status) => {
                    self.apply_ready(status);
                    break;
                }
                other => return Err(self.unexpected(&other, "in statement response")),
            }
        }

        if let Some(fields) = error {
            return Err(self.statement_failed(fields));
        }
        Ok(StatementHandle {
            description: None,
            result_id: None,
            command_tag,
        })
    }

    /// Pull the next row of result `result_id`.
    ///
    /// A stream that was drained by a later statement reports end of results.
    /// Only the first result set of a multi-statement query is returned; the
    /// rows of later ones are read and dropped on the way to ReadyForQuery,
    /// though their errors still fail the statement.
    pub(crate) fn next_row(&mut self, result_id: u64) -> Result<Pull> {
        let columns = match &self.status {
            Status::Streaming {
                result_id: current,
                columns,
            } if *current == result_id => Arc::clone(columns),
            Status::Broken | Status::Closed => return Err(Error::ConnectionClosed),
            _ => return Ok(Pull::Done { command_tag: None }),
        };

        self.set_deadline(self.statement_timeout);
        let result = self.pull(&columns);
        self.clear_deadline();
        result
    }

    fn pull(&mut self, columns: &Arc<[Column]>) -> Result<Pull> {
        let mut command_tag = None;
        let mut error = None;
        loop {
            let msg = match self.recv() {
                Ok(msg) => msg,
                Err(e) => return Err(self.stream_failure(e)),
            };
            match msg {
                BackendMessage::DataRow(values) if command_tag.is_none() && error.is_none() => {
                    if values.len() != columns.len() {
                        let e = Error::Protocol(format!(
                            "row has {} values for {} columns",
                            values.len(),
                            columns.len()
                        ));
                        self.mark_broken();
                        return Err(self.stream_failure(e));
                    }
                    let values = columns
                        .iter()
                        .zip(values.iter())
                        .map(|(col, raw)| decode_text_value(col.column_type, raw.as_deref()))
                        .collect();
                    return Ok(Pull::Row(Row::new(Arc::clone(columns), values)));
                }
                // result sets after the first one of a multi-statement query
                BackendMessage::RowDescription(_)
                | BackendMessage::DataRow(_)
                | BackendMessage::EmptyQueryResponse
                    if command_tag.is_some() || error.is_some() => {}
                BackendMessage::CommandComplete(tag) => {
                    command_tag.get_or_insert(tag);
                }
                BackendMessage::ErrorResponse(fields) => error = Some(fields),
                BackendMessage::ReadyForQuery(status) => {
                    self.apply_ready(status);
                    if let Some(fields) = error {
                        return Err(self.statement_failed(fields));
                    }
                    return Ok(Pull::Done { command_tag });
                }
                other => {
                    let e = self.unexpected(&other, "in result stream");
                    return Err(self.stream_failure(e));
                }
            }
        }
    }

    /// A transport failure while rows are pending fails the statement and the
    /// transaction. Deadline expiry stays a timeout.
    fn stream_failure(&mut self, err: Error) -> Error {
        self.mark_broken();
        self.tx_state = TransactionState::Failed;
        match err {
            Error::Timeout(_) => err,
            other => Error::query(SQLSTATE_CONNECTION_FAILURE, other.to_string()),
        }
    }

    /// Open a transaction explicitly with the given BEGIN statement.
    pub(crate) fn begin(&mut self, sql: &str) -> Result<()> {
        self.ensure_usable()?;
        self.set_deadline(self.statement_timeout);
        let result = self.settle().and_then(|()| {
            if self.tx_state != TransactionState::Idle {
                return Err(Error::CursorState(
                    "a transaction is already open".to_string(),
                ));
            }
            self.simple_command(sql).map(|_| ())
        });
        self.clear_deadline();
        result
    }

    pub(crate) fn commit(&mut self) -> Result<()> {
        self.ensure_usable()?;
        if self.tx_state == TransactionState::Idle && !self.is_streaming() {
            return Ok(());
        }
        self.set_deadline(self.statement_timeout);
        let result = self.commit_inner();
        self.clear_deadline();
        result
    }

    fn commit_inner(&mut self) -> Result<()> {
        self.settle()?;
        match self.tx_state {
            TransactionState::Idle => Ok(()),
            TransactionState::Failed => {
                debug!(session = %self.session_id, "commit of failed transaction, rolling back");
                let result = self.simple_command("ROLLBACK");
                self.tx_state = TransactionState::Idle;
                result?;
                Err(Error::TransactionAborted)
            }
            TransactionState::Open => match self.simple_command("COMMIT") {
                Ok(_) => {
                    debug!(session = %self.session_id, "transaction committed");
                    Ok(())
                }
                Err(e) => {
                    self.tx_state = TransactionState::Failed;
                    Err(e)
                }
            },
        }
    }

    pub(crate) fn rollback(&mut self) -> Result<()> {
        if !self.is_usable() {
            self.tx_state = TransactionState::Idle;
            return Err(Error::ConnectionClosed);
        }
        if self.tx_state == TransactionState::Idle && !self.is_streaming() {
            return Ok(());
        }
        self.set_deadline(self.statement_timeout);
        let result = self.rollback_inner();
        self.clear_deadline();
        self.tx_state = TransactionState::Idle;
        result
    }

    fn rollback_inner(&mut self) -> Result<()> {
        self.settle()?;
        if self.tx_state != TransactionState::Idle {
            self.simple_command("ROLLBACK")?;
            debug!(session = %self.session_id, "transaction rolled back");
        }
        Ok(())
    }

    pub(crate) fn ping(&mut self) -> Result<()> {
        self.ensure_usable()?;
        self.set_deadline(self.statement_timeout);
        let result = self.settle().and_then(|()| self.simple_command("").map(|_| ()));
        self.clear_deadline();
        result
    }

    fn is_streaming(&self) -> bool {
        matches!(self.status, Status::Streaming { .. })
    }

    /// Tear the session down. Never fails.
    ///
    /// An open transaction is rolled back first. With rows still pending the
    /// ROLLBACK is skipped: the server aborts the transaction when the session
    /// ends, and draining the stream could take arbitrarily long.
    pub(crate) fn close(&mut self) {
        if matches!(self.status, Status::Closed) {
            return;
        }
        if matches!(self.status, Status::Ready) && self.tx_state != TransactionState::Idle {
            self.set_deadline(self.statement_timeout);
            if let Err(e) = self.simple_command("ROLLBACK") {
                warn!(session = %self.session_id, "rollback on close failed: {}", e);
            }
            self.clear_deadline();
        }
        if self.is_usable() {
            if let Err(e) = self.send(&[FrontendMessage::Terminate]) {
                debug!(session = %self.session_id, "terminate not delivered: {}", e);
            }
        }
        if let Err(e) = self.transport.close() {
            debug!(session = %self.session_id, "transport close failed: {}", e);
        }
        self.status = Status::Closed;
        self.tx_state = TransactionState::Idle;
        self.frames.clear();
    }
}

fn describe(fields: &[FieldDescription]) -> Arc<[Column]> {
    fields
        .iter()
        .map(|f| column(f.name.clone(), f.type_oid))
        .collect::<Vec<_>>()
        .into()
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        self.close();
    }
}
