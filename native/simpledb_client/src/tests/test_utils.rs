//! Shared test utilities for integration and error handling tests
//!
//! This module provides the loopback server fixture used by the integration
//! tests and a scripted in-memory transport for driving failure paths
//! deterministically.

#![allow(clippy::unwrap_used)]

use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use crate::codec::FrameBuffer;
use crate::config::ConnectOptions;
use crate::connection::Connection;
use crate::message::{BackendMessage, ErrorFields, FieldDescription, FrontendMessage, TransactionStatus};
use crate::server::{Server, ServerConfig, ServerHandle};
use crate::transport::Transport;

/// Route client and server logs to the test output. Set `RUST_LOG` to see
/// them; only the first call installs the subscriber.
pub fn init_test_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("off"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// RAII guard that removes a database file and its SQLite side files.
///
/// Declare it before anything holding the database open so its Drop runs
/// last.
pub struct TestDbGuard {
    db_path: PathBuf,
}

impl TestDbGuard {
    pub fn new(db_path: PathBuf) -> Self {
        TestDbGuard { db_path }
    }
}

impl Drop for TestDbGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.db_path);
        for suffix in ["-wal", "-shm", "-journal"] {
            let _ = fs::remove_file(format!("{}{suffix}", self.db_path.display()));
        }
    }
}

/// A unique database path in the system temp directory.
pub fn setup_test_db_with_prefix(prefix: &str) -> PathBuf {
    let temp_dir = std::env::temp_dir();
    let db_name = format!("z_simpledb_test-{}-{}.db", prefix, Uuid::new_v4());
    temp_dir.join(db_name)
}

/// A loopback server over a fresh database, removed again on drop.
pub struct TestServer {
    handle: ServerHandle,
    _guard: TestDbGuard,
}

impl TestServer {
    pub fn start(prefix: &str) -> Self {
        Self::start_with(ServerConfig::new(setup_test_db_with_prefix(prefix)))
    }

    pub fn start_with(config: ServerConfig) -> Self {
        init_test_tracing();
        let guard = TestDbGuard::new(config.database_path.clone());
        let handle = Server::start(config).unwrap();
        TestServer {
            handle,
            _guard: guard,
        }
    }

    pub fn options(&self) -> ConnectOptions {
        ConnectOptions::new()
            .host("127.0.0.1")
            .port(self.handle.port())
            .connect_timeout(Duration::from_secs(5))
            .statement_timeout(Some(Duration::from_secs(30)))
    }

    pub fn connect(&self) -> Connection {
        Connection::connect(&self.options()).unwrap()
    }
}

/// Encode backend messages as the bytes a server would send.
pub fn backend(messages: &[BackendMessage]) -> Bytes {
    let mut buf = BytesMut::new();
    for msg in messages {
        msg.encode(&mut buf).unwrap();
    }
    buf.freeze()
}

/// The server's side of a successful startup.
pub fn handshake_ok() -> Bytes {
    backend(&[
        BackendMessage::AuthenticationOk,
        BackendMessage::ParameterStatus {
            name: "server_version".to_string(),
            value: "0.1.0".to_string(),
        },
        BackendMessage::BackendKeyData {
            process_id: 7,
            secret_key: 42,
        },
        BackendMessage::ReadyForQuery(TransactionStatus::Idle),
    ])
}

/// CommandComplete followed by ReadyForQuery.
pub fn command_ok(tag: &str, status: TransactionStatus) -> Bytes {
    backend(&[
        BackendMessage::CommandComplete(tag.to_string()),
        BackendMessage::ReadyForQuery(status),
    ])
}

pub fn error_response(code: &str, message: &str, status: TransactionStatus) -> Bytes {
    backend(&[
        BackendMessage::ErrorResponse(ErrorFields::error(code, message)),
        BackendMessage::ReadyForQuery(status),
    ])
}

pub fn int_row_description(name: &str) -> BackendMessage {
    BackendMessage::RowDescription(vec![FieldDescription::new(
        name,
        1,
        crate::constants::INT8_OID,
        8,
    )])
}

pub fn int_row(v: i64) -> BackendMessage {
    BackendMessage::DataRow(vec![Some(Bytes::from(v.to_string()))])
}

/// In-memory transport replaying scripted server replies.
///
/// Each `receive` pops one scripted reply; an empty script reads as EOF.
/// Everything sent is recorded for inspection.
pub struct ScriptedTransport {
    replies: VecDeque<io::Result<Option<Bytes>>>,
    log: TransportLog,
}

/// Shared view of what a `ScriptedTransport` saw.
#[derive(Clone, Default)]
pub struct TransportLog {
    sent: Arc<Mutex<Vec<Bytes>>>,
    timeouts: Arc<Mutex<Vec<Option<Duration>>>>,
    receives: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
}

impl TransportLog {
    /// Tagged messages sent after the startup message.
    pub fn messages(&self) -> Vec<FrontendMessage> {
        let sent = self.sent.lock().unwrap();
        let mut frames = FrameBuffer::new();
        for chunk in sent.iter().skip(1) {
            frames.extend(chunk);
        }
        let mut out = Vec::new();
        while let Some(frame) = frames.next_frame().unwrap() {
            out.push(FrontendMessage::decode(frame).unwrap());
        }
        out
    }

    /// SQL text of every simple Query sent after startup.
    pub fn queries(&self) -> Vec<String> {
        self.messages()
            .into_iter()
            .filter_map(|m| match m {
                FrontendMessage::Query { sql } => Some(sql),
                _ => None,
            })
            .collect()
    }

    pub fn send_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    /// Number of `receive` calls, scripted replies and EOF alike.
    pub fn receive_count(&self) -> usize {
        self.receives.load(Ordering::SeqCst)
    }

    pub fn read_timeouts(&self) -> Vec<Option<Duration>> {
        self.timeouts.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl ScriptedTransport {
    pub fn new() -> Self {
        ScriptedTransport {
            replies: VecDeque::new(),
            log: TransportLog::default(),
        }
    }

    /// A transport whose first reply completes the handshake.
    pub fn connected() -> Self {
        Self::new().reply(handshake_ok())
    }

    pub fn reply(mut self, bytes: Bytes) -> Self {
        self.replies.push_back(Ok(Some(bytes)));
        self
    }

    pub fn reply_messages(self, messages: &[BackendMessage]) -> Self {
        self.reply(backend(messages))
    }

    /// Script each message as its own reply, one `receive` per message.
    pub fn reply_each(self, messages: impl IntoIterator<Item = BackendMessage>) -> Self {
        messages
            .into_iter()
            .fold(self, |transport, msg| transport.reply_messages(&[msg]))
    }

    pub fn fail_with(mut self, kind: io::ErrorKind) -> Self {
        self.replies
            .push_back(Err(io::Error::new(kind, "scripted failure")));
        self
    }

    pub fn log(&self) -> TransportLog {
        self.log.clone()
    }
}

impl Transport for ScriptedTransport {
    fn send(&mut self, data: &[u8]) -> io::Result<()> {
        if self.log.closed.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"));
        }
        self.log
            .sent
            .lock()
            .unwrap()
            .push(Bytes::copy_from_slice(data));
        Ok(())
    }

    fn receive(&mut self) -> io::Result<Option<Bytes>> {
        self.log.receives.fetch_add(1, Ordering::SeqCst);
        self.replies.pop_front().unwrap_or(Ok(None))
    }

    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.log.timeouts.lock().unwrap().push(timeout);
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        self.log.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Connect over a scripted transport with default options.
pub fn scripted_connection(transport: ScriptedTransport) -> (Connection, TransportLog) {
    let log = transport.log();
    let conn = Connection::connect_with_transport(transport, &ConnectOptions::default()).unwrap();
    (conn, log)
}
