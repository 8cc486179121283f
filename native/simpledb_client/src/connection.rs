/// Connection lifecycle management for SimpleDB servers
///
/// This module handles connection establishment (transport plus startup
/// handshake), statement submission, transaction control, health checking,
/// and teardown with implicit rollback.
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, info};
use uuid::Uuid;

use crate::config::ConnectOptions;
use crate::constants::PROTOCOL_VERSION_3;
use crate::cursor::Cursor;
use crate::error::{Error, Result};
use crate::message::{BackendMessage, FrontendMessage};
use crate::models::{BackendKey, StatementHandle, TransactionState, Value};
use crate::query::{ConnectionInner, Status};
use crate::transport::{TcpTransport, Transport};
use crate::utils::safe_lock;

/// A session with a SimpleDB server.
///
/// Each `Connection` exclusively owns its transport. Cursors borrow the
/// connection, so none can outlive it. Dropping the connection closes it,
/// rolling back any open transaction.
pub struct Connection {
    inner: Mutex<ConnectionInner>,
    session_id: Uuid,
    options: ConnectOptions,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("session_id", &self.session_id)
            .field("host", &self.options.host)
            .field("port", &self.options.port)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection {
    /// Connect over TCP and perform the startup handshake.
    ///
    /// Any failure before the server reports ReadyForQuery is returned as
    /// `Error::Connection`; no partial connection is handed out.
    pub fn connect(options: &ConnectOptions) -> Result<Self> {
        let transport = TcpTransport::connect(&options.host, options.port, options.connect_timeout)
            .map_err(|e| {
                Error::Connection(format!(
                    "could not reach {}:{}: {e}",
                    options.host, options.port
                ))
            })?;
        Self::connect_with_transport(transport, options)
    }

    /// Perform the startup handshake over a caller-supplied transport.
    pub fn connect_with_transport<T>(transport: T, options: &ConnectOptions) -> Result<Self>
    where
        T: Transport + 'static,
    {
        let session_id = Uuid::new_v4();
        let mut inner = ConnectionInner::new(Box::new(transport), options, session_id);

        inner.set_deadline(Some(options.connect_timeout));
        let handshake = startup(&mut inner, options);
        inner.clear_deadline();
        handshake.map_err(|e| match e {
            Error::Connection(_) => e,
            other => Error::Connection(format!("handshake failed: {other}")),
        })?;

        info!(
            session = %session_id,
            host = %options.host,
            port = options.port,
            user = %options.user,
            "connection established"
        );

        Ok(Self {
            inner: Mutex::new(inner),
            session_id,
            options: options.clone(),
        })
    }

    pub(crate) fn lock(&self, context: &str) -> Result<MutexGuard<'_, ConnectionInner>> {
        safe_lock(&self.inner, context)
    }

    /// Open a cursor on this connection.
    pub fn cursor(&self) -> Result<Cursor<'_>> {
        self.lock("cursor")?.ensure_usable()?;
        Ok(Cursor::new(self))
    }

    /// Submit a statement directly. Rows of a row-returning statement are
    /// discarded when the next request is made; use a cursor to read them.
    pub fn execute(&self, sql: &str, params: &[Value]) -> Result<StatementHandle> {
        self.lock("execute")?.execute(sql, params)
    }

    /// Commit the open transaction. A no-op when none is open.
    ///
    /// Committing a failed transaction rolls it back and returns
    /// `Error::TransactionAborted`.
    pub fn commit(&self) -> Result<()> {
        self.lock("commit")?.commit()
    }

    /// Roll back the open or failed transaction. The transaction state is
    /// `Idle` afterwards even if the rollback could not be delivered.
    pub fn rollback(&self) -> Result<()> {
        self.lock("rollback")?.rollback()
    }

    /// Round-trip an empty query to check the session is alive.
    pub fn ping(&self) -> Result<()> {
        self.lock("ping")?.ping()
    }

    /// Close the connection. Idempotent and infallible.
    pub fn close(&self) {
        match self.inner.lock() {
            Ok(mut inner) => {
                let was_open = !matches!(inner.status, Status::Closed);
                inner.close();
                if was_open {
                    info!(session = %self.session_id, "connection closed");
                }
            }
            Err(poisoned) => {
                debug!(session = %self.session_id, "closing connection with poisoned lock");
                poisoned.into_inner().close();
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner
            .lock()
            .map_or(true, |inner| matches!(inner.status, Status::Closed))
    }

    /// True when the transport failed and the connection must be discarded.
    pub fn is_broken(&self) -> bool {
        self.inner
            .lock()
            .map_or(true, |inner| matches!(inner.status, Status::Broken))
    }

    pub fn transaction_state(&self) -> Result<TransactionState> {
        Ok(self.lock("transaction_state")?.tx_state)
    }

    pub fn autocommit(&self) -> Result<bool> {
        Ok(self.lock("autocommit")?.autocommit)
    }

    /// Switch autocommit mode. Not allowed while a transaction is open.
    pub fn set_autocommit(&self, autocommit: bool) -> Result<()> {
        let mut inner = self.lock("set_autocommit")?;
        inner.ensure_usable()?;
        if inner.tx_state != TransactionState::Idle {
            return Err(Error::CursorState(
                "cannot change autocommit while a transaction is open".to_string(),
            ));
        }
        inner.autocommit = autocommit;
        Ok(())
    }

    pub fn statement_timeout(&self) -> Result<Option<Duration>> {
        Ok(self.lock("statement_timeout")?.statement_timeout)
    }

    /// Bound every subsequent execute and fetch. `None` waits forever.
    pub fn set_statement_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.lock("set_statement_timeout")?.statement_timeout = timeout;
        Ok(())
    }

    /// A parameter reported by the server through ParameterStatus.
    pub fn server_parameter(&self, name: &str) -> Result<Option<String>> {
        Ok(self.lock("server_parameter")?.server_params.get(name).cloned())
    }

    pub fn backend_key(&self) -> Result<Option<BackendKey>> {
        Ok(self.lock("backend_key")?.backend_key)
    }

    /// Identifier used to correlate this connection's log lines.
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn options(&self) -> &ConnectOptions {
        &self.options
    }
}

/// Send the startup message and read until the server is ready.
fn startup(inner: &mut ConnectionInner, options: &ConnectOptions) -> Result<()> {
    inner.send(&[FrontendMessage::Startup {
        version: PROTOCOL_VERSION_3,
        params: options.startup_params(),
    }])?;

    loop {
        match inner.recv()? {
            BackendMessage::AuthenticationOk => {}
            BackendMessage::AuthenticationCleartextPassword => {
                let password = options.password.clone().ok_or_else(|| {
                    Error::Connection("server requested a password but none was given".to_string())
                })?;
                inner.send(&[FrontendMessage::PasswordMessage { password }])?;
            }
            BackendMessage::AuthenticationMd5Password { .. } => {
                return Err(Error::Connection(
                    "md5 authentication is not supported".to_string(),
                ))
            }
            BackendMessage::AuthenticationOther(code) => {
                return Err(Error::Connection(format!(
                    "authentication method {code} is not supported"
                )))
            }
            BackendMessage::BackendKeyData {
                process_id,
                secret_key,
            } => {
                inner.backend_key = Some(BackendKey {
                    process_id,
                    secret_key,
                });
            }
            BackendMessage::ErrorResponse(fields) => {
                return Err(Error::Connection(format!(
                    "server rejected the session [{}]: {}",
                    fields.code, fields.message
                )))
            }
            BackendMessage::ReadyForQuery(_) => return Ok(()),
            other => {
                return Err(Error::Protocol(format!(
                    "unexpected {other:?} during startup"
                )))
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}
