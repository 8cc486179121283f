/// Loopback SimpleDB server
///
/// A minimal server speaking the same wire protocol as the client, executing
/// SQL through an embedded libsql database file. It accepts connections on a
/// background thread and serves each session on its own thread.
///
/// The server is what the integration tests and local demos connect to; it
/// is not meant for production traffic.
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::codec::CodecError;
use crate::constants::DEFAULT_BUSY_TIMEOUT_MS;
use crate::session;

/// Errors raised by the loopback server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("server i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("database error: {0}")]
    Database(String),
    #[error("protocol error: {0}")]
    Protocol(#[from] CodecError),
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Loopback server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on; port 0 picks a free port.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    /// Path of the database file, created if missing.
    pub database_path: PathBuf,
    /// Require this cleartext password from every client.
    #[serde(default)]
    pub password: Option<String>,
    /// How long a session waits on a locked database (in milliseconds).
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
}

fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}

impl ServerConfig {
    pub fn new(database_path: impl Into<PathBuf>) -> Self {
        Self {
            listen_addr: default_listen_addr(),
            database_path: database_path.into(),
            password: None,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }

    pub fn listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn busy_timeout_ms(mut self, ms: u64) -> Self {
        self.busy_timeout_ms = ms;
        self
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ServerError> {
        toml::from_str(s).map_err(|e| ServerError::Config(e.to_string()))
    }
}

pub struct Server;

impl Server {
    /// Bind the listener and start accepting sessions in the background.
    pub fn start(config: ServerConfig) -> Result<ServerHandle, ServerError> {
        let listener = TcpListener::bind(config.listen_addr)?;
        let local_addr = listener.local_addr()?;
        let stop = Arc::new(AtomicBool::new(false));
        let config = Arc::new(config);

        info!(
            "SimpleDB loopback server listening on {} (database {})",
            local_addr,
            config.database_path.display()
        );

        let accept_stop = Arc::clone(&stop);
        let accept_thread = thread::Builder::new()
            .name("simpledb-accept".to_string())
            .spawn(move || accept_loop(listener, config, accept_stop))?;

        Ok(ServerHandle {
            local_addr,
            stop,
            accept_thread: Some(accept_thread),
        })
    }
}

fn accept_loop(listener: TcpListener, config: Arc<ServerConfig>, stop: Arc<AtomicBool>) {
    let next_process_id = AtomicI32::new(1);
    for stream in listener.incoming() {
        if stop.load(Ordering::Acquire) {
            break;
        }
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Accept error: {}", e);
                continue;
            }
        };
        let process_id = next_process_id.fetch_add(1, Ordering::Relaxed);
        let config = Arc::clone(&config);
        let spawned = thread::Builder::new()
            .name(format!("simpledb-session-{process_id}"))
            .spawn(move || {
                let peer = stream.peer_addr().ok();
                debug!("Accepted session {} from {:?}", process_id, peer);
                if let Err(e) = session::run(stream, config, process_id) {
                    warn!("Session {} ended with error: {}", process_id, e);
                } else {
                    debug!("Session {} ended", process_id);
                }
            });
        if let Err(e) = spawned {
            warn!("Could not spawn session thread: {}", e);
        }
    }
    debug!("Accept loop stopped");
}

/// Handle to a running loopback server. Dropping it stops accepting.
#[derive(Debug)]
pub struct ServerHandle {
    local_addr: SocketAddr,
    stop: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Stop accepting new sessions. Sessions in progress run to completion.
    pub fn shutdown(&mut self) {
        let Some(handle) = self.accept_thread.take() else {
            return;
        };
        self.stop.store(true, Ordering::Release);
        // wake the blocking accept
        if let Err(e) = TcpStream::connect(self.local_addr) {
            debug!("Wake-up connection failed: {}", e);
        }
        if handle.join().is_err() {
            warn!("Accept thread panicked");
        }
        info!("SimpleDB loopback server on {} stopped", self.local_addr);
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_toml() {
        let config = ServerConfig::from_toml_str(
            r#"
            listen_addr = "127.0.0.1:6543"
            database_path = "/tmp/simpledb.db"
            password = "pw"
            "#,
        )
        .unwrap();
        assert_eq!(config.listen_addr.port(), 6543);
        assert_eq!(config.password.as_deref(), Some("pw"));
        assert_eq!(config.busy_timeout_ms, DEFAULT_BUSY_TIMEOUT_MS);
    }

    #[test]
    fn test_config_requires_database_path() {
        assert!(matches!(
            ServerConfig::from_toml_str("password = \"pw\""),
            Err(ServerError::Config(_))
        ));
    }
}
