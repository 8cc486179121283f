//! `SimpleDB` client: synchronous protocol core for SimpleDB servers
//!
//! This is the root module of the client library. A [`Connection`] owns the
//! transport to the server and its transaction state; a [`Cursor`] borrowed
//! from it executes statements and streams their rows lazily. The
//! [`server`] module provides a loopback server speaking the same protocol
//! over an embedded libsql database.
//!
//! ```no_run
//! use simpledb_client::{ConnectOptions, Connection};
//!
//! # fn main() -> simpledb_client::Result<()> {
//! let conn = Connection::connect(&"host=127.0.0.1 port=5432".parse::<ConnectOptions>()?)?;
//! let mut cur = conn.cursor()?;
//! cur.execute("SELECT id, name FROM t", &[])?;
//! while let Some(row) = cur.fetch_one()? {
//!     println!("{} {}", row[0], row[1]);
//! }
//! conn.commit()?;
//! # Ok(())
//! # }
//! ```
pub mod codec;
pub mod config;
pub mod connection;
pub mod constants;
pub mod cursor;
pub mod decode;
pub mod error;
pub mod message;
pub mod models;
mod query;
pub mod result;
pub mod server;
mod session;
pub mod transaction;
pub mod transport;
pub mod utils;

// Re-export the types callers work with
pub use config::ConnectOptions;
pub use connection::Connection;
pub use cursor::Cursor;
pub use error::{Error, Result};
pub use models::*;
pub use result::Rows;
pub use server::{Server, ServerConfig, ServerHandle};
pub use transaction::{Transaction, TransactionBehavior};
pub use transport::{TcpTransport, Transport};
pub use utils::{detect_query_type, QueryType};

#[cfg(test)]
mod tests;
