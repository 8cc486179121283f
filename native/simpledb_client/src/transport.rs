/// Byte transport between the client and the server
///
/// The connection treats its transport as an opaque bidirectional byte
/// channel. `TcpTransport` is the production implementation; tests supply
/// scripted transports through `Connection::connect_with_transport`.
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

use bytes::Bytes;
use tracing::debug;

use crate::constants::READ_CHUNK_SIZE;

/// Opaque bidirectional byte channel owned by a connection.
pub trait Transport: Send {
    /// Write all of `data`.
    fn send(&mut self, data: &[u8]) -> io::Result<()>;

    /// Read the next chunk of bytes. `Ok(None)` means the peer closed the
    /// channel. A read timeout surfaces as `WouldBlock` or `TimedOut`.
    fn receive(&mut self) -> io::Result<Option<Bytes>>;

    /// Bound the next `receive`; `None` blocks indefinitely.
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()>;

    /// Tear the channel down. Called at most once by the connection.
    fn close(&mut self) -> io::Result<()>;
}

/// Blocking TCP transport.
#[derive(Debug)]
pub struct TcpTransport {
    stream: TcpStream,
    buf: Box<[u8]>,
}

impl TcpTransport {
    /// Connect to `host:port`, trying each resolved address in turn.
    pub fn connect(host: &str, port: u16, timeout: Duration) -> io::Result<Self> {
        let mut last_err = None;
        for addr in (host, port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => {
                    debug!("TCP connection established to {}", addr);
                    return Self::from_stream(stream);
                }
                Err(e) => {
                    debug!("TCP connect to {} failed: {}", addr, e);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("{host}:{port} did not resolve to any address"),
            )
        }))
    }

    pub fn from_stream(stream: TcpStream) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            buf: vec![0u8; READ_CHUNK_SIZE].into_boxed_slice(),
        })
    }
}

impl Transport for TcpTransport {
    fn send(&mut self, data: &[u8]) -> io::Result<()> {
        self.stream.write_all(data)?;
        self.stream.flush()
    }

    fn receive(&mut self) -> io::Result<Option<Bytes>> {
        loop {
            match self.stream.read(&mut self.buf) {
                Ok(0) => return Ok(None),
                Ok(n) => return Ok(Some(Bytes::copy_from_slice(&self.buf[..n]))),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.stream.set_read_timeout(timeout)
    }

    fn close(&mut self) -> io::Result<()> {
        match self.stream.shutdown(Shutdown::Both) {
            // the peer may already have gone away
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }
}
