//! Byte-stream transports for the connection engine.
//!
//! The engine needs the connection as two independently owned halves, one
//! for the reader thread and one for the writer thread, plus a handle that can
//! tear the connection down from any thread. [`Transport::into_streams`]
//! produces that split.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

/// Out-of-band control over a split connection.
pub trait StreamControl: Send + Sync {
    /// Deadline for blocking reads on the source half. `None` blocks forever.
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

    /// Close both directions. Blocked reads and writes on the halves fail
    /// promptly afterwards.
    fn shutdown(&self) -> io::Result<()>;
}

/// A connection split into reader half, writer half and control handle.
pub struct Streams {
    pub source: Box<dyn Read + Send>,
    pub sink: Box<dyn Write + Send>,
    pub control: Arc<dyn StreamControl>,
}

/// Anything that can become a [`Streams`] triple. Called on the reader
/// thread, so implementations may block (for example to dial).
pub trait Transport: Send + 'static {
    fn into_streams(self) -> io::Result<Streams>;
}

impl StreamControl for TcpStream {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }

    fn shutdown(&self) -> io::Result<()> {
        match TcpStream::shutdown(self, Shutdown::Both) {
            // Already torn down by the peer.
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }
}

impl Transport for TcpStream {
    fn into_streams(self) -> io::Result<Streams> {
        self.set_nodelay(true)?;
        let sink = self.try_clone()?;
        let control = self.try_clone()?;
        Ok(Streams {
            source: Box::new(self),
            sink: Box::new(sink),
            control: Arc::new(control),
        })
    }
}

/// Dials a TCP address when the engine starts.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
    connect_timeout: Option<Duration>,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout: None,
        }
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    fn dial(&self) -> io::Result<TcpStream> {
        let Some(timeout) = self.connect_timeout else {
            return TcpStream::connect(self.addr.as_str());
        };
        let mut last_err = None;
        for addr in self.addr.as_str().to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("could not resolve {}", self.addr),
            )
        }))
    }
}

impl Transport for TcpConnector {
    fn into_streams(self) -> io::Result<Streams> {
        let stream = self.dial()?;
        tracing::debug!(addr = %self.addr, "tcp connected");
        stream.into_streams()
    }
}
