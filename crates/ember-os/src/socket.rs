use std::io::Write as _;
use std::net::TcpStream;
use std::time::Duration;

use embedded_io::{ErrorKind, ErrorType, Write};

/// A [`TcpStream`] error seen through [`embedded_io`].
#[derive(Debug)]
pub struct SocketError(pub std::io::Error);

impl embedded_io::Error for SocketError {
    fn kind(&self) -> ErrorKind {
        match self.0.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => ErrorKind::TimedOut,
            std::io::ErrorKind::BrokenPipe => ErrorKind::BrokenPipe,
            std::io::ErrorKind::ConnectionReset => ErrorKind::ConnectionReset,
            std::io::ErrorKind::ConnectionAborted => ErrorKind::ConnectionAborted,
            _ => ErrorKind::Other,
        }
    }
}

impl std::fmt::Display for SocketError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::error::Error for SocketError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.0)
    }
}

/// A blocking writer over a connected socket.
///
/// Every write either completes within the write timeout or fails, so a
/// stalled client cannot hold the node for longer than that.
#[derive(Debug)]
pub struct SocketWriter {
    stream: TcpStream,
}

impl SocketWriter {
    /// Creates a [`SocketWriter`], switching the socket to blocking mode.
    ///
    /// # Errors
    ///
    /// Fails when the socket options cannot be changed.
    pub fn new(stream: TcpStream, write_timeout: Duration) -> std::io::Result<Self> {
        stream.set_nonblocking(false)?;
        stream.set_write_timeout(Some(write_timeout))?;
        stream.set_nodelay(true)?;
        Ok(Self { stream })
    }
}

impl ErrorType for SocketWriter {
    type Error = SocketError;
}

impl Write for SocketWriter {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        self.stream.write(buf).map_err(SocketError)
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        self.stream.flush().map_err(SocketError)
    }
}
