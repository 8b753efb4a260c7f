use std::{
    io::{self, Read, Write},
    task::{Context, Poll},
    time::Duration,
};

use bytes::BytesMut;

use super::{Connect, PgTransport, RawMessage, split_frame};
use crate::{
    connection::{Config, NotificationQueue},
    net::BlockingSocket,
    postgres::{FrontendProtocol, frontend},
};

const DEFAULT_BUF_CAPACITY: usize = 8 * 1024;

/// Transport that performs blocking io on the calling thread.
///
/// Every `poll_*` completes before returning, so futures built on top of it
/// resolve on their first poll. Used by [`blocking::Client`][crate::blocking::Client].
#[derive(Debug)]
pub struct BlockingTransport {
    socket: BlockingSocket,
    read_buf: BytesMut,
    write_buf: BytesMut,
}

impl BlockingTransport {
    /// Connect synchronously.
    pub fn connect_blocking(config: &Config) -> io::Result<Self> {
        Ok(Self {
            socket: BlockingSocket::connect(config)?,
            read_buf: BytesMut::with_capacity(DEFAULT_BUF_CAPACITY),
            write_buf: BytesMut::with_capacity(DEFAULT_BUF_CAPACITY),
        })
    }

    fn flush_blocking(&mut self) -> io::Result<()> {
        if !self.write_buf.is_empty() {
            self.socket.write_all(&self.write_buf)?;
            self.write_buf.clear();
        }
        self.socket.flush()
    }

    fn recv_blocking(&mut self) -> io::Result<RawMessage> {
        self.flush_blocking()?;

        let mut chunk = [0u8; DEFAULT_BUF_CAPACITY];
        loop {
            // a partial frame stays in `read_buf` across a read timeout
            if let Some(msg) = split_frame(&mut self.read_buf)? {
                return Ok(msg);
            }

            let n = match self.socket.read(&mut chunk) {
                Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                Ok(n) => n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            };
            self.read_buf.extend_from_slice(&chunk[..n]);
        }
    }
}

impl PgTransport for BlockingTransport {
    fn poll_flush(&mut self, _: &mut Context) -> Poll<io::Result<()>> {
        Poll::Ready(self.flush_blocking())
    }

    fn poll_recv(&mut self, _: &mut Context) -> Poll<io::Result<RawMessage>> {
        Poll::Ready(self.recv_blocking())
    }

    fn send<F: FrontendProtocol>(&mut self, message: F) {
        frontend::write(message, &mut self.write_buf);
    }

    fn send_startup(&mut self, startup: frontend::Startup) {
        startup.write(&mut self.write_buf);
    }

    fn buffered(&self) -> usize {
        self.write_buf.len()
    }

    fn poll_shutdown(&mut self, _: &mut Context) -> Poll<io::Result<()>> {
        Poll::Ready(self.flush_blocking().and_then(|_| self.socket.shutdown()))
    }

    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.socket.set_read_timeout(timeout)
    }
}

impl Connect for BlockingTransport {
    async fn connect(config: &Config, _: NotificationQueue) -> io::Result<Self> {
        Self::connect_blocking(config)
    }
}
