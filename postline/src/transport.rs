//! The [`PgTransport`] trait.
//!
//! A transport owns the socket and its buffers. It frames incoming bytes into
//! [`RawMessage`] and buffers outgoing frontend messages until flushed. The
//! protocol logic in [`PgStream`][crate::stream::PgStream] is written once
//! against this trait, the execution mode is decided by the implementor:
//!
//! - [`BlockingTransport`] does blocking io inside `poll_*` and is always ready
//! - [`TokioTransport`] reads from a background task through a bounded channel
use std::{
    io,
    task::{Context, Poll},
    time::Duration,
};

use bytes::{Buf, Bytes, BytesMut};

use crate::{
    connection::{Config, NotificationQueue},
    postgres::{FrontendProtocol, HEADER_LEN, MAX_MESSAGE_LEN, frontend},
};

mod blocking;
#[cfg(feature = "tokio")]
mod tokio_io;

pub use blocking::BlockingTransport;
#[cfg(feature = "tokio")]
pub use tokio_io::TokioTransport;

/// One framed backend message, not yet decoded.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub msgtype: u8,
    pub body: Bytes,
}

/// A buffered stream which can send and receive postgres message.
pub trait PgTransport: Unpin + Send {
    /// Poll to flush the buffered messages.
    fn poll_flush(&mut self, cx: &mut Context) -> Poll<io::Result<()>>;

    /// Poll to receive one framed message.
    ///
    /// Calling `poll_recv` will also try to [`poll_flush`][1] if there is buffered message.
    ///
    /// [1]: PgTransport::poll_flush
    fn poll_recv(&mut self, cx: &mut Context) -> Poll<io::Result<RawMessage>>;

    /// Buffer a message, it is written on the next flush.
    fn send<F: FrontendProtocol>(&mut self, message: F);

    /// Buffer the [`Startup`][frontend::Startup] message, which has no message type byte.
    fn send_startup(&mut self, startup: frontend::Startup);

    /// Bytes buffered and not yet flushed.
    fn buffered(&self) -> usize;

    /// Poll to shutdown the write side after flushing.
    fn poll_shutdown(&mut self, cx: &mut Context) -> Poll<io::Result<()>>;

    /// Bound the next reads, a read past the deadline fails with
    /// [`TimedOut`][io::ErrorKind::TimedOut] or [`WouldBlock`][io::ErrorKind::WouldBlock].
    ///
    /// Only meaningful for transports that read on the calling thread.
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        let _ = timeout;
        Ok(())
    }
}

/// A transport that can open a new connection.
pub trait Connect: PgTransport + Sized {
    /// Open the socket described by `config`.
    ///
    /// Transports with a background reader route `NotificationResponse` straight
    /// into `notifications`.
    fn connect(
        config: &Config,
        notifications: NotificationQueue,
    ) -> impl Future<Output = io::Result<Self>> + Send;
}

impl<P> PgTransport for &mut P where P: PgTransport {
    fn poll_flush(&mut self, cx: &mut Context) -> Poll<io::Result<()>> {
        P::poll_flush(self, cx)
    }

    fn poll_recv(&mut self, cx: &mut Context) -> Poll<io::Result<RawMessage>> {
        P::poll_recv(self, cx)
    }

    fn send<F: FrontendProtocol>(&mut self, message: F) {
        P::send(self, message);
    }

    fn send_startup(&mut self, startup: frontend::Startup) {
        P::send_startup(self, startup);
    }

    fn buffered(&self) -> usize {
        P::buffered(self)
    }

    fn poll_shutdown(&mut self, cx: &mut Context) -> Poll<io::Result<()>> {
        P::poll_shutdown(self, cx)
    }

    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        P::set_read_timeout(self, timeout)
    }
}

/// An extension trait to provide `Future` API for [`PgTransport`].
pub trait PgTransportExt: PgTransport {
    /// Flush the underlying io.
    fn flush(&mut self) -> impl Future<Output = io::Result<()>> {
        std::future::poll_fn(|cx|self.poll_flush(cx))
    }

    /// Receive a framed message.
    fn recv(&mut self) -> impl Future<Output = io::Result<RawMessage>> {
        std::future::poll_fn(|cx|self.poll_recv(cx))
    }

    /// Flush and shutdown the write side.
    fn shutdown(&mut self) -> impl Future<Output = io::Result<()>> {
        std::future::poll_fn(|cx|self.poll_shutdown(cx))
    }
}

impl<T> PgTransportExt for T where T: PgTransport { }

/// Split one complete frame off the front of `buf`.
///
/// Returns `None` and reserves room when the frame is incomplete.
pub(crate) fn split_frame(buf: &mut BytesMut) -> io::Result<Option<RawMessage>> {
    let Some(mut header) = buf.get(..HEADER_LEN) else {
        return Ok(None);
    };

    let msgtype = header.get_u8();
    let len = header.get_u32() as usize;

    if !(4..=MAX_MESSAGE_LEN).contains(&len) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid message length {len} for message type {:?}", msgtype as char),
        ));
    }

    if buf.len() - 1/*msgtype*/ < len {
        buf.reserve(1 + len - buf.len());
        return Ok(None);
    }

    buf.advance(HEADER_LEN);
    let body = buf.split_to(len - 4).freeze();

    Ok(Some(RawMessage { msgtype, body }))
}

/// Unix socket file inside `dir` for `port`, e.g. `/run/postgresql/.s.PGSQL.5432`.
pub(crate) fn socket_path(dir: &str, port: u16) -> String {
    format!("{}/.s.PGSQL.{port}", dir.trim_end_matches('/'))
}
