//! Scripted transport for protocol tests.
//!
//! [`Scripted`] replays canned backend frames in order and records every
//! frontend frame it flushes, so an operation's wire traffic can be asserted
//! without a server.
use std::{
    collections::VecDeque,
    io,
    sync::{Arc, Mutex},
    task::{Context, Poll},
    thread,
    time::Duration,
};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{
    connection::{Config, Connection, NotificationQueue},
    ext::BufMutExt,
    postgres::{FrontendProtocol, Oid, PgFormat, frontend},
    transport::{PgTransport, RawMessage},
    types::TypeRegistry,
};

/// What crossed the scripted socket, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Event {
    /// A frontend frame, flushed.
    Sent(u8, Bytes),
    /// A backend frame, handed to the reader.
    Recv(u8),
}

/// Shared view of a [`Scripted`] transport after it moved into a connection.
#[derive(Debug, Clone, Default)]
pub(crate) struct Log(Arc<Mutex<Vec<Event>>>);

impl Log {
    fn push(&self, event: Event) {
        self.0.lock().unwrap().push(event);
    }

    pub(crate) fn events(&self) -> Vec<Event> {
        self.0.lock().unwrap().clone()
    }

    pub(crate) fn clear(&self) {
        self.0.lock().unwrap().clear();
    }

    /// Message types of the flushed frontend frames.
    pub(crate) fn sent(&self) -> Vec<u8> {
        self.frames().into_iter().map(|(ty, _)| ty).collect()
    }

    pub(crate) fn frames(&self) -> Vec<(u8, Bytes)> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Sent(ty, body) => Some((ty, body)),
                Event::Recv(_) => None,
            })
            .collect()
    }
}

#[derive(Debug)]
pub(crate) struct Scripted {
    replies: Arc<Mutex<VecDeque<RawMessage>>>,
    write_buf: BytesMut,
    log: Log,
    delay: Duration,
    read_timeout: Option<Duration>,
}

impl Scripted {
    pub(crate) fn new() -> Self {
        Self {
            replies: Default::default(),
            write_buf: BytesMut::new(),
            log: Log::default(),
            delay: Duration::ZERO,
            read_timeout: None,
        }
    }

    /// Sleep this long before handing out each reply.
    pub(crate) fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn log(&self) -> Log {
        self.log.clone()
    }

    /// Handle to append replies after the transport moved.
    pub(crate) fn script(&self) -> Script {
        Script(self.replies.clone())
    }
}

/// Queue of backend frames replayed by [`Scripted`].
#[derive(Debug, Clone)]
pub(crate) struct Script(Arc<Mutex<VecDeque<RawMessage>>>);

impl Script {
    pub(crate) fn push(&self, msgtype: u8, body: impl Into<Bytes>) -> &Self {
        self.0.lock().unwrap().push_back(RawMessage { msgtype, body: body.into() });
        self
    }

    pub(crate) fn remaining(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    pub(crate) fn auth_ok(&self) -> &Self {
        self.push(b'R', Bytes::copy_from_slice(&0u32.to_be_bytes()))
    }

    pub(crate) fn ready(&self, status: u8) -> &Self {
        self.push(b'Z', vec![status])
    }

    pub(crate) fn parse_complete(&self) -> &Self {
        self.push(b'1', Bytes::new())
    }

    pub(crate) fn bind_complete(&self) -> &Self {
        self.push(b'2', Bytes::new())
    }

    pub(crate) fn close_complete(&self) -> &Self {
        self.push(b'3', Bytes::new())
    }

    pub(crate) fn no_data(&self) -> &Self {
        self.push(b'n', Bytes::new())
    }

    pub(crate) fn copy_done(&self) -> &Self {
        self.push(b'c', Bytes::new())
    }

    pub(crate) fn params(&self, oids: &[Oid]) -> &Self {
        let mut body = BytesMut::new();
        body.put_u16(oids.len() as u16);
        for oid in oids {
            body.put_u32(*oid);
        }
        self.push(b't', body)
    }

    /// `RowDescription` of `(name, type oid)` columns in `format`.
    pub(crate) fn columns(&self, columns: &[(&str, Oid)], format: PgFormat) -> &Self {
        let mut body = BytesMut::new();
        body.put_u16(columns.len() as u16);
        for (name, oid) in columns {
            body.put_nul_string(name);
            body.put_u32(0);
            body.put_i16(0);
            body.put_u32(*oid);
            body.put_i16(-1);
            body.put_i32(-1);
            body.put_u16(format.format_code());
        }
        self.push(b'T', body)
    }

    pub(crate) fn row(&self, values: &[Option<&[u8]>]) -> &Self {
        let mut body = BytesMut::new();
        body.put_u16(values.len() as u16);
        for value in values {
            match value {
                Some(value) => {
                    body.put_i32(value.len() as i32);
                    body.put_slice(value);
                }
                None => body.put_i32(-1),
            }
        }
        self.push(b'D', body)
    }

    pub(crate) fn complete(&self, tag: &str) -> &Self {
        let mut body = BytesMut::new();
        body.put_nul_string(tag);
        self.push(b'C', body)
    }

    pub(crate) fn error(&self, severity: &str, code: &str, message: &str) -> &Self {
        let mut body = BytesMut::new();
        for (field, value) in [(b'S', severity), (b'V', severity), (b'C', code), (b'M', message)] {
            body.put_u8(field);
            body.put_nul_string(value);
        }
        body.put_u8(0);
        self.push(b'E', body)
    }

    pub(crate) fn copy_in(&self) -> &Self {
        self.push(b'G', Bytes::from_static(&[0, 0, 0]))
    }

    pub(crate) fn copy_out(&self) -> &Self {
        self.push(b'H', Bytes::from_static(&[0, 0, 0]))
    }

    pub(crate) fn copy_data(&self, data: &'static [u8]) -> &Self {
        self.push(b'd', data)
    }

    pub(crate) fn notification(&self, channel: &str, payload: &str) -> &Self {
        let mut body = BytesMut::new();
        body.put_u32(42);
        body.put_nul_string(channel);
        body.put_nul_string(payload);
        self.push(b'A', body)
    }

    pub(crate) fn parameter_status(&self, name: &str, value: &str) -> &Self {
        let mut body = BytesMut::new();
        body.put_nul_string(name);
        body.put_nul_string(value);
        self.push(b'S', body)
    }
}

impl PgTransport for Scripted {
    fn poll_flush(&mut self, _: &mut Context) -> Poll<io::Result<()>> {
        let mut buf = self.write_buf.split().freeze();
        while buf.has_remaining() {
            let msgtype = buf.get_u8();
            let len = buf.get_u32() as usize - 4;
            self.log.push(Event::Sent(msgtype, buf.split_to(len)));
        }
        Poll::Ready(Ok(()))
    }

    fn poll_recv(&mut self, cx: &mut Context) -> Poll<io::Result<RawMessage>> {
        if !self.write_buf.is_empty() {
            let _ = self.poll_flush(cx);
        }
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        let reply = self.replies.lock().unwrap().pop_front();
        match reply {
            Some(msg) => {
                self.log.push(Event::Recv(msg.msgtype));
                Poll::Ready(Ok(msg))
            }
            // nothing scripted is the same as nothing arriving in time
            None if self.read_timeout.is_some() => Poll::Ready(Err(io::ErrorKind::TimedOut.into())),
            None => Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into())),
        }
    }

    fn send<F: FrontendProtocol>(&mut self, message: F) {
        frontend::write(message, &mut self.write_buf);
    }

    fn send_startup(&mut self, startup: frontend::Startup) {
        // recorded as a frame of type 0, the length prefix is dropped
        let mut buf = BytesMut::new();
        startup.write(&mut buf);
        buf.advance(4);
        self.log.push(Event::Sent(0, buf.freeze()));
    }

    fn buffered(&self) -> usize {
        self.write_buf.len()
    }

    fn poll_shutdown(&mut self, cx: &mut Context) -> Poll<io::Result<()>> {
        self.poll_flush(cx)
    }

    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.read_timeout = timeout;
        Ok(())
    }
}

/// Run a future that never waits on anything but the scripted transport.
pub(crate) fn run<F: Future>(future: F) -> F::Output {
    futures_executor::block_on(future)
}

/// A connection past startup over a fresh [`Scripted`] transport.
///
/// The log starts empty, startup traffic is cleared.
pub(crate) fn connect(config: Config) -> (Connection<Scripted>, Script, Log) {
    connect_with(Scripted::new(), config)
}

pub(crate) fn connect_with(transport: Scripted, config: Config) -> (Connection<Scripted>, Script, Log) {
    let script = transport.script();
    let log = transport.log();
    script.auth_ok().parameter_status("server_version", "17.0").ready(b'I');
    let conn = run(Connection::startup(
        transport,
        NotificationQueue::new(),
        config,
        Arc::new(TypeRegistry::new()),
    ))
    .unwrap();
    log.clear();
    (conn, script, log)
}

/// Config pointing at a local port nobody listens on.
pub(crate) fn refused_config() -> Config {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    Config::parse(&format!("postgres://app@127.0.0.1:{port}/app")).unwrap()
}
