use std::{
    io,
    pin::Pin,
    task::{Context, Poll, ready},
};

use bytes::{Buf, BytesMut};
use tokio::{
    io::{AsyncReadExt, AsyncWrite, ReadHalf, WriteHalf},
    sync::mpsc,
    task::JoinHandle,
};

use super::{Connect, PgTransport, RawMessage, split_frame};
use crate::{
    common::verbose,
    connection::{Config, NotificationQueue},
    net::Socket,
    postgres::{BackendProtocol, FrontendProtocol, backend::NotificationResponse, frontend},
};

const DEFAULT_BUF_CAPACITY: usize = 8 * 1024;

/// Frames buffered between the reader task and the message loop.
const CHANNEL_CAPACITY: usize = 64;

/// Transport for the tokio runtime.
///
/// A spawned task owns the read half of the socket, frames incoming bytes and
/// publishes them into a bounded channel consumed by [`poll_recv`][PgTransport::poll_recv].
/// `NotificationResponse` frames skip the channel and go straight to the
/// [`NotificationQueue`], so notifications are delivered while the connection is idle.
///
/// Dropping the transport aborts the reader task.
#[derive(Debug)]
pub struct TokioTransport {
    writer: WriteHalf<Socket>,
    write_buf: BytesMut,
    rx: mpsc::Receiver<io::Result<RawMessage>>,
    reader: JoinHandle<()>,
}

impl TokioTransport {
    fn new(socket: Socket, notifications: NotificationQueue) -> Self {
        let (reader, writer) = tokio::io::split(socket);
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let reader = tokio::spawn(read_loop(reader, tx, notifications));
        Self {
            writer,
            write_buf: BytesMut::with_capacity(DEFAULT_BUF_CAPACITY),
            rx,
            reader,
        }
    }
}

impl Drop for TokioTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop(
    mut reader: ReadHalf<Socket>,
    tx: mpsc::Sender<io::Result<RawMessage>>,
    notifications: NotificationQueue,
) {
    let mut buf = BytesMut::with_capacity(DEFAULT_BUF_CAPACITY);

    let err = 'read: loop {
        loop {
            let msg = match split_frame(&mut buf) {
                Ok(Some(msg)) => msg,
                Ok(None) => break,
                Err(err) => break 'read err,
            };

            if msg.msgtype == NotificationResponse::MSGTYPE {
                match NotificationResponse::decode(msg.msgtype, msg.body) {
                    Ok(notification) => notifications.push(notification.into()),
                    Err(err) => break 'read io::Error::new(io::ErrorKind::InvalidData, err),
                }
                continue;
            }

            if tx.send(Ok(msg)).await.is_err() {
                // transport dropped
                notifications.close();
                return;
            }
        }

        match reader.read_buf(&mut buf).await {
            Ok(0) => break io::ErrorKind::UnexpectedEof.into(),
            Ok(_) => {}
            Err(err) => break err,
        }
    };

    verbose!("reader task stopped: {err}");
    notifications.close();
    let _ = tx.send(Err(err)).await;
}

impl PgTransport for TokioTransport {
    fn poll_flush(&mut self, cx: &mut Context) -> Poll<io::Result<()>> {
        while self.write_buf.has_remaining() {
            let n = ready!(Pin::new(&mut self.writer).poll_write(cx, &self.write_buf))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.write_buf.advance(n);
        }
        Pin::new(&mut self.writer).poll_flush(cx)
    }

    fn poll_recv(&mut self, cx: &mut Context) -> Poll<io::Result<RawMessage>> {
        if self.write_buf.has_remaining() {
            ready!(self.poll_flush(cx))?;
        }
        match ready!(self.rx.poll_recv(cx)) {
            Some(result) => Poll::Ready(result),
            None => Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
        }
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

    fn poll_shutdown(&mut self, cx: &mut Context) -> Poll<io::Result<()>> {
        ready!(self.poll_flush(cx))?;
        Pin::new(&mut self.writer).poll_shutdown(cx)
    }
}

impl Connect for TokioTransport {
    async fn connect(config: &Config, notifications: NotificationQueue) -> io::Result<Self> {
        let socket = Socket::connect(config).await?;
        Ok(Self::new(socket, notifications))
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream},
    };

    use super::*;
    use crate::transport::PgTransportExt;

    const COMPLETE: &[u8] = b"C\0\0\0\x0dSELECT 1\0";
    const READY: &[u8] = b"Z\0\0\0\x05I";
    const NOTIFICATION: &[u8] = b"A\0\0\0\x0f\0\0\0\x2ajobs\x007\0";

    async fn accept() -> (TokioTransport, TcpStream, NotificationQueue) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let config = Config::parse(&format!("postgres://app@127.0.0.1:{port}/app")).unwrap();
        let notifications = NotificationQueue::new();

        let (transport, accepted) = tokio::join!(
            TokioTransport::connect(&config, notifications.clone()),
            listener.accept(),
        );
        (transport.unwrap(), accepted.unwrap().0, notifications)
    }

    #[tokio::test]
    async fn frames_split_across_reads() {
        let (mut transport, mut server, _) = accept().await;

        server.write_all(&COMPLETE[..3]).await.unwrap();
        server.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        server.write_all(&COMPLETE[3..]).await.unwrap();
        server.write_all(READY).await.unwrap();

        let msg = transport.recv().await.unwrap();
        assert_eq!(msg.msgtype, b'C');
        assert_eq!(&msg.body[..], b"SELECT 1\0");
        let msg = transport.recv().await.unwrap();
        assert_eq!(msg.msgtype, b'Z');
        assert_eq!(&msg.body[..], b"I");
    }

    #[tokio::test]
    async fn notification_skips_the_channel() {
        let (mut transport, mut server, notifications) = accept().await;

        server.write_all(NOTIFICATION).await.unwrap();
        let notification = notifications.recv().await.unwrap();
        assert_eq!(notification.process_id, 42);
        assert_eq!(notification.channel, "jobs");
        assert_eq!(notification.payload, "7");

        server.write_all(READY).await.unwrap();
        assert_eq!(transport.recv().await.unwrap().msgtype, b'Z');
        assert!(notifications.is_empty());
    }

    #[tokio::test]
    async fn eof_closes_the_queue() {
        let (mut transport, server, notifications) = accept().await;
        drop(server);

        let err = transport.recv().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        assert!(notifications.is_closed());
        assert_eq!(notifications.recv().await, None);
    }

    #[tokio::test]
    async fn drop_aborts_the_reader() {
        let (transport, mut server, _) = accept().await;
        drop(transport);

        let mut buf = [0u8; 8];
        let read = tokio::time::timeout(Duration::from_secs(1), server.read(&mut buf)).await;
        assert_eq!(read.unwrap().unwrap(), 0);
    }
}
