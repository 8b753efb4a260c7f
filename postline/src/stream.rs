//! Protocol engine.
//!
//! [`PgStream`] owns the transport and is the single reader of its messages.
//! Every message goes through [`PgStream::recv`], which handles the
//! connection wide asynchronous messages itself:
//!
//! - `NoticeResponse` is logged
//! - `NotificationResponse` is queued
//! - `ParameterStatus` updates the session parameters
//! - `BackendKeyData` is kept for the session
//! - `NegotiateProtocolVersion` is logged
//!
//! Everything else is returned to the caller, usually through
//! [`process_message_loop`][PgStream::process_message_loop].
use std::{
    collections::HashMap,
    io,
    task::{Context, Poll, ready},
};

use crate::{
    Result,
    common::{log_debug, log_info, log_warn, verbose},
    connection::NotificationQueue,
    error::UsageError,
    postgres::{
        BackendMessage, BackendProtocol, FrontendProtocol, ProtocolError, TransactionStatus,
        backend::{BackendKeyData, NoticeResponse},
        frontend,
    },
    transport::{PgTransport, PgTransportExt},
};

/// What the message loop does after a handler saw a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// The message was consumed, keep reading.
    Continue,
    /// The exchange is finished.
    Break,
    /// The message was not interesting, keep reading.
    Skip,
}

/// Buffered protocol engine over a [`PgTransport`].
#[derive(Debug)]
pub struct PgStream<T> {
    transport: T,
    notifications: NotificationQueue,
    parameters: HashMap<String, String>,
    backend_key: Option<BackendKeyData>,
    status: TransactionStatus,
    /// `ReadyForQuery` still owed by the server for `Sync` and `Query` already sent.
    ready_pending: usize,
    broken: bool,
}

impl<T: PgTransport> PgStream<T> {
    pub fn new(transport: T, notifications: NotificationQueue) -> Self {
        Self {
            transport,
            notifications,
            parameters: HashMap::new(),
            backend_key: None,
            status: TransactionStatus::Idle,
            ready_pending: 0,
            broken: false,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn notifications(&self) -> &NotificationQueue {
        &self.notifications
    }

    /// Session parameter reported by the server, e.g. `server_version`.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    pub fn backend_key(&self) -> Option<BackendKeyData> {
        self.backend_key
    }

    /// Transaction status from the latest `ReadyForQuery`.
    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    /// Returns `true` once the transport failed or the server ended the session.
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        match self.broken {
            true => Err(UsageError::Closed.into()),
            false => Ok(()),
        }
    }

    /// Buffer a message.
    ///
    /// `Sync` and `Query` each owe one `ReadyForQuery`, which is tracked here.
    pub fn send<F: FrontendProtocol>(&mut self, message: F) {
        if matches!(F::MSGTYPE, b'S' | b'Q') {
            self.ready_pending += 1;
        }
        self.transport.send(message);
    }

    pub fn send_startup(&mut self, startup: frontend::Startup) {
        self.transport.send_startup(startup);
    }

    /// Bytes buffered and not yet flushed.
    pub fn buffered(&self) -> usize {
        self.transport.buffered()
    }

    pub async fn flush(&mut self) -> Result<()> {
        match self.transport.flush().await {
            Ok(()) => Ok(()),
            Err(err) => Err(self.lost(err)),
        }
    }

    fn lost(&mut self, err: io::Error) -> crate::Error {
        self.abandon();
        err.into()
    }

    /// Mark the session unusable after a fatal error.
    pub(crate) fn abandon(&mut self) {
        self.broken = true;
        self.notifications.close();
    }

    fn poll_recv_raw(&mut self, cx: &mut Context) -> Poll<Result<BackendMessage>> {
        self.ensure_open()?;
        let raw = match ready!(self.transport.poll_recv(cx)) {
            Ok(raw) => raw,
            Err(err) => return Poll::Ready(Err(self.lost(err))),
        };
        match BackendMessage::decode(raw.msgtype, raw.body) {
            Ok(msg) => Poll::Ready(Ok(msg)),
            Err(err) => {
                self.broken = true;
                Poll::Ready(Err(err.into()))
            }
        }
    }

    /// Handle connection wide messages, returns the rest.
    fn intercept(&mut self, msg: BackendMessage) -> Option<BackendMessage> {
        match msg {
            BackendMessage::NoticeResponse(NoticeResponse { notice }) => {
                match notice.severity.as_str() {
                    "WARNING" => log_warn!("{notice}"),
                    _ => log_info!("{notice}"),
                }
            }
            BackendMessage::NotificationResponse(notification) => {
                verbose!(channel = %notification.channel, "notification");
                self.notifications.push(notification.into());
            }
            BackendMessage::ParameterStatus(param) => {
                verbose!(name = %param.name, value = %param.value, "parameter status");
                self.parameters.insert(param.name, param.value);
            }
            BackendMessage::BackendKeyData(key) => self.backend_key = Some(key),
            BackendMessage::NegotiateProtocolVersion(version) => {
                log_debug!(
                    "server supports protocol 3.{}, unrecognized options: {:?}",
                    version.minor,
                    version.unrecognized,
                );
            }
            BackendMessage::ReadyForQuery(ready) => {
                self.status = ready.status;
                self.ready_pending = self.ready_pending.saturating_sub(1);
                return Some(BackendMessage::ReadyForQuery(ready));
            }
            other => return Some(other),
        }
        None
    }

    /// Poll the next message that is not handled internally.
    ///
    /// A `FATAL` or `PANIC` error ends the session, it is returned as [`Err`]
    /// and the stream is marked broken.
    pub fn poll_recv(&mut self, cx: &mut Context) -> Poll<Result<BackendMessage>> {
        loop {
            let msg = ready!(self.poll_recv_raw(cx))?;
            verbose!("recv {}", BackendMessage::message_name(msg.msgtype()));

            let Some(msg) = self.intercept(msg) else {
                continue;
            };

            return Poll::Ready(match msg {
                BackendMessage::ErrorResponse(err)
                    if matches!(err.error.severity.as_str(), "FATAL" | "PANIC") =>
                {
                    self.abandon();
                    Err(err.error.into())
                }
                msg => Ok(msg),
            });
        }
    }

    /// Receive the next message that is not handled internally.
    pub async fn recv(&mut self) -> Result<BackendMessage> {
        std::future::poll_fn(|cx| self.poll_recv(cx)).await
    }

    /// Feed every message to `handler` until it returns [`Flow::Break`].
    ///
    /// Stops early on connection loss, protocol violation, or when `handler` fails.
    pub async fn process_message_loop<F>(&mut self, mut handler: F) -> Result<()>
    where
        F: FnMut(BackendMessage) -> Result<Flow>,
    {
        loop {
            let msg = self.recv().await?;
            match handler(msg)? {
                Flow::Continue => {}
                Flow::Skip => verbose!("message skipped by handler"),
                Flow::Break => return Ok(()),
            }
        }
    }

    /// Read until a `B` arrives, discarding other messages.
    ///
    /// An `ErrorResponse` is returned as [`Err`] immediately, the pending
    /// `ReadyForQuery` is left for [`ready`][PgStream::ready].
    pub async fn wait_for_or_error<B>(&mut self) -> Result<B>
    where
        B: TryFrom<BackendMessage, Error = ProtocolError>,
    {
        loop {
            let msg = self.recv().await?;
            let msgtype = msg.msgtype();
            if let BackendMessage::ErrorResponse(err) = msg {
                return Err(err.error.into());
            }
            match B::try_from(msg) {
                Ok(ok) => return Ok(ok),
                Err(_) => {
                    verbose!("discard {}", BackendMessage::message_name(msgtype));
                }
            }
        }
    }

    /// Drain until every owed `ReadyForQuery` arrived.
    ///
    /// Leftovers of an operation that returned early are discarded here, so
    /// the next operation starts on a clean exchange.
    pub async fn ready(&mut self) -> Result<()> {
        self.flush().await?;
        while self.ready_pending > 0 {
            let msg = self.recv().await?;
            verbose!("drain {}", BackendMessage::message_name(msg.msgtype()));
        }
        Ok(())
    }

    /// Read one message while no operation is running.
    ///
    /// Returns `false` when the transport read timed out. Only connection wide
    /// messages are expected here.
    pub async fn recv_idle(&mut self) -> Result<bool> {
        self.ensure_open()?;
        let raw = match self.transport.recv().await {
            Ok(raw) => raw,
            Err(err) if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                return Ok(false);
            }
            Err(err) => return Err(self.lost(err)),
        };
        let msg = match BackendMessage::decode(raw.msgtype, raw.body) {
            Ok(msg) => msg,
            Err(err) => {
                self.broken = true;
                return Err(err.into());
            }
        };
        match self.intercept(msg) {
            None => Ok(true),
            Some(BackendMessage::ErrorResponse(err)) => {
                // the server reports session termination, e.g. admin shutdown
                self.abandon();
                Err(err.error.into())
            }
            Some(other) => Err(ProtocolError::unexpected_phase(other.msgtype(), "idle").into()),
        }
    }

    /// Send `Terminate` and shutdown the socket.
    pub async fn close(&mut self) -> Result<()> {
        if self.broken {
            return Ok(());
        }
        self.transport.send(frontend::Terminate);
        self.abandon();
        self.transport.shutdown().await?;
        Ok(())
    }
}
