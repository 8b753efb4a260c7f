//! LISTEN/NOTIFY delivery.
use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use crate::postgres::backend::NotificationResponse;

/// An asynchronous `NOTIFY` received by this session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// The process ID of the notifying backend.
    pub process_id: u32,
    pub channel: String,
    pub payload: String,
}

impl From<NotificationResponse> for Notification {
    fn from(value: NotificationResponse) -> Self {
        Self { process_id: value.process_id, channel: value.channel, payload: value.payload }
    }
}

/// FIFO of received notifications, shared between the reader and consumers.
///
/// Unbounded and lossless while the connection is open. After the
/// connection closes, already queued notifications can still be taken.
#[derive(Clone, Default)]
pub struct NotificationQueue {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    queue: Mutex<VecDeque<Notification>>,
    closed: AtomicBool,
    #[cfg(feature = "tokio")]
    notify: tokio::sync::Notify,
}

impl NotificationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Notification>> {
        // the queue is never left half-mutated, a poisoned lock is still consistent
        self.inner.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn push(&self, notification: Notification) {
        self.lock().push_back(notification);
        #[cfg(feature = "tokio")]
        self.inner.notify.notify_one();
    }

    pub(crate) fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        #[cfg(feature = "tokio")]
        {
            self.inner.notify.notify_waiters();
            self.inner.notify.notify_one();
        }
    }

    /// Take the oldest notification without waiting.
    pub fn try_recv(&self) -> Option<Notification> {
        self.lock().pop_front()
    }

    /// Take every queued notification.
    pub fn drain(&self) -> Vec<Notification> {
        self.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` once the connection that feeds this queue is gone.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Wait for the next notification.
    ///
    /// Returns `None` when the queue is empty and the connection is closed.
    #[cfg(feature = "tokio")]
    pub async fn recv(&self) -> Option<Notification> {
        loop {
            let notified = self.inner.notify.notified();
            if let Some(notification) = self.try_recv() {
                return Some(notification);
            }
            if self.is_closed() {
                return None;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for NotificationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationQueue")
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Quote `channel` as an identifier, doubling embedded quotes.
pub(crate) fn listen_sql(command: &str, channel: &str) -> String {
    format!("{command} {};", crate::sql::quote_ident(channel))
}

/// `NOTIFY "channel", 'payload';` with the payload quoted as a literal.
pub(crate) fn notify_sql(channel: &str, payload: &str) -> String {
    format!(
        "NOTIFY {}, {};",
        crate::sql::quote_ident(channel),
        crate::sql::quote_literal(payload),
    )
}
