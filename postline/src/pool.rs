//! Boundary to an external connection pool.
//!
//! Pooling policy lives outside this crate. A pool implements [`PoolHandle`]
//! and receives connections back from [`Client::give_back`][crate::Client::give_back]
//! or [`blocking::Client::give_back`][crate::blocking::Client::give_back].
use crate::Connection;

/// A pool that takes connections back.
pub trait PoolHandle<T> {
    /// Return `conn` to the pool.
    ///
    /// Returns `false` when the pool refused it, e.g. because it is full or
    /// shutting down. A refused connection is dropped by the caller.
    fn give_back(&self, conn: Connection<T>) -> bool;
}

impl<T, P: PoolHandle<T>> PoolHandle<T> for &P {
    fn give_back(&self, conn: Connection<T>) -> bool {
        P::give_back(self, conn)
    }
}

impl<T, P: PoolHandle<T>> PoolHandle<T> for std::sync::Arc<P> {
    fn give_back(&self, conn: Connection<T>) -> bool {
        P::give_back(self, conn)
    }
}

/// Whether a connection is worth returning to a pool.
pub(crate) fn reusable<T: crate::transport::PgTransport>(conn: &Connection<T>) -> bool {
    !conn.is_closed() && conn.transaction_status() == crate::postgres::TransactionStatus::Idle
}
