//! Fixed-size pool of worker connections
//!
//! Holds exactly one connection per worker. For each rank the whole pool is
//! checked out to the workers and checked back in after the barrier, so
//! connections are reused across ranks.

use super::{IndexError, IndexResult};
use crate::db::{DbResult, IndexConnection, PlaceStore};
use tracing::{debug, warn};

pub struct ConnectionPool<C: IndexConnection> {
    idle: Vec<C>,
    size: usize,
}

impl<C: IndexConnection> ConnectionPool<C> {
    /// Open `size` connections. On failure the ones already opened are closed.
    pub async fn open<S>(store: &S, size: usize) -> DbResult<Self>
    where
        S: PlaceStore<Connection = C>,
    {
        let size = size.max(1);
        let mut idle = Vec::with_capacity(size);

        for _ in 0..size {
            match store.connect().await {
                Ok(conn) => idle.push(conn),
                Err(e) => {
                    for conn in idle {
                        let _ = conn.close().await;
                    }
                    return Err(e);
                }
            }
        }

        debug!("Opened {} database connections", size);
        Ok(Self { idle, size })
    }

    /// Number of connections the pool was built with
    pub fn size(&self) -> usize {
        self.size
    }

    /// The connection used for bookkeeping between ranks
    pub fn primary(&mut self) -> IndexResult<&mut C> {
        self.idle.first_mut().ok_or(IndexError::PoolCheckedOut)
    }

    /// Hand every connection out for one rank
    pub fn checkout(&mut self) -> Vec<C> {
        std::mem::take(&mut self.idle)
    }

    /// Return connections after a rank. The first returned connection
    /// becomes the primary one.
    pub fn checkin(&mut self, connections: Vec<C>) {
        if connections.len() != self.size {
            warn!(
                "{} of {} connections returned to the pool",
                connections.len(),
                self.size
            );
        }
        self.idle.extend(connections);
    }

    /// Close every pooled connection, rolling back any open transaction.
    /// Returns the first error after attempting to close all of them.
    pub async fn close(self) -> DbResult<()> {
        let mut first_error = None;
        let count = self.idle.len();
        for conn in self.idle {
            if let Err(e) = conn.close().await {
                warn!("Failed to close connection: {}", e);
                first_error.get_or_insert(e);
            }
        }
        debug!("Closed {} database connections", count);
        first_error.map_or(Ok(()), Err)
    }
}
