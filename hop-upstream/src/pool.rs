//! Pool of established session connections
//!
//! Setting up a DoT session costs a TCP and a TLS handshake, so finished
//! exchanges hand their connection back for the next query.
//!
//! # Staleness
//!
//! The pool never probes its connections. A peer may close an idle
//! connection at any time; the transport notices on the next write or read,
//! drops the connection and dials a replacement for the same exchange. The
//! replacement is returned to the pool afterwards, so the pool size stays
//! stable across such failures.
//!
//! # Usage
//!
//! ```rust
//! # async fn example() {
//! use hop_upstream::{ConnectionPool, PooledConnection};
//!
//! let pool = ConnectionPool::new(4, None);
//! assert!(pool.get().await.is_none());
//!
//! pool.put(PooledConnection::new("session")).await;
//! let conn = pool.get().await.unwrap();
//! assert_eq!(*conn.get_ref(), "session");
//! # }
//! ```

use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::time::Instant;

/// An established connection plus bookkeeping
#[derive(Debug)]
pub struct PooledConnection<S> {
    stream: S,
    created_at: Instant,
    last_used: Instant,
    alive: bool,
}

impl<S> PooledConnection<S> {
    pub fn new(stream: S) -> Self {
        let now = Instant::now();
        Self {
            stream,
            created_at: now,
            last_used: now,
            alive: true,
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// When the connection last went back into the pool
    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    /// False once an exchange on this connection failed
    pub fn is_alive(&self) -> bool {
        self.alive
    }

    /// Flag the connection as broken; the pool drops it on `put`
    pub fn mark_dead(&mut self) {
        self.alive = false;
    }
}

impl<S: AsyncWrite + Unpin> PooledConnection<S> {
    /// Shut the connection down without touching its bookkeeping
    pub async fn close(&mut self) -> std::io::Result<()> {
        self.stream.shutdown().await
    }
}

/// Bounded LIFO pool of idle connections
#[derive(Debug)]
pub struct ConnectionPool<S> {
    idle: Mutex<Vec<PooledConnection<S>>>,
    max_idle: usize,
    idle_timeout: Option<Duration>,
}

impl<S> ConnectionPool<S> {
    /// Create a pool keeping at most `max_idle` connections
    ///
    /// Connections idle for longer than `idle_timeout` are dropped instead of
    /// being handed out.
    pub fn new(max_idle: usize, idle_timeout: Option<Duration>) -> Self {
        Self {
            idle: Mutex::new(Vec::with_capacity(max_idle)),
            max_idle,
            idle_timeout,
        }
    }

    /// Take the most recently used idle connection, if any
    pub async fn get(&self) -> Option<PooledConnection<S>> {
        let mut idle = self.idle.lock().await;

        while let Some(conn) = idle.pop() {
            if let Some(timeout) = self.idle_timeout {
                if conn.idle_for() > timeout {
                    log::debug!("Dropping pooled connection idle for {:?}", conn.idle_for());
                    continue;
                }
            }
            return Some(conn);
        }

        None
    }

    /// Return a connection for reuse
    ///
    /// Dead connections and connections beyond capacity are dropped, which
    /// closes them.
    pub async fn put(&self, mut conn: PooledConnection<S>) {
        if !conn.is_alive() {
            log::debug!("Discarding broken connection");
            return;
        }

        conn.last_used = Instant::now();

        let mut idle = self.idle.lock().await;
        if idle.len() >= self.max_idle {
            log::debug!("Connection pool full ({}), closing connection", self.max_idle);
            return;
        }
        idle.push(conn);
    }

    /// Number of idle connections
    pub async fn len(&self) -> usize {
        self.idle.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.idle.lock().await.is_empty()
    }

    /// Maximum number of idle connections kept
    pub fn capacity(&self) -> usize {
        self.max_idle
    }

    /// Drop every idle connection
    pub async fn clear(&self) {
        self.idle.lock().await.clear();
    }
}
