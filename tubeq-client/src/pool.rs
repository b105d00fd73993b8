//! # Connection Pool
//!
//! Purpose: Share a bounded set of broker connections between concurrent
//! callers, dialing lazily and discarding connections whose transport broke.
//!
//! ## Design Principles
//! 1. **Token Pool Pattern**: A bounded queue holds exactly `capacity` slots.
//!    Each slot is a placeholder (permission to dial) or an idle connection.
//!    Taking a slot is checkout; putting one back is release.
//! 2. **Minimal Locking**: The queue and one atomic live counter are the only
//!    shared state. No mutex guards the connections.
//! 3. **Skip What Is Busy**: The idle sweep never blocks for a slot. A slot it
//!    cannot take right now is in use and is left for the next cycle.
//! 4. **Cooperative Shutdown**: The shutdown signal stops new checkouts and
//!    turns the sweep into a drain. Checked-out connections are closed when
//!    their owner releases them.
//!
//! ## Slot Lifecycle
//!
//! ```text
//!   Placeholder --acquire+dial--> CheckedOut --release(ok)--> Idle
//!        ^                            |  ^                      |
//!        +--release(network fault)----+  +-------acquire--------+
//!        +--------------evict (idle too long)-------------------+
//! ```

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender};
use crossbeam::select;

use crate::config::PoolConfig;
use crate::conn::Connection;
use crate::error::{ClientError, ClientResult, Fault};
use crate::shutdown::ShutdownSignal;

/// Poll period of the drain loop and of the maintenance thread when idle
/// eviction is disabled.
const DRAIN_POLL: Duration = Duration::from_secs(1);
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(1);

enum Slot {
    Placeholder,
    Idle(Connection),
}

struct PoolInner {
    config: PoolConfig,
    slots_tx: Sender<Slot>,
    slots_rx: Receiver<Slot>,
    /// Open connections, idle or checked out.
    active: AtomicUsize,
    shutdown: ShutdownSignal,
}

/// Connection pool handle. Clones share the same pool.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

/// Point-in-time pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStat {
    pub active: usize,
    pub capacity: usize,
}

impl fmt::Display for PoolStat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "active={}", self.active)
    }
}

impl ConnectionPool {
    /// Creates a pool of `capacity` slots for the broker at `addr`.
    ///
    /// `idle_timeout` of zero disables idle eviction.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize, idle_timeout: Duration, addr: impl Into<String>) -> Self {
        Self::with_config(PoolConfig {
            addr: addr.into(),
            capacity,
            idle_timeout,
            ..PoolConfig::default()
        })
    }

    /// Creates a pool with its own shutdown signal.
    pub fn with_config(config: PoolConfig) -> Self {
        Self::with_shutdown(config, ShutdownSignal::new())
    }

    /// Creates a pool bound to an externally owned shutdown signal.
    ///
    /// # Panics
    ///
    /// Panics if `config.capacity` is zero.
    pub fn with_shutdown(config: PoolConfig, shutdown: ShutdownSignal) -> Self {
        assert!(config.capacity > 0, "connection pool capacity must be non-zero");

        let (slots_tx, slots_rx) = channel::bounded(config.capacity);
        for _ in 0..config.capacity {
            // Cannot fail: the queue has room and we hold the receiver.
            let _ = slots_tx.try_send(Slot::Placeholder);
        }

        let idle_timeout = config.idle_timeout;
        let inner = Arc::new(PoolInner {
            config,
            slots_tx,
            slots_rx,
            active: AtomicUsize::new(0),
            shutdown: shutdown.clone(),
        });

        let weak = Arc::downgrade(&inner);
        let spawned = thread::Builder::new()
            .name("tubeq-pool-maint".to_string())
            .spawn(move || maintain(weak, shutdown, idle_timeout));
        if let Err(err) = spawned {
            tracing::error!(error = %err, "failed to start pool maintenance thread");
        }

        ConnectionPool { inner }
    }

    /// Checks out a connection, waiting up to `timeout` for a free slot.
    ///
    /// **Input**: `timeout` bounding the wait for a slot.
    /// **Output**: a checked-out connection, or `DeadlineExceeded`/`Shutdown`/
    /// the dial error.
    ///
    /// **Logic**:
    /// 1. Wait on the slot queue, the shutdown signal, and the timeout.
    /// 2. An idle connection is handed out as is.
    /// 3. A placeholder is counted live and dialed. A failed dial uncounts
    ///    it and puts the placeholder back, so capacity is never lost.
    pub fn acquire(&self, timeout: Duration) -> ClientResult<PooledConnection> {
        let inner = &self.inner;
        if inner.shutdown.is_raised() {
            return Err(ClientError::Shutdown);
        }

        let started = Instant::now();
        let slot = select! {
            recv(inner.slots_rx) -> slot => slot.map_err(|_| ClientError::Shutdown)?,
            recv(inner.shutdown.receiver()) -> _ => return Err(ClientError::Shutdown),
            default(timeout) => return Err(ClientError::DeadlineExceeded(timeout)),
        };

        // Both arms may have been ready; shutdown wins. Nothing is put back.
        if inner.shutdown.is_raised() {
            if let Slot::Idle(mut conn) = slot {
                conn.close();
                inner.forget_one();
            }
            return Err(ClientError::Shutdown);
        }

        let conn = match slot {
            Slot::Idle(conn) => conn,
            Slot::Placeholder => {
                inner.active.fetch_add(1, Ordering::SeqCst);
                match inner.dial(timeout.saturating_sub(started.elapsed())) {
                    Ok(conn) => conn,
                    Err(err) => {
                        inner.forget_one();
                        inner.put_slot(Slot::Placeholder);
                        return Err(err);
                    }
                }
            }
        };

        Ok(PooledConnection {
            pool: inner.clone(),
            conn: Some(conn),
        })
    }

    /// Returns a connection to the pool.
    ///
    /// Healthy connections go back as idle; connections with a network fault
    /// are closed and replaced by a placeholder; after shutdown every
    /// connection is closed. Dropping the guard does the same.
    ///
    /// # Panics
    ///
    /// Panics if `conn` was checked out of a different pool.
    pub fn release(&self, conn: PooledConnection) {
        assert!(
            Arc::ptr_eq(&self.inner, &conn.pool),
            "connection released into a pool that did not create it"
        );
        drop(conn);
    }

    /// Raises the pool's shutdown signal.
    pub fn shutdown(&self) {
        self.inner.shutdown.raise();
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.is_raised()
    }

    /// Number of open connections, idle or checked out.
    pub fn active(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    pub fn capacity(&self) -> usize {
        self.inner.config.capacity
    }

    pub fn stat(&self) -> PoolStat {
        PoolStat {
            active: self.active(),
            capacity: self.capacity(),
        }
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("addr", &self.inner.config.addr)
            .field("stat", &self.stat())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

impl PoolInner {
    /// Dials within what is left of the acquire budget. A spent budget still
    /// gets the full dial timeout so zero-timeout acquires can open slots.
    fn dial(&self, remaining: Duration) -> ClientResult<Connection> {
        let budget = if remaining.is_zero() {
            self.config.dial_timeout
        } else {
            self.config.dial_timeout.min(remaining)
        };
        match Connection::open_with(&self.config, budget) {
            Ok(conn) => {
                tracing::debug!(addr = %self.config.addr, active = self.active.load(Ordering::SeqCst), "dialed broker");
                Ok(conn)
            }
            Err(err) => {
                tracing::warn!(addr = %self.config.addr, error = %err, "broker dial failed");
                Err(err)
            }
        }
    }

    /// Deducts one closed connection from the live count.
    fn forget_one(&self) -> usize {
        self.active.fetch_sub(1, Ordering::SeqCst) - 1
    }

    fn put_slot(&self, slot: Slot) {
        // One slot was taken per outstanding checkout, so there is always room.
        if self.slots_tx.try_send(slot).is_err() {
            tracing::error!(addr = %self.config.addr, "pool slot queue overfilled; slot dropped");
            debug_assert!(false, "pool slot queue overfilled");
        }
    }

    fn give_back(&self, mut conn: Connection) {
        if self.shutdown.is_raised() {
            conn.close();
            let active = self.forget_one();
            tracing::debug!(active, "closed connection released after shutdown");
            return;
        }

        if conn.fault() == Fault::Network {
            conn.close();
            let active = self.forget_one();
            tracing::warn!(addr = %self.config.addr, active, "discarded connection with network fault");
            self.put_slot(Slot::Placeholder);
            return;
        }

        conn.reset_for_reuse();
        self.put_slot(Slot::Idle(conn));
    }

    /// Closes idle connections older than `idle_timeout`, without waiting for
    /// any slot. Stops at the first slot that is not immediately available.
    fn evict_idle(&self, idle_timeout: Duration) {
        for _ in 0..self.config.capacity {
            let slot = match self.slots_rx.try_recv() {
                Ok(slot) => slot,
                Err(_) => break,
            };
            let slot = match slot {
                Slot::Idle(mut conn) if conn.idle_for() > idle_timeout => {
                    conn.close();
                    let active = self.forget_one();
                    tracing::debug!(addr = %self.config.addr, active, "evicted idle connection");
                    Slot::Placeholder
                }
                other => other,
            };
            self.put_slot(slot);
        }
    }

    /// Closes every idle connection that comes through the queue.
    ///
    /// Returns `true` once the live count is zero; `false` if nothing arrived
    /// within `poll`.
    fn drain_step(&self, poll: Duration) -> bool {
        if self.active.load(Ordering::SeqCst) == 0 {
            return true;
        }
        select! {
            recv(self.slots_rx) -> slot => {
                if let Ok(Slot::Idle(mut conn)) = slot {
                    conn.close();
                    self.forget_one();
                }
            },
            default(poll) => {},
        }
        self.active.load(Ordering::SeqCst) == 0
    }
}

fn maintain(pool: Weak<PoolInner>, shutdown: ShutdownSignal, idle_timeout: Duration) {
    let tick = if idle_timeout.is_zero() {
        DRAIN_POLL
    } else {
        (idle_timeout / 10).max(MIN_SWEEP_INTERVAL)
    };

    loop {
        let raised = select! {
            recv(shutdown.receiver()) -> _ => true,
            default(tick) => false,
        };
        if raised {
            break;
        }
        let Some(inner) = pool.upgrade() else { return };
        if !idle_timeout.is_zero() {
            inner.evict_idle(idle_timeout);
        }
    }

    loop {
        let Some(inner) = pool.upgrade() else { return };
        if inner.drain_step(DRAIN_POLL) {
            tracing::info!(addr = %inner.config.addr, "connection pool drained");
            return;
        }
    }
}

/// Checked-out connection. Returns itself to the pool on drop.
pub struct PooledConnection {
    pool: Arc<PoolInner>,
    conn: Option<Connection>,
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection exists")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection exists")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.give_back(conn);
        }
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PooledConnection").field(&self.conn).finish()
    }
}
