//! # Per-Server Connection Pool
//!
//! Purpose: hand out exclusive [`Connection`]s to one server, bounded by a
//! maximum concurrent count, reusing idle connections and discarding ones
//! that have sat unused too long.
//!
//! ## Design Principles
//! 1. **Reserve Before Dial**: a slot against `max_conn` is claimed under
//!    the lock *before* the network dial happens outside it — the lock is
//!    never held across I/O, but the total-count accounting stays correct
//!    even when many callers race to grow the pool.
//! 2. **Idle Expiry On Borrow**: a connection pulled from the idle queue
//!    whose `last_active` predates `idle_time` is dropped and replaced by
//!    a fresh dial, rather than handed to the caller stale.
//! 3. **Blocking, Not Failing, When Saturated**: once `total` has reached
//!    `max_conn`, `acquire` waits on the condvar for a peer to return a
//!    connection instead of returning [`ClientError::PoolExhausted`] — that
//!    variant exists for completeness but this pool never produces it.
//! 4. **FIFO, Not LIFO**: idle connections come back out in the order they
//!    went in (`VecDeque::push_back`/`pop_front`), so every idle connection
//!    eventually surfaces to the idle-expiry check in `acquire` instead of
//!    one sitting at the bottom of a stack forever.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::conn::Connection;
use crate::config::Timeouts;
use crate::error::ClientResult;

struct Shared {
    idle: VecDeque<Connection>,
    total: usize,
}

/// Bounded pool of connections to a single server address.
pub struct ConnectionPool {
    address: String,
    max_conn: usize,
    idle_time: Duration,
    timeouts: Timeouts,
    state: Mutex<Shared>,
    available: Condvar,
}

impl ConnectionPool {
    /// Builds a pool and pre-warms `init_conn` connections, silently
    /// discarding dial failures — a server that's down at startup is
    /// allowed to come up later and get picked up by the health probe.
    pub fn new(
        address: impl Into<String>,
        max_conn: usize,
        init_conn: usize,
        idle_time: Duration,
        timeouts: Timeouts,
    ) -> ConnectionPool {
        let address = address.into();
        let mut idle = VecDeque::with_capacity(init_conn.min(max_conn));
        for _ in 0..init_conn.min(max_conn) {
            if let Ok(conn) = Connection::connect(&address, timeouts) {
                idle.push_back(conn);
            }
        }
        let total = idle.len();

        ConnectionPool {
            address,
            max_conn: max_conn.max(1),
            idle_time,
            timeouts,
            state: Mutex::new(Shared { idle, total }),
            available: Condvar::new(),
        }
    }

    /// Borrows a connection, blocking if the pool is saturated and empty.
    pub fn acquire(&self) -> ClientResult<Connection> {
        loop {
            let mut state = self.state.lock();

            if let Some(conn) = state.idle.pop_front() {
                if self.idle_time.is_zero() || conn.last_active.elapsed() < self.idle_time {
                    return Ok(conn);
                }
                // Expired: drop it and account for the vacated slot, then
                // fall through to dial a replacement.
                state.total -= 1;
            }

            if state.total < self.max_conn {
                state.total += 1;
                drop(state);

                match Connection::connect(&self.address, self.timeouts) {
                    Ok(conn) => return Ok(conn),
                    Err(err) => {
                        let mut state = self.state.lock();
                        state.total -= 1;
                        self.available.notify_one();
                        return Err(err);
                    }
                }
            }

            // Saturated: wait for a peer to return or release a connection.
            self.available.wait(&mut state);
        }
    }

    /// Returns a healthy connection to the idle queue.
    pub fn put(&self, mut conn: Connection) {
        conn.last_active = Instant::now();
        let mut state = self.state.lock();
        state.idle.push_back(conn);
        drop(state);
        self.available.notify_one();
    }

    /// Destroys a connection that failed mid-exchange, releasing its slot.
    pub fn release(&self) {
        let mut state = self.state.lock();
        state.total = state.total.saturating_sub(1);
        drop(state);
        self.available.notify_one();
    }

    /// Drops every idle connection and resets accounting. Call when a
    /// server goes inactive or the ring rebuilds around it.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.idle.clear();
        state.total = 0;
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}
