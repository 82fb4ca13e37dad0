//! # Background Health Probing
//!
//! Purpose: keep each server's liveness flag current and rebuild the ring
//! whenever that changes, without blocking any caller's request path.
//!
//! ## Design Principles
//! 1. **Event-Driven, With A Floor**: a bad-connection signal wakes the
//!    thread immediately; absent any signal it still probes every
//!    [`HEALTH_POLL_INTERVAL`], so a server that comes back on its own
//!    (without ever failing a client request) is still detected.
//! 2. **Probe Every Server, Active Or Not**: a currently-active server can
//!    go dark between probes just as easily as a dead one can recover, so
//!    both get probed every pass.
//! 3. **Pool Probe First, Raw Dial As Fallback**: probing through the pool
//!    reuses a real connection and catches a half-dead peer that accepts
//!    TCP connections but won't answer; if the pool can't produce a
//!    connection (e.g. transiently saturated) a direct dial distinguishes
//!    "server is down" from "pool was busy" before declaring the server
//!    dead.
//! 4. **Swap, Don't Mutate**: a rebuilt ring is installed by replacing the
//!    `Arc` under the write lock, never by mutating the ring callers might
//!    be reading from concurrently.

use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::config::{Timeouts, HEALTH_POLL_INTERVAL};
use crate::conn::Connection;
use crate::ring::{Ring, ServerHandle};

/// Starts the background probing thread; returns its join handle. Only
/// ever called while health monitoring is enabled — see
/// `MemcacheClient::set_remove_bad_server`.
pub(crate) fn spawn(
    servers: Arc<Vec<Arc<ServerHandle>>>,
    ring: Arc<RwLock<Arc<Ring>>>,
    timeouts: Timeouts,
    rx: Receiver<()>,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name("mc-client-health".to_string())
        .spawn(move || loop {
            match rx.recv_timeout(HEALTH_POLL_INTERVAL) {
                Ok(()) => debug!("health probe woken by bad-connection signal"),
                Err(RecvTimeoutError::Timeout) => debug!("health probe woken by poll interval"),
                Err(RecvTimeoutError::Disconnected) => return,
            }

            // Drain any further coalesced signals that arrived while this
            // pass was already queued to run.
            while rx.try_recv().is_ok() {}

            probe_once(&servers, &ring, timeouts);
        })
        .expect("failed to spawn health thread")
}

fn probe_once(servers: &[Arc<ServerHandle>], ring: &RwLock<Arc<Ring>>, timeouts: Timeouts) {
    let mut flipped = false;

    thread::scope(|scope| {
        let handles: Vec<_> = servers
            .iter()
            .map(|server| scope.spawn(move || (server, probe_server(server, timeouts))))
            .collect();

        for handle in handles {
            let (server, alive) = handle.join().unwrap_or((&servers[0], false));
            if server.is_active() != alive {
                info!(address = server.address(), alive, "server liveness changed");
                server.set_active(alive);
                if alive {
                    // Coming back from dead: drop any stale pooled
                    // connections so the next acquire dials fresh.
                    server.reset_pool();
                }
                flipped = true;
            }
        }
    });

    if flipped {
        // Inactive servers are absent from the ring (§3 invariant) whenever
        // the health controller is the one doing the rebuilding.
        let active: Vec<Arc<ServerHandle>> =
            servers.iter().filter(|s| s.is_active()).cloned().collect();

        let rebuilt = Arc::new(Ring::build(&active));
        *ring.write() = rebuilt;
        info!(server_count = active.len(), "ring rebuilt after liveness change");
    }
}

/// Returns whether `server` answered a `Noop` within its timeouts.
fn probe_server(server: &ServerHandle, timeouts: Timeouts) -> bool {
    {
        let pool = server.pool(timeouts);
        match pool.acquire() {
            Ok(mut conn) => {
                if conn.noop().is_ok() {
                    pool.put(conn);
                    return true;
                }
                pool.release();
            }
            Err(_) => {}
        }
    }

    // Pool couldn't produce a working connection; rule out saturation by
    // dialing directly and discarding the result either way.
    match Connection::connect(server.address(), timeouts) {
        Ok(mut conn) => conn.noop().is_ok(),
        Err(_) => false,
    }
}
