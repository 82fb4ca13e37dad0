//! # Fleet Controller
//!
//! Purpose: the public facade. Routes every key through the current ring,
//! retries transport failures against fresh connections, and keeps the
//! ring's view of server liveness current via a background health thread.
//!
//! ## Design Principles
//! 1. **Read Lock For The Whole Retry Loop**: one `RwLock::read()` is taken
//!    before the retry loop starts and held across all [`BAD_TRY_CNT`]
//!    attempts — a ring rebuild can't happen mid-operation and hand an
//!    operation two different ideas of who owns a key.
//! 2. **Write Lock Only For The Swap**: the health thread holds the write
//!    lock only long enough to replace the `Arc<Ring>` pointer; no I/O ever
//!    happens while it's held.
//! 3. **Bad Connections Evict, Server Errors Don't**: a transport failure
//!    destroys the connection and retries; a server-returned status (key
//!    not found, item exists, ...) is returned to the caller immediately —
//!    it's a correct answer, not a reason to retry.
//! 4. **Options Structs, Not Variadics**: Rust has no variadic arguments;
//!    the source's `expire ...uint32` / `cas ...uint64` trailing optional
//!    arguments become `#[derive(Default)]` options structs instead.
//! 5. **Health Is Opt-In**: no channel or thread exists until the caller
//!    calls `set_remove_bad_server(true)` — a client that never asks for
//!    health monitoring never opens a background connection to any server.

use std::sync::mpsc::{sync_channel, SyncSender};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Mutex, RwLock};
use tracing::warn;

use crate::config::{Timeouts, BAD_TRY_CNT};
use crate::conn::Connection;
use crate::error::{ClientError, ClientResult};
use crate::health;
use crate::ring::{Ring, ServerHandle, ServerSpec};
use crate::value::Value;
use crate::wire::Opcode;

/// Options for `Set`/`Add`/`Replace`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreOpts {
    pub expiration: u32,
    pub cas: u64,
}

/// Options for `Increment`/`Decrement`.
#[derive(Debug, Clone, Copy)]
pub struct NumericOpts {
    pub delta: u64,
    pub cas: u64,
}

impl Default for NumericOpts {
    fn default() -> Self {
        NumericOpts { delta: 1, cas: 0 }
    }
}

/// Options for `Delete`/`Append`/`Prepend`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CasOpts {
    pub cas: u64,
}

/// The health channel/thread pair, held only while health monitoring is
/// enabled.
struct HealthHandle {
    tx: SyncSender<()>,
    thread: JoinHandle<()>,
}

/// A fleet of memcached servers addressed through one weighted Ketama
/// ring, with pooled connections and opt-in background health probing.
pub struct MemcacheClient {
    servers: Arc<Vec<Arc<ServerHandle>>>,
    ring: Arc<RwLock<Arc<Ring>>>,
    timeouts: Timeouts,
    health: Mutex<Option<HealthHandle>>,
}

impl MemcacheClient {
    /// Builds the fleet and dials nothing eagerly beyond each server's
    /// pre-warmed pool. No health thread runs until `set_remove_bad_server`
    /// is called — see §4.E.
    pub fn new(specs: Vec<ServerSpec>, timeouts: Timeouts) -> ClientResult<MemcacheClient> {
        if specs.is_empty() {
            return Err(ClientError::NoServer);
        }

        let handles: Vec<Arc<ServerHandle>> = specs
            .into_iter()
            .map(|spec| Arc::new(ServerHandle::new(spec)))
            .collect();
        let servers = Arc::new(handles);

        let ring = Arc::new(RwLock::new(Arc::new(Ring::build(&servers))));

        Ok(MemcacheClient {
            servers,
            ring,
            timeouts,
            health: Mutex::new(None),
        })
    }

    /// Enables or disables the background health controller. `true` creates
    /// the capacity-1 event channel and starts the probe thread (a no-op if
    /// already running); `false` stops it (a no-op if already stopped).
    /// While disabled, a dead server's `active` flag and the ring never
    /// change on their own — transport failures just keep happening and
    /// retrying, as if no health path existed at all.
    pub fn set_remove_bad_server(&self, enable: bool) {
        let mut guard = self.health.lock();
        match (enable, guard.take()) {
            (true, Some(existing)) => *guard = Some(existing),
            (true, None) => {
                // Capacity-1, non-blocking: a burst of bad-connection
                // signals coalesces into a single pending probe.
                let (tx, rx) = sync_channel(1);
                let thread = health::spawn(
                    Arc::clone(&self.servers),
                    Arc::clone(&self.ring),
                    self.timeouts,
                    rx,
                );
                *guard = Some(HealthHandle { tx, thread });
            }
            (false, Some(existing)) => {
                drop(existing.tx);
                if existing.thread.join().is_err() {
                    warn!("health thread panicked during shutdown");
                }
            }
            (false, None) => {}
        }
    }

    fn notify_health(&self) {
        // try_send: a pending probe already covers this signal; if health
        // monitoring was never enabled there's no sender to send on.
        if let Some(handle) = self.health.lock().as_ref() {
            let _ = handle.tx.try_send(());
        }
    }

    fn route(&self, ring: &Ring, key: &[u8]) -> ClientResult<Arc<ServerHandle>> {
        ring.lookup(key).ok_or(ClientError::NoServer)
    }

    /// Runs `op` against the server that owns `key`, retrying up to
    /// [`BAD_TRY_CNT`] times against fresh connections on transport
    /// failure. Holds one ring read lock across every attempt.
    fn with_retry<T>(
        &self,
        key: &[u8],
        op: impl Fn(&mut Connection) -> ClientResult<T>,
    ) -> ClientResult<T> {
        let ring = self.ring.read();
        let server = self.route(&ring, key)?;

        let mut last_err = ClientError::NoServer;
        for attempt in 0..BAD_TRY_CNT {
            let pool = server.pool(self.timeouts);
            let mut conn = match pool.acquire() {
                Ok(conn) => conn,
                Err(err) => {
                    if err.is_not_connected() {
                        self.notify_health();
                    }
                    last_err = err;
                    continue;
                }
            };

            match op(&mut conn) {
                Err(err) if err.is_bad_connection() => {
                    pool.release();
                    self.notify_health();
                    last_err = err;
                    if attempt + 1 == BAD_TRY_CNT {
                        return Err(last_err);
                    }
                }
                Err(err) => {
                    pool.put(conn);
                    return Err(err);
                }
                Ok(value) => {
                    pool.put(conn);
                    return Ok(value);
                }
            }
        }
        Err(last_err)
    }

    pub fn get(&self, key: &[u8]) -> ClientResult<(Value, u64)> {
        self.with_retry(key, |conn| conn.get(key))
    }

    pub fn set(&self, key: &[u8], value: &Value, opts: StoreOpts) -> ClientResult<()> {
        self.with_retry(key, |conn| {
            conn.store(Opcode::Set, key, value, opts.expiration, opts.cas)
        })
    }

    pub fn add(&self, key: &[u8], value: &Value, opts: StoreOpts) -> ClientResult<()> {
        self.with_retry(key, |conn| {
            conn.store(Opcode::Add, key, value, opts.expiration, opts.cas)
        })
    }

    pub fn replace(&self, key: &[u8], value: &Value, opts: StoreOpts) -> ClientResult<()> {
        self.with_retry(key, |conn| {
            conn.store(Opcode::Replace, key, value, opts.expiration, opts.cas)
        })
    }

    pub fn delete(&self, key: &[u8], opts: CasOpts) -> ClientResult<()> {
        self.with_retry(key, |conn| conn.delete(key, opts.cas))
    }

    pub fn increment(&self, key: &[u8], opts: NumericOpts) -> ClientResult<u64> {
        self.with_retry(key, |conn| {
            conn.numeric(Opcode::Increment, key, opts.delta, opts.cas)
        })
    }

    pub fn decrement(&self, key: &[u8], opts: NumericOpts) -> ClientResult<u64> {
        self.with_retry(key, |conn| {
            conn.numeric(Opcode::Decrement, key, opts.delta, opts.cas)
        })
    }

    pub fn append(&self, key: &[u8], value: &[u8], opts: CasOpts) -> ClientResult<()> {
        self.with_retry(key, |conn| conn.append(Opcode::Append, key, value, opts.cas))
    }

    pub fn prepend(&self, key: &[u8], value: &[u8], opts: CasOpts) -> ClientResult<()> {
        self.with_retry(key, |conn| conn.append(Opcode::Prepend, key, value, opts.cas))
    }

    /// Flushes every key on the server that owns `key`. The source flushes
    /// one connected server at a time; fleet-wide flush is a caller-side
    /// loop over [`MemcacheClient::server_addresses`].
    pub fn flush(&self, key: &[u8], delay: u32) -> ClientResult<()> {
        self.with_retry(key, |conn| conn.flush_all(delay))
    }

    /// Queries one server directly by address, bypassing the ring.
    pub fn version(&self, address: &str) -> ClientResult<String> {
        let server = self
            .servers
            .iter()
            .find(|s| s.address() == address)
            .ok_or(ClientError::InvalidAddress)?;

        let pool = server.pool(self.timeouts);
        let mut conn = pool.acquire()?;
        match conn.version() {
            Ok(version) => {
                pool.put(conn);
                Ok(version)
            }
            Err(err) => {
                if err.is_bad_connection() {
                    pool.release();
                    self.notify_health();
                }
                Err(err)
            }
        }
    }

    /// Addresses of every configured server, active or not.
    pub fn server_addresses(&self) -> Vec<String> {
        self.servers.iter().map(|s| s.address().to_string()).collect()
    }

    /// True once the health thread has observed this server respond.
    pub fn is_server_active(&self, address: &str) -> bool {
        self.servers
            .iter()
            .find(|s| s.address() == address)
            .map(|s| s.is_active())
            .unwrap_or(false)
    }

    /// Stops the health thread (if running) and closes every server's
    /// pool. Also runs implicitly on drop; exposed explicitly so callers
    /// can observe shutdown completing (e.g. before a process exits)
    /// rather than relying on drop order.
    pub fn close(self) {
        self.shutdown();
    }

    fn shutdown(&self) {
        // Dropping the sender first lets the health thread's blocking
        // recv return `Disconnected` and exit its loop.
        if let Some(handle) = self.health.lock().take() {
            drop(handle.tx);
            if handle.thread.join().is_err() {
                warn!("health thread panicked during shutdown");
            }
        }
        for server in self.servers.iter() {
            server.reset_pool();
        }
    }
}

impl Drop for MemcacheClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}
