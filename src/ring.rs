//! # Weighted Ketama Ring
//!
//! Purpose: map cache keys onto servers with weighted consistent hashing,
//! so adding or removing a server only reshuffles the minority of keys
//! that landed on its virtual nodes.
//!
//! ## Design Principles
//! 1. **Faithful Hash Derivation**: each server contributes
//!    `ceil(40 * server_count * weight / total_weight)` Ketama points; each
//!    point's MD5 digest is reinterpreted as four little-endian `u32`
//!    positions, exactly as the source derives them — changing the byte
//!    order or the `40` constant would silently redistribute every key.
//! 2. **Deliberately Nonstandard CRC32**: key lookup hashes with a CRC32
//!    variant seeded from polynomial `0xFFFFFFFF`, not the IEEE polynomial.
//!    This doesn't matter for correctness — only internal determinism is
//!    required — but it must match exactly, or two ring builds from the
//!    same input would disagree.
//! 3. **Immutable Once Built**: a `Ring` is never mutated after
//!    [`build_ring`] returns it; the controller swaps the whole `Arc`
//!    instead.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crc::{Algorithm, Crc};
use md5::{Digest, Md5};
use parking_lot::Mutex;

use crate::config::{Timeouts, DEFAULT_IDLE_TIME, DEFAULT_INIT_CONN, DEFAULT_MAX_CONN};
use crate::pool::ConnectionPool;

/// Virtual points contributed per server before weighting, divided by 4
/// because each MD5 digest yields 4 positions at once.
const VIRTUAL_NODE_PER: u32 = 160;

/// The source's `crc32.MakeTable(0xFFFFFFFF)`: a CRC-32 variant seeded
/// with polynomial `0xFFFFFFFF` instead of the IEEE polynomial
/// `0x04C11DB7`. Reflected in/out and the `0xFFFFFFFF` init/xorout match
/// IEEE CRC-32; only the polynomial itself differs.
const QUIRKY_CRC32: Algorithm<u32> = Algorithm {
    width: 32,
    poly: 0xFFFF_FFFF,
    init: 0xFFFF_FFFF,
    refin: true,
    refout: true,
    xorout: 0xFFFF_FFFF,
    check: 0,
    residue: 0,
};

fn crc32_quirky(data: &[u8]) -> u32 {
    let crc = Crc::<u32>::new(&QUIRKY_CRC32);
    crc.checksum(data)
}

/// Caller-supplied configuration for one server in the fleet.
#[derive(Debug, Clone)]
pub struct ServerSpec {
    pub address: String,
    pub weight: u32,
    pub max_conn: usize,
    pub init_conn: usize,
    pub idle_time: Duration,
}

impl ServerSpec {
    pub fn new(address: impl Into<String>) -> ServerSpec {
        ServerSpec {
            address: address.into(),
            weight: 1,
            max_conn: DEFAULT_MAX_CONN,
            init_conn: DEFAULT_INIT_CONN,
            idle_time: DEFAULT_IDLE_TIME,
        }
    }

    pub fn weight(mut self, weight: u32) -> ServerSpec {
        self.weight = weight.max(1);
        self
    }

    pub fn max_conn(mut self, max_conn: usize) -> ServerSpec {
        self.max_conn = max_conn;
        self
    }

    pub fn init_conn(mut self, init_conn: usize) -> ServerSpec {
        self.init_conn = init_conn;
        self
    }

    pub fn idle_time(mut self, idle_time: Duration) -> ServerSpec {
        self.idle_time = idle_time;
        self
    }
}

/// Runtime state for one server: its connection pool and liveness flag.
///
/// Outlives any single `Ring` — the controller keeps one `ServerHandle`
/// per configured address across ring rebuilds, swapping only the
/// ring's view of which handles currently own positions.
pub struct ServerHandle {
    pub spec: ServerSpec,
    pub active: AtomicBool,
    pool: Mutex<Option<Arc<ConnectionPool>>>,
}

impl ServerHandle {
    pub fn new(spec: ServerSpec) -> ServerHandle {
        ServerHandle {
            spec,
            active: AtomicBool::new(true),
            pool: Mutex::new(None),
        }
    }

    pub fn address(&self) -> &str {
        &self.spec.address
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    /// Lazily dials the pool on first use, matching the source's
    /// `if s.pool == nil` guard in `createServerNode`. Returns a cloned
    /// `Arc`, not a held guard — the per-handle lock only protects the
    /// lazy-init check, never the (potentially blocking) pool operations
    /// callers run afterward.
    pub fn pool(&self, timeouts: Timeouts) -> Arc<ConnectionPool> {
        let mut guard = self.pool.lock();
        if guard.is_none() {
            *guard = Some(Arc::new(ConnectionPool::new(
                self.spec.address.clone(),
                self.spec.max_conn,
                self.spec.init_conn,
                self.spec.idle_time,
                timeouts,
            )));
        }
        Arc::clone(guard.as_ref().unwrap())
    }

    /// Tears down the pool so a future `pool()` call redials fresh
    /// connections, used when a server flips from dead back to alive.
    pub fn reset_pool(&self) {
        let mut guard = self.pool.lock();
        if let Some(pool) = guard.take() {
            pool.close();
        }
    }
}

/// An immutable weighted-Ketama view over the currently active servers.
pub struct Ring {
    positions: Vec<u32>,
    owners: HashMap<u32, Arc<ServerHandle>>,
}

impl Ring {
    /// Builds a ring from the given active handles. An empty input yields
    /// a ring that resolves every key to `None`.
    pub fn build(servers: &[Arc<ServerHandle>]) -> Ring {
        if servers.is_empty() {
            return Ring {
                positions: Vec::new(),
                owners: HashMap::new(),
            };
        }

        let total_weight: u64 = servers.iter().map(|s| s.spec.weight as u64).sum();
        let total_points = (VIRTUAL_NODE_PER / 4) as u64 * servers.len() as u64;

        let mut positions = Vec::new();
        let mut owners = HashMap::new();

        for server in servers {
            let point_cnt = ((total_points * server.spec.weight as u64) as f64
                / total_weight as f64)
                .ceil() as u32;

            for i in 0..point_cnt {
                for position in ketama_positions(server.address(), i) {
                    owners.insert(position, Arc::clone(server));
                    positions.push(position);
                }
            }
        }

        positions.sort_unstable();
        let leading_zeros = positions.iter().take_while(|&&p| p == 0).count();
        positions.drain(..leading_zeros);

        Ring { positions, owners }
    }

    /// Routes a key to its owning server via CRC32 + bisection, wrapping
    /// past the end of the ring back to its first position.
    pub fn lookup(&self, key: &[u8]) -> Option<Arc<ServerHandle>> {
        if self.positions.is_empty() {
            return None;
        }

        let hash = crc32_quirky(key);
        let position = if hash > *self.positions.last().unwrap() {
            self.positions[0]
        } else {
            let idx = self.positions.partition_point(|&p| p < hash);
            self.positions[idx]
        };

        self.owners.get(&position).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

/// One Ketama point: `address#i`'s MD5 digest reinterpreted as four
/// little-endian `u32`s.
fn ketama_positions(address: &str, i: u32) -> [u32; 4] {
    let input = format!("{address}#{i}");
    let digest = Md5::digest(input.as_bytes());

    let mut out = [0u32; 4];
    for (n, slot) in out.iter_mut().enumerate() {
        let base = n * 4;
        *slot = u32::from_le_bytes([
            digest[base],
            digest[base + 1],
            digest[base + 2],
            digest[base + 3],
        ]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(address: &str, weight: u32) -> Arc<ServerHandle> {
        Arc::new(ServerHandle::new(ServerSpec::new(address).weight(weight)))
    }

    #[test]
    fn routes_deterministically() {
        let servers = vec![handle("10.0.0.1:11211", 1), handle("10.0.0.2:11211", 1)];
        let ring = Ring::build(&servers);

        let first = ring.lookup(b"some-key").unwrap();
        let second = ring.lookup(b"some-key").unwrap();
        assert_eq!(first.address(), second.address());
    }

    #[test]
    fn empty_ring_resolves_nothing() {
        let ring = Ring::build(&[]);
        assert!(ring.is_empty());
        assert!(ring.lookup(b"anything").is_none());
    }

    #[test]
    fn heavier_weight_claims_more_keys() {
        let servers = vec![handle("10.0.0.1:11211", 1), handle("10.0.0.2:11211", 9)];
        let ring = Ring::build(&servers);

        let mut heavy_hits = 0;
        for i in 0..2000u32 {
            let key = format!("key-{i}");
            if let Some(owner) = ring.lookup(key.as_bytes()) {
                if owner.address() == "10.0.0.2:11211" {
                    heavy_hits += 1;
                }
            }
        }
        assert!(heavy_hits > 1200, "expected heavier server to win most keys, got {heavy_hits}");
    }

    /// §8 property 2: removing one server out of four equally-weighted
    /// servers should remap roughly `1/|servers|` of a large random
    /// keyspace, within generous statistical tolerance.
    #[test]
    fn removing_a_server_remaps_roughly_its_share() {
        use rand::Rng;

        let addrs = ["10.0.0.1:11211", "10.0.0.2:11211", "10.0.0.3:11211", "10.0.0.4:11211"];
        let servers: Vec<_> = addrs.iter().map(|a| handle(a, 1)).collect();
        let full_ring = Ring::build(&servers);
        let reduced_ring = Ring::build(&servers[..3]);

        let mut rng = rand::thread_rng();
        let keys: Vec<Vec<u8>> = (0..20_000)
            .map(|_| {
                let n: u64 = rng.gen();
                format!("random-key-{n}").into_bytes()
            })
            .collect();

        let mut remapped = 0;
        for key in &keys {
            let before = full_ring.lookup(key).map(|s| s.address().to_string());
            let after = reduced_ring.lookup(key).map(|s| s.address().to_string());
            if before != after {
                remapped += 1;
            }
        }

        let fraction = remapped as f64 / keys.len() as f64;
        // Expected ~0.25 (1/4 servers); allow a wide band for ring variance.
        assert!(
            fraction > 0.10 && fraction < 0.45,
            "expected roughly 1/4 of keys to remap, got {fraction}"
        );
    }

    /// §8 property 6: per-server hit frequency over a random keyspace
    /// tracks each server's share of total weight.
    #[test]
    fn lookup_frequency_tracks_weight_share() {
        use rand::Rng;

        let servers = vec![
            handle("10.0.0.1:11211", 50),
            handle("10.0.0.2:11211", 20),
            handle("10.0.0.3:11211", 20),
            handle("10.0.0.4:11211", 10),
        ];
        let total_weight = 100.0;
        let ring = Ring::build(&servers);

        let mut rng = rand::thread_rng();
        let mut hits: HashMap<String, u32> = HashMap::new();
        let samples = 50_000;
        for _ in 0..samples {
            let n: u64 = rng.gen();
            let key = format!("freq-key-{n}");
            if let Some(owner) = ring.lookup(key.as_bytes()) {
                *hits.entry(owner.address().to_string()).or_insert(0) += 1;
            }
        }

        for server in &servers {
            let expected = server.spec.weight as f64 / total_weight;
            let observed = *hits.get(server.address()).unwrap_or(&0) as f64 / samples as f64;
            assert!(
                (observed - expected).abs() < 0.05,
                "server {} expected share {expected}, observed {observed}",
                server.address()
            );
        }
    }
}
