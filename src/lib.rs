//! # mc-client
//!
//! A synchronous client for the memcached binary protocol: keys route
//! through a weighted Ketama ring, requests run over per-server pooled
//! connections, and a background thread probes server health and keeps
//! the ring current.
//!
//! ```no_run
//! use mc_client::{MemcacheClient, ServerSpec, StoreOpts, Timeouts, Value};
//!
//! let client = MemcacheClient::new(
//!     vec![
//!         ServerSpec::new("127.0.0.1:11211").weight(1),
//!         ServerSpec::new("127.0.0.1:11212").weight(2),
//!     ],
//!     Timeouts::default(),
//! )?;
//!
//! client.set(b"greeting", &Value::from("hello"), StoreOpts::default())?;
//! let (value, _cas) = client.get(b"greeting")?;
//! assert_eq!(value, Value::from("hello"));
//! # Ok::<(), mc_client::ClientError>(())
//! ```

mod client;
mod config;
mod conn;
mod error;
mod health;
mod pool;
mod ring;
mod value;
mod wire;

pub use client::{CasOpts, MemcacheClient, NumericOpts, StoreOpts};
pub use config::Timeouts;
pub use error::{ClientError, ClientResult};
pub use ring::ServerSpec;
pub use value::{Value, ValueKind};
pub use wire::Opcode;
