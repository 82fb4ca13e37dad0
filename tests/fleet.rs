//! Integration tests against a minimal in-process binary-protocol server.
//!
//! The fake server understands just enough of the wire format (GET, SET,
//! DELETE, INCREMENT, DECREMENT, APPEND, PREPEND, NOOP) to exercise the
//! fleet controller, the pool, and ring routing end-to-end without a real
//! memcached running.

use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use mc_client::{CasOpts, MemcacheClient, NumericOpts, ServerSpec, StoreOpts, Timeouts, Value};

/// Surfaces the health thread's `tracing` spans on the test harness's
/// stderr; harmless to call from every test since `try_init` only wins once.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

const MAGIC_REQUEST: u8 = 0x80;
const MAGIC_RESPONSE: u8 = 0x81;

const OP_GET: u8 = 0x00;
const OP_SET: u8 = 0x01;
const OP_DELETE: u8 = 0x04;
const OP_INCREMENT: u8 = 0x05;
const OP_DECREMENT: u8 = 0x06;
const OP_NOOP: u8 = 0x0a;
const OP_APPEND: u8 = 0x0e;
const OP_PREPEND: u8 = 0x0f;

const STATUS_OK: u16 = 0x00;
const STATUS_NOT_FOUND: u16 = 0x01;

struct Entry {
    flags: u32,
    data: Vec<u8>,
}

type Store = Arc<Mutex<HashMap<Vec<u8>, Entry>>>;

/// Starts a background thread serving the binary protocol on an ephemeral
/// port, backed by a shared in-memory map. Returns the bound address.
fn spawn_fake_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr").to_string();
    let store: Store = Arc::new(Mutex::new(HashMap::new()));

    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(stream) = stream else { continue };
            let store = Arc::clone(&store);
            thread::spawn(move || serve_connection(stream, store));
        }
    });

    addr
}

/// Like [`spawn_fake_server`], but bindable to a fixed address and
/// killable: `kill_server` stops accepting new connections and shuts down
/// every connection accepted so far, so in-flight and pooled connections
/// alike start failing immediately instead of lingering until the peer
/// notices on its own.
fn spawn_killable_server(bind_addr: &str) -> (String, Arc<AtomicBool>, Arc<Mutex<Vec<TcpStream>>>) {
    let listener = TcpListener::bind(bind_addr).expect("bind");
    listener.set_nonblocking(true).expect("nonblocking");
    let addr = listener.local_addr().expect("addr").to_string();
    let store: Store = Arc::new(Mutex::new(HashMap::new()));
    let stop = Arc::new(AtomicBool::new(false));
    let conns: Arc<Mutex<Vec<TcpStream>>> = Arc::new(Mutex::new(Vec::new()));

    let stop_accept = Arc::clone(&stop);
    let conns_accept = Arc::clone(&conns);
    thread::spawn(move || loop {
        if stop_accept.load(Ordering::Acquire) {
            return;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                stream.set_nonblocking(false).ok();
                if let Ok(clone) = stream.try_clone() {
                    conns_accept.lock().unwrap().push(clone);
                }
                let store = Arc::clone(&store);
                thread::spawn(move || serve_connection(stream, store));
            }
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(5));
            }
            Err(_) => return,
        }
    });

    (addr, stop, conns)
}

/// Stops accepting new connections and forcibly closes every connection
/// accepted so far, simulating "killing a server's listener" (§8 property
/// 7).
fn kill_server(stop: &Arc<AtomicBool>, conns: &Arc<Mutex<Vec<TcpStream>>>) {
    stop.store(true, Ordering::Release);
    for stream in conns.lock().unwrap().drain(..) {
        let _ = stream.shutdown(Shutdown::Both);
    }
}

fn serve_connection(mut stream: TcpStream, store: Store) {
    stream.set_nodelay(true).ok();
    loop {
        let mut header = [0u8; 24];
        if stream.read_exact(&mut header).is_err() {
            return;
        }
        if header[0] != MAGIC_REQUEST {
            return;
        }
        let opcode = header[1];
        let key_len = u16::from_be_bytes([header[2], header[3]]) as usize;
        let extras_len = header[4] as usize;
        let body_len = u32::from_be_bytes([header[8], header[9], header[10], header[11]]) as usize;
        let opaque = [header[12], header[13], header[14], header[15]];
        let cas = u64::from_be_bytes(header[16..24].try_into().unwrap());

        let mut body = vec![0u8; body_len];
        if body_len > 0 && stream.read_exact(&mut body).is_err() {
            return;
        }

        let extras = &body[..extras_len];
        let key = &body[extras_len..extras_len + key_len];
        let value = &body[extras_len + key_len..];

        let (status, resp_extras, resp_body, resp_cas): (u16, Vec<u8>, Vec<u8>, u64) = match opcode {
            OP_GET => {
                let store = store.lock().unwrap();
                match store.get(key) {
                    Some(entry) => {
                        let mut extras = Vec::with_capacity(4);
                        extras.extend_from_slice(&entry.flags.to_be_bytes());
                        (STATUS_OK, extras, entry.data.clone(), 1)
                    }
                    None => (STATUS_NOT_FOUND, Vec::new(), Vec::new(), 0),
                }
            }
            OP_SET => {
                let flags = u32::from_be_bytes(extras[0..4].try_into().unwrap());
                let mut store = store.lock().unwrap();
                store.insert(key.to_vec(), Entry { flags, data: value.to_vec() });
                (STATUS_OK, Vec::new(), Vec::new(), 1)
            }
            OP_DELETE => {
                let mut store = store.lock().unwrap();
                if store.remove(key).is_some() {
                    (STATUS_OK, Vec::new(), Vec::new(), 0)
                } else {
                    (STATUS_NOT_FOUND, Vec::new(), Vec::new(), 0)
                }
            }
            OP_INCREMENT | OP_DECREMENT => {
                let delta = u64::from_be_bytes(extras[0..8].try_into().unwrap());
                let initial = u64::from_be_bytes(extras[8..16].try_into().unwrap());
                let mut store = store.lock().unwrap();
                let current: u64 = store
                    .get(key)
                    .and_then(|e| std::str::from_utf8(&e.data).ok())
                    .and_then(|s| s.trim().parse().ok())
                    .unwrap_or(initial);
                let next = if opcode == OP_INCREMENT {
                    current.saturating_add(delta)
                } else {
                    current.saturating_sub(delta)
                };
                store.insert(
                    key.to_vec(),
                    Entry { flags: 0, data: next.to_string().into_bytes() },
                );
                (STATUS_OK, Vec::new(), next.to_be_bytes().to_vec(), 0)
            }
            OP_APPEND | OP_PREPEND => {
                let mut store = store.lock().unwrap();
                match store.get_mut(key) {
                    Some(entry) => {
                        if opcode == OP_APPEND {
                            entry.data.extend_from_slice(value);
                        } else {
                            let mut combined = value.to_vec();
                            combined.extend_from_slice(&entry.data);
                            entry.data = combined;
                        }
                        (STATUS_OK, Vec::new(), Vec::new(), 0)
                    }
                    None => (STATUS_NOT_FOUND, Vec::new(), Vec::new(), 0),
                }
            }
            OP_NOOP => (STATUS_OK, Vec::new(), Vec::new(), 0),
            _ => (STATUS_OK, Vec::new(), Vec::new(), 0),
        };

        let _ = cas; // request CAS isn't enforced by this fake server
        let cas = resp_cas;
        let mut response = Vec::with_capacity(24 + resp_extras.len() + resp_body.len());
        response.push(MAGIC_RESPONSE);
        response.push(opcode);
        response.extend_from_slice(&(0u16).to_be_bytes()); // key_len
        response.push(resp_extras.len() as u8);
        response.push(0); // datatype
        response.extend_from_slice(&status.to_be_bytes());
        response.extend_from_slice(
            &((resp_extras.len() + resp_body.len()) as u32).to_be_bytes(),
        );
        response.extend_from_slice(&opaque);
        response.extend_from_slice(&cas.to_be_bytes());
        response.extend_from_slice(&resp_extras);
        response.extend_from_slice(&resp_body);

        if stream.write_all(&response).is_err() {
            return;
        }
    }
}

fn test_client(addr: &str) -> MemcacheClient {
    MemcacheClient::new(
        vec![ServerSpec::new(addr).max_conn(4).init_conn(1)],
        Timeouts::default(),
    )
    .expect("client")
}

#[test]
fn set_then_get_round_trips_a_string() {
    let addr = spawn_fake_server();
    let client = test_client(&addr);

    client
        .set(b"greeting", &Value::from("hello"), StoreOpts::default())
        .expect("set");

    let (value, _cas) = client.get(b"greeting").expect("get");
    assert_eq!(value, Value::from("hello"));
}

#[test]
fn get_missing_key_is_not_found() {
    let addr = spawn_fake_server();
    let client = test_client(&addr);

    let err = client.get(b"missing").unwrap_err();
    assert!(matches!(err, mc_client::ClientError::NotFound));
}

#[test]
fn increment_and_decrement_adjust_stored_counter() {
    let addr = spawn_fake_server();
    let client = test_client(&addr);

    client
        .set(b"counter", &Value::from_int(10), StoreOpts::default())
        .expect("set");

    let after_incr = client
        .increment(b"counter", NumericOpts { delta: 5, cas: 0 })
        .expect("increment");
    assert_eq!(after_incr, 15);

    let after_decr = client
        .decrement(b"counter", NumericOpts { delta: 3, cas: 0 })
        .expect("decrement");
    assert_eq!(after_decr, 12);
}

#[test]
fn append_and_prepend_extend_stored_bytes() {
    let addr = spawn_fake_server();
    let client = test_client(&addr);

    client
        .set(b"log", &Value::from("middle"), StoreOpts::default())
        .expect("set");
    client.append(b"log", b"-end", CasOpts::default()).expect("append");
    client.prepend(b"log", b"start-", CasOpts::default()).expect("prepend");

    let (value, _) = client.get(b"log").expect("get");
    assert_eq!(value, Value::from("start-middle-end"));
}

#[test]
fn delete_removes_a_key() {
    let addr = spawn_fake_server();
    let client = test_client(&addr);

    client
        .set(b"ephemeral", &Value::from(1i32), StoreOpts::default())
        .expect("set");
    client.delete(b"ephemeral", CasOpts::default()).expect("delete");

    let err = client.get(b"ephemeral").unwrap_err();
    assert!(matches!(err, mc_client::ClientError::NotFound));
}

#[test]
fn pool_serializes_concurrent_callers_within_max_conn() {
    let addr = spawn_fake_server();
    let client = Arc::new(test_client(&addr));

    let mut handles = Vec::new();
    for i in 0..16 {
        let client = Arc::clone(&client);
        handles.push(thread::spawn(move || {
            let key = format!("key-{i}");
            client
                .set(key.as_bytes(), &Value::from_int(i as i64), StoreOpts::default())
                .expect("set");
            let (value, _) = client.get(key.as_bytes()).expect("get");
            assert_eq!(value, Value::Int(i as i64));
        }));
    }
    for handle in handles {
        handle.join().expect("thread panicked");
    }
}

#[test]
fn weighted_servers_stay_reachable() {
    let addr_a = spawn_fake_server();
    let addr_b = spawn_fake_server();

    let client = MemcacheClient::new(
        vec![
            ServerSpec::new(&addr_a).weight(1).max_conn(4).init_conn(1),
            ServerSpec::new(&addr_b).weight(3).max_conn(4).init_conn(1),
        ],
        Timeouts::default(),
    )
    .expect("client");

    for i in 0..50 {
        let key = format!("fanout-{i}");
        client
            .set(key.as_bytes(), &Value::from_int(i as i64), StoreOpts::default())
            .expect("set");
        let (value, _) = client.get(key.as_bytes()).expect("get");
        assert_eq!(value, Value::Int(i as i64));
    }
}

#[test]
fn no_health_thread_runs_until_opted_in() {
    init_tracing();
    let addr = spawn_fake_server();
    let client = test_client(&addr);

    // No background probing was enabled, so liveness never moves off its
    // optimistic default regardless of how long we wait.
    thread::sleep(Duration::from_millis(150));
    assert!(client.is_server_active(&addr));
}

#[test]
fn health_probe_flips_server_inactive_when_its_listener_dies() {
    init_tracing();
    let (addr, stop, conns) = spawn_killable_server("127.0.0.1:0");
    let client = MemcacheClient::new(
        vec![ServerSpec::new(&addr).max_conn(4).init_conn(1)],
        Timeouts::default(),
    )
    .expect("client");

    client.set_remove_bad_server(true);
    thread::sleep(Duration::from_millis(100));
    assert!(client.is_server_active(&addr));

    kill_server(&stop, &conns);

    // A request against the now-dead server fails and signals the health
    // thread directly; no need to wait for the 120s poll floor.
    let _ = client.get(b"any-key");

    let mut flipped_inactive = false;
    for _ in 0..100 {
        thread::sleep(Duration::from_millis(50));
        if !client.is_server_active(&addr) {
            flipped_inactive = true;
            break;
        }
    }
    assert!(flipped_inactive, "expected server to flip inactive after its listener was killed");

    // With remove_bad_server enabled the rebuilt ring excludes the sole,
    // now-inactive server entirely, so routed calls fail fast with
    // `NoServer` rather than retrying a dead connection four times over.
    let err = client.get(b"any-key").unwrap_err();
    assert!(matches!(err, mc_client::ClientError::NoServer));
}

/// §8 property 7's full cycle, including the restarted listener's
/// reabsorption "within at most 120 seconds" — the periodic poll floor, not
/// a signal a client call can shortcut, since a routed call to an
/// already-excluded server never reaches the pool to report anything.
/// Left ignored by default since it runs for as long as the real interval.
#[test]
#[ignore = "exercises the full 120s health poll floor; run explicitly with --ignored"]
fn health_probe_reabsorbs_server_after_its_listener_restarts() {
    init_tracing();
    let (addr, stop, conns) = spawn_killable_server("127.0.0.1:0");
    let client = MemcacheClient::new(
        vec![ServerSpec::new(&addr).max_conn(4).init_conn(1)],
        Timeouts::default(),
    )
    .expect("client");

    client.set_remove_bad_server(true);
    thread::sleep(Duration::from_millis(100));
    kill_server(&stop, &conns);
    let _ = client.get(b"any-key");

    let mut flipped_inactive = false;
    for _ in 0..100 {
        thread::sleep(Duration::from_millis(50));
        if !client.is_server_active(&addr) {
            flipped_inactive = true;
            break;
        }
    }
    assert!(flipped_inactive, "expected server to flip inactive after its listener was killed");

    let (_, _stop2, _conns2) = spawn_killable_server(&addr);

    let mut flipped_active = false;
    for _ in 0..130 {
        thread::sleep(Duration::from_secs(1));
        if client.is_server_active(&addr) {
            flipped_active = true;
            break;
        }
    }
    assert!(flipped_active, "expected server to reabsorb within 120s of its listener restarting");
}
