//! # Connection
//!
//! Purpose: drive exactly one request/response exchange at a time against
//! one server, over either a TCP or unix-domain transport.
//!
//! ## Design Principles
//! 1. **One Exchange At A Time**: a `Connection` is never shared across
//!    concurrent callers; the pool enforces this by handing out exclusive
//!    ownership.
//! 2. **Deadlines Re-Armed Per I/O**: read/write deadlines are installed
//!    immediately before the corresponding syscall, not once at connect
//!    time, so a long-idle-then-busy connection doesn't inherit a stale
//!    deadline.
//! 3. **Bad-Connection Sentinel**: any I/O failure — short read, short
//!    write, deadline expiry — collapses to [`ClientError::BadConnection`]
//!    so the pool can destroy the connection instead of returning it.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
#[cfg(unix)]
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

use crate::config::Timeouts;
use crate::error::{ClientError, ClientResult};
use crate::value::{Value, ValueKind};
use crate::wire::{self, Opcode, RequestHeader};

/// Either transport the client can dial, selected by whether the
/// configured address contains a `/` (§6 Address scheme).
enum Transport {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Transport {
    fn dial(address: &str, dial_timeout: Duration) -> ClientResult<Transport> {
        if address.contains('/') {
            #[cfg(unix)]
            {
                let stream = UnixStream::connect(address).map_err(|_| ClientError::NotConnected)?;
                return Ok(Transport::Unix(stream));
            }
            #[cfg(not(unix))]
            {
                return Err(ClientError::InvalidAddress);
            }
        }

        let addr: SocketAddr = address
            .to_socket_addrs()
            .ok()
            .and_then(|mut it| it.next())
            .ok_or(ClientError::InvalidAddress)?;

        let stream = if dial_timeout.is_zero() {
            TcpStream::connect(addr)
        } else {
            TcpStream::connect_timeout(&addr, dial_timeout)
        }
        .map_err(|_| ClientError::NotConnected)?;
        stream.set_nodelay(true).ok();
        Ok(Transport::Tcp(stream))
    }

    fn set_read_timeout(&self, timeout: Duration) -> io::Result<()> {
        let timeout = if timeout.is_zero() { None } else { Some(timeout) };
        match self {
            Transport::Tcp(s) => s.set_read_timeout(timeout),
            #[cfg(unix)]
            Transport::Unix(s) => s.set_read_timeout(timeout),
        }
    }

    fn set_write_timeout(&self, timeout: Duration) -> io::Result<()> {
        let timeout = if timeout.is_zero() { None } else { Some(timeout) };
        match self {
            Transport::Tcp(s) => s.set_write_timeout(timeout),
            #[cfg(unix)]
            Transport::Unix(s) => s.set_write_timeout(timeout),
        }
    }
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Tcp(s) => s.read(buf),
            #[cfg(unix)]
            Transport::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Tcp(s) => s.write(buf),
            #[cfg(unix)]
            Transport::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Transport::Tcp(s) => s.flush(),
            #[cfg(unix)]
            Transport::Unix(s) => s.flush(),
        }
    }
}

/// A live connection to one server, with reusable read/write buffers.
pub struct Connection {
    transport: Transport,
    timeouts: Timeouts,
    write_buf: Vec<u8>,
    pub(crate) last_active: Instant,
}

/// Response body plus the header fields callers need after dispatch.
pub struct Reply {
    pub status: u16,
    pub cas: u64,
    pub body: Vec<u8>,
    pub extras_len: u8,
}

impl Connection {
    pub(crate) fn connect(address: &str, timeouts: Timeouts) -> ClientResult<Connection> {
        let transport = Transport::dial(address, timeouts.dial)?;
        Ok(Connection {
            transport,
            timeouts,
            write_buf: Vec::with_capacity(256),
            last_active: Instant::now(),
        })
    }

    fn write_header(&mut self, header: &RequestHeader) {
        self.write_buf
            .extend_from_slice(&wire::encode_request(header));
    }

    fn flush(&mut self) -> ClientResult<()> {
        self.transport.set_write_timeout(self.timeouts.write)?;
        self.transport.write_all(&self.write_buf)?;
        self.transport.flush()?;
        self.write_buf.clear();
        Ok(())
    }

    fn read_reply(&mut self) -> ClientResult<Reply> {
        self.transport.set_read_timeout(self.timeouts.read)?;
        let mut header_buf = [0u8; wire::HEADER_LEN];
        self.transport.read_exact(&mut header_buf)?;
        let header = wire::decode_response(&header_buf)?;

        let mut body = vec![0u8; header.body_len as usize];
        if !body.is_empty() {
            self.transport.set_read_timeout(self.timeouts.read)?;
            self.transport.read_exact(&mut body)?;
        }

        Ok(Reply {
            status: header.status,
            cas: header.cas,
            body,
            extras_len: header.extras_len,
        })
    }

    fn check_status(status: u16) -> ClientResult<()> {
        match ClientError::from_status(status) {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    /// `Get`: returns the decoded value and its CAS token.
    pub fn get(&mut self, key: &[u8]) -> ClientResult<(Value, u64)> {
        self.write_header(&RequestHeader {
            opcode: Opcode::Get,
            key_len: key.len() as u16,
            extras_len: 0,
            body_len: key.len() as u32,
            opaque: 0,
            cas: 0,
        });
        self.write_buf.extend_from_slice(key);
        self.flush()?;

        let reply = self.read_reply()?;
        Self::check_status(reply.status)?;

        if reply.extras_len != wire::GET_RESPONSE_EXTLEN {
            return Err(ClientError::Framing);
        }
        if reply.body.len() < wire::GET_RESPONSE_EXTLEN as usize {
            return Err(ClientError::Framing);
        }

        let flags = u32::from_be_bytes(reply.body[0..4].try_into().unwrap());
        let kind = ValueKind::from_flags(flags).ok_or(ClientError::InvalidValueType)?;
        let value = Value::decode_payload(kind, &reply.body[4..])?;
        Ok((value, reply.cas))
    }

    /// `Set`/`Add`/`Replace`: stores a value with the given expiration and
    /// CAS precondition.
    pub fn store(
        &mut self,
        opcode: Opcode,
        key: &[u8],
        value: &Value,
        expiration: u32,
        cas: u64,
    ) -> ClientResult<()> {
        let payload = value.encode_payload();
        let flags = value.kind().flags();

        self.write_header(&RequestHeader {
            opcode,
            key_len: key.len() as u16,
            extras_len: 8,
            body_len: (key.len() + 8 + payload.len()) as u32,
            opaque: 0,
            cas,
        });
        self.write_buf.extend_from_slice(&flags.to_be_bytes());
        self.write_buf.extend_from_slice(&expiration.to_be_bytes());
        self.write_buf.extend_from_slice(key);
        self.write_buf.extend_from_slice(&payload);
        self.flush()?;

        let reply = self.read_reply()?;
        Self::check_status(reply.status)
    }

    /// `Delete`.
    pub fn delete(&mut self, key: &[u8], cas: u64) -> ClientResult<()> {
        self.write_header(&RequestHeader {
            opcode: Opcode::Delete,
            key_len: key.len() as u16,
            extras_len: 0,
            body_len: key.len() as u32,
            opaque: 0,
            cas,
        });
        self.write_buf.extend_from_slice(key);
        self.flush()?;

        let reply = self.read_reply()?;
        Self::check_status(reply.status)
    }

    /// `Increment`/`Decrement`. Returns the post-mutation numeric value.
    pub fn numeric(
        &mut self,
        opcode: Opcode,
        key: &[u8],
        delta: u64,
        cas: u64,
    ) -> ClientResult<u64> {
        self.write_header(&RequestHeader {
            opcode,
            key_len: key.len() as u16,
            extras_len: 0x14,
            body_len: (key.len() + 0x14) as u32,
            opaque: 0,
            cas,
        });
        self.write_buf.extend_from_slice(&delta.to_be_bytes());
        self.write_buf.extend_from_slice(&0u64.to_be_bytes()); // initial
        self.write_buf.extend_from_slice(&0u32.to_be_bytes()); // expiration
        self.write_buf.extend_from_slice(key);
        self.flush()?;

        let reply = self.read_reply()?;
        Self::check_status(reply.status)?;
        if reply.body.len() < 8 {
            return Err(ClientError::Framing);
        }
        Ok(u64::from_be_bytes(reply.body[0..8].try_into().unwrap()))
    }

    /// `Append`/`Prepend`.
    pub fn append(&mut self, opcode: Opcode, key: &[u8], value: &[u8], cas: u64) -> ClientResult<()> {
        self.write_header(&RequestHeader {
            opcode,
            key_len: key.len() as u16,
            extras_len: 0,
            body_len: (key.len() + value.len()) as u32,
            opaque: 0,
            cas,
        });
        self.write_buf.extend_from_slice(key);
        self.write_buf.extend_from_slice(value);
        self.flush()?;

        let reply = self.read_reply()?;
        Self::check_status(reply.status)
    }

    /// `Flush`.
    pub fn flush_all(&mut self, delay: u32) -> ClientResult<()> {
        self.write_header(&RequestHeader {
            opcode: Opcode::Flush,
            key_len: 0,
            extras_len: 4,
            body_len: 4,
            opaque: 0,
            cas: 0,
        });
        self.write_buf.extend_from_slice(&delay.to_be_bytes());
        self.flush()?;

        let reply = self.read_reply()?;
        Self::check_status(reply.status)
    }

    /// `Noop`, used by the health probe.
    pub fn noop(&mut self) -> ClientResult<()> {
        self.write_header(&RequestHeader {
            opcode: Opcode::Noop,
            key_len: 0,
            extras_len: 0,
            body_len: 0,
            opaque: 0,
            cas: 0,
        });
        self.flush()?;

        let reply = self.read_reply()?;
        Self::check_status(reply.status)
    }

    /// `Version`.
    pub fn version(&mut self) -> ClientResult<String> {
        self.write_header(&RequestHeader {
            opcode: Opcode::Version,
            key_len: 0,
            extras_len: 0,
            body_len: 0,
            opaque: 0,
            cas: 0,
        });
        self.flush()?;

        let reply = self.read_reply()?;
        Self::check_status(reply.status)?;
        String::from_utf8(reply.body).map_err(|_| ClientError::Framing)
    }
}
