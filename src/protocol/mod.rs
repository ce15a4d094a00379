//! Bootstrap wire protocol
//!
//! This module defines the messages exchanged between ranks and the
//! coordinator during bootstrap, plus the blocking-socket helpers both sides
//! are built on.
//!
//! # Message flow
//!
//! ```text
//! Rank                                Coordinator
//!   |--- COMM_INIT_NEW_CONN (x3) -------->|   classify send/recv/log socket
//!   |--- COMM_INIT_HANDSHAKE1 ----------->|   barrier, then fan out rank table
//!   |<---------- [RankInfoHeader; N] -----|
//!   |--- COMM_INIT_HANDSHAKE2 ----------->|   barrier, then endpoint fan-out
//!   |<-- [RemoteDeviceConnectionInfo; N] -|
//!   |--- SYNC_BETWEEN_RANKS ------------->|   barrier, then boolean ack
//!   |--- DATA_BETWEEN_RANKS ------------->|   relay to dest recv socket
//!   |--- BOOTSTRAP_COMM_DESTROY --------->|   barrier, ack, close everything
//!   |--- COLLECTIVE_LOG ----------------->|   aggregate (no barrier)
//! ```
//!
//! # Framing
//!
//! Every payload is preceded by a fixed 20-byte `MessageHeader`. All integers
//! are native-endian with a fixed field layout; there is no version
//! negotiation. The bootstrap channel is low-throughput and correctness-first,
//! so the framing favors simplicity over density.
//!
//! Two payloads are not fixed-layout and go through bincode instead: the
//! opaque `UniqueId` handle (never on the bootstrap sockets, only passed
//! out-of-band) and `CollectiveLogMessage` records on the log socket.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::RawFd;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;

/// One participant process, 0..comm_size-1.
pub type Rank = u32;

/// Pseudo-rank used as the destination of rank-to-coordinator messages.
pub const COORDINATOR_PEER: Rank = u32::MAX;

/// Engine-level acknowledgement sentinel (4 bytes on the wire).
///
/// A send-side job treats any other value as failure; the coordinator answers
/// a failed relay with [`ACK_FAIL`].
pub const ACK_OK: u32 = 0xC011_B007;

/// Negative engine-level acknowledgement.
pub const ACK_FAIL: u32 = 0;

/// Protocol-tier errors.
///
/// Whether an error is fatal (protocol corruption) or soft (one socket/job
/// fails, session continues) is decided at the call site; see the coordinator
/// dispatch loop.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("peer closed the connection")]
    PeerClosed,

    #[error("unknown message id {0} (protocol corruption)")]
    UnknownMessageKind(u32),

    #[error("unknown socket role {0}")]
    UnknownSocketRole(u32),

    #[error("unexpected acknowledgement value {0:#x}")]
    BadAck(u32),

    #[error("truncated {what}: expected {expected} bytes, got {got}")]
    Truncated {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Message kinds, closed set.
///
/// The wire carries the discriminant as a native-endian u32. Decoding is the
/// only place an unknown id can appear; everywhere else the compiler enforces
/// exhaustiveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageKind {
    CommInitNewConn = 0,
    CommInitHandshake1 = 1,
    CommInitHandshake2 = 2,
    SyncBetweenRanks = 3,
    DataBetweenRanks = 4,
    BootstrapCommDestroy = 5,
    CollectiveLog = 6,
}

impl MessageKind {
    pub fn from_wire(value: u32) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(MessageKind::CommInitNewConn),
            1 => Ok(MessageKind::CommInitHandshake1),
            2 => Ok(MessageKind::CommInitHandshake2),
            3 => Ok(MessageKind::SyncBetweenRanks),
            4 => Ok(MessageKind::DataBetweenRanks),
            5 => Ok(MessageKind::BootstrapCommDestroy),
            6 => Ok(MessageKind::CollectiveLog),
            other => Err(ProtocolError::UnknownMessageKind(other)),
        }
    }
}

/// Fixed-size header preceding every payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub kind: MessageKind,
    pub sequence: u32,
    pub payload_size: u32,
    pub source_peer: Rank,
    pub dest_peer: Rank,
}

impl MessageHeader {
    pub const WIRE_SIZE: usize = 20;

    pub fn encode(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0u8; Self::WIRE_SIZE];
        buf[0..4].copy_from_slice(&(self.kind as u32).to_ne_bytes());
        buf[4..8].copy_from_slice(&self.sequence.to_ne_bytes());
        buf[8..12].copy_from_slice(&self.payload_size.to_ne_bytes());
        buf[12..16].copy_from_slice(&self.source_peer.to_ne_bytes());
        buf[16..20].copy_from_slice(&self.dest_peer.to_ne_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < Self::WIRE_SIZE {
            return Err(ProtocolError::Truncated {
                what: "message header",
                expected: Self::WIRE_SIZE,
                got: buf.len(),
            });
        }
        Ok(Self {
            kind: MessageKind::from_wire(read_u32(buf, 0))?,
            sequence: read_u32(buf, 4),
            payload_size: read_u32(buf, 8),
            source_peer: read_u32(buf, 12),
            dest_peer: read_u32(buf, 16),
        })
    }
}

/// Socket roles, exactly 3 connections per rank to the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SocketRole {
    Send = 0,
    Recv = 1,
    Log = 2,
}

impl SocketRole {
    pub fn from_wire(value: u32) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(SocketRole::Send),
            1 => Ok(SocketRole::Recv),
            2 => Ok(SocketRole::Log),
            other => Err(ProtocolError::UnknownSocketRole(other)),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SocketRole::Send => "send",
            SocketRole::Recv => "recv",
            SocketRole::Log => "log",
        }
    }
}

/// Sent immediately after a rank opens a new connection; tells the
/// coordinator how to classify and file the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketRegistrationInfo {
    pub total_ranks: u32,
    pub role: SocketRole,
    pub rank: Rank,
}

impl SocketRegistrationInfo {
    pub const WIRE_SIZE: usize = 12;

    pub fn encode(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0u8; Self::WIRE_SIZE];
        buf[0..4].copy_from_slice(&self.total_ranks.to_ne_bytes());
        buf[4..8].copy_from_slice(&(self.role as u32).to_ne_bytes());
        buf[8..12].copy_from_slice(&self.rank.to_ne_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < Self::WIRE_SIZE {
            return Err(ProtocolError::Truncated {
                what: "socket registration",
                expected: Self::WIRE_SIZE,
                got: buf.len(),
            });
        }
        Ok(Self {
            total_ranks: read_u32(buf, 0),
            role: SocketRole::from_wire(read_u32(buf, 4))?,
            rank: read_u32(buf, 8),
        })
    }
}

/// Per-rank static descriptor exchanged in handshake phase 1.
///
/// `box_size` is the number of co-located ranks on this host and must be
/// uniform across the whole communicator. `host_hash` identifies the host so
/// the coordinator can group ranks into boxes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RankInfoHeader {
    pub rank: Rank,
    pub box_size: u32,
    pub host_hash: u64,
}

impl RankInfoHeader {
    pub const WIRE_SIZE: usize = 16;

    /// Build the local descriptor, hashing this host's name for identity.
    pub fn for_local_host(rank: Rank, box_size: u32) -> Self {
        let name = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| String::from("unknown-host"));
        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        Self {
            rank,
            box_size,
            host_hash: hasher.finish(),
        }
    }

    pub fn encode(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0u8; Self::WIRE_SIZE];
        buf[0..4].copy_from_slice(&self.rank.to_ne_bytes());
        buf[4..8].copy_from_slice(&self.box_size.to_ne_bytes());
        buf[8..16].copy_from_slice(&self.host_hash.to_ne_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < Self::WIRE_SIZE {
            return Err(ProtocolError::Truncated {
                what: "rank info header",
                expected: Self::WIRE_SIZE,
                got: buf.len(),
            });
        }
        Ok(Self {
            rank: read_u32(buf, 0),
            box_size: read_u32(buf, 4),
            host_hash: u64::from_ne_bytes(buf[8..16].try_into().unwrap()),
        })
    }

    /// Decode a packed array of descriptors, as fanned out by the coordinator.
    pub fn decode_array(buf: &[u8], count: usize) -> Result<Vec<Self>, ProtocolError> {
        if buf.len() < count * Self::WIRE_SIZE {
            return Err(ProtocolError::Truncated {
                what: "rank info array",
                expected: count * Self::WIRE_SIZE,
                got: buf.len(),
            });
        }
        (0..count)
            .map(|i| Self::decode(&buf[i * Self::WIRE_SIZE..]))
            .collect()
    }

    pub fn encode_array(items: &[Self]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(items.len() * Self::WIRE_SIZE);
        for item in items {
            buf.extend_from_slice(&item.encode());
        }
        buf
    }
}

/// Per-remote-rank connectivity descriptor exchanged in handshake phase 2.
///
/// The address fields describe where the (out-of-scope) data-plane transport
/// should dial; the bootstrap layer only moves them around.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteDeviceConnectionInfo {
    pub rank: Rank,
    pub device_index: u32,
    /// IPv6-mapped address bytes of the data-plane endpoint.
    pub addr: [u8; 16],
    pub port: u16,
}

impl RemoteDeviceConnectionInfo {
    pub const WIRE_SIZE: usize = 28;

    pub fn encode(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0u8; Self::WIRE_SIZE];
        buf[0..4].copy_from_slice(&self.rank.to_ne_bytes());
        buf[4..8].copy_from_slice(&self.device_index.to_ne_bytes());
        buf[8..24].copy_from_slice(&self.addr);
        buf[24..26].copy_from_slice(&self.port.to_ne_bytes());
        // buf[26..28] reserved
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < Self::WIRE_SIZE {
            return Err(ProtocolError::Truncated {
                what: "remote device connection info",
                expected: Self::WIRE_SIZE,
                got: buf.len(),
            });
        }
        let mut addr = [0u8; 16];
        addr.copy_from_slice(&buf[8..24]);
        Ok(Self {
            rank: read_u32(buf, 0),
            device_index: read_u32(buf, 4),
            addr,
            port: u16::from_ne_bytes(buf[24..26].try_into().unwrap()),
        })
    }

    pub fn decode_array(buf: &[u8], count: usize) -> Result<Vec<Self>, ProtocolError> {
        if buf.len() < count * Self::WIRE_SIZE {
            return Err(ProtocolError::Truncated {
                what: "remote device connection array",
                expected: count * Self::WIRE_SIZE,
                got: buf.len(),
            });
        }
        (0..count)
            .map(|i| Self::decode(&buf[i * Self::WIRE_SIZE..]))
            .collect()
    }

    pub fn encode_array(items: &[Self]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(items.len() * Self::WIRE_SIZE);
        for item in items {
            buf.extend_from_slice(&item.encode());
        }
        buf
    }
}

/// Timestamped diagnostic record sent over the dedicated log socket.
///
/// Carries either a log payload or a validation-error flag; a set flag marks
/// the sending rank's session as failed without terminating it (the failure
/// propagates at the next handshake/sync boundary).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CollectiveLogMessage {
    pub rank: Rank,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub validation_error: bool,
}

impl CollectiveLogMessage {
    pub fn new(rank: Rank, message: impl Into<String>) -> Self {
        Self {
            rank,
            timestamp: Utc::now(),
            message: message.into(),
            validation_error: false,
        }
    }

    pub fn validation_failure(rank: Rank, message: impl Into<String>) -> Self {
        Self {
            rank,
            timestamp: Utc::now(),
            message: message.into(),
            validation_error: true,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).context("Failed to serialize collective log message")
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        bincode::deserialize(buf).context("Failed to deserialize collective log message")
    }
}

/// Coordinator rendezvous identifier.
///
/// Serialized into an opaque handle that every rank receives out-of-band
/// (shared file, environment, launcher) to locate the coordinator. Created
/// once per bootstrap session; immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniqueId {
    pub addr: SocketAddr,
    pub session: u64,
}

static SESSION_COUNTER: OnceLock<AtomicU64> = OnceLock::new();

/// Process-wide monotonic session-id generator, seeded once per process.
fn next_session_id() -> u64 {
    SESSION_COUNTER
        .get_or_init(|| AtomicU64::new(rand::random::<u64>()))
        .fetch_add(1, Ordering::Relaxed)
}

impl UniqueId {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            session: next_session_id(),
        }
    }

    /// Serialize into the opaque handle handed to ranks out-of-band.
    pub fn to_handle(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).context("Failed to serialize unique id")
    }

    pub fn from_handle(handle: &[u8]) -> Result<Self> {
        bincode::deserialize(handle).context("Failed to deserialize unique id")
    }

    /// File transport for launchers that share a filesystem.
    pub fn to_file(&self, path: &Path) -> Result<()> {
        let handle = self.to_handle()?;
        std::fs::write(path, handle)
            .with_context(|| format!("Failed to write unique id to {}", path.display()))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let handle = std::fs::read(path)
            .with_context(|| format!("Failed to read unique id from {}", path.display()))?;
        Self::from_handle(&handle)
    }
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_ne_bytes(buf[offset..offset + 4].try_into().unwrap())
}

// ============================================================================
// Blocking socket helpers
// ============================================================================

/// Send the whole buffer, retrying transparently on EINTR.
pub fn send_full(stream: &TcpStream, buf: &[u8]) -> Result<(), ProtocolError> {
    let mut writer = stream;
    writer.write_all(buf)?;
    Ok(())
}

/// Receive exactly `buf.len()` bytes.
///
/// Tri-state semantics: full read is success, 0 bytes means the peer closed
/// (failure for any receive expecting a full message), anything else is an
/// I/O error. EINTR is retried transparently.
pub fn recv_full(stream: &TcpStream, buf: &mut [u8]) -> Result<(), ProtocolError> {
    let mut reader = stream;
    match reader.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(ProtocolError::PeerClosed),
        Err(e) => Err(ProtocolError::Io(e)),
    }
}

/// Read one fixed-size message header.
pub fn read_header(stream: &TcpStream) -> Result<MessageHeader, ProtocolError> {
    let mut buf = [0u8; MessageHeader::WIRE_SIZE];
    recv_full(stream, &mut buf)?;
    MessageHeader::decode(&buf)
}

/// Write a header followed by its payload as one buffer.
pub fn write_message(
    stream: &TcpStream,
    header: &MessageHeader,
    payload: &[u8],
) -> Result<(), ProtocolError> {
    debug_assert_eq!(header.payload_size as usize, payload.len());
    let mut buf = Vec::with_capacity(MessageHeader::WIRE_SIZE + payload.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(payload);
    send_full(stream, &buf)
}

/// Send the 4-byte engine-level acknowledgement.
pub fn send_ack(stream: &TcpStream, ack: u32) -> Result<(), ProtocolError> {
    send_full(stream, &ack.to_ne_bytes())
}

/// Receive the 4-byte engine-level acknowledgement.
pub fn recv_ack(stream: &TcpStream) -> Result<u32, ProtocolError> {
    let mut buf = [0u8; 4];
    recv_full(stream, &mut buf)?;
    Ok(u32::from_ne_bytes(buf))
}

/// Send the single-byte boolean ack used by barrier RPCs.
pub fn send_bool(stream: &TcpStream, value: bool) -> Result<(), ProtocolError> {
    send_full(stream, &[value as u8])
}

/// Receive the single-byte boolean ack used by barrier RPCs.
pub fn recv_bool(stream: &TcpStream) -> Result<bool, ProtocolError> {
    let mut buf = [0u8; 1];
    recv_full(stream, &mut buf)?;
    Ok(buf[0] != 0)
}

/// Half-close the write side, then drain inbound bytes to EOF with a bound
/// so a misbehaving peer cannot hold teardown hostage. Errors are swallowed;
/// the socket is being discarded either way.
pub fn graceful_close(stream: &TcpStream, drain_timeout: Duration) {
    let _ = stream.shutdown(std::net::Shutdown::Write);
    let _ = stream.set_read_timeout(Some(drain_timeout.max(Duration::from_millis(1))));

    let deadline = std::time::Instant::now() + drain_timeout;
    let mut reader = stream;
    let mut scratch = [0u8; 4096];
    while std::time::Instant::now() < deadline {
        match reader.read(&mut scratch) {
            Ok(0) => break,
            Ok(_) => continue,
            Err(_) => break,
        }
    }
}

/// Wait up to `timeout` for `fd` to become readable.
///
/// This bounded poll is the only mechanism by which long-lived loops observe
/// a quit request in bounded time; no blocking read is ever entered without a
/// successful poll first. EINTR is retried transparently.
pub fn poll_readable(fd: RawFd, timeout: Duration) -> io::Result<bool> {
    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;
    loop {
        let rc = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        return Ok(rc > 0 && (pollfd.revents & (libc::POLLIN | libc::POLLHUP)) != 0);
    }
}

/// Poll a set of fds at once, returning the indices that are readable (or
/// hung up, so closed peers are noticed and reaped).
pub fn poll_readable_set(fds: &[RawFd], timeout: Duration) -> io::Result<Vec<usize>> {
    let mut pollfds: Vec<libc::pollfd> = fds
        .iter()
        .map(|&fd| libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        })
        .collect();
    let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;
    loop {
        let rc = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, timeout_ms) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        return Ok(pollfds
            .iter()
            .enumerate()
            .filter(|(_, p)| p.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0)
            .map(|(i, _)| i)
            .collect());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_encode_decode() {
        let header = MessageHeader {
            kind: MessageKind::DataBetweenRanks,
            sequence: 7,
            payload_size: 4096,
            source_peer: 2,
            dest_peer: 5,
        };

        let buf = header.encode();
        assert_eq!(buf.len(), MessageHeader::WIRE_SIZE);

        let decoded = MessageHeader::decode(&buf).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_unknown_message_kind_is_rejected() {
        let mut buf = MessageHeader {
            kind: MessageKind::CollectiveLog,
            sequence: 0,
            payload_size: 0,
            source_peer: 0,
            dest_peer: 0,
        }
        .encode();
        buf[0..4].copy_from_slice(&99u32.to_ne_bytes());

        match MessageHeader::decode(&buf) {
            Err(ProtocolError::UnknownMessageKind(99)) => {}
            other => panic!("Expected unknown-kind error, got {:?}", other),
        }
    }

    #[test]
    fn test_truncated_header() {
        let buf = [0u8; 10];
        match MessageHeader::decode(&buf) {
            Err(ProtocolError::Truncated { expected, got, .. }) => {
                assert_eq!(expected, MessageHeader::WIRE_SIZE);
                assert_eq!(got, 10);
            }
            other => panic!("Expected truncation error, got {:?}", other),
        }
    }

    #[test]
    fn test_registration_roundtrip() {
        let reg = SocketRegistrationInfo {
            total_ranks: 8,
            role: SocketRole::Recv,
            rank: 3,
        };
        let decoded = SocketRegistrationInfo::decode(&reg.encode()).unwrap();
        assert_eq!(decoded, reg);
    }

    #[test]
    fn test_unknown_socket_role_is_rejected() {
        let mut buf = SocketRegistrationInfo {
            total_ranks: 2,
            role: SocketRole::Log,
            rank: 0,
        }
        .encode();
        buf[4..8].copy_from_slice(&7u32.to_ne_bytes());

        match SocketRegistrationInfo::decode(&buf) {
            Err(ProtocolError::UnknownSocketRole(7)) => {}
            other => panic!("Expected unknown-role error, got {:?}", other),
        }
    }

    #[test]
    fn test_rank_info_array() {
        let infos: Vec<RankInfoHeader> = (0..4)
            .map(|rank| RankInfoHeader {
                rank,
                box_size: 2,
                host_hash: 0xDEAD_0000 + rank as u64,
            })
            .collect();

        let packed = RankInfoHeader::encode_array(&infos);
        assert_eq!(packed.len(), 4 * RankInfoHeader::WIRE_SIZE);

        let decoded = RankInfoHeader::decode_array(&packed, 4).unwrap();
        assert_eq!(decoded, infos);
    }

    #[test]
    fn test_remote_device_info_array() {
        let entries: Vec<RemoteDeviceConnectionInfo> = (0..3)
            .map(|rank| RemoteDeviceConnectionInfo {
                rank,
                device_index: rank * 2,
                addr: [rank as u8; 16],
                port: 9000 + rank as u16,
            })
            .collect();

        let packed = RemoteDeviceConnectionInfo::encode_array(&entries);
        let decoded = RemoteDeviceConnectionInfo::decode_array(&packed, 3).unwrap();
        assert_eq!(decoded, entries);
    }

    #[test]
    fn test_unique_id_handle_roundtrip() {
        let id = UniqueId::new("127.0.0.1:4500".parse().unwrap());
        let handle = id.to_handle().unwrap();
        let restored = UniqueId::from_handle(&handle).unwrap();
        assert_eq!(restored, id);
    }

    #[test]
    fn test_unique_id_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("coordinator.id");

        let id = UniqueId::new("10.0.0.1:7000".parse().unwrap());
        id.to_file(&path).unwrap();

        let restored = UniqueId::from_file(&path).unwrap();
        assert_eq!(restored, id);
    }

    #[test]
    fn test_session_ids_are_monotonic() {
        let a = UniqueId::new("127.0.0.1:1".parse().unwrap());
        let b = UniqueId::new("127.0.0.1:1".parse().unwrap());
        assert_eq!(b.session, a.session.wrapping_add(1));
    }

    #[test]
    fn test_collective_log_roundtrip() {
        let msg = CollectiveLogMessage::validation_failure(3, "qp setup failed");
        let decoded = CollectiveLogMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
        assert!(decoded.validation_error);
    }

    #[test]
    fn test_local_rank_info_uses_host_identity() {
        let a = RankInfoHeader::for_local_host(0, 4);
        let b = RankInfoHeader::for_local_host(1, 4);
        // Same process, same host.
        assert_eq!(a.host_hash, b.host_hash);
        assert_ne!(a.rank, b.rank);
    }
}
