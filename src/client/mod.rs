//! Per-rank coordinator client
//!
//! Each rank opens exactly three connections to the coordinator:
//!
//! - `send`: barrier RPCs (handshakes, sync, destroy) and outbound
//!   point-to-point data,
//! - `recv`: inbound relayed data, owned by the async connection thread,
//! - `log`: fire-and-forget diagnostic records.
//!
//! Barrier RPCs are plain blocking request/response on the send socket.
//! Point-to-point sends go through the worker pool so the caller gets a
//! completion handle; receives are posted to the async connection thread as
//! expectations and complete out of order across peers.
//!
//! All operations take `&mut self`: one rank drives its bootstrap client from
//! a single logical thread, and exclusive access keeps barrier RPCs and
//! pool-submitted sends from interleaving on the shared send socket.

use crate::config::BootstrapConfig;
use crate::engine::{AsyncConnectionHandle, AsyncJob, JobHandle, SocketJob, WorkerThreadPool};
use crate::protocol::{
    self, CollectiveLogMessage, MessageHeader, MessageKind, Rank, RankInfoHeader,
    RemoteDeviceConnectionInfo, SocketRegistrationInfo, SocketRole, UniqueId, COORDINATOR_PEER,
};
use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::net::TcpStream;
use std::sync::Arc;

pub struct CoordinatorClient {
    rank: Rank,
    total_ranks: u32,
    send_sock: Arc<TcpStream>,
    recv_sock: TcpStream,
    log_sock: TcpStream,
    async_conn: AsyncConnectionHandle,
    pool: WorkerThreadPool,
    /// Next outbound sequence number, per destination peer.
    send_seq: HashMap<Rank, u32>,
    /// Next expected inbound sequence number, per source peer.
    recv_seq: HashMap<Rank, u32>,
    config: BootstrapConfig,
}

impl CoordinatorClient {
    /// Connect this rank to the coordinator named by `unique_id`.
    ///
    /// Opens and registers the three role sockets, then hands the recv socket
    /// to a freshly spawned async connection thread. Returns once all three
    /// registrations have been written; the coordinator classifies them as
    /// they arrive.
    pub fn connect(
        unique_id: &UniqueId,
        rank: Rank,
        total_ranks: u32,
        config: &BootstrapConfig,
    ) -> Result<Self> {
        if rank >= total_ranks {
            bail!("Rank {} out of range for communicator of {}", rank, total_ranks);
        }

        let send_sock = open_and_register(unique_id, rank, total_ranks, SocketRole::Send, config)?;
        let recv_sock = open_and_register(unique_id, rank, total_ranks, SocketRole::Recv, config)?;
        let log_sock = open_and_register(unique_id, rank, total_ranks, SocketRole::Log, config)?;

        let mut pool = WorkerThreadPool::new(config);
        let async_sock = recv_sock
            .try_clone()
            .context("Failed to clone recv socket for the async connection thread")?;
        let async_conn = pool.spawn_async_connection(async_sock, rank)?;

        if config.debug {
            eprintln!(
                "DEBUG: rank {} registered 3 sockets with coordinator at {}",
                rank, unique_id.addr
            );
        }

        Ok(Self {
            rank,
            total_ranks,
            send_sock: Arc::new(send_sock),
            recv_sock,
            log_sock,
            async_conn,
            pool,
            send_seq: HashMap::new(),
            recv_seq: HashMap::new(),
            config: config.clone(),
        })
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn total_ranks(&self) -> u32 {
        self.total_ranks
    }

    /// Handshake phase 1: contribute this rank's static descriptor, block
    /// until every rank has arrived, and receive the full rank table.
    ///
    /// Every rank gets the identical table, ordered by rank.
    pub fn comm_init_handshake1(&mut self, box_size: u32) -> Result<Vec<RankInfoHeader>> {
        let info = RankInfoHeader::for_local_host(self.rank, box_size);
        let header = self.coordinator_header(
            MessageKind::CommInitHandshake1,
            RankInfoHeader::WIRE_SIZE as u32,
        );
        protocol::write_message(&self.send_sock, &header, &info.encode())
            .context("Failed to send handshake1 request")?;

        let mut buf = vec![0u8; self.total_ranks as usize * RankInfoHeader::WIRE_SIZE];
        protocol::recv_full(&self.send_sock, &mut buf)
            .context("Failed to receive handshake1 rank table")?;
        let table = RankInfoHeader::decode_array(&buf, self.total_ranks as usize)?;
        Ok(table)
    }

    /// Handshake phase 2: contribute this rank's data-plane endpoint, block
    /// until every rank has arrived, and receive everyone's endpoints plus
    /// the aggregate validation verdict.
    pub fn comm_init_handshake2(
        &mut self,
        local: &RemoteDeviceConnectionInfo,
    ) -> Result<Vec<RemoteDeviceConnectionInfo>> {
        let header = self.coordinator_header(
            MessageKind::CommInitHandshake2,
            RemoteDeviceConnectionInfo::WIRE_SIZE as u32,
        );
        protocol::write_message(&self.send_sock, &header, &local.encode())
            .context("Failed to send handshake2 request")?;

        let mut buf =
            vec![0u8; self.total_ranks as usize * RemoteDeviceConnectionInfo::WIRE_SIZE];
        protocol::recv_full(&self.send_sock, &mut buf)
            .context("Failed to receive handshake2 endpoint table")?;
        let table = RemoteDeviceConnectionInfo::decode_array(&buf, self.total_ranks as usize)?;

        // The table is followed by the communicator-wide validation verdict;
        // any rank having reported a validation error fails the handshake for
        // everyone.
        let ok = protocol::recv_bool(&self.send_sock)
            .context("Failed to receive handshake2 verdict")?;
        if !ok {
            bail!("A rank reported a validation error; communicator setup failed");
        }
        Ok(table)
    }

    /// Barrier with no data movement: returns once every rank has called it.
    pub fn sync_between_ranks(&mut self) -> Result<()> {
        let header = self.coordinator_header(MessageKind::SyncBetweenRanks, 0);
        protocol::write_message(&self.send_sock, &header, &[])
            .context("Failed to send sync request")?;

        let ok = protocol::recv_bool(&self.send_sock).context("Failed to receive sync ack")?;
        if !ok {
            bail!("Coordinator reported sync failure");
        }
        Ok(())
    }

    /// Send `data` to `dest`, relayed through the coordinator. Blocks until
    /// the coordinator acknowledges delivery into the destination's recv
    /// path.
    pub fn send_to_rank(&mut self, dest: Rank, data: &[u8]) -> Result<()> {
        if dest >= self.total_ranks {
            bail!("Destination rank {} out of range for communicator of {}", dest, self.total_ranks);
        }

        let seq = self.send_seq.entry(dest).or_insert(0);
        let header = MessageHeader {
            kind: MessageKind::DataBetweenRanks,
            sequence: *seq,
            payload_size: data.len() as u32,
            source_peer: self.rank,
            dest_peer: dest,
        };
        *seq = seq.wrapping_add(1);

        let mut wire = Vec::with_capacity(MessageHeader::WIRE_SIZE + data.len());
        wire.extend_from_slice(&header.encode());
        wire.extend_from_slice(data);

        let handle = JobHandle::new();
        self.pool.submit(SocketJob::Send {
            sock: self.send_sock.clone(),
            data: wire,
            handle: handle.clone(),
        })?;

        let (poll_interval, timeout) = self.pool.job_wait_params();
        if !handle.wait(poll_interval, timeout) {
            bail!(
                "Send to rank {} not acknowledged within {:?}",
                dest,
                timeout
            );
        }
        if !handle.succeeded() {
            bail!("Coordinator failed to relay message to rank {}", dest);
        }
        Ok(())
    }

    /// Register an expectation for `len` bytes from `source` and return
    /// immediately; the payload lands in the returned handle when the relayed
    /// message arrives. Completions are ordered per source peer and
    /// independent across peers.
    pub fn recv_from_rank_async(&mut self, source: Rank, len: usize) -> Result<JobHandle> {
        if source >= self.total_ranks {
            bail!("Source rank {} out of range for communicator of {}", source, self.total_ranks);
        }

        let seq = self.recv_seq.entry(source).or_insert(0);
        let handle = JobHandle::new();
        self.async_conn.post(AsyncJob {
            peer: source,
            sequence: *seq,
            len,
            handle: handle.clone(),
        });
        *seq = seq.wrapping_add(1);
        Ok(handle)
    }

    /// Blocking receive: convenience wrapper over the async form.
    pub fn recv_from_rank(&mut self, source: Rank, len: usize) -> Result<Vec<u8>> {
        let handle = self.recv_from_rank_async(source, len)?;
        let (poll_interval, timeout) = self.pool.job_wait_params();
        if !handle.wait(poll_interval, timeout) {
            bail!("Receive from rank {} timed out after {:?}", source, timeout);
        }
        if !handle.succeeded() {
            bail!("Receive from rank {} failed", source);
        }
        handle
            .take_payload()
            .context("Completed receive carried no payload")
    }

    /// Ship a diagnostic record to the coordinator's aggregated log stream.
    /// Fire-and-forget: no barrier, no ack.
    pub fn send_collective_log(&mut self, message: &CollectiveLogMessage) -> Result<()> {
        let payload = message.encode()?;
        let header = self.coordinator_header(MessageKind::CollectiveLog, payload.len() as u32);
        protocol::write_message(&self.log_sock, &header, &payload)
            .context("Failed to send collective log message")?;
        Ok(())
    }

    /// Destroy barrier plus graceful teardown of all three sockets.
    ///
    /// Blocks until every rank has requested destruction and the coordinator
    /// has acknowledged, then half-closes each socket and drains it to EOF so
    /// no in-flight bytes are lost to a reset.
    pub fn close_bootstrap_network(self) -> Result<()> {
        let header = self.coordinator_header(MessageKind::BootstrapCommDestroy, 0);
        protocol::write_message(&self.send_sock, &header, &[])
            .context("Failed to send destroy request")?;

        let ok = protocol::recv_bool(&self.send_sock)
            .context("Failed to receive destroy ack")?;
        if !ok {
            bail!("Coordinator rejected destroy request");
        }

        let drain_timeout = self.config.drain_timeout;
        protocol::graceful_close(&self.send_sock, drain_timeout);
        protocol::graceful_close(&self.recv_sock, drain_timeout);
        protocol::graceful_close(&self.log_sock, drain_timeout);
        self.pool.shutdown();

        if self.config.debug {
            eprintln!("DEBUG: rank {} bootstrap network closed", self.rank);
        }
        Ok(())
    }

    fn coordinator_header(&self, kind: MessageKind, payload_size: u32) -> MessageHeader {
        MessageHeader {
            kind,
            sequence: 0,
            payload_size,
            source_peer: self.rank,
            dest_peer: COORDINATOR_PEER,
        }
    }
}

/// Dial the coordinator with bounded retries and register one role socket.
fn open_and_register(
    unique_id: &UniqueId,
    rank: Rank,
    total_ranks: u32,
    role: SocketRole,
    config: &BootstrapConfig,
) -> Result<TcpStream> {
    let sock = connect_with_retry(unique_id, config).with_context(|| {
        format!(
            "Rank {} could not reach coordinator at {} for its {} socket",
            rank,
            unique_id.addr,
            role.as_str()
        )
    })?;
    sock.set_nodelay(true)
        .context("Failed to set TCP_NODELAY")?;

    let reg = SocketRegistrationInfo {
        total_ranks,
        role,
        rank,
    };
    let header = MessageHeader {
        kind: MessageKind::CommInitNewConn,
        sequence: 0,
        payload_size: SocketRegistrationInfo::WIRE_SIZE as u32,
        source_peer: rank,
        dest_peer: COORDINATOR_PEER,
    };
    protocol::write_message(&sock, &header, &reg.encode())
        .with_context(|| format!("Failed to register {} socket", role.as_str()))?;
    Ok(sock)
}

fn connect_with_retry(unique_id: &UniqueId, config: &BootstrapConfig) -> Result<TcpStream> {
    let mut last_err = None;
    for attempt in 0..config.connect_retries {
        match TcpStream::connect(unique_id.addr) {
            Ok(sock) => return Ok(sock),
            Err(e) => {
                last_err = Some(e);
                if attempt + 1 < config.connect_retries {
                    std::thread::sleep(config.connect_backoff);
                }
            }
        }
    }
    Err(last_err
        .map(anyhow::Error::from)
        .unwrap_or_else(|| anyhow::anyhow!("No connect attempts made")))
    .with_context(|| {
        format!(
            "Giving up on {} after {} attempts",
            unique_id.addr, config.connect_retries
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::time::Duration;

    #[test]
    fn test_connect_retry_gives_up() {
        // A port nothing listens on; grab one, then release it.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let unique_id = UniqueId::new(addr);
        let config = BootstrapConfig {
            connect_retries: 2,
            connect_backoff: Duration::from_millis(10),
            ..BootstrapConfig::default()
        };
        assert!(connect_with_retry(&unique_id, &config).is_err());
    }

    #[test]
    fn test_registration_is_written_on_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let unique_id = UniqueId::new(listener.local_addr().unwrap());
        let config = BootstrapConfig::default();

        let accept = std::thread::spawn(move || {
            let (sock, _) = listener.accept().unwrap();
            let header = protocol::read_header(&sock).unwrap();
            let mut buf = vec![0u8; header.payload_size as usize];
            protocol::recv_full(&sock, &mut buf).unwrap();
            (header, SocketRegistrationInfo::decode(&buf).unwrap())
        });

        let _sock = open_and_register(&unique_id, 3, 8, SocketRole::Log, &config).unwrap();
        let (header, reg) = accept.join().unwrap();

        assert_eq!(header.kind, MessageKind::CommInitNewConn);
        assert_eq!(header.source_peer, 3);
        assert_eq!(header.dest_peer, COORDINATOR_PEER);
        assert_eq!(reg.role, SocketRole::Log);
        assert_eq!(reg.rank, 3);
        assert_eq!(reg.total_ranks, 8);
    }

    #[test]
    fn test_rank_out_of_range_rejected() {
        let unique_id = UniqueId::new("127.0.0.1:1".parse().unwrap());
        let config = BootstrapConfig::default();
        assert!(CoordinatorClient::connect(&unique_id, 4, 4, &config).is_err());
    }
}
