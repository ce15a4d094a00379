//! Rendezvous coordinator
//!
//! The coordinator is the hub every rank registers with and the relay for
//! all bootstrap traffic. Three long-lived threads:
//!
//! - accept thread: polls the listener, accepts connections, and defers
//!   registering them with the poll set to the deferred executor so it never
//!   touches the socket-set mutex itself,
//! - listen thread: polls the registered sockets and dispatches complete
//!   messages one at a time,
//! - deferred executor thread: runs the accept thread's bookkeeping.
//!
//! The listen thread is the only reader of registered sockets, which is what
//! makes single-mutex dispatch sound: a message is read and handled to
//! completion before the next poll.
//!
//! Recv-role sockets are deliberately absent from the poll set. They carry
//! coordinator-to-rank traffic only; the acknowledgement bytes a rank writes
//! back on them are consumed by the relay send jobs, not the dispatch loop.

use crate::config::BootstrapConfig;
use crate::engine::{JobHandle, SocketJob, WorkerThreadPool};
use crate::executor::DeferredTaskExecutor;
use crate::protocol::{
    self, CollectiveLogMessage, MessageHeader, MessageKind, ProtocolError, Rank, RankInfoHeader,
    RemoteDeviceConnectionInfo, SocketRegistrationInfo, SocketRole, UniqueId, ACK_FAIL, ACK_OK,
    COORDINATOR_PEER,
};
use anyhow::{bail, Context, Result};
use rayon::prelude::*;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::File;
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// A socket the listen thread polls. `peer` stays `None` until the first
/// message (which must be a registration) classifies it.
struct PolledSocket {
    stream: TcpStream,
    peer: Option<(Rank, SocketRole)>,
}

/// Role sockets filed per rank, cloned off the polled originals.
#[derive(Default)]
struct RankTable {
    expected_total: Option<u32>,
    send: HashMap<Rank, Arc<TcpStream>>,
    recv: HashMap<Rank, Arc<TcpStream>>,
    log: HashMap<Rank, Arc<TcpStream>>,
}

impl RankTable {
    fn all_connected(&self) -> bool {
        match self.expected_total {
            Some(n) => {
                let n = n as usize;
                self.send.len() == n && self.recv.len() == n && self.log.len() == n
            }
            None => false,
        }
    }
}

/// One collective phase in flight. Exactly one phase can be collecting at a
/// time; a different phase arriving mid-collection is protocol corruption.
#[derive(Default)]
struct BarrierState {
    phase: Option<MessageKind>,
    arrived: HashSet<Rank>,
    rank_infos: HashMap<Rank, RankInfoHeader>,
    endpoints: HashMap<Rank, RemoteDeviceConnectionInfo>,
    handshake1_done: bool,
    handshake2_done: bool,
}

struct Inner {
    config: BootstrapConfig,
    sockets: Mutex<Vec<PolledSocket>>,
    ranks: Mutex<RankTable>,
    barrier: Mutex<BarrierState>,
    logs: Mutex<BTreeMap<Rank, Vec<CollectiveLogMessage>>>,
    validation_error: AtomicBool,
    quit: AtomicBool,
}

/// What the listen loop should do with a polled socket after dispatch.
enum Disposition {
    Keep,
    Remove,
}

pub struct Coordinator {
    inner: Arc<Inner>,
    unique_id: UniqueId,
    accept_thread: Option<JoinHandle<()>>,
    listen_thread: Option<JoinHandle<()>>,
    executor: Option<Arc<DeferredTaskExecutor>>,
}

impl Coordinator {
    /// Bind the rendezvous listener and start the coordinator threads.
    ///
    /// The returned unique id carries the listener's resolved address, so a
    /// port of 0 in the config is fine; `bind_addr` must be one ranks can
    /// actually dial.
    pub fn new(config: BootstrapConfig) -> Result<Self> {
        let listener = TcpListener::bind((config.bind_addr, config.port))
            .with_context(|| format!("Failed to bind coordinator on {}", config.bind_addr))?;
        let addr = listener
            .local_addr()
            .context("Failed to resolve coordinator listen address")?;
        let unique_id = UniqueId::new(addr);

        let inner = Arc::new(Inner {
            config: config.clone(),
            sockets: Mutex::new(Vec::new()),
            ranks: Mutex::new(RankTable::default()),
            barrier: Mutex::new(BarrierState::default()),
            logs: Mutex::new(BTreeMap::new()),
            validation_error: AtomicBool::new(false),
            quit: AtomicBool::new(false),
        });

        let executor = Arc::new(DeferredTaskExecutor::new());
        if !executor.wait_until_ready(config.job_timeout) {
            bail!("Deferred executor did not start within {:?}", config.job_timeout);
        }

        let accept_inner = inner.clone();
        let accept_executor = executor.clone();
        let accept_thread = std::thread::Builder::new()
            .name("collboot-accept".to_string())
            .spawn(move || accept_loop(accept_inner, listener, accept_executor))
            .context("Failed to spawn coordinator accept thread")?;

        let pool = WorkerThreadPool::new(&config);
        let listen_inner = inner.clone();
        let listen_thread = std::thread::Builder::new()
            .name("collboot-listen".to_string())
            .spawn(move || listen_loop(listen_inner, pool))
            .context("Failed to spawn coordinator listen thread")?;

        println!("✅ Coordinator listening on {}", addr);

        Ok(Self {
            inner,
            unique_id,
            accept_thread: Some(accept_thread),
            listen_thread: Some(listen_thread),
            executor: Some(executor),
        })
    }

    /// Rendezvous handle ranks use to find this coordinator.
    pub fn unique_id(&self) -> UniqueId {
        self.unique_id
    }

    /// Block until the destroy barrier (or a fatal error) has stopped the
    /// coordinator, up to `timeout`. Returns false on timeout.
    pub fn wait_for_destroy(&self, timeout: Duration) -> bool {
        // Saturates instead of panicking for callers passing Duration::MAX.
        let deadline = Instant::now().checked_add(timeout);
        while !self.inner.quit.load(Ordering::Acquire) {
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return false;
                }
            }
            std::thread::sleep(self.inner.config.idle_interval);
        }
        true
    }

    /// Stop all threads, close every socket gracefully, and dump the
    /// aggregated log stream if configured.
    pub fn shutdown(mut self) -> Result<()> {
        self.inner.quit.store(true, Ordering::Release);
        if let Some(thread) = self.accept_thread.take() {
            let _ = thread.join();
        }
        if let Some(thread) = self.listen_thread.take() {
            let _ = thread.join();
        }
        // Dropping the executor joins its worker.
        self.executor.take();

        let drain_timeout = self.inner.config.drain_timeout;
        let polled = std::mem::take(&mut *self.inner.sockets.lock().unwrap());
        for socket in &polled {
            protocol::graceful_close(&socket.stream, drain_timeout);
        }
        {
            let mut ranks = self.inner.ranks.lock().unwrap();
            for sock in ranks.recv.values() {
                protocol::graceful_close(sock, drain_timeout);
            }
            ranks.send.clear();
            ranks.recv.clear();
            ranks.log.clear();
        }

        self.dump_logs()?;

        if self.inner.validation_error.load(Ordering::Acquire) {
            eprintln!("Error: one or more ranks reported validation errors during bootstrap");
        }
        Ok(())
    }

    fn dump_logs(&self) -> Result<()> {
        let Some(path) = &self.inner.config.log_dump_path else {
            return Ok(());
        };
        let logs = self.inner.logs.lock().unwrap();
        let file = File::create(path)
            .with_context(|| format!("Failed to create log dump at {}", path.display()))?;
        serde_json::to_writer_pretty(file, &*logs).context("Failed to serialize log dump")?;
        println!(
            "✅ Coordinator wrote {} rank log stream(s) to {}",
            logs.len(),
            path.display()
        );
        Ok(())
    }
}

fn accept_loop(inner: Arc<Inner>, listener: TcpListener, executor: Arc<DeferredTaskExecutor>) {
    let fd = listener.as_raw_fd();
    let mut consecutive_failures = 0u32;

    while !inner.quit.load(Ordering::Acquire) {
        match protocol::poll_readable(fd, inner.config.poll_timeout) {
            Ok(false) => continue,
            Ok(true) => match listener.accept() {
                Ok((stream, remote)) => {
                    consecutive_failures = 0;
                    let _ = stream.set_nodelay(true);
                    if inner.config.debug {
                        eprintln!("DEBUG: coordinator accepted connection from {}", remote);
                    }
                    // The listen loop may be holding the socket-set mutex
                    // mid-poll; registration goes through the executor so
                    // accept never blocks on it.
                    let task_inner = inner.clone();
                    executor.submit(move || {
                        task_inner.sockets.lock().unwrap().push(PolledSocket {
                            stream,
                            peer: None,
                        });
                    });
                }
                Err(e) => {
                    consecutive_failures += 1;
                    if consecutive_failures > inner.config.accept_retries {
                        eprintln!(
                            "Error: coordinator accept failed {} times in a row, giving up: {}",
                            consecutive_failures, e
                        );
                        inner.quit.store(true, Ordering::Release);
                        return;
                    }
                    std::thread::sleep(inner.config.accept_retry_delay);
                }
            },
            Err(e) => {
                eprintln!("Error: coordinator listener poll failed: {}", e);
                inner.quit.store(true, Ordering::Release);
                return;
            }
        }
    }
}

fn listen_loop(inner: Arc<Inner>, pool: WorkerThreadPool) {
    while !inner.quit.load(Ordering::Acquire) {
        let mut sockets = inner.sockets.lock().unwrap();
        if sockets.is_empty() {
            drop(sockets);
            std::thread::sleep(inner.config.idle_interval);
            continue;
        }

        let fds: Vec<RawFd> = sockets.iter().map(|s| s.stream.as_raw_fd()).collect();
        let ready = match protocol::poll_readable_set(&fds, inner.config.poll_timeout) {
            Ok(ready) => ready,
            Err(e) => {
                eprintln!("Error: coordinator socket poll failed: {}", e);
                inner.quit.store(true, Ordering::Release);
                break;
            }
        };

        let mut to_remove = Vec::new();
        for index in ready {
            match dispatch(&inner, &pool, &mut sockets, index) {
                Ok(Disposition::Keep) => {}
                Ok(Disposition::Remove) => to_remove.push(index),
                Err(e) => {
                    eprintln!("Error: coordinator dispatch failed: {:#}", e);
                    inner.quit.store(true, Ordering::Release);
                    break;
                }
            }
        }
        // Indices were collected in ascending order.
        for index in to_remove.into_iter().rev() {
            sockets.remove(index);
        }
    }
    pool.shutdown();
}

/// Read and handle one complete message from a readable socket.
///
/// `Err` is fatal and stops the coordinator; soft failures (a closed or
/// broken peer socket) log and return `Remove`.
fn dispatch(
    inner: &Inner,
    pool: &WorkerThreadPool,
    sockets: &mut [PolledSocket],
    index: usize,
) -> Result<Disposition> {
    let header = match protocol::read_header(&sockets[index].stream) {
        Ok(header) => header,
        Err(ProtocolError::PeerClosed) => {
            if let Some((rank, role)) = sockets[index].peer {
                eprintln!(
                    "Warning: rank {} closed its {} socket unexpectedly",
                    rank,
                    role.as_str()
                );
            }
            return Ok(Disposition::Remove);
        }
        Err(e @ ProtocolError::UnknownMessageKind(_)) => {
            return Err(e).context("Corrupted message header");
        }
        Err(e) => {
            eprintln!("Warning: dropping socket after read error: {}", e);
            return Ok(Disposition::Remove);
        }
    };

    match (header.kind, sockets[index].peer) {
        (MessageKind::CommInitNewConn, None) => handle_registration(inner, sockets, index, &header),
        (MessageKind::CommInitNewConn, Some((rank, _))) => {
            bail!("Rank {} sent a second registration on an already classified socket", rank)
        }
        (_, None) => {
            bail!("Unregistered socket sent {:?} before CommInitNewConn", header.kind)
        }
        (kind, Some((rank, role))) => {
            if header.source_peer != rank {
                bail!(
                    "Socket registered to rank {} sent a message claiming rank {}",
                    rank,
                    header.source_peer
                );
            }
            let stream = &sockets[index].stream;
            match kind {
                MessageKind::CommInitHandshake1 => {
                    expect_role(rank, role, SocketRole::Send, kind)?;
                    expect_coordinator_dest(&header)?;
                    handle_handshake1(inner, stream, &header)?;
                    Ok(Disposition::Keep)
                }
                MessageKind::CommInitHandshake2 => {
                    expect_role(rank, role, SocketRole::Send, kind)?;
                    expect_coordinator_dest(&header)?;
                    handle_handshake2(inner, stream, &header)?;
                    Ok(Disposition::Keep)
                }
                MessageKind::SyncBetweenRanks => {
                    expect_role(rank, role, SocketRole::Send, kind)?;
                    expect_coordinator_dest(&header)?;
                    handle_barrier_only(inner, kind, rank)?;
                    Ok(Disposition::Keep)
                }
                MessageKind::BootstrapCommDestroy => {
                    expect_role(rank, role, SocketRole::Send, kind)?;
                    expect_coordinator_dest(&header)?;
                    handle_destroy(inner, rank)?;
                    Ok(Disposition::Keep)
                }
                MessageKind::DataBetweenRanks => {
                    expect_role(rank, role, SocketRole::Send, kind)?;
                    handle_relay(inner, pool, stream, &header)?;
                    Ok(Disposition::Keep)
                }
                MessageKind::CollectiveLog => {
                    expect_role(rank, role, SocketRole::Log, kind)?;
                    handle_collective_log(inner, stream, &header);
                    Ok(Disposition::Keep)
                }
                MessageKind::CommInitNewConn => unreachable!("handled above"),
            }
        }
    }
}

fn expect_role(rank: Rank, actual: SocketRole, expected: SocketRole, kind: MessageKind) -> Result<()> {
    if actual != expected {
        bail!(
            "Rank {} sent {:?} on its {} socket (expected the {} socket)",
            rank,
            kind,
            actual.as_str(),
            expected.as_str()
        );
    }
    Ok(())
}

fn expect_coordinator_dest(header: &MessageHeader) -> Result<()> {
    if header.dest_peer != COORDINATOR_PEER {
        bail!(
            "{:?} from rank {} addressed to peer {} instead of the coordinator",
            header.kind,
            header.source_peer,
            header.dest_peer
        );
    }
    Ok(())
}

fn read_payload(stream: &TcpStream, header: &MessageHeader) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = vec![0u8; header.payload_size as usize];
    protocol::recv_full(stream, &mut buf)?;
    Ok(buf)
}

fn handle_registration(
    inner: &Inner,
    sockets: &mut [PolledSocket],
    index: usize,
    header: &MessageHeader,
) -> Result<Disposition> {
    let payload = read_payload(&sockets[index].stream, header)
        .context("Failed to read registration payload")?;
    let reg = SocketRegistrationInfo::decode(&payload).context("Corrupted registration")?;

    if reg.rank >= reg.total_ranks {
        bail!(
            "Registration for rank {} out of range for communicator of {}",
            reg.rank,
            reg.total_ranks
        );
    }

    let all_connected = {
        let mut ranks = inner.ranks.lock().unwrap();
        match ranks.expected_total {
            None => ranks.expected_total = Some(reg.total_ranks),
            Some(expected) if expected != reg.total_ranks => {
                bail!(
                    "Rank {} registered with communicator size {} but the first rank said {}",
                    reg.rank,
                    reg.total_ranks,
                    expected
                );
            }
            Some(_) => {}
        }

        let table = match reg.role {
            SocketRole::Send => &mut ranks.send,
            SocketRole::Recv => &mut ranks.recv,
            SocketRole::Log => &mut ranks.log,
        };
        if table.contains_key(&reg.rank) {
            bail!(
                "Duplicate {} socket registration from rank {}",
                reg.role.as_str(),
                reg.rank
            );
        }

        let clone = sockets[index]
            .stream
            .try_clone()
            .context("Failed to clone registered socket")?;
        if reg.role == SocketRole::Recv {
            // Relay workers block on this socket for the delivery ack; bound
            // that read so a rank that never posts a matching receive cannot
            // wedge a worker past the job timeout.
            clone
                .set_read_timeout(Some(inner.config.job_timeout))
                .context("Failed to bound recv socket reads")?;
        }
        table.insert(reg.rank, Arc::new(clone));
        ranks.all_connected()
    };

    sockets[index].peer = Some((reg.rank, reg.role));
    if inner.config.debug {
        eprintln!(
            "DEBUG: registered {} socket for rank {}",
            reg.role.as_str(),
            reg.rank
        );
    }
    if all_connected {
        println!(
            "✅ Coordinator: all {} rank(s) connected",
            inner.ranks.lock().unwrap().expected_total.unwrap_or(0)
        );
    }

    // The dispatch loop never reads relayed traffic; the recv socket's bytes
    // belong to the relay jobs.
    match reg.role {
        SocketRole::Recv => Ok(Disposition::Remove),
        _ => Ok(Disposition::Keep),
    }
}

/// Record an arrival for `phase`, enforcing one phase in flight at a time.
/// Returns the communicator size when this arrival completed the barrier.
fn barrier_arrive(inner: &Inner, barrier: &mut BarrierState, phase: MessageKind, rank: Rank) -> Result<Option<u32>> {
    match barrier.phase {
        None => barrier.phase = Some(phase),
        Some(current) if current == phase => {}
        Some(current) => {
            bail!(
                "Rank {} sent {:?} while a {:?} barrier is collecting",
                rank,
                phase,
                current
            );
        }
    }
    if !barrier.arrived.insert(rank) {
        bail!("Rank {} arrived twice at the {:?} barrier", rank, phase);
    }

    let total = inner
        .ranks
        .lock()
        .unwrap()
        .expected_total
        .context("Barrier arrival before any registration")?;
    if barrier.arrived.len() == total as usize {
        barrier.phase = None;
        barrier.arrived.clear();
        Ok(Some(total))
    } else {
        Ok(None)
    }
}

fn handle_handshake1(inner: &Inner, stream: &TcpStream, header: &MessageHeader) -> Result<()> {
    let payload = read_payload(stream, header).context("Failed to read handshake1 payload")?;
    let info = RankInfoHeader::decode(&payload).context("Corrupted rank info")?;
    let rank = header.source_peer;

    let completed = {
        let mut barrier = inner.barrier.lock().unwrap();
        if barrier.handshake1_done {
            eprintln!(
                "Warning: unexpected CommInitHandshake1 from rank {} after the phase completed, ignoring",
                rank
            );
            return Ok(());
        }
        barrier.rank_infos.insert(rank, info);
        let completed = barrier_arrive(inner, &mut barrier, MessageKind::CommInitHandshake1, rank)?;
        if completed.is_some() {
            barrier.handshake1_done = true;
        }
        completed.map(|total| {
            let mut infos: Vec<RankInfoHeader> = barrier.rank_infos.drain().map(|(_, v)| v).collect();
            infos.sort_by_key(|info| info.rank);
            (total, infos)
        })
    };

    let Some((total, infos)) = completed else {
        return Ok(());
    };

    // Every rank must report the same number of co-located ranks; a ragged
    // topology would break the data-plane setup downstream.
    let box_size = infos[0].box_size;
    if let Some(bad) = infos.iter().find(|info| info.box_size != box_size) {
        bail!(
            "Rank {} reported box size {} but rank {} reported {}",
            infos[0].rank,
            box_size,
            bad.rank,
            bad.box_size
        );
    }

    let table = RankInfoHeader::encode_array(&infos);
    fan_out(inner, total, &table, None).context("Handshake1 fan-out failed")?;
    if inner.config.debug {
        eprintln!("DEBUG: handshake1 complete across {} rank(s)", total);
    }
    Ok(())
}

fn handle_handshake2(inner: &Inner, stream: &TcpStream, header: &MessageHeader) -> Result<()> {
    let payload = read_payload(stream, header).context("Failed to read handshake2 payload")?;
    let endpoint = RemoteDeviceConnectionInfo::decode(&payload).context("Corrupted endpoint info")?;
    let rank = header.source_peer;

    let completed = {
        let mut barrier = inner.barrier.lock().unwrap();
        if barrier.handshake2_done {
            eprintln!(
                "Warning: unexpected CommInitHandshake2 from rank {} after the phase completed, ignoring",
                rank
            );
            return Ok(());
        }
        barrier.endpoints.insert(rank, endpoint);
        let completed = barrier_arrive(inner, &mut barrier, MessageKind::CommInitHandshake2, rank)?;
        if completed.is_some() {
            barrier.handshake2_done = true;
        }
        completed.map(|total| {
            let mut endpoints: Vec<RemoteDeviceConnectionInfo> =
                barrier.endpoints.drain().map(|(_, v)| v).collect();
            endpoints.sort_by_key(|e| e.rank);
            (total, endpoints)
        })
    };

    let Some((total, endpoints)) = completed else {
        return Ok(());
    };

    let table = RemoteDeviceConnectionInfo::encode_array(&endpoints);
    let verdict = !inner.validation_error.load(Ordering::Acquire);
    fan_out(inner, total, &table, Some(verdict)).context("Handshake2 fan-out failed")?;
    if inner.config.debug {
        eprintln!(
            "DEBUG: handshake2 complete across {} rank(s), verdict {}",
            total, verdict
        );
    }
    Ok(())
}

/// Sync barrier: no payload in, one boolean out to everyone on completion.
fn handle_barrier_only(inner: &Inner, phase: MessageKind, rank: Rank) -> Result<()> {
    let completed = {
        let mut barrier = inner.barrier.lock().unwrap();
        barrier_arrive(inner, &mut barrier, phase, rank)?
    };
    if let Some(total) = completed {
        fan_out(inner, total, &[], Some(true)).context("Sync fan-out failed")?;
    }
    Ok(())
}

fn handle_destroy(inner: &Inner, rank: Rank) -> Result<()> {
    let completed = {
        let mut barrier = inner.barrier.lock().unwrap();
        barrier_arrive(inner, &mut barrier, MessageKind::BootstrapCommDestroy, rank)?
    };
    if let Some(total) = completed {
        fan_out(inner, total, &[], Some(true)).context("Destroy fan-out failed")?;
        println!("✅ Coordinator: destroy barrier complete, shutting down");
        inner.quit.store(true, Ordering::Release);
    }
    Ok(())
}

/// Write `payload` (and an optional trailing boolean) to every rank's send
/// socket in parallel. All sends are attempted even if some fail; failures
/// are aggregated into a single error naming the ranks.
fn fan_out(inner: &Inner, total: u32, payload: &[u8], verdict: Option<bool>) -> Result<()> {
    let targets: Vec<(Rank, Arc<TcpStream>)> = {
        let ranks = inner.ranks.lock().unwrap();
        (0..total)
            .map(|rank| {
                ranks
                    .send
                    .get(&rank)
                    .cloned()
                    .map(|sock| (rank, sock))
                    .with_context(|| format!("Rank {} has no registered send socket", rank))
            })
            .collect::<Result<_>>()?
    };

    let failed: Vec<Rank> = targets
        .par_iter()
        .filter_map(|(rank, sock)| {
            let sent = protocol::send_full(sock, payload).and_then(|()| match verdict {
                Some(value) => protocol::send_bool(sock, value),
                None => Ok(()),
            });
            match sent {
                Ok(()) => None,
                Err(e) => {
                    eprintln!("Warning: fan-out to rank {} failed: {}", rank, e);
                    Some(*rank)
                }
            }
        })
        .collect();

    if !failed.is_empty() {
        bail!("Fan-out failed for rank(s) {:?}", failed);
    }
    Ok(())
}

/// Relay a point-to-point message into the destination's recv socket via the
/// worker pool, then answer the source with the delivery verdict.
fn handle_relay(
    inner: &Inner,
    pool: &WorkerThreadPool,
    stream: &TcpStream,
    header: &MessageHeader,
) -> Result<()> {
    let payload = read_payload(stream, header).context("Failed to read relay payload")?;
    let dest = header.dest_peer;

    let dest_sock = inner.ranks.lock().unwrap().recv.get(&dest).cloned();
    let delivered = match dest_sock {
        Some(sock) => {
            let mut wire = Vec::with_capacity(MessageHeader::WIRE_SIZE + payload.len());
            wire.extend_from_slice(&header.encode());
            wire.extend_from_slice(&payload);

            let handle = JobHandle::new();
            pool.submit(SocketJob::Send {
                sock,
                data: wire,
                handle: handle.clone(),
            })?;
            let (poll_interval, timeout) = pool.job_wait_params();
            handle.wait(poll_interval, timeout) && handle.succeeded()
        }
        None => {
            eprintln!(
                "Warning: relay from rank {} to unconnected rank {}, dropping",
                header.source_peer, dest
            );
            false
        }
    };

    let ack = if delivered { ACK_OK } else { ACK_FAIL };
    protocol::send_ack(stream, ack).context("Failed to ack relay to source")?;
    if inner.config.debug {
        eprintln!(
            "DEBUG: relayed {} byte(s) from rank {} to rank {} ({})",
            header.payload_size,
            header.source_peer,
            dest,
            if delivered { "ok" } else { "failed" }
        );
    }
    Ok(())
}

/// Log records are fire-and-forget; a payload that fails to decode is
/// dropped with a warning rather than killing the session.
fn handle_collective_log(inner: &Inner, stream: &TcpStream, header: &MessageHeader) {
    let payload = match read_payload(stream, header) {
        Ok(payload) => payload,
        Err(e) => {
            eprintln!("Warning: failed to read collective log payload: {}", e);
            return;
        }
    };
    let record = match CollectiveLogMessage::decode(&payload) {
        Ok(record) => record,
        Err(e) => {
            eprintln!("Warning: dropping undecodable collective log record: {:#}", e);
            return;
        }
    };
    if record.validation_error {
        inner.validation_error.store(true, Ordering::Release);
    }
    inner
        .logs
        .lock()
        .unwrap()
        .entry(record.rank)
        .or_default()
        .push(record);
}
