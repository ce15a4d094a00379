//! Async connection thread
//!
//! One thread per established persistent multiplexed connection. It keeps,
//! per remote peer, a FIFO of outstanding async receive requests
//! (`expected[peer]`) and a side list of fully-received-but-unmatched
//! messages (`pending`). Together these make out-of-order, multi-peer async
//! receive correct over a single shared socket without a thread per
//! peer-pair.
//!
//! # Deadlock avoidance
//!
//! When a message arrives from a peer nobody is currently expecting, but
//! some *other* peer has outstanding requests, the thread still receives the
//! full payload and parks it in `pending`. Refusing to drain the socket here
//! would let a head-of-line peer starve delivery to a peer whose data
//! already sits in the OS socket buffer.
//!
//! # Wait strategy
//!
//! The thread never blocks on the socket with nothing expected; it sleeps in
//! bounded poll intervals and re-checks, so a quit request is always
//! observed promptly.

use crate::config::BootstrapConfig;
use crate::engine::JobHandle;
use crate::protocol::{self, MessageHeader, MessageKind, Rank, ACK_OK};
use anyhow::{bail, Context, Result};
use std::collections::{HashMap, VecDeque};
use std::net::TcpStream;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// An outstanding async receive request, keyed by `(peer, sequence)`.
pub struct AsyncJob {
    pub peer: Rank,
    pub sequence: u32,
    pub len: usize,
    pub handle: JobHandle,
}

/// A message that arrived before its matching request was registered: header
/// plus the already-fully-received payload.
struct PendingJob {
    header: MessageHeader,
    data: Vec<u8>,
}

struct AsyncShared {
    expected: Mutex<HashMap<Rank, VecDeque<AsyncJob>>>,
    quit: AtomicBool,
}

/// Producer-side handle: registers expectations with the connection thread.
#[derive(Clone)]
pub struct AsyncConnectionHandle {
    shared: Arc<AsyncShared>,
}

impl AsyncConnectionHandle {
    /// Register an expectation; completion is observed via the job's handle.
    pub fn post(&self, job: AsyncJob) {
        self.shared
            .expected
            .lock()
            .unwrap()
            .entry(job.peer)
            .or_default()
            .push_back(job);
    }
}

pub struct AsyncConnectionThread {
    shared: Arc<AsyncShared>,
    thread: Option<JoinHandle<()>>,
}

impl AsyncConnectionThread {
    pub fn spawn(sock: TcpStream, local_rank: Rank, config: &BootstrapConfig) -> Result<Self> {
        let shared = Arc::new(AsyncShared {
            expected: Mutex::new(HashMap::new()),
            quit: AtomicBool::new(false),
        });

        let thread_shared = shared.clone();
        let poll_timeout = config.poll_timeout;
        let idle = config.idle_interval;
        let thread = std::thread::Builder::new()
            .name(format!("collboot-async-{}", local_rank))
            .spawn(move || {
                if let Err(e) = conn_loop(&sock, local_rank, &thread_shared, poll_timeout, idle) {
                    eprintln!(
                        "Error: async connection thread for rank {} aborting: {:#}",
                        local_rank, e
                    );
                }
                fail_outstanding(&thread_shared);
            })
            .context("Failed to spawn async connection thread")?;

        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> AsyncConnectionHandle {
        AsyncConnectionHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn stop(&mut self) {
        self.shared.quit.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for AsyncConnectionThread {
    fn drop(&mut self) {
        self.stop();
    }
}

fn conn_loop(
    sock: &TcpStream,
    local_rank: Rank,
    shared: &AsyncShared,
    poll_timeout: Duration,
    idle: Duration,
) -> Result<()> {
    let fd = sock.as_raw_fd();
    let mut pending: Vec<PendingJob> = Vec::new();

    while !shared.quit.load(Ordering::Acquire) {
        drain_pending(shared, &mut pending)?;

        // Never block on the socket with nothing expected.
        let any_expected = {
            let expected = shared.expected.lock().unwrap();
            expected.values().any(|queue| !queue.is_empty())
        };
        if !any_expected {
            std::thread::sleep(idle);
            continue;
        }

        if !protocol::poll_readable(fd, poll_timeout)? {
            continue;
        }

        let header = protocol::read_header(sock).context("Failed to read async message header")?;
        if header.kind != MessageKind::DataBetweenRanks {
            bail!(
                "Async connection received {:?}, expected DataBetweenRanks (protocol corruption)",
                header.kind
            );
        }
        if header.dest_peer != local_rank {
            bail!(
                "Async message addressed to rank {} arrived at rank {} (protocol corruption)",
                header.dest_peer,
                local_rank
            );
        }

        handle_inbound(sock, shared, &mut pending, header)?;
    }

    Ok(())
}

/// Deliver parked messages whose expectation has since been registered.
fn drain_pending(shared: &AsyncShared, pending: &mut Vec<PendingJob>) -> Result<()> {
    let mut index = 0;
    while index < pending.len() {
        let matched_job = {
            let mut expected = shared.expected.lock().unwrap();
            let peer = pending[index].header.source_peer;
            match expected.get_mut(&peer) {
                Some(queue) if !queue.is_empty() => {
                    let entry = &pending[index];
                    let front = queue.front().unwrap();
                    if front.len != entry.data.len() || front.sequence != entry.header.sequence {
                        let job = queue.pop_front().unwrap();
                        job.handle.complete(false);
                        bail!(
                            "Async request mismatch from rank {}: expected seq {} len {}, \
                             pending message has seq {} len {}",
                            peer,
                            job.sequence,
                            job.len,
                            entry.header.sequence,
                            entry.data.len()
                        );
                    }
                    Some(queue.pop_front().unwrap())
                }
                _ => None,
            }
        };

        match matched_job {
            Some(job) => {
                let entry = pending.remove(index);
                job.handle.complete_with_payload(entry.data);
                // Keep scanning from the same index after removal.
            }
            None => index += 1,
        }
    }
    Ok(())
}

/// Match one freshly read header against the expectation FIFOs, receiving
/// the payload into the matched request or the pending list.
///
/// The caller only reads a header once some peer has a non-empty FIFO, and
/// expectations are consumed on this thread alone, so exactly two cases
/// exist here: the source's FIFO front matches, or a different peer is
/// waiting and the message is parked under the deadlock-avoidance rule.
fn handle_inbound(
    sock: &TcpStream,
    shared: &AsyncShared,
    pending: &mut Vec<PendingJob>,
    header: MessageHeader,
) -> Result<()> {
    let source = header.source_peer;
    let payload_len = header.payload_size as usize;

    let matched = {
        let mut expected = shared.expected.lock().unwrap();
        match expected.get_mut(&source).filter(|queue| !queue.is_empty()) {
            Some(queue) => {
                let front = queue.front().unwrap();
                if front.len != payload_len || front.sequence != header.sequence {
                    let job = queue.pop_front().unwrap();
                    job.handle.complete(false);
                    bail!(
                        "Async request mismatch from rank {}: expected seq {} len {}, \
                         inbound message has seq {} len {}",
                        source,
                        job.sequence,
                        job.len,
                        header.sequence,
                        payload_len
                    );
                }
                Some(queue.pop_front().unwrap())
            }
            // Deadlock-avoidance rule: drain the socket even though the
            // source has no expectation yet, so another peer's data is not
            // starved behind this message.
            None => None,
        }
    };

    let mut buf = vec![0u8; payload_len];
    let received = protocol::recv_full(sock, &mut buf)
        .and_then(|()| protocol::send_ack(sock, ACK_OK));
    if let Err(e) = received {
        // A popped job is out of reach of the exit-time cleanup; its waiter
        // has to learn about the failure here.
        if let Some(job) = &matched {
            job.handle.complete(false);
        }
        return Err(e).context("Failed to receive async payload");
    }

    match matched {
        Some(job) => job.handle.complete_with_payload(buf),
        None => pending.push(PendingJob { header, data: buf }),
    }
    Ok(())
}

fn fail_outstanding(shared: &AsyncShared) {
    let mut expected = shared.expected.lock().unwrap();
    for queue in expected.values_mut() {
        for job in queue.drain(..) {
            job.handle.complete(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    fn test_config() -> BootstrapConfig {
        BootstrapConfig {
            poll_timeout: Duration::from_millis(10),
            idle_interval: Duration::from_micros(200),
            ..BootstrapConfig::default()
        }
    }

    fn data_header(seq: u32, len: usize, source: Rank, dest: Rank) -> MessageHeader {
        MessageHeader {
            kind: MessageKind::DataBetweenRanks,
            sequence: seq,
            payload_size: len as u32,
            source_peer: source,
            dest_peer: dest,
        }
    }

    fn read_ack(stream: &mut TcpStream) -> u32 {
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).unwrap();
        u32::from_ne_bytes(buf)
    }

    #[test]
    fn test_expectation_then_message() {
        let (local, mut remote) = socket_pair();
        let mut conn = AsyncConnectionThread::spawn(local, 1, &test_config()).unwrap();

        let handle = JobHandle::new();
        conn.handle().post(AsyncJob {
            peer: 0,
            sequence: 0,
            len: 8,
            handle: handle.clone(),
        });

        let payload = [7u8; 8];
        remote
            .write_all(&data_header(0, 8, 0, 1).encode())
            .unwrap();
        remote.write_all(&payload).unwrap();

        assert!(handle.wait(Duration::from_millis(1), Duration::from_secs(5)));
        assert!(handle.succeeded());
        assert_eq!(handle.take_payload().unwrap(), payload);
        assert_eq!(read_ack(&mut remote), ACK_OK);

        conn.stop();
    }

    #[test]
    fn test_pending_list_interleaved_peers() {
        // Peer 0's message arrives before its expectation is registered;
        // peer 2's arrives after. Both must be delivered exactly once.
        let (local, mut remote) = socket_pair();
        let mut conn = AsyncConnectionThread::spawn(local, 1, &test_config()).unwrap();
        let handle_conn = conn.handle();

        // Only peer 2 is expected when peer 0's message arrives.
        let handle_b = JobHandle::new();
        handle_conn.post(AsyncJob {
            peer: 2,
            sequence: 0,
            len: 4,
            handle: handle_b.clone(),
        });

        remote
            .write_all(&data_header(0, 6, 0, 1).encode())
            .unwrap();
        remote.write_all(b"from-0").unwrap();
        // The deadlock-avoidance rule drains peer 0's payload into pending.
        assert_eq!(read_ack(&mut remote), ACK_OK);

        remote
            .write_all(&data_header(0, 4, 2, 1).encode())
            .unwrap();
        remote.write_all(b"fr-2").unwrap();
        assert_eq!(read_ack(&mut remote), ACK_OK);

        assert!(handle_b.wait(Duration::from_millis(1), Duration::from_secs(5)));
        assert_eq!(handle_b.take_payload().unwrap(), b"fr-2");

        // Registering peer 0's expectation releases the parked message.
        let handle_a = JobHandle::new();
        handle_conn.post(AsyncJob {
            peer: 0,
            sequence: 0,
            len: 6,
            handle: handle_a.clone(),
        });

        assert!(handle_a.wait(Duration::from_millis(1), Duration::from_secs(5)));
        assert!(handle_a.succeeded());
        assert_eq!(handle_a.take_payload().unwrap(), b"from-0");

        conn.stop();
    }

    #[test]
    fn test_size_mismatch_fails_request() {
        let (local, mut remote) = socket_pair();
        let mut conn = AsyncConnectionThread::spawn(local, 1, &test_config()).unwrap();

        let handle = JobHandle::new();
        conn.handle().post(AsyncJob {
            peer: 0,
            sequence: 0,
            len: 4,
            handle: handle.clone(),
        });

        // 8-byte payload against a 4-byte expectation.
        remote
            .write_all(&data_header(0, 8, 0, 1).encode())
            .unwrap();
        remote.write_all(&[0u8; 8]).unwrap();

        assert!(handle.wait(Duration::from_millis(1), Duration::from_secs(5)));
        assert!(!handle.succeeded());

        conn.stop();
    }

    #[test]
    fn test_peer_close_mid_payload_fails_request() {
        // The peer dies after the header and half the payload. The matched
        // request must fail promptly instead of leaving its waiter to burn
        // the full job timeout.
        let (local, mut remote) = socket_pair();
        let mut conn = AsyncConnectionThread::spawn(local, 1, &test_config()).unwrap();

        let handle = JobHandle::new();
        conn.handle().post(AsyncJob {
            peer: 0,
            sequence: 0,
            len: 8,
            handle: handle.clone(),
        });

        remote.write_all(&data_header(0, 8, 0, 1).encode()).unwrap();
        remote.write_all(&[0u8; 4]).unwrap();
        drop(remote);

        assert!(handle.wait(Duration::from_millis(1), Duration::from_secs(5)));
        assert!(!handle.succeeded());

        conn.stop();
    }

    #[test]
    fn test_sequence_numbers_ordered_per_peer() {
        let (local, mut remote) = socket_pair();
        let mut conn = AsyncConnectionThread::spawn(local, 3, &test_config()).unwrap();
        let handle_conn = conn.handle();

        let first = JobHandle::new();
        let second = JobHandle::new();
        handle_conn.post(AsyncJob {
            peer: 0,
            sequence: 0,
            len: 2,
            handle: first.clone(),
        });
        handle_conn.post(AsyncJob {
            peer: 0,
            sequence: 1,
            len: 2,
            handle: second.clone(),
        });

        remote.write_all(&data_header(0, 2, 0, 3).encode()).unwrap();
        remote.write_all(b"aa").unwrap();
        assert_eq!(read_ack(&mut remote), ACK_OK);
        remote.write_all(&data_header(1, 2, 0, 3).encode()).unwrap();
        remote.write_all(b"bb").unwrap();
        assert_eq!(read_ack(&mut remote), ACK_OK);

        assert!(first.wait(Duration::from_millis(1), Duration::from_secs(5)));
        assert!(second.wait(Duration::from_millis(1), Duration::from_secs(5)));
        assert_eq!(first.take_payload().unwrap(), b"aa");
        assert_eq!(second.take_payload().unwrap(), b"bb");

        conn.stop();
    }
}
