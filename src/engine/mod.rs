//! Async socket execution engine
//!
//! Worker threads pull jobs from lock-free rings and execute blocking
//! send/recv with a 4-byte acknowledgement handshake:
//!
//! - `SEND`: full-buffer send, then a blocking receive of the ack value;
//!   success iff the ack equals [`ACK_OK`](crate::protocol::ACK_OK).
//! - `RECV`: full-buffer receive, then send of the ack sentinel.
//!
//! Jobs are round-robin assigned to the workers at submission time; each
//! worker is the single consumer of its own ring. A worker that hits an I/O
//! error aborts its loop (fatal) rather than retrying indefinitely — the
//! bootstrap channel treats a broken socket exchange as unrecoverable for
//! the job's owner.
//!
//! The pool also owns the [`AsyncConnectionThread`](async_conn)s, one per
//! established persistent multiplexed connection.

pub mod async_conn;

pub use async_conn::{AsyncConnectionHandle, AsyncConnectionThread, AsyncJob};

use crate::config::BootstrapConfig;
use crate::protocol::{self, ProtocolError, Rank, ACK_FAIL, ACK_OK};
use crate::queue::JobQueue;
use anyhow::{Context, Result};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Completion handle shared between a job's submitter and the thread that
/// eventually executes it.
///
/// The payload buffer is owned by the job until completion and handed to the
/// handle exactly once; the submitter takes it out exactly once.
#[derive(Clone)]
pub struct JobHandle {
    state: Arc<HandleState>,
}

struct HandleState {
    done: AtomicBool,
    success: AtomicBool,
    payload: Mutex<Option<Vec<u8>>>,
}

impl JobHandle {
    pub fn new() -> Self {
        Self {
            state: Arc::new(HandleState {
                done: AtomicBool::new(false),
                success: AtomicBool::new(false),
                payload: Mutex::new(None),
            }),
        }
    }

    pub fn is_done(&self) -> bool {
        self.state.done.load(Ordering::Acquire)
    }

    /// Only meaningful once `is_done` returns true.
    pub fn succeeded(&self) -> bool {
        self.state.success.load(Ordering::Acquire)
    }

    /// Mark the job finished. Success is published before the done flag so a
    /// waiter that observes `done` sees the final outcome.
    pub fn complete(&self, success: bool) {
        self.state.success.store(success, Ordering::Release);
        self.state.done.store(true, Ordering::Release);
    }

    pub fn complete_with_payload(&self, data: Vec<u8>) {
        *self.state.payload.lock().unwrap() = Some(data);
        self.complete(true);
    }

    pub fn take_payload(&self) -> Option<Vec<u8>> {
        self.state.payload.lock().unwrap().take()
    }

    /// Bounded wait for completion; returns false on timeout.
    pub fn wait(&self, poll_interval: Duration, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.is_done() {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(poll_interval);
        }
        true
    }
}

impl Default for JobHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// A blocking socket exchange executed by a worker thread.
pub enum SocketJob {
    /// Send the buffer, then block for the 4-byte ack.
    Send {
        sock: Arc<TcpStream>,
        data: Vec<u8>,
        handle: JobHandle,
    },
    /// Receive exactly `len` bytes, then send the ack sentinel.
    Recv {
        sock: Arc<TcpStream>,
        len: usize,
        handle: JobHandle,
    },
}

impl SocketJob {
    pub fn handle(&self) -> &JobHandle {
        match self {
            SocketJob::Send { handle, .. } => handle,
            SocketJob::Recv { handle, .. } => handle,
        }
    }

    /// Execute the exchange.
    ///
    /// `Ok` means the worker may continue (even if the job itself failed
    /// softly, e.g. a negative relay ack); `Err` is an I/O or protocol
    /// failure that aborts the worker loop.
    fn execute(&self) -> Result<(), ProtocolError> {
        match self {
            SocketJob::Send { sock, data, handle } => {
                let exchange = protocol::send_full(sock, data)
                    .and_then(|()| protocol::recv_ack(sock));
                match exchange {
                    Ok(ACK_OK) => {
                        handle.complete(true);
                        Ok(())
                    }
                    Ok(ACK_FAIL) => {
                        // Peer reported the exchange failed on its side;
                        // the job fails, the worker survives.
                        handle.complete(false);
                        Ok(())
                    }
                    Ok(other) => {
                        handle.complete(false);
                        Err(ProtocolError::BadAck(other))
                    }
                    Err(e) => {
                        handle.complete(false);
                        Err(e)
                    }
                }
            }
            SocketJob::Recv { sock, len, handle } => {
                let mut buf = vec![0u8; *len];
                let exchange = protocol::recv_full(sock, &mut buf)
                    .and_then(|()| protocol::send_ack(sock, ACK_OK));
                match exchange {
                    Ok(()) => {
                        handle.complete_with_payload(buf);
                        Ok(())
                    }
                    Err(e) => {
                        handle.complete(false);
                        Err(e)
                    }
                }
            }
        }
    }
}

struct WorkerSlot {
    queue: Arc<JobQueue<SocketJob>>,
    thread: Option<JoinHandle<()>>,
}

/// Pool of socket worker threads plus the async connection threads it owns.
pub struct WorkerThreadPool {
    workers: Vec<WorkerSlot>,
    next_worker: AtomicUsize,
    quit: Arc<AtomicBool>,
    async_conns: Vec<AsyncConnectionThread>,
    submit_retries: u32,
    idle_interval: Duration,
    config: BootstrapConfig,
}

impl WorkerThreadPool {
    pub fn new(config: &BootstrapConfig) -> Self {
        let quit = Arc::new(AtomicBool::new(false));
        let workers = (0..config.worker_threads.max(1))
            .map(|id| {
                let queue = Arc::new(JobQueue::new(config.queue_capacity));
                let worker_queue = queue.clone();
                let worker_quit = quit.clone();
                let idle = config.idle_interval;
                let thread = std::thread::Builder::new()
                    .name(format!("collboot-worker-{}", id))
                    .spawn(move || worker_loop(id, worker_queue, worker_quit, idle))
                    .expect("Failed to spawn socket worker thread");
                WorkerSlot {
                    queue,
                    thread: Some(thread),
                }
            })
            .collect();

        Self {
            workers,
            next_worker: AtomicUsize::new(0),
            quit,
            async_conns: Vec::new(),
            submit_retries: config.submit_retries,
            idle_interval: config.idle_interval,
            config: config.clone(),
        }
    }

    /// Round-robin a job onto one worker's ring.
    ///
    /// Retries a bounded number of times if the ring is momentarily full;
    /// exhausting the bound fails the job's handle and returns an error.
    pub fn submit(&self, job: SocketJob) -> Result<()> {
        let index = self.next_worker.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        let queue = &self.workers[index].queue;

        let mut job = job;
        for _ in 0..self.submit_retries {
            match queue.push(job) {
                Ok(()) => return Ok(()),
                Err(back) => {
                    job = back;
                    std::thread::yield_now();
                }
            }
        }
        job.handle().complete(false);
        anyhow::bail!(
            "Socket worker {} job ring stayed full after {} retries",
            index,
            self.submit_retries
        );
    }

    /// Spawn and take ownership of an async connection thread for an
    /// established persistent connection.
    pub fn spawn_async_connection(
        &mut self,
        sock: TcpStream,
        local_rank: Rank,
    ) -> Result<AsyncConnectionHandle> {
        let conn = AsyncConnectionThread::spawn(sock, local_rank, &self.config)
            .context("Failed to spawn async connection thread")?;
        let handle = conn.handle();
        self.async_conns.push(conn);
        Ok(handle)
    }

    pub fn job_wait_params(&self) -> (Duration, Duration) {
        (self.idle_interval, self.config.job_timeout)
    }

    /// Stop workers and async connection threads and join them all.
    pub fn shutdown(mut self) {
        self.quit.store(true, Ordering::Release);
        for worker in &mut self.workers {
            if let Some(thread) = worker.thread.take() {
                let _ = thread.join();
            }
        }
        for conn in &mut self.async_conns {
            conn.stop();
        }
    }
}

fn worker_loop(id: usize, queue: Arc<JobQueue<SocketJob>>, quit: Arc<AtomicBool>, idle: Duration) {
    while !quit.load(Ordering::Acquire) {
        // Execute while peeked; pop only after a survivable outcome so the
        // ring always owns in-flight jobs.
        let outcome = queue.peek().map(SocketJob::execute);
        match outcome {
            Some(Ok(())) => {
                drop(queue.pop());
            }
            Some(Err(e)) => {
                eprintln!("Error: socket worker {} aborting: {}", id, e);
                return;
            }
            None => {
                std::thread::sleep(idle);
            }
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
            worker_threads: 2,
            queue_capacity: 8,
            idle_interval: Duration::from_micros(200),
            ..BootstrapConfig::default()
        }
    }

    #[test]
    fn test_send_recv_job_pair() {
        let config = test_config();
        let pool = WorkerThreadPool::new(&config);
        let (a, b) = socket_pair();
        let a = Arc::new(a);
        let b = Arc::new(b);

        let payload = vec![0xAB; 4096];
        let send_handle = JobHandle::new();
        let recv_handle = JobHandle::new();

        pool.submit(SocketJob::Recv {
            sock: b,
            len: payload.len(),
            handle: recv_handle.clone(),
        })
        .unwrap();
        pool.submit(SocketJob::Send {
            sock: a,
            data: payload.clone(),
            handle: send_handle.clone(),
        })
        .unwrap();

        assert!(send_handle.wait(Duration::from_millis(1), Duration::from_secs(5)));
        assert!(recv_handle.wait(Duration::from_millis(1), Duration::from_secs(5)));
        assert!(send_handle.succeeded());
        assert!(recv_handle.succeeded());
        assert_eq!(recv_handle.take_payload().unwrap(), payload);

        pool.shutdown();
    }

    #[test]
    fn test_send_job_sees_negative_ack() {
        let config = test_config();
        let pool = WorkerThreadPool::new(&config);
        let (a, mut b) = socket_pair();

        let handle = JobHandle::new();
        pool.submit(SocketJob::Send {
            sock: Arc::new(a),
            data: vec![1, 2, 3],
            handle: handle.clone(),
        })
        .unwrap();

        // Peer drains the payload, then reports failure.
        let mut buf = [0u8; 3];
        b.read_exact(&mut buf).unwrap();
        b.write_all(&ACK_FAIL.to_ne_bytes()).unwrap();

        assert!(handle.wait(Duration::from_millis(1), Duration::from_secs(5)));
        assert!(!handle.succeeded());

        pool.shutdown();
    }

    #[test]
    fn test_recv_job_fails_on_peer_close() {
        let config = test_config();
        let pool = WorkerThreadPool::new(&config);
        let (a, b) = socket_pair();
        drop(b);

        let handle = JobHandle::new();
        pool.submit(SocketJob::Recv {
            sock: Arc::new(a),
            len: 16,
            handle: handle.clone(),
        })
        .unwrap();

        assert!(handle.wait(Duration::from_millis(1), Duration::from_secs(5)));
        assert!(!handle.succeeded());

        pool.shutdown();
    }

    #[test]
    fn test_handle_wait_times_out() {
        let handle = JobHandle::new();
        assert!(!handle.wait(Duration::from_millis(1), Duration::from_millis(20)));
        handle.complete(true);
        assert!(handle.wait(Duration::from_millis(1), Duration::from_millis(20)));
    }
}
