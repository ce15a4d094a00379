//! Bootstrap configuration
//!
//! Every retry bound, poll timeout, and spin interval in the bootstrap layer
//! is explicit configuration — unbounded spinning is a correctness and
//! performance risk, so nothing is hard-coded in the loops themselves.
//!
//! Loading configuration from files is handled by the surrounding system;
//! this crate only defines the knobs and their defaults.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    /// Address the coordinator binds its listen socket to.
    pub bind_addr: IpAddr,

    /// Listen port; 0 lets the OS pick (the chosen port travels in the
    /// unique-id handle).
    pub port: u16,

    /// Bounded `connect()` retries with backoff before a rank gives up on
    /// the coordinator.
    pub connect_retries: u32,
    pub connect_backoff: Duration,

    /// Bounded `accept()` retries on transient error before the accept loop
    /// is considered fatally broken.
    pub accept_retries: u32,
    pub accept_retry_delay: Duration,

    /// Poll timeout for the accept/listen loops and the async connection
    /// thread; this bound is how every loop observes a quit request.
    pub poll_timeout: Duration,

    /// Socket worker threads per pool.
    pub worker_threads: usize,

    /// Slots per worker job ring (usable capacity is one less).
    pub queue_capacity: usize,

    /// Bounded yield-retry count when a job ring is momentarily full.
    pub submit_retries: u32,

    /// Sleep interval for idle worker threads and spin-yield fallbacks.
    pub idle_interval: Duration,

    /// Upper bound on waiting for a submitted job to complete (relay sends,
    /// `send_to_rank` acks).
    pub job_timeout: Duration,

    /// Upper bound on draining a half-closed socket to EOF at teardown.
    pub drain_timeout: Duration,

    /// Where to dump the aggregated per-rank log stream as JSON at teardown
    /// (None disables the dump).
    pub log_dump_path: Option<PathBuf>,

    /// Gate for DEBUG diagnostics on stderr.
    pub debug: bool,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
            connect_retries: 30,
            connect_backoff: Duration::from_secs(1),
            accept_retries: 5,
            accept_retry_delay: Duration::from_millis(100),
            poll_timeout: Duration::from_millis(100),
            worker_threads: num_cpus::get().clamp(1, 4),
            queue_capacity: 64,
            submit_retries: 10_000,
            idle_interval: Duration::from_millis(1),
            job_timeout: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(2),
            log_dump_path: None,
            debug: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_bounded() {
        let config = BootstrapConfig::default();
        assert!(config.worker_threads >= 1);
        assert!(config.queue_capacity >= 2);
        assert!(config.connect_retries > 0);
        assert!(config.poll_timeout > Duration::ZERO);
        assert!(config.job_timeout > config.idle_interval);
    }
}
