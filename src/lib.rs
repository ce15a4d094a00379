//! collboot - Out-of-band bootstrap layer for collective communication
//!
//! Before a multi-rank communicator can move data over its fast transport,
//! every rank has to find every other rank. collboot provides that
//! rendezvous: a coordinator process that ranks register with over TCP, a
//! per-rank client for the handshake/sync/point-to-point operations, and the
//! blocking-socket engine both sides run on.
//!
//! # Architecture
//!
//! - **Coordinator**: accept + listen threads, barrier collection, relay
//! - **Client**: three role sockets per rank (send, recv, log)
//! - **Engine**: worker thread pool over lock-free job rings, plus one async
//!   connection thread per multiplexed connection
//! - **Protocol**: fixed-layout native-endian framing, bincode for the
//!   opaque handle and log records

pub mod client;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod executor;
pub mod protocol;
pub mod queue;

pub use client::CoordinatorClient;
pub use config::BootstrapConfig;
pub use coordinator::Coordinator;
pub use protocol::{CollectiveLogMessage, Rank, UniqueId};

/// Result type used throughout collboot
pub type Result<T> = anyhow::Result<T>;
