//! collboot CLI entry point

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use collboot::config::BootstrapConfig;
use collboot::coordinator::Coordinator;
use collboot::protocol::{RemoteDeviceConnectionInfo, UniqueId};
use collboot::CoordinatorClient;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "collboot", version, about = "Bootstrap rendezvous for collective communicators")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable debug diagnostics on stderr
    #[arg(long, global = true, env = "COLLBOOT_DEBUG")]
    debug: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Run the rendezvous coordinator
    Coordinator {
        /// Address to bind the listen socket to
        #[arg(long, default_value = "0.0.0.0")]
        bind: IpAddr,

        /// Listen port (0 picks a free one)
        #[arg(long, default_value_t = 0)]
        port: u16,

        /// Write the rendezvous handle here for ranks to pick up
        #[arg(long, default_value = "collboot.id")]
        id_file: PathBuf,

        /// Dump the aggregated per-rank log stream as JSON at shutdown
        #[arg(long)]
        log_dump: Option<PathBuf>,

        /// Give up if the destroy barrier has not completed after this many
        /// seconds (0 waits forever)
        #[arg(long, default_value_t = 0)]
        timeout_secs: u64,
    },

    /// Run one rank through the full bootstrap sequence (smoke test)
    Rank {
        /// Rendezvous handle written by the coordinator
        #[arg(long, default_value = "collboot.id")]
        id_file: PathBuf,

        /// This rank's index
        #[arg(long)]
        rank: u32,

        /// Communicator size
        #[arg(long)]
        total_ranks: u32,

        /// Co-located ranks on this host
        #[arg(long, default_value_t = 1)]
        box_size: u32,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Coordinator {
            bind,
            port,
            id_file,
            log_dump,
            timeout_secs,
        } => run_coordinator(bind, port, id_file, log_dump, timeout_secs, cli.debug),
        Command::Rank {
            id_file,
            rank,
            total_ranks,
            box_size,
        } => run_rank(id_file, rank, total_ranks, box_size, cli.debug),
    }
}

fn run_coordinator(
    bind: IpAddr,
    port: u16,
    id_file: PathBuf,
    log_dump: Option<PathBuf>,
    timeout_secs: u64,
    debug: bool,
) -> Result<()> {
    let config = BootstrapConfig {
        bind_addr: bind,
        port,
        log_dump_path: log_dump,
        debug,
        ..BootstrapConfig::default()
    };

    let coordinator = Coordinator::new(config)?;
    coordinator
        .unique_id()
        .to_file(&id_file)
        .context("Failed to publish rendezvous handle")?;
    println!("✅ Rendezvous handle written to {}", id_file.display());

    let timeout = if timeout_secs == 0 {
        Duration::MAX
    } else {
        Duration::from_secs(timeout_secs)
    };
    if !coordinator.wait_for_destroy(timeout) {
        eprintln!("Warning: destroy barrier did not complete within {}s", timeout_secs);
    }
    coordinator.shutdown()
}

/// Drive one rank through handshake1, handshake2, a sync barrier, and
/// destroy. Useful for validating a deployment before wiring in a real
/// data plane.
fn run_rank(
    id_file: PathBuf,
    rank: u32,
    total_ranks: u32,
    box_size: u32,
    debug: bool,
) -> Result<()> {
    let unique_id = UniqueId::from_file(&id_file)?;
    let config = BootstrapConfig {
        debug,
        ..BootstrapConfig::default()
    };

    let mut client = CoordinatorClient::connect(&unique_id, rank, total_ranks, &config)?;

    let table = client.comm_init_handshake1(box_size)?;
    println!("✅ Rank {}: handshake1 complete, {} rank(s) in table", rank, table.len());

    let endpoint = RemoteDeviceConnectionInfo {
        rank,
        device_index: 0,
        addr: [0u8; 16],
        port: 0,
    };
    let endpoints = client.comm_init_handshake2(&endpoint)?;
    println!("✅ Rank {}: handshake2 complete, {} endpoint(s)", rank, endpoints.len());

    client.sync_between_ranks()?;
    println!("✅ Rank {}: sync barrier complete", rank);

    client.close_bootstrap_network()?;
    println!("✅ Rank {}: bootstrap network closed", rank);
    Ok(())
}
