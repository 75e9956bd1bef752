use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use smoltcp::wire::{EthernetAddress, Ipv4Address};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mvirt_wlan::RxConfig;
use mvirt_wlan::datapath::packet::{build_arp_request_frame, build_unicast_frame};
use mvirt_wlan::datapath::{
    OpMode, PacketList, Peer, PeerTable, RxBuffer, RxDeliver, TxPath, Vdev, WorkerEvent,
    spawn_rx_worker,
};
use mvirt_wlan::sim::{SimError, SimFrame, SoftDevice};

#[derive(Parser, Debug)]
#[command(name = "mvirt-wlan")]
#[command(version, about = "mvirt Wi-Fi receive datapath", long_about = None)]
struct Args {
    /// JSON configuration file; defaults apply without one
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Drive the datapath with emulated traffic and print the counters
    Simulate {
        /// Frames to receive
        #[arg(short, long, default_value_t = 10_000)]
        frames: usize,

        /// Associated stations
        #[arg(short, long, default_value_t = 8)]
        peers: u16,

        /// Share of frames sent as broadcast ARP, in percent
        #[arg(long, default_value_t = 10)]
        broadcast_pct: u8,
    },
    /// Print the effective configuration
    ShowConfig,
}

const VDEV_MAC: EthernetAddress = EthernetAddress([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

fn station_mac(peer_id: u16) -> EthernetAddress {
    let [hi, lo] = peer_id.to_be_bytes();
    EthernetAddress([0x02, 0x00, 0x00, 0x01, hi, lo])
}

/// Upper layer that counts what it is handed
#[derive(Default)]
struct StackCounter {
    packets: AtomicU64,
    bytes: AtomicU64,
}

impl RxDeliver for StackCounter {
    fn deliver(&self, _vdev: &Vdev, packets: PacketList) {
        for buf in packets {
            self.packets.fetch_add(1, Ordering::Relaxed);
            self.bytes.fetch_add(buf.total_len() as u64, Ordering::Relaxed);
        }
    }
}

/// Transmit path that accepts and discards everything
#[derive(Default)]
struct LoopbackTx {
    sent: AtomicU64,
}

impl TxPath for LoopbackTx {
    fn send(&self, _vdev: &Vdev, _buf: RxBuffer) -> Result<(), RxBuffer> {
        self.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))
        .context("Invalid log level")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match &args.config {
        Some(path) => RxConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => RxConfig::default(),
    };

    match args.command {
        Command::Simulate {
            frames,
            peers,
            broadcast_pct,
        } => simulate(config, frames, peers, broadcast_pct),
        Command::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn simulate(config: RxConfig, frames: usize, peers: u16, broadcast_pct: u8) -> anyhow::Result<()> {
    if peers < 2 {
        bail!("simulate needs at least two peers");
    }

    let table = Arc::new(PeerTable::new(config.max_ast_index));
    let vdev = Arc::new(Vdev::new(0, VDEV_MAC, OpMode::Ap));
    let stack = Arc::new(StackCounter::default());
    vdev.register_rx(stack.clone());
    table.add_vdev(vdev);
    for id in 1..=peers {
        table.add_peer(Peer::new(id, station_mac(id)), 0);
    }

    let tx = Arc::new(LoopbackTx::default());
    let quota = config.quota;
    let rings = config.reo_rings;
    let mut device = SoftDevice::build(config, |b| b.directory(table.clone()).tx_path(tx.clone()))
        .context("Failed to build datapath")?;

    let (events_tx, events_rx) = crossbeam_channel::unbounded();
    let mut workers = Vec::with_capacity(rings);
    for processor in device.take_processors() {
        let recovery = Arc::clone(device.datapath.recovery());
        let handle = spawn_rx_worker(processor, quota, recovery, events_tx.clone())
            .map_err(anyhow::Error::msg)?;
        workers.push(handle);
    }
    drop(events_tx);

    info!(frames, peers, rings, "Starting simulation");
    let started = Instant::now();

    for i in 0..frames {
        let src = 1 + (i % usize::from(peers)) as u16;
        let frame = if (i % 100) < usize::from(broadcast_pct) {
            SimFrame::ethernet(
                src,
                build_arp_request_frame(
                    station_mac(src),
                    Ipv4Address::new(10, 0, 0, src as u8),
                    Ipv4Address::new(10, 0, 0, 1),
                ),
            )
            .multicast()
        } else if i % 2 == 0 {
            let dst = 1 + (src % peers);
            let frame = SimFrame::ethernet(
                src,
                build_unicast_frame(station_mac(dst), station_mac(src), &[0x5a; 512]),
            );
            match table.find_ast(&station_mac(dst)) {
                Some(idx) => frame.da_index(idx),
                None => frame,
            }
        } else {
            SimFrame::ethernet(src, build_unicast_frame(VDEV_MAC, station_mac(src), &[0xa5; 1024]))
        };
        let frame = frame.tid((i % 8) as u8);
        let ring = (i % rings) as u8;

        loop {
            match device.emulator.receive(0, ring, &frame) {
                Ok(_) => break,
                Err(SimError::NoBuffers { .. } | SimError::RingFull { .. }) => {
                    thread::sleep(Duration::from_micros(100));
                }
                Err(e) => return Err(e).context("Emulated receive failed"),
            }
        }
    }

    let mut processed = 0;
    while processed < frames {
        match events_rx.recv_timeout(DRAIN_TIMEOUT) {
            Ok(WorkerEvent::Processed { report, .. }) => {
                processed += report.delivered + report.forwarded + report.dropped;
            }
            Ok(WorkerEvent::Failed { ring_id, error }) => {
                warn!(ring_id, %error, "Worker reported a failure");
            }
            Err(_) => {
                warn!(processed, frames, "Timed out waiting for the datapath to drain");
                break;
            }
        }
    }
    let elapsed = started.elapsed();

    for worker in &workers {
        worker.stop();
    }
    for worker in workers {
        let ring_id = worker.ring_id;
        if let Err(e) = worker.join() {
            warn!(ring_id, error = %e, "Worker did not stop cleanly");
        }
    }
    let released = device.datapath.detach();

    info!(
        processed,
        delivered = stack.packets.load(Ordering::Relaxed),
        forwarded = tx.sent.load(Ordering::Relaxed),
        released,
        elapsed_ms = elapsed.as_millis() as u64,
        "Simulation finished"
    );

    let snapshot = device.datapath.stats().snapshot();
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}
