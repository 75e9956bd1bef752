//! Test harness for rx pipeline integration tests
//!
//! Builds a datapath on software rings with the device emulator on the
//! other side, plus capturing upper-layer and transmit collaborators.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use mvirt_wlan::datapath::{
    DestRing, OpMode, PacketList, Peer, PeerTable, ProcessReport, RingError, RxBuffer,
    RxCompletion, RxDeliver, RxProcessor, TxPath, Vdev, VdevId,
};
use mvirt_wlan::{RxConfig, RxError};
use mvirt_wlan::recovery::RecordingRecovery;
use mvirt_wlan::sim::{SimFrame, SoftDevice};
use smoltcp::wire::EthernetAddress;

pub const VDEV_MAC: EthernetAddress = EthernetAddress([0x02, 0, 0, 0, 0, 0x01]);

pub fn mac(last: u8) -> EthernetAddress {
    EthernetAddress([0x02, 0, 0, 0, 0x10, last])
}

/// Upper layer recording every batch it is handed
#[derive(Default)]
pub struct CaptureDeliver {
    batches: Mutex<Vec<Vec<Vec<u8>>>>,
}

impl CaptureDeliver {
    pub fn batches(&self) -> Vec<Vec<Vec<u8>>> {
        self.batches.lock().unwrap().clone()
    }

    pub fn packets(&self) -> Vec<Vec<u8>> {
        self.batches().into_iter().flatten().collect()
    }
}

impl RxDeliver for CaptureDeliver {
    fn deliver(&self, _vdev: &Vdev, packets: PacketList) {
        let batch = packets.into_iter().map(|b| b.to_vec()).collect();
        self.batches.lock().unwrap().push(batch);
    }
}

/// Transmit path recording re-injected frames
#[derive(Default)]
pub struct CaptureTx {
    sent: Mutex<Vec<Vec<u8>>>,
}

impl CaptureTx {
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap().clone()
    }
}

impl TxPath for CaptureTx {
    fn send(&self, _vdev: &Vdev, buf: RxBuffer) -> Result<(), RxBuffer> {
        self.sent.lock().unwrap().push(buf.to_vec());
        Ok(())
    }
}

/// Completion ring whose next `faults` access attempts fail
pub struct FaultyDestRing {
    inner: Box<dyn DestRing>,
    faults: Arc<AtomicU32>,
}

impl FaultyDestRing {
    pub fn new(inner: Box<dyn DestRing>, faults: Arc<AtomicU32>) -> Self {
        Self { inner, faults }
    }
}

impl DestRing for FaultyDestRing {
    fn ring_id(&self) -> u8 {
        self.inner.ring_id()
    }

    fn access_start(&mut self) -> Result<(), RingError> {
        let failed = self
            .faults
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(RingError::AccessFailed);
        }
        self.inner.access_start()
    }

    fn access_end(&mut self) {
        self.inner.access_end()
    }

    fn peek(&mut self) -> Option<RxCompletion> {
        self.inner.peek()
    }

    fn pop(&mut self) -> Option<RxCompletion> {
        self.inner.pop()
    }

    fn num_valid(&mut self, sync_hw: bool) -> usize {
        self.inner.num_valid(sync_hw)
    }
}

/// Small rings so tests cycle through descriptors quickly
pub fn small_config() -> RxConfig {
    RxConfig {
        refill_ring_entries: 64,
        reo_ring_entries: 64,
        reo_rings: 2,
        quota: 64,
        max_ast_index: 256,
        ..Default::default()
    }
}

pub struct Harness {
    pub device: SoftDevice,
    pub processors: Vec<RxProcessor>,
    pub table: Arc<PeerTable>,
    pub stack: Arc<CaptureDeliver>,
    pub tx: Arc<CaptureTx>,
    pub recovery: Arc<RecordingRecovery>,
    /// Pending access failures, shared by every REO ring
    pub ring_faults: Arc<AtomicU32>,
}

impl Harness {
    /// Datapath with one AP vdev (id 0)
    pub fn new(config: RxConfig) -> Self {
        Self::with_vdev(config, Vdev::new(0, VDEV_MAC, OpMode::Ap))
    }

    pub fn with_vdev(config: RxConfig, vdev: Vdev) -> Self {
        let _ = tracing_subscriber::fmt::try_init();

        let table = Arc::new(PeerTable::new(config.max_ast_index));
        let stack = Arc::new(CaptureDeliver::default());
        let vdev = Arc::new(vdev);
        vdev.register_rx(stack.clone());
        table.add_vdev(vdev);

        let tx = Arc::new(CaptureTx::default());
        let recovery = Arc::new(RecordingRecovery::new());
        let mut device = SoftDevice::build(config, |b| {
            b.directory(table.clone())
                .tx_path(tx.clone())
                .recovery(recovery.clone())
        })
        .expect("Failed to build datapath");
        let ring_faults = Arc::new(AtomicU32::new(0));
        let processors = device
            .take_rings()
            .into_iter()
            .map(|ring| {
                let ring = FaultyDestRing::new(ring, Arc::clone(&ring_faults));
                device.datapath.processor(Box::new(ring))
            })
            .collect();

        Self {
            device,
            processors,
            table,
            stack,
            tx,
            recovery,
            ring_faults,
        }
    }

    /// Add another vdev with its own capturing upper layer
    pub fn add_vdev(&self, vdev: Vdev) -> Arc<CaptureDeliver> {
        let stack = Arc::new(CaptureDeliver::default());
        let vdev = Arc::new(vdev);
        vdev.register_rx(stack.clone());
        self.table.add_vdev(vdev);
        stack
    }

    pub fn add_peer(&self, peer: Peer, vdev: VdevId) -> Arc<Peer> {
        self.table.add_peer(peer, vdev)
    }

    /// Receive `frame` on pdev 0 and complete it to `ring`
    pub fn receive(&self, ring: u8, frame: SimFrame) -> Vec<RxCompletion> {
        self.device
            .emulator
            .receive(0, ring, &frame)
            .expect("Emulated receive failed")
    }

    pub fn process(&mut self, ring: usize) -> ProcessReport {
        self.try_process(ring).expect("Service call failed")
    }

    pub fn try_process(&mut self, ring: usize) -> Result<ProcessReport, RxError> {
        let quota = self.device.datapath.config().quota;
        self.processors[ring].process(quota)
    }

    /// Make the next `count` ring accesses fail
    pub fn fail_ring_access(&self, count: u32) {
        self.ring_faults.store(count, Ordering::SeqCst);
    }

    /// Service every ring until all are empty
    pub fn process_all(&mut self) -> ProcessReport {
        let mut total = ProcessReport::default();
        loop {
            let mut reaped = 0;
            for ring in 0..self.processors.len() {
                let report = self.process(ring);
                reaped += report.reaped;
                total.reaped += report.reaped;
                total.replenished += report.replenished;
                total.delivered += report.delivered;
                total.forwarded += report.forwarded;
                total.dropped += report.dropped;
            }
            if reaped == 0 {
                return total;
            }
        }
    }

    pub fn assert_pools_balanced(&self) {
        for pool in self.device.datapath.pools() {
            assert_eq!(
                pool.in_use_count() + pool.free_count(),
                pool.capacity(),
                "pool {} out of balance",
                pool.pool_id()
            );
        }
    }
}
