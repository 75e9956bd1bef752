//! Receive datapath assembly
//!
//! [`RxDatapath`] owns the per-radio pools and the shared collaborators
//! (peer directory, transmit path, hooks, allocator, recovery). Each
//! completion ring gets its own [`RxProcessor`], which runs both passes of a
//! service call: reap and replenish, then classify and deliver.

use std::sync::Arc;

use tracing::{debug, info};

use super::buffer::PacketList;
use super::classify::{Classifier, ClassifyReport, NoHooks, RxHooks};
use super::deliver::deliver_raw;
use super::desc_pool::DescPool;
use super::dma::{BufferAllocator, HeapAllocator};
use super::intrabss::TxPath;
use super::pdev::RxPdev;
use super::peer::{PeerDirectory, PeerId};
use super::ring::{DestRing, RefillRing};
use super::servicer::RingServicer;
use crate::config::RxConfig;
use crate::error::{Result, RxError};
use crate::recovery::{PanicRecovery, SelfRecovery};
use crate::stats::{DropReason, RxStats};

/// Builder for [`RxDatapath`]
pub struct RxDatapathBuilder {
    config: RxConfig,
    directory: Option<Arc<dyn PeerDirectory>>,
    tx: Option<Arc<dyn TxPath>>,
    hooks: Arc<dyn RxHooks>,
    recovery: Arc<dyn SelfRecovery>,
    alloc: Arc<dyn BufferAllocator>,
    refill_rings: Vec<Box<dyn RefillRing>>,
}

impl RxDatapathBuilder {
    pub fn directory(mut self, directory: Arc<dyn PeerDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn tx_path(mut self, tx: Arc<dyn TxPath>) -> Self {
        self.tx = Some(tx);
        self
    }

    pub fn hooks(mut self, hooks: Arc<dyn RxHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn recovery(mut self, recovery: Arc<dyn SelfRecovery>) -> Self {
        self.recovery = recovery;
        self
    }

    pub fn allocator(mut self, alloc: Arc<dyn BufferAllocator>) -> Self {
        self.alloc = alloc;
        self
    }

    /// Refill ring of the next radio; radios are numbered in call order
    pub fn refill_ring(mut self, ring: Box<dyn RefillRing>) -> Self {
        self.refill_rings.push(ring);
        self
    }

    /// Validate, attach every radio and fill its refill ring
    pub fn build(self) -> Result<RxDatapath> {
        self.config.validate()?;
        let directory = self.directory.ok_or(RxError::Incomplete("peer directory"))?;
        let tx = self.tx.ok_or(RxError::Incomplete("tx path"))?;
        if self.refill_rings.len() != self.config.pdevs {
            return Err(RxError::Incomplete("refill ring"));
        }

        let stats = Arc::new(RxStats::new());
        let mut pdevs = Vec::with_capacity(self.config.pdevs);
        for (pdev_id, ring) in self.refill_rings.into_iter().enumerate() {
            pdevs.push(RxPdev::attach(
                pdev_id as u8,
                &self.config,
                ring,
                Arc::clone(&self.alloc),
                Arc::clone(&stats),
                Arc::clone(&self.recovery),
            )?);
        }

        info!(
            pdevs = pdevs.len(),
            quota = self.config.quota,
            "Rx datapath ready"
        );

        Ok(RxDatapath {
            config: self.config,
            pdevs,
            directory,
            tx,
            hooks: self.hooks,
            recovery: self.recovery,
            alloc: self.alloc,
            stats,
        })
    }
}

/// Receive datapath shared by all completion rings
pub struct RxDatapath {
    config: RxConfig,
    pdevs: Vec<RxPdev>,
    directory: Arc<dyn PeerDirectory>,
    tx: Arc<dyn TxPath>,
    hooks: Arc<dyn RxHooks>,
    recovery: Arc<dyn SelfRecovery>,
    alloc: Arc<dyn BufferAllocator>,
    stats: Arc<RxStats>,
}

impl RxDatapath {
    pub fn builder(config: RxConfig) -> RxDatapathBuilder {
        RxDatapathBuilder {
            config,
            directory: None,
            tx: None,
            hooks: Arc::new(NoHooks),
            recovery: Arc::new(PanicRecovery),
            alloc: Arc::new(HeapAllocator::new()),
            refill_rings: Vec::new(),
        }
    }

    pub fn config(&self) -> &RxConfig {
        &self.config
    }

    pub fn stats(&self) -> &Arc<RxStats> {
        &self.stats
    }

    pub fn recovery(&self) -> &Arc<dyn SelfRecovery> {
        &self.recovery
    }

    pub fn pdevs(&self) -> &[RxPdev] {
        &self.pdevs
    }

    /// Descriptor pools indexed by pool id
    pub fn pools(&self) -> Vec<Arc<DescPool>> {
        self.pdevs.iter().map(|p| Arc::clone(p.pool())).collect()
    }

    /// Processor for one completion ring
    pub fn processor(&self, ring: Box<dyn DestRing>) -> RxProcessor {
        let replenishers = self
            .pdevs
            .iter()
            .map(|p| Arc::clone(p.replenisher()))
            .collect();
        let servicer = RingServicer::new(
            ring,
            replenishers,
            Arc::clone(&self.stats),
            Arc::clone(&self.recovery),
        );
        let classifier = Classifier::new(
            &self.config,
            Arc::clone(&self.directory),
            Arc::clone(&self.tx),
            Arc::clone(&self.hooks),
            Arc::clone(&self.stats),
            Arc::clone(&self.alloc),
        );
        RxProcessor {
            servicer,
            classifier,
        }
    }

    /// Deliver raw-mode frames received from `peer_id`
    ///
    /// Returns the number of frames handed to the vdev.
    pub fn deliver_raw(&self, peer_id: PeerId, packets: PacketList) -> usize {
        let vdev = self.directory.lookup_peer(peer_id).and_then(|peer| {
            let vdev = peer.vdev_id().and_then(|id| self.directory.vdev(id))?;
            Some((peer, vdev))
        });
        let Some((peer, vdev)) = vdev else {
            debug!(peer_id, count = packets.len(), "Raw frames for unknown peer");
            for buf in packets {
                self.stats.drop_pkt(DropReason::InvalidPeer);
                self.alloc.free(buf);
            }
            return 0;
        };
        deliver_raw(&vdev, &peer, packets, &self.stats, self.alloc.as_ref())
    }

    /// Release every buffer still held by the device
    pub fn detach(&self) -> usize {
        self.pdevs.iter().map(RxPdev::detach).sum()
    }
}

/// Outcome of one service call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessReport {
    pub reaped: usize,
    pub replenished: usize,
    pub delivered: usize,
    pub forwarded: usize,
    pub dropped: usize,
}

/// Both passes for one completion ring
pub struct RxProcessor {
    servicer: RingServicer,
    classifier: Classifier,
}

impl RxProcessor {
    pub fn ring_id(&self) -> u8 {
        self.servicer.ring_id()
    }

    pub fn servicer(&self) -> &RingServicer {
        &self.servicer
    }

    /// Run one service call bounded by `quota`
    pub fn process(&mut self, quota: usize) -> Result<ProcessReport> {
        let reap = self.servicer.reap(quota)?;
        let ClassifyReport {
            delivered,
            forwarded,
            dropped,
        } = self.classifier.run(reap.packets);

        Ok(ProcessReport {
            reaped: reap.reaped,
            replenished: reap.replenished,
            delivered,
            forwarded,
            dropped,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datapath::buffer::RxBuffer;
    use crate::datapath::deliver::tests::RecordingDeliver;
    use crate::datapath::intrabss::tests::RecordingTx;
    use crate::datapath::packet::build_unicast_frame;
    use crate::datapath::peer::{OpMode, Peer, PeerTable, Vdev};
    use crate::datapath::ring::{
        MpduDescInfo, MsduDescInfo, ReoStatus, RxCompletion, soft_dest_ring, soft_refill_ring,
    };
    use crate::datapath::tlv::{RX_PKT_TLVS_LEN, RxTlv};
    use smoltcp::wire::EthernetAddress;

    fn mac(last: u8) -> EthernetAddress {
        EthernetAddress([0x02, 0, 0, 0, 0, last])
    }

    fn small_config() -> RxConfig {
        RxConfig {
            refill_ring_entries: 16,
            reo_ring_entries: 16,
            reo_rings: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_build_requires_collaborators() {
        let (ring, _hw) = soft_refill_ring(16);
        let err = RxDatapath::builder(small_config())
            .refill_ring(Box::new(ring))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, RxError::Incomplete("peer directory")));

        let err = RxDatapath::builder(small_config())
            .directory(Arc::new(PeerTable::new(64)))
            .tx_path(Arc::new(RecordingTx::default()))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, RxError::Incomplete("refill ring")));
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let config = RxConfig {
            quota: 0,
            ..small_config()
        };
        let err = RxDatapath::builder(config).build().err().unwrap();
        assert!(matches!(err, RxError::Config(_)));
    }

    #[test]
    fn test_process_reaps_and_delivers() {
        let table = Arc::new(PeerTable::new(64));
        let vdev = Arc::new(Vdev::new(0, mac(1), OpMode::Ap));
        let rx = Arc::new(RecordingDeliver::default());
        vdev.register_rx(rx.clone());
        table.add_vdev(vdev);
        table.add_peer(Peer::new(7, mac(7)), 0);

        let (refill, refill_hw) = soft_refill_ring(16);
        let datapath = RxDatapath::builder(small_config())
            .directory(table.clone())
            .tx_path(Arc::new(RecordingTx::default()))
            .refill_ring(Box::new(refill))
            .build()
            .unwrap();
        let (dest, dest_hw) = soft_dest_ring(0, 16);
        let mut processor = datapath.processor(Box::new(dest));

        let frame = build_unicast_frame(mac(1), mac(7), b"hello");
        let entry = refill_hw.take().unwrap();
        let pool = &datapath.pools()[0];
        let tlv = RxTlv {
            msdu_len: frame.len() as u16,
            ..Default::default()
        };
        pool.dma_write(entry.cookie, |mem| {
            tlv.write(&mut mem[..RX_PKT_TLVS_LEN]);
            mem[RX_PKT_TLVS_LEN..RX_PKT_TLVS_LEN + frame.len()].copy_from_slice(&frame);
        })
        .unwrap();
        dest_hw
            .post(RxCompletion {
                status: ReoStatus::Ok,
                cookie: entry.cookie,
                mpdu: MpduDescInfo {
                    peer_meta_data: 7,
                    ..Default::default()
                },
                msdu: MsduDescInfo {
                    first_msdu: true,
                    last_msdu: true,
                    msdu_len: frame.len() as u16,
                    ..Default::default()
                },
                queue: 0,
            })
            .unwrap();

        let report = processor.process(64).unwrap();
        assert_eq!(report.reaped, 1);
        assert_eq!(report.replenished, 1);
        assert_eq!(report.delivered, 1);
        assert_eq!(rx.batches(), vec![vec![frame]]);
        assert_eq!(pool.in_use_count() + pool.free_count(), pool.capacity());
        assert_eq!(table.outstanding_refs(), 0);

        assert_eq!(datapath.detach(), 15);
        assert_eq!(pool.free_count(), pool.capacity());
    }

    #[test]
    fn test_deliver_raw_unknown_peer_dropped() {
        let (refill, _hw) = soft_refill_ring(16);
        let datapath = RxDatapath::builder(small_config())
            .directory(Arc::new(PeerTable::new(64)))
            .tx_path(Arc::new(RecordingTx::default()))
            .refill_ring(Box::new(refill))
            .build()
            .unwrap();

        let list: PacketList = [RxBuffer::from_slice(b"raw")].into_iter().collect();
        assert_eq!(datapath.deliver_raw(3, list), 0);
        assert_eq!(datapath.stats().drops(DropReason::InvalidPeer), 1);
    }
}
