//! Second pass: classification and forwarding
//!
//! Walks the batch produced by the servicer in ring order. Each packet is
//! resolved to its transmitting peer and vdev, stripped of its TLV region,
//! run through the policy filters and either forwarded locally, dropped or
//! queued on the [`DeliverySink`]. The peer lease taken for a packet is
//! released on every exit path when it goes out of scope.

use std::sync::Arc;
use std::time::Instant;

use smoltcp::wire::EthernetAddress;
use tracing::{debug, trace};

use super::buffer::{ChecksumHint, GroInfo, PacketList, RxBuffer};
use super::deliver::DeliverySink;
use super::dma::BufferAllocator;
use super::intrabss::{Forward, IntraBssForwarder, TxPath};
use super::packet;
use super::peer::{AstType, Peer, PeerDirectory, PeerTable, Vdev};
use super::policy::RxStrategy;
use super::reassembly::sg_create;
use super::tlv::{DecapFormat, RX_PKT_TLVS_LEN, RxTlv};
use crate::config::RxConfig;
use crate::stats::{DropReason, RxStats};

/// External receive hooks
///
/// All hooks default to doing nothing.
pub trait RxHooks: Send + Sync {
    /// Tag the buffer from the classification engine metadata
    fn update_protocol_tag(&self, _vdev: &Vdev, _buf: &mut RxBuffer, _tlv: &RxTlv) {}

    /// Learn `mac` as reachable through `peer`
    fn add_ast(&self, _peer: &Peer, _mac: EthernetAddress, _ast_type: AstType) {}

    /// Learn the source port of a frame from a WDS peer
    fn srcport_learn(&self, _peer: &Peer, _buf: &RxBuffer, _tlv: &RxTlv) {}
}

/// Hooks that do nothing
#[derive(Debug, Default)]
pub struct NoHooks;

impl RxHooks for NoHooks {}

/// Learning backed by the in-memory directory
impl RxHooks for PeerTable {
    fn update_protocol_tag(&self, _vdev: &Vdev, buf: &mut RxBuffer, tlv: &RxTlv) {
        buf.cb.protocol_tag = tlv.cce_metadata;
    }

    fn add_ast(&self, peer: &Peer, mac: EthernetAddress, ast_type: AstType) {
        PeerTable::add_ast(self, mac, peer.id, ast_type);
    }

    fn srcport_learn(&self, peer: &Peer, buf: &RxBuffer, _tlv: &RxTlv) {
        if buf.cb.sa_valid {
            return;
        }
        if let Some(eth) = packet::parse_ethernet(buf.data()) {
            let src = eth.src_addr();
            if src.is_unicast() {
                PeerTable::add_ast(self, src, peer.id, AstType::Wds);
            }
        }
    }
}

/// Outcome of one second pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassifyReport {
    pub delivered: usize,
    pub forwarded: usize,
    pub dropped: usize,
}

pub struct Classifier {
    directory: Arc<dyn PeerDirectory>,
    strategy: RxStrategy,
    hooks: Arc<dyn RxHooks>,
    intrabss: IntraBssForwarder,
    stats: Arc<RxStats>,
    alloc: Arc<dyn BufferAllocator>,
    process_rx_status: bool,
    gro_enabled: bool,
    delay_stats: bool,
}

impl Classifier {
    pub fn new(
        config: &RxConfig,
        directory: Arc<dyn PeerDirectory>,
        tx: Arc<dyn TxPath>,
        hooks: Arc<dyn RxHooks>,
        stats: Arc<RxStats>,
        alloc: Arc<dyn BufferAllocator>,
    ) -> Self {
        let intrabss = IntraBssForwarder::new(
            Arc::clone(&directory),
            tx,
            Arc::clone(&stats),
            Arc::clone(&alloc),
        );
        Self {
            directory,
            strategy: RxStrategy::from_config(&config.features),
            hooks,
            intrabss,
            stats,
            alloc,
            process_rx_status: config.process_rx_status,
            gro_enabled: config.gro_enabled,
            delay_stats: config.delay_stats,
        }
    }

    pub fn stats(&self) -> &Arc<RxStats> {
        &self.stats
    }

    pub fn allocator(&self) -> &Arc<dyn BufferAllocator> {
        &self.alloc
    }

    pub fn directory(&self) -> &Arc<dyn PeerDirectory> {
        &self.directory
    }

    /// Classify, forward and deliver every packet of `batch`
    pub fn run(&self, mut batch: PacketList) -> ClassifyReport {
        let mut sink = DeliverySink::new(Arc::clone(&self.stats), Arc::clone(&self.alloc));
        let mut report = ClassifyReport::default();
        let mut tid = 0u8;

        while let Some(mut buf) = batch.pop_front() {
            if buf.cb.chfrag_start {
                tid = buf.cb.tid;
            }
            buf.cb.tid = tid;
            if self.delay_stats {
                buf.cb.timestamp = Some(Instant::now());
            }

            let tid_stats = self.stats.tid(tid);
            let tlv = match RxTlv::parse(buf.data()) {
                Some(tlv) if tlv.msdu_done => tlv,
                _ => {
                    debug!(tid, peer_id = buf.cb.peer_id, "MSDU done not set");
                    self.drop_buf(buf, DropReason::MsduDone, &mut report);
                    continue;
                }
            };

            tid_stats.msdu_cnt.inc();
            if buf.cb.da_mcbc {
                tid_stats.mcast_msdu_cnt.inc();
            }

            let Some(peer) = self.directory.lookup_peer(buf.cb.peer_id) else {
                trace!(peer_id = buf.cb.peer_id, "No peer for rx frame");
                self.drop_buf(buf, DropReason::InvalidPeer, &mut report);
                continue;
            };
            let Some(vdev) = peer.vdev_id().and_then(|id| self.directory.vdev(id)) else {
                trace!(peer_id = peer.id, "Peer has no vdev");
                self.drop_buf(buf, DropReason::InvalidVdev, &mut report);
                continue;
            };
            sink.switch_to(&vdev);

            if !(buf.cb.chfrag_start && buf.cb.chfrag_end) {
                peer.stats.amsdu.inc();
            }

            let msdu_len = usize::from(tlv.msdu_len);
            let mut buf = if buf.cb.frag {
                buf.cb.da_mcbc = tlv.da_is_mcbc;
                buf.cb.da_valid = tlv.da_is_valid;
                buf.cb.sa_valid = tlv.sa_is_valid;
                if !set_payload(&mut buf, msdu_len, 0) {
                    self.drop_buf(buf, DropReason::InvalidLength, &mut report);
                    continue;
                }
                buf
            } else if buf.cb.raw_frame {
                match sg_create(buf, msdu_len, &mut batch) {
                    Ok(buf) => {
                        vdev.stats.raw.inc();
                        self.stats.raw_pkts.inc();
                        peer.stats.raw.record(msdu_len);
                        buf
                    }
                    Err(partial) => {
                        debug!(peer_id = peer.id, msdu_len, "Reassembly failed");
                        self.drop_buf(partial, DropReason::Reassembly, &mut report);
                        continue;
                    }
                }
            } else {
                let pad = usize::from(tlv.l3_hdr_padding);
                if !set_payload(&mut buf, msdu_len, pad) {
                    self.drop_buf(buf, DropReason::InvalidLength, &mut report);
                    continue;
                }
                buf
            };

            if !self.strategy.wds_rx_policy_check(&vdev, &peer, &tlv) {
                trace!(peer_id = peer.id, "Policy check drop");
                self.drop_buf(buf, DropReason::PolicyCheck, &mut report);
                continue;
            }

            if peer.bss_peer {
                trace!(peer_id = peer.id, "Received own transmission");
                peer.stats.mec_drop.record(buf.total_len());
                self.drop_buf(buf, DropReason::MecDrop, &mut report);
                continue;
            }

            if peer.nawds_enabled && buf.cb.da_mcbc && !tlv.mac_addr_ad4_valid {
                peer.stats.nawds_mcast_drop.inc();
                self.drop_buf(buf, DropReason::NawdsMcast, &mut report);
                continue;
            }

            if self.process_rx_status {
                self.cksum_offload(&mut buf, &tlv);
            }

            self.hooks.update_protocol_tag(&vdev, &mut buf, &tlv);
            self.msdu_stats(&vdev, &peer, &buf);

            if vdev.mesh {
                if self.strategy.mesh_filtered(&vdev, &tlv) {
                    self.drop_buf(buf, DropReason::MeshFilter, &mut report);
                    continue;
                }
                self.strategy.fill_mesh_info(&mut buf, &tlv);
            }

            if vdev.rx_decap == DecapFormat::Ethernet && !vdev.mesh {
                self.da_learn(&vdev, &peer, &buf);

                if !self.sa_da_idx_valid(&buf, &tlv) {
                    self.drop_buf(buf, DropReason::InvalidSaDaIdx, &mut report);
                    continue;
                }

                if self.strategy.srcport_learning(&vdev) {
                    self.hooks.srcport_learn(&peer, &buf, &tlv);
                }

                if self.strategy.ap_bridge_allowed(&vdev) {
                    buf = match self.intrabss.forward(&vdev, &peer, buf, tlv.da_idx) {
                        Forward::Consumed => {
                            report.forwarded += 1;
                            continue;
                        }
                        Forward::Deliver(buf) => buf,
                    };
                }
            }

            if self.gro_enabled {
                fill_gro_info(&mut buf, &tlv);
            }
            peer.stats.to_stack.record(msdu_len);
            sink.enqueue(buf, peer.mac);
            report.delivered += 1;
        }

        sink.flush();
        report
    }

    fn drop_buf(&self, buf: RxBuffer, reason: DropReason, report: &mut ClassifyReport) {
        self.stats.drop_pkt(reason);
        self.stats.tid(buf.cb.tid).fail(reason);
        self.alloc.free(buf);
        report.dropped += 1;
    }

    fn cksum_offload(&self, buf: &mut RxBuffer, tlv: &RxTlv) {
        if !tlv.ip_csum_fail && !tlv.l4_csum_fail {
            buf.cb.cksum = ChecksumHint::Unnecessary;
            return;
        }
        if tlv.ip_csum_fail {
            self.stats.err.ip_csum_err.inc();
        }
        if tlv.l4_csum_fail {
            self.stats.err.tcp_udp_csum_err.inc();
        }
    }

    fn msdu_stats(&self, vdev: &Vdev, peer: &Peer, buf: &RxBuffer) {
        if !buf.cb.da_mcbc || vdev.rx_decap != DecapFormat::Ethernet {
            return;
        }
        let len = buf.total_len();
        peer.stats.multicast.record(len);
        if packet::is_broadcast(buf.data()) {
            peer.stats.bcast.record(len);
            self.stats.tid(buf.cb.tid).bcast_msdu_cnt.inc();
        }
    }

    /// Learn the destination of a frame whose DA the hardware did not know
    fn da_learn(&self, vdev: &Vdev, peer: &Peer, buf: &RxBuffer) {
        if !self.strategy.da_learning(vdev) || buf.cb.da_valid || buf.cb.da_mcbc {
            return;
        }
        if let Some(da) = packet::dst_addr(buf.data()) {
            self.hooks.add_ast(peer, da, AstType::Da);
        }
    }

    fn sa_da_idx_valid(&self, buf: &RxBuffer, tlv: &RxTlv) -> bool {
        let max = self.directory.max_ast_index();
        !((buf.cb.sa_valid && tlv.sa_idx > max) || (buf.cb.da_valid && tlv.da_idx > max))
    }
}

/// Copy the receive-offload hints of a TCP frame into the control block
fn fill_gro_info(buf: &mut RxBuffer, tlv: &RxTlv) {
    if !tlv.tcp_proto {
        return;
    }
    buf.cb.gro = Some(GroInfo {
        lro_eligible: tlv.lro_eligible,
        tcp_pure_ack: tlv.tcp_pure_ack,
        ipv6: tlv.ipv6_proto,
        l4_offset: tlv.l4_offset,
        flow_id: tlv.flow_id,
        tcp_seq: tlv.tcp_seq,
        tcp_ack: tlv.tcp_ack,
        tcp_win: tlv.tcp_win,
        tcp_chksum: tlv.tcp_chksum,
    });
    trace!(flow_id = tlv.flow_id, seq = tlv.tcp_seq, "Rx offload info");
}

/// Trim `buf` to `len` payload bytes after the TLV region and `pad`
fn set_payload(buf: &mut RxBuffer, len: usize, pad: usize) -> bool {
    let total = len + pad + RX_PKT_TLVS_LEN;
    if total > buf.tailroom() {
        return false;
    }
    buf.set_len(total);
    buf.pull_head(RX_PKT_TLVS_LEN + pad);
    true
}
