//! Intra-BSS forwarding
//!
//! Frames between two clients of the same AP vdev are turned around
//! locally instead of going up the stack. Unicast frames are re-injected
//! as-is and never delivered; multicast frames are copied, the copy is
//! re-injected and the original continues to the stack.

use std::sync::Arc;

use tracing::trace;

use super::buffer::{RxBuffer, RxCb};
use super::dma::BufferAllocator;
use super::peer::{AstType, Peer, PeerDirectory, Vdev};
use crate::stats::{DropReason, RxStats};

/// Local transmit path
pub trait TxPath: Send + Sync {
    /// Queue `buf` for transmission on `vdev`, handing it back on failure
    fn send(&self, vdev: &Vdev, buf: RxBuffer) -> Result<(), RxBuffer>;
}

/// Result of a forwarding decision
#[derive(Debug)]
pub enum Forward {
    /// The frame was re-injected or dropped; the receive path is done with it
    Consumed,
    /// Continue towards delivery
    Deliver(RxBuffer),
}

pub struct IntraBssForwarder {
    directory: Arc<dyn PeerDirectory>,
    tx: Arc<dyn TxPath>,
    stats: Arc<RxStats>,
    alloc: Arc<dyn BufferAllocator>,
}

impl IntraBssForwarder {
    pub fn new(
        directory: Arc<dyn PeerDirectory>,
        tx: Arc<dyn TxPath>,
        stats: Arc<RxStats>,
        alloc: Arc<dyn BufferAllocator>,
    ) -> Self {
        Self {
            directory,
            tx,
            stats,
            alloc,
        }
    }

    /// Decide whether `buf`, received from `ta` on `vdev`, stays local
    ///
    /// `da_idx` is the AST index of the destination address.
    pub fn forward(&self, vdev: &Vdev, ta: &Peer, buf: RxBuffer, da_idx: u16) -> Forward {
        if buf.cb.da_valid && !buf.cb.da_mcbc {
            self.forward_unicast(vdev, ta, buf, da_idx)
        } else if buf.cb.da_mcbc && !ta.bss_peer {
            self.forward_mcast_copy(vdev, ta, &buf);
            Forward::Deliver(buf)
        } else {
            Forward::Deliver(buf)
        }
    }

    fn forward_unicast(&self, vdev: &Vdev, ta: &Peer, mut buf: RxBuffer, da_idx: u16) -> Forward {
        let Some(ast) = self.directory.ast_entry(da_idx) else {
            return Forward::Deliver(buf);
        };
        if ast.ast_type == AstType::Da {
            ast.set_active(true);
            return Forward::Deliver(buf);
        }

        let Some(da) = self.directory.lookup_peer(ast.peer_id) else {
            return Forward::Deliver(buf);
        };
        if da.id == ta.id || da.bss_peer || da.vdev_id() != Some(vdev.id) {
            return Forward::Deliver(buf);
        }

        let tid = buf.cb.tid;
        let len = buf.total_len();
        buf.cb = RxCb::default();

        if buf.is_nonlinear() && self.alloc.linearize(&mut buf).is_err() {
            self.fail(ta, tid, len, buf);
            return Forward::Consumed;
        }

        match self.tx.send(vdev, buf) {
            Ok(()) => {
                trace!(vdev_id = vdev.id, ta = ta.id, da = da.id, len, "Intra-BSS unicast forward");
                self.stats.intra_bss.record(len);
                self.stats.tid(tid).intrabss_cnt.inc();
                ta.stats.intra_bss_pkts.record(len);
            }
            Err(buf) => self.fail(ta, tid, len, buf),
        }
        Forward::Consumed
    }

    fn forward_mcast_copy(&self, vdev: &Vdev, ta: &Peer, buf: &RxBuffer) {
        let tid = buf.cb.tid;
        let Some(copy) = buf.try_copy() else {
            return;
        };
        let len = copy.total_len();

        match self.tx.send(vdev, copy) {
            Ok(()) => {
                self.stats.intra_bss.record(len);
                self.stats.tid(tid).intrabss_cnt.inc();
                ta.stats.intra_bss_pkts.record(len);
            }
            Err(copy) => {
                ta.stats.intra_bss_fail.record(len);
                self.stats.tid(tid).fail(DropReason::IntraBss);
                self.alloc.free(copy);
            }
        }
    }

    fn fail(&self, ta: &Peer, tid: u8, len: usize, buf: RxBuffer) {
        ta.stats.intra_bss_fail.record(len);
        self.stats.drop_pkt(DropReason::IntraBss);
        self.stats.tid(tid).fail(DropReason::IntraBss);
        self.alloc.free(buf);
    }
}
