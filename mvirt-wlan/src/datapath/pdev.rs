//! Per-radio receive attach and detach
//!
//! Attaching a radio creates its descriptor pool, wraps its refill ring in
//! a [`Replenisher`] and stocks the ring. Detaching pulls every buffer the
//! device still holds back out of the pool and releases it.

use std::sync::Arc;

use tracing::info;

use super::desc_pool::DescPool;
use super::dma::{BufferAllocator, DmaDirection};
use super::replenish::Replenisher;
use super::ring::RefillRing;
use crate::config::RxConfig;
use crate::error::Result;
use crate::recovery::SelfRecovery;
use crate::stats::RxStats;

/// Return buffer manager owning software-refilled rx buffers
pub const RX_BUF_OWNER: u8 = 3;

/// Receive side of one radio
pub struct RxPdev {
    pdev_id: u8,
    replenisher: Arc<Replenisher>,
}

impl RxPdev {
    /// Create the radio's pool and fill its refill ring
    pub fn attach(
        pdev_id: u8,
        config: &RxConfig,
        refill_ring: Box<dyn RefillRing>,
        alloc: Arc<dyn BufferAllocator>,
        stats: Arc<RxStats>,
        recovery: Arc<dyn SelfRecovery>,
    ) -> Result<Self> {
        let capacity = config.pool_capacity()?;
        let pool = DescPool::new(pdev_id, capacity, RX_BUF_OWNER)?;
        let replenisher = Arc::new(Replenisher::new(
            pool,
            refill_ring,
            alloc,
            stats,
            recovery,
            config.alloc_map_retry,
        ));

        let report = replenisher.replenish(0, None)?;
        info!(
            pdev_id,
            capacity,
            filled = report.filled,
            "Rx pdev attached"
        );

        Ok(Self {
            pdev_id,
            replenisher,
        })
    }

    pub fn pdev_id(&self) -> u8 {
        self.pdev_id
    }

    pub fn replenisher(&self) -> &Arc<Replenisher> {
        &self.replenisher
    }

    pub fn pool(&self) -> &Arc<DescPool> {
        self.replenisher.pool()
    }

    /// Reclaim and release every buffer still armed in the pool
    ///
    /// Returns the number of buffers released.
    pub fn detach(&self) -> usize {
        let alloc = self.replenisher.allocator();
        let bufs = self.pool().reclaim_in_use();
        let count = bufs.len();
        for mut buf in bufs {
            alloc.unmap(&mut buf, DmaDirection::FromDevice);
            alloc.free(buf);
        }
        info!(pdev_id = self.pdev_id, released = count, "Rx pdev detached");
        count
    }
}
