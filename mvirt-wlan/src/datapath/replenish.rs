//! Buffer replenisher
//!
//! Keeps one refill ring stocked with mapped receive buffers drawn from the
//! radio's descriptor pool. Called once at attach time with no descriptors
//! (fill the ring) and after every service call with the descriptors that
//! call reaped.

use std::sync::{Arc, Mutex};

use tracing::{debug, error, warn};

use super::buffer::RxBuffer;
use super::desc_pool::{DescList, DescPool};
use super::dma::{BufferAllocator, DmaDirection};
use super::ring::{RefillEntry, RefillRing, RingError};
use super::tlv::{RX_BUFFER_ALIGNMENT, RX_BUFFER_RESERVATION, RX_BUFFER_SIZE};
use crate::error::{Result, RxError};
use crate::recovery::{HangReason, SelfRecovery};
use crate::stats::RxStats;

/// Outcome of one replenish call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReplenishReport {
    /// Slots the call decided to fill
    pub requested: usize,
    /// Slots actually published
    pub filled: usize,
    /// Descriptors handed back to the free list
    pub returned: usize,
}

/// Refill ring plus the pool and allocator feeding it
pub struct Replenisher {
    pool: Arc<DescPool>,
    ring: Mutex<Box<dyn RefillRing>>,
    alloc: Arc<dyn BufferAllocator>,
    stats: Arc<RxStats>,
    recovery: Arc<dyn SelfRecovery>,
    retry_limit: u32,
}

impl Replenisher {
    pub fn new(
        pool: Arc<DescPool>,
        ring: Box<dyn RefillRing>,
        alloc: Arc<dyn BufferAllocator>,
        stats: Arc<RxStats>,
        recovery: Arc<dyn SelfRecovery>,
        retry_limit: u32,
    ) -> Self {
        Self {
            pool,
            ring: Mutex::new(ring),
            alloc,
            stats,
            recovery,
            retry_limit: retry_limit.max(1),
        }
    }

    pub fn pool(&self) -> &Arc<DescPool> {
        &self.pool
    }

    pub fn allocator(&self) -> &Arc<dyn BufferAllocator> {
        &self.alloc
    }

    /// Allocate, zero and map one receive buffer
    ///
    /// Allocation and mapping failures share one retry budget. Returns
    /// `None` once it is spent.
    pub fn prepare_buffer(&self) -> Option<RxBuffer> {
        for _ in 0..self.retry_limit {
            let Some(mut buf) =
                self.alloc
                    .alloc(RX_BUFFER_SIZE, RX_BUFFER_RESERVATION, RX_BUFFER_ALIGNMENT)
            else {
                self.stats.replenish.nbuf_alloc_fail.inc();
                continue;
            };

            buf.data_mut().fill(0);

            match self.alloc.map(&mut buf, DmaDirection::FromDevice) {
                Ok(_) => return Some(buf),
                Err(e) => {
                    debug!(pool_id = self.pool.pool_id(), error = %e, "Rx buffer map failed");
                    self.alloc.free(buf);
                    self.stats.replenish.map_err.inc();
                }
            }
        }

        warn!(
            pool_id = self.pool.pool_id(),
            attempts = self.retry_limit,
            "Rx buffer alloc/map retries exhausted"
        );
        None
    }

    fn discard(&self, mut buf: RxBuffer) {
        self.alloc.unmap(&mut buf, DmaDirection::FromDevice);
        self.alloc.free(buf);
    }

    /// Refill up to `num_req` ring slots
    ///
    /// `descs` carries descriptors reaped by the caller. Without them, and
    /// with more than three quarters of the ring empty, the whole free space
    /// is filled from the pool. Descriptors that are not armed go back to
    /// the free list.
    pub fn replenish(&self, num_req: usize, descs: Option<DescList>) -> Result<ReplenishReport> {
        let pool_id = self.pool.pool_id();
        let mut ring = self.ring.lock().map_err(|_| RxError::RefillAccess {
            pool: pool_id,
            source: RingError::Poisoned,
        })?;

        if let Err(source) = ring.access_start() {
            self.stats.replenish.rxdma_err.add(num_req as u64);
            warn!(pool_id, error = %source, "Refill ring access failed");
            return Err(RxError::RefillAccess {
                pool: pool_id,
                source,
            });
        }

        let avail = ring.num_avail(true);
        let preallocated = descs.as_ref().is_some_and(|l| !l.is_empty());
        let mut num_req = num_req;

        if !preallocated && avail > ring.num_entries() * 3 / 4 {
            num_req = avail;
        } else if avail < num_req {
            num_req = avail;
        }

        debug!(pool_id, requested = num_req, avail, "Replenishing rx buffers");

        let mut report = ReplenishReport {
            requested: num_req,
            ..Default::default()
        };

        if num_req == 0 {
            ring.access_end();
            report.returned = descs.as_ref().map_or(0, DescList::len);
            self.stats.replenish.buf_freelist.add(report.returned as u64);
            return Ok(report);
        }

        let mut list = match descs {
            Some(list) if !list.is_empty() => list,
            _ => {
                let list = self.pool.allocate(num_req);
                if list.is_empty() {
                    ring.access_end();
                    self.stats.replenish.desc_alloc_fail.add(num_req as u64);
                    warn!(pool_id, requested = num_req, "No free rx descriptors");
                    return Ok(report);
                }
                list
            }
        };
        let num_req = num_req.min(list.len());

        while report.filled < num_req {
            let Some(buf) = self.prepare_buffer() else {
                break;
            };
            let Some(paddr) = buf.dma_addr() else {
                self.alloc.free(buf);
                break;
            };
            let Some(index) = list.pop() else {
                self.discard(buf);
                break;
            };

            let cookie = match self.pool.arm(index, buf) {
                Ok(cookie) => cookie,
                Err((fault, buf)) => {
                    self.discard(buf);
                    ring.access_end();
                    error!(pool_id, index, %fault, "Free rx descriptor already armed");
                    crate::trigger_self_recovery!(self.recovery, HangReason::RefillCorruption);
                    return Err(RxError::Desync(fault));
                }
            };

            let entry = RefillEntry {
                paddr,
                cookie,
                owner: self.pool.owner(),
            };
            if let Err(e) = ring.push(entry) {
                warn!(pool_id, error = %e, "Refill ring rejected entry");
                if let Ok(buf) = self.pool.take(cookie) {
                    self.discard(buf);
                }
                list.push(index);
                break;
            }

            report.filled += 1;
        }

        ring.access_end();
        drop(ring);

        report.returned = list.len();
        self.stats.replenish.pkts.pkts.add(report.filled as u64);
        self.stats
            .replenish
            .pkts
            .bytes
            .add((report.filled * RX_BUFFER_SIZE) as u64);
        self.stats.replenish.buf_freelist.add(report.returned as u64);

        debug!(
            pool_id,
            filled = report.filled,
            returned = report.returned,
            "Replenished rx buffers"
        );

        Ok(report)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::datapath::dma::{DmaAddr, DmaError, HeapAllocator};
    use crate::datapath::ring::{RefillRingConsumer, soft_refill_ring};
    use crate::recovery::RecordingRecovery;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Allocator whose first N allocations and maps fail
    #[derive(Default)]
    pub(crate) struct FlakyAllocator {
        pub alloc_failures: AtomicU32,
        pub map_failures: AtomicU32,
        inner: HeapAllocator,
    }

    impl FlakyAllocator {
        pub fn new(alloc_failures: u32, map_failures: u32) -> Self {
            Self {
                alloc_failures: AtomicU32::new(alloc_failures),
                map_failures: AtomicU32::new(map_failures),
                inner: HeapAllocator::new(),
            }
        }

        fn consume(counter: &AtomicU32) -> bool {
            counter
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        }
    }

    impl BufferAllocator for FlakyAllocator {
        fn alloc(&self, size: usize, reserve: usize, align: usize) -> Option<RxBuffer> {
            if Self::consume(&self.alloc_failures) {
                return None;
            }
            self.inner.alloc(size, reserve, align)
        }

        fn map(&self, buf: &mut RxBuffer, dir: DmaDirection) -> std::result::Result<DmaAddr, DmaError> {
            if Self::consume(&self.map_failures) {
                return Err(DmaError::MapFailed);
            }
            self.inner.map(buf, dir)
        }

        fn unmap(&self, buf: &mut RxBuffer, dir: DmaDirection) {
            self.inner.unmap(buf, dir)
        }
    }

    fn replenisher(
        pool_size: usize,
        ring_size: usize,
        alloc: Arc<dyn BufferAllocator>,
        retry: u32,
    ) -> (Replenisher, RefillRingConsumer, Arc<RxStats>) {
        let pool = DescPool::new(0, pool_size, 3).unwrap();
        let (ring, hw) = soft_refill_ring(ring_size);
        let stats = Arc::new(RxStats::new());
        let r = Replenisher::new(
            pool,
            Box::new(ring),
            alloc,
            Arc::clone(&stats),
            Arc::new(RecordingRecovery::new()),
            retry,
        );
        (r, hw, stats)
    }

    fn assert_pool_balanced(pool: &DescPool) {
        assert_eq!(pool.in_use_count() + pool.free_count(), pool.capacity());
    }

    #[test]
    fn test_initial_fill_uses_all_free_slots() {
        let (r, hw, stats) = replenisher(16, 16, Arc::new(HeapAllocator::new()), 4);

        let report = r.replenish(0, None).unwrap();
        assert_eq!(report.requested, 15);
        assert_eq!(report.filled, 15);
        assert_eq!(report.returned, 0);
        assert_eq!(hw.posted(), 15);
        assert_eq!(r.pool().in_use_count(), 15);
        assert_eq!(stats.replenish.pkts.pkts.get(), 15);
        assert_pool_balanced(r.pool());

        let entry = hw.take().unwrap();
        assert_eq!(entry.owner, 3);
        assert!(r.pool().validate(entry.cookie).is_ok());
    }

    #[test]
    fn test_preallocated_list_capped_to_ring_space() {
        let (r, hw, _stats) = replenisher(16, 8, Arc::new(HeapAllocator::new()), 4);
        r.replenish(0, None).unwrap();
        assert_eq!(hw.posted(), 7);

        // Device consumes two buffers which software then reaps
        let mut list = r.pool().empty_list();
        for _ in 0..2 {
            let entry = hw.take().unwrap();
            r.pool().take(entry.cookie).unwrap();
            list.push(entry.cookie.index());
        }
        // Caller hands over more descriptors than there is room for
        let mut extra = r.pool().allocate(3);
        while let Some(index) = extra.pop() {
            list.push(index);
        }
        drop(extra);

        let report = r.replenish(list.len(), Some(list)).unwrap();
        assert_eq!(report.requested, 2);
        assert_eq!(report.filled, 2);
        assert_eq!(report.returned, 3);
        assert_eq!(hw.posted(), 7);
        assert_eq!(r.pool().in_use_count(), 7);
        assert_pool_balanced(r.pool());
    }

    #[test]
    fn test_pool_exhaustion_is_partial() {
        let (r, hw, _stats) = replenisher(4, 16, Arc::new(HeapAllocator::new()), 4);

        let report = r.replenish(0, None).unwrap();
        assert_eq!(report.requested, 15);
        assert_eq!(report.filled, 4);
        assert_eq!(hw.posted(), 4);
        assert_eq!(r.pool().free_count(), 0);

        // Nothing left: counted, not an error
        hw.take().unwrap();
        let report = r.replenish(0, None).unwrap();
        assert_eq!(report.filled, 0);
        assert_pool_balanced(r.pool());
    }

    #[test]
    fn test_map_retry_succeeds_within_budget() {
        let alloc = Arc::new(FlakyAllocator::new(1, 2));
        let (r, _hw, stats) = replenisher(4, 4, alloc, 4);

        assert!(r.prepare_buffer().is_some());
        assert_eq!(stats.replenish.nbuf_alloc_fail.get(), 1);
        assert_eq!(stats.replenish.map_err.get(), 2);
    }

    #[test]
    fn test_persistent_map_failure_stops_early() {
        let alloc = Arc::new(FlakyAllocator::new(0, u32::MAX));
        let (r, hw, stats) = replenisher(8, 8, alloc, 3);

        let report = r.replenish(0, None).unwrap();
        assert_eq!(report.requested, 7);
        assert_eq!(report.filled, 0);
        assert_eq!(report.returned, 7);
        assert_eq!(hw.posted(), 0);
        assert_eq!(stats.replenish.map_err.get(), 3);
        assert_eq!(r.pool().free_count(), 8);
    }

    #[test]
    fn test_full_ring_returns_everything() {
        let (r, _hw, _stats) = replenisher(16, 8, Arc::new(HeapAllocator::new()), 4);
        assert_eq!(r.replenish(0, None).unwrap().filled, 7);

        let list = r.pool().allocate(2);
        let report = r.replenish(2, Some(list)).unwrap();
        assert_eq!(report.requested, 0);
        assert_eq!(report.returned, 2);
        assert_eq!(r.pool().free_count(), 9);
        assert_pool_balanced(r.pool());
    }
}
