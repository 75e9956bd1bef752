//! Completion ring servicer
//!
//! First pass of a service call: drain up to `quota` completions from one
//! REO destination ring into a flat [`PacketList`], stash the completion
//! metadata in each buffer's control block and hand the reaped descriptors
//! back to their pools through the replenisher.
//!
//! Raw aggregates may span several completions, and each MSDU inside one
//! may span several buffers. Before the first buffer of a raw MSDU is
//! consumed the servicer checks that the ring already holds every buffer
//! of that MSDU; if not, the call stops without touching it and the next
//! call retries. An MSDU is therefore never split across calls. Once
//! admitted, an aggregate is drained to its last entry even if that
//! exceeds the quota, possibly across calls.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, error, trace, warn};

use super::buffer::{PacketList, RxCb};
use super::desc_pool::{DescFault, DescList};
use super::dma::DmaDirection;
use super::replenish::Replenisher;
use super::ring::{DestRing, ReoStatus, RxCompletion};
use super::tlv::RX_BUFFER_PAYLOAD;
use crate::error::{Result, RxError};
use crate::recovery::{HangReason, SelfRecovery};
use crate::stats::RxStats;

/// Reaped entries kept for the desynchronization dump
pub const DUMP_WINDOW: usize = 8;

/// Progress of the current service call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServiceState {
    #[default]
    NotStarted,
    Draining,
    Drained,
}

/// Result of one reap pass
#[derive(Debug, Default)]
pub struct ReapOutcome {
    /// Reaped buffers in ring order, the last one flagged `flush_ind`
    pub packets: PacketList,
    /// Ring entries consumed
    pub reaped: usize,
    /// Refill slots published afterwards
    pub replenished: usize,
}

/// Consumer of one completion ring
pub struct RingServicer {
    ring: Box<dyn DestRing>,
    /// Replenishers indexed by pool id
    pools: Vec<Arc<Replenisher>>,
    stats: Arc<RxStats>,
    recovery: Arc<dyn SelfRecovery>,
    raw_in_progress: bool,
    /// Last reaped buffer had the continuation flag
    msdu_open: bool,
    /// Most recently reaped entries, oldest first
    history: VecDeque<RxCompletion>,
    state: ServiceState,
}

impl RingServicer {
    pub fn new(
        ring: Box<dyn DestRing>,
        pools: Vec<Arc<Replenisher>>,
        stats: Arc<RxStats>,
        recovery: Arc<dyn SelfRecovery>,
    ) -> Self {
        Self {
            ring,
            pools,
            stats,
            recovery,
            raw_in_progress: false,
            msdu_open: false,
            history: VecDeque::with_capacity(DUMP_WINDOW),
            state: ServiceState::NotStarted,
        }
    }

    pub fn ring_id(&self) -> u8 {
        self.ring.ring_id()
    }

    pub fn state(&self) -> ServiceState {
        self.state
    }

    /// Whether a raw aggregate was admitted but not fully drained
    pub fn raw_in_progress(&self) -> bool {
        self.raw_in_progress
    }

    /// Entries reaped most recently, oldest first, at most [`DUMP_WINDOW`]
    pub fn recent_entries(&self) -> impl Iterator<Item = &RxCompletion> {
        self.history.iter()
    }

    /// Drain up to `quota` sub-units and replenish the reaped slots
    pub fn reap(&mut self, quota: usize) -> Result<ReapOutcome> {
        let ring_id = self.ring.ring_id();
        self.state = ServiceState::Draining;

        if let Err(source) = self.ring.access_start() {
            self.stats.err.ring_access_fail.inc();
            self.state = ServiceState::Drained;
            warn!(ring_id, error = %source, "Rx ring access failed");
            return Err(RxError::RingAccess {
                ring: ring_id,
                source,
            });
        }

        let mut lists: Vec<Option<DescList>> = self.pools.iter().map(|_| None).collect();
        let mut packets = PacketList::new();
        let mut quota = quota;
        let mut reaped = 0;

        while quota > 0 || self.raw_in_progress {
            let Some(entry) = self.ring.peek() else {
                break;
            };

            if entry.status == ReoStatus::ErrorDetected {
                self.ring.access_end();
                self.stats.err.reo_error.inc();
                error!(ring_id, ?entry, "Rx ring reported an error");
                crate::trigger_self_recovery!(self.recovery, HangReason::ReoRingError);
                self.state = ServiceState::Drained;
                return Err(RxError::RingFault { ring: ring_id });
            }

            let cookie = entry.cookie;
            let Some(replenisher) = self.pools.get(usize::from(cookie.pool_id())).cloned() else {
                self.ring.access_end();
                self.stats.err.invalid_cookie.inc();
                error!(ring_id, %cookie, ?entry, "Rx completion for unknown pool");
                crate::trigger_self_recovery!(self.recovery, HangReason::RxDescCorruption);
                self.state = ServiceState::Drained;
                return Err(RxError::UnknownPool(cookie.pool_id()));
            };

            if let Err(fault) = replenisher.pool().validate(cookie) {
                return Err(self.desync(&replenisher, &entry, fault));
            }

            let raw_frame = entry.mpdu.raw_ampdu;
            let msdu_start = !self.msdu_open;
            if raw_frame && msdu_start {
                let needed = usize::from(entry.msdu.msdu_len)
                    .div_ceil(RX_BUFFER_PAYLOAD)
                    .max(1);
                let avail = self.ring.num_valid(true);
                if needed > avail {
                    debug!(ring_id, needed, avail, "Raw MSDU not complete yet");
                    break;
                }
            }

            if self.ring.pop().is_none() {
                break;
            }

            let mut buf = match replenisher.pool().take(cookie) {
                Ok(buf) => buf,
                Err(fault) => return Err(self.desync(&replenisher, &entry, fault)),
            };
            replenisher
                .allocator()
                .unmap(&mut buf, DmaDirection::FromDevice);

            buf.cb = control_block(&entry, ring_id, raw_frame);
            buf.cb.msdu_start = msdu_start;
            self.msdu_open = entry.msdu.continuation;
            if raw_frame {
                self.raw_in_progress = !entry.msdu.last_msdu;
            }
            if self.history.len() == DUMP_WINDOW {
                self.history.pop_front();
            }
            self.history.push_back(entry);
            self.stats.ring_reaped(ring_id);
            reaped += 1;

            if !entry.msdu.continuation {
                quota = quota.saturating_sub(1);
            }

            trace!(ring_id, %cookie, len = entry.msdu.msdu_len, "Reaped rx buffer");
            packets.push_back(buf);
            lists[usize::from(cookie.pool_id())]
                .get_or_insert_with(|| replenisher.pool().empty_list())
                .push(cookie.index());
        }

        self.ring.access_end();

        if let Some(last) = packets.back_mut() {
            last.cb.flush_ind = true;
        }

        let mut replenished = 0;
        for (pool_id, list) in lists.into_iter().enumerate() {
            let Some(list) = list else {
                continue;
            };
            let count = list.len();
            match self.pools[pool_id].replenish(count, Some(list)) {
                Ok(report) => replenished += report.filled,
                Err(e @ RxError::Desync(_)) => {
                    self.state = ServiceState::Drained;
                    return Err(e);
                }
                Err(e) => warn!(ring_id, pool_id, error = %e, "Replenish after reap failed"),
            }
        }

        self.state = ServiceState::Drained;
        if reaped > 0 {
            debug!(ring_id, reaped, replenished, "Rx ring drained");
        }

        Ok(ReapOutcome {
            packets,
            reaped,
            replenished,
        })
    }

    /// Dump state, fire the recovery hook and build the error
    fn desync(&mut self, replenisher: &Replenisher, entry: &RxCompletion, fault: DescFault) -> RxError {
        let ring_id = self.ring.ring_id();
        self.ring.access_end();
        self.state = ServiceState::Drained;

        match fault {
            DescFault::NotInUse(_) => self.stats.err.dest_dup.inc(),
            DescFault::BadMagic(_) => self.stats.err.invalid_magic.inc(),
            DescFault::InvalidCookie(_) | DescFault::AlreadyInUse(_) => {
                self.stats.err.invalid_cookie.inc()
            }
        }

        let desc = replenisher.pool().snapshot(entry.cookie);
        error!(
            ring_id,
            cookie = %entry.cookie,
            %fault,
            ?desc,
            ?entry,
            "Rx descriptor desynchronized"
        );
        let depth = self.history.len();
        for (age, recent) in self.history.iter().rev().enumerate() {
            error!(ring_id, age, depth, cookie = %recent.cookie, entry = ?recent, "Recent rx ring entry");
        }
        crate::trigger_self_recovery!(self.recovery, HangReason::RxDescCorruption);
        RxError::Desync(fault)
    }
}

fn control_block(entry: &RxCompletion, ring_id: u8, raw_frame: bool) -> RxCb {
    RxCb {
        peer_id: entry.mpdu.peer_id(),
        msdu_len: entry.msdu.msdu_len,
        tid: entry.queue,
        ring_id,
        pool_id: entry.cookie.pool_id(),
        chfrag_start: entry.msdu.first_msdu,
        chfrag_cont: entry.msdu.continuation,
        chfrag_end: entry.msdu.last_msdu,
        da_mcbc: entry.msdu.da_is_mcbc,
        da_valid: entry.msdu.da_is_valid,
        sa_valid: entry.msdu.sa_is_valid,
        raw_frame,
        frag: entry.mpdu.fragment,
        ..Default::default()
    }
}
