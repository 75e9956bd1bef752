//! Receive counters
//!
//! The datapath only ever increments these; readers take a
//! [`RxStatsSnapshot`] for reporting.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Number of TIDs tracked per radio
pub const MAX_TIDS: usize = 16;

/// Number of completion rings tracked
pub const MAX_RINGS: usize = 8;

/// Why a packet left the receive path without being delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Completion marker missing after DMA
    MsduDone,
    /// No peer for the identity token
    InvalidPeer,
    /// Peer without a vdev, or vdev without a delivery callback
    InvalidVdev,
    /// WDS security/topology policy mismatch
    PolicyCheck,
    /// Peer echoed our own traffic
    MecDrop,
    /// Multicast without 4-address framing from a NAWDS peer
    NawdsMcast,
    /// Matched the mesh exclusion filter
    MeshFilter,
    /// SA/DA index out of the AST range
    InvalidSaDaIdx,
    /// Intra-BSS forward failed
    IntraBss,
    /// Multi-buffer unit could not be rebuilt
    Reassembly,
    /// Declared MSDU length does not fit the buffer
    InvalidLength,
}

impl DropReason {
    pub const COUNT: usize = 11;

    pub const ALL: [DropReason; Self::COUNT] = [
        DropReason::MsduDone,
        DropReason::InvalidPeer,
        DropReason::InvalidVdev,
        DropReason::PolicyCheck,
        DropReason::MecDrop,
        DropReason::NawdsMcast,
        DropReason::MeshFilter,
        DropReason::InvalidSaDaIdx,
        DropReason::IntraBss,
        DropReason::Reassembly,
        DropReason::InvalidLength,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DropReason::MsduDone => "msdu_done",
            DropReason::InvalidPeer => "invalid_peer",
            DropReason::InvalidVdev => "invalid_vdev",
            DropReason::PolicyCheck => "policy_check",
            DropReason::MecDrop => "mec_drop",
            DropReason::NawdsMcast => "nawds_mcast",
            DropReason::MeshFilter => "mesh_filter",
            DropReason::InvalidSaDaIdx => "invalid_sa_da_idx",
            DropReason::IntraBss => "intra_bss",
            DropReason::Reassembly => "reassembly",
            DropReason::InvalidLength => "invalid_length",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Monotonic counter
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    #[inline]
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Packet and byte counter pair
#[derive(Debug, Default)]
pub struct PktCounter {
    pub pkts: Counter,
    pub bytes: Counter,
}

impl PktCounter {
    #[inline]
    pub fn record(&self, bytes: usize) {
        self.pkts.inc();
        self.bytes.add(bytes as u64);
    }
}

fn counters<const N: usize>() -> [Counter; N] {
    std::array::from_fn(|_| Counter::default())
}

/// Per-TID receive counters
#[derive(Debug)]
pub struct TidStats {
    pub msdu_cnt: Counter,
    pub mcast_msdu_cnt: Counter,
    pub bcast_msdu_cnt: Counter,
    pub intrabss_cnt: Counter,
    pub delivered_to_stack: Counter,
    fail_cnt: [Counter; DropReason::COUNT],
}

impl Default for TidStats {
    fn default() -> Self {
        Self {
            msdu_cnt: Counter::default(),
            mcast_msdu_cnt: Counter::default(),
            bcast_msdu_cnt: Counter::default(),
            intrabss_cnt: Counter::default(),
            delivered_to_stack: Counter::default(),
            fail_cnt: counters(),
        }
    }
}

impl TidStats {
    pub fn fail(&self, reason: DropReason) {
        self.fail_cnt[reason.index()].inc();
    }

    pub fn fail_count(&self, reason: DropReason) -> u64 {
        self.fail_cnt[reason.index()].get()
    }
}

/// Refill-side counters
#[derive(Debug, Default)]
pub struct ReplenishStats {
    pub pkts: PktCounter,
    pub nbuf_alloc_fail: Counter,
    pub map_err: Counter,
    pub desc_alloc_fail: Counter,
    /// Descriptors handed back instead of being armed
    pub buf_freelist: Counter,
    pub rxdma_err: Counter,
}

/// Ring and descriptor error counters
#[derive(Debug, Default)]
pub struct ErrorStats {
    pub ring_access_fail: Counter,
    pub reo_error: Counter,
    /// Reap of a descriptor that was not in use
    pub dest_dup: Counter,
    pub invalid_magic: Counter,
    pub invalid_cookie: Counter,
    pub ip_csum_err: Counter,
    pub tcp_udp_csum_err: Counter,
}

/// Receive statistics for one datapath instance
#[derive(Debug)]
pub struct RxStats {
    drops: [Counter; DropReason::COUNT],
    tids: [TidStats; MAX_TIDS],
    ring_packets: [Counter; MAX_RINGS],
    pub replenish: ReplenishStats,
    pub err: ErrorStats,
    pub raw_pkts: Counter,
    pub delivered: PktCounter,
    pub intra_bss: PktCounter,
}

impl Default for RxStats {
    fn default() -> Self {
        Self {
            drops: counters(),
            tids: std::array::from_fn(|_| TidStats::default()),
            ring_packets: counters(),
            replenish: ReplenishStats::default(),
            err: ErrorStats::default(),
            raw_pkts: Counter::default(),
            delivered: PktCounter::default(),
            intra_bss: PktCounter::default(),
        }
    }
}

impl RxStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one dropped packet
    pub fn drop_pkt(&self, reason: DropReason) {
        self.drops[reason.index()].inc();
    }

    pub fn drops(&self, reason: DropReason) -> u64 {
        self.drops[reason.index()].get()
    }

    pub fn total_drops(&self) -> u64 {
        self.drops.iter().map(Counter::get).sum()
    }

    /// Counters of `tid`; out-of-range TIDs share the last slot
    pub fn tid(&self, tid: u8) -> &TidStats {
        &self.tids[usize::from(tid).min(MAX_TIDS - 1)]
    }

    pub fn ring_reaped(&self, ring_id: u8) {
        self.ring_packets[usize::from(ring_id).min(MAX_RINGS - 1)].inc();
    }

    pub fn ring_packets(&self, ring_id: u8) -> u64 {
        self.ring_packets[usize::from(ring_id).min(MAX_RINGS - 1)].get()
    }

    pub fn snapshot(&self) -> RxStatsSnapshot {
        RxStatsSnapshot {
            delivered: self.delivered.pkts.get(),
            delivered_bytes: self.delivered.bytes.get(),
            intra_bss_fwd: self.intra_bss.pkts.get(),
            raw_pkts: self.raw_pkts.get(),
            drops: DropReason::ALL
                .iter()
                .filter(|r| self.drops(**r) > 0)
                .map(|r| (*r, self.drops(*r)))
                .collect(),
            tids: self
                .tids
                .iter()
                .enumerate()
                .filter(|(_, t)| t.msdu_cnt.get() > 0)
                .map(|(tid, t)| TidSnapshot {
                    tid: tid as u8,
                    msdu: t.msdu_cnt.get(),
                    mcast: t.mcast_msdu_cnt.get(),
                    bcast: t.bcast_msdu_cnt.get(),
                    intrabss: t.intrabss_cnt.get(),
                    delivered: t.delivered_to_stack.get(),
                })
                .collect(),
            ring_packets: self.ring_packets.iter().map(Counter::get).collect(),
            replenished: self.replenish.pkts.pkts.get(),
            nbuf_alloc_fail: self.replenish.nbuf_alloc_fail.get(),
            map_err: self.replenish.map_err.get(),
            desc_alloc_fail: self.replenish.desc_alloc_fail.get(),
            ring_access_fail: self.err.ring_access_fail.get(),
            ip_csum_err: self.err.ip_csum_err.get(),
            tcp_udp_csum_err: self.err.tcp_udp_csum_err.get(),
        }
    }
}

/// Per-TID part of a snapshot
#[derive(Debug, Clone, Serialize)]
pub struct TidSnapshot {
    pub tid: u8,
    pub msdu: u64,
    pub mcast: u64,
    pub bcast: u64,
    pub intrabss: u64,
    pub delivered: u64,
}

/// Point-in-time copy of [`RxStats`]
#[derive(Debug, Clone, Serialize)]
pub struct RxStatsSnapshot {
    pub delivered: u64,
    pub delivered_bytes: u64,
    pub intra_bss_fwd: u64,
    pub raw_pkts: u64,
    pub drops: Vec<(DropReason, u64)>,
    pub tids: Vec<TidSnapshot>,
    pub ring_packets: Vec<u64>,
    pub replenished: u64,
    pub nbuf_alloc_fail: u64,
    pub map_err: u64,
    pub desc_alloc_fail: u64,
    pub ring_access_fail: u64,
    pub ip_csum_err: u64,
    pub tcp_udp_csum_err: u64,
}

/// Per-peer receive counters
#[derive(Debug, Default)]
pub struct PeerStats {
    pub to_stack: PktCounter,
    pub raw: PktCounter,
    pub multicast: PktCounter,
    pub bcast: PktCounter,
    pub amsdu: Counter,
    pub mec_drop: PktCounter,
    pub nawds_mcast_drop: Counter,
    pub intra_bss_pkts: PktCounter,
    pub intra_bss_fail: PktCounter,
}

/// Per-vdev receive counters
#[derive(Debug, Default)]
pub struct VdevStats {
    pub rx: PktCounter,
    pub raw: Counter,
}
