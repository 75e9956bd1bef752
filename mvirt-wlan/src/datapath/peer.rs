//! Peer and vdev directory
//!
//! Peers and vdevs are owned by the control plane. The receive path only
//! looks them up: a peer lookup hands out a [`PeerLease`] that holds a
//! reference for the duration of one packet and releases it on drop, so
//! every exit path (drop, forward, deliver) balances the count.
//!
//! A peer refers to its vdev by id, not by pointer; the vdev is resolved
//! through the directory each time and may be missing while a peer is being
//! re-bound.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use smoltcp::wire::EthernetAddress;
use tracing::{debug, info};

use super::deliver::RxDeliver;
use super::tlv::DecapFormat;
use crate::stats::{PeerStats, VdevStats};

pub type PeerId = u16;
pub type VdevId = u8;

const VDEV_UNBOUND: u16 = u16::MAX;

/// Vdev operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpMode {
    #[default]
    Ap,
    Sta,
    Monitor,
}

/// 3/4-address acceptance policy of a WDS link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WdsPolicy {
    /// Policy is enforced at all
    pub rx_filter: bool,
    /// Unicast must arrive with 4-address framing
    pub ucast_4addr: bool,
    /// Multicast must arrive with 4-address framing
    pub mcast_4addr: bool,
}

/// Mesh exclusion filter bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MeshRxFilter(u8);

impl MeshRxFilter {
    pub const NONE: Self = Self(0);
    /// Drop frames with the from-DS bit set
    pub const FROM_DS: Self = Self(1 << 0);
    /// Drop frames with the to-DS bit set
    pub const TO_DS: Self = Self(1 << 1);
    /// Drop frames with neither DS bit set
    pub const NO_DS: Self = Self(1 << 2);
    /// Drop frames whose receiver address is ours
    pub const RA: Self = Self(1 << 3);
    /// Drop frames whose transmitter address is ours
    pub const TA: Self = Self(1 << 4);

    pub fn contains(self, other: Self) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub fn bits(self) -> u8 {
        self.0
    }
}

impl std::ops::BitOr for MeshRxFilter {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Virtual interface
pub struct Vdev {
    pub id: VdevId,
    pub mac: EthernetAddress,
    pub opmode: OpMode,
    /// Format frames are handed to the upper layer in
    pub rx_decap: DecapFormat,
    pub mesh: bool,
    pub mesh_rx_filter: MeshRxFilter,
    /// Platform AP-bridge flag
    pub ap_bridge: bool,
    pub wds_enabled: bool,
    /// Policy of the vdev's own BSS, applied to peers in AP mode
    pub bss_wds_policy: WdsPolicy,
    pub stats: VdevStats,
    rx: RwLock<Option<Arc<dyn RxDeliver>>>,
}

impl Vdev {
    pub fn new(id: VdevId, mac: EthernetAddress, opmode: OpMode) -> Self {
        Self {
            id,
            mac,
            opmode,
            rx_decap: DecapFormat::Ethernet,
            mesh: false,
            mesh_rx_filter: MeshRxFilter::NONE,
            ap_bridge: opmode == OpMode::Ap,
            wds_enabled: false,
            bss_wds_policy: WdsPolicy::default(),
            stats: VdevStats::default(),
            rx: RwLock::new(None),
        }
    }

    pub fn with_decap(mut self, decap: DecapFormat) -> Self {
        self.rx_decap = decap;
        self
    }

    pub fn with_mesh(mut self, filter: MeshRxFilter) -> Self {
        self.mesh = true;
        self.mesh_rx_filter = filter;
        self
    }

    pub fn with_ap_bridge(mut self, enabled: bool) -> Self {
        self.ap_bridge = enabled;
        self
    }

    pub fn with_wds(mut self, policy: WdsPolicy) -> Self {
        self.wds_enabled = true;
        self.bss_wds_policy = policy;
        self
    }

    /// Install the upper-layer delivery callback
    pub fn register_rx(&self, deliver: Arc<dyn RxDeliver>) {
        *self.rx.write().unwrap_or_else(|e| e.into_inner()) = Some(deliver);
    }

    pub fn unregister_rx(&self) {
        *self.rx.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Current delivery callback, if any
    pub fn rx_callback(&self) -> Option<Arc<dyn RxDeliver>> {
        self.rx.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl std::fmt::Debug for Vdev {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vdev")
            .field("id", &self.id)
            .field("mac", &self.mac)
            .field("opmode", &self.opmode)
            .field("rx_decap", &self.rx_decap)
            .field("mesh", &self.mesh)
            .finish()
    }
}

/// Remote link partner
#[derive(Debug)]
pub struct Peer {
    pub id: PeerId,
    pub mac: EthernetAddress,
    vdev_id: AtomicU16,
    /// The vdev's own BSS peer
    pub bss_peer: bool,
    pub wds_enabled: bool,
    pub nawds_enabled: bool,
    /// Policy applied to this peer in station mode
    pub wds_policy: WdsPolicy,
    pub stats: PeerStats,
    refs: AtomicUsize,
}

impl Peer {
    pub fn new(id: PeerId, mac: EthernetAddress) -> Self {
        Self {
            id,
            mac,
            vdev_id: AtomicU16::new(VDEV_UNBOUND),
            bss_peer: false,
            wds_enabled: false,
            nawds_enabled: false,
            wds_policy: WdsPolicy::default(),
            stats: PeerStats::default(),
            refs: AtomicUsize::new(0),
        }
    }

    pub fn bss(mut self) -> Self {
        self.bss_peer = true;
        self
    }

    pub fn with_wds(mut self, policy: WdsPolicy) -> Self {
        self.wds_enabled = true;
        self.wds_policy = policy;
        self
    }

    pub fn with_nawds(mut self) -> Self {
        self.nawds_enabled = true;
        self
    }

    /// Bind to `vdev`, replacing any previous binding
    pub fn bind(&self, vdev: VdevId) {
        self.vdev_id.store(u16::from(vdev), Ordering::Release);
    }

    pub fn unbind(&self) {
        self.vdev_id.store(VDEV_UNBOUND, Ordering::Release);
    }

    pub fn vdev_id(&self) -> Option<VdevId> {
        match self.vdev_id.load(Ordering::Acquire) {
            VDEV_UNBOUND => None,
            id => Some(id as VdevId),
        }
    }

    /// References currently held by the receive path
    pub fn refs(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }
}

/// Counted reference to a peer, released on drop
#[derive(Debug)]
pub struct PeerLease {
    peer: Arc<Peer>,
}

impl PeerLease {
    pub fn acquire(peer: Arc<Peer>) -> Self {
        peer.refs.fetch_add(1, Ordering::AcqRel);
        Self { peer }
    }

    pub fn peer(&self) -> &Arc<Peer> {
        &self.peer
    }
}

impl Deref for PeerLease {
    type Target = Peer;

    fn deref(&self) -> &Peer {
        &self.peer
    }
}

impl Drop for PeerLease {
    fn drop(&mut self) {
        self.peer.refs.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Kind of address-search-table entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AstType {
    Static,
    /// Learned from a WDS source port
    Wds,
    /// Learned destination
    Da,
    /// Multicast echo check
    Mec,
}

/// Address-search-table entry: MAC address to owning peer
#[derive(Debug)]
pub struct AstEntry {
    pub mac: EthernetAddress,
    pub peer_id: PeerId,
    pub ast_type: AstType,
    active: AtomicBool,
}

impl AstEntry {
    pub fn new(mac: EthernetAddress, peer_id: PeerId, ast_type: AstType) -> Self {
        Self {
            mac,
            peer_id,
            ast_type,
            active: AtomicBool::new(true),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Relaxed);
    }
}

/// Lookup contract the receive path depends on
pub trait PeerDirectory: Send + Sync {
    /// Resolve a peer id, taking a reference
    fn lookup_peer(&self, id: PeerId) -> Option<PeerLease>;

    fn vdev(&self, id: VdevId) -> Option<Arc<Vdev>>;

    fn ast_entry(&self, index: u16) -> Option<Arc<AstEntry>>;

    /// Highest valid AST index
    fn max_ast_index(&self) -> u16;
}

/// In-memory directory
///
/// Uses ArcSwap so lookups never contend with control-plane updates.
pub struct PeerTable {
    peers: ArcSwap<HashMap<PeerId, Arc<Peer>>>,
    vdevs: ArcSwap<HashMap<VdevId, Arc<Vdev>>>,
    ast: ArcSwap<HashMap<u16, Arc<AstEntry>>>,
    next_ast: AtomicU32,
    max_ast_index: u16,
}

impl PeerTable {
    pub fn new(max_ast_index: u16) -> Self {
        Self {
            peers: ArcSwap::new(Arc::new(HashMap::new())),
            vdevs: ArcSwap::new(Arc::new(HashMap::new())),
            ast: ArcSwap::new(Arc::new(HashMap::new())),
            next_ast: AtomicU32::new(1),
            max_ast_index,
        }
    }

    pub fn add_vdev(&self, vdev: Arc<Vdev>) {
        info!(vdev_id = vdev.id, mac = %vdev.mac, opmode = ?vdev.opmode, "Vdev added");
        let mut map = (**self.vdevs.load()).clone();
        map.insert(vdev.id, vdev);
        self.vdevs.store(Arc::new(map));
    }

    pub fn remove_vdev(&self, id: VdevId) -> Option<Arc<Vdev>> {
        let mut map = (**self.vdevs.load()).clone();
        let removed = map.remove(&id);
        self.vdevs.store(Arc::new(map));
        removed
    }

    /// Add `peer` bound to `vdev`, with a static AST entry for its address
    pub fn add_peer(&self, peer: Peer, vdev: VdevId) -> Arc<Peer> {
        peer.bind(vdev);
        let peer = Arc::new(peer);
        info!(peer_id = peer.id, mac = %peer.mac, vdev_id = vdev, "Peer added");

        let mut map = (**self.peers.load()).clone();
        map.insert(peer.id, Arc::clone(&peer));
        self.peers.store(Arc::new(map));

        self.add_ast(peer.mac, peer.id, AstType::Static);
        peer
    }

    pub fn remove_peer(&self, id: PeerId) -> Option<Arc<Peer>> {
        let mut map = (**self.peers.load()).clone();
        let removed = map.remove(&id);
        self.peers.store(Arc::new(map));

        if removed.is_some() {
            let mut ast = (**self.ast.load()).clone();
            ast.retain(|_, entry| entry.peer_id != id);
            self.ast.store(Arc::new(ast));
        }
        removed
    }

    pub fn peer(&self, id: PeerId) -> Option<Arc<Peer>> {
        self.peers.load().get(&id).cloned()
    }

    /// Insert an AST entry for `mac` unless one exists; returns its index
    ///
    /// Returns `None` once the index space is used up.
    pub fn add_ast(&self, mac: EthernetAddress, peer_id: PeerId, ast_type: AstType) -> Option<u16> {
        if let Some(index) = self.find_ast(&mac) {
            return Some(index);
        }

        let index = self.next_ast.fetch_add(1, Ordering::Relaxed);
        if index > u32::from(self.max_ast_index) {
            debug!(%mac, peer_id, "AST index space exhausted");
            return None;
        }
        let index = index as u16;

        let mut map = (**self.ast.load()).clone();
        map.insert(index, Arc::new(AstEntry::new(mac, peer_id, ast_type)));
        self.ast.store(Arc::new(map));
        debug!(%mac, peer_id, index, ?ast_type, "AST entry added");
        Some(index)
    }

    /// Index of the AST entry for `mac`
    pub fn find_ast(&self, mac: &EthernetAddress) -> Option<u16> {
        self.ast
            .load()
            .iter()
            .find(|(_, entry)| entry.mac == *mac)
            .map(|(index, _)| *index)
    }

    /// Sum of outstanding leases over all peers
    pub fn outstanding_refs(&self) -> usize {
        self.peers.load().values().map(|p| p.refs()).sum()
    }
}

impl PeerDirectory for PeerTable {
    fn lookup_peer(&self, id: PeerId) -> Option<PeerLease> {
        self.peers.load().get(&id).cloned().map(PeerLease::acquire)
    }

    fn vdev(&self, id: VdevId) -> Option<Arc<Vdev>> {
        self.vdevs.load().get(&id).cloned()
    }

    fn ast_entry(&self, index: u16) -> Option<Arc<AstEntry>> {
        self.ast.load().get(&index).cloned()
    }

    fn max_ast_index(&self) -> u16 {
        self.max_ast_index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(last: u8) -> EthernetAddress {
        EthernetAddress([0x02, 0, 0, 0, 0, last])
    }

    #[test]
    fn test_lease_balances_refs() {
        let table = PeerTable::new(64);
        table.add_vdev(Arc::new(Vdev::new(0, mac(1), OpMode::Ap)));
        let peer = table.add_peer(Peer::new(5, mac(5)), 0);

        {
            let a = table.lookup_peer(5).unwrap();
            let b = table.lookup_peer(5).unwrap();
            assert_eq!(a.id, 5);
            assert_eq!(b.vdev_id(), Some(0));
            assert_eq!(peer.refs(), 2);
        }
        assert_eq!(peer.refs(), 0);
        assert_eq!(table.outstanding_refs(), 0);
        assert!(table.lookup_peer(6).is_none());
    }

    #[test]
    fn test_unbound_peer_has_no_vdev() {
        let peer = Peer::new(1, mac(1));
        assert_eq!(peer.vdev_id(), None);
        peer.bind(3);
        assert_eq!(peer.vdev_id(), Some(3));
        peer.unbind();
        assert_eq!(peer.vdev_id(), None);
    }

    #[test]
    fn test_ast_entries() {
        let table = PeerTable::new(2);
        table.add_vdev(Arc::new(Vdev::new(0, mac(1), OpMode::Ap)));
        table.add_peer(Peer::new(7, mac(7)), 0);

        let index = table.find_ast(&mac(7)).unwrap();
        let entry = table.ast_entry(index).unwrap();
        assert_eq!(entry.peer_id, 7);
        assert_eq!(entry.ast_type, AstType::Static);

        // Existing address keeps its index
        assert_eq!(table.add_ast(mac(7), 7, AstType::Wds), Some(index));
        assert!(table.add_ast(mac(8), 7, AstType::Wds).is_some());
        // Index space exhausted
        assert!(table.add_ast(mac(9), 7, AstType::Wds).is_none());

        table.remove_peer(7);
        assert!(table.find_ast(&mac(7)).is_none());
    }

    #[test]
    fn test_mesh_filter_bits() {
        let filter = MeshRxFilter::FROM_DS | MeshRxFilter::TA;
        assert!(filter.contains(MeshRxFilter::FROM_DS));
        assert!(filter.contains(MeshRxFilter::TA));
        assert!(!filter.contains(MeshRxFilter::TO_DS));
        assert!(!filter.contains(MeshRxFilter::NONE));
    }
}
