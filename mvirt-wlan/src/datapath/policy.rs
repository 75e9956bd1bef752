//! Receive feature strategies
//!
//! Optional receive features (WDS acceptance policy, mesh filtering, the
//! intra-BSS bridging rule, WDS learning) are picked once from
//! [`FeatureConfig`] and bundled into an [`RxStrategy`]. The classifier calls
//! through it without knowing which variant is active.

use tracing::trace;

use super::buffer::{MeshRxInfo, RxBuffer};
use super::peer::{MeshRxFilter, OpMode, Peer, Vdev};
use super::tlv::RxTlv;
use crate::config::{BridgeMode, FeatureConfig};

/// 3/4-address acceptance check for WDS links
pub trait WdsRxPolicy: Send + Sync {
    /// Whether a frame from `peer` on `vdev` is accepted
    fn accept(&self, vdev: &Vdev, peer: &Peer, tlv: &RxTlv) -> bool;
}

/// No WDS policy: every frame is accepted
#[derive(Debug, Default)]
pub struct AcceptAll;

impl WdsRxPolicy for AcceptAll {
    fn accept(&self, _vdev: &Vdev, _peer: &Peer, _tlv: &RxTlv) -> bool {
        true
    }
}

/// Vendor WDS policy
///
/// In AP mode the vdev's BSS policy applies: non-WDS peers may only send
/// to-DS 3-address frames, WDS peers must match the configured unicast or
/// multicast 4-address bit. In station mode the peer's own policy applies.
#[derive(Debug, Default)]
pub struct WdsVendorPolicy;

impl WdsRxPolicy for WdsVendorPolicy {
    fn accept(&self, vdev: &Vdev, peer: &Peer, tlv: &RxTlv) -> bool {
        let policy = if vdev.opmode == OpMode::Ap {
            vdev.bss_wds_policy
        } else {
            peer.wds_policy
        };
        if !policy.rx_filter {
            return true;
        }

        let mcast = tlv.da_is_mcbc;
        let four_addr = tlv.is_4addr();

        if vdev.opmode == OpMode::Ap {
            (!peer.wds_enabled && tlv.is_3addr() && tlv.to_ds)
                || (peer.wds_enabled && !mcast && four_addr == policy.ucast_4addr)
                || (peer.wds_enabled && mcast && four_addr == policy.mcast_4addr)
        } else {
            (!mcast && four_addr == policy.ucast_4addr) || (mcast && four_addr == policy.mcast_4addr)
        }
    }
}

/// Mesh-mode hooks
pub trait MeshSupport: Send + Sync {
    /// Whether the vdev's exclusion filter drops this frame
    fn filtered(&self, vdev: &Vdev, tlv: &RxTlv) -> bool;

    /// Attach mesh receive info to a frame that passed the filter
    fn fill_info(&self, buf: &mut RxBuffer, tlv: &RxTlv);
}

/// Mesh support compiled out
#[derive(Debug, Default)]
pub struct NoMesh;

impl MeshSupport for NoMesh {
    fn filtered(&self, _vdev: &Vdev, _tlv: &RxTlv) -> bool {
        false
    }

    fn fill_info(&self, _buf: &mut RxBuffer, _tlv: &RxTlv) {}
}

/// Mesh exclusion filter and receive info
#[derive(Debug, Default)]
pub struct MeshRx;

impl MeshSupport for MeshRx {
    fn filtered(&self, vdev: &Vdev, tlv: &RxTlv) -> bool {
        let filter = vdev.mesh_rx_filter;

        let drop = (filter.contains(MeshRxFilter::FROM_DS) && tlv.fr_ds)
            || (filter.contains(MeshRxFilter::TO_DS) && tlv.to_ds)
            || (filter.contains(MeshRxFilter::NO_DS) && !tlv.fr_ds && !tlv.to_ds)
            || (filter.contains(MeshRxFilter::RA) && tlv.addr1 == vdev.mac)
            || (filter.contains(MeshRxFilter::TA) && tlv.addr2 == vdev.mac);

        if drop {
            trace!(vdev_id = vdev.id, filter = filter.bits(), "Mesh filter match");
        }
        drop
    }

    fn fill_info(&self, buf: &mut RxBuffer, tlv: &RxTlv) {
        buf.cb.mesh = Some(MeshRxInfo {
            first_msdu: buf.cb.chfrag_start,
            last_msdu: buf.cb.chfrag_end,
            decrypted: tlv.decrypted,
            key_index: tlv.key_id,
            rssi: tlv.rssi,
            channel: tlv.freq,
            rate_phy: tlv.rate_phy(),
        });
    }
}

/// Feature strategies resolved at startup
pub struct RxStrategy {
    wds: Box<dyn WdsRxPolicy>,
    mesh: Box<dyn MeshSupport>,
    bridge_mode: BridgeMode,
    wds_learning: bool,
    da_war: bool,
}

impl RxStrategy {
    pub fn from_config(features: &FeatureConfig) -> Self {
        let wds: Box<dyn WdsRxPolicy> = if features.wds_vendor_extension {
            Box::new(WdsVendorPolicy)
        } else {
            Box::new(AcceptAll)
        };
        let mesh: Box<dyn MeshSupport> = if features.mesh {
            Box::new(MeshRx)
        } else {
            Box::new(NoMesh)
        };

        Self {
            wds,
            mesh,
            bridge_mode: features.bridge_mode,
            wds_learning: features.wds_learning,
            da_war: features.da_war,
        }
    }

    pub fn wds_rx_policy_check(&self, vdev: &Vdev, peer: &Peer, tlv: &RxTlv) -> bool {
        self.wds.accept(vdev, peer, tlv)
    }

    pub fn mesh_filtered(&self, vdev: &Vdev, tlv: &RxTlv) -> bool {
        self.mesh.filtered(vdev, tlv)
    }

    pub fn fill_mesh_info(&self, buf: &mut RxBuffer, tlv: &RxTlv) {
        self.mesh.fill_info(buf, tlv)
    }

    /// Whether frames received on `vdev` may be bridged locally
    pub fn ap_bridge_allowed(&self, vdev: &Vdev) -> bool {
        match self.bridge_mode {
            BridgeMode::ApBridgeFlag => vdev.ap_bridge,
            BridgeMode::NonStation => vdev.opmode != OpMode::Sta,
        }
    }

    /// DA learning for a frame without a resolved destination
    pub fn da_learning(&self, vdev: &Vdev) -> bool {
        self.wds_learning && self.da_war && vdev.opmode == OpMode::Ap
    }

    pub fn srcport_learning(&self, vdev: &Vdev) -> bool {
        self.wds_learning && vdev.wds_enabled
    }
}

impl Default for RxStrategy {
    fn default() -> Self {
        Self::from_config(&FeatureConfig::default())
    }
}
