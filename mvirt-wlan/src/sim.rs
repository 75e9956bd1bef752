//! Device emulator
//!
//! Plays the hardware side of the software rings: takes buffers off the
//! refill rings, DMA-writes an rx TLV header plus payload into them and
//! posts completions to a REO destination ring. Frames longer than one
//! buffer are split across consecutive entries the way the device chains
//! raw aggregates.
//!
//! [`SoftDevice`] wires a complete datapath to an emulator.

use std::sync::Arc;

use thiserror::Error;
use tracing::trace;

use crate::config::RxConfig;
use crate::datapath::desc_pool::{DescFault, DescPool};
use crate::datapath::process::{RxDatapath, RxDatapathBuilder, RxProcessor};
use crate::datapath::ring::{
    DestRing, DestRingProducer, MpduDescInfo, MsduDescInfo, RefillRingConsumer, ReoStatus,
    RingError, RxCompletion, SoftDestRing, soft_dest_ring, soft_refill_ring,
};
use crate::datapath::tlv::{RX_BUFFER_PAYLOAD, RX_PKT_TLVS_LEN, RxTlv};
use crate::error::RxError;

/// Emulator errors
#[derive(Debug, Error)]
pub enum SimError {
    #[error("no pdev {0}")]
    NoPdev(u8),

    #[error("no REO ring {0}")]
    NoRing(u8),

    #[error("need {needed} rx buffers, device holds {posted}")]
    NoBuffers { needed: usize, posted: usize },

    #[error("REO ring {ring} has room for {space} of {needed} completions")]
    RingFull { ring: u8, needed: usize, space: usize },

    #[error("{0} byte frame does not fit one rx buffer")]
    TooLong(usize),

    #[error("descriptor write failed: {0}")]
    Desc(#[from] DescFault),

    #[error("ring error: {0}")]
    Ring(#[from] RingError),
}

/// One frame as received over the air
#[derive(Debug, Clone)]
pub struct SimFrame {
    pub peer_id: u16,
    pub tid: u8,
    pub tlv: RxTlv,
    pub payload: Vec<u8>,
    pub raw: bool,
    pub fragment: bool,
    pub first_msdu: bool,
    pub last_msdu: bool,
}

impl SimFrame {
    /// Ethernet-decapsulated frame in one MSDU
    pub fn ethernet(peer_id: u16, payload: Vec<u8>) -> Self {
        Self {
            peer_id,
            tid: 0,
            tlv: RxTlv::default(),
            payload,
            raw: false,
            fragment: false,
            first_msdu: true,
            last_msdu: true,
        }
    }

    /// Raw frame; split across buffers when longer than one
    pub fn raw(peer_id: u16, payload: Vec<u8>) -> Self {
        Self {
            raw: true,
            tlv: RxTlv {
                decap: crate::datapath::tlv::DecapFormat::Raw,
                ..Default::default()
            },
            ..Self::ethernet(peer_id, payload)
        }
    }

    pub fn tid(mut self, tid: u8) -> Self {
        self.tid = tid;
        self
    }

    /// Replace the TLV; the MSDU length is always taken from the payload
    pub fn tlv(mut self, tlv: RxTlv) -> Self {
        self.tlv = tlv;
        self
    }

    /// Destination is multicast or broadcast
    pub fn multicast(mut self) -> Self {
        self.tlv.da_is_mcbc = true;
        self
    }

    /// Destination resolved by the device to AST index `idx`
    pub fn da_index(mut self, idx: u16) -> Self {
        self.tlv.da_is_valid = true;
        self.tlv.da_idx = idx;
        self
    }

    /// Position inside an A-MSDU
    pub fn amsdu(mut self, first: bool, last: bool) -> Self {
        self.first_msdu = first;
        self.last_msdu = last;
        self
    }

    /// Re-injected 802.11 fragment
    pub fn fragment(mut self) -> Self {
        self.fragment = true;
        self
    }

    fn buffers(&self) -> usize {
        if self.raw {
            self.payload.len().div_ceil(RX_BUFFER_PAYLOAD).max(1)
        } else {
            1
        }
    }
}

/// Hardware side of the software rings
pub struct DeviceEmulator {
    pools: Vec<Arc<DescPool>>,
    refill: Vec<RefillRingConsumer>,
    dest: Vec<DestRingProducer>,
}

impl DeviceEmulator {
    /// `pools` and `refill` are indexed by pdev, `dest` by ring id
    pub fn new(
        pools: Vec<Arc<DescPool>>,
        refill: Vec<RefillRingConsumer>,
        dest: Vec<DestRingProducer>,
    ) -> Self {
        Self {
            pools,
            refill,
            dest,
        }
    }

    /// Buffers published to `pdev` and not yet used
    pub fn buffers_posted(&self, pdev: u8) -> usize {
        self.refill
            .get(usize::from(pdev))
            .map_or(0, RefillRingConsumer::posted)
    }

    /// Completions on `ring` not yet reaped
    pub fn pending(&self, ring: u8) -> usize {
        self.dest
            .get(usize::from(ring))
            .map_or(0, DestRingProducer::pending)
    }

    /// Receive `frame` on `pdev`, completing it to `ring`
    ///
    /// Nothing is consumed unless the whole frame fits. Returns the posted
    /// completions in ring order.
    pub fn receive(&self, pdev: u8, ring: u8, frame: &SimFrame) -> Result<Vec<RxCompletion>, SimError> {
        let dest = self.dest.get(usize::from(ring)).ok_or(SimError::NoRing(ring))?;
        let needed = frame.buffers();
        let space = dest.space();
        if space < needed {
            return Err(SimError::RingFull {
                ring,
                needed,
                space,
            });
        }

        let completions = self.stage(pdev, frame)?;
        for completion in &completions {
            dest.post(*completion)?;
        }
        trace!(pdev, ring, len = frame.payload.len(), buffers = completions.len(), "Frame received");
        Ok(completions)
    }

    /// DMA `frame` into posted buffers of `pdev` without completing it
    ///
    /// The returned completions are handed to [`DeviceEmulator::inject`]
    /// by the caller, which controls when each buffer becomes visible.
    pub fn stage(&self, pdev: u8, frame: &SimFrame) -> Result<Vec<RxCompletion>, SimError> {
        let pool = self.pools.get(usize::from(pdev)).ok_or(SimError::NoPdev(pdev))?;
        let refill = self.refill.get(usize::from(pdev)).ok_or(SimError::NoPdev(pdev))?;

        let len = frame.payload.len();
        let pad = usize::from(frame.tlv.l3_hdr_padding);
        if !frame.raw && len + pad > RX_BUFFER_PAYLOAD {
            return Err(SimError::TooLong(len));
        }
        let needed = frame.buffers();
        let posted = refill.posted();
        if posted < needed {
            return Err(SimError::NoBuffers { needed, posted });
        }

        let tlv = RxTlv {
            msdu_len: len as u16,
            ..frame.tlv
        };
        let chunks: Vec<&[u8]> = if frame.raw && len > 0 {
            frame.payload.chunks(RX_BUFFER_PAYLOAD).collect()
        } else {
            vec![frame.payload.as_slice()]
        };
        let offset = if frame.raw { RX_PKT_TLVS_LEN } else { RX_PKT_TLVS_LEN + pad };

        let mut completions = Vec::with_capacity(needed);
        for (i, chunk) in chunks.iter().enumerate() {
            let Some(entry) = refill.take() else {
                return Err(SimError::NoBuffers { needed, posted: i });
            };
            pool.dma_write(entry.cookie, |mem| {
                tlv.write(&mut mem[..RX_PKT_TLVS_LEN]);
                mem[offset..offset + chunk.len()].copy_from_slice(chunk);
            })?;

            let last = i + 1 == chunks.len();
            completions.push(RxCompletion {
                status: ReoStatus::Ok,
                cookie: entry.cookie,
                mpdu: MpduDescInfo {
                    raw_ampdu: frame.raw,
                    fragment: frame.fragment,
                    peer_meta_data: u32::from(frame.peer_id),
                },
                msdu: MsduDescInfo {
                    first_msdu: i == 0 && frame.first_msdu,
                    continuation: !last,
                    last_msdu: last && frame.last_msdu,
                    da_is_mcbc: tlv.da_is_mcbc,
                    da_is_valid: tlv.da_is_valid,
                    sa_is_valid: tlv.sa_is_valid,
                    msdu_len: len as u16,
                },
                queue: frame.tid,
            });
        }
        Ok(completions)
    }

    /// Post an arbitrary completion, bypassing the refill ring
    pub fn inject(&self, ring: u8, completion: RxCompletion) -> Result<(), SimError> {
        let dest = self.dest.get(usize::from(ring)).ok_or(SimError::NoRing(ring))?;
        dest.post(completion)?;
        Ok(())
    }
}

/// Datapath on software rings driven by a [`DeviceEmulator`]
pub struct SoftDevice {
    pub datapath: RxDatapath,
    pub emulator: DeviceEmulator,
    rings: Vec<SoftDestRing>,
}

impl SoftDevice {
    /// Create the rings described by `config` and build the datapath
    ///
    /// `configure` supplies the collaborators on the builder.
    pub fn build<F>(config: RxConfig, configure: F) -> Result<Self, RxError>
    where
        F: FnOnce(RxDatapathBuilder) -> RxDatapathBuilder,
    {
        let mut builder = configure(RxDatapath::builder(config.clone()));
        let mut refill_hw = Vec::with_capacity(config.pdevs);
        for _ in 0..config.pdevs {
            let (ring, hw) = soft_refill_ring(config.refill_ring_entries);
            builder = builder.refill_ring(Box::new(ring));
            refill_hw.push(hw);
        }
        let datapath = builder.build()?;

        let (rings, dest_hw): (Vec<_>, Vec<_>) = (0..config.reo_rings)
            .map(|id| soft_dest_ring(id as u8, config.reo_ring_entries))
            .unzip();
        let emulator = DeviceEmulator::new(datapath.pools(), refill_hw, dest_hw);

        Ok(Self {
            datapath,
            emulator,
            rings,
        })
    }

    /// One processor per REO ring; empty after the first call
    pub fn take_processors(&mut self) -> Vec<RxProcessor> {
        self.rings
            .drain(..)
            .map(|ring| self.datapath.processor(Box::new(ring)))
            .collect()
    }

    /// The REO rings without processors, for callers that wrap them
    pub fn take_rings(&mut self) -> Vec<Box<dyn DestRing>> {
        self.rings
            .drain(..)
            .map(|ring| Box::new(ring) as Box<dyn DestRing>)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datapath::intrabss::tests::RecordingTx;
    use crate::datapath::peer::PeerTable;

    fn device() -> SoftDevice {
        let config = RxConfig {
            refill_ring_entries: 8,
            reo_ring_entries: 8,
            reo_rings: 2,
            ..Default::default()
        };
        SoftDevice::build(config, |b| {
            b.directory(Arc::new(PeerTable::new(16)))
                .tx_path(Arc::new(RecordingTx::default()))
        })
        .unwrap()
    }

    #[test]
    fn test_raw_frame_split_across_buffers() {
        let dev = device();
        let payload = vec![0xab; 2 * RX_BUFFER_PAYLOAD + 1];
        let posted = dev.emulator.buffers_posted(0);

        let completions = dev.emulator.receive(0, 1, &SimFrame::raw(4, payload)).unwrap();
        assert_eq!(completions.len(), 3);
        assert!(completions[0].msdu.first_msdu && completions[0].msdu.continuation);
        assert!(completions[1].msdu.continuation);
        assert!(completions[2].msdu.last_msdu && !completions[2].msdu.continuation);
        assert!(completions.iter().all(|c| c.mpdu.raw_ampdu && c.mpdu.peer_id() == 4));
        assert_eq!(dev.emulator.buffers_posted(0), posted - 3);
        assert_eq!(dev.emulator.pending(1), 3);
    }

    #[test]
    fn test_receive_checks_capacity_first() {
        let dev = device();
        let posted = dev.emulator.buffers_posted(0);
        let big = vec![0; (posted + 1) * RX_BUFFER_PAYLOAD];

        let err = dev.emulator.receive(0, 0, &SimFrame::raw(1, big)).unwrap_err();
        assert!(matches!(err, SimError::NoBuffers { .. }));
        assert_eq!(dev.emulator.buffers_posted(0), posted);

        let err = dev
            .emulator
            .receive(0, 0, &SimFrame::ethernet(1, vec![0; RX_BUFFER_PAYLOAD + 1]))
            .unwrap_err();
        assert!(matches!(err, SimError::TooLong(_)));
        assert!(matches!(
            dev.emulator.receive(0, 9, &SimFrame::ethernet(1, vec![0; 60])),
            Err(SimError::NoRing(9))
        ));
    }

    #[test]
    fn test_take_processors_once() {
        let mut dev = device();
        let processors = dev.take_processors();
        assert_eq!(
            processors.iter().map(RxProcessor::ring_id).collect::<Vec<_>>(),
            vec![0, 1]
        );
        assert!(dev.take_processors().is_empty());
    }
}
