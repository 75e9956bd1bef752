//! Receive datapath
//!
//! Architecture:
//! - One descriptor pool and refill ring per radio ([`pdev`])
//! - One [`RxProcessor`] per REO destination ring, each on its own worker
//!   thread
//! - A service call drains completions ([`servicer`]), then classifies,
//!   forwards and delivers the batch ([`classify`])
//! - Peers and vdevs come from a [`PeerDirectory`]; every packet holds a
//!   lease on its peer for as long as it is processed

pub mod buffer;
pub mod classify;
pub mod deliver;
pub mod desc_pool;
pub mod dma;
pub mod intrabss;
pub mod packet;
pub mod pdev;
pub mod peer;
pub mod policy;
pub mod process;
pub mod reassembly;
pub mod replenish;
pub mod ring;
pub mod servicer;
pub mod tlv;
pub mod worker;

pub use buffer::{ChecksumHint, GroInfo, MeshRxInfo, PacketList, RxBuffer, RxCb};
pub use classify::{Classifier, ClassifyReport, NoHooks, RxHooks};
pub use deliver::{DeliverySink, RxDeliver, deliver_raw, deliver_to_stack};
pub use desc_pool::{Cookie, DescFault, DescList, DescPool, PoolError};
pub use dma::{BufferAllocator, DmaAddr, DmaDirection, DmaError, HeapAllocator};
pub use intrabss::{Forward, IntraBssForwarder, TxPath};
pub use pdev::{RX_BUF_OWNER, RxPdev};
pub use peer::{
    AstEntry, AstType, MeshRxFilter, OpMode, Peer, PeerDirectory, PeerId, PeerLease, PeerTable,
    Vdev, VdevId, WdsPolicy,
};
pub use policy::RxStrategy;
pub use process::{ProcessReport, RxDatapath, RxDatapathBuilder, RxProcessor};
pub use reassembly::sg_create;
pub use replenish::{ReplenishReport, Replenisher};
pub use ring::{
    DestRing, DestRingProducer, MpduDescInfo, MsduDescInfo, RefillEntry, RefillRing,
    RefillRingConsumer, ReoStatus, RingError, RxCompletion, soft_dest_ring, soft_refill_ring,
};
pub use servicer::{ReapOutcome, RingServicer, ServiceState};
pub use tlv::{DecapFormat, RX_BUFFER_PAYLOAD, RX_BUFFER_SIZE, RX_PKT_TLVS_LEN, RxTlv};
pub use worker::{WorkerEvent, WorkerHandle, spawn_rx_worker};
