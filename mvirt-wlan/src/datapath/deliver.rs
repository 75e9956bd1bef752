//! Delivery to the upper layer
//!
//! [`DeliverySink`] collects consecutive packets bound for the same vdev
//! and hands them over in one call. A vdev change, or the end of a second
//! pass, flushes the pending batch. Ownership of every buffer in a flushed
//! batch moves to the callback.

use std::sync::Arc;

use smoltcp::wire::EthernetAddress;
use tracing::{debug, trace};

use super::buffer::{PacketList, RxBuffer};
use super::dma::BufferAllocator;
use super::peer::{Peer, Vdev};
use super::tlv::DecapFormat;
use crate::stats::{DropReason, RxStats};

/// Upper-layer receive callback registered on a vdev
pub trait RxDeliver: Send + Sync {
    /// Take ownership of one ordered batch
    fn deliver(&self, vdev: &Vdev, packets: PacketList);

    /// Rewrite a raw or native-wifi batch in place before delivery
    fn decap(&self, _vdev: &Vdev, _packets: &mut PacketList, _peer_mac: EthernetAddress) {}
}

fn needs_decap(vdev: &Vdev) -> bool {
    matches!(vdev.rx_decap, DecapFormat::Raw | DecapFormat::NativeWifi)
}

/// Per-vdev batching in front of the delivery callback
pub struct DeliverySink {
    stats: Arc<RxStats>,
    alloc: Arc<dyn BufferAllocator>,
    vdev: Option<Arc<Vdev>>,
    peer_mac: EthernetAddress,
    pending: PacketList,
    flushes: usize,
}

impl DeliverySink {
    pub fn new(stats: Arc<RxStats>, alloc: Arc<dyn BufferAllocator>) -> Self {
        Self {
            stats,
            alloc,
            vdev: None,
            peer_mac: EthernetAddress([0; 6]),
            pending: PacketList::new(),
            flushes: 0,
        }
    }

    /// Make `vdev` the batch target, flushing a batch for another vdev
    pub fn switch_to(&mut self, vdev: &Arc<Vdev>) {
        let same = self.vdev.as_ref().is_some_and(|cur| Arc::ptr_eq(cur, vdev));
        if same {
            return;
        }
        self.flush();
        self.vdev = Some(Arc::clone(vdev));
    }

    /// Queue a packet for the current vdev
    ///
    /// `peer_mac` is the transmitter, passed to the decap hook on flush.
    pub fn enqueue(&mut self, buf: RxBuffer, peer_mac: EthernetAddress) {
        self.peer_mac = peer_mac;
        self.pending.push_back(buf);
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Hand the pending batch to the current vdev
    ///
    /// Returns the number of packets delivered.
    pub fn flush(&mut self) -> usize {
        if self.pending.is_empty() {
            return 0;
        }
        let packets = self.pending.take();
        let Some(vdev) = self.vdev.clone() else {
            // Nothing can be queued without a target
            self.drop_all(packets);
            return 0;
        };
        self.flushes += 1;
        deliver_to_stack(&vdev, self.peer_mac, packets, &self.stats, self.alloc.as_ref())
    }

    /// Number of non-empty flushes so far
    pub fn flushes(&self) -> usize {
        self.flushes
    }

    fn drop_all(&self, packets: PacketList) {
        for buf in packets {
            self.stats.drop_pkt(DropReason::InvalidVdev);
            self.stats.tid(buf.cb.tid).fail(DropReason::InvalidVdev);
            self.alloc.free(buf);
        }
    }
}

impl Drop for DeliverySink {
    fn drop(&mut self) {
        self.flush();
    }
}

/// Deliver one batch to `vdev`
///
/// Without a registered callback every packet is dropped as
/// [`DropReason::InvalidVdev`].
pub fn deliver_to_stack(
    vdev: &Vdev,
    peer_mac: EthernetAddress,
    mut packets: PacketList,
    stats: &RxStats,
    alloc: &dyn BufferAllocator,
) -> usize {
    let Some(rx) = vdev.rx_callback() else {
        debug!(vdev_id = vdev.id, count = packets.len(), "No rx callback, dropping batch");
        for buf in packets {
            stats.drop_pkt(DropReason::InvalidVdev);
            stats.tid(buf.cb.tid).fail(DropReason::InvalidVdev);
            alloc.free(buf);
        }
        return 0;
    };

    if needs_decap(vdev) {
        rx.decap(vdev, &mut packets, peer_mac);
    }

    let count = packets.len();
    for buf in packets.iter() {
        stats.delivered.record(buf.total_len());
        stats.tid(buf.cb.tid).delivered_to_stack.inc();
        vdev.stats.rx.record(buf.total_len());
    }

    trace!(vdev_id = vdev.id, count, "Delivering batch");
    rx.deliver(vdev, packets);
    count
}

/// Deliver raw-mode frames received from `peer`
///
/// Single-buffer frames lose their start/end markers, which the raw decap
/// hook reserves for aggregates.
pub fn deliver_raw(
    vdev: &Vdev,
    peer: &Peer,
    mut packets: PacketList,
    stats: &RxStats,
    alloc: &dyn BufferAllocator,
) -> usize {
    for buf in packets.iter_mut() {
        stats.raw_pkts.inc();
        vdev.stats.raw.inc();
        peer.stats.raw.record(buf.total_len());

        if buf.cb.chfrag_start && buf.cb.chfrag_end {
            buf.cb.chfrag_start = false;
            buf.cb.chfrag_end = false;
        }
    }

    let Some(rx) = vdev.rx_callback() else {
        for buf in packets {
            stats.drop_pkt(DropReason::InvalidVdev);
            alloc.free(buf);
        }
        return 0;
    };

    rx.decap(vdev, &mut packets, peer.mac);
    let count = packets.len();
    rx.deliver(vdev, packets);
    count
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::datapath::buffer::GroInfo;
    use crate::datapath::dma::HeapAllocator;
    use crate::datapath::peer::OpMode;
    use std::sync::Mutex;

    /// Callback recording every delivered batch
    #[derive(Default)]
    pub(crate) struct RecordingDeliver {
        pub batches: Mutex<Vec<Vec<Vec<u8>>>>,
        pub flags: Mutex<Vec<(bool, bool)>>,
        pub gro: Mutex<Vec<Option<GroInfo>>>,
        pub decaps: Mutex<Vec<EthernetAddress>>,
    }

    impl RecordingDeliver {
        pub fn batches(&self) -> Vec<Vec<Vec<u8>>> {
            self.batches.lock().unwrap().clone()
        }
    }

    impl RxDeliver for RecordingDeliver {
        fn deliver(&self, _vdev: &Vdev, packets: PacketList) {
            let mut flags = self.flags.lock().unwrap();
            let mut gro = self.gro.lock().unwrap();
            let batch = packets
                .into_iter()
                .map(|b| {
                    flags.push((b.cb.chfrag_start, b.cb.chfrag_end));
                    gro.push(b.cb.gro);
                    b.to_vec()
                })
                .collect();
            self.batches.lock().unwrap().push(batch);
        }

        fn decap(&self, _vdev: &Vdev, _packets: &mut PacketList, peer_mac: EthernetAddress) {
            self.decaps.lock().unwrap().push(peer_mac);
        }
    }

    fn mac(last: u8) -> EthernetAddress {
        EthernetAddress([0x02, 0, 0, 0, 0, last])
    }

    fn sink() -> (DeliverySink, Arc<RxStats>) {
        let stats = Arc::new(RxStats::new());
        let sink = DeliverySink::new(Arc::clone(&stats), Arc::new(HeapAllocator::new()));
        (sink, stats)
    }

    fn vdev_with_rx(id: u8) -> (Arc<Vdev>, Arc<RecordingDeliver>) {
        let vdev = Arc::new(Vdev::new(id, mac(id), OpMode::Ap));
        let rx = Arc::new(RecordingDeliver::default());
        vdev.register_rx(rx.clone());
        (vdev, rx)
    }

    #[test]
    fn test_same_vdev_batched_in_order() {
        let (mut sink, stats) = sink();
        let (vdev, rx) = vdev_with_rx(0);

        sink.switch_to(&vdev);
        sink.enqueue(RxBuffer::from_slice(b"first"), mac(9));
        sink.switch_to(&vdev);
        sink.enqueue(RxBuffer::from_slice(b"second"), mac(9));
        assert!(rx.batches().is_empty());

        assert_eq!(sink.flush(), 2);
        assert_eq!(rx.batches(), vec![vec![b"first".to_vec(), b"second".to_vec()]]);
        assert_eq!(stats.delivered.pkts.get(), 2);
        assert_eq!(vdev.stats.rx.bytes.get(), 11);
        assert!(rx.decaps.lock().unwrap().is_empty());
    }

    #[test]
    fn test_vdev_change_flushes() {
        let (mut sink, _stats) = sink();
        let (a, rx_a) = vdev_with_rx(0);
        let (b, rx_b) = vdev_with_rx(1);

        sink.switch_to(&a);
        sink.enqueue(RxBuffer::from_slice(b"a1"), mac(9));
        sink.switch_to(&b);
        assert_eq!(rx_a.batches().len(), 1);
        sink.enqueue(RxBuffer::from_slice(b"b1"), mac(9));
        drop(sink);
        assert_eq!(rx_b.batches(), vec![vec![b"b1".to_vec()]]);
    }

    #[test]
    fn test_missing_callback_drops_batch() {
        let (mut sink, stats) = sink();
        let vdev = Arc::new(Vdev::new(0, mac(1), OpMode::Ap));

        sink.switch_to(&vdev);
        let mut buf = RxBuffer::from_slice(b"lost");
        buf.cb.tid = 5;
        sink.enqueue(buf, mac(9));
        sink.enqueue(RxBuffer::from_slice(b"lost too"), mac(9));

        assert_eq!(sink.flush(), 0);
        assert_eq!(stats.drops(DropReason::InvalidVdev), 2);
        assert_eq!(stats.tid(5).fail_count(DropReason::InvalidVdev), 1);
        assert_eq!(stats.delivered.pkts.get(), 0);
    }

    #[test]
    fn test_raw_vdev_runs_decap_hook() {
        let (mut sink, _stats) = sink();
        let vdev = Arc::new(Vdev::new(0, mac(1), OpMode::Ap).with_decap(DecapFormat::Raw));
        let rx = Arc::new(RecordingDeliver::default());
        vdev.register_rx(rx.clone());

        sink.switch_to(&vdev);
        sink.enqueue(RxBuffer::from_slice(b"raw"), mac(7));
        sink.flush();

        assert_eq!(*rx.decaps.lock().unwrap(), vec![mac(7)]);
        assert_eq!(rx.batches().len(), 1);
    }

    #[test]
    fn test_deliver_raw_clears_single_buffer_markers() {
        let stats = RxStats::new();
        let (vdev, rx) = vdev_with_rx(0);
        let peer = Peer::new(3, mac(3));

        let mut single = RxBuffer::from_slice(b"one");
        single.cb.chfrag_start = true;
        single.cb.chfrag_end = true;
        let mut first = RxBuffer::from_slice(b"agg");
        first.cb.chfrag_start = true;
        let list: PacketList = [single, first].into_iter().collect();

        assert_eq!(deliver_raw(&vdev, &peer, list, &stats, &HeapAllocator::new()), 2);
        assert_eq!(*rx.flags.lock().unwrap(), vec![(false, false), (true, false)]);
        assert_eq!(*rx.decaps.lock().unwrap(), vec![mac(3)]);
        assert_eq!(stats.raw_pkts.get(), 2);
        assert_eq!(peer.stats.raw.pkts.get(), 2);
    }
}
