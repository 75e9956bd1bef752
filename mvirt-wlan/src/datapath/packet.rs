//! Ethernet helpers for decapsulated frames
//!
//! After Ethernet decap the buffer data starts at the Ethernet header.
//! Classification only needs the destination address; the builders are used
//! by the emulator and tests to produce realistic payloads.

use smoltcp::wire::{
    ArpOperation, ArpPacket, ArpRepr, EthernetAddress, EthernetFrame, EthernetProtocol,
    EthernetRepr, Ipv4Address,
};

/// Parse an Ethernet frame
pub fn parse_ethernet(data: &[u8]) -> Option<EthernetFrame<&[u8]>> {
    EthernetFrame::new_checked(data).ok()
}

/// Destination address of a decapsulated frame
pub fn dst_addr(data: &[u8]) -> Option<EthernetAddress> {
    parse_ethernet(data).map(|frame| frame.dst_addr())
}

/// Whether the frame is addressed to the broadcast address
pub fn is_broadcast(data: &[u8]) -> bool {
    dst_addr(data).is_some_and(|addr| addr.is_broadcast())
}

/// Build an Ethernet frame
pub fn build_ethernet_frame(
    dst_mac: EthernetAddress,
    src_mac: EthernetAddress,
    ethertype: EthernetProtocol,
    payload: &[u8],
) -> Vec<u8> {
    let repr = EthernetRepr {
        src_addr: src_mac,
        dst_addr: dst_mac,
        ethertype,
    };

    let mut buffer = vec![0u8; repr.buffer_len() + payload.len()];
    let mut frame = EthernetFrame::new_unchecked(&mut buffer);
    repr.emit(&mut frame);
    frame.payload_mut().copy_from_slice(payload);
    buffer
}

/// Build a broadcast ARP who-has frame
pub fn build_arp_request_frame(
    sender_mac: EthernetAddress,
    sender_ip: Ipv4Address,
    target_ip: Ipv4Address,
) -> Vec<u8> {
    let repr = ArpRepr::EthernetIpv4 {
        operation: ArpOperation::Request,
        source_hardware_addr: sender_mac,
        source_protocol_addr: sender_ip,
        target_hardware_addr: EthernetAddress([0; 6]),
        target_protocol_addr: target_ip,
    };

    let mut arp = vec![0u8; repr.buffer_len()];
    let mut packet = ArpPacket::new_unchecked(&mut arp);
    repr.emit(&mut packet);

    build_ethernet_frame(
        EthernetAddress::BROADCAST,
        sender_mac,
        EthernetProtocol::Arp,
        &arp,
    )
}

/// Build a unicast IPv4 frame with an opaque payload
pub fn build_unicast_frame(
    dst_mac: EthernetAddress,
    src_mac: EthernetAddress,
    payload: &[u8],
) -> Vec<u8> {
    build_ethernet_frame(dst_mac, src_mac, EthernetProtocol::Ipv4, payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    const STA_MAC: EthernetAddress = EthernetAddress([0x02, 0x00, 0x00, 0x00, 0x00, 0x0a]);

    #[test]
    fn test_arp_request_is_broadcast() {
        let frame = build_arp_request_frame(
            STA_MAC,
            Ipv4Address::new(192, 168, 1, 10),
            Ipv4Address::new(192, 168, 1, 1),
        );
        assert!(is_broadcast(&frame));

        let eth = parse_ethernet(&frame).unwrap();
        assert_eq!(eth.src_addr(), STA_MAC);
        assert_eq!(eth.ethertype(), EthernetProtocol::Arp);

        let arp = ArpPacket::new_checked(eth.payload()).unwrap();
        match ArpRepr::parse(&arp).unwrap() {
            ArpRepr::EthernetIpv4 {
                operation,
                target_protocol_addr,
                ..
            } => {
                assert_eq!(operation, ArpOperation::Request);
                assert_eq!(target_protocol_addr, Ipv4Address::new(192, 168, 1, 1));
            }
            _ => panic!("Expected EthernetIpv4 ARP"),
        }
    }

    #[test]
    fn test_unicast_frame() {
        let dst = EthernetAddress([0x02, 0, 0, 0, 0, 0x0b]);
        let frame = build_unicast_frame(dst, STA_MAC, b"payload");
        assert!(!is_broadcast(&frame));
        assert_eq!(dst_addr(&frame), Some(dst));
    }

    #[test]
    fn test_short_frame() {
        assert!(parse_ethernet(&[0u8; 10]).is_none());
        assert!(!is_broadcast(&[0xff; 10]));
    }
}
