//! Receive TLV header
//!
//! Every receive buffer starts with a fixed-size TLV region that the device
//! writes together with the payload. It carries the per-MSDU attention,
//! MSDU-start/end and MPDU-start information the classifier needs. Layout
//! (little endian):
//!
//! | offset | size | field                                             |
//! |--------|------|---------------------------------------------------|
//! | 0      | 4    | attention flags (msdu_done, checksum, decrypted)  |
//! | 4      | 2    | msdu_end flags (da_mcbc, sa_valid, da_valid)      |
//! | 6      | 1    | L3 header padding                                 |
//! | 7      | 1    | decap format                                      |
//! | 8      | 2    | msdu length                                       |
//! | 10     | 2    | SA AST index                                      |
//! | 12     | 2    | DA AST index                                      |
//! | 14     | 2    | SA software peer id                               |
//! | 16     | 1    | mpdu flags (fr_ds, to_ds, ad4_valid, data)        |
//! | 17     | 1    | key id                                            |
//! | 18     | 1    | RSSI                                              |
//! | 19     | 1    | packet type                                       |
//! | 20     | 2    | channel frequency (MHz)                           |
//! | 22     | 6    | addr1 (receiver)                                  |
//! | 28     | 6    | addr2 (transmitter)                               |
//! | 34     | 1    | rate MCS                                          |
//! | 35     | 1    | NSS                                               |
//! | 36     | 1    | bandwidth                                         |
//! | 38     | 2    | classification engine metadata                    |

use smoltcp::wire::EthernetAddress;

/// Size of the TLV region at the head of every receive buffer
pub const RX_PKT_TLVS_LEN: usize = 128;

/// Receive buffer size handed to the device
pub const RX_BUFFER_SIZE: usize = 2048;

/// Headroom reserved in front of the TLV region
pub const RX_BUFFER_RESERVATION: usize = 0;

/// Start-of-data alignment for receive buffers
pub const RX_BUFFER_ALIGNMENT: usize = 4;

/// Payload bytes a single receive buffer can carry
pub const RX_BUFFER_PAYLOAD: usize = RX_BUFFER_SIZE - RX_PKT_TLVS_LEN;

const ATTN_MSDU_DONE: u32 = 1 << 0;
const ATTN_IP_CSUM_FAIL: u32 = 1 << 1;
const ATTN_L4_CSUM_FAIL: u32 = 1 << 2;
const ATTN_DECRYPTED: u32 = 1 << 3;

const END_DA_MCBC: u16 = 1 << 0;
const END_SA_VALID: u16 = 1 << 1;
const END_DA_VALID: u16 = 1 << 2;

const MPDU_FR_DS: u8 = 1 << 0;
const MPDU_TO_DS: u8 = 1 << 1;
const MPDU_AD4_VALID: u8 = 1 << 2;
const MPDU_IS_DATA: u8 = 1 << 3;

const OFFLOAD_TCP: u8 = 1 << 0;
const OFFLOAD_UDP: u8 = 1 << 1;
const OFFLOAD_IPV6: u8 = 1 << 2;
const OFFLOAD_LRO_ELIGIBLE: u8 = 1 << 3;
const OFFLOAD_TCP_PURE_ACK: u8 = 1 << 4;

/// Decapsulation format reported by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecapFormat {
    Raw,
    NativeWifi,
    #[default]
    Ethernet,
}

impl DecapFormat {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => DecapFormat::Raw,
            1 => DecapFormat::NativeWifi,
            _ => DecapFormat::Ethernet,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            DecapFormat::Raw => 0,
            DecapFormat::NativeWifi => 1,
            DecapFormat::Ethernet => 2,
        }
    }
}

/// Parsed copy of the TLV region of one receive buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxTlv {
    /// Written last by the device; absent means the DMA did not complete
    pub msdu_done: bool,
    pub ip_csum_fail: bool,
    pub l4_csum_fail: bool,
    pub decrypted: bool,
    pub da_is_mcbc: bool,
    pub sa_is_valid: bool,
    pub da_is_valid: bool,
    pub l3_hdr_padding: u8,
    pub decap: DecapFormat,
    pub msdu_len: u16,
    pub sa_idx: u16,
    pub da_idx: u16,
    pub sa_sw_peer_id: u16,
    pub fr_ds: bool,
    pub to_ds: bool,
    pub mac_addr_ad4_valid: bool,
    pub is_data: bool,
    pub key_id: u8,
    pub rssi: u8,
    pub pkt_type: u8,
    pub freq: u16,
    pub addr1: EthernetAddress,
    pub addr2: EthernetAddress,
    pub rate_mcs: u8,
    pub nss: u8,
    pub bw: u8,
    pub cce_metadata: u16,
    /// Receive offload hints, filled by the device for TCP and UDP
    pub tcp_proto: bool,
    pub udp_proto: bool,
    pub ipv6_proto: bool,
    pub lro_eligible: bool,
    pub tcp_pure_ack: bool,
    /// Offset of the L4 header from the start of the L3 header
    pub l4_offset: u16,
    /// Toeplitz flow hash
    pub flow_id: u32,
    pub tcp_seq: u32,
    pub tcp_ack: u32,
    pub tcp_win: u16,
    pub tcp_chksum: u16,
}

impl Default for RxTlv {
    fn default() -> Self {
        Self {
            msdu_done: true,
            ip_csum_fail: false,
            l4_csum_fail: false,
            decrypted: false,
            da_is_mcbc: false,
            sa_is_valid: false,
            da_is_valid: false,
            l3_hdr_padding: 0,
            decap: DecapFormat::Ethernet,
            msdu_len: 0,
            sa_idx: 0,
            da_idx: 0,
            sa_sw_peer_id: 0,
            fr_ds: false,
            to_ds: true,
            mac_addr_ad4_valid: false,
            is_data: true,
            key_id: 0,
            rssi: 0,
            pkt_type: 0,
            freq: 0,
            addr1: EthernetAddress([0; 6]),
            addr2: EthernetAddress([0; 6]),
            rate_mcs: 0,
            nss: 0,
            bw: 0,
            cce_metadata: 0,
            tcp_proto: false,
            udp_proto: false,
            ipv6_proto: false,
            lro_eligible: false,
            tcp_pure_ack: false,
            l4_offset: 0,
            flow_id: 0,
            tcp_seq: 0,
            tcp_ack: 0,
            tcp_win: 0,
            tcp_chksum: 0,
        }
    }
}

fn read_u16(data: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([data[off], data[off + 1]])
}

fn read_u32(data: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]])
}

fn read_mac(data: &[u8], off: usize) -> EthernetAddress {
    EthernetAddress::from_bytes(&data[off..off + 6])
}

impl RxTlv {
    /// Parse the TLV region at the start of `data`
    ///
    /// Returns `None` if `data` is shorter than [`RX_PKT_TLVS_LEN`].
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < RX_PKT_TLVS_LEN {
            return None;
        }

        let attn = read_u32(data, 0);
        let end = read_u16(data, 4);
        let mpdu = data[16];
        let offload = data[40];

        Some(Self {
            msdu_done: attn & ATTN_MSDU_DONE != 0,
            ip_csum_fail: attn & ATTN_IP_CSUM_FAIL != 0,
            l4_csum_fail: attn & ATTN_L4_CSUM_FAIL != 0,
            decrypted: attn & ATTN_DECRYPTED != 0,
            da_is_mcbc: end & END_DA_MCBC != 0,
            sa_is_valid: end & END_SA_VALID != 0,
            da_is_valid: end & END_DA_VALID != 0,
            l3_hdr_padding: data[6],
            decap: DecapFormat::from_u8(data[7]),
            msdu_len: read_u16(data, 8),
            sa_idx: read_u16(data, 10),
            da_idx: read_u16(data, 12),
            sa_sw_peer_id: read_u16(data, 14),
            fr_ds: mpdu & MPDU_FR_DS != 0,
            to_ds: mpdu & MPDU_TO_DS != 0,
            mac_addr_ad4_valid: mpdu & MPDU_AD4_VALID != 0,
            is_data: mpdu & MPDU_IS_DATA != 0,
            key_id: data[17],
            rssi: data[18],
            pkt_type: data[19],
            freq: read_u16(data, 20),
            addr1: read_mac(data, 22),
            addr2: read_mac(data, 28),
            rate_mcs: data[34],
            nss: data[35],
            bw: data[36],
            cce_metadata: read_u16(data, 38),
            tcp_proto: offload & OFFLOAD_TCP != 0,
            udp_proto: offload & OFFLOAD_UDP != 0,
            ipv6_proto: offload & OFFLOAD_IPV6 != 0,
            lro_eligible: offload & OFFLOAD_LRO_ELIGIBLE != 0,
            tcp_pure_ack: offload & OFFLOAD_TCP_PURE_ACK != 0,
            l4_offset: read_u16(data, 42),
            flow_id: read_u32(data, 44),
            tcp_seq: read_u32(data, 48),
            tcp_ack: read_u32(data, 52),
            tcp_win: read_u16(data, 56),
            tcp_chksum: read_u16(data, 58),
        })
    }

    /// Write this header into the first [`RX_PKT_TLVS_LEN`] bytes of `data`
    ///
    /// Panics if `data` is too short; only the device side writes TLVs.
    pub fn write(&self, data: &mut [u8]) {
        assert!(data.len() >= RX_PKT_TLVS_LEN, "buffer too small for rx tlv");
        data[..RX_PKT_TLVS_LEN].fill(0);

        let mut attn = 0u32;
        if self.msdu_done {
            attn |= ATTN_MSDU_DONE;
        }
        if self.ip_csum_fail {
            attn |= ATTN_IP_CSUM_FAIL;
        }
        if self.l4_csum_fail {
            attn |= ATTN_L4_CSUM_FAIL;
        }
        if self.decrypted {
            attn |= ATTN_DECRYPTED;
        }

        let mut end = 0u16;
        if self.da_is_mcbc {
            end |= END_DA_MCBC;
        }
        if self.sa_is_valid {
            end |= END_SA_VALID;
        }
        if self.da_is_valid {
            end |= END_DA_VALID;
        }

        let mut mpdu = 0u8;
        if self.fr_ds {
            mpdu |= MPDU_FR_DS;
        }
        if self.to_ds {
            mpdu |= MPDU_TO_DS;
        }
        if self.mac_addr_ad4_valid {
            mpdu |= MPDU_AD4_VALID;
        }
        if self.is_data {
            mpdu |= MPDU_IS_DATA;
        }

        let offload = [
            (self.tcp_proto, OFFLOAD_TCP),
            (self.udp_proto, OFFLOAD_UDP),
            (self.ipv6_proto, OFFLOAD_IPV6),
            (self.lro_eligible, OFFLOAD_LRO_ELIGIBLE),
            (self.tcp_pure_ack, OFFLOAD_TCP_PURE_ACK),
        ]
        .into_iter()
        .filter(|(set, _)| *set)
        .fold(0u8, |acc, (_, bit)| acc | bit);

        data[0..4].copy_from_slice(&attn.to_le_bytes());
        data[4..6].copy_from_slice(&end.to_le_bytes());
        data[6] = self.l3_hdr_padding;
        data[7] = self.decap.as_u8();
        data[8..10].copy_from_slice(&self.msdu_len.to_le_bytes());
        data[10..12].copy_from_slice(&self.sa_idx.to_le_bytes());
        data[12..14].copy_from_slice(&self.da_idx.to_le_bytes());
        data[14..16].copy_from_slice(&self.sa_sw_peer_id.to_le_bytes());
        data[16] = mpdu;
        data[17] = self.key_id;
        data[18] = self.rssi;
        data[19] = self.pkt_type;
        data[20..22].copy_from_slice(&self.freq.to_le_bytes());
        data[22..28].copy_from_slice(self.addr1.as_bytes());
        data[28..34].copy_from_slice(self.addr2.as_bytes());
        data[34] = self.rate_mcs;
        data[35] = self.nss;
        data[36] = self.bw;
        data[38..40].copy_from_slice(&self.cce_metadata.to_le_bytes());
        data[40] = offload;
        data[42..44].copy_from_slice(&self.l4_offset.to_le_bytes());
        data[44..48].copy_from_slice(&self.flow_id.to_le_bytes());
        data[48..52].copy_from_slice(&self.tcp_seq.to_le_bytes());
        data[52..56].copy_from_slice(&self.tcp_ack.to_le_bytes());
        data[56..58].copy_from_slice(&self.tcp_win.to_le_bytes());
        data[58..60].copy_from_slice(&self.tcp_chksum.to_le_bytes());
    }

    /// Frame carries three addresses (exactly one DS bit set)
    pub fn is_3addr(&self) -> bool {
        self.fr_ds ^ self.to_ds
    }

    /// Frame carries four addresses (both DS bits set)
    pub fn is_4addr(&self) -> bool {
        self.fr_ds && self.to_ds
    }

    /// Packed rate word: `mcs | nss << 8 | pkt_type << 16 | bw << 24`
    pub fn rate_phy(&self) -> u32 {
        u32::from(self.rate_mcs)
            | (u32::from(self.nss) << 8)
            | (u32::from(self.pkt_type) << 16)
            | (u32::from(self.bw) << 24)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_short_buffer() {
        assert!(RxTlv::parse(&[0u8; RX_PKT_TLVS_LEN - 1]).is_none());
    }

    #[test]
    fn test_write_then_parse_preserves_fields() {
        let tlv = RxTlv {
            msdu_done: true,
            l4_csum_fail: true,
            da_is_valid: true,
            l3_hdr_padding: 2,
            decap: DecapFormat::NativeWifi,
            msdu_len: 1500,
            da_idx: 17,
            fr_ds: true,
            to_ds: true,
            mac_addr_ad4_valid: true,
            addr2: EthernetAddress([0x02, 0, 0, 0, 0, 0x42]),
            rate_mcs: 7,
            nss: 2,
            bw: 3,
            tcp_proto: true,
            ipv6_proto: true,
            l4_offset: 40,
            flow_id: 0xdead_beef,
            tcp_seq: 1_000_001,
            tcp_win: 512,
            ..Default::default()
        };

        let mut buf = vec![0xaau8; RX_PKT_TLVS_LEN];
        tlv.write(&mut buf);
        let parsed = RxTlv::parse(&buf).unwrap();

        assert_eq!(parsed, tlv);
        assert!(parsed.is_4addr());
        assert!(!parsed.is_3addr());
        assert_eq!(parsed.rate_phy(), 7 | (2 << 8) | (3 << 24));
    }

    #[test]
    fn test_zeroed_region_has_no_msdu_done() {
        let tlv = RxTlv::parse(&[0u8; RX_PKT_TLVS_LEN]).unwrap();
        assert!(!tlv.msdu_done);
        assert_eq!(tlv.decap, DecapFormat::Raw);
    }
}
