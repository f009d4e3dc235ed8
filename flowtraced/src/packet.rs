use std::net::{Ipv4Addr, Ipv6Addr};

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_IPV6: u16 = 0x86dd;

/// Header fields pulled from a captured frame, shaped for the per-family
/// packet tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedPacket {
    V4 {
        srcip: Ipv4Addr,
        dstip: Ipv4Addr,
        sport: u16,
        dport: u16,
        prot: u8,
        ipid: u16,
        ttl: u8,
        /// Flags + fragment offset bytes, hex.
        frag: String,
        /// IPv4 options past the fixed header, hex.
        options: String,
    },
    V6 {
        srcip: Ipv6Addr,
        dstip: Ipv6Addr,
        /// Next-header value (6, 17 or 58).
        header: u8,
        sport: u16,
        dport: u16,
    },
    /// Non-IP, unknown L4, or too short to carry the headers it claims.
    Other,
}

/// Parse an Ethernet frame the way the data-plane consumer stores it:
/// IPv4 TCP/UDP/ICMP and IPv6 TCP/UDP/ICMPv6 rows keep their header fields,
/// everything else degrades to `Other`.
pub fn parse_frame(payload: &[u8]) -> ParsedPacket {
    if payload.len() < 34 {
        return ParsedPacket::Other;
    }
    let ethertype = u16::from_be_bytes([payload[12], payload[13]]);
    match ethertype {
        ETHERTYPE_IPV4 => parse_ipv4(&payload[14..]),
        ETHERTYPE_IPV6 => parse_ipv6(&payload[14..]),
        _ => ParsedPacket::Other,
    }
}

fn parse_ipv4(l3: &[u8]) -> ParsedPacket {
    if l3.len() < 20 || l3[0] & 0xf0 != 0x40 {
        return ParsedPacket::Other;
    }
    let header_len = ((l3[0] & 0x0f) as usize) * 4;
    if header_len < 20 || l3.len() < header_len {
        return ParsedPacket::Other;
    }
    let prot = l3[9];
    let srcip = Ipv4Addr::new(l3[12], l3[13], l3[14], l3[15]);
    let dstip = Ipv4Addr::new(l3[16], l3[17], l3[18], l3[19]);
    let ipid = u16::from_be_bytes([l3[4], l3[5]]);
    let ttl = l3[8];
    let frag = to_hex(&l3[6..8]);
    let options = to_hex(&l3[20..header_len]);

    let (sport, dport) = match prot {
        6 | 17 => {
            if l3.len() < header_len + 4 {
                return ParsedPacket::Other;
            }
            (
                u16::from_be_bytes([l3[header_len], l3[header_len + 1]]),
                u16::from_be_bytes([l3[header_len + 2], l3[header_len + 3]]),
            )
        }
        1 => (0, 0),
        _ => return ParsedPacket::Other,
    };

    ParsedPacket::V4 {
        srcip,
        dstip,
        sport,
        dport,
        prot,
        ipid,
        ttl,
        frag,
        options,
    }
}

fn parse_ipv6(l3: &[u8]) -> ParsedPacket {
    if l3.len() < 40 || l3[0] & 0xf0 != 0x60 {
        return ParsedPacket::Other;
    }
    let header = l3[6];
    let srcip = ipv6_from_raw(slice16(&l3[8..24]));
    let dstip = ipv6_from_raw(slice16(&l3[24..40]));

    let (sport, dport) = match header {
        6 | 17 => {
            if l3.len() < 44 {
                return ParsedPacket::Other;
            }
            (
                u16::from_be_bytes([l3[40], l3[41]]),
                u16::from_be_bytes([l3[42], l3[43]]),
            )
        }
        58 => (0, 0),
        _ => return ParsedPacket::Other,
    };

    ParsedPacket::V6 {
        srcip,
        dstip,
        header,
        sport,
        dport,
    }
}

fn slice16(s: &[u8]) -> [u8; 16] {
    let mut out = [0u8; 16];
    out.copy_from_slice(s);
    out
}

/// The probe reads the address as a native u32 straight out of the header,
/// so the octets sit in wire order in memory.
pub fn ipv4_from_raw(raw: u32) -> Ipv4Addr {
    Ipv4Addr::from(raw.to_ne_bytes())
}

pub fn ipv6_from_raw(raw: [u8; 16]) -> Ipv6Addr {
    Ipv6Addr::from(raw)
}

pub fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eth(ethertype: u16, l3: &[u8]) -> Vec<u8> {
        let mut frame = vec![0u8; 12];
        frame.extend_from_slice(&ethertype.to_be_bytes());
        frame.extend_from_slice(l3);
        frame
    }

    fn ipv4_header(prot: u8, src: [u8; 4], dst: [u8; 4]) -> Vec<u8> {
        let mut hdr = vec![0u8; 20];
        hdr[0] = 0x45;
        hdr[4] = 0xab;
        hdr[5] = 0xcd;
        hdr[6] = 0x40; // don't-fragment
        hdr[8] = 64; // ttl
        hdr[9] = prot;
        hdr[12..16].copy_from_slice(&src);
        hdr[16..20].copy_from_slice(&dst);
        hdr
    }

    #[test]
    fn parses_ipv4_tcp() {
        let mut l3 = ipv4_header(6, [127, 0, 0, 1], [127, 0, 0, 1]);
        l3.extend_from_slice(&45290u16.to_be_bytes());
        l3.extend_from_slice(&43483u16.to_be_bytes());
        let frame = eth(ETHERTYPE_IPV4, &l3);

        match parse_frame(&frame) {
            ParsedPacket::V4 {
                srcip,
                dstip,
                sport,
                dport,
                prot,
                ipid,
                ttl,
                frag,
                options,
            } => {
                assert_eq!(srcip, Ipv4Addr::LOCALHOST);
                assert_eq!(dstip, Ipv4Addr::LOCALHOST);
                assert_eq!(sport, 45290);
                assert_eq!(dport, 43483);
                assert_eq!(prot, 6);
                assert_eq!(ipid, 0xabcd);
                assert_eq!(ttl, 64);
                assert_eq!(frag, "4000");
                assert_eq!(options, "");
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn icmp_rows_use_zero_ports() {
        let l3 = ipv4_header(1, [8, 8, 8, 8], [1, 1, 1, 1]);
        let frame = eth(ETHERTYPE_IPV4, &l3);
        match parse_frame(&frame) {
            ParsedPacket::V4 {
                sport, dport, prot, ..
            } => {
                assert_eq!((sport, dport, prot), (0, 0, 1));
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn parses_ipv6_udp() {
        let mut l3 = vec![0u8; 40];
        l3[0] = 0x60;
        l3[6] = 17;
        l3[8..24].copy_from_slice(&Ipv6Addr::LOCALHOST.octets());
        l3[24..40].copy_from_slice(&Ipv6Addr::LOCALHOST.octets());
        l3.extend_from_slice(&53u16.to_be_bytes());
        l3.extend_from_slice(&8053u16.to_be_bytes());
        let frame = eth(ETHERTYPE_IPV6, &l3);

        match parse_frame(&frame) {
            ParsedPacket::V6 {
                srcip,
                dstip,
                header,
                sport,
                dport,
            } => {
                assert_eq!(srcip, Ipv6Addr::LOCALHOST);
                assert_eq!(dstip, Ipv6Addr::LOCALHOST);
                assert_eq!(header, 17);
                assert_eq!(sport, 53);
                assert_eq!(dport, 8053);
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn non_ip_and_unknown_l4_are_other() {
        let arp = eth(0x0806, &[0u8; 28]);
        assert_eq!(parse_frame(&arp), ParsedPacket::Other);

        let gre = eth(ETHERTYPE_IPV4, &ipv4_header(47, [1, 2, 3, 4], [5, 6, 7, 8]));
        assert_eq!(parse_frame(&gre), ParsedPacket::Other);

        assert_eq!(parse_frame(&[0u8; 10]), ParsedPacket::Other);
    }

    #[test]
    fn raw_address_helpers_keep_wire_order() {
        let raw = u32::from_ne_bytes([10, 0, 0, 42]);
        assert_eq!(ipv4_from_raw(raw), Ipv4Addr::new(10, 0, 0, 42));
    }
}
