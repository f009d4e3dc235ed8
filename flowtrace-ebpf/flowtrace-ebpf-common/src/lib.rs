#![cfg_attr(all(feature = "bpf", not(feature = "user")), no_std)]

#[cfg(test)]
use core::mem::size_of;

use bytemuck::{Pod, Zeroable};

// =============================================================================
// Function-trace event stream
// =============================================================================
//
// Every probe fired in the kernel submits one FuncEvent into the shared
// `EVENTS` ring buffer. Generic entry/exit probes fill only the identity
// fields; anchor entry probes additionally carry the five-tuple recovered
// from their `sock *` / `sk_buff *` argument. Keeping a single ring for all
// function events preserves global submission order.

/// Anchor id for `ip_rcv_core` (IPv4 receive, carries the five-tuple).
pub const ANCHOR_IP_RCV_CORE: u64 = 200_000;
/// Anchor id for `ip6_rcv_core`.
pub const ANCHOR_IP6_RCV_CORE: u64 = 200_001;
/// Anchor id for `icmp_push_reply`.
pub const ANCHOR_ICMP_PUSH_REPLY: u64 = 200_002;
/// Anchor id for `rawv6_sendmsg`.
pub const ANCHOR_RAWV6_SENDMSG: u64 = 200_003;
/// Anchor id for `raw_sendmsg`.
pub const ANCHOR_RAW_SENDMSG: u64 = 200_004;
/// Anchor id for `udp_sendmsg`.
pub const ANCHOR_UDP_SENDMSG: u64 = 200_005;
/// Anchor id for `udpv6_sendmsg`.
pub const ANCHOR_UDPV6_SENDMSG: u64 = 200_006;
/// Anchor id for `tcp_sendmsg`.
pub const ANCHOR_TCP_SENDMSG: u64 = 200_007;
/// First link-layer anchor id (`ip_rcv`).
pub const ANCHOR_IP_RCV: u64 = 300_000;
/// `ipv6_rcv`.
pub const ANCHOR_IPV6_RCV: u64 = 300_001;
/// `ip_list_rcv`.
pub const ANCHOR_IP_LIST_RCV: u64 = 300_002;
/// `ipv6_list_rcv`.
pub const ANCHOR_IPV6_LIST_RCV: u64 = 300_003;

/// Lowest id of the anchor ranges. Everything below is a dynamically
/// discovered function id taken from the kernel BTF dump.
pub const ANCHOR_ID_MIN: u64 = 200_000;
/// Lowest id of the link-layer (identity-only) anchor range.
pub const LINK_ANCHOR_ID_MIN: u64 = 300_000;

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
#[cfg_attr(
    all(feature = "user", not(target_os = "none")),
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct FuncEvent {
    pub pid: u32,
    pub _pad: u32,
    /// bpf_ktime_get_ns at submission.
    pub kernel_time: u64,
    pub func_id: u64,
    /// 0 = entry, 1 = exit.
    pub is_ret: u64,
    /// 0 for generic events, 4 or 6 on anchor entries that parsed a tuple.
    pub family: u64,
    /// Remote port, host byte order.
    pub dport: u64,
    /// Local port, host byte order.
    pub lport: u64,
    pub saddr_v4: u32,
    pub daddr_v4: u32,
    pub saddr_v6: [u8; 16],
    pub daddr_v6: [u8; 16],
}

impl FuncEvent {
    pub const fn zeroed() -> Self {
        Self {
            pid: 0,
            _pad: 0,
            kernel_time: 0,
            func_id: 0,
            is_ret: 0,
            family: 0,
            dport: 0,
            lport: 0,
            saddr_v4: 0,
            daddr_v4: 0,
            saddr_v6: [0; 16],
            daddr_v6: [0; 16],
        }
    }

    pub fn is_anchor(&self) -> bool {
        self.func_id >= ANCHOR_ID_MIN
    }

    pub fn is_link_anchor(&self) -> bool {
        self.func_id >= LINK_ANCHOR_ID_MIN
    }
}

// =============================================================================
// Data-plane capture stream
// =============================================================================

/// Bytes of each frame copied out by the tc classifiers. Enough for the
/// Ethernet header, the largest IPv4 header with options, and the L4 header.
pub const PACKET_SNAP_LEN: usize = 256;

pub const DIRECTION_INGRESS: u64 = 0;
pub const DIRECTION_EGRESS: u64 = 1;

#[repr(C)]
#[derive(Copy, Clone)]
pub struct PacketEvent {
    /// bpf_ktime_get_ns at capture.
    pub timestamp: u64,
    /// DIRECTION_INGRESS or DIRECTION_EGRESS.
    pub direction: u64,
    /// Full frame length on the wire; the payload below holds min(len, snap).
    pub payload_len: u64,
    pub payload: [u8; PACKET_SNAP_LEN],
}

unsafe impl Zeroable for PacketEvent {}
unsafe impl Pod for PacketEvent {}

impl PacketEvent {
    pub const fn zeroed() -> Self {
        Self {
            timestamp: 0,
            direction: 0,
            payload_len: 0,
            payload: [0; PACKET_SNAP_LEN],
        }
    }

    /// The captured slice of the frame.
    pub fn captured(&self) -> &[u8] {
        let len = core::cmp::min(self.payload_len as usize, PACKET_SNAP_LEN);
        &self.payload[..len]
    }
}

// =============================================================================
// Live analyser stamps
// =============================================================================
//
// The latency object emits one LayerStamp per filtered packet per layer
// boundary it crosses. User space pairs stamps across layers (the stream is
// already scoped to one five-tuple) and derives cross-layer latency,
// per-layer rates and the drop rate.

pub mod layer {
    pub const LINK: u8 = 0;
    pub const NETWORK: u8 = 1;
    pub const TRANSPORT: u8 = 2;
}

pub mod stamp_kind {
    pub const CROSSING: u8 = 0;
    pub const DROP: u8 = 1;
}

pub const STAMP_TX: u8 = 0;
pub const STAMP_RX: u8 = 1;

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct LayerStamp {
    pub ts_ns: u64,
    pub pid: u32,
    /// layer::LINK / NETWORK / TRANSPORT.
    pub layer: u8,
    /// STAMP_TX or STAMP_RX.
    pub direction: u8,
    /// 4 or 6.
    pub family: u8,
    /// stamp_kind::CROSSING or stamp_kind::DROP.
    pub kind: u8,
    pub comm: [u8; 16],
}

impl LayerStamp {
    pub const fn zeroed() -> Self {
        Self {
            ts_ns: 0,
            pid: 0,
            layer: 0,
            direction: 0,
            family: 0,
            kind: 0,
            comm: [0; 16],
        }
    }
}

// =============================================================================
// Analyser five-tuple filter
// =============================================================================
//
// Single-slot array maps written by user space before the stream starts.
// Addresses are stored as the raw octet sequence reinterpreted as native
// u32 words (what a direct header read yields); ports are host order.

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct FlowKeyV4 {
    pub saddr: u32,
    pub daddr: u32,
    pub sport: u16,
    pub dport: u16,
    pub protocol: u8,
    pub enabled: u8,
    pub _pad: [u8; 2],
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct FlowKeyV6 {
    pub saddr: [u32; 4],
    pub daddr: [u32; 4],
    pub sport: u16,
    pub dport: u16,
    pub protocol: u8,
    pub enabled: u8,
    pub _pad: [u8; 2],
}

impl FlowKeyV4 {
    pub const fn zeroed() -> Self {
        Self {
            saddr: 0,
            daddr: 0,
            sport: 0,
            dport: 0,
            protocol: 0,
            enabled: 0,
            _pad: [0; 2],
        }
    }
}

impl FlowKeyV6 {
    pub const fn zeroed() -> Self {
        Self {
            saddr: [0; 4],
            daddr: [0; 4],
            sport: 0,
            dport: 0,
            protocol: 0,
            enabled: 0,
            _pad: [0; 2],
        }
    }
}

// =============================================================================
// Runtime offset discovery
// =============================================================================
//
// Offsets into `sock_common` and `sk_buff` vary by kernel. User space derives
// them from kernel BTF at startup and writes this struct into the object's
// .bss with `EbpfLoader::set_global`; probe code reads fields through these
// offsets with bpf_probe_read. A zero offset means "not resolved" and the
// probe degrades to an identity-only event.

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
#[cfg_attr(
    all(feature = "user", not(target_os = "none")),
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct SockOffsets {
    // struct sock: __sk_common base, then sock_common members relative to it
    pub sk_common_offset: u32,
    pub skc_family_offset: u32,
    pub skc_daddr_offset: u32,
    pub skc_rcv_saddr_offset: u32,
    pub skc_dport_offset: u32,
    pub skc_num_offset: u32,
    pub skc_v6_daddr_offset: u32,
    pub skc_v6_rcv_saddr_offset: u32,

    // struct sk_buff
    pub skb_data_offset: u32,
    pub skb_head_offset: u32,
    pub skb_len_offset: u32,
    pub skb_network_header_offset: u32,
    pub skb_transport_header_offset: u32,

    // struct socket (latency hooks receive `struct socket *`)
    pub socket_sk_offset: u32,

    pub _pad: [u32; 2],
}

impl SockOffsets {
    pub const fn zeroed() -> Self {
        Self {
            sk_common_offset: 0,
            skc_family_offset: 0,
            skc_daddr_offset: 0,
            skc_rcv_saddr_offset: 0,
            skc_dport_offset: 0,
            skc_num_offset: 0,
            skc_v6_daddr_offset: 0,
            skc_v6_rcv_saddr_offset: 0,
            skb_data_offset: 0,
            skb_head_offset: 0,
            skb_len_offset: 0,
            skb_network_header_offset: 0,
            skb_transport_header_offset: 0,
            socket_sk_offset: 0,
            _pad: [0; 2],
        }
    }
}

pub const AF_INET: u16 = 2;
pub const AF_INET6: u16 = 10;

pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;
pub const IPPROTO_ICMPV6: u8 = 58;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn func_event_layout_is_stable() {
        // pid+pad (8) + 6 u64 (48) + 2 u32 (8) + 2 * 16 bytes
        assert_eq!(size_of::<FuncEvent>(), 8 + 48 + 8 + 32);
    }

    #[test]
    fn packet_event_holds_snap() {
        assert_eq!(size_of::<PacketEvent>(), 24 + PACKET_SNAP_LEN);
        let mut ev = PacketEvent::zeroed();
        ev.payload_len = 4;
        assert_eq!(ev.captured().len(), 4);
        ev.payload_len = (PACKET_SNAP_LEN + 100) as u64;
        assert_eq!(ev.captured().len(), PACKET_SNAP_LEN);
    }

    #[test]
    fn anchor_ranges_are_disjoint() {
        let ev = FuncEvent {
            func_id: ANCHOR_TCP_SENDMSG,
            ..FuncEvent::zeroed()
        };
        assert!(ev.is_anchor());
        assert!(!ev.is_link_anchor());

        let link = FuncEvent {
            func_id: ANCHOR_IP_LIST_RCV,
            ..FuncEvent::zeroed()
        };
        assert!(link.is_anchor());
        assert!(link.is_link_anchor());
    }

    #[test]
    fn sock_offsets_serialize() {
        let offs = SockOffsets::zeroed();
        let json = serde_json::to_string(&offs).unwrap();
        assert!(json.contains("skc_dport_offset"));
    }
}
