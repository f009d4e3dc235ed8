//! Layer-boundary probes for the live latency/frequency analyser.
//!
//! Loaded once per analyser stream; the stream writes its five-tuple into the
//! single-slot filter maps before attaching. Every matching packet crossing a
//! layer boundary emits one LayerStamp; pairing and rate math happen in user
//! space because the stream is already scoped to a single flow.

#![cfg_attr(all(target_arch = "bpf", not(test)), no_std)]
#![cfg_attr(all(target_arch = "bpf", not(test)), no_main)]
#![allow(static_mut_refs)]
#![allow(static_mut_refs)]

#[cfg(target_arch = "bpf")]
mod latency_program {

    use aya_ebpf::{
        helpers::{bpf_get_current_comm, bpf_get_current_pid_tgid, bpf_ktime_get_ns, bpf_probe_read},
        macros::{kprobe, map},
        maps::{Array, RingBuf},
        programs::ProbeContext,
    };
    use flowtrace_ebpf_common::{
        FlowKeyV4, FlowKeyV6, LayerStamp, SockOffsets, layer, stamp_kind, STAMP_RX, STAMP_TX,
    };

    #[map(name = "FILTER_V4")]
    static mut FILTER_V4: Array<FlowKeyV4> = Array::with_max_entries(1, 0);

    #[map(name = "FILTER_V6")]
    static mut FILTER_V6: Array<FlowKeyV6> = Array::with_max_entries(1, 0);

    #[map(name = "STAMPS")]
    static mut STAMPS: RingBuf = RingBuf::with_byte_size(1024 * 1024, 0);

    #[no_mangle]
    static mut SOCK_OFFSETS: SockOffsets = SockOffsets::zeroed();

    const AF_INET6: u16 = 10;

    fn load_offsets() -> SockOffsets {
        unsafe { core::ptr::read_volatile(&SOCK_OFFSETS) }
    }

    fn read_field<T: Copy>(base: *const u8, offset: u32) -> Option<T> {
        if base.is_null() {
            return None;
        }
        let ptr = unsafe { base.add(offset as usize) as *const T };
        unsafe { bpf_probe_read(ptr).ok() }
    }

    #[inline(always)]
    fn emit(layer: u8, direction: u8, family: u8, kind: u8) {
        let Some(mut entry) = (unsafe { STAMPS.reserve::<LayerStamp>(0) }) else {
            return;
        };
        let mut stamp = LayerStamp::zeroed();
        stamp.ts_ns = unsafe { bpf_ktime_get_ns() };
        stamp.pid = (bpf_get_current_pid_tgid() >> 32) as u32;
        stamp.layer = layer;
        stamp.direction = direction;
        stamp.family = family;
        stamp.kind = kind;
        stamp.comm = bpf_get_current_comm().unwrap_or([0u8; 16]);
        entry.write(stamp);
        entry.submit(0);
    }

    /// Match a sock against the filter. The sock view is direction-agnostic:
    /// skc_rcv_saddr/skc_num are the local (outbound-source) side.
    #[inline(always)]
    fn match_sock(sk: *const u8) -> Option<u8> {
        let offs = load_offsets();
        if sk.is_null() || offs.skc_family_offset == 0 {
            return None;
        }
        let common = unsafe { sk.add(offs.sk_common_offset as usize) };
        let family: u16 = read_field(common, offs.skc_family_offset)?;
        let lport: u16 = read_field(common, offs.skc_num_offset)?;
        let dport_raw: u16 = read_field(common, offs.skc_dport_offset)?;
        let dport = u16::from_be(dport_raw);

        if family == AF_INET6 {
            let filter = unsafe { FILTER_V6.get(0) }?;
            if filter.enabled == 0 {
                return None;
            }
            let daddr: [u8; 16] = read_field(common, offs.skc_v6_daddr_offset)?;
            let saddr: [u8; 16] = read_field(common, offs.skc_v6_rcv_saddr_offset)?;
            let f_s = addr16_to_words(&saddr);
            let f_d = addr16_to_words(&daddr);
            if f_s == filter.saddr
                && f_d == filter.daddr
                && lport == filter.sport
                && dport == filter.dport
            {
                return Some(6);
            }
            None
        } else {
            let filter = unsafe { FILTER_V4.get(0) }?;
            if filter.enabled == 0 {
                return None;
            }
            let daddr: u32 = read_field(common, offs.skc_daddr_offset)?;
            let saddr: u32 = read_field(common, offs.skc_rcv_saddr_offset)?;
            if saddr == filter.saddr
                && daddr == filter.daddr
                && lport == filter.sport
                && dport == filter.dport
            {
                return Some(4);
            }
            None
        }
    }

    #[inline(always)]
    fn addr16_to_words(addr: &[u8; 16]) -> [u32; 4] {
        let mut words = [0u32; 4];
        let mut i = 0;
        while i < 4 {
            words[i] = u32::from_ne_bytes([
                addr[i * 4],
                addr[i * 4 + 1],
                addr[i * 4 + 2],
                addr[i * 4 + 3],
            ]);
            i += 1;
        }
        words
    }

    /// Parse the L3/L4 headers of an skb through head + network_header and
    /// compare against the filter. `reverse` flips the tuple for the receive
    /// path so streams always key by the outbound perspective.
    #[inline(always)]
    fn match_skb(skb: *const u8, reverse: bool) -> Option<u8> {
        let offs = load_offsets();
        if skb.is_null() || offs.skb_head_offset == 0 {
            return None;
        }
        let head: usize = read_field(skb, offs.skb_head_offset)?;
        if head == 0 {
            return None;
        }
        let net_off: u16 = read_field(skb, offs.skb_network_header_offset)?;
        let l3 = (head + net_off as usize) as *const u8;
        let hdr: [u8; 64] = unsafe { bpf_probe_read(l3 as *const [u8; 64]).ok()? };

        let version = hdr[0] & 0xf0;
        if version == 0x40 {
            let filter = unsafe { FILTER_V4.get(0) }?;
            if filter.enabled == 0 {
                return None;
            }
            let proto = hdr[9];
            if proto != filter.protocol {
                return None;
            }
            let saddr = u32::from_ne_bytes([hdr[12], hdr[13], hdr[14], hdr[15]]);
            let daddr = u32::from_ne_bytes([hdr[16], hdr[17], hdr[18], hdr[19]]);
            let ihl = ((hdr[0] & 0x0f) as usize) * 4;
            if ihl < 20 || ihl > 60 {
                return None;
            }
            let sport = ((hdr[ihl] as u16) << 8) | hdr[ihl + 1] as u16;
            let dport = ((hdr[ihl + 2] as u16) << 8) | hdr[ihl + 3] as u16;
            let matched = if reverse {
                saddr == filter.daddr
                    && daddr == filter.saddr
                    && sport == filter.dport
                    && dport == filter.sport
            } else {
                saddr == filter.saddr
                    && daddr == filter.daddr
                    && sport == filter.sport
                    && dport == filter.dport
            };
            if matched {
                return Some(4);
            }
            None
        } else if version == 0x60 {
            let filter = unsafe { FILTER_V6.get(0) }?;
            if filter.enabled == 0 {
                return None;
            }
            let next = hdr[6];
            if next != filter.protocol {
                return None;
            }
            let mut saddr = [0u8; 16];
            let mut daddr = [0u8; 16];
            saddr.copy_from_slice(&hdr[8..24]);
            daddr.copy_from_slice(&hdr[24..40]);
            let s = addr16_to_words(&saddr);
            let d = addr16_to_words(&daddr);
            let sport = ((hdr[40] as u16) << 8) | hdr[41] as u16;
            let dport = ((hdr[42] as u16) << 8) | hdr[43] as u16;
            let matched = if reverse {
                s == filter.daddr && d == filter.saddr && sport == filter.dport && dport == filter.sport
            } else {
                s == filter.saddr && d == filter.daddr && sport == filter.sport && dport == filter.dport
            };
            if matched {
                return Some(6);
            }
            None
        } else {
            None
        }
    }

    // Transport boundary: inet_sendmsg / inet6_sendmsg / inet_recvmsg /
    // inet6_recvmsg all take `struct socket *` as their first argument.

    #[inline(always)]
    fn sock_from_socket(ctx: &ProbeContext) -> Option<*const u8> {
        let offs = load_offsets();
        let socket: *const u8 = ctx.arg(0)?;
        if socket.is_null() || offs.socket_sk_offset == 0 {
            return None;
        }
        let sk: usize = read_field(socket, offs.socket_sk_offset)?;
        if sk == 0 {
            None
        } else {
            Some(sk as *const u8)
        }
    }

    #[kprobe]
    pub fn trace_trans_tx(ctx: ProbeContext) -> u32 {
        if let Some(sk) = sock_from_socket(&ctx) {
            if let Some(family) = match_sock(sk) {
                emit(layer::TRANSPORT, STAMP_TX, family, stamp_kind::CROSSING);
            }
        }
        0
    }

    #[kprobe]
    pub fn trace_trans_rx(ctx: ProbeContext) -> u32 {
        if let Some(sk) = sock_from_socket(&ctx) {
            if let Some(family) = match_sock(sk) {
                emit(layer::TRANSPORT, STAMP_RX, family, stamp_kind::CROSSING);
            }
        }
        0
    }

    // Network boundary: ip_finish_output(net, sock, skb) on the way out,
    // ip_local_deliver(skb) / ip6_input(skb) on the way in.

    #[kprobe]
    pub fn trace_net_tx(ctx: ProbeContext) -> u32 {
        let skb: *const u8 = match ctx.arg(2) {
            Some(skb) => skb,
            None => return 0,
        };
        if let Some(family) = match_skb(skb, false) {
            emit(layer::NETWORK, STAMP_TX, family, stamp_kind::CROSSING);
        }
        0
    }

    #[kprobe]
    pub fn trace_net_rx(ctx: ProbeContext) -> u32 {
        let skb: *const u8 = match ctx.arg(0) {
            Some(skb) => skb,
            None => return 0,
        };
        if let Some(family) = match_skb(skb, true) {
            emit(layer::NETWORK, STAMP_RX, family, stamp_kind::CROSSING);
        }
        0
    }

    // Link boundary: dev_queue_xmit(skb) / __netif_receive_skb(skb).

    #[kprobe]
    pub fn trace_link_tx(ctx: ProbeContext) -> u32 {
        let skb: *const u8 = match ctx.arg(0) {
            Some(skb) => skb,
            None => return 0,
        };
        if let Some(family) = match_skb(skb, false) {
            emit(layer::LINK, STAMP_TX, family, stamp_kind::CROSSING);
        }
        0
    }

    #[kprobe]
    pub fn trace_link_rx(ctx: ProbeContext) -> u32 {
        let skb: *const u8 = match ctx.arg(0) {
            Some(skb) => skb,
            None => return 0,
        };
        if let Some(family) = match_skb(skb, true) {
            emit(layer::LINK, STAMP_RX, family, stamp_kind::CROSSING);
        }
        0
    }

    // Drops: kfree_skb_reason(skb, reason), with tcp_drop(sk, skb) as the
    // pre-5.17 fallback; user space picks whichever symbol attaches.

    #[kprobe]
    pub fn trace_skb_drop(ctx: ProbeContext) -> u32 {
        let skb: *const u8 = match ctx.arg(0) {
            Some(skb) => skb,
            None => return 0,
        };
        let family = match match_skb(skb, false) {
            Some(f) => Some(f),
            None => match_skb(skb, true),
        };
        if let Some(family) = family {
            emit(layer::NETWORK, STAMP_RX, family, stamp_kind::DROP);
        }
        0
    }

    #[kprobe]
    pub fn trace_sock_drop(ctx: ProbeContext) -> u32 {
        let skb: *const u8 = match ctx.arg(1) {
            Some(skb) => skb,
            None => return 0,
        };
        let family = match match_skb(skb, false) {
            Some(f) => Some(f),
            None => match_skb(skb, true),
        };
        if let Some(family) = family {
            emit(layer::NETWORK, STAMP_RX, family, stamp_kind::DROP);
        }
        0
    }

    #[cfg(not(test))]
    #[panic_handler]
    fn panic(_: &core::panic::PanicInfo) -> ! {
        loop {}
    }

    #[link_section = "license"]
    #[no_mangle]
    static LICENSE: [u8; 4] = *b"GPL\0";
}

#[cfg(not(target_arch = "bpf"))]
fn main() {}
