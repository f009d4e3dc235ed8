use aya_ebpf::{
    helpers::{bpf_get_current_pid_tgid, bpf_ktime_get_ns, bpf_probe_read, gen::bpf_get_func_ip},
    macros::{classifier, kprobe, kretprobe, map},
    maps::{HashMap, RingBuf},
    programs::{ProbeContext, RetProbeContext, TcContext},
    EbpfContext,
};
use aya_log_ebpf::debug;
use flowtrace_ebpf_common::{
    FuncEvent, PacketEvent, SockOffsets, ANCHOR_ICMP_PUSH_REPLY, ANCHOR_IP6_RCV_CORE,
    ANCHOR_IPV6_LIST_RCV, ANCHOR_IPV6_RCV, ANCHOR_IP_LIST_RCV, ANCHOR_IP_RCV, ANCHOR_IP_RCV_CORE,
    ANCHOR_RAWV6_SENDMSG, ANCHOR_RAW_SENDMSG, ANCHOR_TCP_SENDMSG, ANCHOR_UDPV6_SENDMSG,
    ANCHOR_UDP_SENDMSG, DIRECTION_EGRESS, DIRECTION_INGRESS, PACKET_SNAP_LEN,
};

// Shared ring for every function event; a single ring preserves the global
// submission order the query engine relies on.
#[map(name = "EVENTS")]
static mut EVENTS: RingBuf = RingBuf::with_byte_size(4 * 1024 * 1024, 0);

#[map(name = "PACKET_EVENTS")]
static mut PACKET_EVENTS: RingBuf = RingBuf::with_byte_size(8 * 1024 * 1024, 0);

// Traced-function address -> stable func_id, filled from /proc/kallsyms at
// attach time. The same entry/exit program pair is attached to every
// discovered function; bpf_get_func_ip recovers which one fired.
#[map(name = "FUNC_IDS")]
static mut FUNC_IDS: HashMap<u64, u64> = HashMap::with_max_entries(32_768, 0);

// BTF-derived member offsets, written by the loader before load.
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
fn submit_identity(func_id: u64, is_ret: u64) {
    let Some(mut entry) = (unsafe { EVENTS.reserve::<FuncEvent>(0) }) else {
        return;
    };
    let mut ev = FuncEvent::zeroed();
    ev.pid = (bpf_get_current_pid_tgid() >> 32) as u32;
    ev.kernel_time = unsafe { bpf_ktime_get_ns() };
    ev.func_id = func_id;
    ev.is_ret = is_ret;
    entry.write(ev);
    entry.submit(0);
}

#[inline(always)]
fn submit_event(ev: FuncEvent) {
    let Some(mut entry) = (unsafe { EVENTS.reserve::<FuncEvent>(0) }) else {
        return;
    };
    entry.write(ev);
    entry.submit(0);
}

// =============================================================================
// Generic probes
// =============================================================================

#[kprobe]
pub fn func_enter(ctx: ProbeContext) -> u32 {
    let ip = unsafe { bpf_get_func_ip(ctx.as_ptr()) };
    match unsafe { FUNC_IDS.get(&ip) } {
        Some(id) => submit_identity(*id, 0),
        // Attached symbol missing from the id map; kallsyms drifted.
        None => debug!(&ctx, "no func id for ip {}", ip),
    }
    0
}

#[kretprobe]
pub fn func_exit(ctx: RetProbeContext) -> u32 {
    let ip = unsafe { bpf_get_func_ip(ctx.as_ptr()) };
    if let Some(id) = unsafe { FUNC_IDS.get(&ip) } {
        submit_identity(*id, 1);
    }
    0
}

// =============================================================================
// Transport send anchors: five-tuple from the `sock *` argument
// =============================================================================

#[inline(always)]
fn anchor_event_from_sock(func_id: u64, sk: *const u8) -> FuncEvent {
    let offs = load_offsets();
    let mut ev = FuncEvent::zeroed();
    ev.pid = (bpf_get_current_pid_tgid() >> 32) as u32;
    ev.kernel_time = unsafe { bpf_ktime_get_ns() };
    ev.func_id = func_id;
    ev.is_ret = 0;

    if sk.is_null() || offs.skc_family_offset == 0 {
        return ev;
    }
    let common = unsafe { sk.add(offs.sk_common_offset as usize) };

    // skc_dport is stored big-endian; skc_num is already host order.
    let dport: u16 = read_field(common, offs.skc_dport_offset).unwrap_or(0);
    ev.dport = u16::from_be(dport) as u64;
    let lport: u16 = read_field(common, offs.skc_num_offset).unwrap_or(0);
    ev.lport = lport as u64;

    let family: u16 = read_field(common, offs.skc_family_offset).unwrap_or(0);
    if family == AF_INET6 {
        ev.family = 6;
        if let Some(daddr) = read_field::<[u8; 16]>(common, offs.skc_v6_daddr_offset) {
            ev.daddr_v6 = daddr;
        }
        if let Some(saddr) = read_field::<[u8; 16]>(common, offs.skc_v6_rcv_saddr_offset) {
            ev.saddr_v6 = saddr;
        }
    } else {
        ev.family = 4;
        ev.daddr_v4 = read_field(common, offs.skc_daddr_offset).unwrap_or(0);
        ev.saddr_v4 = read_field(common, offs.skc_rcv_saddr_offset).unwrap_or(0);
    }
    ev
}

#[inline(always)]
fn sock_anchor_enter(ctx: &ProbeContext, func_id: u64) -> u32 {
    let sk: *const u8 = match ctx.arg(0) {
        Some(sk) => sk,
        None => return 0,
    };
    submit_event(anchor_event_from_sock(func_id, sk));
    0
}

#[kprobe(function = "icmp_push_reply")]
pub fn anchor_icmp_push_reply(ctx: ProbeContext) -> u32 {
    sock_anchor_enter(&ctx, ANCHOR_ICMP_PUSH_REPLY)
}

#[kretprobe(function = "icmp_push_reply")]
pub fn anchor_icmp_push_reply_ret(_ctx: RetProbeContext) -> u32 {
    submit_identity(ANCHOR_ICMP_PUSH_REPLY, 1);
    0
}

#[kprobe(function = "rawv6_sendmsg")]
pub fn anchor_rawv6_sendmsg(ctx: ProbeContext) -> u32 {
    sock_anchor_enter(&ctx, ANCHOR_RAWV6_SENDMSG)
}

#[kretprobe(function = "rawv6_sendmsg")]
pub fn anchor_rawv6_sendmsg_ret(_ctx: RetProbeContext) -> u32 {
    submit_identity(ANCHOR_RAWV6_SENDMSG, 1);
    0
}

#[kprobe(function = "raw_sendmsg")]
pub fn anchor_raw_sendmsg(ctx: ProbeContext) -> u32 {
    sock_anchor_enter(&ctx, ANCHOR_RAW_SENDMSG)
}

#[kretprobe(function = "raw_sendmsg")]
pub fn anchor_raw_sendmsg_ret(_ctx: RetProbeContext) -> u32 {
    submit_identity(ANCHOR_RAW_SENDMSG, 1);
    0
}

#[kprobe(function = "udp_sendmsg")]
pub fn anchor_udp_sendmsg(ctx: ProbeContext) -> u32 {
    sock_anchor_enter(&ctx, ANCHOR_UDP_SENDMSG)
}

#[kretprobe(function = "udp_sendmsg")]
pub fn anchor_udp_sendmsg_ret(_ctx: RetProbeContext) -> u32 {
    submit_identity(ANCHOR_UDP_SENDMSG, 1);
    0
}

#[kprobe(function = "udpv6_sendmsg")]
pub fn anchor_udpv6_sendmsg(ctx: ProbeContext) -> u32 {
    sock_anchor_enter(&ctx, ANCHOR_UDPV6_SENDMSG)
}

#[kretprobe(function = "udpv6_sendmsg")]
pub fn anchor_udpv6_sendmsg_ret(_ctx: RetProbeContext) -> u32 {
    submit_identity(ANCHOR_UDPV6_SENDMSG, 1);
    0
}

#[kprobe(function = "tcp_sendmsg")]
pub fn anchor_tcp_sendmsg(ctx: ProbeContext) -> u32 {
    sock_anchor_enter(&ctx, ANCHOR_TCP_SENDMSG)
}

#[kretprobe(function = "tcp_sendmsg")]
pub fn anchor_tcp_sendmsg_ret(_ctx: RetProbeContext) -> u32 {
    submit_identity(ANCHOR_TCP_SENDMSG, 1);
    0
}

// =============================================================================
// Receive anchors: five-tuple parsed out of the `sk_buff *` argument
// =============================================================================
//
// At ip_rcv_core / ip6_rcv_core, skb->data points at the L3 header, so the
// IPv4 L4 header starts at data + ihl*4 and the IPv6 one at data + 40.

#[inline(always)]
fn anchor_event_from_skb(func_id: u64, skb: *const u8) -> FuncEvent {
    let offs = load_offsets();
    let mut ev = FuncEvent::zeroed();
    ev.pid = (bpf_get_current_pid_tgid() >> 32) as u32;
    ev.kernel_time = unsafe { bpf_ktime_get_ns() };
    ev.func_id = func_id;
    ev.is_ret = 0;

    if skb.is_null() || offs.skb_data_offset == 0 {
        return ev;
    }
    let data: usize = match read_field(skb, offs.skb_data_offset) {
        Some(ptr) if ptr != 0 => ptr,
        _ => return ev,
    };
    let hdr: [u8; 64] = match unsafe { bpf_probe_read(data as *const [u8; 64]) } {
        Ok(hdr) => hdr,
        Err(_) => return ev,
    };

    let version = hdr[0] & 0xf0;
    if version == 0x40 {
        let ihl = ((hdr[0] & 0x0f) as usize) * 4;
        let proto = hdr[9];
        if (proto == 6 || proto == 17) && ihl >= 20 && ihl <= 60 {
            ev.family = 4;
            ev.saddr_v4 = u32::from_le_bytes([hdr[12], hdr[13], hdr[14], hdr[15]]);
            ev.daddr_v4 = u32::from_le_bytes([hdr[16], hdr[17], hdr[18], hdr[19]]);
            ev.lport = ((hdr[ihl] as u64) << 8) | hdr[ihl + 1] as u64;
            ev.dport = ((hdr[ihl + 2] as u64) << 8) | hdr[ihl + 3] as u64;
        }
    } else if version == 0x60 {
        let next = hdr[6];
        if next == 6 || next == 17 {
            ev.family = 6;
            let mut saddr = [0u8; 16];
            let mut daddr = [0u8; 16];
            saddr.copy_from_slice(&hdr[8..24]);
            daddr.copy_from_slice(&hdr[24..40]);
            ev.saddr_v6 = saddr;
            ev.daddr_v6 = daddr;
            ev.lport = ((hdr[40] as u64) << 8) | hdr[41] as u64;
            ev.dport = ((hdr[42] as u64) << 8) | hdr[43] as u64;
        }
    }
    ev
}

#[inline(always)]
fn skb_anchor_enter(ctx: &ProbeContext, func_id: u64) -> u32 {
    let skb: *const u8 = match ctx.arg(0) {
        Some(skb) => skb,
        None => return 0,
    };
    submit_event(anchor_event_from_skb(func_id, skb));
    0
}

#[kprobe(function = "ip_rcv_core")]
pub fn anchor_ip_rcv_core(ctx: ProbeContext) -> u32 {
    skb_anchor_enter(&ctx, ANCHOR_IP_RCV_CORE)
}

#[kretprobe(function = "ip_rcv_core")]
pub fn anchor_ip_rcv_core_ret(_ctx: RetProbeContext) -> u32 {
    submit_identity(ANCHOR_IP_RCV_CORE, 1);
    0
}

#[kprobe(function = "ip6_rcv_core")]
pub fn anchor_ip6_rcv_core(ctx: ProbeContext) -> u32 {
    skb_anchor_enter(&ctx, ANCHOR_IP6_RCV_CORE)
}

#[kretprobe(function = "ip6_rcv_core")]
pub fn anchor_ip6_rcv_core_ret(_ctx: RetProbeContext) -> u32 {
    submit_identity(ANCHOR_IP6_RCV_CORE, 1);
    0
}

// =============================================================================
// Link-layer anchors: identity only, bracket the receive traversal
// =============================================================================

#[kprobe(function = "ip_rcv")]
pub fn anchor_ip_rcv(_ctx: ProbeContext) -> u32 {
    submit_identity(ANCHOR_IP_RCV, 0);
    0
}

#[kretprobe(function = "ip_rcv")]
pub fn anchor_ip_rcv_ret(_ctx: RetProbeContext) -> u32 {
    submit_identity(ANCHOR_IP_RCV, 1);
    0
}

#[kprobe(function = "ipv6_rcv")]
pub fn anchor_ipv6_rcv(_ctx: ProbeContext) -> u32 {
    submit_identity(ANCHOR_IPV6_RCV, 0);
    0
}

#[kretprobe(function = "ipv6_rcv")]
pub fn anchor_ipv6_rcv_ret(_ctx: RetProbeContext) -> u32 {
    submit_identity(ANCHOR_IPV6_RCV, 1);
    0
}

#[kprobe(function = "ip_list_rcv")]
pub fn anchor_ip_list_rcv(_ctx: ProbeContext) -> u32 {
    submit_identity(ANCHOR_IP_LIST_RCV, 0);
    0
}

#[kretprobe(function = "ip_list_rcv")]
pub fn anchor_ip_list_rcv_ret(_ctx: RetProbeContext) -> u32 {
    submit_identity(ANCHOR_IP_LIST_RCV, 1);
    0
}

#[kprobe(function = "ipv6_list_rcv")]
pub fn anchor_ipv6_list_rcv(_ctx: ProbeContext) -> u32 {
    submit_identity(ANCHOR_IPV6_LIST_RCV, 0);
    0
}

#[kretprobe(function = "ipv6_list_rcv")]
pub fn anchor_ipv6_list_rcv_ret(_ctx: RetProbeContext) -> u32 {
    submit_identity(ANCHOR_IPV6_LIST_RCV, 1);
    0
}

// =============================================================================
// Data-plane classifiers
// =============================================================================

const TC_ACT_OK: i32 = 0;

#[inline(always)]
fn capture_frame(ctx: &TcContext, direction: u64) -> i32 {
    let Some(mut entry) = (unsafe { PACKET_EVENTS.reserve::<PacketEvent>(0) }) else {
        return TC_ACT_OK;
    };

    // Fill the slot in place; a PacketEvent is too large for the probe stack.
    let slot = entry.as_mut_ptr();
    unsafe {
        (*slot).timestamp = bpf_ktime_get_ns();
        (*slot).direction = direction;
        (*slot).payload_len = ctx.len() as u64;
        (*slot).payload = [0u8; PACKET_SNAP_LEN];
        let want = core::cmp::min(ctx.len() as usize, PACKET_SNAP_LEN);
        if want > 0 {
            let _ = ctx.load_bytes(0, &mut (*slot).payload[..want]);
        }
    }
    entry.submit(0);
    TC_ACT_OK
}

#[classifier]
pub fn tcx_ingress(ctx: TcContext) -> i32 {
    capture_frame(&ctx, DIRECTION_INGRESS)
}

#[classifier]
pub fn tcx_egress(ctx: TcContext) -> i32 {
    capture_frame(&ctx, DIRECTION_EGRESS)
}

#[cfg(all(not(test), target_arch = "bpf"))]
#[panic_handler]
fn panic(_: &core::panic::PanicInfo) -> ! {
    loop {}
}

#[link_section = "license"]
#[no_mangle]
static LICENSE: [u8; 4] = *b"GPL\0";
