use std::net::IpAddr;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

/// The flow scope set by the query layer; the tracer filter matches on
/// addresses and ports, forward or reverse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FiveTuple {
    pub srcip: IpAddr,
    pub dstip: IpAddr,
    pub sport: u16,
    pub dport: u16,
}

/// Process-wide filter state shared by both ring-buffer consumers.
///
/// The HTTP handler is the only writer; the consumers only read, so a
/// read-mostly lock plus word-sized atomics keeps changes visible with at
/// most one event of lag.
pub struct FilterState {
    filter: RwLock<Option<FiveTuple>>,
    g_status: AtomicI64,
    clear_func: AtomicBool,
    clear_packet: AtomicBool,
}

impl FilterState {
    pub fn new() -> Self {
        Self {
            filter: RwLock::new(None),
            g_status: AtomicI64::new(0),
            clear_func: AtomicBool::new(false),
            clear_packet: AtomicBool::new(false),
        }
    }

    /// Install a filter. Resets `g_status` so a stale in-traversal count
    /// from the previous flow cannot leak persistence decisions.
    pub fn set(&self, tuple: FiveTuple) {
        if let Ok(mut slot) = self.filter.write() {
            *slot = Some(tuple);
        }
        self.g_status.store(0, Ordering::Relaxed);
    }

    /// Restore the empty (admit-all) sentinel.
    pub fn clear(&self) {
        if let Ok(mut slot) = self.filter.write() {
            *slot = None;
        }
        self.g_status.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Option<FiveTuple> {
        self.filter.read().ok().and_then(|slot| *slot)
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_none()
    }

    pub fn g_status(&self) -> i64 {
        self.g_status.load(Ordering::Relaxed)
    }

    pub fn inc_status(&self) {
        self.g_status.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement, saturating at zero.
    pub fn dec_status(&self) {
        let _ = self
            .g_status
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                if v > 0 { Some(v - 1) } else { None }
            });
    }

    pub fn raise_clear_flags(&self) {
        self.clear_func.store(true, Ordering::Relaxed);
        self.clear_packet.store(true, Ordering::Relaxed);
    }

    /// Consume the function-store clear flag.
    pub fn take_clear_func(&self) -> bool {
        self.clear_func.swap(false, Ordering::Relaxed)
    }

    /// Consume the packet-store clear flag.
    pub fn take_clear_packet(&self) -> bool {
        self.clear_packet.swap(false, Ordering::Relaxed)
    }
}

impl Default for FilterState {
    fn default() -> Self {
        Self::new()
    }
}

/// Forward-or-reverse match, addresses and ports judged independently, the
/// way the kernel-side consumer admits anchor events.
pub fn matches_flow(
    filter: &FiveTuple,
    srcip: IpAddr,
    dstip: IpAddr,
    sport: u16,
    dport: u16,
) -> bool {
    let ip_ok = (srcip == filter.srcip && dstip == filter.dstip)
        || (srcip == filter.dstip && dstip == filter.srcip);
    let port_ok = (sport == filter.sport && dport == filter.dport)
        || (sport == filter.dport && dport == filter.sport);
    ip_ok && port_ok
}
