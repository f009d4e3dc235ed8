//! Consumer for the function-event ring buffer.
//!
//! A dedicated blocking thread drains the ring, applies the persistence
//! policy, and hands row batches to an async flusher that commits once per
//! second and runs the clear pass when the flag is up.

use crate::filter::{FilterState, matches_flow};
use crate::metrics::Metrics;
use crate::packet::{ipv4_from_raw, ipv6_from_raw};
use crate::store::{FuncRow, FunctionStore, SpecRow};
use aya::maps::{MapData, ring_buf::RingBuf};
use flowtrace_ebpf_common::{ANCHOR_ID_MIN, FuncEvent, LINK_ANCHOR_ID_MIN};
use log::warn;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

pub struct FuncBatch {
    pub calls: Vec<FuncRow>,
    pub spec: Vec<SpecRow>,
}

/// Per-thread consumer state. Event times are rebased onto the wall clock:
/// the first kernel timestamp observed maps to `attach_time`.
pub struct FuncEventProcessor {
    attach_time: f64,
    start: u64,
    /// Anchor entries that incremented g_status, keyed by (func_id, pid);
    /// the matching exit pops and decrements.
    in_flight: HashSet<(u64, u32)>,
}

pub enum Disposition {
    /// Plain function row only.
    Call(FuncRow),
    /// Anchor row mirrored into both tables.
    Anchor(FuncRow, SpecRow),
    /// Outside a matching traversal with a filter set.
    Dropped,
}

impl FuncEventProcessor {
    pub fn new(attach_time: f64) -> Self {
        Self {
            attach_time,
            start: 0,
            in_flight: HashSet::new(),
        }
    }

    fn event_time(&mut self, kernel_time: u64) -> f64 {
        if self.start == 0 {
            self.start = kernel_time;
        }
        self.attach_time + (kernel_time.saturating_sub(self.start)) as f64 / 1e9
    }

    pub fn process(&mut self, ev: &FuncEvent, filter: &FilterState) -> Disposition {
        let time = self.event_time(ev.kernel_time);
        let row = FuncRow {
            time,
            is_ret: ev.is_ret as i64,
            id: ev.func_id as i64,
            pid: ev.pid as i64,
        };

        if ev.func_id >= ANCHOR_ID_MIN && ev.is_ret == 0 {
            if ev.func_id >= LINK_ANCHOR_ID_MIN {
                // Link anchors carry identity only; persisted unconditionally
                // so the receive join can always find its bracket.
                return Disposition::Anchor(row, empty_spec(time, ev));
            }
            if ev.lport > 65535 || ev.dport > 65535 {
                return Disposition::Call(row);
            }
            let (srcip, dstip) = match ev.family {
                4 => (
                    IpAddr::from(ipv4_from_raw(ev.saddr_v4)),
                    IpAddr::from(ipv4_from_raw(ev.daddr_v4)),
                ),
                6 => (
                    IpAddr::from(ipv6_from_raw(ev.saddr_v6)),
                    IpAddr::from(ipv6_from_raw(ev.daddr_v6)),
                ),
                // The anchor could not parse a tuple from its argument.
                _ => return Disposition::Call(row),
            };
            if let Some(tuple) = filter.snapshot() {
                if matches_flow(&tuple, srcip, dstip, ev.lport as u16, ev.dport as u16) {
                    filter.inc_status();
                    self.in_flight.insert((ev.func_id, ev.pid));
                }
            }
            let spec = SpecRow {
                time,
                is_ret: 0,
                id: ev.func_id as i64,
                pid: ev.pid as i64,
                family: ev.family as i64,
                srcport: ev.lport as i64,
                dstport: ev.dport as i64,
                srcip: srcip.to_string(),
                dstip: dstip.to_string(),
                pkt: String::new(),
            };
            return Disposition::Anchor(row, spec);
        }

        if ev.func_id >= ANCHOR_ID_MIN && ev.is_ret == 1 {
            if ev.func_id < LINK_ANCHOR_ID_MIN && self.in_flight.remove(&(ev.func_id, ev.pid)) {
                filter.dec_status();
            }
            return Disposition::Call(row);
        }

        // Generic events persist only inside a matching traversal, or
        // unconditionally when no filter is set.
        if filter.g_status() > 0 || filter.is_empty() {
            Disposition::Call(row)
        } else {
            Disposition::Dropped
        }
    }
}

fn empty_spec(time: f64, ev: &FuncEvent) -> SpecRow {
    SpecRow {
        time,
        is_ret: 0,
        id: ev.func_id as i64,
        pid: ev.pid as i64,
        family: 0,
        srcport: 0,
        dstport: 0,
        srcip: String::new(),
        dstip: String::new(),
        pkt: String::new(),
    }
}

fn epoch_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

pub fn start_func_listener(
    mut ring: RingBuf<MapData>,
    store: Arc<FunctionStore>,
    filter: Arc<FilterState>,
    metrics: Arc<Metrics>,
    commit_interval: Duration,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<FuncBatch>();

    // Drain thread: ring -> rows. Never blocks on the store.
    {
        let filter = Arc::clone(&filter);
        let metrics = Arc::clone(&metrics);
        tokio::task::spawn_blocking(move || {
            let mut processor = FuncEventProcessor::new(epoch_secs());
            let mut calls: Vec<FuncRow> = Vec::new();
            let mut spec: Vec<SpecRow> = Vec::new();
            let mut last_send = Instant::now();
            loop {
                if let Some(item) = ring.next() {
                    if let Some(ev) = parse_func_event(item.as_ref()) {
                        metrics.record_func_event();
                        match processor.process(&ev, &filter) {
                            Disposition::Call(row) => calls.push(row),
                            Disposition::Anchor(row, spec_row) => {
                                calls.push(row);
                                spec.push(spec_row);
                            }
                            Disposition::Dropped => {}
                        }
                    } else {
                        metrics.inc_rb_overflow();
                    }
                } else {
                    std::thread::sleep(Duration::from_millis(1));
                }

                if last_send.elapsed() >= commit_interval {
                    last_send = Instant::now();
                    let batch = FuncBatch {
                        calls: std::mem::take(&mut calls),
                        spec: std::mem::take(&mut spec),
                    };
                    if tx.send(batch).is_err() {
                        return;
                    }
                }
            }
        });
    }

    // Flusher: one transaction per tick, then the clear pass if requested.
    tokio::spawn(async move {
        while let Some(batch) = rx.recv().await {
            if let Err(err) = store.insert_batch(&batch.calls, &batch.spec).await {
                warn!("[flowtraced] function store write failed: {err}");
                metrics.inc_store_error();
            }
            if filter.take_clear_func() {
                if let Err(err) = store.truncate_before(epoch_secs()).await {
                    warn!("[flowtraced] function store truncate failed: {err}");
                    metrics.inc_store_error();
                }
            }
        }
    });
}

fn parse_func_event(bytes: &[u8]) -> Option<FuncEvent> {
    if bytes.len() < std::mem::size_of::<FuncEvent>() {
        return None;
    }
    let ptr = bytes.as_ptr() as *const FuncEvent;
    Some(unsafe { std::ptr::read_unaligned(ptr) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FiveTuple;
    use flowtrace_ebpf_common::{
        ANCHOR_IP_RCV, ANCHOR_TCP_SENDMSG, ANCHOR_UDP_SENDMSG,
    };

    fn v4_anchor(func_id: u64, pid: u32, kernel_time: u64) -> FuncEvent {
        let mut ev = FuncEvent::zeroed();
        ev.pid = pid;
        ev.kernel_time = kernel_time;
        ev.func_id = func_id;
        ev.family = 4;
        ev.lport = 45290;
        ev.dport = 43483;
        ev.saddr_v4 = u32::from_ne_bytes([127, 0, 0, 1]);
        ev.daddr_v4 = u32::from_ne_bytes([127, 0, 0, 1]);
        ev
    }

    fn generic(func_id: u64, pid: u32, kernel_time: u64, is_ret: u64) -> FuncEvent {
        let mut ev = FuncEvent::zeroed();
        ev.pid = pid;
        ev.kernel_time = kernel_time;
        ev.func_id = func_id;
        ev.is_ret = is_ret;
        ev
    }

    fn loopback_filter() -> FiveTuple {
        FiveTuple {
            srcip: "127.0.0.1".parse().unwrap(),
            dstip: "127.0.0.1".parse().unwrap(),
            sport: 45290,
            dport: 43483,
        }
    }

    #[test]
    fn matching_anchor_pair_drives_g_status() {
        let filter = FilterState::new();
        filter.set(loopback_filter());
        let mut proc = FuncEventProcessor::new(100.0);

        let entry = proc.process(&v4_anchor(ANCHOR_TCP_SENDMSG, 7, 1_000), &filter);
        assert!(matches!(entry, Disposition::Anchor(_, _)));
        assert_eq!(filter.g_status(), 1);

        let exit = proc.process(&generic(ANCHOR_TCP_SENDMSG, 7, 2_000, 1), &filter);
        assert!(matches!(exit, Disposition::Call(_)));
        assert_eq!(filter.g_status(), 0);

        // An unmatched exit never pushes it negative.
        proc.process(&generic(ANCHOR_TCP_SENDMSG, 7, 3_000, 1), &filter);
        assert_eq!(filter.g_status(), 0);
    }

    #[test]
    fn generics_persist_only_inside_matching_traversal() {
        let filter = FilterState::new();
        filter.set(loopback_filter());
        let mut proc = FuncEventProcessor::new(100.0);

        // Outside any traversal: dropped.
        assert!(matches!(
            proc.process(&generic(42, 7, 500, 0), &filter),
            Disposition::Dropped
        ));

        proc.process(&v4_anchor(ANCHOR_TCP_SENDMSG, 7, 1_000), &filter);
        assert!(matches!(
            proc.process(&generic(42, 7, 1_500, 0), &filter),
            Disposition::Call(_)
        ));

        proc.process(&generic(ANCHOR_TCP_SENDMSG, 7, 2_000, 1), &filter);
        assert!(matches!(
            proc.process(&generic(42, 7, 2_500, 0), &filter),
            Disposition::Dropped
        ));
    }

    #[test]
    fn empty_filter_admits_everything() {
        let filter = FilterState::new();
        let mut proc = FuncEventProcessor::new(100.0);
        assert!(matches!(
            proc.process(&generic(42, 7, 500, 0), &filter),
            Disposition::Call(_)
        ));
    }

    #[test]
    fn non_matching_anchor_still_lands_in_both_tables() {
        let filter = FilterState::new();
        filter.set(FiveTuple {
            srcip: "8.8.8.8".parse().unwrap(),
            dstip: "8.8.4.4".parse().unwrap(),
            sport: 1,
            dport: 2,
        });
        let mut proc = FuncEventProcessor::new(100.0);

        match proc.process(&v4_anchor(ANCHOR_UDP_SENDMSG, 7, 1_000), &filter) {
            Disposition::Anchor(row, spec) => {
                assert_eq!(row.id, ANCHOR_UDP_SENDMSG as i64);
                assert_eq!(spec.srcip, "127.0.0.1");
                assert_eq!(spec.srcport, 45290);
            }
            other => panic!("anchor not persisted: {other:?}"),
        }
        assert_eq!(filter.g_status(), 0);
    }

    #[test]
    fn link_anchor_rows_carry_empty_tuple() {
        let filter = FilterState::new();
        let mut proc = FuncEventProcessor::new(100.0);
        match proc.process(&generic(ANCHOR_IP_RCV, 9, 1_000, 0), &filter) {
            Disposition::Anchor(_, spec) => {
                assert_eq!(spec.family, 0);
                assert_eq!(spec.srcip, "");
            }
            other => panic!("link anchor not persisted: {other:?}"),
        }
    }

    #[test]
    fn out_of_range_port_degrades_to_plain_row() {
        let filter = FilterState::new();
        let mut proc = FuncEventProcessor::new(100.0);
        let mut ev = v4_anchor(ANCHOR_TCP_SENDMSG, 7, 1_000);
        ev.lport = 70_000;
        assert!(matches!(proc.process(&ev, &filter), Disposition::Call(_)));
    }

    #[test]
    fn event_times_rebase_onto_attach_time() {
        let filter = FilterState::new();
        let mut proc = FuncEventProcessor::new(100.0);
        let first = proc.process(&generic(42, 7, 5_000_000_000, 0), &filter);
        let second = proc.process(&generic(42, 7, 6_000_000_000, 0), &filter);
        match (first, second) {
            (Disposition::Call(a), Disposition::Call(b)) => {
                assert_eq!(a.time, 100.0);
                assert!((b.time - 101.0).abs() < 1e-9);
            }
            other => panic!("unexpected dispositions: {other:?}"),
        }
    }

    impl std::fmt::Debug for Disposition {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                Disposition::Call(_) => write!(f, "Call"),
                Disposition::Anchor(_, _) => write!(f, "Anchor"),
                Disposition::Dropped => write!(f, "Dropped"),
            }
        }
    }
}
