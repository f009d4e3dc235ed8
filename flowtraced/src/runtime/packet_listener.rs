//! Consumer for the data-plane capture ring.
//!
//! Same drain-thread / flusher split as the function listener. Frames are
//! parsed down to their header fields here; the kernel side only copies
//! bytes.

use crate::filter::{FilterState, FiveTuple, matches_flow};
use crate::metrics::Metrics;
use crate::packet::{ParsedPacket, parse_frame, to_hex};
use crate::store::{OtherPacketRow, PacketStore, V4PacketRow, V6PacketRow};
use aya::maps::{MapData, ring_buf::RingBuf};
use flowtrace_ebpf_common::PacketEvent;
use log::warn;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

pub struct PacketBatch {
    pub v4: Vec<V4PacketRow>,
    pub v6: Vec<V6PacketRow>,
    pub other: Vec<OtherPacketRow>,
}

pub enum PacketRowKind {
    V4(V4PacketRow),
    V6(V6PacketRow),
    Other(OtherPacketRow),
    Filtered,
}

/// Should this parsed packet survive the filter? Port-less protocols (ICMP)
/// are judged on addresses alone.
pub fn admits(filter: Option<&FiveTuple>, parsed: &ParsedPacket) -> bool {
    let Some(filter) = filter else {
        return true;
    };
    match parsed {
        ParsedPacket::V4 {
            srcip,
            dstip,
            sport,
            dport,
            prot,
            ..
        } => {
            let src = IpAddr::from(*srcip);
            let dst = IpAddr::from(*dstip);
            if *prot == 1 {
                ip_pair_matches(filter, src, dst)
            } else {
                matches_flow(filter, src, dst, *sport, *dport)
            }
        }
        ParsedPacket::V6 {
            srcip,
            dstip,
            sport,
            dport,
            header,
        } => {
            let src = IpAddr::from(*srcip);
            let dst = IpAddr::from(*dstip);
            if *header == 58 {
                ip_pair_matches(filter, src, dst)
            } else {
                matches_flow(filter, src, dst, *sport, *dport)
            }
        }
        // Non-IP frames carry no tuple; with a filter set they are noise.
        ParsedPacket::Other => false,
    }
}

fn ip_pair_matches(filter: &FiveTuple, src: IpAddr, dst: IpAddr) -> bool {
    (src == filter.srcip && dst == filter.dstip) || (src == filter.dstip && dst == filter.srcip)
}

pub fn build_row(ev: &PacketEvent, time: f64, filter: Option<&FiveTuple>) -> PacketRowKind {
    let captured = ev.captured();
    let parsed = parse_frame(captured);

    // Unparseable frames bypass the filter only when no filter is set.
    if !admits(filter, &parsed) {
        return PacketRowKind::Filtered;
    }

    match parsed {
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
        } => PacketRowKind::V4(V4PacketRow {
            time,
            netif: 0,
            direction: ev.direction as i64,
            length: ev.payload_len as i64,
            content: to_hex(captured),
            srcip: srcip.to_string(),
            dstip: dstip.to_string(),
            srcport: sport as i64,
            dstport: dport as i64,
            prot: prot as i64,
            ipid: ipid as i64,
            ttl: ttl as i64,
            frag,
            option: options,
        }),
        ParsedPacket::V6 {
            srcip,
            dstip,
            header,
            sport,
            dport,
        } => PacketRowKind::V6(V6PacketRow {
            time,
            netif: 0,
            direction: ev.direction as i64,
            length: ev.payload_len as i64,
            content: to_hex(captured),
            srcip: srcip.to_string(),
            dstip: dstip.to_string(),
            header: header as i64,
            srcport: sport as i64,
            dstport: dport as i64,
        }),
        ParsedPacket::Other => PacketRowKind::Other(OtherPacketRow {
            time,
            netif: 0,
            direction: ev.direction as i64,
            length: ev.payload_len as i64,
            content: to_hex(captured),
        }),
    }
}

fn epoch_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

pub fn start_packet_listener(
    mut ring: RingBuf<MapData>,
    store: Arc<PacketStore>,
    filter: Arc<FilterState>,
    metrics: Arc<Metrics>,
    commit_interval: Duration,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<PacketBatch>();

    {
        let filter = Arc::clone(&filter);
        let metrics = Arc::clone(&metrics);
        tokio::task::spawn_blocking(move || {
            let attach_time = epoch_secs();
            let mut start = 0u64;
            let mut v4 = Vec::new();
            let mut v6 = Vec::new();
            let mut other = Vec::new();
            let mut last_send = Instant::now();
            loop {
                if let Some(item) = ring.next() {
                    if let Some(ev) = parse_packet_event(item.as_ref()) {
                        metrics.record_packet_event();
                        if start == 0 {
                            start = ev.timestamp;
                        }
                        let time =
                            attach_time + (ev.timestamp.saturating_sub(start)) as f64 / 1e9;
                        let tuple = filter.snapshot();
                        match build_row(&ev, time, tuple.as_ref()) {
                            PacketRowKind::V4(row) => v4.push(row),
                            PacketRowKind::V6(row) => v6.push(row),
                            PacketRowKind::Other(row) => other.push(row),
                            PacketRowKind::Filtered => {}
                        }
                    } else {
                        metrics.inc_rb_overflow();
                    }
                } else {
                    std::thread::sleep(Duration::from_millis(1));
                }

                if last_send.elapsed() >= commit_interval {
                    last_send = Instant::now();
                    let batch = PacketBatch {
                        v4: std::mem::take(&mut v4),
                        v6: std::mem::take(&mut v6),
                        other: std::mem::take(&mut other),
                    };
                    if tx.send(batch).is_err() {
                        return;
                    }
                }
            }
        });
    }

    tokio::spawn(async move {
        while let Some(batch) = rx.recv().await {
            if let Err(err) = store.insert_batch(&batch.v4, &batch.v6, &batch.other).await {
                warn!("[flowtraced] packet store write failed: {err}");
                metrics.inc_store_error();
            }
            if filter.take_clear_packet() {
                if let Err(err) = store.truncate_before(epoch_secs()).await {
                    warn!("[flowtraced] packet store truncate failed: {err}");
                    metrics.inc_store_error();
                }
            }
        }
    });
}

fn parse_packet_event(bytes: &[u8]) -> Option<PacketEvent> {
    if bytes.len() < std::mem::size_of::<PacketEvent>() {
        return None;
    }
    let ptr = bytes.as_ptr() as *const PacketEvent;
    Some(unsafe { std::ptr::read_unaligned(ptr) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowtrace_ebpf_common::{DIRECTION_EGRESS, PACKET_SNAP_LEN};

    fn tcp_frame(src: [u8; 4], dst: [u8; 4], sport: u16, dport: u16) -> Vec<u8> {
        let mut frame = vec![0u8; 12];
        frame.extend_from_slice(&0x0800u16.to_be_bytes());
        let mut l3 = vec![0u8; 20];
        l3[0] = 0x45;
        l3[8] = 64;
        l3[9] = 6;
        l3[12..16].copy_from_slice(&src);
        l3[16..20].copy_from_slice(&dst);
        l3.extend_from_slice(&sport.to_be_bytes());
        l3.extend_from_slice(&dport.to_be_bytes());
        frame.extend_from_slice(&l3);
        frame
    }

    fn event_for(frame: &[u8]) -> PacketEvent {
        let mut ev = PacketEvent::zeroed();
        ev.timestamp = 1_000;
        ev.direction = DIRECTION_EGRESS;
        ev.payload_len = frame.len() as u64;
        ev.payload[..frame.len().min(PACKET_SNAP_LEN)]
            .copy_from_slice(&frame[..frame.len().min(PACKET_SNAP_LEN)]);
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
    fn matching_v4_packet_becomes_a_v4_row() {
        let frame = tcp_frame([127, 0, 0, 1], [127, 0, 0, 1], 45290, 43483);
        let ev = event_for(&frame);
        let filter = loopback_filter();
        match build_row(&ev, 5.0, Some(&filter)) {
            PacketRowKind::V4(row) => {
                assert_eq!(row.srcport, 45290);
                assert_eq!(row.dstport, 43483);
                assert_eq!(row.prot, 6);
                assert_eq!(row.direction, DIRECTION_EGRESS as i64);
                assert_eq!(row.content.len(), frame.len() * 2);
            }
            _ => panic!("expected a v4 row"),
        }
    }

    #[test]
    fn reverse_direction_is_admitted() {
        let frame = tcp_frame([127, 0, 0, 1], [127, 0, 0, 1], 43483, 45290);
        let ev = event_for(&frame);
        assert!(matches!(
            build_row(&ev, 5.0, Some(&loopback_filter())),
            PacketRowKind::V4(_)
        ));
    }

    #[test]
    fn foreign_flow_is_filtered_out() {
        let frame = tcp_frame([10, 0, 0, 1], [10, 0, 0, 2], 1, 2);
        let ev = event_for(&frame);
        assert!(matches!(
            build_row(&ev, 5.0, Some(&loopback_filter())),
            PacketRowKind::Filtered
        ));
    }

    #[test]
    fn no_filter_admits_non_ip_into_other_table() {
        let mut frame = vec![0u8; 12];
        frame.extend_from_slice(&0x0806u16.to_be_bytes());
        frame.extend_from_slice(&[0u8; 28]);
        let ev = event_for(&frame);
        match build_row(&ev, 5.0, None) {
            PacketRowKind::Other(row) => assert_eq!(row.length, frame.len() as i64),
            _ => panic!("expected other row"),
        }
    }

    #[test]
    fn filter_set_drops_non_ip() {
        let mut frame = vec![0u8; 12];
        frame.extend_from_slice(&0x0806u16.to_be_bytes());
        frame.extend_from_slice(&[0u8; 28]);
        let ev = event_for(&frame);
        assert!(matches!(
            build_row(&ev, 5.0, Some(&loopback_filter())),
            PacketRowKind::Filtered
        ));
    }

    #[test]
    fn icmp_is_judged_on_addresses_alone() {
        let mut frame = vec![0u8; 12];
        frame.extend_from_slice(&0x0800u16.to_be_bytes());
        let mut l3 = vec![0u8; 20];
        l3[0] = 0x45;
        l3[9] = 1;
        l3[12..16].copy_from_slice(&[127, 0, 0, 1]);
        l3[16..20].copy_from_slice(&[127, 0, 0, 1]);
        frame.extend_from_slice(&l3);
        let ev = event_for(&frame);
        assert!(matches!(
            build_row(&ev, 5.0, Some(&loopback_filter())),
            PacketRowKind::V4(_)
        ));
    }
}
