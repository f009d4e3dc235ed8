//! Live per-flow latency, frequency, rate and drop analyser.
//!
//! Each WebSocket stream loads its own copy of the latency object, scopes it
//! with the requested five-tuple, and turns the kernel's layer-crossing
//! stamps into a stream of JSON records: cross-layer latency and frequency,
//! per-layer packet counts and rates, and a drop rate. A window closes once
//! it spans more than a second of samples; rates are per-second over the
//! actual window span.

use aya::maps::Array;
use aya::programs::KProbe;
use aya::{EbpfLoader, Pod};
use flowtrace_ebpf_common::{
    FlowKeyV4, FlowKeyV6, LayerStamp, STAMP_RX, STAMP_TX, SockOffsets, layer, stamp_kind,
};
use log::{info, warn};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Seconds of silence before a round of zeroed idle records goes out.
const IDLE_EMIT_SECS: u64 = 10;

#[repr(transparent)]
#[derive(Copy, Clone)]
struct FlowKeyV4Pod(FlowKeyV4);
unsafe impl Pod for FlowKeyV4Pod {}

#[repr(transparent)]
#[derive(Copy, Clone)]
struct FlowKeyV6Pod(FlowKeyV6);
unsafe impl Pod for FlowKeyV6Pod {}

#[derive(Debug, Clone)]
pub struct AnalyzerParams {
    pub ipv4: bool,
    pub ipv6: bool,
    pub sip: String,
    pub dip: String,
    pub sport: u16,
    pub dport: u16,
    pub protocol: String,
}

impl AnalyzerParams {
    /// Validate the raw `params` object of a stream request. Collects every
    /// problem instead of stopping at the first, so clients see the full
    /// picture in the `details` array.
    pub fn validate(raw: &Value) -> Result<Self, Vec<String>> {
        let mut errors = Vec::new();

        let flag = |key: &str| -> Option<bool> {
            raw.get(key).map(|v| match v {
                Value::Bool(b) => *b,
                other => other.as_str().unwrap_or("").eq_ignore_ascii_case("true"),
            })
        };
        let ipv4 = flag("ipv4").unwrap_or_else(|| {
            errors.push("Missing parameter: ipv4".into());
            false
        });
        let ipv6 = flag("ipv6").unwrap_or_else(|| {
            errors.push("Missing parameter: ipv6".into());
            false
        });

        let mut text = |key: &str| -> String {
            match raw.get(key).and_then(|v| v.as_str()) {
                Some(s) if !s.is_empty() => s.to_string(),
                _ => {
                    errors.push(format!("Missing parameter: {key}"));
                    String::new()
                }
            }
        };
        let sip = text("sip");
        let dip = text("dip");
        let protocol = text("protocol").to_lowercase();

        let mut port = |key: &str| -> u16 {
            let value = raw.get(key);
            let parsed = match value {
                Some(Value::Number(n)) => n.as_i64(),
                Some(Value::String(s)) => s.parse::<i64>().ok(),
                _ => None,
            };
            match parsed {
                Some(p) if (0..=65535).contains(&p) => p as u16,
                _ => {
                    errors.push(format!(
                        "Invalid value for {key}: {}",
                        value.cloned().unwrap_or(Value::Null)
                    ));
                    0
                }
            }
        };
        let sport = port("sport");
        let dport = port("dport");

        if !errors.is_empty() {
            return Err(errors);
        }
        if !ipv4 && !ipv6 {
            return Err(vec!["At least one of IPv4 or IPv6 must be enabled".into()]);
        }
        if !matches!(protocol.as_str(), "tcp" | "udp" | "icmp") {
            return Err(vec![
                "Invalid protocol (must be 'tcp', 'udp', or 'icmp')".into(),
            ]);
        }

        Ok(Self {
            ipv4,
            ipv6,
            sip,
            dip,
            sport,
            dport,
            protocol,
        })
    }

    fn protocol_number(&self, family: u8) -> u8 {
        match (self.protocol.as_str(), family) {
            ("tcp", _) => 6,
            ("udp", _) => 17,
            ("icmp", 6) => 58,
            ("icmp", _) => 1,
            _ => 0,
        }
    }

    fn v4_key(&self) -> Option<FlowKeyV4> {
        let src: IpAddr = self.sip.parse().ok()?;
        let dst: IpAddr = self.dip.parse().ok()?;
        let (IpAddr::V4(src), IpAddr::V4(dst)) = (src, dst) else {
            return None;
        };
        Some(FlowKeyV4 {
            saddr: u32::from_ne_bytes(src.octets()),
            daddr: u32::from_ne_bytes(dst.octets()),
            sport: self.sport,
            dport: self.dport,
            protocol: self.protocol_number(4),
            enabled: 1,
            _pad: [0; 2],
        })
    }

    fn v6_key(&self) -> Option<FlowKeyV6> {
        let src: IpAddr = self.sip.parse().ok()?;
        let dst: IpAddr = self.dip.parse().ok()?;
        let (IpAddr::V6(src), IpAddr::V6(dst)) = (src, dst) else {
            return None;
        };
        let words = |octets: [u8; 16]| -> [u32; 4] {
            let mut out = [0u32; 4];
            for (slot, chunk) in out.iter_mut().zip(octets.chunks(4)) {
                *slot = u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            }
            out
        };
        Some(FlowKeyV6 {
            saddr: words(src.octets()),
            daddr: words(dst.octets()),
            sport: self.sport,
            dport: self.dport,
            protocol: self.protocol_number(6),
            enabled: 1,
            _pad: [0; 2],
        })
    }

}

const CROSS_LINKNETWORK: usize = 0;
const CROSS_LINKTRANS: usize = 1;
const CROSS_NETWORKTRANS: usize = 2;

fn cross_name(cross: usize) -> &'static str {
    match cross {
        CROSS_LINKNETWORK => "linknetwork",
        CROSS_LINKTRANS => "linktrans",
        _ => "networktrans",
    }
}

fn layer_name(l: u8) -> &'static str {
    match l {
        layer::LINK => "link",
        layer::NETWORK => "network",
        _ => "trans",
    }
}

fn direction_name(direction: u8) -> &'static str {
    if direction == STAMP_TX { "send" } else { "receive" }
}

fn family_name(family: u8) -> &'static str {
    if family == 6 { "ipv6" } else { "ipv4" }
}

#[derive(Default, Clone, Copy)]
struct Window {
    count: u64,
    start_us: u64,
    end_us: u64,
}

impl Window {
    /// Record a sample; closes and returns (frequency, count) once the
    /// window spans more than a second.
    fn push(&mut self, ts_us: u64) -> Option<(f64, u64)> {
        self.count += 1;
        if self.count == 1 {
            self.start_us = ts_us;
            return None;
        }
        self.end_us = ts_us;
        let interval = (self.end_us.saturating_sub(self.start_us)) as f64 / 1e6;
        if interval > 1.0 {
            let frequency = self.count as f64 / interval;
            let count = self.count;
            *self = Window::default();
            return Some((frequency, count));
        }
        None
    }
}

/// Pure stamp-to-record aggregation, one instance per stream.
pub struct LatencyAggregator {
    params: AnalyzerParams,
    /// Last crossing time per (layer, direction, family), nanoseconds.
    last_ns: HashMap<(u8, u8, u8), u64>,
    cross_windows: HashMap<(usize, u8, u8), Window>,
    layer_windows: HashMap<(u8, u8, u8), Window>,
    drop_windows: HashMap<u8, Window>,
}

impl LatencyAggregator {
    pub fn new(params: AnalyzerParams) -> Self {
        Self {
            params,
            last_ns: HashMap::new(),
            cross_windows: HashMap::new(),
            layer_windows: HashMap::new(),
            drop_windows: HashMap::new(),
        }
    }

    pub fn ingest(&mut self, stamp: &LayerStamp) -> Vec<Value> {
        if (stamp.family == 4 && !self.params.ipv4) || (stamp.family == 6 && !self.params.ipv6) {
            return Vec::new();
        }
        if stamp.kind == stamp_kind::DROP {
            return self.ingest_drop(stamp);
        }

        let mut out = Vec::new();
        let ts_us = stamp.ts_ns / 1_000;

        // Cross-layer pairs where this stamp is the later boundary for its
        // direction: sends run transport->network->link, receives the
        // reverse.
        let pairs: &[(usize, u8)] = match (stamp.direction, stamp.layer) {
            (d, layer::LINK) if d == STAMP_TX => &[
                (CROSS_LINKNETWORK, layer::NETWORK),
                (CROSS_LINKTRANS, layer::TRANSPORT),
            ],
            (d, layer::NETWORK) if d == STAMP_TX => &[(CROSS_NETWORKTRANS, layer::TRANSPORT)],
            (d, layer::NETWORK) if d == STAMP_RX => &[(CROSS_LINKNETWORK, layer::LINK)],
            (d, layer::TRANSPORT) if d == STAMP_RX => &[
                (CROSS_LINKTRANS, layer::LINK),
                (CROSS_NETWORKTRANS, layer::NETWORK),
            ],
            _ => &[],
        };

        for (cross, earlier) in pairs {
            let Some(earlier_ns) = self
                .last_ns
                .get(&(*earlier, stamp.direction, stamp.family))
                .copied()
            else {
                continue;
            };
            let delta_us = stamp.ts_ns.saturating_sub(earlier_ns) / 1_000;
            let closed = self
                .cross_windows
                .entry((*cross, stamp.direction, stamp.family))
                .or_default()
                .push(ts_us);
            if let Some((frequency, _count)) = closed {
                out.push(self.cross_record(
                    *cross,
                    stamp,
                    delta_us as f64 / 1e3,
                    frequency,
                ));
            }
        }

        // Per-layer packet accounting.
        let closed = self
            .layer_windows
            .entry((stamp.layer, stamp.direction, stamp.family))
            .or_default()
            .push(ts_us);
        if let Some((pps, count)) = closed {
            out.push(self.layer_record(stamp, count, pps));
        }

        self.last_ns
            .insert((stamp.layer, stamp.direction, stamp.family), stamp.ts_ns);
        out
    }

    fn ingest_drop(&mut self, stamp: &LayerStamp) -> Vec<Value> {
        let ts_us = stamp.ts_ns / 1_000;
        let closed = self.drop_windows.entry(stamp.family).or_default().push(ts_us);
        if let Some((drops, _count)) = closed {
            vec![json!({
                "type": family_name(stamp.family),
                "pid": stamp.pid,
                "saddr": self.params.dip,
                "daddr": self.params.sip,
                "sport": self.params.dport,
                "dport": self.params.sport,
                "drop(s)": drops,
            })]
        } else {
            Vec::new()
        }
    }

    fn cross_record(
        &self,
        cross: usize,
        stamp: &LayerStamp,
        lat_ms: f64,
        frequency: f64,
    ) -> Value {
        let (saddr, daddr, sport, dport) = self.oriented(stamp.direction);
        json!({
            "crosslayer": cross_name(cross),
            "direction": direction_name(stamp.direction),
            "type": family_name(stamp.family),
            "pid": stamp.pid,
            "pid_name": comm_str(&stamp.comm),
            "saddr": saddr,
            "daddr": daddr,
            "sport": sport,
            "dport": dport,
            "LAT(ms)": lat_ms,
            "frequency(s)": frequency,
        })
    }

    fn layer_record(&self, stamp: &LayerStamp, count: u64, pps: f64) -> Value {
        let (saddr, daddr, sport, dport) = self.oriented(stamp.direction);
        json!({
            "layer": layer_name(stamp.layer),
            "direction": direction_name(stamp.direction),
            "type": family_name(stamp.family),
            "pid": stamp.pid,
            "saddr": saddr,
            "daddr": daddr,
            "sport": sport,
            "dport": dport,
            "num": count,
            "pps(s)": pps,
        })
    }

    /// Receive records swap the endpoints so every stream keys by the
    /// outbound perspective.
    fn oriented(&self, direction: u8) -> (&str, &str, u16, u16) {
        if direction == STAMP_TX {
            (&self.params.sip, &self.params.dip, self.params.sport, self.params.dport)
        } else {
            (&self.params.dip, &self.params.sip, self.params.dport, self.params.sport)
        }
    }

    /// The zeroed record set emitted when a poll interval produced nothing.
    pub fn idle_records(&self) -> Vec<Value> {
        let mut out = Vec::new();
        for family in [4u8, 6u8] {
            if (family == 4 && !self.params.ipv4) || (family == 6 && !self.params.ipv6) {
                continue;
            }
            for direction in [STAMP_TX, STAMP_RX] {
                let (saddr, daddr, sport, dport) = self.oriented(direction);
                for cross in [CROSS_LINKTRANS, CROSS_NETWORKTRANS, CROSS_LINKNETWORK] {
                    out.push(json!({
                        "crosslayer": cross_name(cross),
                        "direction": direction_name(direction),
                        "type": family_name(family),
                        "pid": -1,
                        "pid_name": "NULL",
                        "saddr": saddr,
                        "daddr": daddr,
                        "sport": sport,
                        "dport": dport,
                        "LAT(ms)": 0,
                        "frequency(s)": 0,
                    }));
                }
                for l in [layer::TRANSPORT, layer::NETWORK, layer::LINK] {
                    out.push(json!({
                        "layer": layer_name(l),
                        "direction": direction_name(direction),
                        "type": family_name(family),
                        "pid": -1,
                        "saddr": saddr,
                        "daddr": daddr,
                        "sport": sport,
                        "dport": dport,
                        "num": 0,
                        "pps(s)": 0,
                    }));
                }
            }
            let (saddr, daddr, sport, dport) = self.oriented(STAMP_RX);
            out.push(json!({
                "type": family_name(family),
                "pid": -1,
                "saddr": saddr,
                "daddr": daddr,
                "sport": sport,
                "dport": dport,
                "drop(s)": 0,
            }));
        }
        out
    }
}

fn comm_str(comm: &[u8; 16]) -> String {
    String::from_utf8_lossy(comm)
        .trim_end_matches('\0')
        .to_string()
}

/// Everything a stream needs to come up: the object bytes and the offsets
/// derived at startup.
pub struct AnalyzerContext {
    pub object_bytes: Vec<u8>,
    pub offsets: SockOffsets,
}

/// Load a fresh latency object scoped to `params` and stream its records.
/// The returned receiver yields JSON records until the stream is dropped;
/// dropping the receiver tears the whole instance (and its probes) down.
pub fn spawn_stream(
    context: &Arc<AnalyzerContext>,
    params: AnalyzerParams,
) -> anyhow::Result<mpsc::UnboundedReceiver<Value>> {
    #[repr(transparent)]
    #[derive(Copy, Clone)]
    struct OffsetsPod(SockOffsets);
    unsafe impl Pod for OffsetsPod {}

    let mut loader = EbpfLoader::new();
    let offsets = OffsetsPod(context.offsets);
    loader.set_global("SOCK_OFFSETS", &offsets, true);
    let mut bpf = loader
        .load(&context.object_bytes)
        .map_err(|err| anyhow::anyhow!("latency object rejected: {err}"))?;

    if params.ipv4 {
        let key = params
            .v4_key()
            .ok_or_else(|| anyhow::anyhow!("IPv4 configuration error: bad addresses"))?;
        let map = bpf
            .map_mut("FILTER_V4")
            .ok_or_else(|| anyhow::anyhow!("FILTER_V4 map not found"))?;
        let mut array: Array<_, FlowKeyV4Pod> = Array::try_from(map)?;
        array.set(0, FlowKeyV4Pod(key), 0)?;
    }
    if params.ipv6 {
        let key = params
            .v6_key()
            .ok_or_else(|| anyhow::anyhow!("IPv6 configuration error: bad addresses"))?;
        let map = bpf
            .map_mut("FILTER_V6")
            .ok_or_else(|| anyhow::anyhow!("FILTER_V6 map not found"))?;
        let mut array: Array<_, FlowKeyV6Pod> = Array::try_from(map)?;
        array.set(0, FlowKeyV6Pod(key), 0)?;
    }

    let mut hooks: Vec<(&str, &str)> = Vec::new();
    if params.ipv4 {
        hooks.extend([
            ("trace_trans_tx", "inet_sendmsg"),
            ("trace_trans_rx", "inet_recvmsg"),
            ("trace_net_tx", "ip_finish_output"),
            ("trace_net_rx", "ip_local_deliver"),
        ]);
    }
    if params.ipv6 {
        hooks.extend([
            ("trace_trans_tx", "inet6_sendmsg"),
            ("trace_trans_rx", "inet6_recvmsg"),
            ("trace_net_tx", "ip6_finish_output"),
            ("trace_net_rx", "ip6_input"),
        ]);
    }
    hooks.extend([
        ("trace_link_tx", "dev_queue_xmit"),
        ("trace_link_rx", "__netif_receive_skb"),
    ]);

    let mut attached = 0usize;
    for (program, symbol) in &hooks {
        if attach_probe(&mut bpf, program, symbol) {
            attached += 1;
        }
    }
    // kfree_skb_reason replaced tcp_drop in 5.17; attach whichever exists.
    if attach_probe(&mut bpf, "trace_skb_drop", "kfree_skb_reason") {
        attached += 1;
    } else if attach_probe(&mut bpf, "trace_sock_drop", "tcp_drop") {
        attached += 1;
    }

    if attached == 0 {
        anyhow::bail!("Kernel tracing capabilities not available");
    }
    info!("[analyzer] stream up with {attached} probes");

    let mut ring = aya::maps::ring_buf::RingBuf::try_from(
        bpf.take_map("STAMPS")
            .ok_or_else(|| anyhow::anyhow!("STAMPS map not found"))?,
    )?;

    let (tx, rx) = mpsc::unbounded_channel::<Value>();
    tokio::task::spawn_blocking(move || {
        // The object lives here; dropping it detaches every probe.
        let _bpf = bpf;
        let mut aggregator = LatencyAggregator::new(params);
        let mut quiet_since = Instant::now();
        loop {
            if tx.is_closed() {
                return;
            }
            let mut emitted = false;
            while let Some(item) = ring.next() {
                if let Some(stamp) = parse_stamp(item.as_ref()) {
                    for record in aggregator.ingest(&stamp) {
                        emitted = true;
                        if tx.send(record).is_err() {
                            return;
                        }
                    }
                }
            }
            if emitted {
                quiet_since = Instant::now();
            } else if quiet_since.elapsed() >= Duration::from_secs(IDLE_EMIT_SECS) {
                quiet_since = Instant::now();
                for record in aggregator.idle_records() {
                    if tx.send(record).is_err() {
                        return;
                    }
                }
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    });

    Ok(rx)
}

fn attach_probe(bpf: &mut aya::Ebpf, program: &str, symbol: &str) -> bool {
    let result = (|| -> anyhow::Result<()> {
        let probe: &mut KProbe = bpf
            .program_mut(program)
            .ok_or_else(|| anyhow::anyhow!("{program} program not found"))?
            .try_into()?;
        if let Err(err) = probe.load() {
            if probe.fd().is_err() {
                return Err(err.into());
            }
        }
        probe.attach(symbol, 0)?;
        Ok(())
    })();
    match result {
        Ok(()) => true,
        Err(err) => {
            warn!("[analyzer] {program} on {symbol} not attached: {err:?}");
            false
        }
    }
}

fn parse_stamp(bytes: &[u8]) -> Option<LayerStamp> {
    if bytes.len() < std::mem::size_of::<LayerStamp>() {
        return None;
    }
    let ptr = bytes.as_ptr() as *const LayerStamp;
    Some(unsafe { std::ptr::read_unaligned(ptr) })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> AnalyzerParams {
        AnalyzerParams {
            ipv4: true,
            ipv6: false,
            sip: "10.0.0.1".into(),
            dip: "10.0.0.2".into(),
            sport: 1000,
            dport: 2000,
            protocol: "tcp".into(),
        }
    }

    fn stamp(l: u8, direction: u8, ts_ns: u64) -> LayerStamp {
        let mut s = LayerStamp::zeroed();
        s.layer = l;
        s.direction = direction;
        s.family = 4;
        s.ts_ns = ts_ns;
        s.pid = 7;
        s.comm[..4].copy_from_slice(b"curl");
        s
    }

    #[test]
    fn validate_rejects_bad_protocol_and_ports() {
        let raw = json!({
            "ipv4": true, "ipv6": false, "sip": "1.1.1.1", "dip": "2.2.2.2",
            "sport": 80, "dport": 443, "protocol": "gre"
        });
        let err = AnalyzerParams::validate(&raw).unwrap_err();
        assert!(err[0].contains("Invalid protocol"));

        let raw = json!({
            "ipv4": true, "ipv6": false, "sip": "1.1.1.1", "dip": "2.2.2.2",
            "sport": 700000, "dport": 443, "protocol": "tcp"
        });
        let err = AnalyzerParams::validate(&raw).unwrap_err();
        assert!(err[0].contains("Invalid value for sport"));
    }

    #[test]
    fn validate_requires_a_family() {
        let raw = json!({
            "ipv4": false, "ipv6": false, "sip": "1.1.1.1", "dip": "2.2.2.2",
            "sport": 80, "dport": 443, "protocol": "tcp"
        });
        let err = AnalyzerParams::validate(&raw).unwrap_err();
        assert_eq!(err[0], "At least one of IPv4 or IPv6 must be enabled");
    }

    #[test]
    fn validate_accepts_string_flags_and_ports() {
        let raw = json!({
            "ipv4": "true", "ipv6": "false", "sip": "1.1.1.1", "dip": "2.2.2.2",
            "sport": "0", "dport": "65535", "protocol": "UDP"
        });
        let p = AnalyzerParams::validate(&raw).unwrap();
        assert!(p.ipv4 && !p.ipv6);
        assert_eq!((p.sport, p.dport), (0, 65535));
        assert_eq!(p.protocol, "udp");
    }

    #[test]
    fn icmp_protocol_number_depends_on_family() {
        let mut p = params();
        p.protocol = "icmp".into();
        assert_eq!(p.protocol_number(4), 1);
        assert_eq!(p.protocol_number(6), 58);
    }

    #[test]
    fn cross_layer_window_closes_after_a_second() {
        let mut agg = LatencyAggregator::new(params());
        let second = 1_000_000_000u64;

        // Send path: transport stamp then network stamps; each network stamp
        // computes a delta off the last transport crossing.
        assert!(agg.ingest(&stamp(layer::TRANSPORT, STAMP_TX, second)).is_empty());
        assert!(
            agg.ingest(&stamp(layer::NETWORK, STAMP_TX, second + 2_000_000))
                .is_empty()
        );
        // 1.5 s later the networktrans window spans > 1 s and closes.
        let records = agg.ingest(&stamp(layer::NETWORK, STAMP_TX, second + 1_500_000_000));
        let cross: Vec<&Value> = records
            .iter()
            .filter(|r| r.get("crosslayer").is_some())
            .collect();
        assert_eq!(cross.len(), 1);
        assert_eq!(cross[0]["crosslayer"], "networktrans");
        assert_eq!(cross[0]["direction"], "send");
        // delta: network at t+1.5s vs transport at t => 1500 ms.
        assert!((cross[0]["LAT(ms)"].as_f64().unwrap() - 1500.0).abs() < 1.0);
        assert!(cross[0]["frequency(s)"].as_f64().unwrap() > 0.0);
        assert_eq!(cross[0]["pid_name"], "curl");
    }

    #[test]
    fn receive_records_swap_the_tuple() {
        let mut agg = LatencyAggregator::new(params());
        let second = 1_000_000_000u64;
        agg.ingest(&stamp(layer::LINK, STAMP_RX, second));
        agg.ingest(&stamp(layer::NETWORK, STAMP_RX, second + 1_000_000));
        let records = agg.ingest(&stamp(layer::NETWORK, STAMP_RX, second + 1_200_000_000));
        let cross: Vec<&Value> = records
            .iter()
            .filter(|r| r.get("crosslayer").is_some())
            .collect();
        assert_eq!(cross.len(), 1);
        assert_eq!(cross[0]["saddr"], "10.0.0.2");
        assert_eq!(cross[0]["daddr"], "10.0.0.1");
        assert_eq!(cross[0]["sport"], 2000);
        assert_eq!(cross[0]["dport"], 1000);
    }

    #[test]
    fn layer_counts_report_window_totals() {
        let mut agg = LatencyAggregator::new(params());
        let second = 1_000_000_000u64;
        for i in 0..5 {
            agg.ingest(&stamp(layer::LINK, STAMP_TX, second + i * 100_000_000));
        }
        let records = agg.ingest(&stamp(layer::LINK, STAMP_TX, second + 1_100_000_000));
        let layers: Vec<&Value> = records.iter().filter(|r| r.get("layer").is_some()).collect();
        assert_eq!(layers.len(), 1);
        assert_eq!(layers[0]["layer"], "link");
        assert_eq!(layers[0]["num"], 6);
        let pps = layers[0]["pps(s)"].as_f64().unwrap();
        assert!((pps - 6.0 / 1.1).abs() < 0.1);
    }

    #[test]
    fn drops_produce_their_own_records() {
        let mut agg = LatencyAggregator::new(params());
        let mut s = stamp(layer::NETWORK, STAMP_RX, 1_000_000_000);
        s.kind = stamp_kind::DROP;
        assert!(agg.ingest(&s).is_empty());
        s.ts_ns += 1_500_000_000;
        let records = agg.ingest(&s);
        assert_eq!(records.len(), 1);
        assert!(records[0]["drop(s)"].as_f64().unwrap() > 0.0);
        assert_eq!(records[0]["saddr"], "10.0.0.2");
    }

    #[test]
    fn disabled_family_is_ignored() {
        let mut agg = LatencyAggregator::new(params());
        let mut s = stamp(layer::LINK, STAMP_TX, 1_000_000_000);
        s.family = 6;
        assert!(agg.ingest(&s).is_empty());
        assert!(agg.last_ns.is_empty());
    }

    #[test]
    fn idle_records_cover_every_enabled_combination() {
        let agg = LatencyAggregator::new(params());
        let records = agg.idle_records();
        // v4 only: (3 cross + 3 layer) * 2 directions + 1 drop.
        assert_eq!(records.len(), 13);
        assert!(records.iter().all(|r| r["type"] == "ipv4"));
        let receives: Vec<&Value> = records
            .iter()
            .filter(|r| r.get("direction").map(|d| d == "receive").unwrap_or(false))
            .collect();
        assert!(receives.iter().all(|r| r["saddr"] == "10.0.0.2"));
    }
}
