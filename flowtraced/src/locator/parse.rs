//! Hop-probe stdout parsing.
//!
//! The probe interleaves hop-header lines (leading hop number, no "ms") with
//! RTT lines ("ms" somewhere). A rolling current hop accumulates RTTs and is
//! flushed as soon as a higher hop number shows up. `*` marks a lost probe.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
    pub radius: Option<u16>,
    pub tz: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HopRecord {
    pub hop: u32,
    pub ip: Option<String>,
    pub rtts: Vec<Option<f64>>,
    pub latency: Option<f64>,
    pub jitter: Option<f64>,
    /// Fraction of probes lost, 0..=1.
    pub loss: f64,
    /// Synthetic estimate, 100/(latency+1).
    pub bandwidth: Option<f64>,
    pub location: String,
    pub asn: String,
    pub isp: String,
    pub geo: Option<GeoPoint>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingHop {
    pub hop: u32,
    pub ip: Option<String>,
    /// None marks a `*` (lost probe).
    pub rtts: Vec<Option<f64>>,
}

impl PendingHop {
    /// Collapse raw RTTs into the derived measurements. A hop that lost
    /// every probe reports 100% loss with null latency and jitter.
    pub fn into_record(self) -> HopRecord {
        let total = self.rtts.len();
        let values: Vec<f64> = self.rtts.iter().filter_map(|r| *r).collect();
        let loss = if total == 0 {
            1.0
        } else {
            (total - values.len()) as f64 / total as f64
        };
        let latency = if values.is_empty() {
            None
        } else {
            Some(values.iter().sum::<f64>() / values.len() as f64)
        };
        let jitter = latency.map(|mean| {
            let variance =
                values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
            variance.sqrt()
        });
        let bandwidth = latency.map(|lat| 100.0 / (lat + 1.0));
        HopRecord {
            hop: self.hop,
            ip: self.ip,
            rtts: self.rtts,
            latency,
            jitter,
            loss,
            bandwidth,
            location: "Unknown".into(),
            asn: "Unknown".into(),
            isp: "Unknown".into(),
            geo: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct HopParser {
    current: Option<PendingHop>,
}

impl HopParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one stdout line; returns a finished hop when a higher hop number
    /// flushes the previous one. Unparsable lines are skipped.
    pub fn push_line(&mut self, line: &str) -> Option<PendingHop> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }

        let leading_hop = trimmed
            .split_whitespace()
            .next()
            .and_then(|tok| tok.parse::<u32>().ok());

        if let Some(hop) = leading_hop {
            let mut flushed = None;
            let is_new = self.current.as_ref().map(|c| hop > c.hop).unwrap_or(true);
            if is_new {
                flushed = self.current.take();
                self.current = Some(PendingHop {
                    hop,
                    ip: extract_ip(trimmed),
                    rtts: Vec::new(),
                });
            }
            if let Some(current) = self.current.as_mut() {
                if current.ip.is_none() {
                    current.ip = extract_ip(trimmed);
                }
                current.rtts.extend(extract_rtts(trimmed));
            }
            return flushed;
        }

        // Continuation line: RTTs (or losses) for the current hop.
        if trimmed.contains("ms") || trimmed.contains('*') {
            if let Some(current) = self.current.as_mut() {
                if current.ip.is_none() {
                    current.ip = extract_ip(trimmed);
                }
                current.rtts.extend(extract_rtts(trimmed));
            }
        }
        None
    }

    /// The trailing hop once the probe's stdout closes.
    pub fn finish(&mut self) -> Option<PendingHop> {
        self.current.take()
    }
}

/// First address-looking token, parenthesised or bare.
fn extract_ip(line: &str) -> Option<String> {
    for token in line.split_whitespace() {
        let token = token.trim_matches(|c| c == '(' || c == ')' || c == ',');
        if token.parse::<std::net::IpAddr>().is_ok() {
            return Some(token.to_string());
        }
    }
    None
}

/// Every `<number> ms` pair plus bare `*` loss markers, in order.
fn extract_rtts(line: &str) -> Vec<Option<f64>> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let mut rtts = Vec::new();
    let mut i = 0;
    while i < tokens.len() {
        if tokens[i] == "*" {
            rtts.push(None);
            i += 1;
            continue;
        }
        if i + 1 < tokens.len() && tokens[i + 1] == "ms" {
            if let Ok(value) = tokens[i].parse::<f64>() {
                rtts.push(Some(value));
            }
            i += 2;
            continue;
        }
        i += 1;
    }
    rtts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_classic_trace() {
        let mut parser = HopParser::new();
        let lines = [
            "traceroute to 1.1.1.1 (1.1.1.1), 30 hops max, 60 byte packets",
            " 1  _gateway (192.168.1.1)  0.456 ms  0.389 ms  0.321 ms",
            " 2  * * *",
            " 3  one.one.one.one (1.1.1.1)  8.1 ms  8.0 ms  7.9 ms",
        ];
        let mut hops = Vec::new();
        for line in lines {
            if let Some(hop) = parser.push_line(line) {
                hops.push(hop);
            }
        }
        if let Some(hop) = parser.finish() {
            hops.push(hop);
        }

        assert_eq!(hops.len(), 3);
        assert_eq!(hops[0].hop, 1);
        assert_eq!(hops[0].ip.as_deref(), Some("192.168.1.1"));
        assert_eq!(hops[0].rtts.len(), 3);
        assert_eq!(hops[1].rtts, vec![None, None, None]);
        assert_eq!(hops[2].ip.as_deref(), Some("1.1.1.1"));
    }

    #[test]
    fn rtt_continuation_lines_attach_to_current_hop() {
        let mut parser = HopParser::new();
        assert!(parser.push_line(" 1  10.0.0.1").is_none());
        assert!(parser.push_line("    1.5 ms").is_none());
        assert!(parser.push_line("    2.5 ms").is_none());
        let hop = parser.finish().unwrap();
        assert_eq!(hop.rtts, vec![Some(1.5), Some(2.5)]);
    }

    #[test]
    fn hop_numbers_are_strictly_increasing_flush_points() {
        let mut parser = HopParser::new();
        assert!(parser.push_line(" 5  10.0.0.5  1.0 ms").is_none());
        // A repeated hop number extends rather than flushes.
        assert!(parser.push_line(" 5  10.0.0.5  1.2 ms").is_none());
        let flushed = parser.push_line(" 6  10.0.0.6  2.0 ms").unwrap();
        assert_eq!(flushed.hop, 5);
        assert_eq!(flushed.rtts.len(), 2);
    }

    #[test]
    fn stats_mean_stddev_loss() {
        let pending = PendingHop {
            hop: 1,
            ip: Some("10.0.0.1".into()),
            rtts: vec![Some(2.0), Some(4.0), None],
        };
        let record = pending.into_record();
        assert_eq!(record.latency, Some(3.0));
        assert_eq!(record.jitter, Some(1.0));
        assert!((record.loss - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(record.bandwidth, Some(25.0));
    }

    #[test]
    fn all_lost_hop_reports_full_loss() {
        let pending = PendingHop {
            hop: 2,
            ip: None,
            rtts: vec![None, None, None],
        };
        let record = pending.into_record();
        assert_eq!(record.loss, 1.0);
        assert_eq!(record.latency, None);
        assert_eq!(record.jitter, None);
        assert_eq!(record.bandwidth, None);
    }

    #[test]
    fn garbage_lines_are_skipped() {
        let mut parser = HopParser::new();
        assert!(parser.push_line("!!! not a hop").is_none());
        assert!(parser.finish().is_none());
    }

    #[test]
    fn ipv6_hops_parse() {
        let mut parser = HopParser::new();
        parser.push_line(" 1  2606:4700:4700::1111  4.2 ms");
        let hop = parser.finish().unwrap();
        assert_eq!(hop.ip.as_deref(), Some("2606:4700:4700::1111"));
    }
}
