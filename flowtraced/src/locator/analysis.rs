//! Path deviation and risk analysis over the per-target history.

use super::parse::HopRecord;
use super::threat::ThreatIntel;
use serde::Serialize;
use std::collections::HashSet;

const HIGH_LATENCY_MS: f64 = 200.0;
const THREAT_RISK: u32 = 40;
const ANOMALY_RISK: u32 = 10;
const MAX_RISK: u32 = 100;

#[derive(Debug, Serialize)]
pub struct AnalysisReport {
    pub anomalies: Vec<String>,
    pub alerts: Vec<String>,
    #[serde(rename = "riskScore")]
    pub risk_score: u32,
}

/// Compare the current hop set against the previous runs: unseen hop IPs are
/// path deviations, slow hops and threat-listed hops raise alerts, and the
/// score is the threat weight plus ten per anomaly, capped at 100.
pub fn analyze_hops(
    current: &[HopRecord],
    previous_runs: &[Vec<HopRecord>],
    threat: &ThreatIntel,
) -> AnalysisReport {
    let mut seen: HashSet<&str> = HashSet::new();
    for run in previous_runs {
        for hop in run {
            if let Some(ip) = hop.ip.as_deref() {
                seen.insert(ip);
            }
        }
    }

    let mut anomalies = Vec::new();
    let mut alerts = Vec::new();
    let mut raw_risk = 0u32;

    for hop in current {
        let Some(ip) = hop.ip.as_deref() else {
            continue;
        };
        if !previous_runs.is_empty() && !seen.contains(ip) {
            anomalies.push(format!("PathDeviation: hop {} via unseen {}", hop.hop, ip));
        }
        if let Some(latency) = hop.latency {
            if latency > HIGH_LATENCY_MS {
                alerts.push(format!(
                    "HighLatency: hop {} ({}) at {:.1} ms",
                    hop.hop, ip, latency
                ));
            }
        }
        if let Some(label) = threat.label(ip) {
            raw_risk += THREAT_RISK;
            alerts.push(format!("ThreatIntel: hop {} {} flagged: {}", hop.hop, ip, label));
        }
    }

    let risk_score = (raw_risk + ANOMALY_RISK * anomalies.len() as u32).min(MAX_RISK);
    AnalysisReport {
        anomalies,
        alerts,
        risk_score,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locator::parse::PendingHop;

    fn hop(num: u32, ip: &str, rtt: f64) -> HopRecord {
        PendingHop {
            hop: num,
            ip: Some(ip.into()),
            rtts: vec![Some(rtt)],
        }
        .into_record()
    }

    #[test]
    fn quiet_path_scores_zero() {
        let current = vec![hop(1, "192.168.1.1", 1.0), hop(2, "1.1.1.1", 9.0)];
        let previous = vec![current.clone()];
        let report = analyze_hops(&current, &previous, &ThreatIntel::default());
        assert!(report.anomalies.is_empty());
        assert!(report.alerts.is_empty());
        assert_eq!(report.risk_score, 0);
    }

    #[test]
    fn unseen_hop_is_a_deviation() {
        let previous = vec![vec![hop(1, "192.168.1.1", 1.0), hop(2, "1.1.1.1", 9.0)]];
        let current = vec![hop(1, "192.168.1.1", 1.0), hop(2, "4.4.4.4", 9.0)];
        let report = analyze_hops(&current, &previous, &ThreatIntel::default());
        assert_eq!(report.anomalies.len(), 1);
        assert!(report.anomalies[0].contains("4.4.4.4"));
        assert_eq!(report.risk_score, 10);
    }

    #[test]
    fn first_run_has_no_deviation_baseline() {
        let current = vec![hop(1, "192.168.1.1", 1.0)];
        let report = analyze_hops(&current, &[], &ThreatIntel::default());
        assert!(report.anomalies.is_empty());
    }

    #[test]
    fn slow_hops_alert_without_risk() {
        let current = vec![hop(3, "5.5.5.5", 350.0)];
        let previous = vec![current.clone()];
        let report = analyze_hops(&current, &previous, &ThreatIntel::default());
        assert_eq!(report.alerts.len(), 1);
        assert!(report.alerts[0].starts_with("HighLatency"));
        assert_eq!(report.risk_score, 0);
    }

    #[test]
    fn threat_listed_hop_scores_forty_and_names_the_ip() {
        let intel = ThreatIntel::parse(r#"{"1.1.1.1": "feed: c2"}"#).unwrap();
        let current = vec![hop(2, "1.1.1.1", 9.0)];
        let report = analyze_hops(&current, &[current.clone()], &intel);
        assert_eq!(report.risk_score, 40);
        assert!(report.alerts.iter().any(|a| a.contains("1.1.1.1")));
    }

    #[test]
    fn score_saturates_at_one_hundred() {
        let intel = ThreatIntel::parse(
            r#"{"1.1.1.1": "x", "2.2.2.2": "y", "3.3.3.3": "z"}"#,
        )
        .unwrap();
        let current = vec![
            hop(1, "1.1.1.1", 1.0),
            hop(2, "2.2.2.2", 1.0),
            hop(3, "3.3.3.3", 1.0),
        ];
        let report = analyze_hops(&current, &[vec![hop(1, "9.9.9.9", 1.0)]], &intel);
        assert_eq!(report.risk_score, 100);
    }
}
