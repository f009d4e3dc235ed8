//! Outbound hop-path tracing: spawn the external probe, stream and enrich
//! its hops, persist per-target history, and score deviations against it.

pub mod analysis;
pub mod geo;
pub mod parse;
pub mod threat;

use crate::config::LocatorConfig;
use analysis::{AnalysisReport, analyze_hops};
use anyhow::{Context, Result};
use chrono::Utc;
use geo::GeoResolver;
use log::{info, warn};
use parse::{HopParser, HopRecord};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use threat::ThreatIntel;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceRun {
    pub timestamp: i64,
    pub target: String,
    pub ip: String,
    pub hops: Vec<HopRecord>,
}

pub struct Locator {
    config: LocatorConfig,
    geo: GeoResolver,
    threat: ThreatIntel,
}

impl Locator {
    pub fn new(config: LocatorConfig) -> Self {
        let geo = GeoResolver::new(&config);
        let threat = ThreatIntel::load(&config.risky_ips, config.updater_command.as_deref());
        Self {
            config,
            geo,
            threat,
        }
    }

    /// Numeric targets pass through; names resolve via the system resolver.
    pub async fn resolve_target(&self, target: &str) -> Result<IpAddr> {
        if let Ok(ip) = target.parse::<IpAddr>() {
            return Ok(ip);
        }
        let mut addrs = tokio::net::lookup_host(format!("{target}:0"))
            .await
            .with_context(|| format!("cannot resolve {target}"))?;
        addrs
            .next()
            .map(|addr| addr.ip())
            .with_context(|| format!("no addresses for {target}"))
    }

    fn target_dir(&self, ip: &IpAddr) -> PathBuf {
        self.config.history_dir.join(ip.to_string())
    }

    /// History runs for a target, newest first.
    pub fn history(&self, ip: &IpAddr) -> Vec<TraceRun> {
        let dir = self.target_dir(ip);
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return Vec::new();
        };
        let mut files: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        // Timestamp-prefixed names sort chronologically.
        files.sort();
        files.reverse();
        files
            .iter()
            .filter_map(|path| {
                let raw = std::fs::read_to_string(path).ok()?;
                serde_json::from_str(&raw).ok()
            })
            .collect()
    }

    pub fn cached_run(&self, ip: &IpAddr) -> Option<TraceRun> {
        self.history(ip).into_iter().next()
    }

    /// Stream hops for a target. With caching enabled and a history hit the
    /// stored hops replay; otherwise the external probe runs and the full
    /// result is persisted when its stdout closes.
    pub async fn trace(
        self: Arc<Self>,
        target: &str,
        use_cache: bool,
    ) -> Result<mpsc::UnboundedReceiver<HopRecord>> {
        let ip = self.resolve_target(target).await?;
        let (tx, rx) = mpsc::unbounded_channel();

        if use_cache {
            if let Some(run) = self.cached_run(&ip) {
                info!("[locator] serving {target} from history");
                tokio::spawn(async move {
                    for hop in run.hops {
                        if tx.send(hop).is_err() {
                            break;
                        }
                    }
                });
                return Ok(rx);
            }
        }

        let target = target.to_string();
        tokio::spawn(async move {
            if let Err(err) = self.run_probe(&target, ip, tx).await {
                warn!("[locator] trace of {target} failed: {err}");
            }
        });
        Ok(rx)
    }

    async fn run_probe(
        &self,
        target: &str,
        ip: IpAddr,
        tx: mpsc::UnboundedSender<HopRecord>,
    ) -> Result<()> {
        let mut child = Command::new(&self.config.trace_command)
            .arg(ip.to_string())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("cannot spawn {}", self.config.trace_command))?;
        let stdout = child
            .stdout
            .take()
            .context("hop probe has no stdout handle")?;
        let mut lines = BufReader::new(stdout).lines();

        let mut parser = HopParser::new();
        let mut hops: Vec<HopRecord> = Vec::new();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Some(pending) = parser.push_line(&line) {
                let mut record = pending.into_record();
                self.geo.enrich(&mut record).await;
                let _ = tx.send(record.clone());
                hops.push(record);
            }
        }
        if let Some(pending) = parser.finish() {
            let mut record = pending.into_record();
            self.geo.enrich(&mut record).await;
            let _ = tx.send(record.clone());
            hops.push(record);
        }
        let _ = child.wait().await;

        self.persist_run(target, ip, hops)?;
        Ok(())
    }

    fn persist_run(&self, target: &str, ip: IpAddr, hops: Vec<HopRecord>) -> Result<()> {
        let run = TraceRun {
            timestamp: Utc::now().timestamp(),
            target: target.to_string(),
            ip: ip.to_string(),
            hops,
        };
        let dir = self.target_dir(&ip);
        std::fs::create_dir_all(&dir)?;
        let file = dir.join(format!(
            "{}-{}.json",
            run.timestamp,
            sanitize_target(target)
        ));
        std::fs::write(&file, serde_json::to_string_pretty(&run)?)?;
        info!("[locator] persisted {} hops to {}", run.hops.len(), file.display());
        Ok(())
    }

    /// Deviation + risk scoring for a target against its previous runs.
    pub async fn analyze(self: Arc<Self>, target: &str, use_cache: bool) -> Result<AnalysisReport> {
        let ip = self.resolve_target(target).await?;

        let current: Vec<HopRecord> = if use_cache {
            match self.cached_run(&ip) {
                Some(run) => run.hops,
                None => Arc::clone(&self).collect_fresh(target).await?,
            }
        } else {
            Arc::clone(&self).collect_fresh(target).await?
        };

        // The freshest stored run is the one under analysis; the window
        // starts behind it.
        let previous: Vec<Vec<HopRecord>> = self
            .history(&ip)
            .into_iter()
            .skip(1)
            .take(self.config.history_depth)
            .map(|run| run.hops)
            .collect();

        Ok(analyze_hops(&current, &previous, &self.threat))
    }

    async fn collect_fresh(self: Arc<Self>, target: &str) -> Result<Vec<HopRecord>> {
        let mut rx = self.trace(target, false).await?;
        let mut hops = Vec::new();
        while let Some(hop) = rx.recv().await {
            hops.push(hop);
        }
        Ok(hops)
    }
}

fn sanitize_target(target: &str) -> String {
    target
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
