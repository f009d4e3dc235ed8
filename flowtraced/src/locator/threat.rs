//! Threat-intel map: IP -> human-readable label, loaded from disk. When the
//! file is missing the configured updater is invoked once to create it.

use anyhow::Result;
use log::{info, warn};
use std::collections::HashMap;
use std::path::Path;
use std::process::Command;

#[derive(Debug, Default)]
pub struct ThreatIntel {
    entries: HashMap<String, String>,
}

impl ThreatIntel {
    pub fn load(path: &Path, updater: Option<&str>) -> Self {
        if !path.exists() {
            if let Some(command) = updater {
                info!("[locator] {} missing, running updater", path.display());
                match run_updater(command) {
                    Ok(()) => {}
                    Err(err) => warn!("[locator] threat-intel updater failed: {err}"),
                }
            }
        }
        match std::fs::read_to_string(path) {
            Ok(raw) => match Self::parse(&raw) {
                Ok(intel) => {
                    info!("[locator] loaded {} risky IPs", intel.entries.len());
                    intel
                }
                Err(err) => {
                    warn!("[locator] {} unparsable: {err}", path.display());
                    Self::default()
                }
            },
            Err(_) => {
                warn!(
                    "[locator] no threat-intel map at {}; risk scoring degraded",
                    path.display()
                );
                Self::default()
            }
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let entries: HashMap<String, String> = serde_json::from_str(raw)?;
        Ok(Self { entries })
    }

    pub fn label(&self, ip: &str) -> Option<&str> {
        self.entries.get(ip).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn run_updater(command: &str) -> Result<()> {
    let mut parts = command.split_whitespace();
    let Some(program) = parts.next() else {
        anyhow::bail!("empty updater command");
    };
    let status = Command::new(program).args(parts).status()?;
    if !status.success() {
        anyhow::bail!("updater exited with {status}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_ip_label_map() {
        let intel = ThreatIntel::parse(r#"{"1.1.1.1": "test-feed: scanner"}"#).unwrap();
        assert_eq!(intel.label("1.1.1.1"), Some("test-feed: scanner"));
        assert_eq!(intel.label("8.8.8.8"), None);
        assert_eq!(intel.len(), 1);
    }

    #[test]
    fn missing_file_degrades_to_empty() {
        let intel = ThreatIntel::load(Path::new("/nonexistent/risky_ips.json"), None);
        assert!(intel.is_empty());
    }

    #[test]
    fn load_reads_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"9.9.9.9": "blocklist"}}"#).unwrap();
        let intel = ThreatIntel::load(file.path(), None);
        assert_eq!(intel.label("9.9.9.9"), Some("blocklist"));
    }
}
