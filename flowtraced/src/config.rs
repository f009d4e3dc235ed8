use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

const DEFAULT_CONFIG_PATH: &str = "/etc/flowtrace/flowtrace.toml";
const ENV_CONFIG_PATH: &str = "FLOWTRACE_CONFIG";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub locator: LocatorConfig,
}

impl Config {
    /// Load configuration from file. The path can be overridden
    /// with the `FLOWTRACE_CONFIG` environment variable. If the file
    /// is missing or fails to parse, defaults are returned.
    pub fn load() -> Self {
        let path =
            std::env::var(ENV_CONFIG_PATH).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let path = PathBuf::from(path);
        match fs::read_to_string(&path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_default(),
            Err(_) => Config::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    /// Directory holding the BTF dump, function tables and both databases.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    /// Store commit cadence in seconds.
    #[serde(default = "default_commit_interval_secs")]
    pub commit_interval_secs: u64,
    /// Upper bound on generic probe attachments.
    #[serde(default = "default_probe_limit")]
    pub probe_limit: usize,
    #[serde(default = "default_cpu_target_pct")]
    pub cpu_target_pct: u64,
    #[serde(default = "default_rss_cap_mb")]
    pub rss_cap_mb: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            commit_interval_secs: default_commit_interval_secs(),
            probe_limit: default_probe_limit(),
            cpu_target_pct: default_cpu_target_pct(),
            rss_cap_mb: default_rss_cap_mb(),
        }
    }
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("./.cache")
}
fn default_commit_interval_secs() -> u64 {
    1
}
fn default_probe_limit() -> usize {
    20_000
}
fn default_cpu_target_pct() -> u64 {
    25
}
fn default_rss_cap_mb() -> u64 {
    512
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    #[serde(default = "default_http_addr")]
    pub addr: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            addr: default_http_addr(),
        }
    }
}

fn default_http_addr() -> String {
    "0.0.0.0:19999".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LocatorConfig {
    /// Hop-probe command; receives the target as its final argument.
    #[serde(default = "default_trace_command")]
    pub trace_command: String,
    #[serde(default = "default_history_dir")]
    pub history_dir: PathBuf,
    #[serde(default = "default_geoip_city_db")]
    pub geoip_city_db: PathBuf,
    #[serde(default = "default_geoip_asn_db")]
    pub geoip_asn_db: PathBuf,
    /// IP-info web service queried before the local databases. The IP is
    /// appended to this prefix.
    #[serde(default = "default_ipinfo_url")]
    pub ipinfo_url: String,
    #[serde(default = "default_risky_ips")]
    pub risky_ips: PathBuf,
    /// Command invoked to (re)create the threat-intel map when absent.
    #[serde(default)]
    pub updater_command: Option<String>,
    /// How many previous runs the deviation analysis compares against.
    #[serde(default = "default_history_depth")]
    pub history_depth: usize,
}

impl Default for LocatorConfig {
    fn default() -> Self {
        Self {
            trace_command: default_trace_command(),
            history_dir: default_history_dir(),
            geoip_city_db: default_geoip_city_db(),
            geoip_asn_db: default_geoip_asn_db(),
            ipinfo_url: default_ipinfo_url(),
            risky_ips: default_risky_ips(),
            updater_command: None,
            history_depth: default_history_depth(),
        }
    }
}

fn default_trace_command() -> String {
    "traceroute".to_string()
}
fn default_history_dir() -> PathBuf {
    PathBuf::from("history")
}
fn default_geoip_city_db() -> PathBuf {
    PathBuf::from("GeoLite2-City.mmdb")
}
fn default_geoip_asn_db() -> PathBuf {
    PathBuf::from("GeoLite2-ASN.mmdb")
}
fn default_ipinfo_url() -> String {
    "http://ip-api.com/json/".to_string()
}
fn default_risky_ips() -> PathBuf {
    PathBuf::from("risky_ips.json")
}
fn default_history_depth() -> usize {
    5
}
