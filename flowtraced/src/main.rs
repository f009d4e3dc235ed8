use anyhow::Context;
use caps::{CapSet, Capability};
use clap::Parser;
use log::{info, warn};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use std::{error::Error, fs};

mod analyzer;
mod api;
mod btf_scan;
mod config;
mod filter;
mod kallsyms;
mod locator;
mod metrics;
mod offsets;
mod packet;
mod probes;
mod query;
mod runtime;
mod sockets;
mod store;

use crate::analyzer::AnalyzerContext;
use crate::api::{AppState, all_routes};
use crate::config::Config;
use crate::filter::FilterState;
use crate::locator::Locator;
use crate::metrics::Metrics;
use crate::store::{FunctionStore, PacketStore};

#[derive(Parser, Debug)]
#[command(name = "flowtraced")]
#[command(about = "Per-flow kernel path tracer")]
struct Args {
    /// Path to config file
    #[arg(long, value_name = "PATH", default_value = "/etc/flowtrace/flowtrace.toml")]
    config: PathBuf,
    /// Stop after probe discovery and attachment, print a summary
    #[arg(long)]
    probe_only: bool,
    /// Set everything up, attach nothing, exit
    #[arg(long)]
    dry_run: bool,
}

fn ensure_environment() -> anyhow::Result<()> {
    check_capabilities()?;
    // bpf_get_func_ip (the generic probes' identity channel) landed in 5.15.
    check_kernel_version(5, 15)?;
    Ok(())
}

fn check_capabilities() -> anyhow::Result<()> {
    let required = [
        Capability::CAP_BPF,
        Capability::CAP_PERFMON,
        Capability::CAP_NET_ADMIN,
        Capability::CAP_SYS_ADMIN,
    ];
    for cap in &required {
        let has_cap = caps::has_cap(None, CapSet::Effective, *cap)
            .with_context(|| format!("failed to query capability {cap:?}"))?;
        if !has_cap {
            anyhow::bail!(
                "missing {:?} capability. Grant it with `sudo setcap cap_bpf,cap_perfmon,cap_net_admin,cap_sys_admin+ep $(command -v flowtraced)` and restart.",
                cap
            );
        }
    }
    Ok(())
}

fn check_kernel_version(min_major: u32, min_minor: u32) -> anyhow::Result<()> {
    let release = fs::read_to_string("/proc/sys/kernel/osrelease")
        .context("failed to read /proc/sys/kernel/osrelease")?;
    let version =
        parse_kernel_version(&release).context("unable to parse kernel release string")?;
    if version < (min_major, min_minor) {
        anyhow::bail!(
            "kernel {}.{} lacks bpf_get_func_ip support; require >= {min_major}.{min_minor}",
            version.0,
            version.1
        );
    }
    Ok(())
}

fn parse_kernel_version(raw: &str) -> Option<(u32, u32)> {
    let version_part = raw.trim().split('-').next()?;
    let mut segments = version_part.split('.');
    let major = segments.next()?.parse().ok()?;
    let minor = segments.next().unwrap_or("0").parse().ok()?;
    Some((major, minor))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let args = Args::parse();
    if args.config != PathBuf::from("/etc/flowtrace/flowtrace.toml") {
        // SAFETY: single-threaded at this point; set before Config::load reads it.
        unsafe {
            std::env::set_var("FLOWTRACE_CONFIG", &args.config);
        }
    }
    let config = Config::load();

    println!("[flowtraced] starting");
    ensure_environment()?;

    let cache_dir = config.runtime.cache_dir.clone();
    fs::create_dir_all(&cache_dir)?;
    // Stale capture data from a previous run is useless; timestamps rebase.
    for stale in ["FunctionInfo.db", "PacketInfo.db"] {
        let _ = fs::remove_file(cache_dir.join(stale));
    }

    // --- Kernel type discovery ---
    info!("[flowtraced] dumping kernel BTF");
    let btf_json = btf_scan::dump_kernel_btf(&cache_dir)?;
    let graph = btf_scan::BtfGraph::parse(&btf_json)?;
    drop(btf_json);
    let candidates = btf_scan::related_functions(&graph)?;
    let mut generic = btf_scan::generic_attach_list(&candidates);
    generic.truncate(config.runtime.probe_limit);
    btf_scan::write_outputs(&cache_dir, &candidates)?;
    info!(
        "[flowtraced] {} sk_buff-reachable functions, {} selected for generic probes",
        candidates.len(),
        generic.len()
    );

    let sock_offsets = offsets::derive_sock_offsets(&graph)?;
    let symbols = kallsyms::load_text_symbols()?;

    // --- Probe attachment ---
    let metrics = Arc::new(Metrics::new());
    let filter = Arc::new(FilterState::new());
    let attach_finished = Arc::new(AtomicBool::new(false));

    let (tracer_bytes, tracer_path) = probes::read_tracer_bytes()?;
    println!("[flowtraced] using tracer object: {tracer_path}");

    if args.dry_run {
        println!("[flowtraced] dry run requested; exiting before attachment.");
        return Ok(());
    }

    let (_tracer_runtime, func_ring, packet_ring) = probes::init_tracer(
        &tracer_bytes,
        sock_offsets,
        &generic,
        &symbols,
        &sockets::device_names(),
        &metrics,
    )?;
    attach_finished.store(true, Ordering::Relaxed);

    if args.probe_only {
        let payload = json!({
            "attached": metrics.attached_probes(),
            "skipped": metrics.skipped_probes(),
        });
        println!("{payload}");
        return Ok(());
    }

    // --- Stores and consumers ---
    let func_store = Arc::new(FunctionStore::open(cache_dir.join("FunctionInfo.db")).await?);
    let packet_store = Arc::new(PacketStore::open(cache_dir.join("PacketInfo.db")).await?);
    let commit_interval = Duration::from_secs(config.runtime.commit_interval_secs.max(1));

    runtime::start_func_listener(
        func_ring,
        Arc::clone(&func_store),
        Arc::clone(&filter),
        Arc::clone(&metrics),
        commit_interval,
    );
    runtime::start_packet_listener(
        packet_ring,
        Arc::clone(&packet_store),
        Arc::clone(&filter),
        Arc::clone(&metrics),
        commit_interval,
    );

    // Events-per-second rollup, logged every 10 ticks.
    {
        let metrics = Arc::clone(&metrics);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            let mut ticks = 0u64;
            loop {
                interval.tick().await;
                metrics.rollup();
                ticks += 1;
                if ticks % 10 == 0 {
                    info!(
                        "metrics: events/s={} rb_overflows={} store_errors={}",
                        metrics.events_per_sec(),
                        metrics.rb_overflows(),
                        metrics.store_errors()
                    );
                }
            }
        });
    }

    // Resource monitoring loop
    {
        let runtime_cfg = config.runtime.clone();
        tokio::spawn(async move {
            use procfs::{page_size, process::Process, ticks_per_second};
            let ticks = ticks_per_second() as f64;
            let page_kb = page_size() / 1024;
            let mut prev_total = 0u64;
            loop {
                if let Ok(stat) = Process::myself().and_then(|proc| proc.stat()) {
                    let total = stat.utime + stat.stime;
                    let dt = total.saturating_sub(prev_total);
                    prev_total = total;
                    let cpu_pct = (dt as f64 / ticks) * 100.0;
                    let rss_mb = stat.rss * page_kb / 1024;
                    if cpu_pct > runtime_cfg.cpu_target_pct as f64 {
                        warn!(
                            "cpu usage {:.1}% exceeds target {}",
                            cpu_pct, runtime_cfg.cpu_target_pct
                        );
                    }
                    if rss_mb > runtime_cfg.rss_cap_mb {
                        warn!("rss {}MB exceeds cap {}", rss_mb, runtime_cfg.rss_cap_mb);
                    }
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        });
    }

    // --- Live analyser and hop locator ---
    let analyzer_context = match probes::read_latency_bytes() {
        Ok((bytes, path)) => {
            println!("[flowtraced] using latency object: {path}");
            Some(Arc::new(AnalyzerContext {
                object_bytes: bytes,
                offsets: sock_offsets,
            }))
        }
        Err(err) => {
            warn!("[flowtraced] live analyser disabled: {err}");
            None
        }
    };
    let locator = Arc::new(Locator::new(config.locator.clone()));

    // --- Surface ---
    let app_state = Arc::new(AppState {
        func_store,
        packet_store,
        filter,
        metrics,
        attach_finished,
        func_table_path: cache_dir.join("func_table.json"),
        analyzer: analyzer_context,
        locator,
    });
    let app = all_routes(app_state);
    let listener = tokio::net::TcpListener::bind(&config.http.addr).await?;
    println!("[flowtraced] HTTP server on http://{}", config.http.addr);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            eprintln!("server error: {e}");
        }
    });

    println!("[flowtraced] running. Press Ctrl+C to exit.");
    tokio::signal::ctrl_c().await?;
    println!("[flowtraced] shutting down...");
    Ok(())
}
