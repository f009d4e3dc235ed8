use crate::btf_scan::{ANCHOR_NAMES, FuncRecord};
use crate::metrics::Metrics;
use anyhow::Context;
use aya::maps::{HashMap as AyaHashMap, MapData, ring_buf::RingBuf};
use aya::programs::{KProbe, SchedClassifier, tc, tc::TcAttachType};
use aya::{Ebpf, EbpfLoader, Pod};
use aya_log::EbpfLogger;
use flowtrace_ebpf_common::SockOffsets;
use log::{info, warn};
use std::collections::HashMap;
use std::path::Path;
use std::{fs, sync::Arc};

#[repr(transparent)]
#[derive(Copy, Clone)]
struct SockOffsetsPod(SockOffsets);

unsafe impl Pod for SockOffsetsPod {}

/// Keeps the loaded object (and with it every attachment) alive.
pub struct TracerRuntime {
    pub bpf: Ebpf,
    _logger: Option<EbpfLogger>,
}

/// Locate and read an eBPF object from common install/build paths.
pub fn read_bpf_object(
    env_var: &str,
    candidates: &[&str],
    err_hint: &str,
) -> anyhow::Result<(Vec<u8>, String)> {
    if let Ok(path) = std::env::var(env_var) {
        let data = fs::read(&path)?;
        return Ok((data, path));
    }
    for candidate in candidates {
        if Path::new(candidate).exists() {
            return Ok((fs::read(candidate)?, candidate.to_string()));
        }
    }
    anyhow::bail!("{}", err_hint);
}

pub fn read_tracer_bytes() -> anyhow::Result<(Vec<u8>, String)> {
    const CANDIDATES: [&str; 6] = [
        "/usr/local/share/flowtrace/flowtrace-tracer",
        "/usr/local/share/flowtrace/flowtrace-tracer.o",
        "target/bpfel-unknown-none/release/flowtrace-tracer",
        "./target/bpfel-unknown-none/release/flowtrace-tracer",
        "../target/bpfel-unknown-none/release/flowtrace-tracer",
        "target/bpf/flowtrace-tracer.o",
    ];
    read_bpf_object(
        "FLOWTRACE_BPF_PATH",
        &CANDIDATES,
        "tracer BPF object not found. Set FLOWTRACE_BPF_PATH or install to /usr/local/share/flowtrace/",
    )
}

pub fn read_latency_bytes() -> anyhow::Result<(Vec<u8>, String)> {
    const CANDIDATES: [&str; 6] = [
        "/usr/local/share/flowtrace/flowtrace-latency",
        "/usr/local/share/flowtrace/flowtrace-latency.o",
        "target/bpfel-unknown-none/release/flowtrace-latency",
        "./target/bpfel-unknown-none/release/flowtrace-latency",
        "../target/bpfel-unknown-none/release/flowtrace-latency",
        "target/bpf/flowtrace-latency.o",
    ];
    read_bpf_object(
        "FLOWTRACE_LATENCY_BPF_PATH",
        &CANDIDATES,
        "latency BPF object not found. Set FLOWTRACE_LATENCY_BPF_PATH or install to /usr/local/share/flowtrace/",
    )
}

fn attach_kprobe_internal(bpf: &mut Ebpf, program: &str, symbol: &str) -> anyhow::Result<()> {
    let probe: &mut KProbe = bpf
        .program_mut(program)
        .ok_or_else(|| anyhow::anyhow!("{program} program not found"))?
        .try_into()?;
    if let Err(err) = probe.load() {
        // Repeated load attempts after the first return an error we can
        // ignore; anything else is a real failure.
        if probe.fd().is_err() {
            return Err(err.into());
        }
    }
    probe.attach(symbol, 0)?;
    Ok(())
}

fn attach_kprobe_optional(bpf: &mut Ebpf, program: &str, symbol: &str) -> bool {
    match attach_kprobe_internal(bpf, program, symbol) {
        Ok(()) => true,
        Err(err) => {
            warn!("[flowtraced] optional kprobe {symbol} ({program}) not attached: {err:?}");
            false
        }
    }
}

/// Load the tracer object, ship the BTF offsets, fill the address->id map,
/// and attach everything: the generic pair per discovered function, the
/// anchor probes, and both classifiers per interface. Per-symbol failures
/// are warnings; only whole-object failures are fatal.
pub fn init_tracer(
    bpf_bytes: &[u8],
    offsets: SockOffsets,
    generic: &[FuncRecord],
    symbols: &HashMap<String, u64>,
    interfaces: &[String],
    metrics: &Arc<Metrics>,
) -> anyhow::Result<(TracerRuntime, RingBuf<MapData>, RingBuf<MapData>)> {
    let offsets_pod = SockOffsetsPod(offsets);
    let mut loader = EbpfLoader::new();
    loader.set_global("SOCK_OFFSETS", &offsets_pod, true);
    let mut bpf = loader.load(bpf_bytes).context("tracer object rejected")?;

    let logger = match EbpfLogger::init(&mut bpf) {
        Ok(logger) => {
            info!("[flowtraced] BPF logger initialized.");
            Some(logger)
        }
        Err(e) => {
            warn!("[flowtraced] BPF logger not active: {e}");
            None
        }
    };

    // Identity channel for the shared entry/exit pair.
    {
        let map = bpf
            .map_mut("FUNC_IDS")
            .ok_or_else(|| anyhow::anyhow!("FUNC_IDS map not found"))?;
        let mut func_ids: AyaHashMap<_, u64, u64> = AyaHashMap::try_from(map)?;
        for record in generic {
            if let Some(addr) = symbols.get(&record.name) {
                func_ids.insert(*addr, record.id, 0)?;
            }
        }
    }

    let mut attached = 0usize;
    let mut skipped = 0usize;
    for record in generic {
        if !symbols.contains_key(&record.name) {
            skipped += 1;
            continue;
        }
        let entry_ok = attach_kprobe_optional(&mut bpf, "func_enter", &record.name);
        let exit_ok = attach_kprobe_optional(&mut bpf, "func_exit", &record.name);
        if entry_ok && exit_ok {
            attached += 1;
        } else {
            skipped += 1;
        }
    }
    metrics.add_attached_probes(attached);
    metrics.add_skipped_probes(skipped);
    info!("[flowtraced] generic probes: {attached} attached, {skipped} skipped");

    for (symbol, _id) in ANCHOR_NAMES {
        let entry_prog = format!("anchor_{symbol}");
        let exit_prog = format!("anchor_{symbol}_ret");
        attach_kprobe_optional(&mut bpf, &entry_prog, symbol);
        attach_kprobe_optional(&mut bpf, &exit_prog, symbol);
    }

    for iface in interfaces {
        attach_classifiers(&mut bpf, iface);
    }

    let events = RingBuf::try_from(
        bpf.take_map("EVENTS")
            .ok_or_else(|| anyhow::anyhow!("EVENTS map not found"))?,
    )?;
    let packet_events = RingBuf::try_from(
        bpf.take_map("PACKET_EVENTS")
            .ok_or_else(|| anyhow::anyhow!("PACKET_EVENTS map not found"))?,
    )?;

    Ok((
        TracerRuntime {
            bpf,
            _logger: logger,
        },
        events,
        packet_events,
    ))
}

/// One ingress and one egress hook per interface; a pre-existing clsact
/// qdisc is fine, ours just joins it.
fn attach_classifiers(bpf: &mut Ebpf, iface: &str) {
    if let Err(err) = tc::qdisc_add_clsact(iface) {
        // Already present on busy systems.
        log::debug!("[flowtraced] clsact on {iface}: {err}");
    }
    for (program, attach_type) in [
        ("tcx_ingress", TcAttachType::Ingress),
        ("tcx_egress", TcAttachType::Egress),
    ] {
        let result = (|| -> anyhow::Result<()> {
            let prog: &mut SchedClassifier = bpf
                .program_mut(program)
                .ok_or_else(|| anyhow::anyhow!("{program} program not found"))?
                .try_into()?;
            if let Err(err) = prog.load() {
                if prog.fd().is_err() {
                    return Err(err.into());
                }
            }
            prog.attach(iface, attach_type)?;
            Ok(())
        })();
        if let Err(err) = result {
            warn!("[flowtraced] classifier {program} not attached on {iface}: {err:?}");
        }
    }
}
