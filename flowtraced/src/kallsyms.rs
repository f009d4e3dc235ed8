use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fs;

const KALLSYMS_PATH: &str = "/proc/kallsyms";

/// Resolve kernel text symbols to addresses. The generic entry/exit probes
/// are shared across every traced function, so the address is the only
/// identity the kernel side can hand back; this map feeds `FUNC_IDS`.
pub fn load_text_symbols() -> Result<HashMap<String, u64>> {
    let raw = fs::read_to_string(KALLSYMS_PATH)
        .with_context(|| format!("failed to read {KALLSYMS_PATH} (need root)"))?;
    let map = parse_text_symbols(&raw);
    if map.is_empty() || map.values().all(|addr| *addr == 0) {
        // kptr_restrict hides addresses from unprivileged readers.
        anyhow::bail!("kallsyms yielded no usable addresses; check kptr_restrict and privileges");
    }
    Ok(map)
}

fn parse_text_symbols(raw: &str) -> HashMap<String, u64> {
    let mut map = HashMap::new();
    for line in raw.lines() {
        let mut parts = line.split_whitespace();
        let (Some(addr), Some(kind), Some(name)) = (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        if kind != "T" && kind != "t" {
            continue;
        }
        // Module symbols carry a trailing "[module]"; in-tree text only.
        if parts.next().is_some() {
            continue;
        }
        let Ok(addr) = u64::from_str_radix(addr, 16) else {
            continue;
        };
        // Duplicate names exist (static functions); the first wins, which is
        // also what a kprobe on the bare name attaches to.
        map.entry(name.to_string()).or_insert(addr);
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_text_symbols_only() {
        let raw = "\
ffffffff81000000 T _text
ffffffff81234560 T tcp_sendmsg
ffffffff81234570 t ip_rcv_core
ffffffff81234580 D some_data
ffffffff81234590 T in_module_sym\t[nf_tables]
not-an-addr T broken
";
        let map = parse_text_symbols(raw);
        assert_eq!(map.get("tcp_sendmsg"), Some(&0xffffffff81234560));
        assert_eq!(map.get("ip_rcv_core"), Some(&0xffffffff81234570));
        assert!(!map.contains_key("some_data"));
        assert!(!map.contains_key("in_module_sym"));
        assert!(!map.contains_key("broken"));
    }

    #[test]
    fn first_duplicate_wins() {
        let raw = "\
ffffffff81000010 t dup_sym
ffffffff81000020 t dup_sym
";
        let map = parse_text_symbols(raw);
        assert_eq!(map.get("dup_sym"), Some(&0xffffffff81000010));
    }
}
