use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::process::Command;

/// Functions known to trip the verifier, to recurse inside the probe path,
/// or to dominate the trace without carrying flow information.
const DISABLED: &[&str] = &[
    "____sys_recvmsg",
    "___sys_recvmsg",
    "sock_recvmsg",
    "security_socket_recvmsg",
    "apparmor_socket_recvmsg",
    "unix_stream_recvmsg",
    "consume_skb",
    "__skb_datagram_iter",
    "skb_copy_datagram_iter",
    "skb_put",
    "skb_release_data",
    "skb_release_head_state",
    "kfree_skbmem",
    "skb_free_head",
    "__build_skb_around",
    "sock_def_readable",
    "skb_queue_tail",
    "sock_alloc_send_pskb",
    "skb_set_owner_w",
    "sock_wfree",
    "skb_copy_datagram_from_iter",
    "unix_scm_to_skb",
    "skb_unlink",
    "apparmor_socket_sendmsg",
    "security_socket_sendmsg",
    "security_socket_getpeersec_dgram",
    "____sys_sendmsg",
    "___sys_sendmsg",
    "unix_stream_sendmsg",
    "tcp_poll",
    "tcp_stream_memory_free",
    "lock_sock_nested",
    "tcp_release_cb",
    "map_sock_addr",
    "security_socket_getpeername",
    "inet_label_sock_perm",
    "aa_inet_sock_perm",
    "apparmor_socket_getpeername",
    "sock_do_ioctl",
    "udp_poll",
];

/// Anchor functions get dedicated probes; keep them out of the generic set.
pub const ANCHOR_NAMES: &[(&str, u64)] = &[
    ("ip_rcv_core", 200_000),
    ("ip6_rcv_core", 200_001),
    ("icmp_push_reply", 200_002),
    ("rawv6_sendmsg", 200_003),
    ("raw_sendmsg", 200_004),
    ("udp_sendmsg", 200_005),
    ("udpv6_sendmsg", 200_006),
    ("tcp_sendmsg", 200_007),
    ("ip_rcv", 300_000),
    ("ipv6_rcv", 300_001),
    ("ip_list_rcv", 300_002),
    ("ipv6_list_rcv", 300_003),
];

const KEYWORDS: &[&str] = &[
    "tcp", "udp", "icmp", "recv", "send", "xmit", "ip", "sk", "sock",
];

/// Reachability search depth through the type graph.
const MAX_DEPTH: usize = 5;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FuncRecord {
    pub id: u64,
    pub name: String,
}

#[derive(Debug, Deserialize)]
struct BtfDump {
    types: Vec<BtfNode>,
}

#[derive(Debug, Deserialize)]
pub struct BtfNode {
    id: u64,
    #[serde(default)]
    name: String,
    kind: String,
    #[serde(default)]
    type_id: Option<u64>,
    #[serde(default)]
    members: Vec<BtfEdge>,
    #[serde(default)]
    params: Vec<BtfEdge>,
}

#[derive(Debug, Deserialize)]
struct BtfEdge {
    #[serde(default)]
    name: String,
    #[serde(default)]
    type_id: Option<u64>,
    #[serde(default)]
    bits_offset: Option<u32>,
}

/// The parsed kernel type graph. Built once per startup; feeds both the
/// function discovery pass and the member-offset derivation.
pub struct BtfGraph {
    types: Vec<BtfNode>,
    index: HashMap<u64, usize>,
}

impl BtfGraph {
    pub fn parse(btf_json: &str) -> Result<Self> {
        let dump: BtfDump = serde_json::from_str(btf_json).context("malformed BTF dump")?;
        let index = dump
            .types
            .iter()
            .enumerate()
            .map(|(pos, node)| (node.id, pos))
            .collect();
        Ok(Self {
            types: dump.types,
            index,
        })
    }

    fn node(&self, id: u64) -> Option<&BtfNode> {
        self.index.get(&id).map(|pos| &self.types[*pos])
    }

    pub fn struct_by_name(&self, name: &str) -> Result<&BtfNode> {
        self.types
            .iter()
            .find(|node| node.kind == "STRUCT" && node.name == name)
            .with_context(|| format!("struct {name} not found in BTF"))
    }

    /// Bit offset of `target` inside `container`, descending into anonymous
    /// struct/union members the way the kernel nests `sock_common` pairs.
    pub fn member_bits(&self, container: &BtfNode, target: &str) -> Option<u32> {
        self.member_bits_inner(container, 0, target, 0)
    }

    fn member_bits_inner(
        &self,
        container: &BtfNode,
        base_bits: u32,
        target: &str,
        depth: usize,
    ) -> Option<u32> {
        if depth > 8 {
            return None;
        }
        for member in &container.members {
            let bits = base_bits + member.bits_offset.unwrap_or(0);
            if member.name == target {
                return Some(bits);
            }
            if member.name.is_empty() || member.name == "(anon)" {
                if let Some(inner) = member.type_id.and_then(|id| self.resolve_composite(id)) {
                    if let Some(found) = self.member_bits_inner(inner, bits, target, depth + 1) {
                        return Some(found);
                    }
                }
            }
        }
        None
    }

    /// Chase typedef/const/volatile indirection until a struct or union.
    fn resolve_composite(&self, mut type_id: u64) -> Option<&BtfNode> {
        for _ in 0..16 {
            let node = self.node(type_id)?;
            match node.kind.as_str() {
                "STRUCT" | "UNION" => return Some(node),
                "TYPEDEF" | "CONST" | "VOLATILE" | "RESTRICT" | "TYPE_TAG" => {
                    type_id = node.type_id?;
                }
                _ => return None,
            }
        }
        None
    }
}

/// Dump the kernel type graph with bpftool. A missing tool or an
/// unreadable BTF file is fatal; the whole pipeline keys off this dump.
pub fn dump_kernel_btf(cache_dir: &Path) -> Result<String> {
    let out = Command::new("bpftool")
        .args(["-j", "btf", "dump", "file", "/sys/kernel/btf/vmlinux"])
        .output()
        .context("failed to run bpftool; is it installed and are we privileged?")?;
    if !out.status.success() {
        bail!(
            "bpftool btf dump failed: {}",
            String::from_utf8_lossy(&out.stderr)
        );
    }
    let json = String::from_utf8(out.stdout).context("bpftool emitted non-UTF8 output")?;
    fs::write(cache_dir.join("btf.json"), &json).context("failed to persist btf.json")?;
    Ok(json)
}

/// Find every function with at least one parameter whose type can reach
/// `sk_buff` within MAX_DEPTH expansion passes over STRUCT-member and
/// ARRAY/PTR/CONST/VOLATILE reference edges.
pub fn related_functions(graph: &BtfGraph) -> Result<Vec<FuncRecord>> {
    let skb_id = graph.struct_by_name("sk_buff")?.id;

    let mut reachable: HashSet<u64> = HashSet::from([skb_id]);
    for _depth in 0..MAX_DEPTH {
        let mut updated = false;
        for node in &graph.types {
            if reachable.contains(&node.id) {
                continue;
            }
            let hits = match node.kind.as_str() {
                "STRUCT" => node
                    .members
                    .iter()
                    .any(|m| m.type_id.is_some_and(|id| reachable.contains(&id))),
                "ARRAY" | "VOLATILE" | "CONST" | "PTR" => {
                    node.type_id.is_some_and(|id| reachable.contains(&id))
                }
                _ => false,
            };
            if hits {
                reachable.insert(node.id);
                updated = true;
            }
        }
        if !updated {
            break;
        }
    }

    let mut funcs = Vec::new();
    for node in &graph.types {
        if node.kind != "FUNC" {
            continue;
        }
        let Some(proto) = node.type_id.and_then(|id| graph.node(id)) else {
            continue;
        };
        if proto.kind != "FUNC_PROTO" {
            continue;
        }
        if proto
            .params
            .iter()
            .any(|p| p.type_id.is_some_and(|id| reachable.contains(&id)))
        {
            funcs.push(FuncRecord {
                id: node.id,
                name: node.name.clone(),
            });
        }
    }

    if funcs.is_empty() {
        bail!("no kernel functions reference sk_buff-reachable types; BTF dump unusable");
    }
    Ok(funcs)
}

/// The subset of candidates that gets the generic entry/exit probe pair.
pub fn generic_attach_list(candidates: &[FuncRecord]) -> Vec<FuncRecord> {
    candidates
        .iter()
        .filter(|record| {
            !record.name.contains("bpf")
                && !DISABLED.contains(&record.name.as_str())
                && !ANCHOR_NAMES.iter().any(|(name, _)| *name == record.name)
                && KEYWORDS.iter().any(|kw| record.name.contains(kw))
        })
        .cloned()
        .collect()
}

/// Stable id -> {id, name} table served to the query layer, anchors included.
pub fn func_table(candidates: &[FuncRecord]) -> serde_json::Value {
    let mut table = serde_json::Map::new();
    for record in candidates {
        table.insert(
            record.id.to_string(),
            serde_json::json!({"id": record.id, "name": record.name}),
        );
    }
    for (name, id) in ANCHOR_NAMES {
        table.insert(id.to_string(), serde_json::json!({"id": id, "name": name}));
    }
    serde_json::Value::Object(table)
}

/// Persist the candidate list and the extended id map for the query layer.
pub fn write_outputs(cache_dir: &Path, candidates: &[FuncRecord]) -> Result<()> {
    let records = serde_json::to_string(candidates)?;
    fs::write(cache_dir.join("functions.json"), records)?;
    let table = serde_json::to_string(&func_table(candidates))?;
    fs::write(cache_dir.join("func_table.json"), table)?;
    Ok(())
}
