use crate::btf_scan::{BtfGraph, BtfNode};
use anyhow::{Result, anyhow};
use flowtrace_ebpf_common::SockOffsets;

/// Derive the `sock_common` / `sk_buff` / `socket` member offsets the probe
/// programs read through. Kernel layouts differ per build; resolving them
/// from BTF at startup and shipping them into the object's .bss keeps the
/// probes portable without recompilation.
pub fn derive_sock_offsets(graph: &BtfGraph) -> Result<SockOffsets> {
    let sock = graph.struct_by_name("sock")?;
    let sock_common = graph.struct_by_name("sock_common")?;
    let sk_buff = graph.struct_by_name("sk_buff")?;
    let socket = graph.struct_by_name("socket")?;

    let mut offsets = SockOffsets::zeroed();
    offsets.sk_common_offset = byte_offset(graph, sock, "__sk_common")?;
    offsets.skc_family_offset = byte_offset(graph, sock_common, "skc_family")?;
    offsets.skc_daddr_offset = byte_offset(graph, sock_common, "skc_daddr")?;
    offsets.skc_rcv_saddr_offset = byte_offset(graph, sock_common, "skc_rcv_saddr")?;
    offsets.skc_dport_offset = byte_offset(graph, sock_common, "skc_dport")?;
    offsets.skc_num_offset = byte_offset(graph, sock_common, "skc_num")?;
    offsets.skc_v6_daddr_offset = byte_offset(graph, sock_common, "skc_v6_daddr")?;
    offsets.skc_v6_rcv_saddr_offset = byte_offset(graph, sock_common, "skc_v6_rcv_saddr")?;
    offsets.skb_data_offset = byte_offset(graph, sk_buff, "data")?;
    offsets.skb_head_offset = byte_offset(graph, sk_buff, "head")?;
    offsets.skb_len_offset = byte_offset(graph, sk_buff, "len")?;
    offsets.skb_network_header_offset = byte_offset(graph, sk_buff, "network_header")?;
    offsets.skb_transport_header_offset = byte_offset(graph, sk_buff, "transport_header")?;
    offsets.socket_sk_offset = byte_offset(graph, socket, "sk")?;
    Ok(offsets)
}

fn byte_offset(graph: &BtfGraph, container: &BtfNode, member: &str) -> Result<u32> {
    let bits = graph
        .member_bits(container, member)
        .ok_or_else(|| anyhow!("member {member} not found"))?;
    to_bytes(bits)
}

fn to_bytes(bits: u32) -> Result<u32> {
    if bits % 8 == 0 {
        Ok(bits / 8)
    } else {
        Err(anyhow!("member offset {bits} is not byte aligned"))
    }
}
