use serde_json::{Value, json};
use std::fs;
use std::time::{SystemTime, UNIX_EPOCH};

/// Snapshot every socket table the kernel exposes through procfs, shaped as
/// `{table: [[time, id, "ip:port", "ip:port", "NN(STATE)"], ...]}` plus the
/// interface list under `dev`.
pub fn list_all() -> Value {
    let now = epoch_secs();
    json!({
        "tcpipv4": snapshot_table("/proc/net/tcp", false, now),
        "tcpipv6": snapshot_table("/proc/net/tcp6", true, now),
        "udpipv4": snapshot_table("/proc/net/udp", false, now),
        "udpipv6": snapshot_table("/proc/net/udp6", true, now),
        "icmpipv4": snapshot_table("/proc/net/icmp", false, now),
        "icmpipv6": snapshot_table("/proc/net/icmp6", true, now),
        "rawipv4": snapshot_table("/proc/net/raw", false, now),
        "rawipv6": snapshot_table("/proc/net/raw6", true, now),
        "dev": device_rows(now),
    })
}

/// Interface names from `/proc/net/dev`, also used by the packet prober to
/// decide where to hang its classifiers.
pub fn device_names() -> Vec<String> {
    let Ok(raw) = fs::read_to_string("/proc/net/dev") else {
        return Vec::new();
    };
    parse_device_names(&raw)
}

fn device_rows(now: f64) -> Vec<Value> {
    device_names()
        .into_iter()
        .map(|name| json!([now, name]))
        .collect()
}

fn parse_device_names(raw: &str) -> Vec<String> {
    raw.lines()
        .skip(2)
        .filter_map(|line| line.split_whitespace().next())
        .map(|field| field.trim_end_matches(':').to_string())
        .collect()
}

fn snapshot_table(path: &str, v6: bool, now: f64) -> Vec<Value> {
    let Ok(raw) = fs::read_to_string(path) else {
        return Vec::new();
    };
    raw.lines()
        .skip(1)
        .filter_map(|line| parse_socket_row(line, v6, now))
        .collect()
}

fn parse_socket_row(line: &str, v6: bool, now: f64) -> Option<Value> {
    let mut fields = line.split_whitespace();
    let slot = fields.next()?.trim_end_matches(':').to_string();
    let local = fields.next()?;
    let remote = fields.next()?;
    let state = u8::from_str_radix(fields.next()?, 16).ok()?;

    let decode = if v6 { decode_v6_endpoint } else { decode_v4_endpoint };
    Some(json!([
        now,
        slot,
        decode(local)?,
        decode(remote)?,
        state_label(state),
    ]))
}

/// procfs stores the v4 address as a little-endian hex u32.
fn decode_v4_endpoint(raw: &str) -> Option<String> {
    let (addr, port) = raw.split_once(':')?;
    if addr.len() != 8 {
        return None;
    }
    let value = u32::from_str_radix(addr, 16).ok()?;
    let octets = value.to_le_bytes();
    let port = u16::from_str_radix(port, 16).ok()?;
    Some(format!(
        "{}.{}.{}.{}:{}",
        octets[0], octets[1], octets[2], octets[3], port
    ))
}

/// The v6 form keeps the kernel's 32-digit grouping; presentation matches
/// the snapshot format, not RFC 5952 compression.
fn decode_v6_endpoint(raw: &str) -> Option<String> {
    let (addr, port) = raw.split_once(':')?;
    if addr.len() != 32 {
        return None;
    }
    let port = u16::from_str_radix(port, 16).ok()?;
    let groups: Vec<String> = (0..8)
        .map(|i| addr[i * 4..i * 4 + 4].to_lowercase())
        .collect();
    Some(format!("{}:{}", groups.join(":"), port))
}

/// Kernel numeric TCP states, rendered the way the snapshot consumers expect.
fn state_label(state: u8) -> String {
    let name = match state {
        1 => "ESTABLISHED",
        2 => "SYN_SENT",
        3 => "SYN_RECV",
        4 => "FIN_WAIT1",
        5 => "FIN_WAIT2",
        6 => "TIME_WAIT",
        7 => "CLOSE",
        8 => "CLOSE_WAIT",
        9 => "LAST_ACK",
        10 => "LISTEN",
        11 => "CLOSING",
        _ => return format!("{state}(UNDEFINED)"),
    };
    format!("{state:02X}({name})")
}

fn epoch_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_v4_endpoint_little_endian() {
        // 0100007F is 127.0.0.1; 4E23 is port 20003
        assert_eq!(
            decode_v4_endpoint("0100007F:4E23").as_deref(),
            Some("127.0.0.1:20003")
        );
        assert!(decode_v4_endpoint("BAD").is_none());
    }

    #[test]
    fn decodes_v6_endpoint_grouped() {
        let raw = "00000000000000000000000001000000:0035";
        assert_eq!(
            decode_v6_endpoint(raw).as_deref(),
            Some("0000:0000:0000:0000:0000:0000:0100:0000:53")
        );
    }

    #[test]
    fn parses_a_proc_net_tcp_row() {
        let line = "   0: 0100007F:4E23 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 12345 1 0000000000000000 100 0 0 10 0";
        let row = parse_socket_row(line, false, 1.0).unwrap();
        let cols = row.as_array().unwrap();
        assert_eq!(cols[1], "0");
        assert_eq!(cols[2], "127.0.0.1:20003");
        assert_eq!(cols[3], "0.0.0.0:0");
        assert_eq!(cols[4], "0A(LISTEN)");
    }

    #[test]
    fn unknown_state_is_labelled() {
        assert_eq!(state_label(12), "12(UNDEFINED)");
        assert_eq!(state_label(1), "01(ESTABLISHED)");
    }

    #[test]
    fn device_names_skip_header() {
        let raw = "\
Inter-|   Receive                                                |  Transmit
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
    lo: 1234       10    0    0    0     0          0         0     1234      10    0    0    0     0       0          0
  ens33: 5678       20    0    0    0     0          0         0     5678      20    0    0    0     0       0          0
";
        assert_eq!(parse_device_names(raw), vec!["lo", "ens33"]);
    }
}
