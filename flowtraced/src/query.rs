//! Traversal reconstruction and packet queries.
//!
//! A traversal is rebuilt purely from the stores: pick an anchor entry
//! matching the flow, bracket it with the right exit event on the same task,
//! then collect every function row inside the bracket. Ties resolve
//! latest-before / earliest-after; a traversal whose exit never arrived
//! (task killed mid-flight) is omitted rather than reported broken.

use serde_json::{Value, json};
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};

/// One persisted function event: (time, isRet, ID, PID). Serialized as a
/// JSON array, matching the wire shape the surface exposes.
pub type FuncTuple = (f64, i64, i64, i64);

pub type Traversal = Vec<FuncTuple>;

const RECV_ANCHORS: &str = "(200000, 200001)";
const SEND_ANCHORS: &str = "(200002, 200003, 200004, 200005, 200006, 200007)";

fn func_tuple(row: &SqliteRow) -> FuncTuple {
    (
        row.get("time"),
        row.get("isRet"),
        row.get("ID"),
        row.get("PID"),
    )
}

/// Receive direction: the transport anchor names the flow, the latest
/// link-layer anchor before it on the same task opens the bracket, and that
/// anchor's exit closes it.
pub async fn query_func_recv(
    pool: &SqlitePool,
    srcport: i64,
    dstport: i64,
    srcip: &str,
    dstip: &str,
) -> Result<Vec<Traversal>, sqlx::Error> {
    let anchors = sqlx::query(&format!(
        "SELECT * FROM SpecfunctionCall WHERE ID in {RECV_ANCHORS} \
         AND srcport = ? AND dstport = ? AND srcip = ? AND dstip = ? ORDER BY time"
    ))
    .bind(srcport)
    .bind(dstport)
    .bind(srcip)
    .bind(dstip)
    .fetch_all(pool)
    .await?;

    let mut dataset = Vec::new();
    for anchor in &anchors {
        let (t_s, _, _, pid) = func_tuple(anchor);
        if let Some(traversal) = recv_traversal(pool, t_s, pid).await? {
            dataset.push(traversal);
        }
    }
    Ok(dataset)
}

async fn recv_traversal(
    pool: &SqlitePool,
    t_s: f64,
    pid: i64,
) -> Result<Option<Traversal>, sqlx::Error> {
    // Latest link-layer anchor before the transport anchor wins.
    let Some(link) = sqlx::query(
        "SELECT * FROM SpecfunctionCall WHERE ID > 299999 AND PID = ? AND time < ? \
         ORDER BY time DESC LIMIT 1",
    )
    .bind(pid)
    .bind(t_s)
    .fetch_optional(pool)
    .await?
    else {
        return Ok(None);
    };
    let (t_r, _, link_id, pid) = func_tuple(&link);

    bracketed_rows(pool, t_r, link_id, pid).await
}

/// Send direction: the transport anchor both names the flow and opens the
/// bracket; its own exit closes it.
pub async fn query_func_send(
    pool: &SqlitePool,
    srcport: i64,
    dstport: i64,
    srcip: &str,
    dstip: &str,
) -> Result<Vec<Traversal>, sqlx::Error> {
    let anchors = sqlx::query(&format!(
        "SELECT * FROM SpecfunctionCall WHERE ID in {SEND_ANCHORS} \
         AND srcport = ? AND dstport = ? AND srcip = ? AND dstip = ? ORDER BY time"
    ))
    .bind(srcport)
    .bind(dstport)
    .bind(srcip)
    .bind(dstip)
    .fetch_all(pool)
    .await?;

    let mut dataset = Vec::new();
    for anchor in &anchors {
        let (t_s, _, id, pid) = func_tuple(anchor);
        if let Some(traversal) = bracketed_rows(pool, t_s, id, pid).await? {
            dataset.push(traversal);
        }
    }
    Ok(dataset)
}

/// Earliest exit of (id, pid) after t_start closes the bracket; everything
/// that task did inside [t_start, t_end] is the traversal.
async fn bracketed_rows(
    pool: &SqlitePool,
    t_start: f64,
    id: i64,
    pid: i64,
) -> Result<Option<Traversal>, sqlx::Error> {
    let Some(exit) = sqlx::query(
        "SELECT * FROM functionCall WHERE time > ? AND isRet = 1 AND ID = ? AND PID = ? \
         ORDER BY time ASC LIMIT 1",
    )
    .bind(t_start)
    .bind(id)
    .bind(pid)
    .fetch_optional(pool)
    .await?
    else {
        return Ok(None);
    };
    let (t_end, _, _, _) = func_tuple(&exit);

    let rows = sqlx::query(
        "SELECT * FROM functionCall WHERE time >= ? AND time <= ? AND PID = ? ORDER BY time",
    )
    .bind(t_start)
    .bind(t_end)
    .bind(pid)
    .fetch_all(pool)
    .await?;
    Ok(Some(rows.iter().map(|row| func_tuple(row)).collect()))
}

/// Last `limit` traversals whose anchor landed after `since`, newest first.
/// Returns `[recv, send]`.
pub async fn recent_maps(
    pool: &SqlitePool,
    srcport: i64,
    dstport: i64,
    srcip: &str,
    dstip: &str,
    limit: usize,
    since: f64,
) -> Result<(Vec<Traversal>, Vec<Traversal>), sqlx::Error> {
    let recv_anchors = recent_anchor_rows(
        pool, RECV_ANCHORS, srcport, dstport, srcip, dstip, since,
    )
    .await?;
    let mut recv = Vec::new();
    for (t_s, _, _, pid) in recv_anchors.into_iter().take(limit) {
        if let Some(traversal) = recv_traversal(pool, t_s, pid).await? {
            recv.push(traversal);
        }
    }

    let send_anchors = recent_anchor_rows(
        pool, SEND_ANCHORS, srcport, dstport, srcip, dstip, since,
    )
    .await?;
    let mut send = Vec::new();
    for (t_s, _, id, pid) in send_anchors.into_iter().take(limit) {
        if let Some(traversal) = bracketed_rows(pool, t_s, id, pid).await? {
            send.push(traversal);
        }
    }
    Ok((recv, send))
}

async fn recent_anchor_rows(
    pool: &SqlitePool,
    id_set: &str,
    srcport: i64,
    dstport: i64,
    srcip: &str,
    dstip: &str,
    since: f64,
) -> Result<Vec<FuncTuple>, sqlx::Error> {
    let rows = sqlx::query(&format!(
        "SELECT * FROM SpecfunctionCall WHERE ID in {id_set} AND time > ? AND \
         ((srcport = ? AND dstport = ? AND srcip = ? AND dstip = ?) OR \
          (srcport = ? AND dstport = ? AND srcip = ? AND dstip = ?)) \
         ORDER BY time DESC"
    ))
    .bind(since)
    .bind(srcport)
    .bind(dstport)
    .bind(srcip)
    .bind(dstip)
    .bind(dstport)
    .bind(srcport)
    .bind(dstip)
    .bind(srcip)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(|row| func_tuple(row)).collect())
}

/// Every captured frame matching the tuple in either direction, from the
/// table selected by IP version. Rows mirror the table columns.
pub async fn query_packets(
    pool: &SqlitePool,
    srcport: i64,
    dstport: i64,
    srcip: &str,
    dstip: &str,
    ipver: u8,
) -> Result<Vec<Value>, sqlx::Error> {
    packet_rows(pool, srcport, dstport, srcip, dstip, ipver, 0.0, None).await
}

/// Recent-N packets: anchor time window plus a row cap, newest first.
pub async fn recent_packets(
    pool: &SqlitePool,
    srcport: i64,
    dstport: i64,
    srcip: &str,
    dstip: &str,
    ipver: u8,
    limit: usize,
    since: f64,
) -> Result<Vec<Value>, sqlx::Error> {
    packet_rows(
        pool,
        srcport,
        dstport,
        srcip,
        dstip,
        ipver,
        since,
        Some(limit),
    )
    .await
}

#[allow(clippy::too_many_arguments)]
async fn packet_rows(
    pool: &SqlitePool,
    srcport: i64,
    dstport: i64,
    srcip: &str,
    dstip: &str,
    ipver: u8,
    since: f64,
    limit: Option<usize>,
) -> Result<Vec<Value>, sqlx::Error> {
    let table = if ipver == 6 { "ipv6packets" } else { "ipv4packets" };
    let order = if limit.is_some() { "DESC" } else { "ASC" };
    let limit_clause = match limit {
        Some(n) => format!("LIMIT {n}"),
        None => String::new(),
    };
    let rows = sqlx::query(&format!(
        "SELECT * FROM {table} WHERE time > ? AND \
         ((srcport = ? AND dstport = ? AND srcip = ? AND dstip = ?) OR \
          (srcport = ? AND dstport = ? AND srcip = ? AND dstip = ?)) \
         ORDER BY time {order} {limit_clause}"
    ))
    .bind(since)
    .bind(srcport)
    .bind(dstport)
    .bind(srcip)
    .bind(dstip)
    .bind(dstport)
    .bind(srcport)
    .bind(dstip)
    .bind(srcip)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| {
            if ipver == 6 {
                json!([
                    row.get::<f64, _>("time"),
                    row.get::<i64, _>("netif"),
                    row.get::<i64, _>("direction"),
                    row.get::<i64, _>("length"),
                    row.get::<String, _>("content"),
                    row.get::<String, _>("srcip"),
                    row.get::<String, _>("dstip"),
                    row.get::<i64, _>("header"),
                    row.get::<i64, _>("srcport"),
                    row.get::<i64, _>("dstport"),
                ])
            } else {
                json!([
                    row.get::<f64, _>("time"),
                    row.get::<i64, _>("netif"),
                    row.get::<i64, _>("direction"),
                    row.get::<i64, _>("length"),
                    row.get::<String, _>("content"),
                    row.get::<String, _>("srcip"),
                    row.get::<String, _>("dstip"),
                    row.get::<i64, _>("srcport"),
                    row.get::<i64, _>("dstport"),
                    row.get::<i64, _>("prot"),
                    row.get::<i64, _>("ipid"),
                    row.get::<i64, _>("ttl"),
                    row.get::<String, _>("frag"),
                    row.get::<String, _>("option"),
                ])
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{FuncRow, FunctionStore, PacketStore, SpecRow, V4PacketRow};

    fn call(time: f64, is_ret: i64, id: i64, pid: i64) -> FuncRow {
        FuncRow {
            time,
            is_ret,
            id,
            pid,
        }
    }

    fn spec(time: f64, id: i64, pid: i64) -> SpecRow {
        SpecRow {
            time,
            is_ret: 0,
            id,
            pid,
            family: 4,
            srcport: 45290,
            dstport: 43483,
            srcip: "127.0.0.1".into(),
            dstip: "127.0.0.1".into(),
            pkt: String::new(),
        }
    }

    fn link_spec(time: f64, id: i64, pid: i64) -> SpecRow {
        SpecRow {
            family: 0,
            srcport: 0,
            dstport: 0,
            srcip: String::new(),
            dstip: String::new(),
            ..spec(time, id, pid)
        }
    }

    /// One send traversal: tcp_sendmsg entry at 10.0, inner calls, exit 10.5.
    async fn seed_send(store: &FunctionStore) {
        let calls = vec![
            call(10.0, 0, 200_007, 7),
            call(10.1, 0, 42, 7),
            call(10.2, 1, 42, 7),
            call(10.5, 1, 200_007, 7),
            // Unrelated task interleaved in the same window.
            call(10.3, 0, 42, 8),
        ];
        let specs = vec![spec(10.0, 200_007, 7)];
        store.insert_batch(&calls, &specs).await.unwrap();
    }

    /// One receive traversal: ip_rcv at 20.0 .. exit 20.9 bracketing the
    /// ip_rcv_core anchor at 20.4.
    async fn seed_recv(store: &FunctionStore) {
        let calls = vec![
            call(20.0, 0, 300_000, 9),
            call(20.2, 0, 55, 9),
            call(20.3, 1, 55, 9),
            call(20.4, 0, 200_000, 9),
            call(20.6, 1, 200_000, 9),
            call(20.9, 1, 300_000, 9),
            call(21.5, 0, 55, 9),
        ];
        let specs = vec![link_spec(20.0, 300_000, 9), spec(20.4, 200_000, 9)];
        store.insert_batch(&calls, &specs).await.unwrap();
    }

    #[tokio::test]
    async fn send_traversal_is_bracketed_by_anchor_exit() {
        let store = FunctionStore::open_memory().await.unwrap();
        seed_send(&store).await;

        let result = query_func_send(store.pool(), 45290, 43483, "127.0.0.1", "127.0.0.1")
            .await
            .unwrap();
        assert_eq!(result.len(), 1);
        let traversal = &result[0];
        assert_eq!(traversal.first().unwrap().2, 200_007);
        assert_eq!(traversal.last().unwrap().2, 200_007);
        assert_eq!(traversal.last().unwrap().1, 1);
        // Same pid throughout, strictly increasing times.
        assert!(traversal.iter().all(|row| row.3 == 7));
        assert!(traversal.windows(2).all(|w| w[0].0 < w[1].0));
    }

    #[tokio::test]
    async fn recv_traversal_starts_at_link_anchor() {
        let store = FunctionStore::open_memory().await.unwrap();
        seed_recv(&store).await;

        let result = query_func_recv(store.pool(), 45290, 43483, "127.0.0.1", "127.0.0.1")
            .await
            .unwrap();
        assert_eq!(result.len(), 1);
        let traversal = &result[0];
        assert_eq!(traversal.first().unwrap().2, 300_000);
        assert_eq!(traversal.last().unwrap(), &(20.9, 1, 300_000, 9));
        // The row at 21.5 is outside the bracket.
        assert!(traversal.iter().all(|row| row.0 <= 20.9));
    }

    #[tokio::test]
    async fn missing_exit_omits_the_traversal() {
        let store = FunctionStore::open_memory().await.unwrap();
        // Anchor entry with no exit event at all.
        store
            .insert_batch(&[call(30.0, 0, 200_007, 5)], &[spec(30.0, 200_007, 5)])
            .await
            .unwrap();

        let result = query_func_send(store.pool(), 45290, 43483, "127.0.0.1", "127.0.0.1")
            .await
            .unwrap();
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn empty_store_yields_empty_list() {
        let store = FunctionStore::open_memory().await.unwrap();
        let result = query_func_recv(store.pool(), 1, 2, "10.0.0.1", "10.0.0.2")
            .await
            .unwrap();
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn repeated_query_with_no_new_traffic_is_stable() {
        let store = FunctionStore::open_memory().await.unwrap();
        seed_send(&store).await;
        let first = query_func_send(store.pool(), 45290, 43483, "127.0.0.1", "127.0.0.1")
            .await
            .unwrap();
        let second = query_func_send(store.pool(), 45290, 43483, "127.0.0.1", "127.0.0.1")
            .await
            .unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn recent_maps_respects_window_and_limit() {
        let store = FunctionStore::open_memory().await.unwrap();
        seed_send(&store).await;
        seed_recv(&store).await;

        let (recv, send) = recent_maps(
            store.pool(),
            45290,
            43483,
            "127.0.0.1",
            "127.0.0.1",
            5,
            0.0,
        )
        .await
        .unwrap();
        assert_eq!(recv.len(), 1);
        assert_eq!(send.len(), 1);

        // A window after everything returns nothing.
        let (recv, send) = recent_maps(
            store.pool(),
            45290,
            43483,
            "127.0.0.1",
            "127.0.0.1",
            5,
            100.0,
        )
        .await
        .unwrap();
        assert!(recv.is_empty() && send.is_empty());
    }

    fn v4row(time: f64, srcport: i64, dstport: i64, srcip: &str, dstip: &str) -> V4PacketRow {
        V4PacketRow {
            time,
            netif: 0,
            direction: 1,
            length: 60,
            content: "00".into(),
            srcip: srcip.into(),
            dstip: dstip.into(),
            srcport,
            dstport,
            prot: 6,
            ipid: 0,
            ttl: 64,
            frag: "0000".into(),
            option: String::new(),
        }
    }

    #[tokio::test]
    async fn packet_query_matches_forward_and_reverse() {
        let store = PacketStore::open_memory().await.unwrap();
        let rows = vec![
            v4row(1.0, 45290, 43483, "127.0.0.1", "127.0.0.1"),
            v4row(2.0, 43483, 45290, "127.0.0.1", "127.0.0.1"),
            v4row(3.0, 1234, 80, "10.0.0.1", "10.0.0.2"),
        ];
        store.insert_batch(&rows, &[], &[]).await.unwrap();

        let result = query_packets(store.pool(), 45290, 43483, "127.0.0.1", "127.0.0.1", 4)
            .await
            .unwrap();
        assert_eq!(result.len(), 2);

        let recent = recent_packets(
            store.pool(),
            45290,
            43483,
            "127.0.0.1",
            "127.0.0.1",
            4,
            1,
            0.0,
        )
        .await
        .unwrap();
        assert_eq!(recent.len(), 1);
        // Newest first.
        assert_eq!(recent[0][0], 2.0);
    }

    #[tokio::test]
    async fn filter_mismatch_returns_empty_packets() {
        let store = PacketStore::open_memory().await.unwrap();
        store
            .insert_batch(
                &[v4row(1.0, 1, 2, "127.0.0.1", "127.0.0.1")],
                &[],
                &[],
            )
            .await
            .unwrap();
        let result = query_packets(store.pool(), 9, 9, "8.8.8.8", "8.8.4.4", 4)
            .await
            .unwrap();
        assert!(result.is_empty());
    }
}
