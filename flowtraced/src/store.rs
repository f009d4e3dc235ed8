//! Append-only event stores.
//!
//! Two SQLite databases under the cache directory: `FunctionInfo.db` for the
//! function-call streams and `PacketInfo.db` for captured frames. Writers are
//! the ring-buffer consumers (batched, one transaction per commit tick);
//! readers are the query handlers. The only deletes happen in the clear pass.

use sqlx::{SqlitePool, sqlite::SqlitePoolOptions};
use std::path::Path;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq)]
pub struct FuncRow {
    pub time: f64,
    pub is_ret: i64,
    pub id: i64,
    pub pid: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpecRow {
    pub time: f64,
    pub is_ret: i64,
    pub id: i64,
    pub pid: i64,
    pub family: i64,
    pub srcport: i64,
    pub dstport: i64,
    pub srcip: String,
    pub dstip: String,
    pub pkt: String,
}

pub struct FunctionStore {
    pool: SqlitePool,
}

impl FunctionStore {
    pub async fn open<P: AsRef<Path>>(db_path: P) -> Result<Self, sqlx::Error> {
        let db_url = format!("sqlite://{}?mode=rwc", db_path.as_ref().display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;
        Self::from_pool(pool).await
    }

    /// A private in-memory database; the pool is capped at one connection so
    /// every handle sees the same memory instance.
    pub async fn open_memory() -> Result<Self, sqlx::Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self, sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS functionCall(time REAL, isRet INTEGER, ID INTEGER, PID INTEGER);
            CREATE TABLE IF NOT EXISTS SpecfunctionCall(
                time REAL, isRet INTEGER, ID INTEGER, PID INTEGER,
                family INTEGER, srcport INTEGER, dstport INTEGER,
                srcip TEXT, dstip TEXT, pkt TEXT
            );
            "#,
        )
        .execute(&pool)
        .await?;
        info!("function store ready");
        Ok(Self { pool })
    }

    pub async fn insert_batch(
        &self,
        calls: &[FuncRow],
        spec: &[SpecRow],
    ) -> Result<(), sqlx::Error> {
        if calls.is_empty() && spec.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for row in calls {
            sqlx::query("INSERT INTO functionCall VALUES(?, ?, ?, ?)")
                .bind(row.time)
                .bind(row.is_ret)
                .bind(row.id)
                .bind(row.pid)
                .execute(&mut *tx)
                .await?;
        }
        for row in spec {
            sqlx::query("INSERT INTO SpecfunctionCall VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)")
                .bind(row.time)
                .bind(row.is_ret)
                .bind(row.id)
                .bind(row.pid)
                .bind(row.family)
                .bind(row.srcport)
                .bind(row.dstport)
                .bind(&row.srcip)
                .bind(&row.dstip)
                .bind(&row.pkt)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        debug!("committed {} call rows, {} spec rows", calls.len(), spec.len());
        Ok(())
    }

    /// Clear pass: drop everything older than the given wall-clock time.
    pub async fn truncate_before(&self, ts: f64) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM functionCall WHERE time < ?")
            .bind(ts)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM SpecfunctionCall WHERE time < ?")
            .bind(ts)
            .execute(&self.pool)
            .await?;
        debug!("function store truncated before {ts}");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct V4PacketRow {
    pub time: f64,
    pub netif: i64,
    pub direction: i64,
    pub length: i64,
    pub content: String,
    pub srcip: String,
    pub dstip: String,
    pub srcport: i64,
    pub dstport: i64,
    pub prot: i64,
    pub ipid: i64,
    pub ttl: i64,
    pub frag: String,
    pub option: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct V6PacketRow {
    pub time: f64,
    pub netif: i64,
    pub direction: i64,
    pub length: i64,
    pub content: String,
    pub srcip: String,
    pub dstip: String,
    pub header: i64,
    pub srcport: i64,
    pub dstport: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OtherPacketRow {
    pub time: f64,
    pub netif: i64,
    pub direction: i64,
    pub length: i64,
    pub content: String,
}

pub struct PacketStore {
    pool: SqlitePool,
}

impl PacketStore {
    pub async fn open<P: AsRef<Path>>(db_path: P) -> Result<Self, sqlx::Error> {
        let db_url = format!("sqlite://{}?mode=rwc", db_path.as_ref().display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;
        Self::from_pool(pool).await
    }

    pub async fn open_memory() -> Result<Self, sqlx::Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self, sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ipv4packets(
                time REAL, netif INTEGER, direction INTEGER, length INTEGER, content TEXT,
                srcip TEXT, dstip TEXT, srcport INTEGER, dstport INTEGER,
                prot INTEGER, ipid INTEGER, ttl INTEGER, frag TEXT, option TEXT
            );
            CREATE TABLE IF NOT EXISTS ipv6packets(
                time REAL, netif INTEGER, direction INTEGER, length INTEGER, content TEXT,
                srcip TEXT, dstip TEXT, header INTEGER, srcport INTEGER, dstport INTEGER
            );
            CREATE TABLE IF NOT EXISTS otherpackets(
                time REAL, netif INTEGER, direction INTEGER, length INTEGER, content TEXT
            );
            "#,
        )
        .execute(&pool)
        .await?;
        info!("packet store ready");
        Ok(Self { pool })
    }

    pub async fn insert_batch(
        &self,
        v4: &[V4PacketRow],
        v6: &[V6PacketRow],
        other: &[OtherPacketRow],
    ) -> Result<(), sqlx::Error> {
        if v4.is_empty() && v6.is_empty() && other.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for row in v4 {
            sqlx::query(
                "INSERT INTO ipv4packets VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(row.time)
            .bind(row.netif)
            .bind(row.direction)
            .bind(row.length)
            .bind(&row.content)
            .bind(&row.srcip)
            .bind(&row.dstip)
            .bind(row.srcport)
            .bind(row.dstport)
            .bind(row.prot)
            .bind(row.ipid)
            .bind(row.ttl)
            .bind(&row.frag)
            .bind(&row.option)
            .execute(&mut *tx)
            .await?;
        }
        for row in v6 {
            sqlx::query("INSERT INTO ipv6packets VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)")
                .bind(row.time)
                .bind(row.netif)
                .bind(row.direction)
                .bind(row.length)
                .bind(&row.content)
                .bind(&row.srcip)
                .bind(&row.dstip)
                .bind(row.header)
                .bind(row.srcport)
                .bind(row.dstport)
                .execute(&mut *tx)
                .await?;
        }
        for row in other {
            sqlx::query("INSERT INTO otherpackets VALUES(?, ?, ?, ?, ?)")
                .bind(row.time)
                .bind(row.netif)
                .bind(row.direction)
                .bind(row.length)
                .bind(&row.content)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        debug!(
            "committed {} v4, {} v6, {} other packet rows",
            v4.len(),
            v6.len(),
            other.len()
        );
        Ok(())
    }

    pub async fn truncate_before(&self, ts: f64) -> Result<(), sqlx::Error> {
        for table in ["ipv4packets", "ipv6packets", "otherpackets"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE time < ?"))
                .bind(ts)
                .execute(&self.pool)
                .await?;
        }
        debug!("packet store truncated before {ts}");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
