//! Durable append-only bid log.
//!
//! The warehouse is the authority for bid time: `add` persists the bid and
//! stamps it with the storage tier's commit timestamp, read back after the
//! write. Restoring replays the full log through the session-window filter,
//! which is what makes a bid whose commit time crossed a round boundary
//! disappear from the restored view even though it is in the log.

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use rand::Rng;
use rusqlite::{params, Connection};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;

use crate::engine::config::{truncate_micros, AuctionConfig};
use crate::engine::error::AuctionError;
use crate::engine::latency::DbLatencySimulator;
use crate::engine::store::{Bid, Store};
use crate::engine::TABLE_SHARDS;

const RESTORE_PAGE: usize = 1000;
const TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// Abstract bid log contract.
#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Idempotent setup (creates the shard tables when SQL-backed).
    async fn initialize(&self) -> Result<(), AuctionError>;

    /// Persist `(client, price, sequence)` and stamp `bid.time` with the
    /// server-assigned commit timestamp, truncated to microseconds.
    async fn add(&self, bid: &mut Bid) -> Result<(), AuctionError>;

    /// Persist a winning bid to the final table.
    async fn commit(&self, bid: &Bid) -> Result<(), AuctionError>;

    /// Stream the full log into `store`, applying the session-window filter.
    async fn restore(&self, store: &Store, config: &AuctionConfig) -> Result<(), AuctionError>;

    /// Release all resources.
    async fn terminate(&self);
}

/// First-round bids count only strictly inside (start, half); revisions only
/// strictly inside (half, end).
fn in_session_window(bid: &Bid, config: &AuctionConfig) -> bool {
    let Some(time) = bid.time else {
        return false;
    };
    if bid.sequence == 1 {
        time > config.start_time && time < config.half_time
    } else if bid.sequence > 1 {
        time > config.half_time && time < config.end_time
    } else {
        false
    }
}

/// Build a warehouse from the environment: `DB_DRIVER=sqlite` opens the
/// embedded store at `SQLITE_PATH`, anything else runs in memory.
pub fn warehouse_from_env(session_id: &str) -> anyhow::Result<Arc<dyn Warehouse>> {
    match std::env::var("DB_DRIVER").unwrap_or_default().as_str() {
        "sqlite" => {
            let path =
                std::env::var("SQLITE_PATH").unwrap_or_else(|_| "./tender_log.db".to_string());
            let prefix = format!("pp_{session_id}_");
            let warehouse =
                SqliteWarehouse::open(prefix, &path).context("open sqlite warehouse")?;
            Ok(Arc::new(warehouse))
        }
        _ => Ok(Arc::new(MemoryWarehouse::new())),
    }
}

/// In-memory warehouse for debugging and high-concurrency tests; SQL
/// backends rarely sustain more than 10k commits per second. Keeps its own
/// store mirror for restore and simulates commit latency so ordering races
/// stay observable.
pub struct MemoryWarehouse {
    mirror: Store,
    simulator: DbLatencySimulator,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::with_threshold(11_000 + rand::thread_rng().gen_range(0..2000))
    }

    /// Fixed simulator threshold, for tests that need a predictable gate.
    pub fn with_threshold(threshold: usize) -> Self {
        MemoryWarehouse {
            mirror: Store::new(0),
            simulator: DbLatencySimulator::new(threshold),
        }
    }

    /// Lifetime number of persisted bids.
    pub fn stored(&self) -> usize {
        self.mirror.count_bids()
    }
}

impl Default for MemoryWarehouse {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    async fn initialize(&self) -> Result<(), AuctionError> {
        Ok(())
    }

    async fn add(&self, bid: &mut Bid) -> Result<(), AuctionError> {
        self.simulator.run().await;
        bid.time = Some(truncate_micros(chrono::Utc::now()));
        self.mirror.add(bid.clone());
        Ok(())
    }

    async fn commit(&self, _bid: &Bid) -> Result<(), AuctionError> {
        Ok(())
    }

    async fn restore(&self, store: &Store, config: &AuctionConfig) -> Result<(), AuctionError> {
        for bids in self.mirror.bidder_rows() {
            for bid in bids {
                let mut replay = bid.clone();
                replay.active = true;
                if in_session_window(&replay, config) {
                    store.add(replay);
                }
            }
        }
        Ok(())
    }

    async fn terminate(&self) {}
}

/// Embedded SQL warehouse. The log is sharded into [`TABLE_SHARDS`] tables
/// `<prefix>0000..0007` keyed by `client & (TABLE_SHARDS - 1)`, plus
/// `<prefix>f` for the winning slate. The `ts` column defaults to the
/// storage clock at insert, which is read back to stamp the bid.
pub struct SqliteWarehouse {
    prefix: String,
    conn: Mutex<Connection>,
}

impl SqliteWarehouse {
    pub fn open(prefix: impl Into<String>, path: &str) -> Result<Self, AuctionError> {
        let conn = Connection::open(path).map_err(|e| {
            warn!(error = %e, path, "opening warehouse database failed");
            AuctionError::SaveConnection
        })?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();

        Ok(SqliteWarehouse {
            prefix: prefix.into(),
            conn: Mutex::new(conn),
        })
    }

    fn shard_table(&self, client: u32) -> String {
        format!("{}{:04}", self.prefix, client & (TABLE_SHARDS - 1))
    }

    fn result_table(&self) -> String {
        format!("{}f", self.prefix)
    }
}

#[async_trait]
impl Warehouse for SqliteWarehouse {
    async fn initialize(&self) -> Result<(), AuctionError> {
        let conn = self.conn.lock().await;
        let mut tables: Vec<String> = (0..TABLE_SHARDS)
            .map(|shard| format!("{}{:04}", self.prefix, shard))
            .collect();
        tables.push(self.result_table());

        for table in tables {
            conn.execute(
                &format!(
                    "CREATE TABLE IF NOT EXISTS {table} (
                        id INTEGER PRIMARY KEY AUTOINCREMENT,
                        client INTEGER NOT NULL,
                        price INTEGER NOT NULL,
                        sequence INTEGER NOT NULL,
                        ts TEXT NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%f', 'now'))
                    )"
                ),
                [],
            )
            .map_err(|e| {
                warn!(error = %e, table = %table, "creating warehouse table failed");
                AuctionError::SaveConnection
            })?;
        }
        Ok(())
    }

    async fn add(&self, bid: &mut Bid) -> Result<(), AuctionError> {
        let conn = self.conn.lock().await;
        let table = self.shard_table(bid.client);

        conn.execute(
            &format!("INSERT INTO {table} (client, price, sequence) VALUES (?1, ?2, ?3)"),
            params![bid.client, bid.price, bid.sequence],
        )
        .map_err(|e| {
            warn!(error = %e, client = bid.client, "bid insert failed");
            AuctionError::SaveInsert
        })?;

        let row_id = conn.last_insert_rowid();
        if row_id <= 0 {
            warn!(client = bid.client, "no row id after bid insert");
            return Err(AuctionError::SaveRowId);
        }

        let ts: String = conn
            .query_row(
                &format!("SELECT ts FROM {table} WHERE id = ?1 LIMIT 1"),
                [row_id],
                |row| row.get(0),
            )
            .map_err(|e| {
                warn!(error = %e, client = bid.client, "timestamp read-back failed");
                AuctionError::SaveReadBack
            })?;

        let parsed = NaiveDateTime::parse_from_str(&ts, TS_FORMAT).map_err(|e| {
            warn!(error = %e, ts = %ts, "unparseable storage timestamp");
            AuctionError::SaveTimestamp
        })?;
        bid.time = Some(truncate_micros(parsed.and_utc()));
        Ok(())
    }

    async fn commit(&self, bid: &Bid) -> Result<(), AuctionError> {
        let conn = self.conn.lock().await;
        let ts = bid
            .time
            .map(|t| t.format("%Y-%m-%d %H:%M:%S%.6f").to_string())
            .unwrap_or_default();
        conn.execute(
            &format!(
                "INSERT INTO {} (client, price, sequence, ts) VALUES (?1, ?2, ?3, ?4)",
                self.result_table()
            ),
            params![bid.client, bid.price, bid.sequence, ts],
        )
        .map_err(|e| {
            warn!(error = %e, client = bid.client, "final commit failed");
            AuctionError::SaveCommit
        })?;
        Ok(())
    }

    async fn restore(&self, store: &Store, config: &AuctionConfig) -> Result<(), AuctionError> {
        let conn = self.conn.lock().await;

        for shard in 0..TABLE_SHARDS {
            let table = format!("{}{:04}", self.prefix, shard);
            let mut last_id: i64 = 0;
            loop {
                let mut stmt = conn
                    .prepare_cached(&format!(
                        "SELECT id, client, price, sequence, ts FROM {table} \
                         WHERE id > ?1 ORDER BY id ASC LIMIT {RESTORE_PAGE}"
                    ))
                    .map_err(|e| {
                        warn!(error = %e, table = %table, "restore query failed");
                        AuctionError::SaveReadBack
                    })?;

                let rows: Vec<(i64, u32, u32, u8, String)> = stmt
                    .query_map([last_id], |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                        ))
                    })
                    .and_then(|rows| rows.collect())
                    .map_err(|e| {
                        warn!(error = %e, table = %table, "restore scan failed");
                        AuctionError::SaveReadBack
                    })?;

                let page_len = rows.len();
                for (id, client, price, sequence, ts) in rows {
                    last_id = id;
                    let parsed = NaiveDateTime::parse_from_str(&ts, TS_FORMAT).map_err(|e| {
                        warn!(error = %e, ts = %ts, "unparseable timestamp in log");
                        AuctionError::SaveTimestamp
                    })?;
                    let bid = Bid {
                        serial: 0,
                        client,
                        price,
                        time: Some(truncate_micros(parsed.and_utc())),
                        sequence,
                        active: true,
                    };
                    if in_session_window(&bid, config) {
                        store.add(bid);
                    }
                }

                if page_len < RESTORE_PAGE {
                    break;
                }
            }
        }
        Ok(())
    }

    async fn terminate(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn request(client: u32, price: u32, sequence: u8) -> Bid {
        Bid {
            serial: 0,
            client,
            price,
            time: None,
            sequence,
            active: true,
        }
    }

    fn window(start_offset: i64, half_offset: i64, end_offset: i64) -> AuctionConfig {
        let now = Utc::now();
        AuctionConfig {
            start_time: now + Duration::seconds(start_offset),
            half_time: now + Duration::seconds(half_offset),
            end_time: now + Duration::seconds(end_offset),
            capacity: 0,
            warning_price: 0,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn memory_add_stamps_time_and_mirrors() {
        let warehouse = MemoryWarehouse::with_threshold(44_000);
        let mut bid = request(1, 5, 1);
        warehouse.add(&mut bid).await.unwrap();

        let time = bid.time.expect("commit time assigned");
        assert_eq!(truncate_micros(time), time);
        assert_eq!(warehouse.stored(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn memory_restore_applies_session_window() {
        let warehouse = MemoryWarehouse::with_threshold(44_000);
        let mut opening = request(1, 5, 1);
        warehouse.add(&mut opening).await.unwrap();
        let mut revision = request(2, 6, 2);
        warehouse.add(&mut revision).await.unwrap();

        // Both commit times fall in the first-round window: only the
        // opening bid survives the replay.
        let store = Store::new(0);
        warehouse
            .restore(&store, &window(-60, 60, 120))
            .await
            .unwrap();
        assert_eq!(store.count_bids(), 1);
        assert_eq!(store.last_bid(1).unwrap().price, 5);

        // Shift the boundary before both commits: now only the revision is
        // inside its window.
        let store = Store::new(0);
        warehouse
            .restore(&store, &window(-120, -60, 60))
            .await
            .unwrap();
        assert_eq!(store.count_bids(), 1);
        assert_eq!(store.last_bid(2).unwrap().sequence, 2);

        // Nothing in window at all.
        let store = Store::new(0);
        warehouse
            .restore(&store, &window(-240, -180, -120))
            .await
            .unwrap();
        assert_eq!(store.count_bids(), 0);
    }

    #[tokio::test]
    async fn sqlite_add_reads_back_server_timestamp() {
        let warehouse = SqliteWarehouse::open("pp_test_", ":memory:").unwrap();
        warehouse.initialize().await.unwrap();

        let before = Utc::now() - Duration::seconds(2);
        let mut bid = request(3, 7, 1);
        warehouse.add(&mut bid).await.unwrap();
        let time = bid.time.expect("commit time assigned");
        assert!(time > before);
        assert!(time < Utc::now() + Duration::seconds(2));
    }

    #[tokio::test]
    async fn sqlite_initialize_is_idempotent() {
        let warehouse = SqliteWarehouse::open("pp_test_", ":memory:").unwrap();
        warehouse.initialize().await.unwrap();
        warehouse.initialize().await.unwrap();
    }

    #[tokio::test]
    async fn sqlite_restore_replays_all_shards() {
        let warehouse = SqliteWarehouse::open("pp_test_", ":memory:").unwrap();
        warehouse.initialize().await.unwrap();

        // Clients 0..16 spread over every shard.
        for client in 0..16u32 {
            let mut bid = request(client, client % 5 + 1, 1);
            warehouse.add(&mut bid).await.unwrap();
        }

        let store = Store::new(0);
        warehouse
            .restore(&store, &window(-60, 60, 120))
            .await
            .unwrap();
        assert_eq!(store.count_bids(), 16);
        assert_eq!(store.count_bidders(), 16);

        // Out-of-window replay drops everything.
        let store = Store::new(0);
        warehouse
            .restore(&store, &window(60, 120, 180))
            .await
            .unwrap();
        assert_eq!(store.count_bids(), 0);
    }

    #[tokio::test]
    async fn sqlite_commit_writes_final_table() {
        let warehouse = SqliteWarehouse::open("pp_test_", ":memory:").unwrap();
        warehouse.initialize().await.unwrap();

        let mut bid = request(9, 4, 1);
        warehouse.add(&mut bid).await.unwrap();
        warehouse.commit(&bid).await.unwrap();

        let conn = warehouse.conn.lock().await;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM pp_test_f", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }
}
