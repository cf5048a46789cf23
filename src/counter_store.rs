//! Counter Store (C1)
//!
//! Durable, concurrently-updated exposure/conversion counters backed by
//! Redis hashes, keyed `stats:{datafile}:{feature}:{variant}` (spec §4.1,
//! §6). Increments are atomic `HINCRBY`s; weight writes are a single
//! atomic `HSET` of `weight` + `last_updated` that never touches the
//! counts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_redis::{Config as PoolConfig, Pool, Runtime};
use redis::AsyncCommands;

use crate::config::RedisConfig;
use crate::error::{OptimizerError, Result};
use crate::types::{CounterSnapshot, VariantKey};

const FIELD_EXPOSURES: &str = "exposures";
const FIELD_CONVERSIONS: &str = "conversions";
const FIELD_WEIGHT: &str = "weight";
const FIELD_LAST_UPDATED: &str = "last_updated";

/// The durable counter store contract. A trait so recalculation and server
/// logic can be exercised in tests against an in-memory stand-in without a
/// live Redis instance.
#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn incr_exposure(&self, key: &VariantKey) -> Result<()>;
    async fn incr_conversion(&self, key: &VariantKey) -> Result<()>;
    async fn get_counters(&self, key: &VariantKey) -> Result<CounterSnapshot>;
    async fn set_weight(&self, key: &VariantKey, weight: f64, ts: DateTime<Utc>) -> Result<()>;
    /// Enumerate every `stats:*` key. May miss keys created mid-scan or
    /// return duplicates; callers deduplicate (spec §4.1).
    async fn list_keys(&self) -> Result<Vec<String>>;
    /// Best-effort distributed lock for the recalculation cycle. Returns
    /// `true` if the lock was acquired.
    async fn try_acquire_recalc_lock(&self, ttl_secs: u64) -> Result<bool>;
    async fn release_recalc_lock(&self) -> Result<()>;
}

/// Redis-backed implementation, pooled via `deadpool-redis`.
pub struct RedisCounterStore {
    pool: Pool,
}

impl RedisCounterStore {
    pub fn connect(config: &RedisConfig) -> Result<Self> {
        let pool_config = PoolConfig::from_url(config.url());
        let pool = pool_config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| OptimizerError::config(format!("failed to build redis pool: {e}")))?;
        Ok(Self { pool })
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| OptimizerError::Store(format!("redis pool exhausted/unreachable: {e}")))
    }

    /// Round-trips a `PING` to confirm the store is actually reachable.
    /// `connect()` only builds a pool and never opens a socket, so boot-time
    /// reachability checks must call this explicitly (spec §6, §7).
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await.map_err(OptimizerError::from)?;
        Ok(())
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn incr_exposure(&self, key: &VariantKey) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: i64 = conn.hincr(key.store_key(), FIELD_EXPOSURES, 1).await?;
        Ok(())
    }

    async fn incr_conversion(&self, key: &VariantKey) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: i64 = conn.hincr(key.store_key(), FIELD_CONVERSIONS, 1).await?;
        Ok(())
    }

    async fn get_counters(&self, key: &VariantKey) -> Result<CounterSnapshot> {
        let mut conn = self.conn().await?;
        let fields: Vec<(String, String)> = conn.hgetall(key.store_key()).await?;
        Ok(parse_snapshot(fields))
    }

    async fn set_weight(&self, key: &VariantKey, weight: f64, ts: DateTime<Utc>) -> Result<()> {
        let mut conn = self.conn().await?;
        // Single HSET call: weight + last_updated land atomically, counts
        // are never part of this command (spec §4.1, §9).
        let _: () = conn
            .hset_multiple(
                key.store_key(),
                &[
                    (FIELD_WEIGHT, weight.to_string()),
                    (FIELD_LAST_UPDATED, ts.to_rfc3339()),
                ],
            )
            .await?;
        Ok(())
    }

    async fn list_keys(&self) -> Result<Vec<String>> {
        let mut conn = self.conn().await?;
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next_cursor, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg("stats:*")
                .arg("COUNT")
                .arg(200)
                .query_async(&mut conn)
                .await
                .map_err(OptimizerError::from)?;
            keys.extend(batch);
            if next_cursor == 0 {
                break;
            }
            cursor = next_cursor;
        }
        Ok(keys)
    }

    async fn try_acquire_recalc_lock(&self, ttl_secs: u64) -> Result<bool> {
        let mut conn = self.conn().await?;
        let acquired: Option<String> = redis::cmd("SET")
            .arg("lock:recalc")
            .arg(1)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await
            .map_err(OptimizerError::from)?;
        Ok(acquired.is_some())
    }

    async fn release_recalc_lock(&self) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: i64 = conn.del("lock:recalc").await?;
        Ok(())
    }
}

fn parse_snapshot(fields: Vec<(String, String)>) -> CounterSnapshot {
    let mut snap = CounterSnapshot::default();
    for (field, value) in fields {
        match field.as_str() {
            FIELD_EXPOSURES => snap.exposures = value.parse().unwrap_or(0),
            FIELD_CONVERSIONS => snap.conversions = value.parse().unwrap_or(0),
            FIELD_WEIGHT => snap.weight = value.parse().ok(),
            FIELD_LAST_UPDATED => snap.last_updated = DateTime::parse_from_rfc3339(&value).ok().map(|d| d.with_timezone(&Utc)),
            _ => {}
        }
    }
    snap
}

/// In-memory stand-in for [`CounterStore`], used by scheduler and server
/// tests so they don't need a live Redis instance (spec §9 ambient: AMBIENT.5).
#[cfg(test)]
pub struct InMemoryCounterStore {
    records: std::sync::Mutex<std::collections::HashMap<String, CounterSnapshot>>,
    locked: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
impl Default for InMemoryCounterStore {
    fn default() -> Self {
        Self {
            records: std::sync::Mutex::new(std::collections::HashMap::new()),
            locked: std::sync::atomic::AtomicBool::new(false),
        }
    }
}

#[cfg(test)]
impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a variant's counters directly, bypassing the increment API.
    pub fn seed(&self, key: &VariantKey, exposures: u64, conversions: u64) {
        let mut records = self.records.lock().unwrap();
        let entry = records.entry(key.store_key()).or_default();
        entry.exposures = exposures;
        entry.conversions = conversions;
    }
}

#[cfg(test)]
#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn incr_exposure(&self, key: &VariantKey) -> Result<()> {
        let mut records = self.records.lock().unwrap();
        records.entry(key.store_key()).or_default().exposures += 1;
        Ok(())
    }

    async fn incr_conversion(&self, key: &VariantKey) -> Result<()> {
        let mut records = self.records.lock().unwrap();
        records.entry(key.store_key()).or_default().conversions += 1;
        Ok(())
    }

    async fn get_counters(&self, key: &VariantKey) -> Result<CounterSnapshot> {
        let records = self.records.lock().unwrap();
        Ok(records.get(&key.store_key()).cloned().unwrap_or_default())
    }

    async fn set_weight(&self, key: &VariantKey, weight: f64, ts: DateTime<Utc>) -> Result<()> {
        let mut records = self.records.lock().unwrap();
        let entry = records.entry(key.store_key()).or_default();
        entry.weight = Some(weight);
        entry.last_updated = Some(ts);
        Ok(())
    }

    async fn list_keys(&self) -> Result<Vec<String>> {
        let records = self.records.lock().unwrap();
        Ok(records.keys().cloned().collect())
    }

    async fn try_acquire_recalc_lock(&self, _ttl_secs: u64) -> Result<bool> {
        Ok(!self.locked.swap(true, std::sync::atomic::Ordering::SeqCst))
    }

    async fn release_recalc_lock(&self) -> Result<()> {
        self.locked.store(false, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }
}
