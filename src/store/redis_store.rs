//! Redis-backed fast store
//!
//! Multi-step operations run as Lua scripts, existence filters use the
//! RedisBloom `BF.*` commands and the order log is a Redis Stream with a
//! consumer group. Entries are deleted once acknowledged, so the stream only
//! holds the backlog.

use async_trait::async_trait;
use redis::aio::{ConnectionManager, ConnectionManagerConfig, MultiplexedConnection};
use redis::streams::{StreamAutoClaimOptions, StreamAutoClaimReply, StreamId, StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Client, RedisResult, Script, Value};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;

use super::keys::bloom_rebuilds_key;
use super::scripts;
use super::{
    AdmissionCode, AdmissionRequest, CouponKeys, CouponSeed, FastStore, PendingSummary, ReadFrom,
    StoreResult, StreamEntry,
};
use crate::error::StoreError;

const BLOOM_BATCH: usize = 1_000;

pub struct RedisStore {
    client: Client,
    conn: ConnectionManager,
    /// Blocking XREADGROUP calls park their connection server-side, so every
    /// consumer gets its own instead of stalling the shared one.
    blocking: Mutex<HashMap<String, MultiplexedConnection>>,
    admit: Script,
    seed_coupon: Script,
    restock: Script,
    unlock: Script,
    extend_lock: Script,
    bloom_add: Script,
    bloom_commit: Script,
    ack_and_delete: Script,
}

impl RedisStore {
    pub async fn connect(redis_url: &str, retries: usize) -> StoreResult<Self> {
        let client = Client::open(redis_url)?;
        let config = ConnectionManagerConfig::new().set_number_of_retries(retries);
        let conn = client.get_connection_manager_with_config(config).await?;

        log::info!("Connected to Redis at {}", redis_url);

        Ok(Self {
            client,
            conn,
            blocking: Mutex::new(HashMap::new()),
            admit: Script::new(scripts::ADMIT),
            seed_coupon: Script::new(scripts::SEED_COUPON),
            restock: Script::new(scripts::RESTOCK),
            unlock: Script::new(scripts::UNLOCK),
            extend_lock: Script::new(scripts::EXTEND_LOCK),
            bloom_add: Script::new(scripts::BLOOM_ADD),
            bloom_commit: Script::new(scripts::BLOOM_COMMIT),
            ack_and_delete: Script::new(scripts::ACK_AND_DELETE),
        })
    }

    pub async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn blocking_conn(&self, consumer: &str) -> StoreResult<MultiplexedConnection> {
        let mut pool = self.blocking.lock().await;
        if let Some(conn) = pool.get(consumer) {
            return Ok(conn.clone());
        }
        let conn = self.client.get_multiplexed_async_connection().await?;
        pool.insert(consumer.to_string(), conn.clone());
        Ok(conn)
    }

    async fn drop_blocking_conn(&self, consumer: &str) {
        self.blocking.lock().await.remove(consumer);
    }
}

fn millis(d: Duration) -> u64 {
    d.as_millis().max(1) as u64
}

fn to_entry(id: StreamId) -> StoreResult<StreamEntry> {
    let mut fields = Vec::with_capacity(id.map.len());
    for (name, value) in id.map.iter() {
        let value: String = redis::from_redis_value(value)
            .map_err(|e| StoreError::Protocol(format!("stream field {}: {}", name, e)))?;
        fields.push((name.clone(), value));
    }
    Ok(StreamEntry { id: id.id, fields })
}

fn is_missing_group(err: &redis::RedisError) -> bool {
    err.code() == Some("NOGROUP") || err.to_string().contains("no such key")
}

#[async_trait]
impl FastStore for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.pset_ex(key, value, millis(ttl)).await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = self.unlock.key(key).arg(expected).invoke_async(&mut conn).await?;
        Ok(removed == 1)
    }

    async fn compare_and_expire(&self, key: &str, expected: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let renewed: i64 = self
            .extend_lock
            .key(key)
            .arg(expected)
            .arg(millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(renewed == 1)
    }

    async fn bloom_reserve(&self, key: &str, error_rate: f64, capacity: usize) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let result: RedisResult<()> = redis::cmd("BF.RESERVE")
            .arg(key)
            .arg(error_rate)
            .arg(capacity)
            .query_async(&mut conn)
            .await;
        match result {
            Ok(()) => Ok(()),
            // Already reserved
            Err(e) if e.to_string().contains("item exists") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn bloom_add(&self, key: &str, items: &[String]) -> StoreResult<usize> {
        let mut conn = self.conn.clone();
        let rebuilds = bloom_rebuilds_key(key);
        let mut added = 0;
        for chunk in items.chunks(BLOOM_BATCH) {
            let new: usize = self.bloom_add.key(key).key(&rebuilds).arg(chunk).invoke_async(&mut conn).await?;
            added += new;
        }
        Ok(added)
    }

    async fn bloom_exists(&self, key: &str, item: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let found: i64 = redis::cmd("BF.EXISTS").arg(key).arg(item).query_async(&mut conn).await?;
        Ok(found == 1)
    }

    async fn bloom_stage(
        &self,
        key: &str,
        staging_key: &str,
        error_rate: f64,
        capacity: usize,
        ttl: Duration,
    ) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .cmd("DEL")
            .arg(staging_key)
            .ignore()
            .cmd("BF.RESERVE")
            .arg(staging_key)
            .arg(error_rate)
            .arg(capacity)
            .ignore()
            .cmd("PEXPIRE")
            .arg(staging_key)
            .arg(millis(ttl))
            .ignore()
            .cmd("SADD")
            .arg(bloom_rebuilds_key(key))
            .arg(staging_key)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn bloom_commit(&self, key: &str, staging_key: &str, items: &[String]) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let rebuilds = bloom_rebuilds_key(key);
        for chunk in items.chunks(BLOOM_BATCH) {
            // NOCREATE: an expired staging filter must not come back empty
            let result: RedisResult<Vec<i64>> = redis::cmd("BF.INSERT")
                .arg(staging_key)
                .arg("NOCREATE")
                .arg("ITEMS")
                .arg(chunk)
                .query_async(&mut conn)
                .await;
            match result {
                Ok(_) => {}
                Err(e) if e.to_string().contains("not found") => {
                    let _: i64 = conn.srem(&rebuilds, staging_key).await?;
                    return Ok(false);
                }
                Err(e) => return Err(e.into()),
            }
        }
        let swapped: i64 = self
            .bloom_commit
            .key(staging_key)
            .key(key)
            .key(&rebuilds)
            .invoke_async(&mut conn)
            .await?;
        Ok(swapped == 1)
    }

    async fn bloom_discard(&self, key: &str, staging_key: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .cmd("SREM")
            .arg(bloom_rebuilds_key(key))
            .arg(staging_key)
            .ignore()
            .cmd("DEL")
            .arg(staging_key)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn seed_coupon(&self, keys: &CouponKeys, seed: &CouponSeed) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let written: i64 = self
            .seed_coupon
            .key(&keys.stock)
            .key(&keys.window)
            .key(&keys.buyers)
            .arg(seed.window.begin_ms)
            .arg(seed.window.end_ms)
            .arg(seed.stock)
            .arg(seed.expire_at_ms)
            .arg(if seed.overwrite { "1" } else { "0" })
            .invoke_async(&mut conn)
            .await?;
        Ok(written == 1)
    }

    async fn restock(&self, keys: &CouponKeys, amount: i64) -> StoreResult<Option<i64>> {
        let mut conn = self.conn.clone();
        let stock: i64 = self
            .restock
            .key(&keys.stock)
            .key(&keys.window)
            .arg(amount)
            .invoke_async(&mut conn)
            .await?;
        Ok(if stock < 0 { None } else { Some(stock) })
    }

    async fn stock(&self, keys: &CouponKeys) -> StoreResult<Option<i64>> {
        let mut conn = self.conn.clone();
        let stock: Option<i64> = conn.get(&keys.stock).await?;
        Ok(stock)
    }

    async fn is_buyer(&self, keys: &CouponKeys, buyer_id: u64) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let member: bool = conn.sismember(&keys.buyers, buyer_id).await?;
        Ok(member)
    }

    async fn admit(
        &self,
        keys: &CouponKeys,
        order_stream: &str,
        request: &AdmissionRequest,
    ) -> StoreResult<AdmissionCode> {
        let mut conn = self.conn.clone();
        let code: i64 = self
            .admit
            .key(&keys.stock)
            .key(&keys.window)
            .key(&keys.buyers)
            .key(order_stream)
            .arg(request.buyer_id)
            .arg(request.coupon_id)
            .arg(request.now_ms)
            .arg(&request.token)
            .arg(request.retention_ms)
            .invoke_async(&mut conn)
            .await?;
        AdmissionCode::from_code(code)
            .ok_or_else(|| StoreError::Protocol(format!("unknown admission code {}", code)))
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let result: RedisResult<()> = conn.xgroup_create_mkstream(stream, group, "0").await;
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn append(&self, stream: &str, fields: &[(String, String)]) -> StoreResult<String> {
        let mut conn = self.conn.clone();
        let id: String = conn.xadd(stream, "*", fields).await?;
        Ok(id)
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        from: ReadFrom,
        count: usize,
        block: Duration,
    ) -> StoreResult<Vec<StreamEntry>> {
        let (mut conn, start, opts) = match from {
            ReadFrom::OwnPending => (
                self.blocking_conn(consumer).await?,
                "0",
                StreamReadOptions::default().group(group, consumer).count(count),
            ),
            ReadFrom::New => (
                self.blocking_conn(consumer).await?,
                ">",
                StreamReadOptions::default()
                    .group(group, consumer)
                    .count(count)
                    .block(millis(block) as usize),
            ),
        };

        let reply: RedisResult<Option<StreamReadReply>> =
            conn.xread_options(&[stream], &[start], &opts).await;
        let reply = match reply {
            Ok(reply) => reply,
            Err(e) => {
                if e.is_io_error() || e.is_connection_dropped() {
                    self.drop_blocking_conn(consumer).await;
                }
                return Err(e.into());
            }
        };

        let mut entries = Vec::new();
        for key in reply.map(|r| r.keys).unwrap_or_default() {
            for id in key.ids {
                entries.push(to_entry(id)?);
            }
        }
        Ok(entries)
    }

    async fn claim_idle(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> StoreResult<Vec<StreamEntry>> {
        let mut conn = self.conn.clone();
        let opts = StreamAutoClaimOptions::default().count(count);
        let reply: StreamAutoClaimReply = conn
            .xautoclaim_options(stream, group, consumer, min_idle.as_millis() as u64, "0-0", opts)
            .await?;
        reply.claimed.into_iter().map(to_entry).collect()
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let acked: i64 = self.ack_and_delete.key(stream).arg(group).arg(id).invoke_async(&mut conn).await?;
        Ok(acked == 1)
    }

    async fn stream_len(&self, stream: &str) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        let len: u64 = conn.xlen(stream).await?;
        Ok(len)
    }

    async fn pending_summary(&self, stream: &str, group: &str) -> StoreResult<PendingSummary> {
        let mut conn = self.conn.clone();
        let reply: RedisResult<(u64, Option<String>, Option<String>, Option<Vec<(String, String)>>)> =
            redis::cmd("XPENDING").arg(stream).arg(group).query_async(&mut conn).await;
        let (total, _, _, consumers) = match reply {
            Ok(reply) => reply,
            Err(e) if is_missing_group(&e) => return Ok(PendingSummary::default()),
            Err(e) => return Err(e.into()),
        };

        let mut by_consumer = Vec::new();
        for (name, pending) in consumers.unwrap_or_default() {
            let pending = pending
                .parse::<u64>()
                .map_err(|e| StoreError::Protocol(format!("XPENDING count for {}: {}", name, e)))?;
            by_consumer.push((name, pending));
        }
        Ok(PendingSummary { total, by_consumer })
    }

    async fn group_lag(&self, stream: &str, group: &str) -> StoreResult<Option<u64>> {
        let mut conn = self.conn.clone();
        let reply: RedisResult<Vec<HashMap<String, Value>>> =
            redis::cmd("XINFO").arg("GROUPS").arg(stream).query_async(&mut conn).await;
        let groups = match reply {
            Ok(groups) => groups,
            Err(e) if is_missing_group(&e) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        for info in groups {
            let name: Option<String> = match info.get("name") {
                Some(v) => redis::from_redis_value(v).ok(),
                None => None,
            };
            if name.as_deref() != Some(group) {
                continue;
            }
            // "lag" is reported from Redis 7 on and may be nil when unknown
            return Ok(match info.get("lag") {
                Some(v) => redis::from_redis_value::<Option<u64>>(v).ok().flatten(),
                None => None,
            });
        }
        Ok(None)
    }
}
