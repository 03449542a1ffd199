//! Redis-backed fast store
//!
//! Holds one multiplexed connection shared by all tasks, re-established on
//! error. All keys are namespaced with a configurable prefix. PFADD/PFCOUNT
//! map onto Redis' native HyperLogLog.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use redis::{AsyncCommands, aio::MultiplexedConnection};
use tokio::sync::RwLock;
use tracing::debug;

use crate::errors::{Result, SnaplinkError};
use crate::fast::{FastOp, FastStore, KeyKind};

pub struct RedisFastStore {
    client: redis::Client,
    connection: Arc<RwLock<Option<MultiplexedConnection>>>,
    key_prefix: String,
}

impl RedisFastStore {
    pub fn new(url: &str, key_prefix: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| SnaplinkError::cache_connection(format!("invalid redis url: {e}")))?;

        Ok(Self {
            client,
            connection: Arc::new(RwLock::new(None)),
            key_prefix: key_prefix.to_string(),
        })
    }

    /// Get the shared connection, establishing it on first use
    async fn get_connection(&self) -> Result<MultiplexedConnection> {
        {
            let conn_guard = self.connection.read().await;
            if let Some(ref conn) = *conn_guard {
                return Ok(conn.clone());
            }
        }

        let mut conn_guard = self.connection.write().await;

        // Double check: another task may have connected while we waited
        if let Some(ref conn) = *conn_guard {
            return Ok(conn.clone());
        }

        let new_conn = self.client.get_multiplexed_async_connection().await?;
        *conn_guard = Some(new_conn.clone());
        debug!("Redis connection established");

        Ok(new_conn)
    }

    /// Drop the cached connection so the next call reconnects
    async fn reset_connection(&self) {
        let mut conn_guard = self.connection.write().await;
        *conn_guard = None;
        debug!("Redis connection reset after error");
    }

    fn make_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    async fn fail(&self, err: redis::RedisError) -> SnaplinkError {
        self.reset_connection().await;
        err.into()
    }
}

macro_rules! run {
    ($self:expr, $result:expr) => {
        match $result {
            Ok(v) => Ok(v),
            Err(e) => Err($self.fail(e).await),
        }
    };
}

#[async_trait]
impl FastStore for RedisFastStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.get_connection().await?;
        run!(self, conn.get(self.make_key(key)).await)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        let mut conn = self.get_connection().await?;
        run!(
            self,
            conn.set_ex::<_, _, ()>(self.make_key(key), value, ttl_secs)
                .await
        )
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut conn = self.get_connection().await?;
        run!(self, conn.del::<_, ()>(self.make_key(key)).await)
    }

    async fn key_type(&self, key: &str) -> Result<KeyKind> {
        let mut conn = self.get_connection().await?;
        let kind: String = run!(
            self,
            redis::cmd("TYPE")
                .arg(self.make_key(key))
                .query_async(&mut conn)
                .await
        )?;
        Ok(match kind.as_str() {
            "none" => KeyKind::Missing,
            "string" => KeyKind::Str,
            "hash" => KeyKind::Hash,
            "set" => KeyKind::Set,
            _ => KeyKind::Other,
        })
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut conn = self.get_connection().await?;
        run!(self, conn.hgetall(self.make_key(key)).await)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut conn = self.get_connection().await?;
        run!(
            self,
            conn.hset::<_, _, _, ()>(self.make_key(key), field, value)
                .await
        )
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.get_connection().await?;
        run!(
            self,
            conn.sadd::<_, _, ()>(self.make_key(key), member).await
        )
    }

    async fn srem(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.get_connection().await?;
        run!(
            self,
            conn.srem::<_, _, ()>(self.make_key(key), member).await
        )
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.get_connection().await?;
        run!(self, conn.sismember(self.make_key(key), member).await)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.get_connection().await?;
        run!(self, conn.smembers(self.make_key(key)).await)
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let mut conn = self.get_connection().await?;
        run!(self, conn.incr(self.make_key(key), 1i64).await)
    }

    async fn pfadd(&self, key: &str, element: &str) -> Result<()> {
        let mut conn = self.get_connection().await?;
        run!(
            self,
            redis::cmd("PFADD")
                .arg(self.make_key(key))
                .arg(element)
                .query_async::<()>(&mut conn)
                .await
        )
    }

    async fn pfcount(&self, key: &str) -> Result<u64> {
        let mut conn = self.get_connection().await?;
        run!(
            self,
            redis::cmd("PFCOUNT")
                .arg(self.make_key(key))
                .query_async(&mut conn)
                .await
        )
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<()> {
        let mut conn = self.get_connection().await?;
        run!(
            self,
            conn.expire::<_, ()>(self.make_key(key), ttl_secs as i64)
                .await
        )
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut conn = self.get_connection().await?;
        let pattern = format!("{}*", self.make_key(prefix));
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            let (next, batch): (u64, Vec<String>) = run!(
                self,
                redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(&pattern)
                    .arg("COUNT")
                    .arg(500)
                    .query_async(&mut conn)
                    .await
            )?;
            keys.extend(
                batch
                    .into_iter()
                    .filter_map(|k| k.strip_prefix(&self.key_prefix).map(str::to_string)),
            );
            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        Ok(keys)
    }

    async fn multi(&self, ops: Vec<FastOp>) -> Result<()> {
        let mut conn = self.get_connection().await?;
        let mut pipe = redis::pipe();
        pipe.atomic();

        for op in ops {
            match op {
                FastOp::Set {
                    key,
                    value,
                    ttl_secs,
                } => {
                    match ttl_secs {
                        Some(ttl) => pipe.set_ex(self.make_key(&key), value, ttl),
                        None => pipe.set(self.make_key(&key), value),
                    }
                    .ignore();
                }
                FastOp::Del { key } => {
                    pipe.del(self.make_key(&key)).ignore();
                }
                FastOp::HSetAll { key, fields } => {
                    pipe.hset_multiple(self.make_key(&key), &fields).ignore();
                }
                FastOp::HSet { key, field, value } => {
                    pipe.hset(self.make_key(&key), field, value).ignore();
                }
                FastOp::SAdd { key, member } => {
                    pipe.sadd(self.make_key(&key), member).ignore();
                }
                FastOp::SRem { key, member } => {
                    pipe.srem(self.make_key(&key), member).ignore();
                }
                FastOp::Incr { key } => {
                    pipe.incr(self.make_key(&key), 1i64).ignore();
                }
                FastOp::IncrBy { key, amount } => {
                    pipe.incr(self.make_key(&key), amount).ignore();
                }
                FastOp::PfAdd { key, element } => {
                    pipe.cmd("PFADD")
                        .arg(self.make_key(&key))
                        .arg(element)
                        .ignore();
                }
                FastOp::Expire { key, ttl_secs } => {
                    pipe.expire(self.make_key(&key), ttl_secs as i64).ignore();
                }
            }
        }

        run!(self, pipe.query_async::<()>(&mut conn).await)
    }
}
