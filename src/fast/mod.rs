//! Fast store abstraction
//!
//! A shared, low-latency, TTL-capable store used for the write-behind link
//! payloads, the pending-write ledgers, counters and cardinality sketches.
//! Never authoritative: any key may disappear at any time without data loss.
//!
//! Two implementations: Redis for deployments, and an in-process store for
//! tests and single-node setups.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::errors::Result;

pub mod memory;
pub mod redis;
pub mod sketch;

pub use memory::MemoryFastStore;
pub use redis::RedisFastStore;

/// A single operation inside an atomic batch
#[derive(Debug, Clone)]
pub enum FastOp {
    Set {
        key: String,
        value: String,
        ttl_secs: Option<u64>,
    },
    Del {
        key: String,
    },
    HSetAll {
        key: String,
        fields: Vec<(String, String)>,
    },
    HSet {
        key: String,
        field: String,
        value: String,
    },
    SAdd {
        key: String,
        member: String,
    },
    SRem {
        key: String,
        member: String,
    },
    Incr {
        key: String,
    },
    IncrBy {
        key: String,
        amount: i64,
    },
    PfAdd {
        key: String,
        element: String,
    },
    Expire {
        key: String,
        ttl_secs: u64,
    },
}

/// Resolved type of a live key, used to tell the structured link
/// representation (hash) from the legacy flat one (string) at read time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    Missing,
    Str,
    Hash,
    Set,
    Other,
}

#[async_trait]
pub trait FastStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()>;
    async fn del(&self, key: &str) -> Result<()>;
    async fn key_type(&self, key: &str) -> Result<KeyKind>;

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>>;
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()>;

    async fn sadd(&self, key: &str, member: &str) -> Result<()>;
    async fn srem(&self, key: &str, member: &str) -> Result<()>;
    async fn sismember(&self, key: &str, member: &str) -> Result<bool>;
    async fn smembers(&self, key: &str) -> Result<Vec<String>>;

    async fn incr(&self, key: &str) -> Result<i64>;
    async fn pfadd(&self, key: &str, element: &str) -> Result<()>;
    async fn pfcount(&self, key: &str) -> Result<u64>;

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<()>;

    /// Keys matching `{prefix}*`, returned without the store's own namespace
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// Execute a batch atomically: either all operations apply or none do
    async fn multi(&self, ops: Vec<FastOp>) -> Result<()>;
}
