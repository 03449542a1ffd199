//! In-process fast store
//!
//! Single-node stand-in for Redis with the same semantics: TTLs, hashes,
//! sets, counters and a cardinality sketch. A single mutex over the whole
//! keyspace makes `multi` batches trivially atomic. Expiry is lazy; expired
//! entries are dropped on next access.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::errors::{Result, SnaplinkError};
use crate::fast::sketch::CardinalitySketch;
use crate::fast::{FastOp, FastStore, KeyKind};

enum Value {
    Str(String),
    Hash(HashMap<String, String>),
    Set(HashSet<String>),
    Sketch(CardinalitySketch),
}

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

#[derive(Default)]
pub struct MemoryFastStore {
    data: Mutex<HashMap<String, Entry>>,
}

impl MemoryFastStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn live<'a>(data: &'a mut HashMap<String, Entry>, key: &str) -> Option<&'a mut Entry> {
    if data.get(key).is_some_and(|e| e.expired()) {
        data.remove(key);
    }
    data.get_mut(key)
}

fn wrong_type(key: &str) -> SnaplinkError {
    SnaplinkError::validation(format!("wrong value type for key '{key}'"))
}

/// Apply a single operation. Shared by the direct methods and `multi`.
fn apply(data: &mut HashMap<String, Entry>, op: FastOp) -> Result<()> {
    match op {
        FastOp::Set {
            key,
            value,
            ttl_secs,
        } => {
            data.insert(
                key,
                Entry {
                    value: Value::Str(value),
                    expires_at: ttl_secs.map(|t| Instant::now() + Duration::from_secs(t)),
                },
            );
        }
        FastOp::Del { key } => {
            data.remove(&key);
        }
        FastOp::HSetAll { key, fields } => {
            let name = key.clone();
            let entry = ensure(data, key, || Value::Hash(HashMap::new()))?;
            let Value::Hash(hash) = &mut entry.value else {
                return Err(wrong_type(&name));
            };
            hash.extend(fields);
        }
        FastOp::HSet { key, field, value } => {
            let name = key.clone();
            let entry = ensure(data, key, || Value::Hash(HashMap::new()))?;
            let Value::Hash(hash) = &mut entry.value else {
                return Err(wrong_type(&name));
            };
            hash.insert(field, value);
        }
        FastOp::SAdd { key, member } => {
            let name = key.clone();
            let entry = ensure(data, key, || Value::Set(HashSet::new()))?;
            let Value::Set(set) = &mut entry.value else {
                return Err(wrong_type(&name));
            };
            set.insert(member);
        }
        FastOp::SRem { key, member } => {
            if let Some(entry) = live(data, &key)
                && let Value::Set(set) = &mut entry.value
            {
                set.remove(&member);
            }
        }
        FastOp::Incr { key } => {
            incr_by(data, &key, 1)?;
        }
        FastOp::IncrBy { key, amount } => {
            incr_by(data, &key, amount)?;
        }
        FastOp::PfAdd { key, element } => {
            let name = key.clone();
            let entry = ensure(data, key, || Value::Sketch(CardinalitySketch::new()))?;
            let Value::Sketch(sketch) = &mut entry.value else {
                return Err(wrong_type(&name));
            };
            sketch.add(&element);
        }
        FastOp::Expire { key, ttl_secs } => {
            if let Some(entry) = live(data, &key) {
                entry.expires_at = Some(Instant::now() + Duration::from_secs(ttl_secs));
            }
        }
    }
    Ok(())
}

fn ensure<'a>(
    data: &'a mut HashMap<String, Entry>,
    key: String,
    default: impl FnOnce() -> Value,
) -> Result<&'a mut Entry> {
    if data.get(&key).is_some_and(|e| e.expired()) {
        data.remove(&key);
    }
    Ok(data.entry(key).or_insert_with(|| Entry {
        value: default(),
        expires_at: None,
    }))
}

fn incr_by(data: &mut HashMap<String, Entry>, key: &str, amount: i64) -> Result<i64> {
    match live(data, key) {
        Some(entry) => {
            let Value::Str(s) = &mut entry.value else {
                return Err(wrong_type(key));
            };
            let current: i64 = s
                .parse()
                .map_err(|_| SnaplinkError::validation(format!("not an integer at '{key}'")))?;
            let next = current + amount;
            *s = next.to_string();
            Ok(next)
        }
        None => {
            data.insert(
                key.to_string(),
                Entry {
                    value: Value::Str(amount.to_string()),
                    expires_at: None,
                },
            );
            Ok(amount)
        }
    }
}

#[async_trait]
impl FastStore for MemoryFastStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut data = self.data.lock().await;
        match live(&mut data, key) {
            Some(entry) => match &entry.value {
                Value::Str(s) => Ok(Some(s.clone())),
                _ => Err(wrong_type(key)),
            },
            None => Ok(None),
        }
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        let mut data = self.data.lock().await;
        apply(
            &mut data,
            FastOp::Set {
                key: key.to_string(),
                value: value.to_string(),
                ttl_secs: Some(ttl_secs),
            },
        )
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut data = self.data.lock().await;
        data.remove(key);
        Ok(())
    }

    async fn key_type(&self, key: &str) -> Result<KeyKind> {
        let mut data = self.data.lock().await;
        Ok(match live(&mut data, key) {
            None => KeyKind::Missing,
            Some(entry) => match &entry.value {
                Value::Str(_) => KeyKind::Str,
                Value::Hash(_) => KeyKind::Hash,
                Value::Set(_) => KeyKind::Set,
                Value::Sketch(_) => KeyKind::Other,
            },
        })
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut data = self.data.lock().await;
        match live(&mut data, key) {
            Some(entry) => match &entry.value {
                Value::Hash(hash) => Ok(hash.clone()),
                _ => Err(wrong_type(key)),
            },
            None => Ok(HashMap::new()),
        }
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut data = self.data.lock().await;
        apply(
            &mut data,
            FastOp::HSet {
                key: key.to_string(),
                field: field.to_string(),
                value: value.to_string(),
            },
        )
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        let mut data = self.data.lock().await;
        apply(
            &mut data,
            FastOp::SAdd {
                key: key.to_string(),
                member: member.to_string(),
            },
        )
    }

    async fn srem(&self, key: &str, member: &str) -> Result<()> {
        let mut data = self.data.lock().await;
        apply(
            &mut data,
            FastOp::SRem {
                key: key.to_string(),
                member: member.to_string(),
            },
        )
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool> {
        let mut data = self.data.lock().await;
        match live(&mut data, key) {
            Some(entry) => match &entry.value {
                Value::Set(set) => Ok(set.contains(member)),
                _ => Err(wrong_type(key)),
            },
            None => Ok(false),
        }
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let mut data = self.data.lock().await;
        match live(&mut data, key) {
            Some(entry) => match &entry.value {
                Value::Set(set) => Ok(set.iter().cloned().collect()),
                _ => Err(wrong_type(key)),
            },
            None => Ok(Vec::new()),
        }
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let mut data = self.data.lock().await;
        incr_by(&mut data, key, 1)
    }

    async fn pfadd(&self, key: &str, element: &str) -> Result<()> {
        let mut data = self.data.lock().await;
        apply(
            &mut data,
            FastOp::PfAdd {
                key: key.to_string(),
                element: element.to_string(),
            },
        )
    }

    async fn pfcount(&self, key: &str) -> Result<u64> {
        let mut data = self.data.lock().await;
        match live(&mut data, key) {
            Some(entry) => match &entry.value {
                Value::Sketch(sketch) => Ok(sketch.count()),
                _ => Err(wrong_type(key)),
            },
            None => Ok(0),
        }
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<()> {
        let mut data = self.data.lock().await;
        apply(
            &mut data,
            FastOp::Expire {
                key: key.to_string(),
                ttl_secs,
            },
        )
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut data = self.data.lock().await;
        let expired: Vec<String> = data
            .iter()
            .filter(|(_, e)| e.expired())
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            data.remove(&key);
        }
        Ok(data
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn multi(&self, ops: Vec<FastOp>) -> Result<()> {
        // The lock is held across the whole batch: all or nothing as far as
        // concurrent readers are concerned.
        let mut data = self.data.lock().await;
        for op in ops {
            apply(&mut data, op)?;
        }
        Ok(())
    }
}
