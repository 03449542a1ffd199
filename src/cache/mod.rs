//! Layered cache service
//!
//! Generic get-or-compute over two tiers: a process-local moka cache and the
//! shared fast store. Values are stored in the fast tier as a typed envelope
//! (`raw` string vs `structured` JSON) so deserialization is a total
//! function; anything that fails to parse is handled as a miss, never as an
//! error. Concurrent cold-key callers share a single computation through a
//! per-key in-flight future. Cache-tier failures degrade to invoking the
//! compute function directly with a logged warning.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use moka::Expiry;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::errors::{Result, SnaplinkError};
use crate::fast::FastStore;

/// Typed cache envelope: the fast tier only ever holds one of these two
/// shapes, serialized as `{"kind":"raw"|"structured","data":...}`.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "lowercase")]
pub enum CachePayload {
    Raw(String),
    Structured(serde_json::Value),
}

#[derive(Debug, Clone, Copy)]
pub struct CacheOptions {
    pub memory_ttl: Duration,
    pub fast_ttl: Duration,
    /// Skip the process-local tier, e.g. for values that must not be served
    /// stale across nodes longer than the fast TTL
    pub skip_memory: bool,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            memory_ttl: Duration::from_secs(300),
            fast_ttl: Duration::from_secs(24 * 60 * 60),
            skip_memory: false,
        }
    }
}

#[derive(Clone)]
struct MemoryEntry {
    payload: CachePayload,
    ttl: Duration,
}

/// Per-entry TTL for the memory tier, driven by [`CacheOptions::memory_ttl`]
struct EntryTtl;

impl Expiry<String, MemoryEntry> for EntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &MemoryEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

type SharedCompute = Shared<BoxFuture<'static, Result<CachePayload>>>;

pub struct LayeredCache {
    memory: moka::future::Cache<String, MemoryEntry>,
    fast: Arc<dyn FastStore>,
    inflight: DashMap<String, SharedCompute>,
}

impl LayeredCache {
    pub fn new(fast: Arc<dyn FastStore>) -> Self {
        let memory = moka::future::Cache::builder()
            .max_capacity(10_000)
            .expire_after(EntryTtl)
            .build();
        Self {
            memory,
            fast,
            inflight: DashMap::new(),
        }
    }

    /// Get-or-compute the envelope for `key`.
    ///
    /// Tier order: memory (unless skipped), fast store, then `compute`. The
    /// computed value is written to the fast tier with `fast_ttl` and the
    /// memory tier with `memory_ttl`. Never fails due to cache-tier errors
    /// alone: those degrade to the compute path.
    pub async fn get<F>(&self, key: &str, opts: CacheOptions, compute: F) -> Result<CachePayload>
    where
        F: FnOnce() -> BoxFuture<'static, Result<CachePayload>>,
    {
        if let Some(payload) = self.cached_payload(key, opts).await {
            return Ok(payload);
        }
        self.compute_and_store(key, opts, compute).await
    }

    /// Typed convenience wrapper: caches `T` as a structured envelope.
    /// A cached value that no longer decodes as `T` counts as a miss: the
    /// stale entry is dropped and the compute path runs, so shape drift after
    /// a deploy never surfaces as an error.
    pub async fn get_json<T, F>(&self, key: &str, opts: CacheOptions, compute: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> BoxFuture<'static, Result<T>> + Send + 'static,
    {
        if let Some(payload) = self.cached_payload(key, opts).await {
            match payload {
                CachePayload::Structured(value) => match serde_json::from_value::<T>(value) {
                    Ok(v) => return Ok(v),
                    Err(e) => {
                        warn!("Cached value under '{}' no longer decodes: {}", key, e);
                        self.invalidate(key).await;
                    }
                },
                CachePayload::Raw(_) => {
                    warn!("Cached value under '{}' has raw shape, expected structured", key);
                    self.invalidate(key).await;
                }
            }
        }

        let wrapped = move || {
            async move {
                let value = compute().await?;
                Ok(CachePayload::Structured(serde_json::to_value(value)?))
            }
            .boxed()
        };

        match self.compute_and_store(key, opts, wrapped).await? {
            CachePayload::Structured(value) => {
                serde_json::from_value(value).map_err(|e| SnaplinkError::serialization(e.to_string()))
            }
            // Only reachable when a raw `get` computation for the same key is
            // in flight; recomputing would join the same shared future.
            CachePayload::Raw(_) => Err(SnaplinkError::serialization(format!(
                "raw payload under structured key '{key}'"
            ))),
        }
    }

    pub async fn invalidate(&self, key: &str) {
        self.memory.invalidate(key).await;
        if let Err(e) = self.fast.del(key).await {
            warn!("Failed to invalidate '{}' in fast tier: {}", key, e);
        }
    }

    /// Tier walk shared by `get` and `get_json`: memory (unless skipped),
    /// then the fast store with a memory backfill on a hit.
    async fn cached_payload(&self, key: &str, opts: CacheOptions) -> Option<CachePayload> {
        if !opts.skip_memory
            && let Some(entry) = self.memory.get(key).await
        {
            return Some(entry.payload);
        }

        let payload = self.fast_tier_lookup(key).await?;
        if !opts.skip_memory {
            self.memory
                .insert(
                    key.to_string(),
                    MemoryEntry {
                        payload: payload.clone(),
                        ttl: opts.memory_ttl,
                    },
                )
                .await;
        }
        Some(payload)
    }

    /// Fast-tier read; connection and parse failures both count as a miss
    async fn fast_tier_lookup(&self, key: &str) -> Option<CachePayload> {
        match self.fast.get(key).await {
            Ok(Some(data)) => match serde_json::from_str::<CachePayload>(&data) {
                Ok(payload) => Some(payload),
                Err(e) => {
                    debug!("Unparseable cache envelope under '{}': {}", key, e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!("Fast cache tier unavailable for '{}': {}", key, e);
                None
            }
        }
    }

    /// Single-flight compute: the first caller on a cold key runs the
    /// computation and populates both tiers, later callers await the same
    /// shared future.
    async fn compute_and_store<F>(
        &self,
        key: &str,
        opts: CacheOptions,
        compute: F,
    ) -> Result<CachePayload>
    where
        F: FnOnce() -> BoxFuture<'static, Result<CachePayload>>,
    {
        use dashmap::mapref::entry::Entry;

        let (shared, leader) = match self.inflight.entry(key.to_string()) {
            Entry::Occupied(occupied) => (occupied.get().clone(), false),
            Entry::Vacant(vacant) => {
                let shared = compute().shared();
                vacant.insert(shared.clone());
                (shared, true)
            }
        };

        let result = shared.await;

        if leader {
            self.inflight.remove(key);
            if let Ok(payload) = &result {
                self.store_tiers(key, opts, payload).await;
            }
        }

        result
    }

    async fn store_tiers(&self, key: &str, opts: CacheOptions, payload: &CachePayload) {
        match serde_json::to_string(payload) {
            Ok(serialized) => {
                if let Err(e) = self
                    .fast
                    .set_ex(key, &serialized, opts.fast_ttl.as_secs())
                    .await
                {
                    warn!("Failed to populate fast tier for '{}': {}", key, e);
                }
            }
            Err(e) => warn!("Failed to serialize cache envelope for '{}': {}", key, e),
        }

        if !opts.skip_memory {
            self.memory
                .insert(
                    key.to_string(),
                    MemoryEntry {
                        payload: payload.clone(),
                        ttl: opts.memory_ttl,
                    },
                )
                .await;
        }
    }
}
