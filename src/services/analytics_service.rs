//! Analytics service
//!
//! Keeps exact per-code click counters and bounded-error unique-visitor
//! sketches in the fast store, backed by the append-only visit ledger in the
//! durable store. The hit path never touches the durable store: the full
//! visit fact is staged in the fast store and drained by the reconciler.
//!
//! Topic and owner rollups are cache-aside reads through the layered cache.
//! Rolled-up unique counts come from count-distinct over the durable ledger
//! or sketch merges, so they are bounded-error estimates, not exact.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use futures_util::FutureExt;
use tracing::warn;
use uuid::Uuid;

use crate::cache::{CacheOptions, LayeredCache};
use crate::errors::Result;
use crate::fast::{FastOp, FastStore};
use crate::keys;
use crate::models::{
    BreakdownRow, ClicksByDate, LinkCounts, OwnerAggregate, SubjectCounts, TopicAggregate,
    VisitFact, VisitorInfo,
};
use crate::storage::DurableStorage;

/// Date-bucketed click histograms cover this many trailing days
const CLICKS_BY_DATE_DAYS: i64 = 7;

#[derive(Debug, Clone, Copy)]
pub struct AnalyticsTtls {
    /// TTL for per-code counters and sketches
    pub counter_secs: u64,
    /// TTL for cached topic/owner rollups
    pub aggregate_secs: u64,
    /// TTL for the heavier breakdown snapshots inside a rollup
    pub snapshot_secs: u64,
}

impl Default for AnalyticsTtls {
    fn default() -> Self {
        Self {
            counter_secs: 86_400,
            aggregate_secs: 300,
            snapshot_secs: 3_600,
        }
    }
}

pub struct AnalyticsService {
    fast: Arc<dyn FastStore>,
    storage: Arc<DurableStorage>,
    cache: Arc<LayeredCache>,
    ttls: AnalyticsTtls,
}

impl AnalyticsService {
    pub fn new(
        fast: Arc<dyn FastStore>,
        storage: Arc<DurableStorage>,
        cache: Arc<LayeredCache>,
        ttls: AnalyticsTtls,
    ) -> Self {
        Self {
            fast,
            storage,
            cache,
            ttls,
        }
    }

    /// Record one visit: bump the exact counter, feed the sketch and stage
    /// the full fact for the write-behind drain, all in one atomic batch.
    /// Returns the staged fact's idempotency key.
    pub async fn record_hit(&self, code: &str, visitor: VisitorInfo) -> Result<String> {
        let fact = VisitFact {
            fact_key: keys::visit_fact(code, &Uuid::new_v4().to_string()),
            code: code.to_string(),
            visitor,
            visited_at: Utc::now(),
        };

        let clicks_key = keys::total_clicks(code);
        let sketch_key = keys::unique_visitors(code);
        self.fast
            .multi(vec![
                FastOp::HSetAll {
                    key: fact.fact_key.clone(),
                    fields: fact.to_hash_fields(),
                },
                FastOp::SAdd {
                    key: keys::PENDING_VISITS.to_string(),
                    member: fact.fact_key.clone(),
                },
                FastOp::Incr {
                    key: clicks_key.clone(),
                },
                FastOp::PfAdd {
                    key: sketch_key.clone(),
                    element: fact.visitor.visitor_ip.clone(),
                },
                FastOp::Expire {
                    key: clicks_key,
                    ttl_secs: self.ttls.counter_secs,
                },
                FastOp::Expire {
                    key: sketch_key,
                    ttl_secs: self.ttls.counter_secs,
                },
            ])
            .await?;

        Ok(fact.fact_key)
    }

    /// Exact total and estimated unique visitors for one code.
    ///
    /// Served from the fast-store counter when warm. A cold counter is
    /// recomputed from the durable visit ledger and reseeded (counter from
    /// the exact count, sketch from the distinct visitor IPs) so the next
    /// read is fast-path again.
    pub async fn read_counts(&self, code: &str) -> Result<SubjectCounts> {
        match self.fast.get(&keys::total_clicks(code)).await {
            Ok(Some(raw)) => {
                if let Ok(total_clicks) = raw.parse::<u64>() {
                    let unique_visitors =
                        self.fast.pfcount(&keys::unique_visitors(code)).await?;
                    return Ok(SubjectCounts {
                        total_clicks,
                        unique_visitors,
                    });
                }
                warn!("Unparseable counter for '{}', recomputing from ledger", code);
            }
            Ok(None) => {}
            Err(e) => {
                // Fast store down: answer from the durable ledger, skip reseed
                warn!("Counter lookup failed for '{}': {}", code, e);
                return self.durable_counts(code).await;
            }
        }

        let counts = self.durable_counts(code).await?;
        self.reseed_counters(code, &counts).await;
        Ok(counts)
    }

    async fn durable_counts(&self, code: &str) -> Result<SubjectCounts> {
        let codes = [code.to_string()];
        let total_clicks = self.storage.count_visits(&codes).await?;
        let unique_visitors = self.storage.count_unique_visitors(&codes).await?;
        Ok(SubjectCounts {
            total_clicks,
            unique_visitors,
        })
    }

    /// Best-effort: a failed reseed only costs the next reader a recompute
    async fn reseed_counters(&self, code: &str, counts: &SubjectCounts) {
        let ips = match self.storage.distinct_visitor_ips(code).await {
            Ok(ips) => ips,
            Err(e) => {
                warn!("Failed to load visitor IPs for '{}': {}", code, e);
                return;
            }
        };

        let clicks_key = keys::total_clicks(code);
        let sketch_key = keys::unique_visitors(code);
        let mut ops = vec![FastOp::Set {
            key: clicks_key,
            value: counts.total_clicks.to_string(),
            ttl_secs: Some(self.ttls.counter_secs),
        }];
        for ip in ips {
            ops.push(FastOp::PfAdd {
                key: sketch_key.clone(),
                element: ip,
            });
        }
        ops.push(FastOp::Expire {
            key: sketch_key,
            ttl_secs: self.ttls.counter_secs,
        });

        if let Err(e) = self.fast.multi(ops).await {
            warn!("Failed to reseed counters for '{}': {}", code, e);
        }
    }

    fn aggregate_options(&self) -> CacheOptions {
        CacheOptions {
            memory_ttl: Duration::from_secs(self.ttls.aggregate_secs),
            fast_ttl: Duration::from_secs(self.ttls.aggregate_secs),
            // Rollups must not outlive the fast-store TTL on a single node
            skip_memory: true,
        }
    }

    fn snapshot_options(&self) -> CacheOptions {
        CacheOptions {
            memory_ttl: Duration::from_secs(self.ttls.aggregate_secs),
            fast_ttl: Duration::from_secs(self.ttls.snapshot_secs),
            skip_memory: true,
        }
    }

    /// Rollup across every link under a topic, cached with a short TTL.
    /// Refreshed by TTL expiry only, never invalidated on new visits.
    pub async fn topic_aggregate(&self, topic: &str) -> Result<TopicAggregate> {
        let storage = self.storage.clone();
        let cache = self.cache.clone();
        let topic_owned = topic.to_string();
        let snapshot_opts = self.snapshot_options();

        self.cache
            .get_json(&keys::topic_aggregate(topic), self.aggregate_options(), move || {
                compute_topic_aggregate(storage, cache, topic_owned, snapshot_opts).boxed()
            })
            .await
    }

    /// Rollup across every link an owner has created, cached like topics
    pub async fn owner_aggregate(&self, owner_id: &str) -> Result<OwnerAggregate> {
        let storage = self.storage.clone();
        let cache = self.cache.clone();
        let owner_owned = owner_id.to_string();
        let snapshot_opts = self.snapshot_options();

        self.cache
            .get_json(
                &keys::owner_aggregate(owner_id),
                self.aggregate_options(),
                move || compute_owner_aggregate(storage, cache, owner_owned, snapshot_opts).boxed(),
            )
            .await
    }
}

async fn compute_topic_aggregate(
    storage: Arc<DurableStorage>,
    cache: Arc<LayeredCache>,
    topic: String,
    snapshot_opts: CacheOptions,
) -> Result<TopicAggregate> {
    let codes: Vec<String> = storage
        .links_by_topic(&topic)
        .await?
        .into_iter()
        .map(|l| l.code)
        .collect();
    if codes.is_empty() {
        return Ok(TopicAggregate::default());
    }

    let total_clicks = storage.count_visits(&codes).await?;
    let unique_visitors = storage.count_unique_visitors(&codes).await?;
    let since = Utc::now() - ChronoDuration::days(CLICKS_BY_DATE_DAYS);
    let clicks_by_date = date_counts(storage.clicks_by_date(&codes, since).await?);

    // The per-link breakdown is the expensive part, so it lives under its
    // own longer-lived snapshot key.
    let links = {
        let storage = storage.clone();
        let codes = codes.clone();
        cache
            .get_json(
                &keys::topic_links_snapshot(&topic),
                snapshot_opts,
                move || {
                    async move {
                        let stats = storage.per_code_stats(&codes).await?;
                        Ok(stats
                            .into_iter()
                            .map(|row| LinkCounts {
                                code: row.code,
                                total_clicks: row.clicks.max(0) as u64,
                                unique_visitors: row.uniques.max(0) as u64,
                            })
                            .collect::<Vec<_>>())
                    }
                    .boxed()
                },
            )
            .await?
    };

    Ok(TopicAggregate {
        total_clicks,
        unique_visitors,
        clicks_by_date,
        links,
    })
}

async fn compute_owner_aggregate(
    storage: Arc<DurableStorage>,
    cache: Arc<LayeredCache>,
    owner_id: String,
    snapshot_opts: CacheOptions,
) -> Result<OwnerAggregate> {
    let links = storage.links_by_owner(&owner_id).await?;
    let total_links = links.len() as u64;
    let codes: Vec<String> = links.into_iter().map(|l| l.code).collect();
    if codes.is_empty() {
        return Ok(OwnerAggregate::default());
    }

    let total_clicks = storage.count_visits(&codes).await?;
    let unique_visitors = storage.count_unique_visitors(&codes).await?;
    let since = Utc::now() - ChronoDuration::days(CLICKS_BY_DATE_DAYS);
    let clicks_by_date = date_counts(storage.clicks_by_date(&codes, since).await?);

    let (os_stats, device_stats) = {
        let storage = storage.clone();
        let codes = codes.clone();
        cache
            .get_json(
                &keys::owner_breakdown_snapshot(&owner_id),
                snapshot_opts,
                move || {
                    async move {
                        let os = breakdown_rows(storage.os_breakdown(&codes).await?);
                        let device = breakdown_rows(storage.device_breakdown(&codes).await?);
                        Ok((os, device))
                    }
                    .boxed()
                },
            )
            .await?
    };

    Ok(OwnerAggregate {
        total_links,
        total_clicks,
        unique_visitors,
        clicks_by_date,
        os_stats,
        device_stats,
    })
}

fn date_counts(rows: Vec<crate::storage::DateCount>) -> Vec<ClicksByDate> {
    rows.into_iter()
        .map(|row| ClicksByDate {
            date: row.date,
            clicks: row.clicks.max(0) as u64,
        })
        .collect()
}

fn breakdown_rows(rows: Vec<crate::storage::GroupStats>) -> Vec<BreakdownRow> {
    rows.into_iter()
        .map(|row| BreakdownRow {
            name: row.name.unwrap_or_else(|| "unknown".to_string()),
            clicks: row.clicks.max(0) as u64,
            unique_visitors: row.uniques.max(0) as u64,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fast::MemoryFastStore;

    async fn service() -> (AnalyticsService, Arc<dyn FastStore>, Arc<DurableStorage>) {
        let fast: Arc<dyn FastStore> = Arc::new(MemoryFastStore::new());
        let dir = tempfile::tempdir().unwrap();
        let url = format!(
            "sqlite://{}?mode=rwc",
            dir.path().join("analytics.db").display()
        );
        let storage = Arc::new(
            DurableStorage::new(&url, 5, Duration::from_secs(2))
                .await
                .unwrap(),
        );
        std::mem::forget(dir);
        let cache = Arc::new(LayeredCache::new(fast.clone()));
        (
            AnalyticsService::new(fast.clone(), storage.clone(), cache, AnalyticsTtls::default()),
            fast,
            storage,
        )
    }

    fn visitor(ip: &str) -> VisitorInfo {
        VisitorInfo {
            visitor_ip: ip.to_string(),
            os_type: Some("Linux".to_string()),
            device_type: Some("desktop".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn hits_with_distinct_visitors_count_exactly() {
        let (service, _, _) = service().await;
        for i in 0..50 {
            service
                .record_hit("abc", visitor(&format!("10.0.0.{i}")))
                .await
                .unwrap();
        }

        let counts = service.read_counts("abc").await.unwrap();
        assert_eq!(counts.total_clicks, 50);
        // 50 distinct IPs is inside the sketch's exact small-range regime
        assert_eq!(counts.unique_visitors, 50);
    }

    #[tokio::test]
    async fn repeat_visitors_do_not_inflate_uniques() {
        let (service, _, _) = service().await;
        for _ in 0..10 {
            service.record_hit("abc", visitor("10.0.0.1")).await.unwrap();
        }
        let counts = service.read_counts("abc").await.unwrap();
        assert_eq!(counts.total_clicks, 10);
        assert_eq!(counts.unique_visitors, 1);
    }

    #[tokio::test]
    async fn hit_path_stages_fact_without_durable_write() {
        let (service, fast, storage) = service().await;
        let fact_key = service.record_hit("abc", visitor("10.0.0.1")).await.unwrap();

        let pending = fast.smembers(keys::PENDING_VISITS).await.unwrap();
        assert_eq!(pending, vec![fact_key.clone()]);
        let fields = fast.hgetall(&fact_key).await.unwrap();
        let staged = VisitFact::from_hash_fields(&fields).unwrap();
        assert_eq!(staged.code, "abc");
        assert_eq!(
            storage.count_visits(&["abc".to_string()]).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn cold_counter_recomputes_from_ledger_and_reseeds() {
        let (service, fast, storage) = service().await;
        // Durable rows exist but the fast-store counters are cold
        let facts: Vec<VisitFact> = (0..5)
            .map(|i| VisitFact {
                fact_key: format!("visit:abc:{i}"),
                code: "abc".to_string(),
                visitor: visitor(&format!("10.1.0.{i}")),
                visited_at: Utc::now(),
            })
            .collect();
        storage.insert_visits_ignore_conflicts(&facts).await.unwrap();

        let counts = service.read_counts("abc").await.unwrap();
        assert_eq!(counts.total_clicks, 5);
        assert_eq!(counts.unique_visitors, 5);

        // Reseed happened: the counter is readable directly now
        let raw = fast
            .get(&keys::total_clicks("abc"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(raw, "5");
        assert_eq!(
            fast.pfcount(&keys::unique_visitors("abc")).await.unwrap(),
            5
        );
    }

    #[tokio::test]
    async fn counts_degrade_to_ledger_when_fast_store_is_down() {
        let (_, _, storage) = service().await;
        let facts: Vec<VisitFact> = (0..4)
            .map(|i| VisitFact {
                fact_key: format!("visit:abc:{i}"),
                code: "abc".to_string(),
                visitor: visitor(&format!("10.3.0.{i}")),
                visited_at: Utc::now(),
            })
            .collect();
        storage.insert_visits_ignore_conflicts(&facts).await.unwrap();

        let failing: Arc<dyn FastStore> = Arc::new(crate::fast::testing::FailingFastStore);
        let service = AnalyticsService::new(
            failing.clone(),
            storage,
            Arc::new(LayeredCache::new(failing)),
            AnalyticsTtls::default(),
        );

        // Counter lookup errors; the read answers from the durable ledger
        let counts = service.read_counts("abc").await.unwrap();
        assert_eq!(counts.total_clicks, 4);
        assert_eq!(counts.unique_visitors, 4);
    }

    #[tokio::test]
    async fn counts_for_unknown_code_are_zero() {
        let (service, _, _) = service().await;
        let counts = service.read_counts("nothing").await.unwrap();
        assert_eq!(counts.total_clicks, 0);
        assert_eq!(counts.unique_visitors, 0);
    }

    #[tokio::test]
    async fn aggregates_for_empty_subjects_are_default() {
        let (service, _, _) = service().await;
        let topic = service.topic_aggregate("ghost").await.unwrap();
        assert_eq!(topic, TopicAggregate::default());
        let owner = service.owner_aggregate("nobody").await.unwrap();
        assert_eq!(owner, OwnerAggregate::default());
    }
}
