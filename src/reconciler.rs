//! Write-behind reconciler
//!
//! Drains the pending-write ledgers from the fast store into the durable
//! store in bounded batches. Every durable insert is conflict-safe, so a
//! batch that fails half-way can be re-run without producing duplicate rows.
//! A ledger entry is removed only after its durable row is confirmed: a code
//! leaves `pending_urls` iff its row exists.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use tracing::{info, warn};

use crate::errors::Result;
use crate::fast::{FastOp, FastStore, KeyKind};
use crate::keys;
use crate::models::{Link, SyncStatus, VisitFact};
use crate::storage::DurableStorage;

pub struct Reconciler {
    fast: Arc<dyn FastStore>,
    storage: Arc<DurableStorage>,
    batch_size: usize,
    link_ttl_secs: u64,
    counter_ttl_secs: u64,
}

impl Reconciler {
    pub fn new(
        fast: Arc<dyn FastStore>,
        storage: Arc<DurableStorage>,
        batch_size: usize,
        link_ttl_secs: u64,
        counter_ttl_secs: u64,
    ) -> Self {
        Self {
            fast,
            storage,
            batch_size,
            link_ttl_secs,
            counter_ttl_secs,
        }
    }

    /// Drain `pending_urls` into the durable `links` table. Returns the
    /// number of codes committed and removed from the ledger.
    ///
    /// A durable failure leaves the whole batch in the ledger for the next
    /// run. Entries whose staged payload is gone or unreadable are skipped
    /// here and left for the cleanup pass.
    pub async fn process_pending_links(&self) -> Result<usize> {
        let pending = self.fast.smembers(keys::PENDING_LINKS).await?;
        if pending.is_empty() {
            return Ok(0);
        }

        let mut drained = 0;
        for chunk in pending.chunks(self.batch_size) {
            let mut batch: Vec<Link> = Vec::with_capacity(chunk.len());
            for code in chunk {
                match self.load_staged_link(code).await {
                    Some(link) => batch.push(link),
                    None => warn!("Pending link '{}' has no readable payload, skipping", code),
                }
            }
            if batch.is_empty() {
                continue;
            }

            // Conflict-safe: re-inserting an already-committed code is a no-op
            self.storage.insert_links_ignore_conflicts(&batch).await?;

            let mut ops = Vec::with_capacity(batch.len() * 3);
            for link in &batch {
                // The payload may expire between load and promotion, in which
                // case the status write recreates the key as a bare stub; the
                // paired expire keeps that stub from living forever.
                ops.push(FastOp::HSet {
                    key: keys::link(&link.code),
                    field: "status".to_string(),
                    value: SyncStatus::Synced.as_str().to_string(),
                });
                ops.push(FastOp::Expire {
                    key: keys::link(&link.code),
                    ttl_secs: self.link_ttl_secs,
                });
                ops.push(FastOp::SRem {
                    key: keys::PENDING_LINKS.to_string(),
                    member: link.code.clone(),
                });
            }
            self.fast.multi(ops).await?;
            drained += batch.len();
        }

        if drained > 0 {
            info!("Reconciled {} pending link(s)", drained);
        }
        Ok(drained)
    }

    async fn load_staged_link(&self, code: &str) -> Option<Link> {
        let fields = self.fast.hgetall(&keys::link(code)).await.ok()?;
        if fields.is_empty() {
            return None;
        }
        Link::from_hash_fields(&fields).ok()
    }

    /// Drain `pending_visits` into the durable `visits` table. The staged
    /// fact hash is deleted together with its ledger entry after commit.
    pub async fn process_pending_visits(&self) -> Result<usize> {
        let pending = self.fast.smembers(keys::PENDING_VISITS).await?;
        if pending.is_empty() {
            return Ok(0);
        }

        let mut drained = 0;
        for chunk in pending.chunks(self.batch_size) {
            let mut batch: Vec<VisitFact> = Vec::with_capacity(chunk.len());
            for fact_key in chunk {
                match self.load_staged_fact(fact_key).await {
                    Some(fact) => batch.push(fact),
                    None => warn!("Pending visit '{}' has no readable payload, skipping", fact_key),
                }
            }
            if batch.is_empty() {
                continue;
            }

            // fact_key is unique in the table, so retries cannot double-insert
            self.storage.insert_visits_ignore_conflicts(&batch).await?;

            let mut ops = Vec::with_capacity(batch.len() * 2);
            for fact in &batch {
                ops.push(FastOp::SRem {
                    key: keys::PENDING_VISITS.to_string(),
                    member: fact.fact_key.clone(),
                });
                ops.push(FastOp::Del {
                    key: fact.fact_key.clone(),
                });
            }
            self.fast.multi(ops).await?;
            drained += batch.len();
        }

        if drained > 0 {
            info!("Reconciled {} pending visit(s)", drained);
        }
        Ok(drained)
    }

    async fn load_staged_fact(&self, fact_key: &str) -> Option<VisitFact> {
        let fields = self.fast.hgetall(fact_key).await.ok()?;
        if fields.is_empty() {
            return None;
        }
        VisitFact::from_hash_fields(&fields).ok()
    }

    /// Reseed fast-store counters that went cold for codes with recent
    /// durable activity, so hot links keep their fast-path reads. Returns
    /// the number of codes reseeded.
    pub async fn reconcile_counters(&self) -> Result<usize> {
        let since = Utc::now() - ChronoDuration::hours(1);
        let codes = self.storage.codes_with_visits_since(since).await?;

        let mut reseeded = 0;
        for code in codes {
            if self.fast.get(&keys::total_clicks(&code)).await?.is_some() {
                continue;
            }

            let total = self.storage.count_visits(std::slice::from_ref(&code)).await?;
            let ips = self.storage.distinct_visitor_ips(&code).await?;

            let clicks_key = keys::total_clicks(&code);
            let sketch_key = keys::unique_visitors(&code);
            let mut ops = vec![FastOp::Set {
                key: clicks_key,
                value: total.to_string(),
                ttl_secs: Some(self.counter_ttl_secs),
            }];
            for ip in ips {
                ops.push(FastOp::PfAdd {
                    key: sketch_key.clone(),
                    element: ip,
                });
            }
            ops.push(FastOp::Expire {
                key: sketch_key,
                ttl_secs: self.counter_ttl_secs,
            });
            self.fast.multi(ops).await?;
            reseeded += 1;
        }

        if reseeded > 0 {
            info!("Reseeded counters for {} code(s)", reseeded);
        }
        Ok(reseeded)
    }

    /// Remove ledger entries whose staged payload was evicted before it
    /// could be drained (logged as data loss) and staged visit hashes no
    /// longer referenced by the ledger. Returns the number of keys purged.
    pub async fn cleanup_expired(&self) -> Result<usize> {
        let mut purged = 0;

        for code in self.fast.smembers(keys::PENDING_LINKS).await? {
            if self.fast.key_type(&keys::link(&code)).await? != KeyKind::Hash {
                warn!(
                    "Pending link '{}' lost its staged payload before reconciliation, dropping",
                    code
                );
                self.fast.srem(keys::PENDING_LINKS, &code).await?;
                purged += 1;
            }
        }

        for fact_key in self.fast.smembers(keys::PENDING_VISITS).await? {
            if self.fast.key_type(&fact_key).await? != KeyKind::Hash {
                warn!(
                    "Pending visit '{}' lost its staged payload before reconciliation, dropping",
                    fact_key
                );
                self.fast.srem(keys::PENDING_VISITS, &fact_key).await?;
                purged += 1;
            }
        }

        // Orphan fact hashes: staged but no longer in the ledger. Membership
        // is checked against the live ledger right before each delete, never
        // a snapshot, so a fact staged concurrently with the scan survives.
        for key in self.fast.scan_prefix(keys::VISIT_PREFIX).await? {
            if self.fast.key_type(&key).await? != KeyKind::Hash {
                continue;
            }
            if self.fast.sismember(keys::PENDING_VISITS, &key).await? {
                continue;
            }
            self.fast.del(&key).await?;
            purged += 1;
        }

        if purged > 0 {
            info!("Cleanup removed {} stale key(s)", purged);
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use crate::fast::MemoryFastStore;
    use crate::models::VisitorInfo;
    use crate::services::link_service::{CreateLinkRequest, LinkService};

    async fn durable() -> Arc<DurableStorage> {
        let dir = tempfile::tempdir().unwrap();
        let url = format!(
            "sqlite://{}?mode=rwc",
            dir.path().join("reconciler.db").display()
        );
        let storage = Arc::new(
            DurableStorage::new(&url, 5, std::time::Duration::from_secs(2))
                .await
                .unwrap(),
        );
        std::mem::forget(dir);
        storage
    }

    async fn setup() -> (Reconciler, LinkService, Arc<dyn FastStore>, Arc<DurableStorage>) {
        let fast: Arc<dyn FastStore> = Arc::new(MemoryFastStore::new());
        let storage = durable().await;
        (
            Reconciler::new(fast.clone(), storage.clone(), 100, 86_400, 86_400),
            LinkService::new(fast.clone(), storage.clone(), 86_400),
            fast,
            storage,
        )
    }

    /// In-process store that injects one concurrent mutation at a chosen
    /// point, for exercising races against the cleanup and promotion paths.
    #[derive(Default)]
    struct RacingFastStore {
        inner: MemoryFastStore,
        /// Batch applied just before the first key scan, as if another task
        /// staged it mid-pass
        stage_on_scan: std::sync::Mutex<Option<Vec<FastOp>>>,
        /// Key deleted just before the first batch that promotes it, as if
        /// its TTL fired mid-pass
        drop_before_write: std::sync::Mutex<Option<String>>,
    }

    #[async_trait]
    impl FastStore for RacingFastStore {
        async fn get(&self, key: &str) -> Result<Option<String>> {
            self.inner.get(key).await
        }

        async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
            self.inner.set_ex(key, value, ttl_secs).await
        }

        async fn del(&self, key: &str) -> Result<()> {
            self.inner.del(key).await
        }

        async fn key_type(&self, key: &str) -> Result<KeyKind> {
            self.inner.key_type(key).await
        }

        async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
            self.inner.hgetall(key).await
        }

        async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
            self.inner.hset(key, field, value).await
        }

        async fn sadd(&self, key: &str, member: &str) -> Result<()> {
            self.inner.sadd(key, member).await
        }

        async fn srem(&self, key: &str, member: &str) -> Result<()> {
            self.inner.srem(key, member).await
        }

        async fn sismember(&self, key: &str, member: &str) -> Result<bool> {
            self.inner.sismember(key, member).await
        }

        async fn smembers(&self, key: &str) -> Result<Vec<String>> {
            self.inner.smembers(key).await
        }

        async fn incr(&self, key: &str) -> Result<i64> {
            self.inner.incr(key).await
        }

        async fn pfadd(&self, key: &str, element: &str) -> Result<()> {
            self.inner.pfadd(key, element).await
        }

        async fn pfcount(&self, key: &str) -> Result<u64> {
            self.inner.pfcount(key).await
        }

        async fn expire(&self, key: &str, ttl_secs: u64) -> Result<()> {
            self.inner.expire(key, ttl_secs).await
        }

        async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
            let staged = self.stage_on_scan.lock().unwrap().take();
            if let Some(ops) = staged {
                self.inner.multi(ops).await?;
            }
            self.inner.scan_prefix(prefix).await
        }

        async fn multi(&self, ops: Vec<FastOp>) -> Result<()> {
            let victim = {
                let mut guard = self.drop_before_write.lock().unwrap();
                let armed = guard.as_ref().is_some_and(|key| {
                    ops.iter()
                        .any(|op| matches!(op, FastOp::HSet { key: k, .. } if k == key))
                });
                if armed { guard.take() } else { None }
            };
            if let Some(key) = victim {
                self.inner.del(&key).await?;
            }
            self.inner.multi(ops).await
        }
    }

    fn request(code: &str) -> CreateLinkRequest {
        CreateLinkRequest {
            owner_id: "u1".to_string(),
            long_url: format!("https://example.com/{code}"),
            custom_code: Some(code.to_string()),
            topic: None,
        }
    }

    #[tokio::test]
    async fn empty_ledger_drain_is_a_noop() {
        let (reconciler, _, _, _) = setup().await;
        assert_eq!(reconciler.process_pending_links().await.unwrap(), 0);
        assert_eq!(reconciler.process_pending_links().await.unwrap(), 0);
        assert_eq!(reconciler.process_pending_visits().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn drain_commits_row_promotes_status_and_clears_ledger() {
        let (reconciler, links, fast, storage) = setup().await;
        links.create_link(request("abc")).await.unwrap();

        assert_eq!(reconciler.process_pending_links().await.unwrap(), 1);

        let row = storage.get_link("abc").await.unwrap().unwrap();
        assert_eq!(row.long_url, "https://example.com/abc");
        assert!(fast.smembers(keys::PENDING_LINKS).await.unwrap().is_empty());
        let fields = fast.hgetall(&keys::link("abc")).await.unwrap();
        assert_eq!(fields.get("status").map(String::as_str), Some("synced"));
    }

    #[tokio::test]
    async fn redundant_drain_never_duplicates_rows() {
        let (reconciler, links, fast, storage) = setup().await;
        links.create_link(request("abc")).await.unwrap();

        // First drain commits the row. Re-adding the ledger entry simulates
        // a crash after the durable commit but before the ledger removal.
        reconciler.process_pending_links().await.unwrap();
        fast.sadd(keys::PENDING_LINKS, "abc").await.unwrap();
        reconciler.process_pending_links().await.unwrap();

        assert!(storage.get_link("abc").await.unwrap().is_some());
        let all = storage.links_by_owner("u1").await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn divergent_pending_entries_converge_to_first_committed_row() {
        let (reconciler, links, fast, storage) = setup().await;
        // Two creators passed the durable uniqueness check before either
        // reconciled; the second payload overwrote the staged hash.
        links.create_link(request("abc")).await.unwrap();
        let winner = storage.get_link("abc").await.unwrap();
        assert!(winner.is_none());

        // First writer reaches the durable store out of band
        let first = Link {
            code: "abc".to_string(),
            long_url: "https://first.example".to_string(),
            owner_id: "u0".to_string(),
            topic: None,
            created_at: Utc::now(),
            last_accessed_at: None,
            sync_status: SyncStatus::Synced,
        };
        storage.insert_links_ignore_conflicts(&[first]).await.unwrap();

        reconciler.process_pending_links().await.unwrap();

        // The later upsert was silently ignored and the ledger cleared
        let row = storage.get_link("abc").await.unwrap().unwrap();
        assert_eq!(row.long_url, "https://first.example");
        assert!(fast.smembers(keys::PENDING_LINKS).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn visit_drain_commits_facts_and_deletes_staging() {
        let (reconciler, _, fast, storage) = setup().await;
        let fact = VisitFact {
            fact_key: keys::visit_fact("abc", "0001"),
            code: "abc".to_string(),
            visitor: VisitorInfo {
                visitor_ip: "203.0.113.7".to_string(),
                ..Default::default()
            },
            visited_at: Utc::now(),
        };
        fast.multi(vec![
            FastOp::HSetAll {
                key: fact.fact_key.clone(),
                fields: fact.to_hash_fields(),
            },
            FastOp::SAdd {
                key: keys::PENDING_VISITS.to_string(),
                member: fact.fact_key.clone(),
            },
        ])
        .await
        .unwrap();

        assert_eq!(reconciler.process_pending_visits().await.unwrap(), 1);
        assert_eq!(
            storage.count_visits(&["abc".to_string()]).await.unwrap(),
            1
        );
        assert!(fast.smembers(keys::PENDING_VISITS).await.unwrap().is_empty());
        assert_eq!(fast.key_type(&fact.fact_key).await.unwrap(), KeyKind::Missing);
    }

    #[tokio::test]
    async fn counter_reconcile_reseeds_only_cold_codes() {
        let (reconciler, _, fast, storage) = setup().await;
        let facts: Vec<VisitFact> = (0..3)
            .map(|i| VisitFact {
                fact_key: keys::visit_fact("abc", &i.to_string()),
                code: "abc".to_string(),
                visitor: VisitorInfo {
                    visitor_ip: format!("10.2.0.{i}"),
                    ..Default::default()
                },
                visited_at: Utc::now(),
            })
            .collect();
        storage.insert_visits_ignore_conflicts(&facts).await.unwrap();

        assert_eq!(reconciler.reconcile_counters().await.unwrap(), 1);
        assert_eq!(
            fast.get(&keys::total_clicks("abc")).await.unwrap().unwrap(),
            "3"
        );
        assert_eq!(fast.pfcount(&keys::unique_visitors("abc")).await.unwrap(), 3);

        // Warm counter, nothing to do
        assert_eq!(reconciler.reconcile_counters().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn cleanup_drops_ledger_entries_with_evicted_payloads() {
        let (reconciler, _, fast, _) = setup().await;
        // Ledger references with no staged payload behind them
        fast.sadd(keys::PENDING_LINKS, "ghost").await.unwrap();
        fast.sadd(keys::PENDING_VISITS, "visit:ghost:1").await.unwrap();
        // An orphan staged fact hash with no ledger entry
        fast.multi(vec![FastOp::HSetAll {
            key: "visit:orphan:2".to_string(),
            fields: vec![("code".to_string(), "orphan".to_string())],
        }])
        .await
        .unwrap();

        assert_eq!(reconciler.cleanup_expired().await.unwrap(), 3);
        assert!(fast.smembers(keys::PENDING_LINKS).await.unwrap().is_empty());
        assert!(fast.smembers(keys::PENDING_VISITS).await.unwrap().is_empty());
        assert_eq!(
            fast.key_type("visit:orphan:2").await.unwrap(),
            KeyKind::Missing
        );
    }

    #[tokio::test]
    async fn cleanup_keeps_visit_staged_during_its_own_scan() {
        let fact = VisitFact {
            fact_key: keys::visit_fact("abc", "race1"),
            code: "abc".to_string(),
            visitor: VisitorInfo {
                visitor_ip: "10.9.0.1".to_string(),
                ..Default::default()
            },
            visited_at: Utc::now(),
        };
        let racing = RacingFastStore::default();
        *racing.stage_on_scan.lock().unwrap() = Some(vec![
            FastOp::HSetAll {
                key: fact.fact_key.clone(),
                fields: fact.to_hash_fields(),
            },
            FastOp::SAdd {
                key: keys::PENDING_VISITS.to_string(),
                member: fact.fact_key.clone(),
            },
        ]);
        let fast: Arc<dyn FastStore> = Arc::new(racing);
        let storage = durable().await;
        let reconciler = Reconciler::new(fast.clone(), storage.clone(), 100, 86_400, 86_400);

        // The fact lands after cleanup snapshotted the ledger but before it
        // scanned the keyspace; it must not be purged as an orphan.
        assert_eq!(reconciler.cleanup_expired().await.unwrap(), 0);
        assert_eq!(fast.key_type(&fact.fact_key).await.unwrap(), KeyKind::Hash);
        assert!(
            fast.smembers(keys::PENDING_VISITS)
                .await
                .unwrap()
                .contains(&fact.fact_key)
        );

        // And the next drain still commits it
        assert_eq!(reconciler.process_pending_visits().await.unwrap(), 1);
        assert_eq!(storage.count_visits(&["abc".to_string()]).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn promotion_after_payload_expiry_leaves_no_immortal_stub() {
        let racing = RacingFastStore::default();
        *racing.drop_before_write.lock().unwrap() = Some(keys::link("abc"));
        let fast: Arc<dyn FastStore> = Arc::new(racing);
        let storage = durable().await;
        let reconciler = Reconciler::new(fast.clone(), storage.clone(), 100, 1, 86_400);
        let links = LinkService::new(fast.clone(), storage.clone(), 86_400);
        links.create_link(request("abc")).await.unwrap();

        // The staged payload expires between load and promotion; the status
        // write recreates the key as a stub, which must carry a TTL.
        assert_eq!(reconciler.process_pending_links().await.unwrap(), 1);
        assert!(storage.get_link("abc").await.unwrap().is_some());

        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        assert_eq!(
            fast.key_type(&keys::link("abc")).await.unwrap(),
            KeyKind::Missing
        );
    }
}
