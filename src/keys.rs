//! Fast-store key layout
//!
//! Every key the crate writes into the fast store is built here so the
//! naming stays in one place. The reconciler and the cleanup pass depend on
//! these shapes for prefix scans.

/// Link payload, hash form (or legacy flat string under the same key)
pub fn link(code: &str) -> String {
    format!("url:{code}")
}

/// Ledger of codes awaiting durable commit
pub const PENDING_LINKS: &str = "pending_urls";

/// Staged visit fact; `fact_key` doubles as the durable idempotency key
pub fn visit_fact(code: &str, id: &str) -> String {
    format!("visit:{code}:{id}")
}

pub const VISIT_PREFIX: &str = "visit:";

/// Ledger of staged visit fact keys awaiting durable commit
pub const PENDING_VISITS: &str = "pending_visits";

/// Exact per-code click counter
pub fn total_clicks(code: &str) -> String {
    format!("stats:{code}:total_clicks")
}

/// Per-code unique-visitor cardinality sketch
pub fn unique_visitors(code: &str) -> String {
    format!("stats:{code}:unique_visitors")
}

/// Cached topic rollup (layered cache envelope)
pub fn topic_aggregate(topic: &str) -> String {
    format!("agg:topic:{topic}")
}

/// Cached owner rollup (layered cache envelope)
pub fn owner_aggregate(owner_id: &str) -> String {
    format!("agg:owner:{owner_id}")
}

/// Longer-lived snapshot of a topic's per-link breakdown rows
pub fn topic_links_snapshot(topic: &str) -> String {
    format!("topic:{topic}:links")
}

/// Longer-lived snapshot of an owner's OS/device breakdown rows
pub fn owner_breakdown_snapshot(owner_id: &str) -> String {
    format!("owner:{owner_id}:breakdowns")
}
