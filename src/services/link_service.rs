//! Link service
//!
//! Write-behind create/resolve for short-code → URL mappings. Creation
//! answers from the fast store immediately; the durable row is written later
//! by the reconciler draining the pending ledger. Resolution prefers the
//! fast store and repopulates it from the durable store on a miss, so
//! read-your-writes holds from the moment `create_link` returns.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::errors::{Result, SnaplinkError};
use crate::fast::{FastOp, FastStore, KeyKind};
use crate::keys;
use crate::models::{Link, SyncStatus};
use crate::storage::DurableStorage;
use crate::utils::{CODE_LENGTH, generate_random_code, is_valid_code};

/// Request to create a new link
#[derive(Debug, Clone)]
pub struct CreateLinkRequest {
    pub owner_id: String,
    pub long_url: String,
    /// Custom short code; generated when absent
    pub custom_code: Option<String>,
    pub topic: Option<String>,
}

/// Fast-store representation of a link, resolved at read time. Old
/// deployments stored the destination as a flat string under the same key;
/// new writes always use the hash form.
#[derive(Debug, Clone)]
enum FastLink {
    Structured(Link),
    Legacy(String),
    Missing,
}

pub struct LinkService {
    fast: Arc<dyn FastStore>,
    storage: Arc<DurableStorage>,
    link_ttl_secs: u64,
}

impl LinkService {
    pub fn new(fast: Arc<dyn FastStore>, storage: Arc<DurableStorage>, link_ttl_secs: u64) -> Self {
        Self {
            fast,
            storage,
            link_ttl_secs,
        }
    }

    /// Create a link and return it without waiting for the durable commit.
    ///
    /// Custom codes are checked for uniqueness against the durable store
    /// only; a code still sitting in the pending ledger is not seen by this
    /// check. The reconciler's conflict-safe insert makes the first durably
    /// committed writer win.
    pub async fn create_link(&self, request: CreateLinkRequest) -> Result<Link> {
        let code = match request.custom_code {
            Some(code) => {
                if !is_valid_code(&code) {
                    return Err(SnaplinkError::validation(format!(
                        "Invalid short code: '{code}'"
                    )));
                }
                if self.storage.link_exists(&code).await? {
                    return Err(SnaplinkError::alias_taken(format!(
                        "Short code '{code}' already exists"
                    )));
                }
                code
            }
            None => generate_random_code(CODE_LENGTH),
        };

        let link = Link {
            code: code.clone(),
            long_url: request.long_url,
            owner_id: request.owner_id,
            topic: request.topic,
            created_at: Utc::now(),
            last_accessed_at: None,
            sync_status: SyncStatus::Pending,
        };

        // Payload, TTL and ledger membership must land together, otherwise a
        // crash could leave a ledger entry with no payload (or the reverse).
        let key = keys::link(&code);
        self.fast
            .multi(vec![
                FastOp::HSetAll {
                    key: key.clone(),
                    fields: link.to_hash_fields(),
                },
                FastOp::Expire {
                    key,
                    ttl_secs: self.link_ttl_secs,
                },
                FastOp::SAdd {
                    key: keys::PENDING_LINKS.to_string(),
                    member: code.clone(),
                },
            ])
            .await?;

        info!("Created link '{}' (pending durable commit)", code);
        Ok(link)
    }

    /// Resolve a code to its destination URL.
    pub async fn resolve(&self, code: &str) -> Result<String> {
        match self.fast_lookup(code).await {
            Ok(FastLink::Structured(link)) => {
                self.touch_last_accessed(code).await;
                return Ok(link.long_url);
            }
            Ok(FastLink::Legacy(long_url)) => {
                self.spawn_legacy_migration(code.to_string());
                return Ok(long_url);
            }
            Ok(FastLink::Missing) => {}
            Err(e) => {
                // Fast store down: serve from the durable store directly
                warn!("Fast store lookup failed for '{}': {}", code, e);
            }
        }

        match self.storage.get_link(code).await? {
            Some(link) => {
                self.repopulate_fast(&link).await;
                if let Err(e) = self.storage.touch_last_accessed(code).await {
                    debug!("Failed to touch durable last_accessed for '{}': {}", code, e);
                }
                Ok(link.long_url)
            }
            None => Err(SnaplinkError::not_found(format!(
                "Short code '{code}' does not exist"
            ))),
        }
    }

    /// Read the fast-store copy, distinguishing hash, legacy flat string and
    /// absent. An unparseable hash counts as missing.
    async fn fast_lookup(&self, code: &str) -> Result<FastLink> {
        let key = keys::link(code);
        match self.fast.key_type(&key).await? {
            KeyKind::Hash => {
                let fields = self.fast.hgetall(&key).await?;
                match Link::from_hash_fields(&fields) {
                    Ok(link) => Ok(FastLink::Structured(link)),
                    Err(e) => {
                        warn!("Corrupt link hash under '{}': {}", key, e);
                        Ok(FastLink::Missing)
                    }
                }
            }
            KeyKind::Str => match self.fast.get(&key).await? {
                Some(long_url) => Ok(FastLink::Legacy(long_url)),
                None => Ok(FastLink::Missing),
            },
            KeyKind::Missing => Ok(FastLink::Missing),
            KeyKind::Set | KeyKind::Other => {
                warn!("Unexpected key type under '{}', treating as miss", key);
                Ok(FastLink::Missing)
            }
        }
    }

    /// Advisory access marker; losing it costs nothing
    async fn touch_last_accessed(&self, code: &str) {
        let key = keys::link(code);
        if let Err(e) = self
            .fast
            .hset(&key, "last_accessed_at", &Utc::now().to_rfc3339())
            .await
        {
            debug!("Failed to touch last_accessed_at for '{}': {}", code, e);
        }
    }

    /// Rewrite a legacy flat value into the hash form, off the request path.
    /// The payload comes from the durable row; a legacy key with no durable
    /// row is left alone and keeps serving as a flat string until it expires.
    fn spawn_legacy_migration(&self, code: String) {
        let fast = self.fast.clone();
        let storage = self.storage.clone();
        let ttl = self.link_ttl_secs;
        tokio::spawn(async move {
            if let Err(e) = migrate_legacy_link(fast, storage, &code, ttl).await {
                warn!("Legacy link migration failed for '{}': {}", code, e);
            }
        });
    }

    /// Best-effort fast-store refill after a durable-store hit
    async fn repopulate_fast(&self, link: &Link) {
        let key = keys::link(&link.code);
        let result = self
            .fast
            .multi(vec![
                FastOp::HSetAll {
                    key: key.clone(),
                    fields: link.to_hash_fields(),
                },
                FastOp::Expire {
                    key,
                    ttl_secs: self.link_ttl_secs,
                },
            ])
            .await;
        if let Err(e) = result {
            warn!("Failed to repopulate fast store for '{}': {}", link.code, e);
        }
    }
}

/// Idempotent legacy-to-hash transition: re-checks the key shape under the
/// atomic batch's lock window, so a concurrent migration of the same code
/// settles on one hash write.
async fn migrate_legacy_link(
    fast: Arc<dyn FastStore>,
    storage: Arc<DurableStorage>,
    code: &str,
    ttl_secs: u64,
) -> Result<()> {
    let key = keys::link(code);
    if fast.key_type(&key).await? != KeyKind::Str {
        return Ok(());
    }

    let Some(link) = storage.get_link(code).await? else {
        debug!("Legacy key '{}' has no durable row, leaving flat value", key);
        return Ok(());
    };

    fast.multi(vec![
        FastOp::Del { key: key.clone() },
        FastOp::HSetAll {
            key: key.clone(),
            fields: link.to_hash_fields(),
        },
        FastOp::Expire {
            key,
            ttl_secs,
        },
    ])
    .await?;

    info!("Migrated legacy link '{}' to hash form", code);
    Ok(())
}
