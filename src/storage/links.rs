//! Link table operations
//!
//! The durable `links` table is written almost exclusively by the
//! reconciler; the conflict-safe bulk insert is what makes ledger draining
//! idempotent (re-running a batch can never produce a second row per code).

use chrono::Utc;
use sea_orm::{
    ActiveValue::Set, ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter,
    sea_query::OnConflict,
};
use tracing::debug;

use super::DurableStorage;
use super::converters::{link_to_active_model, model_to_link};
use crate::errors::{Result, SnaplinkError};
use crate::models::Link;
use migration::entities::link;

impl DurableStorage {
    pub async fn get_link(&self, code: &str) -> Result<Option<Link>> {
        let model = link::Entity::find_by_id(code)
            .one(&self.db)
            .await
            .map_err(|e| SnaplinkError::database_operation(format!("link lookup failed: {e}")))?;
        Ok(model.map(model_to_link))
    }

    pub async fn link_exists(&self, code: &str) -> Result<bool> {
        let count = link::Entity::find()
            .filter(link::Column::Code.eq(code))
            .count(&self.db)
            .await
            .map_err(|e| SnaplinkError::database_operation(format!("exists check failed: {e}")))?;
        Ok(count > 0)
    }

    /// Bulk insert that ignores duplicate codes. At most one durable row per
    /// code, no matter how often a batch is replayed.
    pub async fn insert_links_ignore_conflicts(&self, links: &[Link]) -> Result<()> {
        if links.is_empty() {
            return Ok(());
        }

        let models: Vec<link::ActiveModel> = links.iter().map(link_to_active_model).collect();

        link::Entity::insert_many(models)
            .on_conflict(
                OnConflict::column(link::Column::Code)
                    .do_nothing()
                    .to_owned(),
            )
            .do_nothing()
            .exec(&self.db)
            .await
            .map_err(|e| SnaplinkError::database_operation(format!("bulk link insert failed: {e}")))?;

        debug!("Inserted batch of {} links (conflicts ignored)", links.len());
        Ok(())
    }

    /// Advisory timestamp refresh, fire and forget semantics at call sites
    pub async fn touch_last_accessed(&self, code: &str) -> Result<()> {
        link::Entity::update_many()
            .col_expr(
                link::Column::LastAccessedAt,
                sea_orm::sea_query::Expr::value(Some(Utc::now())),
            )
            .filter(link::Column::Code.eq(code))
            .exec(&self.db)
            .await
            .map_err(|e| {
                SnaplinkError::database_operation(format!("last_accessed update failed: {e}"))
            })?;
        Ok(())
    }

    pub async fn links_by_topic(&self, topic: &str) -> Result<Vec<Link>> {
        let models = link::Entity::find()
            .filter(link::Column::Topic.eq(topic))
            .all(&self.db)
            .await
            .map_err(|e| SnaplinkError::database_operation(format!("topic query failed: {e}")))?;
        Ok(models.into_iter().map(model_to_link).collect())
    }

    pub async fn links_by_owner(&self, owner_id: &str) -> Result<Vec<Link>> {
        let models = link::Entity::find()
            .filter(link::Column::OwnerId.eq(owner_id))
            .all(&self.db)
            .await
            .map_err(|e| SnaplinkError::database_operation(format!("owner query failed: {e}")))?;
        Ok(models.into_iter().map(model_to_link).collect())
    }

    /// Single-row upsert, used by tests and manual backfills
    pub async fn upsert_link(&self, link_value: &Link) -> Result<()> {
        let model = link::ActiveModel {
            code: Set(link_value.code.clone()),
            long_url: Set(link_value.long_url.clone()),
            owner_id: Set(link_value.owner_id.clone()),
            topic: Set(link_value.topic.clone()),
            created_at: Set(link_value.created_at),
            last_accessed_at: Set(link_value.last_accessed_at),
        };
        link::Entity::insert(model)
            .on_conflict(
                OnConflict::column(link::Column::Code)
                    .update_columns([link::Column::LongUrl, link::Column::Topic])
                    .to_owned(),
            )
            .exec(&self.db)
            .await
            .map_err(|e| SnaplinkError::database_operation(format!("link upsert failed: {e}")))?;
        Ok(())
    }
}
