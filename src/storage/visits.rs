//! Visit ledger operations and aggregate queries
//!
//! The `visits` table is the exact historical ledger the approximate
//! fast-store counters are reconciled against. Aggregates here are the
//! durable fallback for every cold counter and rollup read.

use chrono::{DateTime, Utc};
use sea_orm::{
    ColumnTrait, EntityTrait, FromQueryResult, PaginatorTrait, QueryFilter, QueryOrder,
    QuerySelect,
    sea_query::{Expr, Func, OnConflict},
};
use tracing::debug;

use super::DurableStorage;
use super::converters::fact_to_active_model;
use crate::errors::{Result, SnaplinkError};
use crate::models::VisitFact;
use migration::entities::visit;

#[derive(Debug, FromQueryResult)]
pub struct DateCount {
    pub date: String,
    pub clicks: i64,
}

/// Per-OS / per-device aggregate row
#[derive(Debug, FromQueryResult)]
pub struct GroupStats {
    pub name: Option<String>,
    pub clicks: i64,
    pub uniques: i64,
}

#[derive(Debug, FromQueryResult)]
pub struct CodeStats {
    pub code: String,
    pub clicks: i64,
    pub uniques: i64,
}

#[derive(Debug, FromQueryResult)]
struct CountRow {
    total: i64,
}

fn count_distinct_ip() -> sea_orm::sea_query::SimpleExpr {
    Func::count_distinct(Expr::col((visit::Entity, visit::Column::VisitorIp))).into()
}

impl DurableStorage {
    /// Bulk insert staged facts, ignoring duplicates on `fact_key` so a
    /// replayed batch cannot double-count.
    pub async fn insert_visits_ignore_conflicts(&self, facts: &[VisitFact]) -> Result<()> {
        if facts.is_empty() {
            return Ok(());
        }

        let models: Vec<visit::ActiveModel> = facts.iter().map(fact_to_active_model).collect();

        visit::Entity::insert_many(models)
            .on_conflict(
                OnConflict::column(visit::Column::FactKey)
                    .do_nothing()
                    .to_owned(),
            )
            .do_nothing()
            .exec(&self.db)
            .await
            .map_err(|e| {
                SnaplinkError::database_operation(format!("bulk visit insert failed: {e}"))
            })?;

        debug!("Inserted batch of {} visit facts", facts.len());
        Ok(())
    }

    pub async fn count_visits(&self, codes: &[String]) -> Result<u64> {
        if codes.is_empty() {
            return Ok(0);
        }
        visit::Entity::find()
            .filter(visit::Column::Code.is_in(codes.iter().cloned()))
            .count(&self.db)
            .await
            .map_err(|e| SnaplinkError::database_operation(format!("visit count failed: {e}")))
    }

    pub async fn count_unique_visitors(&self, codes: &[String]) -> Result<u64> {
        if codes.is_empty() {
            return Ok(0);
        }
        let row = visit::Entity::find()
            .select_only()
            .column_as(count_distinct_ip(), "total")
            .filter(visit::Column::Code.is_in(codes.iter().cloned()))
            .into_model::<CountRow>()
            .one(&self.db)
            .await
            .map_err(|e| SnaplinkError::database_operation(format!("unique count failed: {e}")))?;
        Ok(row.map(|r| r.total as u64).unwrap_or(0))
    }

    /// Distinct visitor IPs for one code, used to reseed a cold sketch
    pub async fn distinct_visitor_ips(&self, code: &str) -> Result<Vec<String>> {
        visit::Entity::find()
            .select_only()
            .column(visit::Column::VisitorIp)
            .distinct()
            .filter(visit::Column::Code.eq(code))
            .into_tuple::<String>()
            .all(&self.db)
            .await
            .map_err(|e| SnaplinkError::database_operation(format!("distinct ips failed: {e}")))
    }

    pub async fn clicks_by_date(
        &self,
        codes: &[String],
        since: DateTime<Utc>,
    ) -> Result<Vec<DateCount>> {
        if codes.is_empty() {
            return Ok(Vec::new());
        }
        visit::Entity::find()
            .select_only()
            .column_as(Expr::cust("DATE(visited_at)"), "date")
            .column_as(visit::Column::Id.count(), "clicks")
            .filter(visit::Column::Code.is_in(codes.iter().cloned()))
            .filter(visit::Column::VisitedAt.gte(since))
            .group_by(Expr::cust("DATE(visited_at)"))
            .order_by_desc(Expr::cust("date"))
            .into_model::<DateCount>()
            .all(&self.db)
            .await
            .map_err(|e| SnaplinkError::database_operation(format!("date rollup failed: {e}")))
    }

    pub async fn os_breakdown(&self, codes: &[String]) -> Result<Vec<GroupStats>> {
        self.group_breakdown(codes, visit::Column::OsType).await
    }

    pub async fn device_breakdown(&self, codes: &[String]) -> Result<Vec<GroupStats>> {
        self.group_breakdown(codes, visit::Column::DeviceType).await
    }

    async fn group_breakdown(
        &self,
        codes: &[String],
        column: visit::Column,
    ) -> Result<Vec<GroupStats>> {
        if codes.is_empty() {
            return Ok(Vec::new());
        }
        visit::Entity::find()
            .select_only()
            .column_as(column, "name")
            .column_as(visit::Column::Id.count(), "clicks")
            .column_as(count_distinct_ip(), "uniques")
            .filter(visit::Column::Code.is_in(codes.iter().cloned()))
            .group_by(column)
            .into_model::<GroupStats>()
            .all(&self.db)
            .await
            .map_err(|e| SnaplinkError::database_operation(format!("breakdown failed: {e}")))
    }

    /// Exact totals per code, used for constituent rows of topic rollups
    pub async fn per_code_stats(&self, codes: &[String]) -> Result<Vec<CodeStats>> {
        if codes.is_empty() {
            return Ok(Vec::new());
        }
        visit::Entity::find()
            .select_only()
            .column(visit::Column::Code)
            .column_as(visit::Column::Id.count(), "clicks")
            .column_as(count_distinct_ip(), "uniques")
            .filter(visit::Column::Code.is_in(codes.iter().cloned()))
            .group_by(visit::Column::Code)
            .into_model::<CodeStats>()
            .all(&self.db)
            .await
            .map_err(|e| SnaplinkError::database_operation(format!("per-code stats failed: {e}")))
    }

    /// Codes with durable activity since the given time; drives counter
    /// reconciliation for subjects whose fast-store aggregate went cold.
    pub async fn codes_with_visits_since(&self, since: DateTime<Utc>) -> Result<Vec<String>> {
        visit::Entity::find()
            .select_only()
            .column(visit::Column::Code)
            .distinct()
            .filter(visit::Column::VisitedAt.gte(since))
            .into_tuple::<String>()
            .all(&self.db)
            .await
            .map_err(|e| SnaplinkError::database_operation(format!("activity scan failed: {e}")))
    }
}
