//! Core domain types shared between the fast store, the durable store and
//! the service layer.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SnaplinkError};

/// Durable-commit state of a link's fast-store copy. A link is created
/// `Pending` and promoted to `Synced` only by the reconciler, after its
/// durable row is confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Pending,
    Synced,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Synced => "synced",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(SyncStatus::Pending),
            "synced" => Some(SyncStatus::Synced),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Link {
    pub code: String,
    pub long_url: String,
    pub owner_id: String,
    pub topic: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: Option<DateTime<Utc>>,
    pub sync_status: SyncStatus,
}

impl Link {
    /// Field list for the fast-store hash representation
    pub fn to_hash_fields(&self) -> Vec<(String, String)> {
        let mut fields = vec![
            ("code".to_string(), self.code.clone()),
            ("long_url".to_string(), self.long_url.clone()),
            ("owner_id".to_string(), self.owner_id.clone()),
            ("created_at".to_string(), self.created_at.to_rfc3339()),
            ("status".to_string(), self.sync_status.as_str().to_string()),
        ];
        if let Some(topic) = &self.topic {
            fields.push(("topic".to_string(), topic.clone()));
        }
        if let Some(at) = &self.last_accessed_at {
            fields.push(("last_accessed_at".to_string(), at.to_rfc3339()));
        }
        fields
    }

    /// Rebuild a link from its fast-store hash. Missing or malformed fields
    /// are a serialization error, handled as a cache miss by callers.
    pub fn from_hash_fields(fields: &HashMap<String, String>) -> Result<Self> {
        let get = |name: &str| {
            fields
                .get(name)
                .cloned()
                .ok_or_else(|| SnaplinkError::serialization(format!("missing link field '{name}'")))
        };

        let created_at = DateTime::parse_from_rfc3339(&get("created_at")?)
            .map_err(|e| SnaplinkError::serialization(format!("bad created_at: {e}")))?
            .with_timezone(&Utc);

        let last_accessed_at = match fields.get("last_accessed_at") {
            Some(raw) => Some(
                DateTime::parse_from_rfc3339(raw)
                    .map_err(|e| SnaplinkError::serialization(format!("bad last_accessed_at: {e}")))?
                    .with_timezone(&Utc),
            ),
            None => None,
        };

        let sync_status = fields
            .get("status")
            .and_then(|s| SyncStatus::parse(s))
            .unwrap_or(SyncStatus::Pending);

        Ok(Link {
            code: get("code")?,
            long_url: get("long_url")?,
            owner_id: get("owner_id")?,
            topic: fields.get("topic").cloned(),
            created_at,
            last_accessed_at,
            sync_status,
        })
    }
}

/// Visit metadata as handed to the core: already parsed and geo-resolved
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VisitorInfo {
    pub visitor_ip: String,
    pub user_agent: Option<String>,
    pub device_type: Option<String>,
    pub os_type: Option<String>,
    pub browser: Option<String>,
    pub country: Option<String>,
    pub city: Option<String>,
}

/// One append-only visit record, staged in the fast store until the
/// reconciler commits it durably. `fact_key` doubles as the staging key and
/// the durable idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisitFact {
    pub fact_key: String,
    pub code: String,
    pub visitor: VisitorInfo,
    pub visited_at: DateTime<Utc>,
}

impl VisitFact {
    pub fn to_hash_fields(&self) -> Vec<(String, String)> {
        let mut fields = vec![
            ("fact_key".to_string(), self.fact_key.clone()),
            ("code".to_string(), self.code.clone()),
            ("visitor_ip".to_string(), self.visitor.visitor_ip.clone()),
            ("visited_at".to_string(), self.visited_at.to_rfc3339()),
        ];
        let optional = [
            ("user_agent", &self.visitor.user_agent),
            ("device_type", &self.visitor.device_type),
            ("os_type", &self.visitor.os_type),
            ("browser", &self.visitor.browser),
            ("country", &self.visitor.country),
            ("city", &self.visitor.city),
        ];
        for (name, value) in optional {
            if let Some(v) = value {
                fields.push((name.to_string(), v.clone()));
            }
        }
        fields
    }

    pub fn from_hash_fields(fields: &HashMap<String, String>) -> Result<Self> {
        let get = |name: &str| {
            fields
                .get(name)
                .cloned()
                .ok_or_else(|| SnaplinkError::serialization(format!("missing visit field '{name}'")))
        };

        let visited_at = DateTime::parse_from_rfc3339(&get("visited_at")?)
            .map_err(|e| SnaplinkError::serialization(format!("bad visited_at: {e}")))?
            .with_timezone(&Utc);

        Ok(VisitFact {
            fact_key: get("fact_key")?,
            code: get("code")?,
            visitor: VisitorInfo {
                visitor_ip: get("visitor_ip")?,
                user_agent: fields.get("user_agent").cloned(),
                device_type: fields.get("device_type").cloned(),
                os_type: fields.get("os_type").cloned(),
                browser: fields.get("browser").cloned(),
                country: fields.get("country").cloned(),
                city: fields.get("city").cloned(),
            },
            visited_at,
        })
    }
}

// ============ Aggregate views ============

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectCounts {
    pub total_clicks: u64,
    /// Sketch estimate, within the sketch's stated error bound
    pub unique_visitors: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClicksByDate {
    pub date: String,
    pub clicks: u64,
}

/// Per-OS or per-device breakdown row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakdownRow {
    pub name: String,
    pub clicks: u64,
    pub unique_visitors: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkCounts {
    pub code: String,
    pub total_clicks: u64,
    pub unique_visitors: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TopicAggregate {
    pub total_clicks: u64,
    pub unique_visitors: u64,
    pub clicks_by_date: Vec<ClicksByDate>,
    pub links: Vec<LinkCounts>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OwnerAggregate {
    pub total_links: u64,
    pub total_clicks: u64,
    pub unique_visitors: u64,
    pub clicks_by_date: Vec<ClicksByDate>,
    pub os_stats: Vec<BreakdownRow>,
    pub device_stats: Vec<BreakdownRow>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_link() -> Link {
        Link {
            code: "abc12345".to_string(),
            long_url: "https://a.example/path".to_string(),
            owner_id: "u1".to_string(),
            topic: Some("launch".to_string()),
            created_at: Utc::now(),
            last_accessed_at: None,
            sync_status: SyncStatus::Pending,
        }
    }

    #[test]
    fn link_hash_roundtrip() {
        let link = sample_link();
        let fields: HashMap<String, String> = link.to_hash_fields().into_iter().collect();
        let restored = Link::from_hash_fields(&fields).unwrap();
        // created_at goes through RFC3339, equality holds at second precision
        assert_eq!(restored.code, link.code);
        assert_eq!(restored.long_url, link.long_url);
        assert_eq!(restored.topic, link.topic);
        assert_eq!(restored.sync_status, SyncStatus::Pending);
    }

    #[test]
    fn link_from_incomplete_hash_is_serialization_error() {
        let mut fields = HashMap::new();
        fields.insert("code".to_string(), "abc".to_string());
        let err = Link::from_hash_fields(&fields).unwrap_err();
        assert!(matches!(err, SnaplinkError::Serialization(_)));
    }

    #[test]
    fn visit_fact_hash_roundtrip() {
        let fact = VisitFact {
            fact_key: "visit:abc:0000".to_string(),
            code: "abc".to_string(),
            visitor: VisitorInfo {
                visitor_ip: "203.0.113.9".to_string(),
                user_agent: Some("Mozilla/5.0".to_string()),
                device_type: Some("desktop".to_string()),
                os_type: Some("Linux".to_string()),
                browser: Some("Firefox".to_string()),
                country: Some("DE".to_string()),
                city: None,
            },
            visited_at: Utc::now(),
        };
        let fields: HashMap<String, String> = fact.to_hash_fields().into_iter().collect();
        let restored = VisitFact::from_hash_fields(&fields).unwrap();
        assert_eq!(restored.fact_key, fact.fact_key);
        assert_eq!(restored.visitor.visitor_ip, fact.visitor.visitor_ip);
        assert_eq!(restored.visitor.city, None);
    }

    #[test]
    fn sync_status_parse() {
        assert_eq!(SyncStatus::parse("pending"), Some(SyncStatus::Pending));
        assert_eq!(SyncStatus::parse("synced"), Some(SyncStatus::Synced));
        assert_eq!(SyncStatus::parse("other"), None);
    }
}
