//! Conversions between domain types and SeaORM models

use sea_orm::ActiveValue::Set;

use crate::models::{Link, SyncStatus, VisitFact};
use migration::entities::{link, visit};

/// A durable row is by definition synced
pub fn model_to_link(model: link::Model) -> Link {
    Link {
        code: model.code,
        long_url: model.long_url,
        owner_id: model.owner_id,
        topic: model.topic,
        created_at: model.created_at,
        last_accessed_at: model.last_accessed_at,
        sync_status: SyncStatus::Synced,
    }
}

pub fn link_to_active_model(link: &Link) -> link::ActiveModel {
    link::ActiveModel {
        code: Set(link.code.clone()),
        long_url: Set(link.long_url.clone()),
        owner_id: Set(link.owner_id.clone()),
        topic: Set(link.topic.clone()),
        created_at: Set(link.created_at),
        last_accessed_at: Set(link.last_accessed_at),
    }
}

pub fn fact_to_active_model(fact: &VisitFact) -> visit::ActiveModel {
    visit::ActiveModel {
        id: Default::default(),
        fact_key: Set(fact.fact_key.clone()),
        code: Set(fact.code.clone()),
        visitor_ip: Set(fact.visitor.visitor_ip.clone()),
        user_agent: Set(fact.visitor.user_agent.clone()),
        device_type: Set(fact.visitor.device_type.clone()),
        os_type: Set(fact.visitor.os_type.clone()),
        browser: Set(fact.visitor.browser.clone()),
        country: Set(fact.visitor.country.clone()),
        city: Set(fact.visitor.city.clone()),
        visited_at: Set(fact.visited_at),
    }
}
