//! Business services built on the fast and durable stores

pub mod analytics_service;
pub mod link_service;

pub use analytics_service::AnalyticsService;
pub use link_service::LinkService;
