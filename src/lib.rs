//! SnapLink core: layered cache / write-behind consistency engine for a
//! URL shortener.
//!
//! Link creation and resolution answer from a fast shared store while a
//! durable relational store is brought up to date asynchronously by the
//! reconciler. The analytics path keeps exact click counters and
//! bounded-error unique-visitor sketches in the fast store, reconciled
//! against an append-only visit ledger.

pub mod cache;
pub mod config;
pub mod errors;
pub mod fast;
pub mod keys;
pub mod logging;
pub mod models;
pub mod reconciler;
pub mod scheduler;
pub mod services;
pub mod storage;
pub mod utils;
