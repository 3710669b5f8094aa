//! Audio cache: content-addressed, two-tier store for generated speech.
//!
//! A bounded in-memory tier sits in front of a disk tier made of payload
//! files plus a JSON index. The cache knows nothing about alarms; callers
//! only hand it keys and bytes.

pub mod health;
pub mod store;

pub use health::{CacheMetrics, HealthReport, HealthStatus, HealthThresholds};
pub use store::{
    content_key, AudioCache, CacheEntry, CacheError, CacheLimits, MaintenanceReport, PayloadKind,
};
