//! Generic repository abstraction over persisted entities
//!
//! Higher-level services depend only on the [`Repository`] trait, never on a
//! concrete backend. Backends included here:
//!
//! - [`MemoryRepository`]: dashmap-backed, for fast tiers and tests
//! - [`RedbRepository`]: durable local key-value store (redb)
//! - [`JsonFileRepository`]: one JSON file per entity on disk
//!
//! Decorators compose over any backend:
//!
//! - [`PrimaryBackupRepository`]: transparent failover with throttled health
//!   checks and best-effort reconciliation back to the primary
//! - [`CachedRepository`]: read-through/write-through TTL cache

pub mod cache;
pub mod failover;
pub mod json_store;
pub mod memory;
pub mod redb_store;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::Result;
use crate::types::Entity;

pub use cache::{CachedRepository, EntityCache, TtlCache};
pub use failover::{FailoverStats, PrimaryBackupRepository};
pub use json_store::JsonFileRepository;
pub use memory::MemoryRepository;
pub use redb_store::RedbRepository;

/// Backend health, the contract consumed by monitoring surfaces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Up,
    Down,
}

/// Result of a backend health check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthState,
    pub details: HashMap<String, String>,
}

impl HealthReport {
    /// Healthy report with no extra details
    pub fn up() -> Self {
        Self {
            status: HealthState::Up,
            details: HashMap::new(),
        }
    }

    /// Unhealthy report with a reason
    pub fn down(reason: impl Into<String>) -> Self {
        let mut details = HashMap::new();
        details.insert("reason".to_string(), reason.into());
        Self {
            status: HealthState::Down,
            details,
        }
    }

    /// Attach a detail entry
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    pub fn is_up(&self) -> bool {
        self.status == HealthState::Up
    }
}

/// Generic persistence interface over one entity kind
///
/// All operations may fail with a backend-specific [`crate::RecallError`],
/// which callers classify before retrying or counting against a circuit
/// breaker. Implementations bump `updated_at` via [`Entity::touch`] on every
/// save.
#[async_trait]
pub trait Repository<T: Entity>: Send + Sync {
    /// Persist the entity, returning the stored value
    async fn save(&self, entity: T) -> Result<T>;

    /// Fetch an entity by id
    async fn find_by_id(&self, id: &str) -> Result<Option<T>>;

    /// Fetch every stored entity
    async fn find_all(&self) -> Result<Vec<T>>;

    /// Remove an entity; true when something was deleted
    async fn delete(&self, id: &str) -> Result<bool>;

    /// Whether an entity with this id is stored
    async fn exists(&self, id: &str) -> Result<bool>;

    /// Number of stored entities
    async fn count(&self) -> Result<usize>;

    /// Probe backend health; defaults to unconditionally up
    async fn check_health(&self) -> HealthReport {
        HealthReport::up()
    }
}
