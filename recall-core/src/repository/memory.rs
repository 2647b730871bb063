//! In-memory repository backend
//!
//! Dashmap-backed store used as a fast tier, as the backup side of a
//! failover pair in single-process deployments, and as a fault-injectable
//! test double for the resilience layers.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use super::{HealthReport, Repository};
use crate::error::{RecallError, Result};
use crate::types::Entity;

/// In-memory entity store
pub struct MemoryRepository<T: Entity> {
    name: String,
    entities: DashMap<String, T>,
    // Failure injection for resilience tests: when set, every operation
    // fails with a network error attributed to this backend.
    failing: AtomicBool,
}

impl<T: Entity> MemoryRepository<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entities: DashMap::new(),
            failing: AtomicBool::new(false),
        }
    }

    /// Toggle injected failures (tests and chaos drills)
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(RecallError::Connection {
                address: self.name.clone(),
                details: "injected failure".to_string(),
            })
        } else {
            Ok(())
        }
    }
}

impl<T: Entity> Default for MemoryRepository<T> {
    fn default() -> Self {
        Self::new(format!("memory-{}", T::kind()))
    }
}

#[async_trait]
impl<T: Entity> Repository<T> for MemoryRepository<T> {
    async fn save(&self, mut entity: T) -> Result<T> {
        self.check_available()?;
        entity.touch();
        self.entities.insert(entity.id().to_string(), entity.clone());
        Ok(entity)
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<T>> {
        self.check_available()?;
        Ok(self.entities.get(id).map(|e| e.clone()))
    }

    async fn find_all(&self) -> Result<Vec<T>> {
        self.check_available()?;
        Ok(self.entities.iter().map(|e| e.value().clone()).collect())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        self.check_available()?;
        Ok(self.entities.remove(id).is_some())
    }

    async fn exists(&self, id: &str) -> Result<bool> {
        self.check_available()?;
        Ok(self.entities.contains_key(id))
    }

    async fn count(&self) -> Result<usize> {
        self.check_available()?;
        Ok(self.entities.len())
    }

    async fn check_health(&self) -> HealthReport {
        if self.failing.load(Ordering::SeqCst) {
            HealthReport::down("injected failure").with_detail("backend", &self.name)
        } else {
            HealthReport::up()
                .with_detail("backend", &self.name)
                .with_detail("entities", self.entities.len().to_string())
        }
    }
}
