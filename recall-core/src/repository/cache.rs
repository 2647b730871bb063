//! Read-through / write-through caching for repositories
//!
//! [`CachedRepository`] wraps any [`Repository`] with an [`EntityCache`].
//! Reads consult the cache first and populate it on a store hit; writes go
//! to the store first and refresh the cache afterwards, so the cache never
//! holds a value the store rejected. Cache failures are swallowed with a
//! debug log: a broken cache degrades to direct store access, never to a
//! caller-visible error.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use super::{HealthReport, Repository};
use crate::error::Result;
use crate::types::Entity;

/// Default entry lifetime for [`TtlCache`]
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

/// Cache backend for entity lookups by id
#[async_trait]
pub trait EntityCache<T: Entity>: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<T>>;
    async fn put(&self, id: &str, entity: T) -> Result<()>;
    async fn invalidate(&self, id: &str) -> Result<()>;
}

struct CachedValue<T> {
    value: T,
    cached_at: Instant,
}

impl<T> CachedValue<T> {
    fn new(value: T) -> Self {
        Self {
            value,
            cached_at: Instant::now(),
        }
    }

    fn is_valid(&self, ttl: Duration) -> bool {
        self.cached_at.elapsed() < ttl
    }
}

/// In-process cache with per-entry time-to-live expiry
pub struct TtlCache<T> {
    ttl: Duration,
    entries: RwLock<HashMap<String, CachedValue<T>>>,
}

impl<T: Clone> TtlCache<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Number of entries, including ones that have expired but not yet
    /// been swept
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Drop every expired entry, returning how many were removed
    pub fn cleanup_expired(&self) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, cached| cached.is_valid(self.ttl));
        before - entries.len()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

impl<T: Clone> Default for TtlCache<T> {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_TTL)
    }
}

#[async_trait]
impl<T: Entity> EntityCache<T> for TtlCache<T> {
    async fn get(&self, id: &str) -> Result<Option<T>> {
        let entries = self.entries.read();
        Ok(entries
            .get(id)
            .filter(|cached| cached.is_valid(self.ttl))
            .map(|cached| cached.value.clone()))
    }

    async fn put(&self, id: &str, entity: T) -> Result<()> {
        self.entries
            .write()
            .insert(id.to_string(), CachedValue::new(entity));
        Ok(())
    }

    async fn invalidate(&self, id: &str) -> Result<()> {
        self.entries.write().remove(id);
        Ok(())
    }
}

/// Repository decorator that serves repeat lookups from a cache
pub struct CachedRepository<T: Entity> {
    inner: Arc<dyn Repository<T>>,
    cache: Arc<dyn EntityCache<T>>,
}

impl<T: Entity> CachedRepository<T> {
    pub fn new(inner: Arc<dyn Repository<T>>, cache: Arc<dyn EntityCache<T>>) -> Self {
        Self { inner, cache }
    }

    /// Wrap with a [`TtlCache`] using the given entry lifetime
    pub fn with_ttl(inner: Arc<dyn Repository<T>>, ttl: Duration) -> Self {
        Self::new(inner, Arc::new(TtlCache::new(ttl)))
    }

    async fn cache_put(&self, id: &str, entity: T) {
        if let Err(e) = self.cache.put(id, entity).await {
            debug!("Cache put for {} {} failed: {}", T::kind(), id, e);
        }
    }

    async fn cache_invalidate(&self, id: &str) {
        if let Err(e) = self.cache.invalidate(id).await {
            debug!("Cache invalidate for {} {} failed: {}", T::kind(), id, e);
        }
    }
}

#[async_trait]
impl<T: Entity> Repository<T> for CachedRepository<T> {
    /// Write-through: the store accepts the entity before the cache sees it
    async fn save(&self, entity: T) -> Result<T> {
        let saved = self.inner.save(entity).await?;
        let id = saved.id().to_string();
        self.cache_put(&id, saved.clone()).await;
        Ok(saved)
    }

    /// Read-through: cache hit short-circuits, store hit repopulates
    async fn find_by_id(&self, id: &str) -> Result<Option<T>> {
        match self.cache.get(id).await {
            Ok(Some(entity)) => return Ok(Some(entity)),
            Ok(None) => {}
            Err(e) => debug!("Cache get for {} {} failed: {}", T::kind(), id, e),
        }

        match self.inner.find_by_id(id).await? {
            Some(entity) => {
                self.cache_put(id, entity.clone()).await;
                Ok(Some(entity))
            }
            None => Ok(None),
        }
    }

    // Collection scans bypass the cache; only id lookups are cached
    async fn find_all(&self) -> Result<Vec<T>> {
        self.inner.find_all().await
    }

    /// The entry is invalidated whatever the inner delete returns: a failed
    /// delete may still have partially applied downstream, and serving the
    /// stale entry until TTL expiry is worse than a cache miss
    async fn delete(&self, id: &str) -> Result<bool> {
        let deleted = self.inner.delete(id).await;
        self.cache_invalidate(id).await;
        deleted
    }

    async fn exists(&self, id: &str) -> Result<bool> {
        if let Ok(Some(_)) = self.cache.get(id).await {
            return Ok(true);
        }
        self.inner.exists(id).await
    }

    async fn count(&self) -> Result<usize> {
        self.inner.count().await
    }

    async fn check_health(&self) -> HealthReport {
        self.inner.check_health().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::MemoryRepository;
    use crate::types::{Message, MessageRole};
    use tokio::time::sleep;

    fn cached(
        store: Arc<MemoryRepository<Message>>,
        ttl: Duration,
    ) -> CachedRepository<Message> {
        CachedRepository::with_ttl(store, ttl)
    }

    #[tokio::test]
    async fn read_through_populates_cache() {
        let store = Arc::new(MemoryRepository::new("store"));
        let repo = cached(store.clone(), Duration::from_secs(60));

        let msg = Message::new("c-1", MessageRole::User, "hello");
        let id = msg.id.clone();
        store.save(msg).await.unwrap();

        assert!(repo.find_by_id(&id).await.unwrap().is_some());

        // Second lookup is served from cache even after the store fails
        store.set_failing(true);
        assert!(repo.find_by_id(&id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn write_through_caches_the_saved_entity() {
        let store = Arc::new(MemoryRepository::new("store"));
        let repo = cached(store.clone(), Duration::from_secs(60));

        let msg = Message::new("c-1", MessageRole::User, "cached on write");
        let id = msg.id.clone();
        repo.save(msg).await.unwrap();

        store.set_failing(true);
        let hit = repo.find_by_id(&id).await.unwrap();
        assert_eq!(hit.unwrap().content, "cached on write");
    }

    #[tokio::test]
    async fn failed_save_leaves_cache_untouched() {
        let store = Arc::new(MemoryRepository::new("store"));
        let repo = cached(store.clone(), Duration::from_secs(60));

        store.set_failing(true);
        let msg = Message::new("c-1", MessageRole::User, "rejected");
        let id = msg.id.clone();
        assert!(repo.save(msg).await.is_err());

        store.set_failing(false);
        assert!(repo.find_by_id(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_invalidates_the_cached_entry() {
        let store = Arc::new(MemoryRepository::new("store"));
        let repo = cached(store.clone(), Duration::from_secs(60));

        let msg = Message::new("c-1", MessageRole::User, "to delete");
        let id = msg.id.clone();
        repo.save(msg).await.unwrap();

        assert!(repo.delete(&id).await.unwrap());
        assert!(repo.find_by_id(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_delete_still_invalidates_the_entry() {
        let store = Arc::new(MemoryRepository::new("store"));
        let repo = cached(store.clone(), Duration::from_secs(60));

        let msg = Message::new("c-1", MessageRole::User, "doomed");
        let id = msg.id.clone();
        repo.save(msg).await.unwrap();

        store.set_failing(true);
        assert!(repo.delete(&id).await.is_err());

        // The entry must not be served from cache after the failed delete
        let lookup = repo.find_by_id(&id).await;
        assert!(lookup.is_err());
    }

    #[tokio::test]
    async fn expired_entries_fall_back_to_the_store() {
        let store = Arc::new(MemoryRepository::new("store"));
        let repo = cached(store.clone(), Duration::from_millis(20));

        let msg = Message::new("c-1", MessageRole::User, "short lived");
        let id = msg.id.clone();
        repo.save(msg).await.unwrap();

        sleep(Duration::from_millis(40)).await;
        store.set_failing(true);
        assert!(repo.find_by_id(&id).await.is_err());
    }

    #[tokio::test]
    async fn cleanup_expired_sweeps_stale_entries() {
        let cache: TtlCache<Message> = TtlCache::new(Duration::from_millis(10));
        let msg = Message::new("c-1", MessageRole::User, "stale");
        cache.put("a", msg.clone()).await.unwrap();
        cache.put("b", msg).await.unwrap();
        assert_eq!(cache.len(), 2);

        sleep(Duration::from_millis(30)).await;
        assert_eq!(cache.cleanup_expired(), 2);
        assert!(cache.is_empty());
    }
}
