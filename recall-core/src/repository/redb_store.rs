//! Durable local repository backend on redb
//!
//! One table per entity kind, keyed by entity id, values JSON-encoded.
//! redb transactions are short and synchronous; calls are cheap enough to
//! run inline on the async executor.

use async_trait::async_trait;
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition, TableError};
use std::marker::PhantomData;
use std::path::Path;
use std::sync::Arc;

use super::{HealthReport, Repository};
use crate::error::{RecallError, Result};
use crate::types::Entity;

/// redb-backed entity store
pub struct RedbRepository<T: Entity> {
    database: Arc<Database>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Entity> RedbRepository<T> {
    /// Open (or create) a database file and the entity table inside it
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let database = Database::create(path.as_ref()).map_err(|e| RecallError::Storage {
            operation: format!("open database {:?}", path.as_ref()),
            source: Box::new(e),
        })?;
        Self::with_database(Arc::new(database))
    }

    /// Build on an already-open database, creating the table eagerly so
    /// reads before the first write do not see a missing table
    pub fn with_database(database: Arc<Database>) -> Result<Self> {
        let txn = database.begin_write().map_err(|e| RecallError::Storage {
            operation: "begin write transaction".to_string(),
            source: Box::new(e),
        })?;
        txn.open_table(Self::table())
            .map_err(|e| RecallError::Storage {
                operation: format!("create table {}", T::kind()),
                source: Box::new(e),
            })?;
        txn.commit().map_err(|e| RecallError::Storage {
            operation: "commit table creation".to_string(),
            source: Box::new(e),
        })?;

        Ok(Self {
            database,
            _marker: PhantomData,
        })
    }

    fn table() -> TableDefinition<'static, &'static str, &'static [u8]> {
        TableDefinition::new(T::kind())
    }

    fn storage_error(
        operation: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> RecallError {
        RecallError::Storage {
            operation: operation.into(),
            source: Box::new(source),
        }
    }

    fn read_value(bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes).map_err(|e| RecallError::Serialization {
            operation: format!("decode {} entity", T::kind()),
            source: Box::new(e),
        })
    }
}

#[async_trait]
impl<T: Entity> Repository<T> for RedbRepository<T> {
    async fn save(&self, mut entity: T) -> Result<T> {
        entity.touch();
        let encoded = serde_json::to_vec(&entity).map_err(|e| RecallError::Serialization {
            operation: format!("encode {} entity", T::kind()),
            source: Box::new(e),
        })?;

        let txn = self
            .database
            .begin_write()
            .map_err(|e| Self::storage_error("begin write transaction", e))?;
        {
            let mut table = txn
                .open_table(Self::table())
                .map_err(|e| Self::storage_error(format!("open table {}", T::kind()), e))?;
            table
                .insert(entity.id(), encoded.as_slice())
                .map_err(|e| Self::storage_error(format!("insert {}", T::kind()), e))?;
        }
        txn.commit()
            .map_err(|e| Self::storage_error("commit save", e))?;

        Ok(entity)
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<T>> {
        let txn = self
            .database
            .begin_read()
            .map_err(|e| Self::storage_error("begin read transaction", e))?;
        let table = match txn.open_table(Self::table()) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(Self::storage_error(format!("open table {}", T::kind()), e)),
        };

        match table
            .get(id)
            .map_err(|e| Self::storage_error(format!("get {}", T::kind()), e))?
        {
            Some(guard) => Ok(Some(Self::read_value(guard.value())?)),
            None => Ok(None),
        }
    }

    async fn find_all(&self) -> Result<Vec<T>> {
        let txn = self
            .database
            .begin_read()
            .map_err(|e| Self::storage_error("begin read transaction", e))?;
        let table = match txn.open_table(Self::table()) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(e) => return Err(Self::storage_error(format!("open table {}", T::kind()), e)),
        };

        let mut entities = Vec::new();
        let iter = table
            .iter()
            .map_err(|e| Self::storage_error(format!("scan table {}", T::kind()), e))?;
        for item in iter {
            let (_, value) =
                item.map_err(|e| Self::storage_error(format!("scan table {}", T::kind()), e))?;
            entities.push(Self::read_value(value.value())?);
        }
        Ok(entities)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let txn = self
            .database
            .begin_write()
            .map_err(|e| Self::storage_error("begin write transaction", e))?;
        let removed;
        {
            let mut table = txn
                .open_table(Self::table())
                .map_err(|e| Self::storage_error(format!("open table {}", T::kind()), e))?;
            removed = table
                .remove(id)
                .map_err(|e| Self::storage_error(format!("remove {}", T::kind()), e))?
                .is_some();
        }
        txn.commit()
            .map_err(|e| Self::storage_error("commit delete", e))?;
        Ok(removed)
    }

    async fn exists(&self, id: &str) -> Result<bool> {
        Ok(self.find_by_id(id).await?.is_some())
    }

    async fn count(&self) -> Result<usize> {
        let txn = self
            .database
            .begin_read()
            .map_err(|e| Self::storage_error("begin read transaction", e))?;
        let table = match txn.open_table(Self::table()) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(0),
            Err(e) => return Err(Self::storage_error(format!("open table {}", T::kind()), e)),
        };
        let len = table
            .len()
            .map_err(|e| Self::storage_error(format!("count table {}", T::kind()), e))?;
        Ok(len as usize)
    }

    async fn check_health(&self) -> HealthReport {
        match self.database.begin_read() {
            Ok(_) => HealthReport::up().with_detail("backend", format!("redb:{}", T::kind())),
            Err(e) => HealthReport::down(e.to_string())
                .with_detail("backend", format!("redb:{}", T::kind())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Conversation, MemoryRecord};
    use tempfile::TempDir;

    fn open_repo<T: Entity>(dir: &TempDir) -> RedbRepository<T> {
        RedbRepository::open(dir.path().join("recall.redb")).unwrap()
    }

    #[tokio::test]
    async fn save_and_find_roundtrip() {
        let dir = TempDir::new().unwrap();
        let repo = open_repo::<Conversation>(&dir);

        let conv = Conversation::new("daily standup");
        let id = conv.id.clone();
        repo.save(conv).await.unwrap();

        let found = repo.find_by_id(&id).await.unwrap().unwrap();
        assert_eq!(found.title, "daily standup");
        assert!(repo.exists(&id).await.unwrap());
        assert!(!repo.exists("missing").await.unwrap());
    }

    #[tokio::test]
    async fn find_all_and_count() {
        let dir = TempDir::new().unwrap();
        let repo = open_repo::<MemoryRecord>(&dir);

        for i in 0..3 {
            repo.save(MemoryRecord::new(format!("fact {}", i), 0.5))
                .await
                .unwrap();
        }

        assert_eq!(repo.count().await.unwrap(), 3);
        assert_eq!(repo.find_all().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let repo = open_repo::<Conversation>(&dir);

        let conv = Conversation::new("t");
        let id = conv.id.clone();
        repo.save(conv).await.unwrap();

        assert!(repo.delete(&id).await.unwrap());
        assert!(!repo.delete(&id).await.unwrap());
    }

    #[tokio::test]
    async fn data_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("recall.redb");
        let conv = Conversation::new("persisted");
        let id = conv.id.clone();

        {
            let repo = RedbRepository::<Conversation>::open(&path).unwrap();
            repo.save(conv).await.unwrap();
        }

        let repo = RedbRepository::<Conversation>::open(&path).unwrap();
        let found = repo.find_by_id(&id).await.unwrap().unwrap();
        assert_eq!(found.title, "persisted");
    }

    #[tokio::test]
    async fn health_reports_up() {
        let dir = TempDir::new().unwrap();
        let repo = open_repo::<Conversation>(&dir);
        assert!(repo.check_health().await.is_up());
    }
}
