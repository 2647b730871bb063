//! File-per-entity repository backend
//!
//! Stores each entity as `<dir>/<id>.json`. Simple and inspectable, used as
//! the durable backup side of a failover pair. Reads scan the directory in
//! full; entity counts are expected to be modest (conversation history, not
//! telemetry).

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::warn;

use super::{HealthReport, Repository};
use crate::error::{RecallError, Result};
use crate::types::Entity;

/// JSON file-per-entity store
pub struct JsonFileRepository<T: Entity> {
    dir: PathBuf,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T: Entity> JsonFileRepository<T> {
    /// Create the store, creating `<root>/<entity-kind>/` if needed
    pub async fn new(root: impl AsRef<Path>) -> Result<Self> {
        let dir = root.as_ref().join(T::kind());
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| RecallError::Storage {
                operation: format!("create entity directory {:?}", dir),
                source: Box::new(e),
            })?;
        Ok(Self {
            dir,
            _marker: std::marker::PhantomData,
        })
    }

    fn entity_path(&self, id: &str) -> Result<PathBuf> {
        // Ids become file names; anything that could escape the directory
        // is rejected at the boundary.
        if id.is_empty() || id.contains(['/', '\\']) || id.contains("..") {
            return Err(RecallError::InvalidInput {
                field: "id".to_string(),
                message: format!("'{}' is not usable as an entity file name", id),
            });
        }
        Ok(self.dir.join(format!("{}.json", id)))
    }

    async fn read_entity(&self, path: &Path) -> Result<T> {
        let bytes = fs::read(path).await.map_err(|e| RecallError::Storage {
            operation: format!("read entity file {:?}", path),
            source: Box::new(e),
        })?;
        serde_json::from_slice(&bytes).map_err(|e| RecallError::Serialization {
            operation: format!("decode {} entity from {:?}", T::kind(), path),
            source: Box::new(e),
        })
    }
}

#[async_trait]
impl<T: Entity> Repository<T> for JsonFileRepository<T> {
    async fn save(&self, mut entity: T) -> Result<T> {
        entity.touch();
        let path = self.entity_path(entity.id())?;
        let json = serde_json::to_vec_pretty(&entity).map_err(|e| RecallError::Serialization {
            operation: format!("encode {} entity", T::kind()),
            source: Box::new(e),
        })?;

        // Write through a temp file so a crash mid-write cannot leave a
        // torn `<id>.json` behind
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, &json)
            .await
            .map_err(|e| RecallError::Storage {
                operation: format!("write entity file {:?}", tmp),
                source: Box::new(e),
            })?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| RecallError::Storage {
                operation: format!("replace entity file {:?}", path),
                source: Box::new(e),
            })?;

        Ok(entity)
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<T>> {
        let path = self.entity_path(id)?;
        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(None);
        }
        Ok(Some(self.read_entity(&path).await?))
    }

    async fn find_all(&self) -> Result<Vec<T>> {
        let mut entities = Vec::new();
        let mut entries = fs::read_dir(&self.dir)
            .await
            .map_err(|e| RecallError::Storage {
                operation: format!("read entity directory {:?}", self.dir),
                source: Box::new(e),
            })?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| RecallError::Storage {
                operation: "read directory entry".to_string(),
                source: Box::new(e),
            })?
        {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            match self.read_entity(&path).await {
                Ok(entity) => entities.push(entity),
                // A torn write must not poison the whole scan
                Err(e) => warn!("Skipping unreadable entity file {:?}: {}", path, e),
            }
        }
        Ok(entities)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let path = self.entity_path(id)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(RecallError::Storage {
                operation: format!("delete entity file {:?}", path),
                source: Box::new(e),
            }),
        }
    }

    async fn exists(&self, id: &str) -> Result<bool> {
        let path = self.entity_path(id)?;
        fs::try_exists(&path).await.map_err(|e| RecallError::Storage {
            operation: format!("stat entity file {:?}", path),
            source: Box::new(e),
        })
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.find_all().await?.len())
    }

    async fn check_health(&self) -> HealthReport {
        match fs::read_dir(&self.dir).await {
            Ok(_) => HealthReport::up()
                .with_detail("backend", format!("json:{}", T::kind()))
                .with_detail("dir", self.dir.display().to_string()),
            Err(e) => HealthReport::down(e.to_string())
                .with_detail("backend", format!("json:{}", T::kind())),
        }
    }
}
