//! Write-ahead transaction log for multi-entity operations
//!
//! A transaction is a sequence of intents (create, update, delete) recorded
//! to disk before the corresponding writes happen. Each transaction lives in
//! its own `<id>.json` file under the log directory, rewritten on every
//! change so the on-disk copy always reflects the latest state. After a
//! crash, [`TransactionManager::recover_transactions`] sweeps the directory:
//! recent pending transactions are presumed to have finished their writes
//! and are marked committed, stale ones are rolled back. Recovery only flips
//! the recorded status; it does not replay entity writes.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{RecallError, Result};

/// Pending transactions younger than this at recovery are presumed complete
pub const DEFAULT_RECOVERY_AGE: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Pending,
    Committed,
    RolledBack,
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionStatus::Pending => write!(f, "PENDING"),
            TransactionStatus::Committed => write!(f, "COMMITTED"),
            TransactionStatus::RolledBack => write!(f, "ROLLED_BACK"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

/// One recorded intent within a transaction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionLogEntry {
    pub id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub operation: Operation,
    /// Snapshot of the entity state the operation intends to write
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub status: TransactionStatus,
    pub logs: Vec<TransactionLogEntry>,
    pub timestamp: DateTime<Utc>,
}

impl Transaction {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            status: TransactionStatus::Pending,
            logs: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    /// Age of the transaction since it was begun
    pub fn age(&self) -> Duration {
        (Utc::now() - self.timestamp)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

/// Outcome of a recovery sweep over the log directory
#[derive(Debug, Default)]
pub struct RecoveryReport {
    pub scanned: usize,
    pub committed: Vec<String>,
    pub rolled_back: Vec<String>,
    pub corrupt: usize,
}

/// Owns the log directory and the set of in-flight transactions
pub struct TransactionManager {
    dir: PathBuf,
    active: DashMap<String, Transaction>,
    recovery_age: Duration,
}

impl TransactionManager {
    pub async fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        Self::with_recovery_age(dir, DEFAULT_RECOVERY_AGE).await
    }

    pub async fn with_recovery_age(
        dir: impl Into<PathBuf>,
        recovery_age: Duration,
    ) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| RecallError::Storage {
                operation: format!("create transaction log directory {:?}", dir),
                source: Box::new(e),
            })?;
        Ok(Self {
            dir,
            active: DashMap::new(),
            recovery_age,
        })
    }

    pub fn log_dir(&self) -> &Path {
        &self.dir
    }

    /// Transactions begun but not yet committed or rolled back
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    fn path_for(&self, transaction_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", transaction_id))
    }

    /// Rewrite the transaction file via a temp file so readers never see a
    /// partially written log
    async fn persist(&self, transaction: &Transaction) -> Result<()> {
        let path = self.path_for(&transaction.id);
        let tmp = path.with_extension("json.tmp");
        let json =
            serde_json::to_vec_pretty(transaction).map_err(|e| RecallError::Serialization {
                operation: format!("encode transaction {}", transaction.id),
                source: Box::new(e),
            })?;

        fs::write(&tmp, &json)
            .await
            .map_err(|e| RecallError::Storage {
                operation: format!("write transaction file {:?}", tmp),
                source: Box::new(e),
            })?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| RecallError::Storage {
                operation: format!("replace transaction file {:?}", path),
                source: Box::new(e),
            })
    }

    async fn read_transaction(&self, path: &Path) -> Result<Transaction> {
        let bytes = fs::read(path).await.map_err(|e| RecallError::Storage {
            operation: format!("read transaction file {:?}", path),
            source: Box::new(e),
        })?;
        serde_json::from_slice(&bytes).map_err(|e| RecallError::Serialization {
            operation: format!("decode transaction from {:?}", path),
            source: Box::new(e),
        })
    }

    /// Start a transaction: the pending record reaches disk before any
    /// caller write does
    pub async fn begin_transaction(&self) -> Result<Transaction> {
        let transaction = Transaction::new();
        self.persist(&transaction).await?;
        debug!("Began transaction {}", transaction.id);
        self.active
            .insert(transaction.id.clone(), transaction.clone());
        Ok(transaction)
    }

    /// Record an intent in an active transaction
    ///
    /// Returns false when the transaction is unknown or no longer pending;
    /// both mean the caller must not proceed with the write.
    pub async fn add_log(
        &self,
        transaction_id: &str,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        operation: Operation,
        data: serde_json::Value,
    ) -> Result<bool> {
        // Mutate under the map guard, persist from a snapshot taken after
        // the guard drops
        let snapshot = match self.active.get_mut(transaction_id) {
            Some(mut entry) => {
                if entry.status != TransactionStatus::Pending {
                    return Ok(false);
                }
                entry.logs.push(TransactionLogEntry {
                    id: Uuid::new_v4().to_string(),
                    entity_type: entity_type.into(),
                    entity_id: entity_id.into(),
                    operation,
                    data,
                    timestamp: Utc::now(),
                });
                entry.clone()
            }
            None => return Ok(false),
        };

        self.persist(&snapshot).await?;
        Ok(true)
    }

    /// Mark the transaction committed and retire it from the active set
    pub async fn commit(&self, transaction_id: &str) -> Result<bool> {
        self.finish(transaction_id, TransactionStatus::Committed)
            .await
    }

    /// Mark the transaction rolled back and retire it from the active set
    pub async fn rollback(&self, transaction_id: &str) -> Result<bool> {
        self.finish(transaction_id, TransactionStatus::RolledBack)
            .await
    }

    async fn finish(&self, transaction_id: &str, status: TransactionStatus) -> Result<bool> {
        let snapshot = match self.active.get_mut(transaction_id) {
            Some(mut entry) => {
                if entry.status != TransactionStatus::Pending {
                    return Ok(false);
                }
                entry.status = status;
                entry.clone()
            }
            None => return Ok(false),
        };

        self.persist(&snapshot).await?;
        self.active.remove(transaction_id);
        debug!("Transaction {} finished as {}", transaction_id, status);
        Ok(true)
    }

    /// Load a transaction from disk regardless of whether it is active
    pub async fn load(&self, transaction_id: &str) -> Result<Option<Transaction>> {
        let path = self.path_for(transaction_id);
        match fs::try_exists(&path).await {
            Ok(true) => self.read_transaction(&path).await.map(Some),
            Ok(false) => Ok(None),
            Err(e) => Err(RecallError::Storage {
                operation: format!("stat transaction file {:?}", path),
                source: Box::new(e),
            }),
        }
    }

    /// Resolve transactions left pending by a crash
    ///
    /// Pending transactions younger than the recovery age are presumed to
    /// have completed their writes before the crash and are committed;
    /// older ones are rolled back. Files that fail to parse are counted and
    /// left in place for inspection.
    pub async fn recover_transactions(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let mut entries = fs::read_dir(&self.dir)
            .await
            .map_err(|e| RecallError::Storage {
                operation: format!("read transaction log directory {:?}", self.dir),
                source: Box::new(e),
            })?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| RecallError::Storage {
                operation: "read transaction log entry".to_string(),
                source: Box::new(e),
            })?
        {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            report.scanned += 1;

            let mut transaction = match self.read_transaction(&path).await {
                Ok(t) => t,
                Err(e) => {
                    warn!("Skipping unreadable transaction file {:?}: {}", path, e);
                    report.corrupt += 1;
                    continue;
                }
            };
            if transaction.status != TransactionStatus::Pending {
                continue;
            }

            if transaction.age() < self.recovery_age {
                transaction.status = TransactionStatus::Committed;
                self.persist(&transaction).await?;
                report.committed.push(transaction.id);
            } else {
                transaction.status = TransactionStatus::RolledBack;
                self.persist(&transaction).await?;
                report.rolled_back.push(transaction.id);
            }
        }

        if !report.committed.is_empty() || !report.rolled_back.is_empty() {
            info!(
                "Transaction recovery committed {} and rolled back {} of {} scanned",
                report.committed.len(),
                report.rolled_back.len(),
                report.scanned
            );
        }
        Ok(report)
    }

    /// Delete finished transaction files older than `max_age`, returning
    /// how many were removed. Pending files are never touched.
    pub async fn cleanup_transactions(&self, max_age: Duration) -> Result<usize> {
        let mut removed = 0;
        let mut entries = fs::read_dir(&self.dir)
            .await
            .map_err(|e| RecallError::Storage {
                operation: format!("read transaction log directory {:?}", self.dir),
                source: Box::new(e),
            })?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| RecallError::Storage {
                operation: "read transaction log entry".to_string(),
                source: Box::new(e),
            })?
        {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            let transaction = match self.read_transaction(&path).await {
                Ok(t) => t,
                Err(_) => continue,
            };
            if transaction.status == TransactionStatus::Pending || transaction.age() < max_age {
                continue;
            }

            match fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) => warn!("Failed to remove transaction file {:?}: {}", path, e),
            }
        }

        Ok(removed)
    }
}
