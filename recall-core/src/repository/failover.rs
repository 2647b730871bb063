//! Primary/backup failover repository
//!
//! Composes two repositories: a preferred primary and a backup. Primary
//! health is sampled at most once per `health_check_interval`; in between,
//! the cached sample decides routing. Any primary-path failure flips the
//! cached sample to unhealthy for the remainder of the interval and the
//! call transparently falls through to the backup, so callers see a single
//! healthy store as long as either side is alive.
//!
//! Writes that land in the backup are reconciled to the primary by a
//! bounded best-effort queue: one background task drains it, skips ids the
//! primary already has (a primary value is never overwritten), and gives up
//! on failure without retrying. Callers never await reconciliation; its
//! outcomes are only visible through [`FailoverStats`].

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{HealthReport, Repository};
use crate::error::{ErrorClassifier, ErrorReporter, RecallError, Result};
use crate::types::Entity;

/// Default interval between primary health probes
pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Default capacity of the reconciliation queue
pub const DEFAULT_SYNC_QUEUE_CAPACITY: usize = 128;

/// Counters for the background reconciliation queue
///
/// The source of this pattern fired off syncs with no visibility at all;
/// these counters exist so failures and backlog are at least observable
/// even though syncs remain non-blocking and unretried.
#[derive(Debug, Default)]
pub struct FailoverStats {
    sync_queued: AtomicU64,
    sync_completed: AtomicU64,
    sync_skipped: AtomicU64,
    sync_failed: AtomicU64,
    sync_dropped: AtomicU64,
    failovers: AtomicU64,
}

impl FailoverStats {
    /// Syncs accepted into the queue
    pub fn sync_queued(&self) -> u64 {
        self.sync_queued.load(Ordering::Relaxed)
    }

    /// Syncs that wrote the entity into the primary
    pub fn sync_completed(&self) -> u64 {
        self.sync_completed.load(Ordering::Relaxed)
    }

    /// Syncs skipped because the primary already had the id
    pub fn sync_skipped(&self) -> u64 {
        self.sync_skipped.load(Ordering::Relaxed)
    }

    /// Syncs that failed against the primary (not retried)
    pub fn sync_failed(&self) -> u64 {
        self.sync_failed.load(Ordering::Relaxed)
    }

    /// Syncs dropped because the queue was full
    pub fn sync_dropped(&self) -> u64 {
        self.sync_dropped.load(Ordering::Relaxed)
    }

    /// Times a primary-path failure diverted a call to the backup
    pub fn failovers(&self) -> u64 {
        self.failovers.load(Ordering::Relaxed)
    }
}

struct HealthSample {
    healthy: bool,
    checked_at: Option<Instant>,
}

/// Repository decorator with transparent primary/backup failover
pub struct PrimaryBackupRepository<T: Entity> {
    primary: Arc<dyn Repository<T>>,
    backup: Arc<dyn Repository<T>>,
    health_check_interval: Duration,
    health: Mutex<HealthSample>,
    sync_tx: mpsc::Sender<T>,
    stats: Arc<FailoverStats>,
    classifier: ErrorClassifier,
    reporter: ErrorReporter,
}

impl<T: Entity> PrimaryBackupRepository<T> {
    pub fn new(
        primary: Arc<dyn Repository<T>>,
        backup: Arc<dyn Repository<T>>,
    ) -> Result<Self> {
        Self::with_options(
            primary,
            backup,
            DEFAULT_HEALTH_CHECK_INTERVAL,
            DEFAULT_SYNC_QUEUE_CAPACITY,
        )
    }

    /// Construction needs a running tokio runtime to host the
    /// reconciliation worker
    pub fn with_options(
        primary: Arc<dyn Repository<T>>,
        backup: Arc<dyn Repository<T>>,
        health_check_interval: Duration,
        sync_queue_capacity: usize,
    ) -> Result<Self> {
        let handle =
            tokio::runtime::Handle::try_current().map_err(|_| RecallError::Configuration {
                component: "failover repository".to_string(),
                message: "must be constructed inside a tokio runtime".to_string(),
            })?;

        let stats = Arc::new(FailoverStats::default());
        let (sync_tx, sync_rx) = mpsc::channel(sync_queue_capacity.max(1));

        handle.spawn(sync_worker(primary.clone(), sync_rx, stats.clone()));

        Ok(Self {
            primary,
            backup,
            health_check_interval,
            health: Mutex::new(HealthSample {
                healthy: true,
                checked_at: None,
            }),
            sync_tx,
            stats,
            classifier: ErrorClassifier::new(),
            reporter: ErrorReporter::default(),
        })
    }

    /// Reconciliation and failover counters
    pub fn stats(&self) -> &FailoverStats {
        &self.stats
    }

    /// Whether the primary is currently considered healthy, probing it only
    /// when the cached sample has aged out
    async fn primary_healthy(&self) -> bool {
        {
            let sample = self.health.lock();
            if let Some(at) = sample.checked_at {
                if at.elapsed() < self.health_check_interval {
                    return sample.healthy;
                }
            }
        }

        let report = self.primary.check_health().await;
        let healthy = report.is_up();
        let mut sample = self.health.lock();
        sample.healthy = healthy;
        sample.checked_at = Some(Instant::now());
        if !healthy {
            debug!("Primary repository for {} probed unhealthy", T::kind());
        }
        healthy
    }

    /// Classify and report a primary-path failure, then pin the cached
    /// health sample to unhealthy for the rest of the interval
    fn note_primary_failure(&self, operation: &str, error: &RecallError) {
        let info = self
            .classifier
            .classify(error, Some(operation), Some("primary"), None);
        self.reporter.report(&info);
        self.stats.failovers.fetch_add(1, Ordering::Relaxed);

        let mut sample = self.health.lock();
        sample.healthy = false;
        sample.checked_at = Some(Instant::now());
    }

    /// Queue a best-effort one-way sync of the entity into the primary
    fn schedule_sync(&self, entity: T) {
        match self.sync_tx.try_send(entity) {
            Ok(()) => {
                self.stats.sync_queued.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.stats.sync_dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Reconciliation queue for {} is full, dropping sync",
                    T::kind()
                );
            }
        }
    }
}

/// Drains the reconciliation queue. Exits when the owning repository is
/// dropped and the channel closes.
async fn sync_worker<T: Entity>(
    primary: Arc<dyn Repository<T>>,
    mut rx: mpsc::Receiver<T>,
    stats: Arc<FailoverStats>,
) {
    while let Some(entity) = rx.recv().await {
        let id = entity.id().to_string();
        match primary.exists(&id).await {
            // Idempotent: a value already in the primary is never overwritten
            Ok(true) => {
                stats.sync_skipped.fetch_add(1, Ordering::Relaxed);
            }
            Ok(false) => match primary.save(entity).await {
                Ok(_) => {
                    stats.sync_completed.fetch_add(1, Ordering::Relaxed);
                    debug!("Synced {} {} back to primary", T::kind(), id);
                }
                Err(e) => {
                    stats.sync_failed.fetch_add(1, Ordering::Relaxed);
                    warn!("Sync of {} {} to primary failed: {}", T::kind(), id, e);
                }
            },
            Err(e) => {
                stats.sync_failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Sync existence check for {} {} failed: {}",
                    T::kind(),
                    id,
                    e
                );
            }
        }
    }
}

#[async_trait]
impl<T: Entity> Repository<T> for PrimaryBackupRepository<T> {
    async fn save(&self, entity: T) -> Result<T> {
        if self.primary_healthy().await {
            match self.primary.save(entity.clone()).await {
                Ok(saved) => return Ok(saved),
                Err(e) => self.note_primary_failure("save", &e),
            }
        }

        let saved = self.backup.save(entity).await?;
        self.schedule_sync(saved.clone());
        Ok(saved)
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<T>> {
        let mut primary_unavailable = !self.primary_healthy().await;
        if !primary_unavailable {
            match self.primary.find_by_id(id).await {
                Ok(Some(entity)) => return Ok(Some(entity)),
                // Primary miss: the backup may still have it
                Ok(None) => {}
                Err(e) => {
                    self.note_primary_failure("find_by_id", &e);
                    primary_unavailable = true;
                }
            }
        }

        match self.backup.find_by_id(id).await? {
            Some(entity) => {
                // A backup hit behind a working primary is an ordinary miss,
                // not missed replication; only an unavailable primary earns
                // the record a place in the reconciliation queue
                if primary_unavailable {
                    self.schedule_sync(entity.clone());
                }
                Ok(Some(entity))
            }
            None => Ok(None),
        }
    }

    async fn find_all(&self) -> Result<Vec<T>> {
        if self.primary_healthy().await {
            match self.primary.find_all().await {
                Ok(entities) => return Ok(entities),
                Err(e) => self.note_primary_failure("find_all", &e),
            }
        }
        self.backup.find_all().await
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let mut primary_deleted = false;
        let mut primary_attempted = false;

        if self.primary_healthy().await {
            primary_attempted = true;
            match self.primary.delete(id).await {
                Ok(deleted) => primary_deleted = deleted,
                Err(e) => self.note_primary_failure("delete", &e),
            }
        }

        match self.backup.delete(id).await {
            Ok(backup_deleted) => Ok(primary_deleted || backup_deleted),
            Err(e) => {
                if primary_attempted && primary_deleted {
                    // Primary already handled it; the backup error is noise
                    debug!("Backup delete of {} failed after primary succeeded: {}", id, e);
                    Ok(true)
                } else {
                    Err(e)
                }
            }
        }
    }

    async fn exists(&self, id: &str) -> Result<bool> {
        if self.primary_healthy().await {
            match self.primary.exists(id).await {
                Ok(true) => return Ok(true),
                Ok(false) => {}
                Err(e) => self.note_primary_failure("exists", &e),
            }
        }
        self.backup.exists(id).await
    }

    async fn count(&self) -> Result<usize> {
        if self.primary_healthy().await {
            match self.primary.count().await {
                Ok(count) => return Ok(count),
                Err(e) => self.note_primary_failure("count", &e),
            }
        }
        self.backup.count().await
    }

    async fn check_health(&self) -> HealthReport {
        let primary = self.primary.check_health().await;
        let backup = self.backup.check_health().await;

        let report = if primary.is_up() || backup.is_up() {
            HealthReport::up()
        } else {
            HealthReport::down("both primary and backup are down")
        };
        report
            .with_detail(
                "primary",
                if primary.is_up() { "up" } else { "down" },
            )
            .with_detail("backup", if backup.is_up() { "up" } else { "down" })
            .with_detail(
                "sync_backlog",
                self.stats
                    .sync_queued()
                    .saturating_sub(self.stats.sync_completed())
                    .saturating_sub(self.stats.sync_skipped())
                    .saturating_sub(self.stats.sync_failed())
                    .to_string(),
            )
    }
}
