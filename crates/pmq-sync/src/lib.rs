//! Read-replica synchronization: copies the writer store over the read snapshot
//! whenever no query holds a read section open.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pmq_storage::{count_active_records, snapshot_into, MarketWriter, ReplicaGuard, SnapshotWriter};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "pmq-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub write_db: PathBuf,
    pub read_db: PathBuf,
    pub interval: Duration,
    pub max_wait: Duration,
    pub poll_interval: Duration,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            write_db: std::env::var("PMQ_WRITE_DB")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("polymarket.db")),
            read_db: std::env::var("PMQ_READ_DB")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("polymarket_read.db")),
            interval: Duration::from_secs(env_u64("PMQ_SYNC_INTERVAL_SECS", 5).max(1)),
            max_wait: Duration::from_secs(env_u64("PMQ_SYNC_MAX_WAIT_SECS", 10)),
            poll_interval: Duration::from_millis(env_u64("PMQ_SYNC_POLL_MILLIS", 100).max(1)),
        }
    }

    pub fn for_paths(write_db: impl Into<PathBuf>, read_db: impl Into<PathBuf>) -> Self {
        Self {
            write_db: write_db.into(),
            read_db: read_db.into(),
            interval: Duration::from_secs(5),
            max_wait: Duration::from_secs(10),
            poll_interval: Duration::from_millis(100),
        }
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// File-level snapshot steps: backup, consistent copy into a temp file,
/// verification, atomic rename over the read snapshot.
#[derive(Debug, Clone)]
pub struct FileSnapshot {
    write_path: PathBuf,
    read_path: PathBuf,
    backup_path: PathBuf,
}

impl FileSnapshot {
    pub fn new(write_path: impl Into<PathBuf>, read_path: impl Into<PathBuf>) -> Self {
        let read_path = read_path.into();
        let mut backup_name = read_path.as_os_str().to_owned();
        backup_name.push(".backup");
        Self {
            write_path: write_path.into(),
            backup_path: PathBuf::from(backup_name),
            read_path,
        }
    }

    pub fn read_path(&self) -> &Path {
        &self.read_path
    }

    pub fn write_path(&self) -> &Path {
        &self.write_path
    }

    pub fn backup_path(&self) -> &Path {
        &self.backup_path
    }

    fn temp_path(&self) -> PathBuf {
        let dir = self
            .read_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let stem = self
            .read_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "snapshot".to_string());
        dir.join(format!(".{stem}.{}.tmp", Uuid::new_v4()))
    }

    async fn ensure_write_store(&self) -> Result<()> {
        if fs::try_exists(&self.write_path)
            .await
            .with_context(|| format!("checking {}", self.write_path.display()))?
        {
            return Ok(());
        }
        info!(path = %self.write_path.display(), "write store missing; initializing empty schema");
        let writer = MarketWriter::open(&self.write_path)
            .await
            .with_context(|| format!("initializing {}", self.write_path.display()))?;
        writer.close().await;
        Ok(())
    }

    async fn copy_into_temp(&self, temp: &Path) -> Result<u64> {
        snapshot_into(&self.write_path, temp)
            .await
            .with_context(|| format!("copying {} -> {}", self.write_path.display(), temp.display()))?;
        let active = count_active_records(temp)
            .await
            .with_context(|| format!("verifying {}", temp.display()))?;
        fs::rename(temp, &self.read_path).await.with_context(|| {
            format!("atomically renaming {} -> {}", temp.display(), self.read_path.display())
        })?;
        Ok(active)
    }
}

#[async_trait]
impl SnapshotWriter for FileSnapshot {
    async fn backup(&self) -> Result<()> {
        if !fs::try_exists(&self.read_path).await.unwrap_or(false) {
            return Ok(());
        }
        fs::copy(&self.read_path, &self.backup_path)
            .await
            .with_context(|| format!("backing up {}", self.read_path.display()))?;
        Ok(())
    }

    async fn copy(&self) -> Result<u64> {
        self.ensure_write_store().await?;
        if let Some(parent) = self.read_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }

        let temp = self.temp_path();
        match self.copy_into_temp(&temp).await {
            Ok(active) => {
                info!(active_records = active, "synced active events to read snapshot");
                Ok(active)
            }
            Err(err) => {
                let _ = fs::remove_file(&temp).await;
                Err(err)
            }
        }
    }

    async fn restore(&self) -> Result<()> {
        if !fs::try_exists(&self.backup_path).await.unwrap_or(false) {
            return Ok(());
        }
        let temp = self.temp_path();
        fs::copy(&self.backup_path, &temp)
            .await
            .with_context(|| format!("staging backup {}", self.backup_path.display()))?;
        if let Err(err) = fs::rename(&temp, &self.read_path).await {
            let _ = fs::remove_file(&temp).await;
            return Err(err).with_context(|| format!("restoring {}", self.read_path.display()));
        }
        fs::remove_file(&self.backup_path)
            .await
            .with_context(|| format!("removing {}", self.backup_path.display()))?;
        info!(path = %self.read_path.display(), "restored read snapshot from backup");
        Ok(())
    }

    async fn discard_backup(&self) -> Result<()> {
        match fs::remove_file(&self.backup_path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("removing {}", self.backup_path.display())),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub synced: bool,
    pub snapshot_sha256: Option<String>,
}

/// Owns one snapshot pair and the reader guard shared with query handlers.
pub struct ReplicaSync {
    config: SyncConfig,
    guard: ReplicaGuard,
    snapshot: FileSnapshot,
}

impl ReplicaSync {
    pub fn new(config: SyncConfig, guard: ReplicaGuard) -> Self {
        let snapshot = FileSnapshot::new(&config.write_db, &config.read_db);
        Self {
            config,
            guard,
            snapshot,
        }
    }

    pub fn guard(&self) -> &ReplicaGuard {
        &self.guard
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// One pass; failures are logged and reported as `synced: false`.
    pub async fn run_once(&self) -> SyncRunSummary {
        let started_at = Utc::now();
        let span = info_span!("sync_pass", read_db = %self.config.read_db.display());
        let synced = self
            .guard
            .try_sync(self.config.max_wait, &self.snapshot)
            .instrument(span)
            .await;

        let snapshot_sha256 = if synced {
            match snapshot_digest(&self.config.read_db).await {
                Ok(digest) => Some(digest),
                Err(err) => {
                    warn!(error = %err, "could not digest read snapshot");
                    None
                }
            }
        } else {
            None
        };

        SyncRunSummary {
            started_at,
            finished_at: Utc::now(),
            synced,
            snapshot_sha256,
        }
    }

    /// Interval job that runs one pass per `config.interval`.
    pub async fn build_scheduler(self: &Arc<Self>) -> Result<JobScheduler> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let sync = Arc::clone(self);
        let job = Job::new_repeated_async(self.config.interval, move |_uuid, _lock| {
            let sync = Arc::clone(&sync);
            Box::pin(async move {
                sync.run_once().await;
            })
        })
        .context("creating sync job")?;
        sched.add(job).await.context("adding sync job")?;
        Ok(sched)
    }

    /// Initial pass, then scheduled passes until `shutdown` resolves.
    pub async fn run_until(self: Arc<Self>, shutdown: impl Future<Output = ()>) -> Result<()> {
        info!(
            write_db = %self.config.write_db.display(),
            read_db = %self.config.read_db.display(),
            interval_secs = self.config.interval.as_secs(),
            "starting sync service"
        );
        let initial = self.run_once().await;
        if !initial.synced {
            warn!("initial sync did not complete; retrying on schedule");
        }

        let mut sched = self.build_scheduler().await?;
        sched.start().await.context("starting scheduler")?;
        shutdown.await;
        sched.shutdown().await.context("stopping scheduler")?;
        info!("sync service stopped");
        Ok(())
    }
}

pub async fn snapshot_digest(path: &Path) -> Result<String> {
    let bytes = fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env();
    let guard = ReplicaGuard::with_poll_interval(config.poll_interval);
    Ok(ReplicaSync::new(config, guard).run_once().await)
}
