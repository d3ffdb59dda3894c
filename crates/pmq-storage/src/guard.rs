use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Writer-side steps of one snapshot replacement, orchestrated by
/// [`ReplicaGuard::try_sync`].
#[async_trait]
pub trait SnapshotWriter: Send + Sync {
    /// Preserve the current read snapshot, if one exists.
    async fn backup(&self) -> anyhow::Result<()>;
    /// Replace the read snapshot with the writer's state and verify it.
    /// Returns the active-record count of the new snapshot.
    async fn copy(&self) -> anyhow::Result<u64>;
    /// Put the preserved snapshot back after a failed copy.
    async fn restore(&self) -> anyhow::Result<()>;
    async fn discard_backup(&self) -> anyhow::Result<()>;
}

/// Process-wide count of open read sections over the read snapshot.
///
/// Cloning yields another handle to the same counter.
#[derive(Debug, Clone)]
pub struct ReplicaGuard {
    active_reads: Arc<AtomicUsize>,
    poll_interval: Duration,
}

impl Default for ReplicaGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplicaGuard {
    pub fn new() -> Self {
        Self::with_poll_interval(DEFAULT_POLL_INTERVAL)
    }

    pub fn with_poll_interval(poll_interval: Duration) -> Self {
        Self {
            active_reads: Arc::new(AtomicUsize::new(0)),
            poll_interval: poll_interval.max(Duration::from_millis(1)),
        }
    }

    pub fn enter_read(&self) -> ReadToken {
        self.active_reads.fetch_add(1, Ordering::SeqCst);
        ReadToken {
            active_reads: Arc::clone(&self.active_reads),
        }
    }

    pub fn exit_read(&self, token: ReadToken) {
        drop(token);
    }

    pub fn active_reads(&self) -> usize {
        self.active_reads.load(Ordering::SeqCst)
    }

    /// Poll until no read section is open or `max_wait` elapses.
    pub async fn wait_for_idle(&self, max_wait: Duration) -> bool {
        let deadline = Instant::now() + max_wait;
        loop {
            if self.active_reads() == 0 {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    /// Run one snapshot replacement once readers have drained.
    ///
    /// Returns false without touching the snapshot when readers stay active for
    /// the whole wait, and false after restoring the backup when the copy fails.
    pub async fn try_sync(&self, max_wait: Duration, writer: &dyn SnapshotWriter) -> bool {
        if !self.wait_for_idle(max_wait).await {
            info!(
                active_reads = self.active_reads(),
                waited_ms = max_wait.as_millis() as u64,
                "sync skipped: readers still active"
            );
            return false;
        }

        if let Err(err) = writer.backup().await {
            warn!(error = %err, "sync aborted: could not back up read snapshot");
            return false;
        }

        // A reader may have entered while the backup was taken.
        let active_reads = self.active_reads();
        if active_reads > 0 {
            info!(active_reads, "sync skipped: reader entered before copy");
            if let Err(err) = writer.discard_backup().await {
                warn!(error = %err, "snapshot backup could not be removed");
            }
            return false;
        }

        match writer.copy().await {
            Ok(active_records) => {
                if let Err(err) = writer.discard_backup().await {
                    warn!(error = %err, "snapshot backup could not be removed");
                }
                debug!(active_records, "snapshot replaced");
                true
            }
            Err(err) => {
                warn!(error = %err, "sync failed; restoring previous snapshot");
                if let Err(restore_err) = writer.restore().await {
                    warn!(error = %restore_err, "restoring snapshot backup failed");
                }
                false
            }
        }
    }
}

/// Open read section. Dropping the token closes it.
#[derive(Debug)]
#[must_use = "dropping the token ends the read section"]
pub struct ReadToken {
    active_reads: Arc<AtomicUsize>,
}

impl Drop for ReadToken {
    fn drop(&mut self) {
        self.active_reads.fetch_sub(1, Ordering::SeqCst);
    }
}
