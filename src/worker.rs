//! Sync Worker: a single-threaded job loop that incrementally archives a channel's
//! history, newer-sync then historical backfill, tolerating flood-wait backoff and restarts.
//! Runs as one spawned task for the process lifetime, using a `tokio::select!` between an
//! interruptible sleep and a `CancellationToken` so shutdown can interrupt a backoff wait.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::archive::ArchiveStore;
use crate::config::Config;
use crate::dialog::SharedDialogIndex;
use crate::error::GatewayError;
use crate::gateway::{HistoryOptions, TelegramGateway};
use crate::models::{Job, JobFinalize, NormalizedMessage};
use crate::peer::NormalizedPeer;

/// Handle shared between the Tool Dispatcher (which calls [`resume`](Self::resume) after
/// scheduling a job) and the Transport Host (which calls it once at startup and
/// [`shutdown`](Self::shutdown) on signal).
pub struct SyncWorker {
    archive: ArchiveStore,
    gateway: Arc<TelegramGateway>,
    dialog_index: SharedDialogIndex,
    batch_size: i64,
    inter_job_delay: Duration,
    inter_batch_delay: Duration,
    /// Guards against overlapping loop invocations from repeated `resume()` calls.
    processing: AtomicBool,
    stop_requested: AtomicBool,
    cancel: CancellationToken,
}

impl SyncWorker {
    pub fn new(
        archive: ArchiveStore,
        gateway: Arc<TelegramGateway>,
        dialog_index: SharedDialogIndex,
        config: &Config,
    ) -> Arc<Self> {
        Arc::new(Self {
            archive,
            gateway,
            dialog_index,
            batch_size: config.sync_batch_size as i64,
            inter_job_delay: Duration::from_secs(config.sync_inter_job_delay_secs),
            inter_batch_delay: Duration::from_millis(config.sync_inter_batch_delay_ms),
            processing: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        })
    }

    /// External trigger point. If the loop is already running, this is a no-op — the
    /// running loop will pick up the newly (re-)queued job on its next `next_job()` poll.
    /// Spawns the loop as its own task when idle.
    pub fn resume(self: &Arc<Self>) {
        if self.stop_requested.load(Ordering::SeqCst) {
            return;
        }
        if self.processing.swap(true, Ordering::SeqCst) {
            return;
        }
        let worker = self.clone();
        tokio::spawn(async move {
            worker.run_loop().await;
            worker.processing.store(false, Ordering::SeqCst);
        });
    }

    async fn run_loop(&self) {
        loop {
            if self.stop_requested.load(Ordering::SeqCst) || self.cancel.is_cancelled() {
                return;
            }

            let job = match self.archive.next_job().await {
                Ok(Some(job)) => job,
                Ok(None) => return,
                Err(e) => {
                    error!(error = %e, "failed to load next sync job");
                    return;
                }
            };

            if let Err(e) = self.archive.mark_in_progress(job.id).await {
                error!(error = %e, job_id = job.id, "failed to mark job in_progress");
                return;
            }

            if let Err(e) = self.process_job(&job).await {
                self.handle_failure(&job, e).await;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(self.inter_job_delay) => {}
            }
        }
    }

    /// Runs one pass over a job: Phase A (newer-sync) then Phase B (backfill).
    async fn process_job(&self, job: &Job) -> Result<(), GatewayError> {
        let peer = NormalizedPeer::Id(
            job.channel_id
                .parse()
                .map_err(|_| GatewayError::Transport(format!("invalid channel_id in job row: {}", job.channel_id)))?,
        );
        let peer_handle = self.gateway.resolve_peer(&peer).await?;

        let dialog_entry = self.dialog_index.get_or_refresh(peer.as_id().unwrap_or_default(), &self.gateway).await.ok();
        let peer_title = dialog_entry.as_ref().map(|e| e.title.clone()).unwrap_or_else(|| job.peer_title.clone());
        let mut peer_type = dialog_entry
            .as_ref()
            .map(|e| format!("{:?}", e.kind).to_lowercase())
            .unwrap_or_else(|| job.peer_type.clone());

        let mut last_message_id = job.last_message_id;
        let mut oldest_message_id = job.oldest_message_id;

        // Phase A — newer-sync.
        let newer = self
            .gateway
            .iter_history(
                &peer_handle,
                HistoryOptions {
                    limit: self.batch_size as usize,
                    min_id: Some(last_message_id),
                    ..Default::default()
                },
            )
            .await?;
        let fetched = newer.len();
        let has_more_newer = fetched == self.batch_size as usize;

        let mut new_only: Vec<NormalizedMessage> = newer.into_iter().filter(|m| m.id > last_message_id).collect();
        new_only.sort_by_key(|m| m.id);
        if let Some(first) = new_only.first() {
            peer_type = first.peer_type.clone();
        }
        if let Some(max_new) = new_only.iter().map(|m| m.id).max() {
            last_message_id = last_message_id.max(max_new);
        }
        if let Some(min_new) = new_only.iter().map(|m| m.id).min() {
            oldest_message_id = Some(oldest_message_id.map_or(min_new, |old| old.min(min_new)));
        }
        self.archive
            .insert_messages(&job.channel_id, &new_only)
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;

        // Phase B — backfill.
        let target = job.target_message_count;
        let mut count = self
            .archive
            .count_messages(&job.channel_id)
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;
        let mut inserted_any = false;

        if count < target {
            let mut offset_id = oldest_message_id.unwrap_or(last_message_id);
            loop {
                if count >= target {
                    break;
                }
                let chunk_size = self.batch_size.min(target - count).max(1) as usize;
                let chunk = self
                    .gateway
                    .iter_history(
                        &peer_handle,
                        HistoryOptions {
                            limit: chunk_size,
                            offset_id: Some(offset_id),
                            reverse: false,
                            ..Default::default()
                        },
                    )
                    .await?;

                if chunk.is_empty() {
                    break;
                }

                if let Some(min_chunk) = chunk.iter().map(|m| m.id).min() {
                    oldest_message_id = Some(oldest_message_id.map_or(min_chunk, |old| old.min(min_chunk)));
                    offset_id = min_chunk;
                }

                self.archive
                    .insert_messages(&job.channel_id, &chunk)
                    .await
                    .map_err(|e| GatewayError::Transport(e.to_string()))?;
                inserted_any = true;

                count = self
                    .archive
                    .count_messages(&job.channel_id)
                    .await
                    .map_err(|e| GatewayError::Transport(e.to_string()))?;

                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.inter_batch_delay) => {}
                }
            }
        }
        let has_more_older = inserted_any && count < target;

        let status: &'static str = if has_more_newer || has_more_older { "pending" } else { "idle" };

        self.archive
            .finalize_job(
                job.id,
                JobFinalize {
                    peer_title: &peer_title,
                    peer_type: &peer_type,
                    last_message_id,
                    oldest_message_id,
                    message_count: count,
                    target_message_count: target,
                    status,
                },
            )
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;

        info!(channel_id = %job.channel_id, message_count = count, status, "sync job pass complete");
        Ok(())
    }

    /// Handles a failed sync pass: backs off on flood-wait, records and stops otherwise.
    async fn handle_failure(&self, job: &Job, err: GatewayError) {
        match err {
            GatewayError::FloodWait(seconds) => {
                warn!(channel_id = %job.channel_id, seconds, "flood wait, backing off");
                if let Err(e) = self.archive.mark_rate_limited(job.id, seconds).await {
                    error!(error = %e, "failed to record flood-wait state");
                }
                tokio::select! {
                    _ = self.cancel.cancelled() => {}
                    _ = tokio::time::sleep(Duration::from_secs(seconds)) => {}
                }
            }
            other => {
                error!(channel_id = %job.channel_id, error = %other, "sync job failed");
                if let Err(e) = self.archive.mark_error(job.id, &other.to_string()).await {
                    error!(error = %e, "failed to record job error");
                }
            }
        }
    }

    /// Requests a stop, waits for the current job to finish, closes the database, then
    /// returns.
    pub async fn shutdown(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        self.cancel.cancel();
        while self.processing.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        self.archive.close().await;
        info!("sync worker shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ArchiveStore;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_archive() -> ArchiveStore {
        let pool = SqlitePoolOptions::new().connect("sqlite::memory:").await.unwrap();
        sqlx::query(include_str!("../migrations/20260728_000001_initial_schema.sql"))
            .execute(&pool)
            .await
            .unwrap();
        ArchiveStore::new(pool)
    }

    #[tokio::test]
    async fn finalize_sets_idle_when_backfill_and_newer_sync_both_exhausted() {
        let archive = memory_archive().await;
        let job = archive.upsert_job("42", 50).await.unwrap();
        archive
            .finalize_job(
                job.id,
                JobFinalize {
                    peer_title: "Gamma",
                    peer_type: "channel",
                    last_message_id: 250,
                    oldest_message_id: Some(51),
                    message_count: 50,
                    target_message_count: 50,
                    status: "idle",
                },
            )
            .await
            .unwrap();

        let refreshed = archive.get_job_by_channel("42").await.unwrap().unwrap();
        assert_eq!(refreshed.status, "idle");
        assert_eq!(refreshed.message_count, 50);
        assert_eq!(refreshed.last_message_id, 250);
        assert_eq!(refreshed.oldest_message_id, Some(51));
    }

    #[tokio::test]
    async fn mark_rate_limited_returns_job_to_pending_with_message() {
        let archive = memory_archive().await;
        let job = archive.upsert_job("42", 50).await.unwrap();
        archive.mark_rate_limited(job.id, 2).await.unwrap();

        let refreshed = archive.get_job_by_channel("42").await.unwrap().unwrap();
        assert_eq!(refreshed.status, "pending");
        assert_eq!(refreshed.error.as_deref(), Some("Rate limited, waiting 2s"));
    }

    #[tokio::test]
    async fn mark_error_leaves_row_for_manual_requeue() {
        let archive = memory_archive().await;
        let job = archive.upsert_job("42", 50).await.unwrap();
        archive.mark_error(job.id, "boom").await.unwrap();

        let refreshed = archive.get_job_by_channel("42").await.unwrap().unwrap();
        assert_eq!(refreshed.status, "error");
        assert_eq!(refreshed.error.as_deref(), Some("boom"));

        // A fresh scheduleMessageSync re-queues it, clearing the error.
        let requeued = archive.upsert_job("42", 50).await.unwrap();
        assert_eq!(requeued.status, "pending");
        assert!(requeued.error.is_none());
    }
}
