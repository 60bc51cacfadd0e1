//! Archive Store: the `jobs`/`messages` tables, and the operations the Sync Worker
//! and Tool Dispatcher use to read and write them. Single-writer (worker), multi-reader
//! (tools).

use regex::RegexBuilder;
use sqlx::SqlitePool;

use crate::error::ArchiveError;
use crate::models::{Job, JobFinalize, MessageRow, MessageStats, NormalizedMessage};

#[derive(Clone)]
pub struct ArchiveStore {
    pool: SqlitePool,
}

impl ArchiveStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Closes the underlying pool, letting sqlx run its graceful connection teardown
    /// (including the WAL checkpoint) instead of relying on an implicit drop at exit.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Insert or reset a job to `pending`, clearing any previous error, and updating the
    /// target depth.
    pub async fn upsert_job(&self, channel_id: &str, target: i64) -> Result<Job, ArchiveError> {
        sqlx::query(
            "INSERT INTO jobs (channel_id, status, target_message_count, updated_at)
             VALUES (?, 'pending', ?, strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
             ON CONFLICT(channel_id) DO UPDATE SET
                status = 'pending',
                target_message_count = excluded.target_message_count,
                error = NULL,
                updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')",
        )
        .bind(channel_id)
        .bind(target)
        .execute(&self.pool)
        .await?;

        self.get_job_by_channel(channel_id)
            .await?
            .ok_or_else(|| ArchiveError::Database(sqlx::Error::RowNotFound))
    }

    pub async fn get_job_by_channel(&self, channel_id: &str) -> Result<Option<Job>, ArchiveError> {
        let job = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE channel_id = ?")
            .bind(channel_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    /// Lists all jobs, most recently updated first.
    pub async fn list_jobs(&self) -> Result<Vec<Job>, ArchiveError> {
        let jobs = sqlx::query_as::<_, Job>("SELECT * FROM jobs ORDER BY updated_at DESC")
            .fetch_all(&self.pool)
            .await?;
        Ok(jobs)
    }

    /// First `pending`/`in_progress` row, oldest `updated_at` first.
    pub async fn next_job(&self) -> Result<Option<Job>, ArchiveError> {
        let job = sqlx::query_as::<_, Job>(
            "SELECT * FROM jobs WHERE status IN ('pending', 'in_progress') ORDER BY updated_at ASC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(job)
    }

    pub async fn mark_in_progress(&self, id: i64) -> Result<(), ArchiveError> {
        sqlx::query("UPDATE jobs SET status = 'in_progress', updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now') WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Persists the updated progress fields and terminal status after a sync pass.
    pub async fn finalize_job(&self, id: i64, fields: JobFinalize<'_>) -> Result<(), ArchiveError> {
        sqlx::query(
            "UPDATE jobs SET
                peer_title = ?,
                peer_type = ?,
                last_message_id = ?,
                oldest_message_id = ?,
                message_count = ?,
                target_message_count = ?,
                last_synced_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now'),
                error = NULL,
                status = ?,
                updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')
             WHERE id = ?",
        )
        .bind(fields.peer_title)
        .bind(fields.peer_type)
        .bind(fields.last_message_id)
        .bind(fields.oldest_message_id)
        .bind(fields.message_count)
        .bind(fields.target_message_count)
        .bind(fields.status)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Returns a job to `pending` and records the wait message, for flood-wait recovery.
    pub async fn mark_rate_limited(&self, id: i64, seconds: u64) -> Result<(), ArchiveError> {
        sqlx::query(
            "UPDATE jobs SET status = 'pending', error = ?, updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now') WHERE id = ?",
        )
        .bind(format!("Rate limited, waiting {seconds}s"))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Marks a job `error`, leaving it for manual requeue via scheduleMessageSync.
    pub async fn mark_error(&self, id: i64, text: &str) -> Result<(), ArchiveError> {
        sqlx::query(
            "UPDATE jobs SET status = 'error', error = ?, updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now') WHERE id = ?",
        )
        .bind(text)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// One transaction; conflicts on (channel_id, message_id) are silently ignored so
    /// repeated syncs over the same range stay idempotent.
    pub async fn insert_messages(&self, channel_id: &str, records: &[NormalizedMessage]) -> Result<u64, ArchiveError> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;
        for msg in records {
            let raw_json = serde_json::to_string(&msg.raw).unwrap_or_else(|_| "{}".to_string());
            let result = sqlx::query(
                "INSERT INTO messages (channel_id, message_id, date, from_id, text, raw_json)
                 VALUES (?, ?, ?, ?, ?, ?)
                 ON CONFLICT(channel_id, message_id) DO NOTHING",
            )
            .bind(channel_id)
            .bind(msg.id)
            .bind(msg.date)
            .bind(&msg.from_id)
            .bind(&msg.text)
            .bind(&raw_json)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();
        }
        tx.commit().await?;
        Ok(inserted)
    }

    /// Counts archived messages for a channel.
    pub async fn count_messages(&self, channel_id: &str) -> Result<i64, ArchiveError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM messages WHERE channel_id = ?")
            .bind(channel_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Aggregate total, min/max id, and min/max date for a channel.
    pub async fn message_stats(&self, channel_id: &str) -> Result<MessageStats, ArchiveError> {
        let row: (i64, Option<i64>, Option<i64>, Option<i64>, Option<i64>) = sqlx::query_as(
            "SELECT COUNT(*), MIN(message_id), MAX(message_id), MIN(date), MAX(date)
             FROM messages WHERE channel_id = ?",
        )
        .bind(channel_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(MessageStats {
            total: row.0,
            min_id: row.1,
            max_id: row.2,
            min_date: row.3,
            max_date: row.4,
        })
    }

    /// A linear scan applying the given regular expression to each message's text.
    pub async fn search_messages(
        &self,
        channel_id: &str,
        pattern: &str,
        limit: usize,
        case_insensitive: bool,
    ) -> Result<Vec<MessageRow>, ArchiveError> {
        let re = RegexBuilder::new(pattern).case_insensitive(case_insensitive).build()?;

        let rows = sqlx::query_as::<_, MessageRow>(
            "SELECT channel_id, message_id, date, from_id, text, raw_json, created_at
             FROM messages WHERE channel_id = ? ORDER BY message_id ASC",
        )
        .bind(channel_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter(|row| row.text.as_deref().is_some_and(|t| re.is_match(t)))
            .take(limit)
            .collect())
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_store() -> ArchiveStore {
        let pool = SqlitePoolOptions::new().connect("sqlite::memory:").await.unwrap();
        sqlx::query(include_str!("../migrations/20260728_000001_initial_schema.sql"))
            .execute(&pool)
            .await
            .unwrap();
        ArchiveStore::new(pool)
    }

    fn msg(id: i64, text: &str) -> NormalizedMessage {
        NormalizedMessage {
            id,
            date: Some(1_700_000_000 + id),
            text: text.to_string(),
            from_id: Some("123".to_string()),
            peer_type: "channel".to_string(),
            peer_id: 42,
            raw: serde_json::json!({"id": id, "text": text}),
        }
    }

    #[tokio::test]
    async fn upsert_job_creates_pending_row() {
        let store = memory_store().await;
        let job = store.upsert_job("42", 500).await.unwrap();
        assert_eq!(job.status, "pending");
        assert_eq!(job.target_message_count, 500);
        assert_eq!(job.channel_id, "42");
    }

    #[tokio::test]
    async fn upsert_job_is_idempotent_per_channel() {
        let store = memory_store().await;
        store.upsert_job("42", 500).await.unwrap();
        let again = store.upsert_job("42", 1000).await.unwrap();
        assert_eq!(again.target_message_count, 1000);

        let all = store.list_jobs().await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn upsert_job_clears_previous_error() {
        let store = memory_store().await;
        let job = store.upsert_job("42", 500).await.unwrap();
        store.mark_error(job.id, "boom").await.unwrap();

        let refreshed = store.upsert_job("42", 500).await.unwrap();
        assert_eq!(refreshed.status, "pending");
        assert!(refreshed.error.is_none());
    }

    #[tokio::test]
    async fn insert_messages_is_idempotent() {
        let store = memory_store().await;
        let records = vec![msg(1, "hello"), msg(2, "world")];
        let first = store.insert_messages("42", &records).await.unwrap();
        assert_eq!(first, 2);

        let second = store.insert_messages("42", &records).await.unwrap();
        assert_eq!(second, 0);
        assert_eq!(store.count_messages("42").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn insert_messages_conflict_preserves_original_raw_json() {
        let store = memory_store().await;
        store.insert_messages("42", &[msg(1, "original")]).await.unwrap();
        store.insert_messages("42", &[msg(1, "mutated")]).await.unwrap();

        let rows = store.search_messages("42", ".", 10, false).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].raw_json.contains("original"));
    }

    #[tokio::test]
    async fn next_job_orders_by_updated_at_ascending() {
        let store = memory_store().await;
        store.upsert_job("a", 100).await.unwrap();
        store.upsert_job("b", 100).await.unwrap();

        let next = store.next_job().await.unwrap().unwrap();
        assert_eq!(next.channel_id, "a");
    }

    #[tokio::test]
    async fn next_job_skips_idle_and_error() {
        let store = memory_store().await;
        let job = store.upsert_job("a", 100).await.unwrap();
        store
            .finalize_job(
                job.id,
                JobFinalize {
                    peer_title: "A",
                    peer_type: "channel",
                    last_message_id: 5,
                    oldest_message_id: Some(1),
                    message_count: 5,
                    target_message_count: 100,
                    status: "idle",
                },
            )
            .await
            .unwrap();

        assert!(store.next_job().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn search_messages_applies_regex_case_insensitively() {
        let store = memory_store().await;
        store
            .insert_messages("42", &[msg(1, "hello world"), msg(2, "ABC123"), msg(3, "xyz")])
            .await
            .unwrap();

        let hits = store.search_messages("42", r"\d+", 10, false).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].text.as_deref(), Some("ABC123"));
    }

    #[tokio::test]
    async fn search_messages_rejects_invalid_pattern() {
        let store = memory_store().await;
        let err = store.search_messages("42", "(", 10, false).await;
        assert!(matches!(err, Err(ArchiveError::InvalidPattern(_))));
    }

    #[tokio::test]
    async fn message_stats_reports_min_max() {
        let store = memory_store().await;
        store.insert_messages("42", &[msg(5, "a"), msg(1, "b"), msg(9, "c")]).await.unwrap();

        let stats = store.message_stats("42").await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.min_id, Some(1));
        assert_eq!(stats.max_id, Some(9));
    }
}
