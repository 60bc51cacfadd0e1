use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;

use crate::peer::PeerKind;

/// Dialog Index entry. Keyed externally by stringified `id`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DialogEntry {
    pub id: i64,
    pub kind: PeerKind,
    pub title: String,
    pub username: Option<String>,
}

/// Job record, one row per archived channel.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Job {
    pub id: i64,
    pub channel_id: String,
    pub peer_title: String,
    pub peer_type: String,
    pub status: String,
    pub last_message_id: i64,
    pub oldest_message_id: Option<i64>,
    pub target_message_count: i64,
    pub message_count: i64,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub error: Option<String>,
}

/// Fields the Sync Worker writes back after `process_job` finishes a pass.
pub struct JobFinalize<'a> {
    pub peer_title: &'a str,
    pub peer_type: &'a str,
    pub last_message_id: i64,
    pub oldest_message_id: Option<i64>,
    pub message_count: i64,
    pub target_message_count: i64,
    pub status: &'static str,
}

/// A message as normalized by the Message Normalizer, prior to persistence.
#[derive(Debug, Clone)]
pub struct NormalizedMessage {
    pub id: i64,
    pub date: Option<i64>,
    pub text: String,
    pub from_id: Option<String>,
    pub peer_type: String,
    pub peer_id: i64,
    pub raw: serde_json::Value,
}

/// Message record as read back from the Archive Store.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct MessageRow {
    pub channel_id: String,
    pub message_id: i64,
    pub date: Option<i64>,
    pub from_id: Option<String>,
    pub text: Option<String>,
    pub raw_json: String,
    pub created_at: DateTime<Utc>,
}

/// Aggregate stats for a channel's archived messages.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MessageStats {
    pub total: i64,
    pub min_id: Option<i64>,
    pub max_id: Option<i64>,
    pub min_date: Option<i64>,
    pub max_date: Option<i64>,
}
