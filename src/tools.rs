//! Tool Dispatcher: implements the five tools against the Dialog Index, Telegram
//! Gateway, Archive Store, and Sync Worker.

use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::archive::ArchiveStore;
use crate::dialog::SharedDialogIndex;
use crate::error::ToolError;
use crate::gateway::{HistoryOptions, TelegramGateway};
use crate::models::{DialogEntry, Job};
use crate::peer::normalize;
use crate::worker::SyncWorker;

const DEFAULT_LIST_LIMIT: usize = 50;
const DEFAULT_SEARCH_LIMIT: usize = 100;
const DEFAULT_MESSAGES_LIMIT: usize = 100;
const MAX_SYNC_DEPTH: i64 = 50_000;

pub struct ToolDispatcher {
    gateway: Arc<TelegramGateway>,
    dialog_index: SharedDialogIndex,
    archive: ArchiveStore,
    worker: Arc<SyncWorker>,
    /// `DEFAULT_SYNC_TARGET` — the `target_message_count` used when
    /// `scheduleMessageSync` is called without an explicit `depth`.
    default_sync_depth: i64,
}

#[derive(Debug, Serialize)]
pub struct ChannelSummary {
    pub id: i64,
    pub kind: crate::peer::PeerKind,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

impl From<DialogEntry> for ChannelSummary {
    fn from(e: DialogEntry) -> Self {
        Self {
            id: e.id,
            kind: e.kind,
            title: e.title,
            username: e.username,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct MessageSummary {
    pub id: i64,
    pub date: Option<i64>,
    pub text: String,
    #[serde(rename = "fromId")]
    pub from_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct GetChannelMessagesResult {
    #[serde(rename = "peerTitle")]
    pub peer_title: String,
    #[serde(rename = "totalFetched")]
    pub total_fetched: usize,
    pub returned: usize,
    pub messages: Vec<MessageSummary>,
}

#[derive(Debug, Deserialize, Default)]
pub struct ListChannelsParams {
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct SearchChannelsParams {
    pub keywords: String,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct GetChannelMessagesParams {
    #[serde(rename = "channelId")]
    pub channel_id: Value,
    pub limit: Option<i64>,
    #[serde(rename = "filterPattern")]
    pub filter_pattern: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ScheduleMessageSyncParams {
    #[serde(rename = "channelId")]
    pub channel_id: Value,
    pub depth: Option<i64>,
}

impl ToolDispatcher {
    pub fn new(
        gateway: Arc<TelegramGateway>,
        dialog_index: SharedDialogIndex,
        archive: ArchiveStore,
        worker: Arc<SyncWorker>,
        default_sync_depth: i64,
    ) -> Self {
        Self {
            gateway,
            dialog_index,
            archive,
            worker,
            default_sync_depth,
        }
    }

    /// Every tool call checks this before doing any work.
    async fn ensure_authorized(&self) -> Result<(), ToolError> {
        if self.gateway.is_authorized().await? {
            Ok(())
        } else {
            Err(ToolError::Unauthorized)
        }
    }

    pub async fn list_channels(&self, params: ListChannelsParams) -> Result<Vec<ChannelSummary>, ToolError> {
        self.ensure_authorized().await?;
        let limit = positive_limit(params.limit, DEFAULT_LIST_LIMIT)?;
        let entries = self.dialog_index.list(limit).await;
        Ok(entries.into_iter().map(ChannelSummary::from).collect())
    }

    pub async fn search_channels(&self, params: SearchChannelsParams) -> Result<Vec<ChannelSummary>, ToolError> {
        self.ensure_authorized().await?;
        if params.keywords.trim().is_empty() {
            return Err(ToolError::InvalidArgument("keywords must not be empty".to_string()));
        }
        let limit = positive_limit(params.limit, DEFAULT_SEARCH_LIMIT)?;
        let entries = self.dialog_index.search(&params.keywords, limit).await;
        Ok(entries.into_iter().map(ChannelSummary::from).collect())
    }

    pub async fn get_channel_messages(&self, params: GetChannelMessagesParams) -> Result<GetChannelMessagesResult, ToolError> {
        self.ensure_authorized().await?;
        let limit = positive_limit(params.limit, DEFAULT_MESSAGES_LIMIT)?;

        let regex = match &params.filter_pattern {
            Some(pattern) => Some(
                Regex::new(pattern)
                    .map_err(|e| ToolError::InvalidArgument(format!("invalid filterPattern: {e}")))?,
            ),
            None => None,
        };

        let normalized = normalize(&params.channel_id)?;
        // Resolve against the original (possibly username) form rather than converting to
        // an id first, so a username is still resolvable even if its numeric id isn't yet
        // in the client's peer cache.
        let entry = match &normalized {
            crate::peer::NormalizedPeer::Id(id) => self.dialog_index.get_or_refresh(*id, &self.gateway).await?,
            crate::peer::NormalizedPeer::Username(u) => self.dialog_index.get_or_refresh_by_username(u, &self.gateway).await?,
        };
        let peer_handle = self.gateway.resolve_peer(&normalized).await?;

        let messages = self
            .gateway
            .iter_history(
                &peer_handle,
                HistoryOptions {
                    limit,
                    ..Default::default()
                },
            )
            .await?;

        let total_fetched = messages.len();
        let filtered: Vec<_> = match &regex {
            Some(re) => messages.into_iter().filter(|m| re.is_match(&m.text)).collect(),
            None => messages,
        };

        info!(peer_id = entry.id, total_fetched, returned = filtered.len(), "getChannelMessages");

        Ok(GetChannelMessagesResult {
            peer_title: entry.title,
            total_fetched,
            returned: filtered.len(),
            messages: filtered
                .into_iter()
                .map(|m| MessageSummary {
                    id: m.id,
                    date: m.date,
                    text: m.text,
                    from_id: m.from_id,
                })
                .collect(),
        })
    }

    pub async fn schedule_message_sync(&self, params: ScheduleMessageSyncParams) -> Result<Job, ToolError> {
        self.ensure_authorized().await?;
        let depth = params.depth.unwrap_or(self.default_sync_depth);
        if !(1..=MAX_SYNC_DEPTH).contains(&depth) {
            return Err(ToolError::InvalidArgument(format!(
                "depth must be between 1 and {MAX_SYNC_DEPTH}, got {depth}"
            )));
        }

        let normalized = normalize(&params.channel_id)?;
        let peer_id = match normalized.as_id() {
            Some(id) => id,
            None => self
                .dialog_index
                .get_or_refresh_by_username(normalized.as_username().unwrap_or_default(), &self.gateway)
                .await?
                .id,
        };

        let job = self.archive.upsert_job(&peer_id.to_string(), depth).await?;
        self.worker.resume();
        Ok(job)
    }

    pub async fn list_message_sync_jobs(&self) -> Result<Vec<Job>, ToolError> {
        self.ensure_authorized().await?;
        Ok(self.archive.list_jobs().await?)
    }
}

fn positive_limit(raw: Option<i64>, default: usize) -> Result<usize, ToolError> {
    match raw {
        None => Ok(default),
        Some(n) if n > 0 => Ok(n as usize),
        Some(n) => Err(ToolError::InvalidArgument(format!("limit must be a positive integer, got {n}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positive_limit_defaults_when_absent() {
        assert_eq!(positive_limit(None, 50).unwrap(), 50);
    }

    #[test]
    fn positive_limit_rejects_zero() {
        assert!(positive_limit(Some(0), 50).is_err());
    }

    #[test]
    fn positive_limit_rejects_negative() {
        assert!(positive_limit(Some(-5), 50).is_err());
    }

    #[test]
    fn positive_limit_accepts_explicit_value() {
        assert_eq!(positive_limit(Some(7), 50).unwrap(), 7);
    }
}
