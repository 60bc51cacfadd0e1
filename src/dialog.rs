//! Dialog Index: an in-memory mapping from normalized peer id to `{title, kind,
//! username}`, populated once at startup and refreshed on demand. Not persisted across
//! restarts.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;

use crate::error::GatewayError;
use crate::gateway::TelegramGateway;
use crate::models::DialogEntry;
use crate::peer::PeerKind;

/// Multi-reader, coordinator-serialized-writer index: written at startup and on-demand
/// refresh, read concurrently by every tool call.
pub struct DialogIndex {
    // Insertion order matters for `list()`, so entries live in a Vec;
    // the HashMap only accelerates `get()`.
    entries: RwLock<Vec<DialogEntry>>,
}

impl DialogIndex {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }

    /// Populate the index from a live dialog iteration. Called once at startup, after
    /// `gateway.authenticate()`, and again by [`get`](Self::get) on a single-shot miss.
    pub async fn refresh(&self, gateway: &TelegramGateway) -> Result<(), GatewayError> {
        let dialogs = gateway.iter_dialogs().await?;
        let mut entries = self.entries.write().await;
        *entries = dialogs
            .into_iter()
            .map(|d| DialogEntry {
                id: d.id,
                kind: d.kind,
                title: d.title,
                username: d.username,
            })
            .collect();
        info!(count = entries.len(), "dialog index refreshed");
        Ok(())
    }

    /// Lists known dialogs in insertion order, bounded by `limit`.
    pub async fn list(&self, limit: usize) -> Vec<DialogEntry> {
        let entries = self.entries.read().await;
        entries.iter().take(limit).cloned().collect()
    }

    /// Case-insensitive substring match on title and username.
    pub async fn search(&self, keyword: &str, limit: usize) -> Vec<DialogEntry> {
        let needle = keyword.to_lowercase();
        let entries = self.entries.read().await;
        let mut out = Vec::with_capacity(limit.min(entries.len()));
        for entry in entries.iter() {
            if out.len() >= limit {
                break;
            }
            let title_hit = entry.title.to_lowercase().contains(&needle);
            let username_hit = entry
                .username
                .as_deref()
                .is_some_and(|u| u.to_lowercase().contains(&needle));
            if title_hit || username_hit {
                out.push(entry.clone());
            }
        }
        out
    }

    /// O(1) lookup; on miss, callers should trigger a single refresh and retry via
    /// [`get_or_refresh`](Self::get_or_refresh).
    pub async fn get(&self, id: i64) -> Option<DialogEntry> {
        let entries = self.entries.read().await;
        entries.iter().find(|e| e.id == id).cloned()
    }

    /// `get(id)` with a single refresh-and-retry on miss.
    pub async fn get_or_refresh(&self, id: i64, gateway: &TelegramGateway) -> Result<DialogEntry, GatewayError> {
        if let Some(entry) = self.get(id).await {
            return Ok(entry);
        }
        self.refresh(gateway).await?;
        self.get(id)
            .await
            .ok_or_else(|| GatewayError::NotFound(id.to_string()))
    }

    /// Exact-match username lookup, case-insensitive (usernames are already lowercased
    /// by the Peer Codec before reaching here).
    pub async fn get_by_username(&self, username: &str) -> Option<DialogEntry> {
        let entries = self.entries.read().await;
        entries
            .iter()
            .find(|e| e.username.as_deref().is_some_and(|u| u.eq_ignore_ascii_case(username)))
            .cloned()
    }

    /// `get_by_username` with the same single-shot refresh-on-miss behavior as
    /// [`get_or_refresh`](Self::get_or_refresh).
    pub async fn get_or_refresh_by_username(&self, username: &str, gateway: &TelegramGateway) -> Result<DialogEntry, GatewayError> {
        if let Some(entry) = self.get_by_username(username).await {
            return Ok(entry);
        }
        self.refresh(gateway).await?;
        self.get_by_username(username)
            .await
            .ok_or_else(|| GatewayError::NotFound(username.to_string()))
    }
}

impl Default for DialogIndex {
    fn default() -> Self {
        Self::new()
    }
}

/// Convenience used where callers only need `Arc<DialogIndex>` (Transport Host, Tool Dispatcher).
pub type SharedDialogIndex = Arc<DialogIndex>;

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: i64, title: &str, username: Option<&str>) -> DialogEntry {
        DialogEntry {
            id,
            kind: PeerKind::Channel,
            title: title.to_string(),
            username: username.map(str::to_string),
        }
    }

    async fn seeded_index() -> DialogIndex {
        let index = DialogIndex::new();
        {
            let mut entries = index.entries.write().await;
            *entries = vec![
                entry(-1001, "Alpha", None),
                entry(-1002, "Beta", None),
                entry(42, "Gamma", Some("gamma")),
            ];
        }
        index
    }

    #[tokio::test]
    async fn list_preserves_insertion_order() {
        let index = seeded_index().await;
        let result = index.list(10).await;
        assert_eq!(result.iter().map(|e| e.id).collect::<Vec<_>>(), vec![-1001, -1002, 42]);
    }

    #[tokio::test]
    async fn list_respects_limit() {
        let index = seeded_index().await;
        assert_eq!(index.list(2).await.len(), 2);
    }

    #[tokio::test]
    async fn search_matches_title_case_insensitively() {
        let index = seeded_index().await;
        let result = index.search("beta", 10).await;
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].id, -1002);
    }

    #[tokio::test]
    async fn search_matches_username_case_insensitively() {
        let index = seeded_index().await;
        let result = index.search("GAMMA", 10).await;
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].id, 42);
    }

    #[tokio::test]
    async fn get_hits_existing_entry() {
        let index = seeded_index().await;
        assert_eq!(index.get(42).await.unwrap().title, "Gamma");
    }

    #[tokio::test]
    async fn get_misses_unknown_entry() {
        let index = seeded_index().await;
        assert!(index.get(999).await.is_none());
    }
}
