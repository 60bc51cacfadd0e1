//! Telegram Gateway: authentication, peer resolution, dialog and history iteration. Owns
//! the single MTProto connection and exposes `iter_dialogs`/`iter_history` as first-class
//! operations the Dialog Index and Sync Worker call directly.

use std::io::Write as _;
use std::sync::Arc;
use std::sync::LazyLock;

use grammers_client::{Client, SenderPool, SignInError};
use grammers_mtsender::ConnectionParams;
use grammers_session::types::{PeerAuth, PeerId, PeerRef};
use regex::Regex;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{AuthFailReason, GatewayError};
use crate::models::NormalizedMessage;
use crate::peer::{NormalizedPeer, PeerKind};
use crate::session::FileSession;

static FLOOD_WAIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"FLOOD_WAIT_(\d+)|wait of (\d+) seconds is required").expect("valid regex"));

/// A dialog as surfaced by [`TelegramGateway::iter_dialogs`], prior to Dialog Index insertion.
pub struct DialogInfo {
    pub id: i64,
    pub kind: PeerKind,
    pub title: String,
    pub username: Option<String>,
}

/// Controls for [`TelegramGateway::iter_history`].
#[derive(Debug, Clone, Default)]
pub struct HistoryOptions {
    pub limit: usize,
    pub offset_id: Option<i64>,
    pub min_id: Option<i64>,
    pub max_id: Option<i64>,
    pub reverse: bool,
}

/// Classify an underlying transport/API error by its message text.
fn classify_error(err: impl std::fmt::Display) -> GatewayError {
    let msg = err.to_string();
    if msg.contains("AUTH_KEY") || msg.contains("SESSION_PASSWORD_NEEDED") || msg.contains("401") {
        return GatewayError::Unauthorized;
    }
    if let Some(caps) = FLOOD_WAIT_RE.captures(&msg) {
        let secs = caps
            .get(1)
            .or_else(|| caps.get(2))
            .and_then(|m| m.as_str().parse::<u64>().ok())
            .unwrap_or(0);
        return GatewayError::FloodWait(secs);
    }
    GatewayError::Transport(msg)
}

/// Owns the single MTProto connection for the process, serializing all MTProto traffic
/// internally.
pub struct TelegramGateway {
    client: Client,
    session: Arc<FileSession>,
    api_hash: String,
    phone: String,
    _runner_handle: tokio::task::JoinHandle<()>,
    _updates_rx: mpsc::UnboundedReceiver<grammers_session::updates::UpdatesLike>,
}

impl TelegramGateway {
    /// Connect to Telegram using the session persisted at `config.session_path()`, creating a
    /// fresh one if absent. Does not perform login — call [`authenticate`](Self::authenticate).
    pub async fn connect(config: &Config) -> Result<Self, GatewayError> {
        let api_id = config
            .telegram_api_id
            .ok_or_else(|| GatewayError::Transport("TELEGRAM_API_ID not configured".to_string()))?;
        let api_hash = config
            .telegram_api_hash
            .clone()
            .ok_or_else(|| GatewayError::Transport("TELEGRAM_API_HASH not configured".to_string()))?;
        let phone = config
            .telegram_phone_number
            .clone()
            .ok_or_else(|| GatewayError::Transport("TELEGRAM_PHONE_NUMBER not configured".to_string()))?;

        let session = Arc::new(
            FileSession::load(config.session_path())
                .map_err(|e| GatewayError::Transport(format!("failed to load session: {e}")))?,
        );

        let sender_pool = SenderPool::with_configuration(
            session.clone(),
            api_id,
            ConnectionParams {
                app_version: env!("CARGO_PKG_VERSION").to_string(),
                device_model: "telegram-agent-bridge".to_string(),
                ..Default::default()
            },
        );

        let SenderPool {
            runner,
            handle: fat_handle,
            updates,
        } = sender_pool;

        let client = Client::new(fat_handle);
        let runner_handle = tokio::spawn(async move {
            runner.run().await;
        });

        Ok(Self {
            client,
            session,
            api_hash,
            phone,
            _runner_handle: runner_handle,
            _updates_rx: updates,
        })
    }

    /// Authenticates with Telegram. If a session already authorizes us, confirms it with a
    /// self-lookup probe; otherwise drives the interactive phone/code/2FA flow.
    pub async fn authenticate(&self) -> Result<(), GatewayError> {
        match self.client.is_authorized().await {
            Ok(true) => {
                self.client.get_me().await.map_err(classify_error)?;
                info!("existing session is valid");
                return Ok(());
            }
            Ok(false) => {}
            Err(e) => return Err(classify_error(e)),
        }

        info!(phone = %mask_phone(&self.phone), "requesting login code");
        let token = self
            .client
            .request_login_code(&self.phone, &self.api_hash)
            .await
            .map_err(|e| GatewayError::AuthFailed {
                reason: AuthFailReason::Transport,
                message: e.to_string(),
            })?;

        print!("Enter the login code sent to {}: ", mask_phone(&self.phone));
        std::io::stdout()
            .flush()
            .map_err(|e| GatewayError::AuthFailed {
                reason: AuthFailReason::Transport,
                message: e.to_string(),
            })?;
        let mut code = String::new();
        std::io::stdin().read_line(&mut code).map_err(|e| GatewayError::AuthFailed {
            reason: AuthFailReason::Transport,
            message: e.to_string(),
        })?;
        let code = code.trim();

        match self.client.sign_in(&token, code).await {
            Ok(_) => {}
            Err(SignInError::PasswordRequired(password_token)) => {
                let hint = password_token.hint().unwrap_or("none");
                let password = rpassword::prompt_password_stdout(&format!(
                    "Two-factor authentication required (hint: {hint}). Enter password: "
                ))
                .map_err(|e| GatewayError::AuthFailed {
                    reason: AuthFailReason::Transport,
                    message: e.to_string(),
                })?;

                self.client
                    .check_password(password_token, password.as_bytes())
                    .await
                    .map_err(|e| GatewayError::AuthFailed {
                        reason: AuthFailReason::BadCredentials,
                        message: e.to_string(),
                    })?;
            }
            Err(SignInError::InvalidCode) => {
                return Err(GatewayError::AuthFailed {
                    reason: AuthFailReason::BadCredentials,
                    message: "invalid verification code".to_string(),
                });
            }
            Err(other) => {
                return Err(GatewayError::AuthFailed {
                    reason: AuthFailReason::Transport,
                    message: other.to_string(),
                });
            }
        }

        info!("authenticated successfully");
        Ok(())
    }

    /// Reports whether the current session is authorized.
    pub async fn is_authorized(&self) -> Result<bool, GatewayError> {
        match self.client.is_authorized().await {
            Ok(authorized) => Ok(authorized),
            Err(e) => {
                let classified = classify_error(e);
                match classified {
                    GatewayError::Unauthorized => Ok(false),
                    other => Err(other),
                }
            }
        }
    }

    /// Lists all dialogs; consumed to completion by the Dialog Index at startup.
    pub async fn iter_dialogs(&self) -> Result<Vec<DialogInfo>, GatewayError> {
        let mut out = Vec::new();
        let mut dialogs = self.client.iter_dialogs();
        while let Some(dialog) = dialogs.next().await.map_err(classify_error)? {
            let chat = dialog.chat();
            let (id, kind, title, username) = match chat {
                grammers_client::types::Chat::User(user) => {
                    (user.id().bare_id(), PeerKind::User, user.full_name(), user.username().map(str::to_string))
                }
                grammers_client::types::Chat::Group(group) => {
                    (group.id().bare_id(), PeerKind::Chat, group.title().to_string(), None)
                }
                grammers_client::types::Chat::Channel(channel) => (
                    channel.id().bare_id(),
                    PeerKind::Channel,
                    channel.title().to_string(),
                    channel.username().map(str::to_string),
                ),
            };
            out.push(DialogInfo { id, kind, title, username });
        }
        Ok(out)
    }

    /// Resolves a normalized peer reference into a peer handle the client can act on.
    pub async fn resolve_peer(&self, normalized: &NormalizedPeer) -> Result<PeerRef, GatewayError> {
        match normalized {
            NormalizedPeer::Username(username) => self
                .client
                .resolve_username(username)
                .await
                .map_err(classify_error)?
                .ok_or_else(|| GatewayError::NotFound(username.clone())),
            NormalizedPeer::Id(id) => self.resolve_peer_by_id(*id).await,
        }
    }

    /// Numeric-id resolution falls back through the session's own peer cache (channel, then
    /// chat, then user) before assuming the common case — a channel whose access hash hasn't
    /// been warmed yet.
    async fn resolve_peer_by_id(&self, id: i64) -> Result<PeerRef, GatewayError> {
        if let Some(info) = self.session.peer(PeerId::channel(id)).await {
            return Ok(PeerRef {
                id: PeerId::channel(id),
                auth: info.auth().unwrap_or(PeerAuth::from_hash(0)),
            });
        }
        if let Some(info) = self.session.peer(PeerId::chat(id)).await {
            return Ok(PeerRef {
                id: PeerId::chat(id),
                auth: info.auth().unwrap_or(PeerAuth::from_hash(0)),
            });
        }
        if let Some(info) = self.session.peer(PeerId::user(id)).await {
            return Ok(PeerRef {
                id: PeerId::user(id),
                auth: info.auth().unwrap_or(PeerAuth::from_hash(0)),
            });
        }
        Ok(PeerRef {
            id: PeerId::channel(id),
            auth: PeerAuth::from_hash(0),
        })
    }

    /// Disconnects the MTProto connection and stops the sender runner task. Called once,
    /// last, during process shutdown.
    pub fn close(&self) {
        self.client.disconnect();
        self._runner_handle.abort();
    }

    /// Fetches a peer's message history under the given options.
    pub async fn iter_history(&self, peer: &PeerRef, opts: HistoryOptions) -> Result<Vec<NormalizedMessage>, GatewayError> {
        let mut iter = self.client.iter_messages(peer.clone()).limit(opts.limit as i32);
        if let Some(min_id) = opts.min_id {
            iter = iter.min_id(min_id as i32);
        }
        if let Some(offset_id) = opts.offset_id {
            iter = iter.offset_id(offset_id as i32);
        }
        if let Some(max_id) = opts.max_id {
            iter = iter.max_id(max_id as i32);
        }
        if opts.reverse {
            iter = iter.reverse();
        }

        let peer_type = match peer.id.kind() {
            grammers_session::types::PeerKind::User | grammers_session::types::PeerKind::UserSelf => "user",
            grammers_session::types::PeerKind::Chat => "chat",
            grammers_session::types::PeerKind::Channel => "channel",
        };
        let peer_id = peer.id.bare_id();

        let mut out = Vec::new();
        while let Some(msg) = iter.next().await.map_err(classify_error)? {
            out.push(normalize_message(&msg, peer_type, peer_id));
        }
        Ok(out)
    }
}

/// Message Normalizer: maps a library message object to a tagged record.
fn normalize_message(msg: &grammers_client::message::Message, peer_type: &str, peer_id: i64) -> NormalizedMessage {
    let id = msg.id() as i64;
    let date = Some(msg.date().timestamp());
    let text = msg.text().to_string();
    let from_id = msg
        .sender()
        .map(|s| s.pack().id.bare_id().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    let mut raw = serde_json::Map::new();
    raw.insert("id".to_string(), serde_json::json!(id));
    raw.insert("date".to_string(), serde_json::json!(date));
    raw.insert("text".to_string(), serde_json::json!(text));
    raw.insert("peer_id".to_string(), serde_json::json!(peer_id));
    raw.insert("peer_type".to_string(), serde_json::json!(peer_type));
    if let Some(reply_to) = msg.reply_to_message_id() {
        raw.insert("reply_to_message_id".to_string(), serde_json::json!(reply_to));
    }
    if msg.media().is_some() {
        raw.insert("has_media".to_string(), serde_json::json!(true));
    }

    NormalizedMessage {
        id,
        date,
        text,
        from_id: Some(from_id),
        peer_type: peer_type.to_string(),
        peer_id,
        raw: serde_json::Value::Object(raw),
    }
}

fn mask_phone(phone: &str) -> String {
    if phone.len() > 4 {
        format!("{}****{}", &phone[..phone.len() - 8.min(phone.len())], &phone[phone.len() - 4..])
    } else {
        "****".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_flood_wait() {
        let err = classify_error("FLOOD_WAIT_42");
        assert!(matches!(err, GatewayError::FloodWait(42)));
    }

    #[test]
    fn classifies_flood_wait_phrase() {
        let err = classify_error("A wait of 7 seconds is required");
        assert!(matches!(err, GatewayError::FloodWait(7)));
    }

    #[test]
    fn classifies_unauthorized() {
        let err = classify_error("AUTH_KEY_UNREGISTERED");
        assert!(matches!(err, GatewayError::Unauthorized));
    }

    #[test]
    fn classifies_transport_fallback() {
        let err = classify_error("some other network error");
        assert!(matches!(err, GatewayError::Transport(_)));
    }

    #[test]
    fn masks_short_phone() {
        assert_eq!(mask_phone("123"), "****");
    }
}
