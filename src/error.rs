use thiserror::Error;

/// Errors raised by the Peer Codec.
#[derive(Debug, Error)]
pub enum PeerCodecError {
    #[error("invalid peer id: {0}")]
    InvalidPeerId(String),
}

/// Errors raised by the Session Store.
#[derive(Debug, Error)]
pub enum SessionStoreError {
    #[error("failed to read session file {path}: {source}")]
    Read { path: String, source: std::io::Error },
    #[error("failed to write session file {path}: {source}")]
    Write { path: String, source: std::io::Error },
    #[error("failed to parse session file {path}: {source}")]
    Parse { path: String, source: serde_json::Error },
}

/// Reason a login attempt failed, carried by [`GatewayError::AuthFailed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailReason {
    BadCredentials,
    Cancelled,
    Transport,
}

/// Errors raised by the Telegram Gateway, classified from the underlying transport/API
/// error text (flood-wait, auth failure, or a generic transport error).
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("authentication failed ({reason:?}): {message}")]
    AuthFailed { reason: AuthFailReason, message: String },
    #[error("not authorized")]
    Unauthorized,
    #[error("flood wait: {0}s")]
    FloodWait(u64),
    #[error("peer not found in dialog index: {0}")]
    NotFound(String),
    #[error("transport error: {0}")]
    Transport(String),
}

/// Errors raised by the Archive Store.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("invalid search pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
}

/// The taxonomy surfaced to tool callers. Each Tool Dispatcher operation
/// returns this; the Transport Host flattens it into a JSON-RPC tool error.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("{0}")]
    InvalidPeerId(String),
    #[error("{0}")]
    InvalidArgument(String),
    #[error("invalid pattern: {0}")]
    InvalidPattern(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("flood wait: retry after {0}s")]
    FloodWait(u64),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("database error: {0}")]
    Database(String),
}

impl From<PeerCodecError> for ToolError {
    fn from(e: PeerCodecError) -> Self {
        match e {
            PeerCodecError::InvalidPeerId(m) => ToolError::InvalidPeerId(m),
        }
    }
}

impl From<GatewayError> for ToolError {
    fn from(e: GatewayError) -> Self {
        match e {
            GatewayError::Unauthorized => ToolError::Unauthorized,
            GatewayError::FloodWait(s) => ToolError::FloodWait(s),
            GatewayError::NotFound(m) => ToolError::NotFound(m),
            GatewayError::Transport(m) => ToolError::Transport(m),
            GatewayError::AuthFailed { message, .. } => ToolError::Transport(message),
        }
    }
}

impl From<ArchiveError> for ToolError {
    fn from(e: ArchiveError) -> Self {
        match e {
            ArchiveError::Database(e) => ToolError::Database(e.to_string()),
            ArchiveError::InvalidPattern(e) => ToolError::InvalidPattern(e.to_string()),
        }
    }
}
