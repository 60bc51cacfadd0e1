//! Session Store: persists MTProto authentication material to a single file.
//!
//! Rather than grammers' bundled `libsql`-backed session (which statically links its own
//! sqlite3 and would collide with `sqlx`'s `libsqlite3-sys`), this stores one versioned JSON
//! document. The low-level primitives (`exists`/`read`/`write`) are exposed standalone so the
//! on-disk format can be inspected or migrated without going through the `grammers_session::Session`
//! trait; [`FileSession`] layers that trait on top of them, persisting on every mutation.

use std::net::{SocketAddrV4, SocketAddrV6};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use futures_core::future::BoxFuture;
use grammers_session::Session;
use grammers_session::types::{
    ChannelKind, ChannelState, DcOption, PeerAuth, PeerId, PeerInfo, PeerKind, UpdateState, UpdatesState,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::SessionStoreError;

const DEFAULT_DC: i32 = 2;

/// Same well-known DC addresses grammers ships with, duplicated here because `DcOption`
/// doesn't derive `Serialize`/`Deserialize` and we need a fallback before the first connect.
const KNOWN_DC_OPTIONS: [DcOption; 5] = [
    DcOption {
        id: 1,
        ipv4: SocketAddrV4::new(std::net::Ipv4Addr::new(149, 154, 175, 53), 443),
        ipv6: SocketAddrV6::new(
            std::net::Ipv6Addr::new(0x2001, 0xb28, 0xf23d, 0xf001, 0, 0, 0, 0xa),
            443,
            0,
            0,
        ),
        auth_key: None,
    },
    DcOption {
        id: 2,
        ipv4: SocketAddrV4::new(std::net::Ipv4Addr::new(149, 154, 167, 41), 443),
        ipv6: SocketAddrV6::new(
            std::net::Ipv6Addr::new(0x2001, 0x67c, 0x4e8, 0xf002, 0, 0, 0, 0xa),
            443,
            0,
            0,
        ),
        auth_key: None,
    },
    DcOption {
        id: 3,
        ipv4: SocketAddrV4::new(std::net::Ipv4Addr::new(149, 154, 175, 100), 443),
        ipv6: SocketAddrV6::new(
            std::net::Ipv6Addr::new(0x2001, 0xb28, 0xf23d, 0xf003, 0, 0, 0, 0xa),
            443,
            0,
            0,
        ),
        auth_key: None,
    },
    DcOption {
        id: 4,
        ipv4: SocketAddrV4::new(std::net::Ipv4Addr::new(149, 154, 167, 92), 443),
        ipv6: SocketAddrV6::new(
            std::net::Ipv6Addr::new(0x2001, 0x67c, 0x4e8, 0xf004, 0, 0, 0, 0xa),
            443,
            0,
            0,
        ),
        auth_key: None,
    },
    DcOption {
        id: 5,
        ipv4: SocketAddrV4::new(std::net::Ipv4Addr::new(91, 108, 56, 104), 443),
        ipv6: SocketAddrV6::new(
            std::net::Ipv6Addr::new(0x2001, 0xb28, 0xf23f, 0xf005, 0, 0, 0, 0xa),
            443,
            0,
            0,
        ),
        auth_key: None,
    },
];

#[repr(u8)]
enum PeerSubtype {
    UserSelf = 1,
    UserBot = 2,
    UserSelfBot = 3,
    Megagroup = 4,
    Broadcast = 8,
    Gigagroup = 12,
}

/// Low-level primitive: does the session file exist?
pub fn exists(path: &Path) -> bool {
    path.is_file()
}

/// Low-level primitive: read the raw session bytes.
pub fn read(path: &Path) -> Result<Vec<u8>, SessionStoreError> {
    std::fs::read(path).map_err(|source| SessionStoreError::Read {
        path: path.display().to_string(),
        source,
    })
}

/// Low-level primitive: write the raw session bytes, creating parent directories on demand.
pub fn write(path: &Path, bytes: &[u8]) -> Result<(), SessionStoreError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| SessionStoreError::Write {
            path: path.display().to_string(),
            source,
        })?;
    }
    std::fs::write(path, bytes).map_err(|source| SessionStoreError::Write {
        path: path.display().to_string(),
        source,
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DcOptionDoc {
    id: i32,
    ipv4: String,
    ipv6: String,
    auth_key: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PeerInfoDoc {
    peer_id: i64,
    hash: Option<i64>,
    subtype: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct UpdateStateDoc {
    pts: i32,
    qts: i32,
    date: i32,
    seq: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChannelStateDoc {
    peer_id: i64,
    pts: i32,
}

/// The versioned JSON document persisted at `./data/session.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionDoc {
    #[serde(default = "session_doc_version")]
    version: u32,
    #[serde(default = "default_home_dc")]
    home_dc: i32,
    #[serde(default)]
    dc_options: Vec<DcOptionDoc>,
    #[serde(default)]
    peers: Vec<PeerInfoDoc>,
    #[serde(default)]
    update_state: Option<UpdateStateDoc>,
    #[serde(default)]
    channel_states: Vec<ChannelStateDoc>,
}

fn session_doc_version() -> u32 {
    1
}
fn default_home_dc() -> i32 {
    DEFAULT_DC
}

impl Default for SessionDoc {
    fn default() -> Self {
        Self {
            version: session_doc_version(),
            home_dc: DEFAULT_DC,
            dc_options: Vec::new(),
            peers: Vec::new(),
            update_state: None,
            channel_states: Vec::new(),
        }
    }
}

/// A [`grammers_session::Session`] implementation backed by a single JSON file.
pub struct FileSession {
    path: PathBuf,
    state: Mutex<SessionDoc>,
}

impl FileSession {
    /// Load the session document from `path`, or start a fresh one if the file is absent.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, SessionStoreError> {
        let path = path.into();
        let doc = if exists(&path) {
            let bytes = read(&path)?;
            serde_json::from_slice(&bytes).map_err(|source| SessionStoreError::Parse {
                path: path.display().to_string(),
                source,
            })?
        } else {
            SessionDoc::default()
        };
        Ok(Self {
            path,
            state: Mutex::new(doc),
        })
    }

    fn persist(&self) {
        let doc = self.state.lock().unwrap().clone();
        match serde_json::to_vec_pretty(&doc) {
            Ok(bytes) => {
                if let Err(e) = write(&self.path, &bytes) {
                    warn!(error = %e, "failed to persist session file");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize session document"),
        }
    }
}

fn doc_to_dc_option(doc: &DcOptionDoc) -> Option<DcOption> {
    let ipv4 = doc.ipv4.parse().ok()?;
    let ipv6 = doc.ipv6.parse().ok()?;
    let auth_key = doc.auth_key.clone().and_then(|bytes| bytes.try_into().ok());
    Some(DcOption {
        id: doc.id,
        ipv4,
        ipv6,
        auth_key,
    })
}

fn dc_option_to_doc(dc: &DcOption) -> DcOptionDoc {
    DcOptionDoc {
        id: dc.id,
        ipv4: dc.ipv4.to_string(),
        ipv6: dc.ipv6.to_string(),
        auth_key: dc.auth_key.map(|k| k.to_vec()),
    }
}

fn peer_info_to_doc(peer: &PeerInfo) -> PeerInfoDoc {
    let subtype: Option<i64> = match peer {
        PeerInfo::User { bot, is_self, .. } => match (bot.unwrap_or_default(), is_self.unwrap_or_default()) {
            (true, true) => Some(PeerSubtype::UserSelfBot as i64),
            (true, false) => Some(PeerSubtype::UserBot as i64),
            (false, true) => Some(PeerSubtype::UserSelf as i64),
            (false, false) => None,
        },
        PeerInfo::Chat { .. } => None,
        PeerInfo::Channel { kind, .. } => kind.map(|kind| match kind {
            ChannelKind::Megagroup => PeerSubtype::Megagroup as i64,
            ChannelKind::Broadcast => PeerSubtype::Broadcast as i64,
            ChannelKind::Gigagroup => PeerSubtype::Gigagroup as i64,
        }),
    };

    PeerInfoDoc {
        peer_id: peer.id().bot_api_dialog_id(),
        hash: peer.auth().map(|a| a.hash()),
        subtype,
    }
}

fn peer_doc_to_info(kind: PeerKind, doc: PeerInfoDoc) -> PeerInfo {
    let subtype = doc.subtype.map(|s| s as u8);
    match kind {
        PeerKind::User | PeerKind::UserSelf => PeerInfo::User {
            id: PeerId::user(doc.peer_id).bare_id(),
            auth: doc.hash.map(PeerAuth::from_hash),
            bot: subtype.map(|s| s & PeerSubtype::UserBot as u8 != 0),
            is_self: subtype.map(|s| s & PeerSubtype::UserSelf as u8 != 0),
        },
        PeerKind::Chat => PeerInfo::Chat {
            id: PeerId::chat(doc.peer_id).bare_id(),
        },
        PeerKind::Channel => PeerInfo::Channel {
            id: PeerId::channel(doc.peer_id).bare_id(),
            auth: doc.hash.map(PeerAuth::from_hash),
            kind: subtype.and_then(|s| {
                if s & PeerSubtype::Gigagroup as u8 == PeerSubtype::Gigagroup as u8 {
                    Some(ChannelKind::Gigagroup)
                } else if s & PeerSubtype::Broadcast as u8 != 0 {
                    Some(ChannelKind::Broadcast)
                } else if s & PeerSubtype::Megagroup as u8 != 0 {
                    Some(ChannelKind::Megagroup)
                } else {
                    None
                }
            }),
        },
    }
}

impl Session for FileSession {
    fn home_dc_id(&self) -> i32 {
        self.state.lock().unwrap().home_dc
    }

    fn set_home_dc_id(&self, dc_id: i32) -> BoxFuture<'_, ()> {
        self.state.lock().unwrap().home_dc = dc_id;
        self.persist();
        Box::pin(async {})
    }

    fn dc_option(&self, dc_id: i32) -> Option<DcOption> {
        let state = self.state.lock().unwrap();
        state
            .dc_options
            .iter()
            .find(|o| o.id == dc_id)
            .and_then(doc_to_dc_option)
            .or_else(|| KNOWN_DC_OPTIONS.iter().find(|o| o.id == dc_id).cloned())
    }

    fn set_dc_option(&self, dc_option: &DcOption) -> BoxFuture<'_, ()> {
        {
            let mut state = self.state.lock().unwrap();
            state.dc_options.retain(|o| o.id != dc_option.id);
            state.dc_options.push(dc_option_to_doc(dc_option));
        }
        self.persist();
        Box::pin(async {})
    }

    fn peer(&self, peer: PeerId) -> BoxFuture<'_, Option<PeerInfo>> {
        let found = {
            let state = self.state.lock().unwrap();
            if peer.kind() == PeerKind::UserSelf {
                state
                    .peers
                    .iter()
                    .find(|p| p.subtype.is_some_and(|s| s & PeerSubtype::UserSelf as i64 != 0))
                    .cloned()
            } else {
                state.peers.iter().find(|p| p.peer_id == peer.bot_api_dialog_id()).cloned()
            }
        };
        let result = found.map(|doc| peer_doc_to_info(peer.kind(), doc));
        Box::pin(async move { result })
    }

    fn cache_peer(&self, peer: &PeerInfo) -> BoxFuture<'_, ()> {
        let doc = peer_info_to_doc(peer);
        {
            let mut state = self.state.lock().unwrap();
            state.peers.retain(|p| p.peer_id != doc.peer_id);
            state.peers.push(doc);
        }
        self.persist();
        Box::pin(async {})
    }

    fn updates_state(&self) -> BoxFuture<'_, UpdatesState> {
        let (primary, channels) = {
            let state = self.state.lock().unwrap();
            (state.update_state.clone(), state.channel_states.clone())
        };
        Box::pin(async move {
            let mut result = match primary {
                Some(u) => UpdatesState {
                    pts: u.pts,
                    qts: u.qts,
                    date: u.date,
                    seq: u.seq,
                    channels: Vec::new(),
                },
                None => UpdatesState::default(),
            };
            result.channels = channels.into_iter().map(|c| ChannelState { id: c.peer_id, pts: c.pts }).collect();
            result
        })
    }

    fn set_update_state(&self, update: UpdateState) -> BoxFuture<'_, ()> {
        {
            let mut state = self.state.lock().unwrap();
            match update {
                UpdateState::All(updates_state) => {
                    state.update_state = Some(UpdateStateDoc {
                        pts: updates_state.pts,
                        qts: updates_state.qts,
                        date: updates_state.date,
                        seq: updates_state.seq,
                    });
                    state.channel_states = updates_state
                        .channels
                        .into_iter()
                        .map(|c| ChannelStateDoc {
                            peer_id: c.id,
                            pts: c.pts,
                        })
                        .collect();
                }
                UpdateState::Primary { pts, date, seq } => {
                    let entry = state.update_state.get_or_insert_with(UpdateStateDoc::default);
                    entry.pts = pts;
                    entry.date = date;
                    entry.seq = seq;
                }
                UpdateState::Secondary { qts } => {
                    let entry = state.update_state.get_or_insert_with(UpdateStateDoc::default);
                    entry.qts = qts;
                }
                UpdateState::Channel { id, pts } => {
                    if let Some(c) = state.channel_states.iter_mut().find(|c| c.peer_id == id) {
                        c.pts = pts;
                    } else {
                        state.channel_states.push(ChannelStateDoc { peer_id: id, pts });
                    }
                }
            }
        }
        self.persist();
        Box::pin(async {})
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        assert!(!exists(&path));
        let session = FileSession::load(&path).unwrap();
        assert_eq!(session.home_dc_id(), DEFAULT_DC);
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("session.json");
        write(&path, b"{}").unwrap();
        assert!(exists(&path));
        assert_eq!(read(&path).unwrap(), b"{}");
    }

    #[tokio::test]
    async fn set_home_dc_persists_across_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        let session = FileSession::load(&path).unwrap();
        session.set_home_dc_id(4).await;

        let reloaded = FileSession::load(&path).unwrap();
        assert_eq!(reloaded.home_dc_id(), 4);
    }

    #[tokio::test]
    async fn cached_peer_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        let session = FileSession::load(&path).unwrap();

        let info = PeerInfo::Channel {
            id: 12345,
            auth: Some(PeerAuth::from_hash(999)),
            kind: Some(ChannelKind::Broadcast),
        };
        session.cache_peer(&info).await;

        let fetched = session.peer(PeerId::channel(12345)).await;
        assert!(matches!(fetched, Some(PeerInfo::Channel { id: 12345, .. })));
    }
}
