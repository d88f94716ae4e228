use serde::{Deserialize, Serialize};

/// Numeric Telegram peer id, covering users, groups and channels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId(pub i64);

/// Telegram message id (numeric, per peer).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(pub i32);

/// What kind of peer a [`PeerRef`] points at. The adapter needs this to
/// rebuild a provider-side peer from stored ids.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerKind {
    User,
    Group,
    Channel,
}

/// A resolved peer: enough to address it again without another lookup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerRef {
    pub id: PeerId,
    pub access_hash: i64,
    pub kind: PeerKind,
    pub name: String,
}

/// A stable reference to a sent message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MessageRef {
    pub peer_id: PeerId,
    pub message_id: MessageId,
}

/// One incoming message as seen by the monitor.
#[derive(Clone, Debug)]
pub struct IncomingMessage {
    pub peer_id: PeerId,
    pub msg_id: MessageId,
    pub sender_id: PeerId,
    pub text: String,
    pub access_hash: i64,
}

/// Opaque correlation id for a pending login-code challenge.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChallengeId(pub String);

/// Opaque exported session material. The core never inspects it; the adapter
/// produces it at login and re-imports it on restore.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionHandle(pub String);

/// How input rows turn into outbound messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SendMode {
    /// Every cell is its own message, row by row.
    Columns,
    /// Each row's cells are joined with a space into one message.
    Rows,
}

impl SendMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SendMode::Columns => "columns",
            SendMode::Rows => "rows",
        }
    }
}
