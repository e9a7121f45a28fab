pub mod mock;

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::sync::mpsc;

/// Protocol-defined room role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    #[default]
    None,
    Visitor,
    Participant,
    Moderator,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::None => "none",
            Role::Visitor => "visitor",
            Role::Participant => "participant",
            Role::Moderator => "moderator",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "visitor" => Role::Visitor,
            "participant" => Role::Participant,
            "moderator" => Role::Moderator,
            _ => Role::None,
        }
    }
}

/// Protocol-defined room affiliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Affiliation {
    #[default]
    None,
    Member,
    Admin,
    Owner,
}

impl Affiliation {
    pub fn as_str(self) -> &'static str {
        match self {
            Affiliation::None => "none",
            Affiliation::Member => "member",
            Affiliation::Admin => "admin",
            Affiliation::Owner => "owner",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "member" => Affiliation::Member,
            "admin" => Affiliation::Admin,
            "owner" => Affiliation::Owner,
            _ => Affiliation::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    GroupChat,
    Chat,
}

/// Protocol reply reference, with the byte span of the quoted fallback text
/// inside the body when the sending client included one.
#[derive(Debug, Clone)]
pub struct ReplyRef {
    pub id: String,
    pub fallback: Option<(usize, usize)>,
}

/// One inbound message as handed over by the transport.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Bare origin: room address for groupchat, account identity for chat.
    pub from: String,
    /// Room nickname (resource part); empty for direct account messages.
    pub nick: String,
    pub kind: MessageKind,
    pub id: String,
    pub stanza_id: Option<String>,
    pub body: String,
    /// Correction target: the id of the message this one replaces.
    pub replace_id: Option<String>,
    pub reply: Option<ReplyRef>,
    /// Out-of-band attachment URL.
    pub oob_url: Option<String>,
    pub encrypted: bool,
}

impl InboundMessage {
    /// Bare groupchat message, the common case in tests and plugins.
    pub fn groupchat(room: &str, nick: &str, id: &str, body: &str) -> Self {
        Self {
            from: room.to_string(),
            nick: nick.to_string(),
            kind: MessageKind::GroupChat,
            id: id.to_string(),
            stanza_id: None,
            body: body.to_string(),
            replace_id: None,
            reply: None,
            oob_url: None,
            encrypted: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PresenceUpdate {
    pub room: String,
    pub nick: String,
    /// Set when the user is switching nicknames.
    pub new_nick: Option<String>,
    /// Bare identity, when the room exposes it.
    pub jid: Option<String>,
    pub role: Role,
    pub affiliation: Affiliation,
    pub status: String,
}

#[derive(Debug, Clone)]
pub struct ReactionEvent {
    pub from: String,
    pub nick: String,
    pub kind: MessageKind,
    pub target_id: String,
    pub reactions: BTreeSet<String>,
}

/// Events emitted by the transport, consumed by the orchestration shell.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    SessionStart,
    GroupchatMessage(InboundMessage),
    PrivateMessage(InboundMessage),
    Presence(PresenceUpdate),
    Reaction(ReactionEvent),
    Disconnected { reason: String },
}

/// The federated-messaging protocol, treated as a black box.
///
/// Implementations own the wire protocol entirely; the bot core only sees
/// these operations and the [`TransportEvent`] stream.
#[async_trait]
pub trait Transport: Send + Sync {
    /// The bot's own bare identity on the network.
    fn own_identity(&self) -> &str;

    /// Establish the session and start feeding events into `tx`.
    /// Returns once the connection is up; events flow until disconnect.
    async fn connect(&self, tx: mpsc::Sender<TransportEvent>) -> anyhow::Result<()>;

    async fn send_presence(&self) -> anyhow::Result<()>;

    /// Join a room and return the recent-history backfill.
    async fn join_room(
        &self,
        room: &str,
        nick: &str,
        history_limit: usize,
        timeout: Duration,
    ) -> anyhow::Result<Vec<InboundMessage>>;

    async fn send_message(
        &self,
        to: &str,
        body: &str,
        kind: MessageKind,
        reply_to: Option<&str>,
    ) -> anyhow::Result<()>;

    async fn send_reaction(
        &self,
        to: &str,
        kind: MessageKind,
        target_id: &str,
        reactions: &BTreeSet<String>,
    ) -> anyhow::Result<()>;

    async fn moderate_message(&self, room: &str, id: &str, reason: &str) -> anyhow::Result<()>;

    /// Nicknames currently present in a room.
    async fn roster(&self, room: &str) -> anyhow::Result<Vec<String>>;

    /// Best-effort nick → bare identity lookup; `None` when the room hides
    /// identities or the nick is gone.
    async fn resolve_identity(&self, room: &str, nick: &str) -> anyhow::Result<Option<String>>;

    async fn set_role(&self, room: &str, nick: &str, role: Role) -> anyhow::Result<()>;

    async fn set_affiliation(
        &self,
        room: &str,
        jid: &str,
        affiliation: Affiliation,
    ) -> anyhow::Result<()>;

    async fn upload_file(&self, name: &str, bytes: Vec<u8>) -> anyhow::Result<String>;

    async fn disconnect(&self) -> anyhow::Result<()>;
}
