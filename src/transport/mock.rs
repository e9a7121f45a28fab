//! Scriptable in-process transport for tests and offline dry runs.

use super::{
    Affiliation, InboundMessage, MessageKind, Role, Transport, TransportEvent,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub to: String,
    pub body: String,
    pub kind: MessageKind,
    pub reply_to: Option<String>,
}

#[derive(Default)]
pub struct MockTransport {
    identity: String,
    /// Events replayed into the bot on connect, in order.
    scripted: Mutex<Vec<TransportEvent>>,
    /// Keeps the event stream open after the script drains; dropped on
    /// disconnect.
    event_tx: Mutex<Option<mpsc::Sender<TransportEvent>>>,
    /// Per-room backfill returned from `join_room`.
    backfill: Mutex<HashMap<String, Vec<InboundMessage>>>,
    /// Per-room roster and nick → identity table.
    rosters: Mutex<HashMap<String, Vec<String>>>,
    identities: Mutex<HashMap<(String, String), String>>,
    pub sent: Mutex<Vec<SentMessage>>,
    pub reactions: Mutex<Vec<(String, String, BTreeSet<String>)>>,
    pub moderated: Mutex<Vec<(String, String, String)>>,
}

impl MockTransport {
    pub fn new(identity: &str) -> Self {
        Self {
            identity: identity.to_string(),
            ..Self::default()
        }
    }

    pub fn script(&self, event: TransportEvent) {
        self.scripted.lock().push(event);
    }

    pub fn set_backfill(&self, room: &str, messages: Vec<InboundMessage>) {
        self.backfill.lock().insert(room.to_string(), messages);
    }

    pub fn set_roster(&self, room: &str, nicks: &[&str]) {
        self.rosters
            .lock()
            .insert(room.to_string(), nicks.iter().map(|n| n.to_string()).collect());
    }

    pub fn set_identity(&self, room: &str, nick: &str, jid: &str) {
        self.identities
            .lock()
            .insert((room.to_string(), nick.to_string()), jid.to_string());
    }

    pub fn sent_bodies(&self) -> Vec<String> {
        self.sent.lock().iter().map(|m| m.body.clone()).collect()
    }

    /// Inject an event into a connected bot. Returns false when the session
    /// is not up.
    pub async fn emit(&self, event: TransportEvent) -> bool {
        let tx = self.event_tx.lock().clone();
        match tx {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn own_identity(&self) -> &str {
        &self.identity
    }

    async fn connect(&self, tx: mpsc::Sender<TransportEvent>) -> anyhow::Result<()> {
        *self.event_tx.lock() = Some(tx.clone());
        let events = std::mem::take(&mut *self.scripted.lock());
        tokio::spawn(async move {
            let _ = tx.send(TransportEvent::SessionStart).await;
            for event in events {
                let _ = tx.send(event).await;
            }
        });
        Ok(())
    }

    async fn send_presence(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn join_room(
        &self,
        room: &str,
        _nick: &str,
        history_limit: usize,
        _timeout: Duration,
    ) -> anyhow::Result<Vec<InboundMessage>> {
        let mut backfill = self.backfill.lock().remove(room).unwrap_or_default();
        backfill.truncate(history_limit);
        Ok(backfill)
    }

    async fn send_message(
        &self,
        to: &str,
        body: &str,
        kind: MessageKind,
        reply_to: Option<&str>,
    ) -> anyhow::Result<()> {
        self.sent.lock().push(SentMessage {
            to: to.to_string(),
            body: body.to_string(),
            kind,
            reply_to: reply_to.map(str::to_string),
        });
        Ok(())
    }

    async fn send_reaction(
        &self,
        to: &str,
        _kind: MessageKind,
        target_id: &str,
        reactions: &BTreeSet<String>,
    ) -> anyhow::Result<()> {
        self.reactions
            .lock()
            .push((to.to_string(), target_id.to_string(), reactions.clone()));
        Ok(())
    }

    async fn moderate_message(&self, room: &str, id: &str, reason: &str) -> anyhow::Result<()> {
        self.moderated
            .lock()
            .push((room.to_string(), id.to_string(), reason.to_string()));
        Ok(())
    }

    async fn roster(&self, room: &str) -> anyhow::Result<Vec<String>> {
        Ok(self.rosters.lock().get(room).cloned().unwrap_or_default())
    }

    async fn resolve_identity(&self, room: &str, nick: &str) -> anyhow::Result<Option<String>> {
        Ok(self
            .identities
            .lock()
            .get(&(room.to_string(), nick.to_string()))
            .cloned())
    }

    async fn set_role(&self, _room: &str, _nick: &str, _role: Role) -> anyhow::Result<()> {
        Ok(())
    }

    async fn set_affiliation(
        &self,
        _room: &str,
        _jid: &str,
        _affiliation: Affiliation,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn upload_file(&self, name: &str, _bytes: Vec<u8>) -> anyhow::Result<String> {
        Ok(format!("https://files.invalid/{name}"))
    }

    async fn disconnect(&self) -> anyhow::Result<()> {
        self.event_tx.lock().take();
        Ok(())
    }
}
