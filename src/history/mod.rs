//! Append-only-with-correction message archive.
//!
//! Entries are keyed by `(room, message_id)`; a correction never creates a
//! new entry, it mutates the existing one and preserves every prior body in
//! the edit-history map. Messages can arrive twice (live and again in a
//! room-join backfill), so every write path here is replay-tolerant.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::store::{FieldMap, KeyFieldStore, OrderQuery};
use crate::util::now_ts;

const CHAT_NS: &str = "bot_chat_history";
const OOB_NS: &str = "bot_oob_history";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub jid: Option<String>,
    pub nick: String,
    pub stanza_id: Option<String>,
    pub body: String,
    pub timestamp: i64,
    pub edit_timestamp: Option<i64>,
    /// Historical timestamp → the body that was current until then.
    pub edit_history: BTreeMap<String, String>,
}

impl HistoryEntry {
    fn from_fields(fields: &FieldMap) -> Option<Self> {
        // `timestamp` is the first field checked: without it the entry is
        // considered unwritten (a crash mid-sequence may leave partial rows).
        let timestamp = fields.get("timestamp")?.parse().ok()?;
        Some(Self {
            jid: fields.get("jid").cloned(),
            nick: fields.get("nick").cloned().unwrap_or_default(),
            stanza_id: fields.get("stanza_id").cloned(),
            body: fields.get("body").cloned().unwrap_or_default(),
            timestamp,
            edit_timestamp: fields.get("edit_timestamp").and_then(|v| v.parse().ok()),
            edit_history: fields
                .get("edit_history")
                .and_then(|raw| serde_json::from_str(raw).ok())
                .unwrap_or_default(),
        })
    }
}

/// Query options for [`HistoryLedger::recent`].
#[derive(Debug, Clone, Default)]
pub struct RecentQuery<'a> {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    /// Newest-first when set (the default for most commands).
    pub descending: bool,
    pub nick: Option<&'a str>,
    pub jid: Option<&'a str>,
}

#[derive(Debug, Clone)]
pub struct OobRecord {
    pub jid: Option<String>,
    pub nick: String,
    pub url: String,
    pub filename: String,
    pub ext: String,
    pub timestamp: i64,
}

pub struct HistoryLedger {
    store: Arc<KeyFieldStore>,
}

impl HistoryLedger {
    pub fn new(store: Arc<KeyFieldStore>) -> Self {
        Self { store }
    }

    fn key(room: &str, message_id: &str) -> String {
        format!("{room}_{message_id}")
    }

    /// Record a newly observed groupchat message. Idempotent: the first
    /// write for a `(room, message_id)` wins, replays are no-ops.
    /// Returns whether a new entry was created.
    pub fn record_message(
        &self,
        room: &str,
        nick: &str,
        jid: Option<&str>,
        message_id: &str,
        stanza_id: Option<&str>,
        body: &str,
    ) -> anyhow::Result<bool> {
        let key = Self::key(room, message_id);
        if self.store.get(CHAT_NS, &key, "timestamp")?.is_some() {
            debug!(room = %room, id = %message_id, "message already archived, skipping");
            return Ok(false);
        }
        if let Some(jid) = jid {
            self.store.set(CHAT_NS, &key, "jid", jid)?;
        }
        self.store.set(CHAT_NS, &key, "nick", nick)?;
        if let Some(stanza_id) = stanza_id {
            self.store.set(CHAT_NS, &key, "stanza_id", stanza_id)?;
        }
        self.store.set(CHAT_NS, &key, "body", body)?;
        // timestamp last: its presence marks the entry complete.
        self.store
            .set(CHAT_NS, &key, "timestamp", &now_ts().to_string())?;
        Ok(true)
    }

    /// Apply a message correction to the entry at `replace_id`. The prior
    /// body is filed into the edit-history map under its effective
    /// timestamp (original timestamp for the first edit, the previous edit
    /// timestamp afterwards). Reentrant: replaying a correction whose body
    /// is already current changes nothing.
    pub fn record_correction(
        &self,
        room: &str,
        nick: &str,
        replace_id: &str,
        new_body: &str,
    ) -> anyhow::Result<()> {
        let key = Self::key(room, replace_id);
        let Some(entry) = self.entry(room, replace_id)? else {
            warn!(room = %room, id = %replace_id, "correction for unknown message, dropping");
            return Ok(());
        };

        if entry.body == new_body {
            debug!(room = %room, id = %replace_id, "correction already applied");
            return Ok(());
        }

        let history_key = entry.edit_timestamp.unwrap_or(entry.timestamp).to_string();
        let mut edit_history = entry.edit_history;
        edit_history.insert(history_key, entry.body);

        debug!(room = %room, nick = %nick, id = %replace_id, "correcting archived message");
        self.store.set(CHAT_NS, &key, "body", new_body)?;
        self.store
            .set(CHAT_NS, &key, "edit_timestamp", &now_ts().to_string())?;
        self.store.set(
            CHAT_NS,
            &key,
            "edit_history",
            &serde_json::to_string(&edit_history)?,
        )?;
        Ok(())
    }

    pub fn entry(&self, room: &str, message_id: &str) -> anyhow::Result<Option<HistoryEntry>> {
        let fields = self.store.get_all_fields(CHAT_NS, &Self::key(room, message_id))?;
        Ok(HistoryEntry::from_fields(&fields))
    }

    /// The room's messages ordered by timestamp, with optional identity or
    /// nick filter and offset. Identity takes precedence over nick when
    /// both are given.
    pub fn recent(&self, room: &str, query: &RecentQuery<'_>) -> anyhow::Result<Vec<HistoryEntry>> {
        let filter = match (query.jid, query.nick) {
            (Some(jid), _) => Some(("jid", jid)),
            (None, Some(nick)) => Some(("nick", nick)),
            (None, None) => None,
        };
        let rows = self.store.get_ordered_by(
            CHAT_NS,
            "timestamp",
            &OrderQuery {
                limit: query.limit,
                offset: query.offset,
                descending: query.descending,
                key_pattern: Some(&format!("{room}_%")),
                filter,
            },
        )?;
        Ok(rows
            .iter()
            .filter_map(HistoryEntry::from_fields)
            .collect())
    }

    /// Record an out-of-band attachment observation.
    pub fn record_oob(
        &self,
        room: &str,
        nick: &str,
        jid: Option<&str>,
        message_id: &str,
        url: &str,
    ) -> anyhow::Result<()> {
        let key = Self::key(room, message_id);
        let ext = url.rsplit('.').next().unwrap_or_default().to_lowercase();
        let filename = url
            .rsplit('/')
            .next()
            .and_then(|f| f.split('.').next())
            .unwrap_or_default();
        if let Some(jid) = jid {
            self.store.set(OOB_NS, &key, "jid", jid)?;
        }
        self.store.set(OOB_NS, &key, "nick", nick)?;
        self.store.set(OOB_NS, &key, "url", url)?;
        self.store.set(OOB_NS, &key, "filename", filename)?;
        self.store.set(OOB_NS, &key, "ext", &ext)?;
        self.store
            .set(OOB_NS, &key, "timestamp", &now_ts().to_string())?;
        Ok(())
    }

    pub fn recent_oob(
        &self,
        room: Option<&str>,
        query: &RecentQuery<'_>,
    ) -> anyhow::Result<Vec<OobRecord>> {
        let pattern = room.map(|r| format!("{r}_%"));
        let filter = match (query.jid, query.nick) {
            (Some(jid), _) => Some(("jid", jid)),
            (None, Some(nick)) => Some(("nick", nick)),
            (None, None) => None,
        };
        let rows = self.store.get_ordered_by(
            OOB_NS,
            "timestamp",
            &OrderQuery {
                limit: query.limit,
                offset: query.offset,
                descending: query.descending,
                key_pattern: pattern.as_deref(),
                filter,
            },
        )?;
        Ok(rows
            .into_iter()
            .filter_map(|fields| {
                Some(OobRecord {
                    jid: fields.get("jid").cloned(),
                    nick: fields.get("nick").cloned().unwrap_or_default(),
                    url: fields.get("url")?.clone(),
                    filename: fields.get("filename").cloned().unwrap_or_default(),
                    ext: fields.get("ext").cloned().unwrap_or_default(),
                    timestamp: fields.get("timestamp")?.parse().ok()?,
                })
            })
            .collect())
    }

    /// Admin purge of one room's archive.
    pub fn purge_room(&self, room: &str) -> anyhow::Result<()> {
        self.store.delete_by_pattern(CHAT_NS, &format!("{room}_%"))?;
        self.store.delete_by_pattern(OOB_NS, &format!("{room}_%"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger() -> HistoryLedger {
        HistoryLedger::new(Arc::new(KeyFieldStore::open_in_memory().unwrap()))
    }

    #[test]
    fn record_and_fetch_roundtrip() {
        let ledger = ledger();
        assert!(ledger
            .record_message("room", "alice", Some("alice@example.org"), "m1", Some("s1"), "hello")
            .unwrap());
        let entry = ledger.entry("room", "m1").unwrap().unwrap();
        assert_eq!(entry.body, "hello");
        assert_eq!(entry.nick, "alice");
        assert_eq!(entry.jid.as_deref(), Some("alice@example.org"));
        assert_eq!(entry.stanza_id.as_deref(), Some("s1"));
        assert!(entry.edit_history.is_empty());
    }

    #[test]
    fn replayed_message_does_not_overwrite() {
        let ledger = ledger();
        assert!(ledger
            .record_message("room", "alice", None, "m1", None, "hello")
            .unwrap());
        assert!(!ledger
            .record_message("room", "alice", None, "m1", None, "tampered")
            .unwrap());
        assert_eq!(ledger.entry("room", "m1").unwrap().unwrap().body, "hello");
    }

    #[test]
    fn correction_preserves_prior_body() {
        let ledger = ledger();
        ledger
            .record_message("room", "alice", None, "m1", Some("s1"), "hello")
            .unwrap();
        let original = ledger.entry("room", "m1").unwrap().unwrap();

        ledger
            .record_correction("room", "alice", "m1", "hello world")
            .unwrap();
        let entry = ledger.entry("room", "m1").unwrap().unwrap();
        assert_eq!(entry.body, "hello world");
        assert!(entry.edit_timestamp.is_some());
        assert_eq!(entry.edit_history.len(), 1);
        assert_eq!(
            entry.edit_history.get(&original.timestamp.to_string()),
            Some(&"hello".to_string())
        );
    }

    #[test]
    fn replayed_correction_is_a_noop() {
        let ledger = ledger();
        ledger
            .record_message("room", "alice", None, "m1", None, "hello")
            .unwrap();
        ledger
            .record_correction("room", "alice", "m1", "hello world")
            .unwrap();
        let first = ledger.entry("room", "m1").unwrap().unwrap();

        ledger
            .record_correction("room", "alice", "m1", "hello world")
            .unwrap();
        let second = ledger.entry("room", "m1").unwrap().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn chained_corrections_keep_every_body() {
        let ledger = ledger();
        ledger
            .record_message("room", "alice", None, "m1", None, "v1")
            .unwrap();
        ledger.record_correction("room", "alice", "m1", "v2").unwrap();
        ledger.record_correction("room", "alice", "m1", "v3").unwrap();

        let entry = ledger.entry("room", "m1").unwrap().unwrap();
        assert_eq!(entry.body, "v3");
        let bodies: Vec<&str> = entry.edit_history.values().map(String::as_str).collect();
        assert!(bodies.contains(&"v1"));
        assert!(bodies.contains(&"v2"));
    }

    #[test]
    fn correction_for_unknown_message_is_dropped() {
        let ledger = ledger();
        ledger
            .record_correction("room", "alice", "ghost", "boo")
            .unwrap();
        assert!(ledger.entry("room", "ghost").unwrap().is_none());
    }

    #[test]
    fn recent_filters_by_nick_and_respects_offset() {
        let ledger = ledger();
        for (id, nick, body) in [("m1", "alice", "one"), ("m2", "bob", "two"), ("m3", "alice", "three")] {
            ledger.record_message("room", nick, None, id, None, body).unwrap();
            // distinct timestamps for a deterministic order
            ledger
                .store
                .set("bot_chat_history", &format!("room_{id}"), "timestamp", &format!("{}", 100 + id.as_bytes()[1]))
                .unwrap();
        }
        let newest = ledger
            .recent(
                "room",
                &RecentQuery {
                    limit: Some(1),
                    descending: true,
                    ..RecentQuery::default()
                },
            )
            .unwrap();
        assert_eq!(newest[0].body, "three");

        let alice = ledger
            .recent(
                "room",
                &RecentQuery {
                    descending: true,
                    nick: Some("alice"),
                    ..RecentQuery::default()
                },
            )
            .unwrap();
        assert_eq!(alice.len(), 2);
        assert!(alice.iter().all(|e| e.nick == "alice"));

        let skipped = ledger
            .recent(
                "room",
                &RecentQuery {
                    limit: Some(2),
                    offset: Some(1),
                    descending: true,
                    ..RecentQuery::default()
                },
            )
            .unwrap();
        assert_eq!(skipped[0].body, "two");
        assert_eq!(skipped[1].body, "one");
    }

    #[test]
    fn oob_record_roundtrip() {
        let ledger = ledger();
        ledger
            .record_oob("room", "alice", None, "m9", "https://files.example.org/cat.png")
            .unwrap();
        let records = ledger
            .recent_oob(Some("room"), &RecentQuery::default())
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].ext, "png");
        assert_eq!(records[0].filename, "cat");
    }
}
