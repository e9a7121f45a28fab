//! Per-room per-user role/affiliation/status tracking.
//!
//! The reconciler keeps a full in-memory mirror of the persisted user
//! states, loaded once at startup, and emits transition events by comparing
//! each presence update against the cached prior values rather than
//! replaying raw events. Users are keyed by their visible identity when the
//! room exposes one, otherwise by nickname; the record is rekeyed (keeping
//! `first_seen`) when a nickname changes or an identity becomes visible.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::store::KeyFieldStore;
use crate::transport::{Affiliation, PresenceUpdate, Role};
use crate::util::now_ts;

const NS: &str = "bot_user_states";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserState {
    pub role: Role,
    pub affiliation: Affiliation,
    pub status: String,
    /// Epoch seconds of the first observation; write-once.
    pub first_seen: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceEventKind {
    RoomJoin,
    RoleChange,
    AffiliationChange,
    StatusChange,
}

impl PresenceEventKind {
    /// Stable tag used in logs and plugin dispatch.
    pub fn tag(self) -> &'static str {
        match self {
            PresenceEventKind::RoomJoin => "room_join",
            PresenceEventKind::RoleChange => "role_change",
            PresenceEventKind::AffiliationChange => "affiliation_change",
            PresenceEventKind::StatusChange => "status_change",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PresenceEvent {
    pub kind: PresenceEventKind,
    pub room: String,
    /// Stable user key: visible identity when known, else nickname.
    pub user: String,
    pub update: PresenceUpdate,
}

pub struct PresenceReconciler {
    store: Arc<KeyFieldStore>,
    states: Mutex<HashMap<String, HashMap<String, UserState>>>,
}

impl PresenceReconciler {
    /// Load the full state mirror from the store.
    pub fn load(store: Arc<KeyFieldStore>) -> anyhow::Result<Self> {
        let mut states: HashMap<String, HashMap<String, UserState>> = HashMap::new();
        for (key, fields) in store.get_all_keys(NS)? {
            let Some((room, user)) = key.split_once('_') else {
                warn!(key = %key, "malformed user state key, skipping");
                continue;
            };
            let state = UserState {
                role: Role::parse(fields.get("role").map_or("", String::as_str)),
                affiliation: Affiliation::parse(
                    fields.get("affiliation").map_or("", String::as_str),
                ),
                status: fields.get("status").cloned().unwrap_or_default(),
                first_seen: fields
                    .get("first_seen")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0),
            };
            states
                .entry(room.to_string())
                .or_default()
                .insert(user.to_string(), state);
        }
        debug!(rooms = states.len(), "user states loaded");
        Ok(Self {
            store,
            states: Mutex::new(states),
        })
    }

    pub fn first_seen(&self, room: &str, user: &str) -> Option<i64> {
        self.states
            .lock()
            .get(room)?
            .get(user)
            .map(|s| s.first_seen)
    }

    pub fn state(&self, room: &str, user: &str) -> Option<UserState> {
        self.states.lock().get(room)?.get(user).cloned()
    }

    /// Reconcile one presence update (not about the bot itself) against the
    /// mirror, returning zero or more transition events for plugin fan-out.
    pub fn observe(&self, update: &PresenceUpdate) -> anyhow::Result<Vec<PresenceEvent>> {
        let room = update.room.clone();
        let mut user = update
            .jid
            .clone()
            .unwrap_or_else(|| update.nick.clone());

        {
            let mut states = self.states.lock();
            let room_states = states.entry(room.clone()).or_default();

            // Identity became visible for a user previously tracked by nick:
            // migrate the record, keeping first_seen.
            if update.jid.is_some() && !room_states.contains_key(&user) {
                if let Some(state) = room_states.remove(&update.nick) {
                    info!(room = %room, nick = %update.nick, user = %user, "rekeying user state to visible identity");
                    self.rekey(&room, &update.nick, &user, &state)?;
                    room_states.insert(user.clone(), state);
                }
            }

            // Nickname change while the identity is hidden: the nick is the
            // only key we have, so migrate to the new one.
            if let Some(new_nick) = &update.new_nick {
                if update.jid.is_none() {
                    if let Some(state) = room_states.remove(&user) {
                        info!(room = %room, old = %user, new = %new_nick, "user changed nickname, rekeying state");
                        self.rekey(&room, &user, new_nick, &state)?;
                        room_states.insert(new_nick.clone(), state);
                    }
                    user = new_nick.clone();
                }
            }
        }

        let prior = self.state(&room, &user);
        match prior {
            None => {
                let state = UserState {
                    role: update.role,
                    affiliation: update.affiliation,
                    status: update.status.clone(),
                    first_seen: now_ts(),
                };
                info!(room = %room, user = %user, "new user observed");
                self.persist(&room, &user, &state, true)?;
                self.states
                    .lock()
                    .entry(room.clone())
                    .or_default()
                    .insert(user.clone(), state);
                Ok(vec![PresenceEvent {
                    kind: PresenceEventKind::RoomJoin,
                    room,
                    user,
                    update: update.clone(),
                }])
            }
            Some(prior) => {
                let mut events = Vec::new();
                let mut next = prior.clone();

                if update.role != prior.role {
                    debug!(room = %room, user = %user, old = prior.role.as_str(), new = update.role.as_str(), "role change");
                    next.role = update.role;
                    self.store.set(
                        NS,
                        &format!("{room}_{user}"),
                        "role",
                        update.role.as_str(),
                    )?;
                    events.push(PresenceEventKind::RoleChange);
                }
                if update.affiliation != prior.affiliation {
                    debug!(room = %room, user = %user, old = prior.affiliation.as_str(), new = update.affiliation.as_str(), "affiliation change");
                    next.affiliation = update.affiliation;
                    self.store.set(
                        NS,
                        &format!("{room}_{user}"),
                        "affiliation",
                        update.affiliation.as_str(),
                    )?;
                    events.push(PresenceEventKind::AffiliationChange);
                }
                if update.status != prior.status {
                    debug!(room = %room, user = %user, old = %prior.status, new = %update.status, "status change");
                    next.status = update.status.clone();
                    self.store
                        .set(NS, &format!("{room}_{user}"), "status", &update.status)?;
                    events.push(PresenceEventKind::StatusChange);
                }

                if !events.is_empty() {
                    self.states
                        .lock()
                        .entry(room.clone())
                        .or_default()
                        .insert(user.clone(), next);
                }

                Ok(events
                    .into_iter()
                    .map(|kind| PresenceEvent {
                        kind,
                        room: room.clone(),
                        user: user.clone(),
                        update: update.clone(),
                    })
                    .collect())
            }
        }
    }

    fn rekey(
        &self,
        room: &str,
        old_user: &str,
        new_user: &str,
        state: &UserState,
    ) -> anyhow::Result<()> {
        self.store.delete(NS, &format!("{room}_{old_user}"), None)?;
        self.persist(room, new_user, state, true)?;
        Ok(())
    }

    fn persist(
        &self,
        room: &str,
        user: &str,
        state: &UserState,
        with_first_seen: bool,
    ) -> anyhow::Result<()> {
        let key = format!("{room}_{user}");
        self.store.set(NS, &key, "role", state.role.as_str())?;
        self.store
            .set(NS, &key, "affiliation", state.affiliation.as_str())?;
        self.store.set(NS, &key, "status", &state.status)?;
        if with_first_seen {
            self.set_first_seen(&key, state.first_seen)?;
        }
        Ok(())
    }

    /// `first_seen` is write-once: an attempted overwrite is rejected with
    /// a warning and leaves the stored value unchanged.
    fn set_first_seen(&self, key: &str, first_seen: i64) -> anyhow::Result<()> {
        if self.store.get(NS, key, "first_seen")?.is_some() {
            warn!(key = %key, "blocked attempt to overwrite first_seen");
            return Ok(());
        }
        self.store
            .set(NS, key, "first_seen", &first_seen.to_string())?;
        Ok(())
    }

    /// Admin purge: drop all persisted and cached user states.
    pub fn purge(&self) -> anyhow::Result<()> {
        self.store.delete_all(NS)?;
        self.states.lock().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(room: &str, nick: &str, jid: Option<&str>) -> PresenceUpdate {
        PresenceUpdate {
            room: room.to_string(),
            nick: nick.to_string(),
            new_nick: None,
            jid: jid.map(str::to_string),
            role: Role::Participant,
            affiliation: Affiliation::None,
            status: "available".to_string(),
        }
    }

    fn reconciler() -> PresenceReconciler {
        PresenceReconciler::load(Arc::new(KeyFieldStore::open_in_memory().unwrap())).unwrap()
    }

    #[test]
    fn first_observation_is_a_room_join() {
        let r = reconciler();
        let events = r.observe(&update("room", "alice", None)).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, PresenceEventKind::RoomJoin);
        assert_eq!(events[0].user, "alice");
        assert!(r.first_seen("room", "alice").is_some());
    }

    #[test]
    fn independent_transitions_fire_separately() {
        let r = reconciler();
        r.observe(&update("room", "alice", None)).unwrap();

        let mut changed = update("room", "alice", None);
        changed.role = Role::Moderator;
        changed.status = "away".to_string();
        let events = r.observe(&changed).unwrap();
        let kinds: Vec<_> = events.iter().map(|e| e.kind).collect();
        assert_eq!(kinds.len(), 2);
        assert!(kinds.contains(&PresenceEventKind::RoleChange));
        assert!(kinds.contains(&PresenceEventKind::StatusChange));

        // replaying the same presence fires nothing
        assert!(r.observe(&changed).unwrap().is_empty());
    }

    #[test]
    fn first_seen_is_write_once() {
        let r = reconciler();
        r.observe(&update("room", "alice", None)).unwrap();
        let original = r.store.get(NS, "room_alice", "first_seen").unwrap().unwrap();

        r.set_first_seen("room_alice", 12345).unwrap();
        let after = r.store.get(NS, "room_alice", "first_seen").unwrap().unwrap();
        assert_eq!(original, after);
    }

    #[test]
    fn nick_change_rekeys_preserving_first_seen() {
        let r = reconciler();
        r.observe(&update("room", "alice", None)).unwrap();
        let first_seen = r.first_seen("room", "alice").unwrap();

        let mut renamed = update("room", "alice", None);
        renamed.new_nick = Some("alicia".to_string());
        r.observe(&renamed).unwrap();

        assert!(r.state("room", "alice").is_none());
        assert_eq!(r.first_seen("room", "alicia"), Some(first_seen));
        assert!(r.store.get(NS, "room_alice", "first_seen").unwrap().is_none());
        assert!(r.store.get(NS, "room_alicia", "first_seen").unwrap().is_some());
    }

    #[test]
    fn visible_identity_rekeys_nick_record() {
        let r = reconciler();
        r.observe(&update("room", "alice", None)).unwrap();
        let first_seen = r.first_seen("room", "alice").unwrap();

        let events = r
            .observe(&update("room", "alice", Some("alice@example.org")))
            .unwrap();
        // no join: the same user, now tracked under the identity
        assert!(events.iter().all(|e| e.kind != PresenceEventKind::RoomJoin));
        assert_eq!(r.first_seen("room", "alice@example.org"), Some(first_seen));
        assert!(r.state("room", "alice").is_none());
    }

    #[test]
    fn mirror_survives_reload() {
        let store = Arc::new(KeyFieldStore::open_in_memory().unwrap());
        let r = PresenceReconciler::load(store.clone()).unwrap();
        r.observe(&update("room", "alice", None)).unwrap();
        let first_seen = r.first_seen("room", "alice").unwrap();
        drop(r);

        let reloaded = PresenceReconciler::load(store).unwrap();
        let state = reloaded.state("room", "alice").unwrap();
        assert_eq!(state.role, Role::Participant);
        assert_eq!(state.first_seen, first_seen);
    }
}
