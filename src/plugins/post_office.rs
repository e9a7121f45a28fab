//! Deferred delivery: `tell` messages handed over when the recipient next
//! speaks, and `remindme` timers.
//!
//! Reminders survive restarts: they are persisted as JSON and re-armed by a
//! startup sweep, so anything that came due while the bot was down fires
//! right away.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use super::tasks::TaskGroup;
use super::{EventKind, GroupMessage, Plugin};
use crate::bot::BotContext;
use crate::commands::{CommandSpec, Invocation, Registry};
use crate::util::{now_ts, readable_ago};

const NS: &str = "bot_post_office";
const REMINDER_KEY: &str = "reminders";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Reminder {
    /// `None` for reminders set over direct message.
    room: Option<String>,
    nick: String,
    jid: Option<String>,
    due: i64,
    message: String,
}

pub struct PostOfficePlugin {
    tasks: TaskGroup,
}

impl PostOfficePlugin {
    pub fn new() -> Self {
        Self {
            tasks: TaskGroup::new(),
        }
    }
}

impl Default for PostOfficePlugin {
    fn default() -> Self {
        Self::new()
    }
}

/// "10s", "5m", "2h", "1d"; a bare number means minutes.
fn parse_duration(word: &str) -> Option<u64> {
    let word = word.trim();
    let (digits, unit) = match word.find(|c: char| !c.is_ascii_digit()) {
        Some(pos) => word.split_at(pos),
        None => (word, "m"),
    };
    let n: u64 = digits.parse().ok()?;
    let seconds = match unit {
        "s" => n,
        "m" => n * 60,
        "h" => n * 3600,
        "d" => n * 86_400,
        _ => return None,
    };
    Some(seconds)
}

fn tell_key(room: &str, recipient: &str) -> String {
    format!("tell_{room}_{}", recipient.to_lowercase())
}

/// Field key for a stored reminder. The message id keeps two reminders from
/// the same user landing on the same second distinct.
fn reminder_field(due: i64, nick: &str, msg_id: &str) -> String {
    format!("{due}_{nick}_{msg_id}")
}

async fn deliver_reminder(ctx: Arc<BotContext>, field: String, reminder: Reminder) -> anyhow::Result<()> {
    match &reminder.room {
        Some(room) => {
            let text = format!("{}: Reminder: {}", reminder.nick, reminder.message);
            ctx.send_to_room(room, &text, None).await?;
        }
        None => {
            let Some(jid) = &reminder.jid else {
                warn!(nick = %reminder.nick, "reminder without room or identity, dropping");
                ctx.store.delete(NS, REMINDER_KEY, Some(&field))?;
                return Ok(());
            };
            ctx.send_chat(jid, &format!("Reminder: {}", reminder.message))
                .await?;
        }
    }
    ctx.store.delete(NS, REMINDER_KEY, Some(&field))?;
    Ok(())
}

fn arm_reminder(ctx: &Arc<BotContext>, tasks: &TaskGroup, field: String, reminder: Reminder) {
    let ctx = ctx.clone();
    let due = reminder.due;
    tasks.spawn_at("reminder", due, async move {
        deliver_reminder(ctx, field, reminder).await
    });
}

async fn tell(ctx: Arc<BotContext>, inv: Invocation) -> anyhow::Result<Option<String>> {
    let Some(room) = &inv.room else {
        return Ok(Some("That only works in a room.".to_string()));
    };
    let Some((recipient, message)) = inv.args.split_once(' ') else {
        return Ok(Some("Usage: tell <nick> <message>".to_string()));
    };
    let message = message.trim();
    if message.is_empty() {
        return Ok(Some("Usage: tell <nick> <message>".to_string()));
    }
    if recipient.eq_ignore_ascii_case(&inv.nick) {
        return Ok(Some("Telling yourself things is free.".to_string()));
    }

    ctx.store.set(
        NS,
        &tell_key(room, recipient),
        &inv.nick,
        &format!("{}|{message}", now_ts()),
    )?;
    Ok(Some(format!(
        "{}: I will pass that on when {recipient} speaks up.",
        inv.nick
    )))
}

async fn remindme(
    ctx: Arc<BotContext>,
    inv: Invocation,
    tasks: TaskGroup,
) -> anyhow::Result<Option<String>> {
    let Some((duration_word, message)) = inv.args.split_once(' ') else {
        return Ok(Some(
            "Usage: remindme <duration> <message>, e.g. remindme 20m tea".to_string(),
        ));
    };
    let Some(seconds) = parse_duration(duration_word) else {
        return Ok(Some(format!("I cannot parse {duration_word:?} as a duration.")));
    };
    let message = message.trim();
    if message.is_empty() {
        return Ok(Some("Remind you of what?".to_string()));
    }

    let due = now_ts() + seconds as i64;
    let reminder = Reminder {
        room: inv.room.clone(),
        nick: inv.nick.clone(),
        jid: inv.jid.clone(),
        due,
        message: message.to_string(),
    };
    let field = reminder_field(due, &inv.nick, &inv.msg.id);
    ctx.store
        .set(NS, REMINDER_KEY, &field, &serde_json::to_string(&reminder)?)?;
    arm_reminder(&ctx, &tasks, field, reminder);
    Ok(Some(format!("Will do, in {duration_word}.")))
}

async fn cleartells(ctx: Arc<BotContext>, inv: Invocation) -> anyhow::Result<Option<String>> {
    let Some(room) = &inv.room else {
        return Ok(Some("That only works in a room.".to_string()));
    };
    ctx.store
        .delete_by_pattern(NS, &format!("tell_{room}_%"))?;
    Ok(Some("Undelivered messages for this room dropped.".to_string()))
}

#[async_trait]
impl Plugin for PostOfficePlugin {
    fn name(&self) -> &'static str {
        "post_office"
    }

    fn interests(&self) -> &'static [EventKind] {
        &[EventKind::GroupMessage]
    }

    fn tasks(&self) -> Option<&TaskGroup> {
        Some(&self.tasks)
    }

    fn register_commands(&self, registry: &mut Registry<Arc<BotContext>>) {
        registry.register(
            CommandSpec::new("tell", "Leave a message: tell <nick> <message>", tell)
                .plugin("post_office")
                .category("post_office"),
        );
        let tasks = self.tasks.clone();
        registry.register(
            CommandSpec::new(
                "remindme",
                "Set a timer: remindme <duration> <message>",
                move |ctx, inv| remindme(ctx, inv, tasks.clone()),
            )
            .plugin("post_office")
            .category("post_office"),
        );
        registry.register(
            CommandSpec::new("cleartells", "Drop undelivered messages for this room", cleartells)
                .plugin("post_office")
                .admin_only()
                .category("admin"),
        );
    }

    /// Re-arm persisted reminders. Anything already overdue fires at once.
    async fn start(&self, ctx: Arc<BotContext>) -> anyhow::Result<()> {
        let fields = ctx.store.get_all_fields(NS, REMINDER_KEY)?;
        let mut armed = 0usize;
        for (field, raw) in fields {
            match serde_json::from_str::<Reminder>(&raw) {
                Ok(reminder) => {
                    arm_reminder(&ctx, &self.tasks, field, reminder);
                    armed += 1;
                }
                Err(e) => {
                    warn!(field = %field, error = %e, "unreadable reminder, dropping");
                    ctx.store.delete(NS, REMINDER_KEY, Some(&field))?;
                }
            }
        }
        if armed > 0 {
            info!(count = armed, "reminders re-armed");
        }
        Ok(())
    }

    /// Hand over any stored tells the moment the recipient says something.
    async fn on_group_message(
        &self,
        ctx: Arc<BotContext>,
        event: &GroupMessage,
    ) -> anyhow::Result<()> {
        let key = tell_key(&event.room, &event.nick);
        let pending = ctx.store.get_all_fields(NS, &key)?;
        if pending.is_empty() {
            return Ok(());
        }
        for (sender, raw) in &pending {
            let (ts, message) = match raw.split_once('|') {
                Some((ts, message)) => (ts.parse::<i64>().unwrap_or(0), message),
                None => (0, raw.as_str()),
            };
            let text = format!(
                "{}: {sender} left you a message {}: {message}",
                event.nick,
                readable_ago(ts)
            );
            ctx.send_to_room(&event.room, &text, Some(&event.msg.id)).await?;
        }
        ctx.store.delete(NS, &key, None)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_words() {
        assert_eq!(parse_duration("30s"), Some(30));
        assert_eq!(parse_duration("5m"), Some(300));
        assert_eq!(parse_duration("2h"), Some(7200));
        assert_eq!(parse_duration("1d"), Some(86_400));
        // bare numbers are minutes
        assert_eq!(parse_duration("15"), Some(900));
        assert_eq!(parse_duration("soon"), None);
        assert_eq!(parse_duration("5x"), None);
    }

    #[test]
    fn tell_keys_fold_recipient_case() {
        assert_eq!(
            tell_key("room@muc.example.org", "Alice"),
            "tell_room@muc.example.org_alice"
        );
    }

    #[test]
    fn same_second_reminders_stay_distinct() {
        let a = reminder_field(1_700_000_000, "alice", "m1");
        let b = reminder_field(1_700_000_000, "alice", "m2");
        assert_ne!(a, b);
    }

    #[test]
    fn reminder_roundtrips_through_json() {
        let reminder = Reminder {
            room: Some("room@muc.example.org".to_string()),
            nick: "alice".to_string(),
            jid: None,
            due: 1_700_000_000,
            message: "tea".to_string(),
        };
        let raw = serde_json::to_string(&reminder).unwrap();
        let back: Reminder = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.due, reminder.due);
        assert_eq!(back.message, "tea");
    }
}
