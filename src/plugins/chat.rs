//! Conversational replies: when someone says the bot's nick in a room, the
//! recent history is rendered into a named prompt and the answer goes back
//! to the room. Each user gets a cooldown so the bot cannot be turned into
//! a chat relay.

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::seq::IndexedRandom;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

use super::{EventKind, GroupMessage, Plugin};
use crate::bot::BotContext;
use crate::commands::{CommandSpec, Invocation, Registry};
use crate::config::Config;
use crate::history::{HistoryEntry, RecentQuery};
use crate::llm::CallOptions;
use crate::util::now_ts;

#[derive(Debug, Clone, Deserialize)]
pub struct ChatConfig {
    /// Named prompt rendered with `history`, `bot_nick`, `style` and `mood`.
    #[serde(default)]
    pub chat_prompt: Option<String>,
    /// How many archived messages go into the history block.
    #[serde(default = "default_history")]
    pub num_history_msgs: usize,
    /// Candidate styles; one is picked at random per reply.
    #[serde(default)]
    pub styles: Vec<String>,
    #[serde(default)]
    pub moods: Vec<String>,
    /// Seconds each user must wait between answered mentions.
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,
}

fn default_history() -> usize {
    5
}

fn default_cooldown() -> u64 {
    60
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            chat_prompt: None,
            num_history_msgs: default_history(),
            styles: Vec::new(),
            moods: Vec::new(),
            cooldown_secs: default_cooldown(),
        }
    }
}

pub struct ChatPlugin {
    config: ChatConfig,
    /// user key -> last answered mention, epoch seconds.
    cooldowns: Mutex<HashMap<String, i64>>,
}

impl ChatPlugin {
    pub fn from_config(config: &Config) -> Self {
        Self {
            config: config.plugin_config("chat"),
            cooldowns: Mutex::new(HashMap::new()),
        }
    }

    /// Remaining cooldown for `user`, pruning entries old enough to never
    /// block again.
    fn cooldown_remaining(&self, user: &str, now: i64) -> Option<i64> {
        let duration = self.config.cooldown_secs as i64;
        let mut cooldowns = self.cooldowns.lock();
        cooldowns.retain(|_, last| now - *last < duration * 2);
        let elapsed = now - cooldowns.get(user).copied()?;
        (elapsed < duration).then_some(duration - elapsed)
    }

    fn stamp(&self, user: &str, now: i64) {
        self.cooldowns.lock().insert(user.to_string(), now);
    }
}

/// Whether a body says the given nick, ignoring case.
fn mentions(body: &str, nick: &str) -> bool {
    !nick.is_empty() && body.to_lowercase().contains(&nick.to_lowercase())
}

/// Oldest-first `[HH:MM:SS]nick: body` lines, skipping repeated bodies.
/// Entries arrive newest-first from the ledger.
fn format_history(entries: &[HistoryEntry]) -> String {
    let mut seen = HashSet::new();
    let mut lines: Vec<String> = entries
        .iter()
        .filter(|e| seen.insert(e.body.clone()))
        .map(|e| {
            let time = chrono::DateTime::from_timestamp(e.timestamp, 0)
                .map(|dt| dt.format("[%H:%M:%S]").to_string())
                .unwrap_or_default();
            format!("{time}{}: {}", e.nick, e.body)
        })
        .collect();
    lines.reverse();
    lines.join("\n")
}

fn pick(options: &[String]) -> String {
    options
        .choose(&mut rand::rng())
        .cloned()
        .unwrap_or_else(|| "Not provided".to_string())
}

async fn chat(_ctx: Arc<BotContext>, _inv: Invocation) -> anyhow::Result<Option<String>> {
    Ok(Some("Just say my name.".to_string()))
}

#[async_trait]
impl Plugin for ChatPlugin {
    fn name(&self) -> &'static str {
        "chat"
    }

    fn interests(&self) -> &'static [EventKind] {
        &[EventKind::GroupMessage]
    }

    fn register_commands(&self, registry: &mut Registry<Arc<BotContext>>) {
        registry.register(
            CommandSpec::new("chat", "Chat with me: just say my name", chat).plugin("chat"),
        );
    }

    async fn on_group_message(
        &self,
        ctx: Arc<BotContext>,
        event: &GroupMessage,
    ) -> anyhow::Result<()> {
        if event.is_command {
            return Ok(());
        }
        let Some(prompt) = &self.config.chat_prompt else {
            return Ok(());
        };
        let Some(llm) = &ctx.llm else {
            debug!("no language backend configured, chat mentions ignored");
            return Ok(());
        };

        let bot_nick = ctx.config.nick_for(&event.room);
        if !mentions(&event.body, &bot_nick) {
            return Ok(());
        }

        let user = event.jid.clone().unwrap_or_else(|| event.nick.clone());
        let now = now_ts();
        if let Some(remaining) = self.cooldown_remaining(&user, now) {
            debug!(user = %user, remaining, "chat mention during cooldown");
            let notice = format!(
                "Command '{bot_nick}' is on cooldown. Try again in {} second(s).",
                remaining + 1
            );
            ctx.send_whisper(&event.room, &event.nick, &notice).await?;
            return Ok(());
        }

        let entries = ctx.history.recent(
            &event.room,
            &RecentQuery {
                limit: Some(self.config.num_history_msgs),
                descending: true,
                ..RecentQuery::default()
            },
        )?;

        let mut inputs = HashMap::new();
        inputs.insert("history".to_string(), format_history(&entries));
        inputs.insert("bot_nick".to_string(), bot_nick.clone());
        inputs.insert("style".to_string(), pick(&self.config.styles));
        inputs.insert("mood".to_string(), pick(&self.config.moods));

        match llm.send_prompt(prompt, &inputs, &CallOptions::default()).await {
            Ok(reply) => {
                ctx.send_to_room(&event.room, &reply, Some(&event.msg.id))
                    .await?;
                self.stamp(&user, now);
            }
            Err(e) => warn!(room = %event.room, error = %e, "chat reply failed"),
        }
        Ok(())
    }
}
