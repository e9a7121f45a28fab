//! The `seen` command: when someone last spoke in a room.

use async_trait::async_trait;
use std::sync::Arc;

use super::Plugin;
use crate::bot::BotContext;
use crate::commands::{CommandSpec, Invocation, Registry};
use crate::history::RecentQuery;
use crate::util::readable_ago;

pub struct LastSeenPlugin;

#[async_trait]
impl Plugin for LastSeenPlugin {
    fn name(&self) -> &'static str {
        "last_seen"
    }

    fn register_commands(&self, registry: &mut Registry<Arc<BotContext>>) {
        registry.register(
            CommandSpec::new("seen", "When someone last spoke: seen <nick>", seen)
                .aliases(&["lastseen"])
                .plugin("last_seen"),
        );
    }
}

async fn seen(ctx: Arc<BotContext>, inv: Invocation) -> anyhow::Result<Option<String>> {
    let Some(room) = &inv.room else {
        return Ok(Some("That only works in a room.".to_string()));
    };
    let target = inv.args.trim();
    if target.is_empty() {
        return Ok(Some("Usage: seen <nick>".to_string()));
    }
    if target.eq_ignore_ascii_case(&inv.nick) {
        return Ok(Some("Look behind you.".to_string()));
    }

    let entries = ctx.history.recent(
        room,
        &RecentQuery {
            limit: Some(1),
            descending: true,
            nick: Some(target),
            ..RecentQuery::default()
        },
    )?;

    match entries.first() {
        Some(entry) => Ok(Some(format!(
            "{} was last seen {} saying: {}",
            target,
            readable_ago(entry.timestamp),
            entry.body
        ))),
        None => Ok(Some(format!("I have never seen {target} say anything."))),
    }
}
