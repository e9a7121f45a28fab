//! Admin poking tools: echo, reactions, roster dumps and state purges.

use async_trait::async_trait;
use std::sync::Arc;

use super::Plugin;
use crate::bot::BotContext;
use crate::commands::{CommandSpec, Invocation, Registry};

pub struct DebugPlugin;

#[async_trait]
impl Plugin for DebugPlugin {
    fn name(&self) -> &'static str {
        "debug"
    }

    fn register_commands(&self, registry: &mut Registry<Arc<BotContext>>) {
        registry.register(
            CommandSpec::new("echo", "Repeat the arguments back", echo)
                .plugin("debug")
                .admin_only()
                .category("admin"),
        );
        registry.register(
            CommandSpec::new("react", "React to a message: react <message id> <emoji>", react)
                .plugin("debug")
                .admin_only()
                .category("admin"),
        );
        registry.register(
            CommandSpec::new("roster", "List who is in this room", roster)
                .plugin("debug")
                .admin_only()
                .category("admin"),
        );
        registry.register(
            CommandSpec::new(
                "purge_user_states",
                "Drop all tracked presence state (needs 'confirm')",
                purge_user_states,
            )
            .plugin("debug")
            .admin_only()
            .category("admin"),
        );
    }
}

async fn echo(_ctx: Arc<BotContext>, inv: Invocation) -> anyhow::Result<Option<String>> {
    if inv.args.is_empty() {
        Ok(Some("echo".to_string()))
    } else {
        Ok(Some(inv.args))
    }
}

async fn react(ctx: Arc<BotContext>, inv: Invocation) -> anyhow::Result<Option<String>> {
    let Some(room) = &inv.room else {
        return Ok(Some("That only works in a room.".to_string()));
    };
    let Some((id, emoji)) = inv.args.split_once(' ') else {
        return Ok(Some("Usage: react <message id> <emoji>".to_string()));
    };
    ctx.react(room, id.trim(), emoji.trim()).await?;
    Ok(None)
}

async fn roster(ctx: Arc<BotContext>, inv: Invocation) -> anyhow::Result<Option<String>> {
    let Some(room) = &inv.room else {
        return Ok(Some("That only works in a room.".to_string()));
    };
    let mut nicks = ctx.transport.roster(room).await?;
    if nicks.is_empty() {
        return Ok(Some("Nobody here but us bots.".to_string()));
    }
    nicks.sort_unstable();
    Ok(Some(format!("{} occupants: {}", nicks.len(), nicks.join(", "))))
}

async fn purge_user_states(
    ctx: Arc<BotContext>,
    inv: Invocation,
) -> anyhow::Result<Option<String>> {
    if inv.args.trim() != "confirm" {
        return Ok(Some(
            "This drops every tracked user state. Run again with 'confirm'.".to_string(),
        ));
    }
    ctx.presence.purge()?;
    Ok(Some("User states purged.".to_string()))
}
