//! Baseline commands: help, room management, the ignore list and process
//! lifecycle controls.

use async_trait::async_trait;
use std::sync::Arc;

use super::Plugin;
use crate::bot::BotContext;
use crate::commands::{CommandSpec, Registry};

pub struct CorePlugin;

#[async_trait]
impl Plugin for CorePlugin {
    fn name(&self) -> &'static str {
        "core"
    }

    fn register_commands(&self, registry: &mut Registry<Arc<BotContext>>) {
        registry.register(
            CommandSpec::new("help", "List commands, or describe one: help <command>", help)
                .aliases(&["h"])
                .plugin("core"),
        );
        registry.register(
            CommandSpec::new("join", "Join a room: join <room address>", join)
                .plugin("core")
                .admin_only()
                .category("admin"),
        );
        registry.register(
            CommandSpec::new(
                "ignore",
                "Manage the ignore list: ignore [add|remove] <nick>",
                ignore,
            )
            .plugin("core")
            .admin_only()
            .category("admin"),
        );
        registry.register(
            CommandSpec::new("shutdown", "Stop the bot", shutdown)
                .plugin("core")
                .admin_only()
                .category("admin"),
        );
        registry.register(
            CommandSpec::new("restart", "Restart the bot process", restart)
                .aliases(&["reboot", "reload"])
                .plugin("core")
                .admin_only()
                .category("admin"),
        );
    }
}

async fn help(
    ctx: Arc<BotContext>,
    inv: crate::commands::Invocation,
) -> anyhow::Result<Option<String>> {
    let Some(registry) = ctx.commands.get() else {
        return Ok(None);
    };
    let is_admin = ctx.config.is_admin(inv.jid.as_deref().unwrap_or(""));

    if inv.args.is_empty() {
        let mut names: Vec<&str> = registry
            .specs()
            .iter()
            .filter(|s| !s.hidden && (is_admin || !s.admin_only))
            .map(|s| s.name.as_str())
            .collect();
        names.sort_unstable();
        return Ok(Some(format!("Commands: {}", names.join(", "))));
    }

    let word = inv.args.split_whitespace().next().unwrap_or("");
    match registry.resolve(word) {
        Some(spec) if is_admin || !spec.admin_only => {
            let mut line = format!("{}: {}", spec.name, spec.help);
            if !spec.aliases.is_empty() {
                line.push_str(&format!(" (aliases: {})", spec.aliases.join(", ")));
            }
            Ok(Some(line))
        }
        _ => Ok(Some(format!("No such command: {word}"))),
    }
}

async fn join(
    ctx: Arc<BotContext>,
    inv: crate::commands::Invocation,
) -> anyhow::Result<Option<String>> {
    let room = inv.args.trim();
    if room.is_empty() {
        return Ok(Some("Usage: join <room address>".to_string()));
    }
    ctx.join_room(room).await?;
    Ok(Some(format!("Joined {room}.")))
}

async fn ignore(
    ctx: Arc<BotContext>,
    inv: crate::commands::Invocation,
) -> anyhow::Result<Option<String>> {
    let mut parts = inv.args.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some("add"), Some(name)) => {
            ctx.add_ignore(name)?;
            Ok(Some(format!("Now ignoring {name}.")))
        }
        (Some("remove"), Some(name)) => {
            if ctx.remove_ignore(name)? {
                Ok(Some(format!("No longer ignoring {name}.")))
            } else {
                Ok(Some(format!("{name} was not ignored.")))
            }
        }
        (None, _) | (Some("list"), _) => {
            let mut ignored = ctx.ignored_names();
            if ignored.is_empty() {
                Ok(Some("Nobody is ignored.".to_string()))
            } else {
                ignored.sort_unstable();
                Ok(Some(format!("Ignoring: {}", ignored.join(", "))))
            }
        }
        _ => Ok(Some(
            "Usage: ignore [add|remove] <nick>, or ignore list".to_string(),
        )),
    }
}

async fn shutdown(
    ctx: Arc<BotContext>,
    _inv: crate::commands::Invocation,
) -> anyhow::Result<Option<String>> {
    ctx.request_shutdown();
    Ok(Some("Shutting down.".to_string()))
}

async fn restart(
    ctx: Arc<BotContext>,
    _inv: crate::commands::Invocation,
) -> anyhow::Result<Option<String>> {
    ctx.request_restart();
    Ok(Some("Restarting.".to_string()))
}
