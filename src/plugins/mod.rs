//! Plugin engine: capability declaration, per-room gating and fault
//! isolation around the builtin feature plugins.
//!
//! Plugins declare the event kinds they care about up front via
//! [`Plugin::interests`], so fan-out skips uninterested plugins instead of
//! calling a no-op hook. Within one event, plugins run sequentially in
//! registration order; a panicking or failing plugin is logged and the rest
//! still run.

pub mod chat;
pub mod core;
pub mod debug;
pub mod feeds;
pub mod keywords;
pub mod last_seen;
pub mod post_office;
pub mod tasks;
pub mod transform;

use async_trait::async_trait;
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use self::tasks::TaskGroup;

use crate::bot::BotContext;
use crate::commands::Registry;
use crate::config::Config;
use crate::presence::PresenceEvent;
use crate::transport::{InboundMessage, ReactionEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    GroupMessage,
    Whisper,
    FileTransfer,
    Reaction,
    RoomJoin,
    RoleChange,
    AffiliationChange,
    StatusChange,
}

/// A groupchat message after the shell's preprocessing: gateway wrappers
/// unwrapped, quoted reply text split off, command dispatch already done.
#[derive(Debug, Clone)]
pub struct GroupMessage {
    pub room: String,
    pub nick: String,
    pub jid: Option<String>,
    /// Cleaned body.
    pub body: String,
    /// Quoted text removed from the body, when the message was a reply.
    pub quote: Option<String>,
    /// Whether the dispatcher already handled this body as a command.
    pub is_command: bool,
    pub msg: InboundMessage,
}

/// A direct message from a room occupant or a bare account.
#[derive(Debug, Clone)]
pub struct Whisper {
    pub from: String,
    pub nick: String,
    pub body: String,
    pub is_admin: bool,
    pub msg: InboundMessage,
}

/// An out-of-band attachment observed in a room.
#[derive(Debug, Clone)]
pub struct FileTransfer {
    pub room: String,
    pub nick: String,
    pub jid: Option<String>,
    pub url: String,
    pub msg: InboundMessage,
}

#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &'static str;

    /// Event kinds this plugin wants delivered. Commands registered in
    /// [`Plugin::register_commands`] work regardless.
    fn interests(&self) -> &'static [EventKind] {
        &[]
    }

    fn register_commands(&self, _registry: &mut Registry<Arc<BotContext>>) {}

    /// The plugin's private background-task group, when it runs any. The
    /// host cancels it right after [`Plugin::on_shutdown`].
    fn tasks(&self) -> Option<&TaskGroup> {
        None
    }

    /// One-time startup hook, after rooms are joined. Background work goes
    /// through the plugin's own [`Plugin::tasks`] group.
    async fn start(&self, _ctx: Arc<BotContext>) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_group_message(
        &self,
        _ctx: Arc<BotContext>,
        _event: &GroupMessage,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_whisper(&self, _ctx: Arc<BotContext>, _event: &Whisper) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_file_transfer(
        &self,
        _ctx: Arc<BotContext>,
        _event: &FileTransfer,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_reaction(
        &self,
        _ctx: Arc<BotContext>,
        _event: &ReactionEvent,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_presence(
        &self,
        _ctx: Arc<BotContext>,
        _event: &PresenceEvent,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_shutdown(&self, _ctx: Arc<BotContext>) -> anyhow::Result<()> {
        Ok(())
    }
}

pub struct PluginHost {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl PluginHost {
    /// The builtin plugin set, minus anything disabled globally.
    pub fn builtin(config: &Config) -> Self {
        let all: Vec<Arc<dyn Plugin>> = vec![
            Arc::new(self::core::CorePlugin),
            Arc::new(last_seen::LastSeenPlugin),
            Arc::new(keywords::KeywordsPlugin::from_config(config)),
            Arc::new(chat::ChatPlugin::from_config(config)),
            Arc::new(transform::TransformPlugin::from_config(config)),
            Arc::new(post_office::PostOfficePlugin::new()),
            Arc::new(feeds::FeedsPlugin::from_config(config)),
            Arc::new(debug::DebugPlugin),
        ];
        let plugins: Vec<_> = all
            .into_iter()
            .filter(|p| {
                let keep = !config
                    .global_disabled_plugins
                    .iter()
                    .any(|d| d == p.name());
                if !keep {
                    info!(plugin = p.name(), "plugin disabled globally");
                }
                keep
            })
            .collect();
        info!(count = plugins.len(), "plugins loaded");
        Self { plugins }
    }

    #[cfg(test)]
    pub fn with_plugins(plugins: Vec<Arc<dyn Plugin>>) -> Self {
        Self { plugins }
    }

    pub fn register_commands(&self, registry: &mut Registry<Arc<BotContext>>) {
        for plugin in &self.plugins {
            plugin.register_commands(registry);
        }
    }

    /// Whether a plugin runs in a room, honoring the room's whitelist when
    /// set and its disabled list otherwise.
    fn enabled_in(config: &Config, room: &str, name: &str) -> bool {
        let room_cfg = config.room(room);
        if let Some(whitelist) = &room_cfg.whitelist_plugins {
            return whitelist.iter().any(|p| p == name);
        }
        !room_cfg.disabled_plugins.iter().any(|p| p == name)
    }

    async fn deliver<'a, F>(&self, kind: EventKind, room: Option<&str>, ctx: &Arc<BotContext>, f: F)
    where
        F: Fn(Arc<dyn Plugin>, Arc<BotContext>) -> futures_util::future::BoxFuture<'a, anyhow::Result<()>>,
    {
        for plugin in &self.plugins {
            if !plugin.interests().contains(&kind) {
                continue;
            }
            if let Some(room) = room {
                if !Self::enabled_in(&ctx.config, room, plugin.name()) {
                    debug!(plugin = plugin.name(), room = %room, "plugin disabled here, skipping");
                    continue;
                }
            }
            match AssertUnwindSafe(f(plugin.clone(), ctx.clone()))
                .catch_unwind()
                .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(plugin = plugin.name(), error = %e, "plugin hook failed");
                }
                Err(_) => {
                    error!(plugin = plugin.name(), "plugin hook panicked");
                }
            }
        }
    }

    pub async fn start(&self, ctx: &Arc<BotContext>) {
        for plugin in &self.plugins {
            match AssertUnwindSafe(plugin.start(ctx.clone())).catch_unwind().await {
                Ok(Ok(())) => debug!(plugin = plugin.name(), "plugin started"),
                Ok(Err(e)) => error!(plugin = plugin.name(), error = %e, "plugin startup failed"),
                Err(_) => error!(plugin = plugin.name(), "plugin startup panicked"),
            }
        }
    }

    pub async fn group_message(&self, ctx: &Arc<BotContext>, event: &GroupMessage) {
        self.deliver(EventKind::GroupMessage, Some(&event.room), ctx, |p, ctx| {
            Box::pin(async move { p.on_group_message(ctx, event).await })
        })
        .await;
    }

    pub async fn whisper(&self, ctx: &Arc<BotContext>, event: &Whisper) {
        self.deliver(EventKind::Whisper, None, ctx, |p, ctx| {
            Box::pin(async move { p.on_whisper(ctx, event).await })
        })
        .await;
    }

    pub async fn file_transfer(&self, ctx: &Arc<BotContext>, event: &FileTransfer) {
        self.deliver(EventKind::FileTransfer, Some(&event.room), ctx, |p, ctx| {
            Box::pin(async move { p.on_file_transfer(ctx, event).await })
        })
        .await;
    }

    pub async fn reaction(&self, ctx: &Arc<BotContext>, event: &ReactionEvent) {
        self.deliver(EventKind::Reaction, Some(&event.from), ctx, |p, ctx| {
            Box::pin(async move { p.on_reaction(ctx, event).await })
        })
        .await;
    }

    pub async fn presence(&self, ctx: &Arc<BotContext>, event: &PresenceEvent) {
        debug!(room = %event.room, user = %event.user, kind = event.kind.tag(), "presence event");
        let kind = match event.kind {
            crate::presence::PresenceEventKind::RoomJoin => EventKind::RoomJoin,
            crate::presence::PresenceEventKind::RoleChange => EventKind::RoleChange,
            crate::presence::PresenceEventKind::AffiliationChange => EventKind::AffiliationChange,
            crate::presence::PresenceEventKind::StatusChange => EventKind::StatusChange,
        };
        self.deliver(kind, Some(&event.room), ctx, |p, ctx| {
            Box::pin(async move { p.on_presence(ctx, event).await })
        })
        .await;
    }

    /// First phase of shutdown: let every plugin flush state, then drain its
    /// private task group with a bounded wait.
    pub async fn shutdown(&self, ctx: &Arc<BotContext>, timeout: Duration) {
        for plugin in &self.plugins {
            match AssertUnwindSafe(plugin.on_shutdown(ctx.clone()))
                .catch_unwind()
                .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(plugin = plugin.name(), error = %e, "plugin shutdown failed"),
                Err(_) => error!(plugin = plugin.name(), "plugin shutdown panicked"),
            }
            if let Some(tasks) = plugin.tasks() {
                tasks.shutdown(timeout).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bot::Bot;
    use crate::transport::mock::MockTransport;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio_util::sync::CancellationToken;

    struct SleeperPlugin {
        tasks: TaskGroup,
        flushed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Plugin for SleeperPlugin {
        fn name(&self) -> &'static str {
            "sleeper"
        }

        fn tasks(&self) -> Option<&TaskGroup> {
            Some(&self.tasks)
        }

        async fn on_shutdown(&self, _ctx: Arc<BotContext>) -> anyhow::Result<()> {
            self.flushed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn test_ctx(dir: &tempfile::TempDir) -> Arc<BotContext> {
        let raw = format!(
            r#"
identity = "bot@example.org"
db_path = "{}/bot.db"
"#,
            dir.path().display()
        );
        let config: Config = toml::from_str(&raw).unwrap();
        let transport = Arc::new(MockTransport::new("bot@example.org"));
        Bot::new(config, transport, CancellationToken::new())
            .unwrap()
            .context()
    }

    #[tokio::test]
    async fn host_shutdown_flushes_plugins_and_drains_their_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(&dir);

        let group = TaskGroup::new();
        group.spawn("pending", async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        });
        let flushed = Arc::new(AtomicBool::new(false));
        let host = PluginHost::with_plugins(vec![Arc::new(SleeperPlugin {
            tasks: group.clone(),
            flushed: flushed.clone(),
        })]);

        host.shutdown(&ctx, Duration::from_secs(1)).await;

        assert!(flushed.load(Ordering::SeqCst));
        assert!(group.cancellation().is_cancelled());
    }
}
