//! Orchestration shell: the transport event loop, inbound preprocessing
//! (ignore rules, corrections, gateway unwrapping, quote splitting),
//! command dispatch, plugin fan-out and outbound message processing.

use anyhow::Context as _;
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::commands::{cooldown_key, DispatchRequest, Invocation, Registry};
use crate::config::Config;
use crate::history::HistoryLedger;
use crate::llm::{CallOptions, ChatOrchestrator};
use crate::plugins::tasks::TaskGroup;
use crate::plugins::{FileTransfer, GroupMessage, PluginHost, Whisper};
use crate::presence::PresenceReconciler;
use crate::store::KeyFieldStore;
use crate::transport::{
    InboundMessage, MessageKind, ReplyRef, Role, Transport, TransportEvent,
};
use crate::util::now_ts;

const IGNORE_NS: &str = "bot_ignore";
const IGNORE_KEY: &str = "names";

/// Why the event loop returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Shutdown,
    Restart,
    ConnectionLost(String),
}

/// Shared state and capabilities handed to commands and plugins.
pub struct BotContext {
    pub config: Config,
    pub store: Arc<KeyFieldStore>,
    pub transport: Arc<dyn Transport>,
    pub llm: Option<ChatOrchestrator>,
    pub history: HistoryLedger,
    pub presence: PresenceReconciler,
    /// Task group for the shell's own event handlers. Plugin background work
    /// lives in per-plugin groups instead.
    pub tasks: TaskGroup,
    /// Set once after plugin command registration.
    pub commands: OnceLock<Arc<Registry<Arc<BotContext>>>>,
    joined_rooms: RwLock<HashSet<String>>,
    ignored: RwLock<HashSet<String>>,
    gateway_cache: Mutex<HashMap<String, Option<Regex>>>,
    shutdown: CancellationToken,
    restart: AtomicBool,
}

impl BotContext {
    pub fn is_joined(&self, room: &str) -> bool {
        self.joined_rooms.read().contains(room)
    }

    pub fn joined_rooms(&self) -> Vec<String> {
        self.joined_rooms.read().iter().cloned().collect()
    }

    /// Join a room and replay its history backfill through the ledger.
    /// Replayed messages and corrections are idempotent there.
    pub async fn join_room(&self, room: &str) -> anyhow::Result<()> {
        let nick = self.config.nick_for(room);
        let backfill = self
            .transport
            .join_room(
                room,
                &nick,
                self.config.max_history,
                Duration::from_secs(self.config.room_join_timeout_secs),
            )
            .await
            .with_context(|| format!("failed to join {room}"))?;
        self.joined_rooms.write().insert(room.to_string());

        let mut fresh = 0usize;
        for msg in &backfill {
            if let Some(replace_id) = &msg.replace_id {
                self.history
                    .record_correction(room, &msg.nick, replace_id, &msg.body)?;
                continue;
            }
            if self.history.record_message(
                room,
                &msg.nick,
                None,
                &msg.id,
                msg.stanza_id.as_deref(),
                &msg.body,
            )? {
                fresh += 1;
            }
        }
        info!(room = %room, backfill = backfill.len(), new = fresh, "joined room");
        Ok(())
    }

    fn leave_room(&self, room: &str) {
        self.joined_rooms.write().remove(room);
    }

    // ── Outbound ──────────────────────────────────────────────────

    /// Groupchat send with the outbound pipeline applied: silent-mode drop,
    /// optional LLM rewording, mention masking against the live roster.
    pub async fn send_to_room(
        &self,
        room: &str,
        body: &str,
        reply_to: Option<&str>,
    ) -> anyhow::Result<()> {
        let room_cfg = self.config.room(room);
        if room_cfg.silent_mode {
            debug!(room = %room, "silent mode, dropping outbound message");
            return Ok(());
        }

        let mut body = body.to_string();
        let filter = room_cfg
            .llm_filter_prompt
            .clone()
            .or_else(|| self.config.llm.filter_prompt.clone());
        if let (Some(prompt), Some(llm)) = (filter, &self.llm) {
            if llm.has_prompt(&prompt) {
                let mut inputs = HashMap::new();
                inputs.insert("text".to_string(), body.clone());
                match llm.send_prompt(&prompt, &inputs, &CallOptions::default()).await {
                    Ok(filtered) => body = filtered,
                    Err(e) => {
                        warn!(room = %room, error = %e, "message filter failed, sending unfiltered")
                    }
                }
            }
        }

        if !room_cfg.allow_mentions {
            let roster = self.transport.roster(room).await.unwrap_or_default();
            body = mask_mentions(&body, &roster, &self.config.nick_for(room));
        }

        self.transport
            .send_message(room, &body, MessageKind::GroupChat, reply_to)
            .await
    }

    /// Direct message to a bare account address.
    pub async fn send_chat(&self, to: &str, body: &str) -> anyhow::Result<()> {
        self.transport
            .send_message(to, body, MessageKind::Chat, None)
            .await
    }

    /// Private message to a room occupant.
    pub async fn send_whisper(&self, room: &str, nick: &str, body: &str) -> anyhow::Result<()> {
        self.transport
            .send_message(&format!("{room}/{nick}"), body, MessageKind::Chat, None)
            .await
    }

    pub async fn react(&self, room: &str, target_id: &str, emoji: &str) -> anyhow::Result<()> {
        let reactions: BTreeSet<String> = std::iter::once(emoji.to_string()).collect();
        self.transport
            .send_reaction(room, MessageKind::GroupChat, target_id, &reactions)
            .await
    }

    // ── Ignore list ───────────────────────────────────────────────

    pub fn is_ignored(&self, name: &str) -> bool {
        self.ignored.read().contains(&name.to_lowercase())
    }

    pub fn add_ignore(&self, name: &str) -> anyhow::Result<()> {
        let name = name.to_lowercase();
        self.store
            .set(IGNORE_NS, IGNORE_KEY, &name, &now_ts().to_string())?;
        self.ignored.write().insert(name);
        Ok(())
    }

    pub fn remove_ignore(&self, name: &str) -> anyhow::Result<bool> {
        let name = name.to_lowercase();
        self.store.delete(IGNORE_NS, IGNORE_KEY, Some(&name))?;
        Ok(self.ignored.write().remove(&name))
    }

    pub fn ignored_names(&self) -> Vec<String> {
        self.ignored.read().iter().cloned().collect()
    }

    // ── Lifecycle ─────────────────────────────────────────────────

    pub fn request_shutdown(&self) {
        info!("shutdown requested");
        self.shutdown.cancel();
    }

    pub fn request_restart(&self) {
        info!("restart requested");
        self.restart.store(true, Ordering::SeqCst);
        self.shutdown.cancel();
    }

    // ── Gateway unwrapping ────────────────────────────────────────

    /// When `nick` is a configured bridge, extract the real sender and body
    /// from the wrapper template and apply the gateway's replace map.
    fn unwrap_gateway(&self, nick: &str, body: &str) -> Option<(String, String)> {
        let gateway = self.config.gateways.get(nick)?;
        let re = {
            let mut cache = self.gateway_cache.lock();
            cache
                .entry(nick.to_string())
                .or_insert_with(|| match compile_gateway_pattern(&gateway.pattern) {
                    Ok(re) => Some(re),
                    Err(e) => {
                        warn!(gateway = %nick, error = %e, "unusable gateway pattern");
                        None
                    }
                })
                .clone()?
        };
        let caps = re.captures(body)?;
        let real_nick = caps.name("nick")?.as_str().to_string();
        let mut real_body = caps.name("body")?.as_str().to_string();
        for (from, to) in &gateway.replace {
            real_body = real_body.replace(from, to);
        }
        debug!(gateway = %nick, nick = %real_nick, "unwrapped bridged message");
        Some((real_nick, real_body))
    }
}

/// Turn a literal wrapper template like `"<{nick}> {body}"` into an anchored
/// regex with named capture groups.
fn compile_gateway_pattern(template: &str) -> anyhow::Result<Regex> {
    let escaped = regex::escape(template);
    let pattern = escaped
        .replacen(r"\{nick\}", r"(?P<nick>.+?)", 1)
        .replacen(r"\{body\}", r"(?P<body>.+)", 1);
    anyhow::ensure!(
        pattern.contains("(?P<nick>") && pattern.contains("(?P<body>"),
        "gateway template needs {{nick}} and {{body}} placeholders"
    );
    Regex::new(&format!("(?s)^{pattern}$")).context("invalid gateway pattern")
}

/// Split quoted reply text out of a body. A protocol-provided fallback span
/// wins; otherwise leading `>` lines count as the quote, but only for
/// messages that are actually replies.
fn split_quote(body: &str, reply: Option<&ReplyRef>) -> (String, Option<String>) {
    let Some(reply) = reply else {
        return (body.trim().to_string(), None);
    };

    if let Some((start, end)) = reply.fallback {
        if start < end
            && end <= body.len()
            && body.is_char_boundary(start)
            && body.is_char_boundary(end)
        {
            let quote = strip_quote_markers(&body[start..end]);
            let clean = format!("{}{}", &body[..start], &body[end..]);
            return (clean.trim().to_string(), Some(quote));
        }
    }

    let mut quote_lines = Vec::new();
    let mut rest = Vec::new();
    let mut in_quote = true;
    for line in body.lines() {
        if in_quote && line.starts_with('>') {
            quote_lines.push(line.trim_start_matches('>').trim_start());
        } else {
            in_quote = false;
            rest.push(line);
        }
    }
    if quote_lines.is_empty() {
        (body.trim().to_string(), None)
    } else {
        (
            rest.join("\n").trim().to_string(),
            Some(quote_lines.join("\n")),
        )
    }
}

fn strip_quote_markers(quote: &str) -> String {
    quote
        .lines()
        .map(|l| l.trim_start_matches('>').trim_start())
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// Break up occupant nicknames with a zero-width space so outbound text
/// cannot ping people in rooms that forbid it.
fn mask_mentions(body: &str, roster: &[String], own_nick: &str) -> String {
    let mut out = body.to_string();
    for nick in roster {
        if nick.chars().count() < 2 || nick == own_nick {
            continue;
        }
        if let Some(first) = nick.chars().next() {
            let masked = format!("{first}\u{200B}{}", &nick[first.len_utf8()..]);
            out = out.replace(nick.as_str(), &masked);
        }
    }
    out
}

pub struct Bot {
    ctx: Arc<BotContext>,
    host: Arc<PluginHost>,
}

impl Bot {
    /// Wire everything up: storage, state mirrors, plugins and commands.
    /// `shutdown` is the externally owned stop signal (interrupt handling
    /// lives in the binary).
    pub fn new(
        config: Config,
        transport: Arc<dyn Transport>,
        shutdown: CancellationToken,
    ) -> anyhow::Result<Self> {
        let store = Arc::new(KeyFieldStore::open(&config.db_path)?);
        let history = HistoryLedger::new(store.clone());
        let presence = PresenceReconciler::load(store.clone())?;
        let llm = ChatOrchestrator::from_config(&config.llm)?;

        let mut ignored: HashSet<String> =
            config.ignored.iter().map(|n| n.to_lowercase()).collect();
        for (name, _) in store.get_all_fields(IGNORE_NS, IGNORE_KEY)? {
            ignored.insert(name);
        }

        let host = Arc::new(PluginHost::builtin(&config));

        let ctx = Arc::new(BotContext {
            config,
            store,
            transport,
            llm,
            history,
            presence,
            tasks: TaskGroup::new(),
            commands: OnceLock::new(),
            joined_rooms: RwLock::new(HashSet::new()),
            ignored: RwLock::new(ignored),
            gateway_cache: Mutex::new(HashMap::new()),
            shutdown,
            restart: AtomicBool::new(false),
        });

        let mut registry = Registry::new(
            ctx.config.default_command_cooldown,
            ctx.config.suggestions.clone(),
        );
        host.register_commands(&mut registry);
        let _ = ctx.commands.set(Arc::new(registry));

        Ok(Self { ctx, host })
    }

    pub fn context(&self) -> Arc<BotContext> {
        self.ctx.clone()
    }

    /// Connect and consume transport events until shutdown, restart or
    /// connection loss. Always runs the shutdown sequence before returning.
    pub async fn run(&self) -> anyhow::Result<RunOutcome> {
        let (tx, mut rx) = mpsc::channel(64);
        self.ctx
            .transport
            .connect(tx)
            .await
            .context("transport connect failed")?;

        let outcome = loop {
            tokio::select! {
                _ = self.ctx.shutdown.cancelled() => {
                    break if self.ctx.restart.load(Ordering::SeqCst) {
                        RunOutcome::Restart
                    } else {
                        RunOutcome::Shutdown
                    };
                }
                event = rx.recv() => {
                    match event {
                        None => break RunOutcome::ConnectionLost("event stream closed".to_string()),
                        Some(TransportEvent::Disconnected { reason }) => {
                            break RunOutcome::ConnectionLost(reason);
                        }
                        Some(event) => self.handle_event(event).await,
                    }
                }
            }
        };

        self.shutdown_sequence().await;
        Ok(outcome)
    }

    async fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::SessionStart => self.on_session_start().await,
            TransportEvent::GroupchatMessage(msg) => {
                let ctx = self.ctx.clone();
                let host = self.host.clone();
                self.ctx.tasks.spawn("group_message", async move {
                    handle_group_message(ctx, host, msg).await
                });
            }
            TransportEvent::PrivateMessage(msg) => {
                let ctx = self.ctx.clone();
                let host = self.host.clone();
                self.ctx.tasks.spawn("private_message", async move {
                    handle_private_message(ctx, host, msg).await
                });
            }
            // Presence is reconciled inline to keep transitions ordered.
            TransportEvent::Presence(update) => self.on_presence(update).await,
            TransportEvent::Reaction(reaction) => {
                let ctx = self.ctx.clone();
                let host = self.host.clone();
                self.ctx.tasks.spawn("reaction", async move {
                    host.reaction(&ctx, &reaction).await;
                    Ok(())
                });
            }
            TransportEvent::Disconnected { .. } => {}
        }
    }

    async fn on_session_start(&self) {
        info!(identity = %self.ctx.transport.own_identity(), "session established");
        if let Err(e) = self.ctx.transport.send_presence().await {
            warn!(error = %e, "initial presence failed");
        }
        let rooms: Vec<String> = self.ctx.config.rooms.keys().cloned().collect();
        for room in rooms {
            if let Err(e) = self.ctx.join_room(&room).await {
                error!(room = %room, error = %e, "could not join room");
            }
        }
        self.host.start(&self.ctx).await;
    }

    async fn on_presence(&self, update: crate::transport::PresenceUpdate) {
        let own_nick = self.ctx.config.nick_for(&update.room);
        if update.nick == own_nick {
            if update.role == Role::None {
                warn!(room = %update.room, "removed from room");
                self.ctx.leave_room(&update.room);
                if self.ctx.config.room(&update.room).auto_rejoin {
                    if let Err(e) = self.ctx.join_room(&update.room).await {
                        error!(room = %update.room, error = %e, "auto-rejoin failed");
                    }
                }
            }
            return;
        }

        match self.ctx.presence.observe(&update) {
            Ok(events) => {
                for event in events {
                    self.host.presence(&self.ctx, &event).await;
                }
            }
            Err(e) => error!(room = %update.room, error = %e, "presence reconciliation failed"),
        }
    }

    /// Plugins flush and their private task groups drain first, then the
    /// shell's own event tasks, then the transport goes away.
    async fn shutdown_sequence(&self) {
        let timeout = Duration::from_secs(self.ctx.config.shutdown_timeout_secs);
        self.host.shutdown(&self.ctx, timeout).await;
        self.ctx.tasks.shutdown(timeout).await;
        if let Err(e) = self.ctx.transport.disconnect().await {
            warn!(error = %e, "disconnect failed");
        }
    }
}

async fn handle_group_message(
    ctx: Arc<BotContext>,
    host: Arc<PluginHost>,
    msg: InboundMessage,
) -> anyhow::Result<()> {
    let room = msg.from.clone();
    if !ctx.is_joined(&room) {
        debug!(room = %room, "message from unjoined room, ignoring");
        return Ok(());
    }
    if msg.encrypted {
        debug!(room = %room, "encrypted message, ignoring");
        return Ok(());
    }
    if msg.nick == ctx.config.nick_for(&room) {
        return Ok(());
    }

    // Bridged messages carry the real sender inside the body; everyone else
    // gets a best-effort identity lookup.
    let (nick, body, jid) = match ctx.unwrap_gateway(&msg.nick, &msg.body) {
        Some((nick, body)) => (nick, body, None),
        None => {
            let jid = ctx
                .transport
                .resolve_identity(&room, &msg.nick)
                .await
                .unwrap_or(None);
            (msg.nick.clone(), msg.body.clone(), jid)
        }
    };

    if ctx.is_ignored(&nick) || jid.as_deref().is_some_and(|j| ctx.is_ignored(j)) {
        debug!(room = %room, nick = %nick, "ignored sender");
        return Ok(());
    }

    if let Some(replace_id) = &msg.replace_id {
        ctx.history.record_correction(&room, &nick, replace_id, &body)?;
        return Ok(());
    }

    if !ctx
        .history
        .record_message(&room, &nick, jid.as_deref(), &msg.id, msg.stanza_id.as_deref(), &body)?
    {
        debug!(room = %room, id = %msg.id, "replayed message, already processed");
        return Ok(());
    }

    if let Some(url) = &msg.oob_url {
        let ext = url.rsplit('.').next().unwrap_or_default().to_lowercase();
        if ctx.config.oob.allows(&ext) {
            ctx.history.record_oob(&room, &nick, jid.as_deref(), &msg.id, url)?;
        }
        let event = FileTransfer {
            room: room.clone(),
            nick: nick.clone(),
            jid: jid.clone(),
            url: url.clone(),
            msg: msg.clone(),
        };
        host.file_transfer(&ctx, &event).await;
    }

    let (clean, quote) = split_quote(&body, msg.reply.as_ref());

    let mut is_command = false;
    if let Some(registry) = ctx.commands.get() {
        let prefix = ctx.config.prefix_for(Some(&room));
        let room_cfg = ctx.config.room(&room);
        let request = DispatchRequest {
            body: &clean,
            prefix: &prefix,
            user_key: cooldown_key(Some(&room), &nick, jid.as_deref()),
            is_admin: jid.as_deref().is_some_and(|j| ctx.config.is_admin(j)),
            disabled: &room_cfg.disabled_commands,
            disabled_plugins: &room_cfg.disabled_plugins,
            whitelist_plugins: room_cfg.whitelist_plugins.as_deref(),
        };
        let invocation = Invocation {
            room: Some(room.clone()),
            nick: nick.clone(),
            jid: jid.clone(),
            args: String::new(),
            quote: quote.clone(),
            msg: msg.clone(),
        };
        let outcome = registry.dispatch(ctx.clone(), request, invocation).await;
        is_command = outcome.matched;
        if let Some(reply) = outcome.reply {
            ctx.send_to_room(&room, &reply, Some(&msg.id)).await?;
        }
    }

    let event = GroupMessage {
        room,
        nick,
        jid,
        body: clean,
        quote,
        is_command,
        msg,
    };
    host.group_message(&ctx, &event).await;
    Ok(())
}

async fn handle_private_message(
    ctx: Arc<BotContext>,
    host: Arc<PluginHost>,
    msg: InboundMessage,
) -> anyhow::Result<()> {
    if msg.encrypted {
        debug!(from = %msg.from, "encrypted private message, ignoring");
        return Ok(());
    }

    // A non-empty nick means a whisper from a room occupant; otherwise the
    // sender is a bare account address.
    let occupant = !msg.nick.is_empty();
    let (nick, jid) = if occupant {
        let jid = ctx
            .transport
            .resolve_identity(&msg.from, &msg.nick)
            .await
            .unwrap_or(None);
        (msg.nick.clone(), jid)
    } else {
        (msg.from.clone(), Some(msg.from.clone()))
    };

    if ctx.is_ignored(&nick) || jid.as_deref().is_some_and(|j| ctx.is_ignored(j)) {
        return Ok(());
    }

    let is_admin = jid.as_deref().is_some_and(|j| ctx.config.is_admin(j));
    let (clean, quote) = split_quote(&msg.body, msg.reply.as_ref());

    if let Some(registry) = ctx.commands.get() {
        let prefix = ctx.config.prefix_for(None);
        let request = DispatchRequest {
            body: &clean,
            prefix: &prefix,
            user_key: cooldown_key(None, &nick, jid.as_deref()),
            is_admin,
            disabled: &[],
            disabled_plugins: &[],
            whitelist_plugins: None,
        };
        let invocation = Invocation {
            room: None,
            nick: nick.clone(),
            jid: jid.clone(),
            args: String::new(),
            quote,
            msg: msg.clone(),
        };
        let outcome = registry.dispatch(ctx.clone(), request, invocation).await;
        if let Some(reply) = outcome.reply {
            if occupant {
                ctx.send_whisper(&msg.from, &nick, &reply).await?;
            } else {
                ctx.send_chat(&msg.from, &reply).await?;
            }
        }
        if outcome.matched {
            return Ok(());
        }
    }

    let event = Whisper {
        from: msg.from.clone(),
        nick,
        body: clean,
        is_admin,
        msg,
    };
    host.whisper(&ctx, &event).await;
    Ok(())
}
