//! Prefixed command parsing, lookup and rate limiting.
//!
//! The registry canonicalizes aliases at registration time, suggests a close
//! command name for near-miss words, and enforces per-user cooldowns that
//! are coupled across commands sharing a category (running one command in a
//! category counts against its siblings, but only the command actually run
//! has its own timestamp refreshed). Every command carries its owning
//! plugin, so rooms that disable or whitelist plugins gate those plugins'
//! commands as well as their event hooks.

use futures_util::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::config::SuggestionConfig;
use crate::transport::InboundMessage;
use crate::util::now_ts;

pub type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<Option<String>>> + Send>>;
pub type Handler<C> = Arc<dyn Fn(C, Invocation) -> HandlerFuture + Send + Sync>;

/// Everything a handler gets to know about the triggering message.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Room address for groupchat commands, `None` for direct messages.
    pub room: Option<String>,
    pub nick: String,
    pub jid: Option<String>,
    /// Remainder of the body after the command word, trimmed.
    pub args: String,
    /// Quoted text stripped from the body, when the message was a reply.
    pub quote: Option<String>,
    pub msg: InboundMessage,
}

pub struct CommandSpec<C> {
    pub name: String,
    pub aliases: Vec<String>,
    pub help: String,
    /// Owning plugin; checked against per-room plugin gating.
    pub plugin: &'static str,
    pub category: Option<&'static str>,
    pub admin_only: bool,
    /// Left out of help listings; still runs when called by name.
    pub hidden: bool,
    /// Per-command cooldown override in seconds.
    pub cooldown: Option<u64>,
    handler: Handler<C>,
}

impl<C> CommandSpec<C> {
    pub fn new<F, Fut>(name: &str, help: &str, handler: F) -> Self
    where
        F: Fn(C, Invocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<String>>> + Send + 'static,
    {
        Self {
            name: name.to_string(),
            aliases: Vec::new(),
            help: help.to_string(),
            plugin: "",
            category: None,
            admin_only: false,
            hidden: false,
            cooldown: None,
            handler: Arc::new(move |ctx, inv| {
                let fut: HandlerFuture = Box::pin(handler(ctx, inv));
                fut
            }),
        }
    }

    pub fn aliases(mut self, aliases: &[&str]) -> Self {
        self.aliases = aliases.iter().map(|a| (*a).to_string()).collect();
        self
    }

    pub fn plugin(mut self, plugin: &'static str) -> Self {
        self.plugin = plugin;
        self
    }

    pub fn category(mut self, category: &'static str) -> Self {
        self.category = Some(category);
        self
    }

    pub fn admin_only(mut self) -> Self {
        self.admin_only = true;
        self
    }

    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    pub fn cooldown(mut self, seconds: u64) -> Self {
        self.cooldown = Some(seconds);
        self
    }
}

/// Dispatch parameters that depend on where the message came from.
pub struct DispatchRequest<'a> {
    pub body: &'a str,
    pub prefix: &'a str,
    /// Cooldown bucket for the sender, see [`cooldown_key`].
    pub user_key: String,
    pub is_admin: bool,
    /// Command names disabled in this room.
    pub disabled: &'a [String],
    /// Plugins disabled in this room; their commands are dropped too.
    pub disabled_plugins: &'a [String],
    /// When set, only these plugins' commands run in this room.
    pub whitelist_plugins: Option<&'a [String]>,
}

#[derive(Debug, Default)]
pub struct DispatchOutcome {
    /// Whether the body addressed a known command (even if rate limited).
    pub matched: bool,
    pub reply: Option<String>,
}

impl DispatchOutcome {
    fn silent(matched: bool) -> Self {
        Self {
            matched,
            reply: None,
        }
    }
}

/// Cooldowns are tracked per room occupant where the room is known, and per
/// bare identity for direct messages.
pub fn cooldown_key(room: Option<&str>, nick: &str, jid: Option<&str>) -> String {
    match room {
        Some(room) => format!("{room}/{nick}"),
        None => jid.unwrap_or(nick).to_string(),
    }
}

/// `strip_prefix` with ASCII case folding, so alphabetic prefixes match no
/// matter how the sender typed them.
fn strip_prefix_fold<'a>(body: &'a str, prefix: &str) -> Option<&'a str> {
    let mut rest = body;
    for expected in prefix.chars() {
        let c = rest.chars().next()?;
        if !c.eq_ignore_ascii_case(&expected) {
            return None;
        }
        rest = &rest[c.len_utf8()..];
    }
    Some(rest)
}

pub struct Registry<C> {
    commands: Vec<CommandSpec<C>>,
    lookup: HashMap<String, usize>,
    /// (user key, command name) -> last successful run, epoch seconds.
    cooldowns: Mutex<HashMap<(String, String), i64>>,
    default_cooldown: u64,
    suggestions: SuggestionConfig,
}

impl<C: Clone> Registry<C> {
    pub fn new(default_cooldown: u64, suggestions: SuggestionConfig) -> Self {
        Self {
            commands: Vec::new(),
            lookup: HashMap::new(),
            cooldowns: Mutex::new(HashMap::new()),
            default_cooldown,
            suggestions,
        }
    }

    /// Register a command under its name and all aliases. On a collision the
    /// earlier binding wins.
    pub fn register(&mut self, spec: CommandSpec<C>) {
        let idx = self.commands.len();
        for alias in std::iter::once(spec.name.clone()).chain(spec.aliases.iter().cloned()) {
            match self.lookup.entry(alias) {
                std::collections::hash_map::Entry::Vacant(e) => {
                    e.insert(idx);
                }
                std::collections::hash_map::Entry::Occupied(e) => {
                    warn!(
                        alias = %e.key(),
                        existing = %self.commands[*e.get()].name,
                        rejected = %spec.name,
                        "command alias collision, keeping earlier binding"
                    );
                }
            }
        }
        self.commands.push(spec);
    }

    pub fn specs(&self) -> &[CommandSpec<C>] {
        &self.commands
    }

    pub fn resolve(&self, word: &str) -> Option<&CommandSpec<C>> {
        self.lookup.get(word).map(|&idx| &self.commands[idx])
    }

    /// Parse and run a command out of `body`, if it carries one.
    pub async fn dispatch(
        &self,
        ctx: C,
        req: DispatchRequest<'_>,
        mut invocation: Invocation,
    ) -> DispatchOutcome {
        let Some(rest) = strip_prefix_fold(req.body.trim(), req.prefix) else {
            return DispatchOutcome::silent(false);
        };
        let mut parts = rest.trim_start().splitn(2, char::is_whitespace);
        let word = parts.next().unwrap_or("").trim().to_lowercase();
        invocation.args = parts.next().unwrap_or("").trim().to_string();
        if word.is_empty() {
            return DispatchOutcome::silent(false);
        }

        match self.lookup.get(word.as_str()) {
            Some(&idx) => self.run_checked(idx, ctx, &req, invocation).await,
            None => self.suggest(&word, ctx, req, invocation).await,
        }
    }

    /// Per-room gating for one command: its own disabled list, then its
    /// plugin's disabled list, then the plugin whitelist.
    fn permitted(spec: &CommandSpec<C>, req: &DispatchRequest<'_>) -> bool {
        if req.disabled.iter().any(|d| d == &spec.name) {
            return false;
        }
        if spec.plugin.is_empty() {
            return true;
        }
        if req.disabled_plugins.iter().any(|p| p == spec.plugin) {
            return false;
        }
        if let Some(whitelist) = req.whitelist_plugins {
            return whitelist.iter().any(|p| p == spec.plugin);
        }
        true
    }

    async fn run_checked(
        &self,
        idx: usize,
        ctx: C,
        req: &DispatchRequest<'_>,
        invocation: Invocation,
    ) -> DispatchOutcome {
        let spec = &self.commands[idx];
        if !Self::permitted(spec, req) {
            debug!(command = %spec.name, plugin = spec.plugin, "command not permitted here, ignoring");
            return DispatchOutcome::silent(false);
        }
        // Unauthorized admin commands are dropped without a reply, so the
        // command set is not discoverable by probing.
        if spec.admin_only && !req.is_admin {
            debug!(command = %spec.name, user = %req.user_key, "admin command from non-admin, ignoring");
            return DispatchOutcome::silent(false);
        }

        let cooldown = spec.cooldown.unwrap_or(self.default_cooldown) as i64;
        if cooldown > 0 {
            let mut cooldowns = self.cooldowns.lock();
            let now = now_ts();
            let (last, from_sibling) =
                self.effective_last_used(&cooldowns, &req.user_key, spec);
            let elapsed = now - last;
            if elapsed < cooldown {
                let remaining = cooldown - elapsed + 1;
                debug!(command = %spec.name, user = %req.user_key, remaining, "command on cooldown");
                let reply = match (from_sibling, spec.category) {
                    (true, Some(category)) => format!(
                        "Commands of category '{category}' are on cooldown. Try again in {remaining} second(s)."
                    ),
                    _ => format!(
                        "Command '{}' is on cooldown. Try again in {remaining} second(s).",
                        spec.name
                    ),
                };
                return DispatchOutcome {
                    matched: true,
                    reply: Some(reply),
                };
            }
            cooldowns.insert((req.user_key.clone(), spec.name.clone()), now);
        }

        debug!(command = %spec.name, user = %req.user_key, "running command");
        let reply = match AssertUnwindSafe((spec.handler)(ctx, invocation))
            .catch_unwind()
            .await
        {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                error!(command = %spec.name, error = %e, "command failed");
                None
            }
            Err(_) => {
                error!(command = %spec.name, "command panicked");
                None
            }
        };
        DispatchOutcome {
            matched: true,
            reply,
        }
    }

    /// Timestamp a cooldown check compares against: the user's own last run
    /// of this command, or of any command sharing its category, whichever is
    /// later. The flag says whether a sibling supplied it, which decides how
    /// the cooldown notice is attributed.
    fn effective_last_used(
        &self,
        cooldowns: &HashMap<(String, String), i64>,
        user_key: &str,
        spec: &CommandSpec<C>,
    ) -> (i64, bool) {
        let own = cooldowns
            .get(&(user_key.to_string(), spec.name.clone()))
            .copied()
            .unwrap_or(0);
        let Some(category) = spec.category else {
            return (own, false);
        };
        let sibling = self
            .commands
            .iter()
            .filter(|c| c.category == Some(category) && c.name != spec.name)
            .filter_map(|c| cooldowns.get(&(user_key.to_string(), c.name.clone())))
            .copied()
            .max()
            .unwrap_or(0);
        if sibling > own {
            (sibling, true)
        } else {
            (own, false)
        }
    }

    async fn suggest(
        &self,
        word: &str,
        ctx: C,
        req: DispatchRequest<'_>,
        invocation: Invocation,
    ) -> DispatchOutcome {
        let cfg = &self.suggestions;
        let len = word.chars().count();
        if !cfg.enabled || len < cfg.min_len || len > cfg.max_len {
            return DispatchOutcome::silent(false);
        }

        let mut best: Option<(usize, usize)> = None;
        for (idx, spec) in self.commands.iter().enumerate() {
            if spec.hidden || (spec.admin_only && !req.is_admin) {
                continue;
            }
            if !Self::permitted(spec, &req) {
                continue;
            }
            for candidate in std::iter::once(spec.name.as_str())
                .chain(spec.aliases.iter().map(String::as_str))
            {
                let distance = levenshtein(word, candidate);
                if distance > cfg.max_distance || distance >= candidate.chars().count() {
                    continue;
                }
                if best.map_or(true, |(_, d)| distance < d) {
                    best = Some((idx, distance));
                }
            }
        }

        let Some((idx, distance)) = best else {
            return DispatchOutcome::silent(false);
        };
        let name = self.commands[idx].name.as_str();
        debug!(word, suggestion = name, distance, "suggesting near-miss command");
        if cfg.auto_run {
            self.run_checked(idx, ctx, &req, invocation).await
        } else {
            DispatchOutcome {
                matched: false,
                reply: Some(format!("Did you mean {}{}?", req.prefix, name)),
            }
        }
    }
}

/// Edit distance between two words, for command suggestions.
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::InboundMessage;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn invocation() -> Invocation {
        Invocation {
            room: Some("room".to_string()),
            nick: "alice".to_string(),
            jid: None,
            args: String::new(),
            quote: None,
            msg: InboundMessage::groupchat("room", "alice", "m1", ".status"),
        }
    }

    fn request(body: &str) -> DispatchRequest<'_> {
        DispatchRequest {
            body,
            prefix: ".",
            user_key: "room/alice".to_string(),
            is_admin: false,
            disabled: &[],
            disabled_plugins: &[],
            whitelist_plugins: None,
        }
    }

    fn counting_spec(
        name: &'static str,
        calls: Arc<AtomicUsize>,
    ) -> CommandSpec<()> {
        CommandSpec::new(name, "test command", move |_ctx, _inv| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Some("done".to_string()))
            }
        })
    }

    fn registry() -> (Registry<()>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = Registry::new(2, SuggestionConfig::default());
        registry.register(counting_spec("status", calls.clone()).aliases(&["stat"]));
        (registry, calls)
    }

    #[tokio::test]
    async fn second_invocation_hits_cooldown() {
        let (registry, calls) = registry();

        let first = registry.dispatch((), request(".status"), invocation()).await;
        assert!(first.matched);
        assert_eq!(first.reply.as_deref(), Some("done"));

        let second = registry.dispatch((), request(".status"), invocation()).await;
        assert!(second.matched);
        assert_eq!(
            second.reply.as_deref(),
            Some("Command 'status' is on cooldown. Try again in 3 second(s).")
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn alias_resolves_to_the_same_command() {
        let (registry, calls) = registry();
        let out = registry.dispatch((), request(".stat"), invocation()).await;
        assert!(out.matched);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // alias and canonical name share one cooldown bucket
        let again = registry.dispatch((), request(".status"), invocation()).await;
        assert_eq!(
            again.reply.as_deref(),
            Some("Command 'status' is on cooldown. Try again in 3 second(s).")
        );
    }

    #[tokio::test]
    async fn category_cooldowns_attribute_the_notice() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = Registry::new(2, SuggestionConfig::default());
        registry.register(counting_spec("roll", calls.clone()).category("games"));
        registry.register(counting_spec("flip", calls.clone()).category("games"));
        registry.register(counting_spec("ping", calls.clone()));

        registry.dispatch((), request(".roll"), invocation()).await;

        // blocked by the sibling's timestamp: attributed to the category
        let sibling = registry.dispatch((), request(".flip"), invocation()).await;
        assert_eq!(
            sibling.reply.as_deref(),
            Some("Commands of category 'games' are on cooldown. Try again in 3 second(s).")
        );

        // blocked by its own timestamp: attributed to the command itself
        let own = registry.dispatch((), request(".roll"), invocation()).await;
        assert_eq!(
            own.reply.as_deref(),
            Some("Command 'roll' is on cooldown. Try again in 3 second(s).")
        );

        // an uncategorized command is unaffected
        let other = registry.dispatch((), request(".ping"), invocation()).await;
        assert_eq!(other.reply.as_deref(), Some("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn disabled_plugin_commands_are_dropped_silently() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = Registry::new(0, SuggestionConfig::default());
        registry.register(counting_spec("echo", calls.clone()).plugin("debug"));

        let disabled_plugins = vec!["debug".to_string()];
        let mut req = request(".echo hi");
        req.is_admin = true;
        req.disabled_plugins = &disabled_plugins;
        let out = registry.dispatch((), req, invocation()).await;
        assert!(!out.matched);
        assert!(out.reply.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn plugin_whitelist_gates_commands() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = Registry::new(0, SuggestionConfig::default());
        registry.register(counting_spec("seen", calls.clone()).plugin("last_seen"));
        registry.register(counting_spec("tell", calls.clone()).plugin("post_office"));

        let whitelist = vec!["last_seen".to_string()];
        let mut req = request(".tell bob hi");
        req.whitelist_plugins = Some(&whitelist);
        let out = registry.dispatch((), req, invocation()).await;
        assert!(!out.matched);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let mut req = request(".seen bob");
        req.whitelist_plugins = Some(&whitelist);
        let out = registry.dispatch((), req, invocation()).await;
        assert!(out.matched);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn prefix_matches_case_insensitively() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = Registry::new(0, SuggestionConfig::default());
        registry.register(counting_spec("status", calls.clone()));

        let mut req = request("BOT: STATUS");
        req.prefix = "bot:";
        let out = registry.dispatch((), req, invocation()).await;
        assert!(out.matched);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn any_whitespace_separates_the_command_word() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = Registry::new(0, SuggestionConfig::default());
        registry.register(CommandSpec::new("status", "test", move |_ctx, inv: Invocation| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Some(inv.args))
            }
        }));

        let out = registry.dispatch((), request(".status\tverbose"), invocation()).await;
        assert!(out.matched);
        assert_eq!(out.reply.as_deref(), Some("verbose"));
    }

    #[tokio::test]
    async fn near_miss_gets_a_suggestion_within_length_bounds() {
        let calls = Arc::new(AtomicUsize::new(0));
        let suggestions = SuggestionConfig {
            auto_run: false,
            ..SuggestionConfig::default()
        };
        let mut registry = Registry::new(2, suggestions);
        registry.register(counting_spec("status", calls.clone()).aliases(&["stat"]));

        // too short for the suggestion machinery
        let short = registry.dispatch((), request(".hlep"), invocation()).await;
        assert!(!short.matched);
        assert!(short.reply.is_none());

        let close = registry.dispatch((), request(".statu"), invocation()).await;
        assert!(!close.matched);
        assert_eq!(close.reply.as_deref(), Some("Did you mean .status?"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn auto_run_suggestion_executes_the_command() {
        let calls = Arc::new(AtomicUsize::new(0));
        let suggestions = SuggestionConfig {
            auto_run: true,
            ..SuggestionConfig::default()
        };
        let mut registry = Registry::new(0, suggestions);
        registry.register(counting_spec("status", calls.clone()));

        let out = registry.dispatch((), request(".statsu"), invocation()).await;
        assert!(out.matched);
        assert_eq!(out.reply.as_deref(), Some("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn admin_command_from_non_admin_is_dropped_silently() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = Registry::new(2, SuggestionConfig::default());
        registry.register(counting_spec("shutdown", calls.clone()).admin_only());

        let out = registry.dispatch((), request(".shutdown"), invocation()).await;
        assert!(!out.matched);
        assert!(out.reply.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        // no cooldown was consumed by the rejected attempt
        let mut admin_req = request(".shutdown");
        admin_req.is_admin = true;
        let out = registry.dispatch((), admin_req, invocation()).await;
        assert_eq!(out.reply.as_deref(), Some("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn handler_errors_are_contained() {
        let mut registry: Registry<()> = Registry::new(0, SuggestionConfig::default());
        registry.register(CommandSpec::new("boom", "always fails", |_ctx, _inv| async {
            anyhow::bail!("nope")
        }));

        let out = registry.dispatch((), request(".boom"), invocation()).await;
        assert!(out.matched);
        assert!(out.reply.is_none());
    }

    #[test]
    fn levenshtein_basics() {
        assert_eq!(levenshtein("status", "status"), 0);
        assert_eq!(levenshtein("statu", "status"), 1);
        assert_eq!(levenshtein("hlep", "help"), 2);
        assert_eq!(levenshtein("", "abc"), 3);
    }

    #[test]
    fn cooldown_keys_are_per_room_occupant() {
        assert_eq!(cooldown_key(Some("room"), "alice", None), "room/alice");
        assert_eq!(
            cooldown_key(None, "alice", Some("alice@example.org")),
            "alice@example.org"
        );
    }
}
