use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

// ── Top-level config ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Bot account identity on the network (bare JID).
    pub identity: String,
    pub password: Option<String>,
    #[serde(default = "default_nick")]
    pub nick: String,

    /// Bare identities allowed to run admin commands.
    #[serde(default)]
    pub admins: Vec<String>,

    /// Nicknames the bot never reacts to. Extended at runtime from the
    /// persistent ignore list.
    #[serde(default)]
    pub ignored: Vec<String>,

    /// Rooms to join at session start, keyed by room address.
    #[serde(default)]
    pub rooms: HashMap<String, RoomConfig>,

    #[serde(default = "default_prefix")]
    pub default_command_prefix: String,
    #[serde(default = "default_cooldown")]
    pub default_command_cooldown: u64,

    /// Plugins disabled everywhere, not just per-room.
    #[serde(default)]
    pub global_disabled_plugins: Vec<String>,

    #[serde(default = "default_max_history")]
    pub max_history: usize,
    #[serde(default = "default_join_timeout")]
    pub room_join_timeout_secs: u64,

    /// Seconds to wait before reconnecting after a dropped session.
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
    /// Hard cap on graceful shutdown before the process exits anyway.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default)]
    pub suggestions: SuggestionConfig,

    #[serde(default)]
    pub oob: OobConfig,

    /// Relay/bridge wrappers, keyed by the gateway's room nickname.
    #[serde(default)]
    pub gateways: HashMap<String, GatewayPattern>,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Free-form per-plugin settings, passed through to the owning plugin.
    #[serde(default)]
    pub plugins: HashMap<String, toml::Value>,
}

fn default_nick() -> String {
    "mucbot".to_string()
}
fn default_prefix() -> String {
    ".".to_string()
}
fn default_cooldown() -> u64 {
    2
}
fn default_max_history() -> usize {
    100
}
fn default_join_timeout() -> u64 {
    30
}
fn default_reconnect_delay() -> u64 {
    15
}
fn default_shutdown_timeout() -> u64 {
    10
}
fn default_db_path() -> PathBuf {
    PathBuf::from("mucbot.db")
}

// ── Per-room overrides ────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoomConfig {
    /// Room-local nickname override.
    pub nick: Option<String>,
    pub command_prefix: Option<String>,
    #[serde(default)]
    pub disabled_plugins: Vec<String>,
    /// When present, only these plugins run in this room.
    pub whitelist_plugins: Option<Vec<String>>,
    #[serde(default)]
    pub disabled_commands: Vec<String>,
    #[serde(default)]
    pub auto_rejoin: bool,
    /// Swallow all outbound messages to this room.
    #[serde(default)]
    pub silent_mode: bool,
    /// When false, nicknames in outbound bodies are masked with a
    /// zero-width space so clients don't ping the named user.
    #[serde(default = "default_true")]
    pub allow_mentions: bool,
    /// LLM prompt applied to every outbound message for this room.
    pub llm_filter_prompt: Option<String>,
}

fn default_true() -> bool {
    true
}

// ── Command suggestion ────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuggestionConfig {
    /// Offer a fuzzy match when an unknown command name comes in.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Run the best match silently instead of asking for confirmation.
    #[serde(default = "default_true")]
    pub auto_run: bool,
    #[serde(default = "default_suggest_min")]
    pub min_len: usize,
    #[serde(default = "default_suggest_max")]
    pub max_len: usize,
    #[serde(default = "default_suggest_distance")]
    pub max_distance: usize,
}

fn default_suggest_min() -> usize {
    5
}
fn default_suggest_max() -> usize {
    15
}
fn default_suggest_distance() -> usize {
    2
}

impl Default for SuggestionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_run: true,
            min_len: default_suggest_min(),
            max_len: default_suggest_max(),
            max_distance: default_suggest_distance(),
        }
    }
}

// ── Out-of-band attachment storage ────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OobConfig {
    #[serde(default)]
    pub store_links: bool,
    /// Extensions to persist; `*` matches everything.
    #[serde(default)]
    pub extensions: Vec<String>,
}

impl OobConfig {
    pub fn allows(&self, ext: &str) -> bool {
        self.store_links
            && self
                .extensions
                .iter()
                .any(|e| e == "*" || e.eq_ignore_ascii_case(ext))
    }
}

// ── Gateway/relay unwrapping ──────────────────────────────────────

/// A literal message template used by a bridging service, e.g.
/// `"<nick> body"`. The `nick` and `body` placeholders are converted into
/// capture groups once and cached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayPattern {
    pub pattern: String,
    /// Literal substitutions applied to the extracted body.
    #[serde(default)]
    pub replace: HashMap<String, String>,
}

// ── LLM backends ──────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_prompts_dir")]
    pub prompts_dir: PathBuf,
    /// Prompt applied to every outbound message, unless a room overrides it.
    pub filter_prompt: Option<String>,
    pub primary: Option<BackendConfig>,
    pub fallback: Option<BackendConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Base URL of the chat endpoint.
    pub host: String,
    pub model: String,
    pub api_key: Option<String>,
    #[serde(default)]
    pub kind: BackendKind,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// OpenAI-compatible `/v1/chat/completions`.
    #[default]
    OpenAi,
    /// Native Ollama `/api/chat`.
    Ollama,
}

fn default_temperature() -> f64 {
    1.2
}
fn default_max_tokens() -> u32 {
    256
}
fn default_prompts_dir() -> PathBuf {
    PathBuf::from("prompts")
}

// ── Logging ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level: default_log_level(),
        }
    }
}

// ── Loading ───────────────────────────────────────────────────────

impl Config {
    /// Load from a TOML file, then apply `MUCBOT_*` environment overrides.
    /// A missing or unparsable file is fatal; individual missing options
    /// fall back to the serde defaults above.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let mut config: Config = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("MUCBOT_IDENTITY") {
            self.identity = v;
        }
        if let Ok(v) = std::env::var("MUCBOT_PASSWORD") {
            self.password = Some(v);
        }
        if let Ok(v) = std::env::var("MUCBOT_NICK") {
            self.nick = v;
        }
        if let Ok(v) = std::env::var("MUCBOT_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("MUCBOT_ADMINS") {
            self.admins = split_list(&v);
        }
        if let Ok(v) = std::env::var("MUCBOT_IGNORED") {
            self.ignored = split_list(&v);
        }
        if let Ok(v) = std::env::var("MUCBOT_CMD_PREFIX") {
            self.default_command_prefix = v;
        }
        if let Ok(v) = std::env::var("MUCBOT_CMD_COOLDOWN") {
            if let Ok(n) = v.parse() {
                self.default_command_cooldown = n;
            }
        }
        if let Ok(v) = std::env::var("MUCBOT_MAX_HISTORY") {
            if let Ok(n) = v.parse() {
                self.max_history = n;
            }
        }
        if let Ok(v) = std::env::var("MUCBOT_DISABLED_PLUGINS") {
            self.global_disabled_plugins = split_list(&v);
        }
        if let Ok(v) = std::env::var("MUCBOT_LOG_LEVEL") {
            self.logging.level = v;
        }
    }

    pub fn room(&self, room: &str) -> RoomConfig {
        self.rooms.get(room).cloned().unwrap_or_default()
    }

    /// Command prefix for a room, or the global default outside rooms.
    pub fn prefix_for(&self, room: Option<&str>) -> String {
        room.and_then(|r| self.rooms.get(r))
            .and_then(|r| r.command_prefix.clone())
            .unwrap_or_else(|| self.default_command_prefix.clone())
    }

    pub fn nick_for(&self, room: &str) -> String {
        self.rooms
            .get(room)
            .and_then(|r| r.nick.clone())
            .unwrap_or_else(|| self.nick.clone())
    }

    pub fn is_admin(&self, identity: &str) -> bool {
        self.admins.iter().any(|a| a == identity)
    }

    /// Decoded `[plugins.<name>]` table, or the type's defaults when the
    /// section is absent or malformed (malformed sections are logged).
    pub fn plugin_config<T: serde::de::DeserializeOwned + Default>(&self, name: &str) -> T {
        match self.plugins.get(name) {
            Some(value) => match value.clone().try_into() {
                Ok(parsed) => parsed,
                Err(e) => {
                    tracing::warn!(plugin = %name, error = %e, "invalid plugin config, using defaults");
                    T::default()
                }
            },
            None => T::default(),
        }
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
