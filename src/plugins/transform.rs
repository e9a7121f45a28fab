//! Text transform commands discovered from the prompt library.
//!
//! Every `<style>_filter.toml` prompt turns into a `<style>` command that
//! rewrites its arguments, or the quoted message when invoked as a reply.
//! All transforms share one cooldown category so they cannot be chained to
//! spam a room.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use super::Plugin;
use crate::bot::BotContext;
use crate::commands::{CommandSpec, Invocation, Registry};
use crate::config::Config;
use crate::llm::CallOptions;

const PROMPT_SUFFIX: &str = "_filter";
const COOLDOWN_SECS: u64 = 30;

pub struct TransformPlugin {
    styles: Vec<String>,
}

/// Styles for which a `<style>_filter.toml` prompt exists in `dir`.
fn discover_styles(dir: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut styles: Vec<String> = entries
        .flatten()
        .filter_map(|entry| {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("toml") {
                return None;
            }
            let stem = path.file_stem()?.to_str()?;
            let style = stem.strip_suffix(PROMPT_SUFFIX)?;
            (!style.is_empty()).then(|| style.to_string())
        })
        .collect();
    styles.sort_unstable();
    styles
}

impl TransformPlugin {
    pub fn from_config(config: &Config) -> Self {
        if !config.llm.enabled || config.llm.primary.is_none() {
            debug!("no language backend configured, transforms disabled");
            return Self { styles: Vec::new() };
        }
        let styles = discover_styles(&config.llm.prompts_dir);
        if !styles.is_empty() {
            info!(count = styles.len(), "transform styles discovered");
        }
        Self { styles }
    }
}

#[async_trait]
impl Plugin for TransformPlugin {
    fn name(&self) -> &'static str {
        "transform"
    }

    fn register_commands(&self, registry: &mut Registry<Arc<BotContext>>) {
        for style in &self.styles {
            let prompt = format!("{style}{PROMPT_SUFFIX}");
            registry.register(
                CommandSpec::new(
                    style,
                    "Rewrite text in this style: <text>, or reply to a message",
                    move |ctx, inv| transform(ctx, inv, prompt.clone()),
                )
                .plugin("transform")
                .category("transform")
                .cooldown(COOLDOWN_SECS),
            );
        }
    }
}

async fn transform(
    ctx: Arc<BotContext>,
    inv: Invocation,
    prompt: String,
) -> anyhow::Result<Option<String>> {
    let Some(llm) = &ctx.llm else {
        return Ok(None);
    };
    // the quoted message stands in when the command carries no text
    let text = if inv.args.is_empty() {
        inv.quote.clone().unwrap_or_default()
    } else {
        inv.args.clone()
    };
    if text.is_empty() {
        return Ok(Some(
            "Usage: give me some text, or reply to a message.".to_string(),
        ));
    }

    let mut inputs = HashMap::new();
    inputs.insert("text".to_string(), text);
    let out = llm.send_prompt(&prompt, &inputs, &CallOptions::default()).await?;
    Ok(Some(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn styles_come_from_filter_prompt_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("uwu_filter.toml"), "messages = []").unwrap();
        std::fs::write(dir.path().join("pirate_filter.toml"), "messages = []").unwrap();
        std::fs::write(dir.path().join("chat.toml"), "messages = []").unwrap();
        std::fs::write(dir.path().join("_filter.toml"), "messages = []").unwrap();
        std::fs::write(dir.path().join("notes_filter.txt"), "").unwrap();

        let styles = discover_styles(dir.path());
        assert_eq!(styles, vec!["pirate".to_string(), "uwu".to_string()]);
    }

    #[test]
    fn missing_prompts_dir_means_no_styles() {
        assert!(discover_styles(Path::new("/nonexistent/prompts")).is_empty());
    }

    #[test]
    fn discovered_styles_register_as_commands() {
        let plugin = TransformPlugin {
            styles: vec!["uwu".to_string()],
        };
        let mut registry: Registry<Arc<BotContext>> =
            Registry::new(2, crate::config::SuggestionConfig::default());
        plugin.register_commands(&mut registry);

        let spec = registry.resolve("uwu").expect("command registered");
        assert_eq!(spec.plugin, "transform");
        assert_eq!(spec.category, Some("transform"));
        assert_eq!(spec.cooldown, Some(COOLDOWN_SECS));
    }
}
