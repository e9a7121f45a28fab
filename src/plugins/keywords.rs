//! Configured trigger phrases with canned (or reworded) responses.
//!
//! Bodies are normalized before matching: lowercased, punctuation dropped
//! and stretched letters squeezed, so "HEYYYY!!" still matches a "hey"
//! trigger. Exact rules compare the whole normalized body, the rest match
//! on containment.

use async_trait::async_trait;
use rand::Rng;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use super::{EventKind, GroupMessage, Plugin};
use crate::bot::BotContext;
use crate::config::Config;
use crate::llm::CallOptions;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct KeywordsConfig {
    #[serde(default)]
    pub rules: Vec<KeywordRule>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KeywordRule {
    pub triggers: Vec<String>,
    #[serde(default)]
    pub responses: Vec<String>,
    /// Probability of acting when a trigger matches.
    #[serde(default = "default_chance")]
    pub chance: f64,
    /// Match the whole normalized body instead of a substring.
    #[serde(default)]
    pub exact: bool,
    /// Answer in a private message instead of the room.
    #[serde(default)]
    pub dm: bool,
    /// Emoji reaction to attach to the triggering message.
    #[serde(default)]
    pub react: Option<String>,
    /// Named prompt to reword the response through before sending.
    #[serde(default)]
    pub llm_prompt: Option<String>,
}

fn default_chance() -> f64 {
    1.0
}

pub struct KeywordsPlugin {
    config: KeywordsConfig,
}

impl KeywordsPlugin {
    pub fn from_config(config: &Config) -> Self {
        let config: KeywordsConfig = config.plugin_config("keywords");
        Self { config }
    }
}

/// Lowercase, strip everything but letters, digits and spaces, squeeze
/// stretched letters down to doubles and whitespace runs to one space.
pub fn normalize(body: &str) -> String {
    let mut out = String::with_capacity(body.len());
    let mut last: Option<char> = None;
    let mut run = 0usize;
    for c in body.chars().flat_map(char::to_lowercase) {
        let c = if c.is_whitespace() { ' ' } else { c };
        if !c.is_alphanumeric() && c != ' ' {
            continue;
        }
        if last == Some(c) {
            run += 1;
            if c == ' ' || run >= 2 {
                continue;
            }
        } else {
            run = 0;
        }
        out.push(c);
        last = Some(c);
    }
    out.trim().to_string()
}

fn rule_matches(rule: &KeywordRule, normalized: &str) -> bool {
    rule.triggers.iter().any(|t| {
        let trigger = normalize(t);
        if trigger.is_empty() {
            return false;
        }
        if rule.exact {
            normalized == trigger
        } else {
            normalized.contains(&trigger)
        }
    })
}

#[async_trait]
impl Plugin for KeywordsPlugin {
    fn name(&self) -> &'static str {
        "keywords"
    }

    fn interests(&self) -> &'static [EventKind] {
        &[EventKind::GroupMessage]
    }

    async fn on_group_message(
        &self,
        ctx: Arc<BotContext>,
        event: &GroupMessage,
    ) -> anyhow::Result<()> {
        if event.is_command {
            return Ok(());
        }
        let normalized = normalize(&event.body);
        if normalized.is_empty() {
            return Ok(());
        }

        for rule in &self.config.rules {
            if !rule_matches(rule, &normalized) {
                continue;
            }
            if rule.chance < 1.0 && !rand::rng().random_bool(rule.chance.clamp(0.0, 1.0)) {
                debug!(room = %event.room, "keyword matched but chance roll failed");
                continue;
            }

            if let Some(emoji) = &rule.react {
                ctx.react(&event.room, &event.msg.id, emoji).await?;
            }

            if rule.responses.is_empty() {
                continue;
            }
            let pick = rand::rng().random_range(0..rule.responses.len());
            let mut response = rule.responses[pick].replace("{nick}", &event.nick);

            if let (Some(prompt), Some(llm)) = (&rule.llm_prompt, &ctx.llm) {
                if llm.has_prompt(prompt) {
                    let mut inputs = HashMap::new();
                    inputs.insert("text".to_string(), response.clone());
                    inputs.insert("nick".to_string(), event.nick.clone());
                    if let Ok(reworded) = llm
                        .send_prompt(prompt, &inputs, &CallOptions::default())
                        .await
                    {
                        response = reworded;
                    }
                }
            }

            if rule.dm {
                ctx.send_whisper(&event.room, &event.nick, &response).await?;
            } else {
                ctx.send_to_room(&event.room, &response, None).await?;
            }
            // one response per message
            break;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(triggers: &[&str], exact: bool) -> KeywordRule {
        KeywordRule {
            triggers: triggers.iter().map(|t| t.to_string()).collect(),
            responses: vec!["hi".to_string()],
            chance: 1.0,
            exact,
            dm: false,
            react: None,
            llm_prompt: None,
        }
    }

    #[test]
    fn normalize_squeezes_noise() {
        assert_eq!(normalize("HEYYYY!!!"), "heyy");
        assert_eq!(normalize("hello,   world"), "hello world");
        assert_eq!(normalize("good    morning"), "good morning");
        // doubled letters survive, longer runs collapse
        assert_eq!(normalize("yelllow"), "yellow");
    }

    #[test]
    fn containment_and_exact_matching() {
        let contains = rule(&["good bot"], false);
        assert!(rule_matches(&contains, &normalize("such a good bot!")));
        assert!(!rule_matches(&contains, &normalize("bad bot")));

        let exact = rule(&["ping"], true);
        assert!(rule_matches(&exact, &normalize("PING!")));
        assert!(!rule_matches(&exact, &normalize("ping me later")));
    }

    #[test]
    fn empty_trigger_never_matches() {
        let empty = rule(&["!!!"], false);
        assert!(!rule_matches(&empty, "anything"));
    }
}
