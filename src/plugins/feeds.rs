//! Periodic feed polling with new-item announcements.
//!
//! Items are matched out of the fetched document with a regex (a sane RSS
//! default is built in) and tracked by link in the store. The first poll of
//! a source only primes the seen set, so adding a feed does not dump its
//! whole backlog into a room.

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::tasks::TaskGroup;
use super::Plugin;
use crate::bot::BotContext;
use crate::config::Config;
use crate::llm::CallOptions;
use crate::util::now_ts;

const NS: &str = "bot_feeds";

const DEFAULT_ITEM_PATTERN: &str = r"(?s)<item>.*?<title>(?:<!\[CDATA\[)?(?P<title>.*?)(?:\]\]>)?</title>.*?<link>(?P<link>.*?)</link>";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FeedsConfig {
    #[serde(default = "default_interval")]
    pub poll_interval_secs: u64,
    #[serde(default)]
    pub sources: Vec<FeedSource>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedSource {
    pub name: String,
    pub url: String,
    pub rooms: Vec<String>,
    /// Override for non-RSS sources; needs `title` and `link` captures.
    #[serde(default)]
    pub item_pattern: Option<String>,
    /// Most announcements per poll; extras are still marked seen.
    #[serde(default = "default_max_items")]
    pub max_items: usize,
    /// Named prompt to reword announcements through.
    #[serde(default)]
    pub llm_prompt: Option<String>,
}

fn default_interval() -> u64 {
    900
}

fn default_max_items() -> usize {
    3
}

pub struct FeedsPlugin {
    poll_interval: Duration,
    sources: Vec<(FeedSource, Regex)>,
    client: reqwest::Client,
    tasks: TaskGroup,
}

impl FeedsPlugin {
    pub fn from_config(config: &Config) -> Self {
        let cfg: FeedsConfig = config.plugin_config("feeds");
        let mut sources = Vec::new();
        for source in cfg.sources {
            let pattern = source
                .item_pattern
                .as_deref()
                .unwrap_or(DEFAULT_ITEM_PATTERN);
            match Regex::new(pattern) {
                Ok(re) if re.capture_names().flatten().any(|n| n == "title")
                    && re.capture_names().flatten().any(|n| n == "link") =>
                {
                    sources.push((source, re));
                }
                Ok(_) => {
                    warn!(feed = %source.name, "item pattern lacks title/link captures, skipping feed");
                }
                Err(e) => {
                    warn!(feed = %source.name, error = %e, "invalid item pattern, skipping feed");
                }
            }
        }
        Self {
            poll_interval: Duration::from_secs(cfg.poll_interval_secs.max(60)),
            sources,
            client: reqwest::Client::new(),
            tasks: TaskGroup::new(),
        }
    }
}

/// (title, link) pairs in document order, deduplicated by link.
fn extract_items(re: &Regex, body: &str) -> Vec<(String, String)> {
    let mut seen = std::collections::HashSet::new();
    re.captures_iter(body)
        .filter_map(|caps| {
            let title = caps.name("title")?.as_str().trim().to_string();
            let link = caps.name("link")?.as_str().trim().to_string();
            if link.is_empty() || !seen.insert(link.clone()) {
                return None;
            }
            Some((title, link))
        })
        .collect()
}

async fn poll_source(
    ctx: &Arc<BotContext>,
    client: &reqwest::Client,
    source: &FeedSource,
    re: &Regex,
) -> anyhow::Result<()> {
    let body = client
        .get(&source.url)
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?;
    let items = extract_items(re, &body);
    if items.is_empty() {
        debug!(feed = %source.name, "no items matched");
        return Ok(());
    }

    let known = ctx.store.get_all_fields(NS, &source.name)?;
    let priming = known.is_empty();
    let mut announced = 0usize;

    for (title, link) in items {
        if known.contains_key(&link) {
            continue;
        }
        ctx.store
            .set(NS, &source.name, &link, &now_ts().to_string())?;
        if priming || announced >= source.max_items {
            continue;
        }
        announced += 1;

        let mut text = format!("{}: {title} {link}", source.name);
        if let (Some(prompt), Some(llm)) = (&source.llm_prompt, &ctx.llm) {
            if llm.has_prompt(prompt) {
                let mut inputs = HashMap::new();
                inputs.insert("text".to_string(), text.clone());
                if let Ok(reworded) = llm.send_prompt(prompt, &inputs, &CallOptions::default()).await {
                    text = reworded;
                }
            }
        }
        for room in &source.rooms {
            ctx.send_to_room(room, &text, None).await?;
        }
    }

    if priming {
        info!(feed = %source.name, "feed primed, backlog recorded without announcing");
    }
    Ok(())
}

#[async_trait]
impl Plugin for FeedsPlugin {
    fn name(&self) -> &'static str {
        "feeds"
    }

    fn tasks(&self) -> Option<&TaskGroup> {
        Some(&self.tasks)
    }

    async fn start(&self, ctx: Arc<BotContext>) -> anyhow::Result<()> {
        for (source, re) in &self.sources {
            let ctx = ctx.clone();
            let client = self.client.clone();
            let source = source.clone();
            let re = re.clone();
            self.tasks.spawn_periodic("feed_poll", self.poll_interval, move || {
                let ctx = ctx.clone();
                let client = client.clone();
                let source = source.clone();
                let re = re.clone();
                async move { poll_source(&ctx, &client, &source, &re).await }
            });
        }
        if !self.sources.is_empty() {
            info!(count = self.sources.len(), "feed polling started");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RSS: &str = r#"<rss><channel>
<item><title>First post</title><link>https://example.org/1</link></item>
<item><title><![CDATA[Second <b>post</b>]]></title><link>https://example.org/2</link></item>
<item><title>Duplicate</title><link>https://example.org/1</link></item>
</channel></rss>"#;

    #[test]
    fn default_pattern_extracts_rss_items() {
        let re = Regex::new(DEFAULT_ITEM_PATTERN).unwrap();
        let items = extract_items(&re, RSS);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0], ("First post".to_string(), "https://example.org/1".to_string()));
        assert_eq!(items[1].0, "Second <b>post</b>");
    }

    #[test]
    fn patterns_without_captures_are_rejected() {
        let re = Regex::new("<item>").unwrap();
        assert!(!re.capture_names().flatten().any(|n| n == "title"));
    }
}
