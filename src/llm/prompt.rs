//! Named prompt templates with declared placeholder bindings.
//!
//! Each template is a TOML file in the prompts directory:
//!
//! ```toml
//! inputs = ["text"]
//!
//! [[messages]]
//! role = "system"
//! content = "Rewrite the following in a friendlier tone."
//!
//! [[messages]]
//! role = "user"
//! content = "{text}"
//! ```
//!
//! Bindings are validated against `inputs` before substitution, so a
//! missing input is an error rather than silently malformed prompt text.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, warn};

use super::ChatMessage;

#[derive(Debug, Clone, Deserialize)]
pub struct PromptTemplate {
    /// Placeholder names this template requires, substituted as `{name}`.
    #[serde(default)]
    pub inputs: Vec<String>,
    pub messages: Vec<TemplateMessage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TemplateMessage {
    pub role: String,
    pub content: String,
}

#[derive(Default)]
pub struct PromptLibrary {
    templates: HashMap<String, PromptTemplate>,
}

impl PromptLibrary {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load every `*.toml` in `dir` as a template named after its file stem.
    /// A missing directory is not an error: prompts are optional.
    pub fn load(dir: &Path) -> Result<Self> {
        let mut templates = HashMap::new();
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(_) => {
                debug!(dir = %dir.display(), "no prompts directory, starting empty");
                return Ok(Self::default());
            }
        };
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("toml") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read prompt {}", path.display()))?;
            match toml::from_str::<PromptTemplate>(&raw) {
                Ok(template) => {
                    templates.insert(name.to_string(), template);
                }
                Err(e) => {
                    warn!(prompt = %name, error = %e, "skipping malformed prompt template");
                }
            }
        }
        debug!(count = templates.len(), "prompt templates loaded");
        Ok(Self { templates })
    }

    pub fn insert(&mut self, name: &str, template: PromptTemplate) {
        self.templates.insert(name.to_string(), template);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.templates.contains_key(name)
    }

    /// Render a template into chat messages, substituting `{name}` for each
    /// declared input. Every declared input must be bound.
    pub fn render(
        &self,
        name: &str,
        inputs: &HashMap<String, String>,
    ) -> Result<Vec<ChatMessage>> {
        let template = self
            .templates
            .get(name)
            .with_context(|| format!("prompt {name:?} not found"))?;

        for input in &template.inputs {
            if !inputs.contains_key(input) {
                bail!("prompt {name:?} expects input {input:?}, but it was not provided");
            }
        }

        Ok(template
            .messages
            .iter()
            .map(|m| {
                let mut content = m.content.clone();
                for input in &template.inputs {
                    if let Some(value) = inputs.get(input) {
                        content = content.replace(&format!("{{{input}}}"), value);
                    }
                }
                ChatMessage::new(&m.role, content)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn library() -> PromptLibrary {
        let mut lib = PromptLibrary::empty();
        lib.insert(
            "filter",
            PromptTemplate {
                inputs: vec!["text".into()],
                messages: vec![
                    TemplateMessage {
                        role: "system".into(),
                        content: "Rewrite kindly.".into(),
                    },
                    TemplateMessage {
                        role: "user".into(),
                        content: "{text}".into(),
                    },
                ],
            },
        );
        lib
    }

    #[test]
    fn render_substitutes_bound_inputs() {
        let lib = library();
        let mut inputs = HashMap::new();
        inputs.insert("text".to_string(), "go away".to_string());
        let messages = lib.render("filter", &inputs).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].content, "go away");
    }

    #[test]
    fn missing_binding_is_an_error_before_substitution() {
        let lib = library();
        let err = lib.render("filter", &HashMap::new()).unwrap_err();
        assert!(err.to_string().contains("expects input"));
    }

    #[test]
    fn unknown_prompt_is_an_error() {
        let lib = library();
        assert!(lib.render("nope", &HashMap::new()).is_err());
    }
}
