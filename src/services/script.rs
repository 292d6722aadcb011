use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use super::{Script, ScriptProvider};
use crate::config::ScriptTemplates;
use crate::error::{PipelineError, Result};
use crate::model::ContentItem;

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([a-z_][a-z0-9_]*)\}").expect("valid placeholder regex"));

/// Fills the configured templates from an item's label and attributes. A
/// placeholder the item has no value for is a validation failure.
#[derive(Debug, Clone)]
pub struct TemplateScriptProvider {
    templates: ScriptTemplates,
}

impl TemplateScriptProvider {
    pub fn new(templates: ScriptTemplates) -> Self {
        Self { templates }
    }
}

fn render(template: &str, item: &ContentItem) -> Result<String> {
    let mut missing = None;
    let out = PLACEHOLDER.replace_all(template, |caps: &Captures| {
        let key = &caps[1];
        let value = match key {
            "label" => Some(item.label.as_str()),
            "id" => Some(item.id.as_str()),
            _ => item.attributes.get(key).map(String::as_str),
        };
        match value {
            Some(v) if !v.trim().is_empty() => v.to_string(),
            _ => {
                missing.get_or_insert_with(|| key.to_string());
                String::new()
            }
        }
    });
    if let Some(key) = missing {
        return Err(PipelineError::Validation(format!(
            "item {} has no value for {{{key}}}",
            item.id
        )));
    }
    Ok(out.trim().to_string())
}

#[async_trait]
impl ScriptProvider for TemplateScriptProvider {
    async fn generate_script(&self, item: &ContentItem) -> Result<Script> {
        Ok(Script {
            text: render(&self.templates.text, item)?,
            title: render(&self.templates.title, item)?,
            caption: render(&self.templates.caption, item)?,
        })
    }
}
