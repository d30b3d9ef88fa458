//! Declarative event → task rules.
//!
//! ```toml
//! [[rules]]
//! name = "lint-failures"
//! trigger = { type = "ci_status", field = "check_name", pattern = "lint|clippy" }
//! action = { template = "Fix {check_name} on PR #{pr_number}", priority = "high" }
//! ```

use std::path::Path;

use cn_core::types::{ExternalEvent, NewTask, PayloadValue, Rule, TaskKind};
use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum RulesError {
    #[error("failed to read rules file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse rules file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("rule '{rule}' has an invalid pattern: {source}")]
    InvalidPattern {
        rule: String,
        #[source]
        source: regex::Error,
    },
}

#[derive(Debug, Default, Deserialize)]
struct RulesFile {
    #[serde(default)]
    rules: Vec<Rule>,
}

#[derive(Debug)]
struct CompiledRule {
    rule: Rule,
    pattern: Option<Regex>,
}

/// Enabled rules with their patterns compiled once at load.
#[derive(Debug, Default)]
pub struct RulesEngine {
    rules: Vec<CompiledRule>,
}

impl RulesEngine {
    pub fn new(rules: Vec<Rule>) -> Result<Self, RulesError> {
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules.into_iter().filter(|r| r.enabled) {
            let pattern = match rule.trigger.pattern.as_deref() {
                Some(p) => Some(
                    RegexBuilder::new(p)
                        .case_insensitive(true)
                        .build()
                        .map_err(|source| RulesError::InvalidPattern {
                            rule: rule.name.clone(),
                            source,
                        })?,
                ),
                None => None,
            };
            compiled.push(CompiledRule { rule, pattern });
        }
        Ok(Self { rules: compiled })
    }

    pub fn from_toml(text: &str) -> Result<Self, RulesError> {
        let file: RulesFile = toml::from_str(text)?;
        Self::new(file.rules)
    }

    /// Load rules from `path`. A missing file yields an empty engine.
    pub fn load(path: &Path) -> Result<Self, RulesError> {
        if !path.exists() {
            debug!(path = %path.display(), "no rules file");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        let engine = Self::from_toml(&text)?;
        info!(path = %path.display(), rules = engine.len(), "rules loaded");
        Ok(engine)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Every matching rule contributes one task.
    ///
    /// `default_branch` is used when the rule's action names no branch.
    pub fn evaluate(&self, event: &ExternalEvent, default_branch: Option<&str>) -> Vec<NewTask> {
        self.rules
            .iter()
            .filter(|c| c.matches(event))
            .map(|c| {
                debug!(rule = %c.rule.name, event_id = %event.id, "rule matched");
                c.task_for(event, default_branch)
            })
            .collect()
    }
}

impl CompiledRule {
    fn matches(&self, event: &ExternalEvent) -> bool {
        let trigger = &self.rule.trigger;
        if trigger.event_type != event.kind {
            return false;
        }
        if let Some(want) = &trigger.source {
            match event.source() {
                Some(got) if got.eq_ignore_ascii_case(want) => {}
                _ => return false,
            }
        }
        let Some(pattern) = &self.pattern else {
            return true;
        };
        match &trigger.field {
            Some(field) => event
                .payload
                .get(field)
                .is_some_and(|v| pattern.is_match(&v.to_string())),
            None => event
                .payload
                .iter()
                .any(|(_, v)| pattern.is_match(&v.to_string())),
        }
    }

    fn task_for(&self, event: &ExternalEvent, default_branch: Option<&str>) -> NewTask {
        let action = &self.rule.action;
        let title = render_template(&action.template, event);
        let description = match &action.description {
            Some(d) => render_template(d, event),
            None => {
                let mut d = format!("Created by rule '{}' from {} event {}.", self.rule.name, event.kind, event.id);
                if let Some(body) = event.payload.text("body") {
                    d.push_str("\n\n");
                    d.push_str(body);
                }
                d
            }
        };
        let branch = action
            .branch
            .as_deref()
            .map(|b| render_template(b, event))
            .or_else(|| default_branch.map(str::to_string))
            .unwrap_or_default();

        let mut task = NewTask::new(title)
            .with_description(description)
            .with_priority(action.priority)
            .with_branch(branch);
        task.kind = TaskKind::Rule;
        task
    }
}

/// Replace `{key}` with the payload value for `key`. Unknown keys stay as-is.
pub fn render_template(template: &str, event: &ExternalEvent) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) => {
                let key = &after[..close];
                match lookup(event, key) {
                    Some(value) => out.push_str(&value),
                    None => {
                        out.push('{');
                        out.push_str(key);
                        out.push('}');
                    }
                }
                rest = &after[close + 1..];
            }
            None => {
                out.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

fn lookup(event: &ExternalEvent, key: &str) -> Option<String> {
    match key {
        "event_id" => Some(event.id.clone()),
        "event_type" => Some(event.kind.to_string()),
        _ => event.payload.get(key).map(PayloadValue::to_string),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cn_core::types::{EventKind, Payload};

    #[test]
    fn unknown_placeholders_are_kept() {
        let event = ExternalEvent::new(
            "ci:4:lint:failure:t",
            EventKind::CiStatus,
            Payload::new().with("check_name", "lint").with("pr_number", 4u64),
        );
        assert_eq!(
            render_template("Fix {check_name} on #{pr_number} ({missing}) {", &event),
            "Fix lint on #4 ({missing}) {"
        );
    }

    #[test]
    fn disabled_rules_are_dropped() {
        let engine = RulesEngine::from_toml(
            r#"
            [[rules]]
            name = "off"
            enabled = false
            trigger = { type = "ci_status", pattern = "(" }
            action = { template = "never" }
            "#,
        )
        .unwrap();
        assert!(engine.is_empty());
    }
}
