use llmux_common::ModelMappingRule;
use regex::Regex;

use super::suffix::{parse_suffix, with_suffix};

#[derive(Debug)]
enum RuleMatcher {
    Exact(String),
    Pattern(Regex),
}

#[derive(Debug)]
struct CompiledRule {
    matcher: RuleMatcher,
    to: String,
}

/// Request-time model mapping for the reverse-proxy front end.
///
/// Rules are consulted in configuration order against the base model name;
/// the first match decides. Targets with their own suffix override the
/// user's suffix.
#[derive(Debug, Default)]
pub struct ModelMapper {
    rules: Vec<CompiledRule>,
    force: bool,
}

impl ModelMapper {
    pub fn compile(rules: &[ModelMappingRule], force: bool) -> Result<Self, regex::Error> {
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            if rule.from.is_empty() || rule.to.is_empty() {
                continue;
            }
            let matcher = if rule.regex {
                RuleMatcher::Pattern(Regex::new(&format!("(?i)^(?:{})$", rule.from))?)
            } else {
                RuleMatcher::Exact(rule.from.to_ascii_lowercase())
            };
            compiled.push(CompiledRule {
                matcher,
                to: rule.to.clone(),
            });
        }
        Ok(Self {
            rules: compiled,
            force,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Whether mappings apply even when no provider serves the target.
    pub fn is_forced(&self) -> bool {
        self.force
    }

    /// Resolve the mapped name for a request without the availability gate.
    pub fn target_for(&self, requested: &str) -> Option<String> {
        let parsed = parse_suffix(requested);
        let base_lower = parsed.base.to_ascii_lowercase();

        let rule = self.rules.iter().find(|rule| match &rule.matcher {
            RuleMatcher::Exact(from) => *from == base_lower,
            RuleMatcher::Pattern(re) => re.is_match(parsed.base),
        })?;

        let target = parse_suffix(&rule.to);
        if target.has_suffix() {
            // Config-declared suffix wins over whatever the user sent.
            return Some(rule.to.clone());
        }
        Some(with_suffix(target.base, parsed.suffix))
    }

    /// Map a requested model, returning `None` when no rule applies.
    ///
    /// `has_provider` answers whether any registered provider can serve a
    /// given base model; unless the mapper was compiled with `force`, a
    /// target that no provider serves leaves the request unmapped.
    pub fn map(&self, requested: &str, has_provider: impl Fn(&str) -> bool) -> Option<String> {
        let target = self.target_for(requested)?;
        if !self.force && !has_provider(parse_suffix(&target).base) {
            return None;
        }
        Some(target)
    }
}
