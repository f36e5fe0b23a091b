use std::collections::HashMap;

use llmux_common::AliasRule;

use super::suffix::{parse_suffix, with_suffix};

/// Compiled `oauth-model-alias` table: channel -> lowercased alias ->
/// original upstream name. The manager swaps whole tables atomically on
/// config reload.
#[derive(Debug, Default)]
pub struct AliasTable {
    channels: HashMap<String, HashMap<String, String>>,
}

impl AliasTable {
    pub fn compile(config: &HashMap<String, Vec<AliasRule>>) -> Self {
        let mut channels: HashMap<String, HashMap<String, String>> = HashMap::new();
        for (channel, rules) in config {
            let table = channels.entry(channel.clone()).or_default();
            for rule in rules {
                if rule.alias.is_empty() || rule.name.is_empty() {
                    continue;
                }
                let key = parse_suffix(&rule.alias).base.to_ascii_lowercase();
                table.entry(key).or_insert_with(|| rule.name.clone());
            }
        }
        Self { channels }
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Substitute the upstream name for a requested alias.
    ///
    /// The user's suffix is preserved unless the original name already
    /// carries one, in which case the original wins verbatim.
    pub fn resolve(&self, channel: &str, requested: &str) -> Option<String> {
        let table = self.channels.get(channel)?;
        let parsed = parse_suffix(requested);
        let original = table.get(&parsed.base.to_ascii_lowercase())?;
        if parse_suffix(original).has_suffix() {
            return Some(original.clone());
        }
        Some(with_suffix(original, parsed.suffix))
    }
}
