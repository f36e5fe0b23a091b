use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

/// OAuth channels that participate in model aliasing. API-key auths have no
/// channel, so they never appear here.
pub const OAUTH_ALIAS_CHANNELS: &[&str] = &[
    "gemini-cli",
    "vertex",
    "aistudio",
    "antigravity",
    "claude",
    "codex",
    "qwen",
    "iflow",
    "kimi",
];

/// Retired antigravity upstream names that older config files may still carry.
const ANTIGRAVITY_RENAMES: &[(&str, &str)] = &[
    ("gemini-3-pro-preview-11-2025", "gemini-3-pro-preview"),
    ("gemini-3-pro-image-preview-11-2025", "gemini-3-pro-image-preview"),
    ("claude-sonnet-4-5-20250929", "claude-sonnet-4-5"),
];

/// Alias rows every antigravity setup is expected to have; the legacy
/// migration fills in whichever of these the old file dropped.
const ANTIGRAVITY_DEFAULT_ALIASES: &[(&str, &str)] = &[
    ("gemini-3-pro-preview", "gemini-3-pro"),
    ("gemini-3-pro-image-preview", "gemini-3-pro-image"),
    ("claude-sonnet-4-5", "claude-sonnet-4.5"),
];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoutingStrategy {
    RoundRobin,
    FillFirst,
}

impl Default for RoutingStrategy {
    fn default() -> Self {
        RoutingStrategy::RoundRobin
    }
}

/// One upstream API key declared directly in the config file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ProviderKeyEntry {
    pub api_key: String,
    pub base_url: Option<String>,
    pub proxy_url: Option<String>,
    /// Single path segment used to namespace models, e.g. `teamA`.
    pub prefix: Option<String>,
    pub priority: i32,
    pub headers: HashMap<String, String>,
    pub excluded_models: Vec<String>,
    pub disabled: bool,
    pub label: Option<String>,
}

/// One `oauth-model-alias` row: `name` is the upstream model, `alias` is what
/// clients send. `fork` keeps the original name reachable as well.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct AliasRule {
    pub name: String,
    pub alias: String,
    pub fork: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ModelMappingRule {
    pub from: String,
    pub to: String,
    pub regex: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct UpstreamKeyMapping {
    pub client_key: String,
    pub upstream_key: String,
}

/// The `ampcode` gateway section: per-client upstream routing for the Amp
/// reverse proxy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct AmpConfig {
    pub model_mappings: Vec<ModelMappingRule>,
    pub upstream_url: Option<String>,
    pub upstream_api_key: Option<String>,
    pub upstream_api_keys: Vec<UpstreamKeyMapping>,
    pub restrict_management_to_localhost: bool,
    /// Apply model mappings even when the client asked for a model that a
    /// registered provider could already serve.
    pub force_model_mappings: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RemoteManagement {
    pub allow_remote: bool,
    pub secret_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub auth_dir: String,

    pub proxy_url: Option<String>,
    /// Client API keys the front end accepts.
    pub api_keys: Vec<String>,

    pub routing_strategy: RoutingStrategy,
    pub request_retry: u32,
    /// Upper bound for the transient-failure retry wait, in seconds.
    pub max_retry_interval: u64,
    pub disable_cooling: bool,

    pub streaming_keepalive_secs: u64,
    pub nonstream_keepalive_secs: u64,

    pub gemini_api_key: Vec<ProviderKeyEntry>,
    pub claude_api_key: Vec<ProviderKeyEntry>,
    pub codex_api_key: Vec<ProviderKeyEntry>,
    pub vertex_api_key: Vec<ProviderKeyEntry>,
    pub openai_compatibility: Vec<ProviderKeyEntry>,

    /// provider -> models never served by that provider's OAuth auths.
    pub oauth_excluded_models: HashMap<String, Vec<String>>,
    /// channel -> alias rules, see [`OAUTH_ALIAS_CHANNELS`].
    pub oauth_model_alias: HashMap<String, Vec<AliasRule>>,
    /// Legacy spelling of `oauth-model-alias`; migrated at load time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oauth_model_mappings: Option<HashMap<String, Vec<AliasRule>>>,

    pub ampcode: AmpConfig,
    pub remote_management: RemoteManagement,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8317,
            auth_dir: "~/.llmux/auths".to_string(),
            proxy_url: None,
            api_keys: Vec::new(),
            routing_strategy: RoutingStrategy::default(),
            request_retry: 3,
            max_retry_interval: 30,
            disable_cooling: false,
            streaming_keepalive_secs: 15,
            nonstream_keepalive_secs: 0,
            gemini_api_key: Vec::new(),
            claude_api_key: Vec::new(),
            codex_api_key: Vec::new(),
            vertex_api_key: Vec::new(),
            openai_compatibility: Vec::new(),
            oauth_excluded_models: HashMap::new(),
            oauth_model_alias: HashMap::new(),
            oauth_model_mappings: None,
            ampcode: AmpConfig::default(),
            remote_management: RemoteManagement::default(),
        }
    }
}

impl AppConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let mut config: AppConfig = serde_yaml::from_str(contents)?;
        config.migrate_legacy();
        config.sanitize();
        config.validate()?;
        Ok(config)
    }

    /// Provider key arrays keyed by their provider identifier.
    pub fn provider_key_entries(&self) -> impl Iterator<Item = (&'static str, &ProviderKeyEntry)> {
        self.gemini_api_key
            .iter()
            .map(|e| ("gemini", e))
            .chain(self.claude_api_key.iter().map(|e| ("claude", e)))
            .chain(self.codex_api_key.iter().map(|e| ("codex", e)))
            .chain(self.vertex_api_key.iter().map(|e| ("vertex", e)))
            .chain(
                self.openai_compatibility
                    .iter()
                    .map(|e| ("openai-compatibility", e)),
            )
    }

    /// Move `oauth-model-mappings` into `oauth-model-alias`.
    ///
    /// Explicit `oauth-model-alias` rows win over migrated ones. The
    /// antigravity channel additionally gets retired upstream names rewritten
    /// and any missing default rows filled in.
    fn migrate_legacy(&mut self) {
        let Some(legacy) = self.oauth_model_mappings.take() else {
            return;
        };
        for (channel, rules) in legacy {
            self.oauth_model_alias.entry(channel).or_insert(rules);
        }

        if let Some(rules) = self.oauth_model_alias.get_mut("antigravity") {
            for rule in rules.iter_mut() {
                if let Some((_, current)) = ANTIGRAVITY_RENAMES
                    .iter()
                    .find(|(old, _)| *old == rule.name)
                {
                    rule.name = (*current).to_string();
                }
            }
            for (name, alias) in ANTIGRAVITY_DEFAULT_ALIASES {
                if !rules.iter().any(|r| r.name == *name) {
                    rules.push(AliasRule {
                        name: (*name).to_string(),
                        alias: (*alias).to_string(),
                        fork: false,
                    });
                }
            }
        }
    }

    fn sanitize(&mut self) {
        sanitize_entries(&mut self.gemini_api_key);
        sanitize_entries(&mut self.claude_api_key);
        sanitize_entries(&mut self.codex_api_key);
        sanitize_entries(&mut self.vertex_api_key);
        sanitize_entries(&mut self.openai_compatibility);

        self.api_keys.retain(|k| !k.trim().is_empty());
        let mut seen = HashSet::new();
        self.api_keys.retain(|k| seen.insert(k.clone()));

        if let Some(url) = self.ampcode.upstream_url.as_mut() {
            while url.ends_with('/') {
                url.pop();
            }
        }
        self.ampcode
            .upstream_api_keys
            .retain(|m| !m.client_key.is_empty() && !m.upstream_key.is_empty());
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::Invalid("port must be non-zero".to_string()));
        }
        for channel in self.oauth_model_alias.keys() {
            if !OAUTH_ALIAS_CHANNELS.contains(&channel.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "unknown oauth-model-alias channel: {channel}"
                )));
            }
        }
        for url in self
            .proxy_url
            .iter()
            .chain(self.provider_key_entries().filter_map(|(_, e)| e.proxy_url.as_ref()))
        {
            validate_proxy_url(url)?;
        }
        Ok(())
    }
}

fn validate_proxy_url(url: &str) -> Result<(), ConfigError> {
    let ok = url.starts_with("http://")
        || url.starts_with("https://")
        || url.starts_with("socks5://")
        || url.starts_with("socks5h://");
    if ok {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!("unsupported proxy url: {url}")))
    }
}

/// Drop empty keys, dedupe by key, normalize urls and header names.
fn sanitize_entries(entries: &mut Vec<ProviderKeyEntry>) {
    for entry in entries.iter_mut() {
        entry.api_key = entry.api_key.trim().to_string();
    }
    entries.retain(|e| !e.api_key.is_empty());

    let mut seen = HashSet::new();
    entries.retain(|e| seen.insert(e.api_key.clone()));

    for entry in entries.iter_mut() {
        if let Some(url) = entry.base_url.as_mut() {
            while url.ends_with('/') {
                url.pop();
            }
        }
        entry.headers = entry
            .headers
            .drain()
            .map(|(k, v)| (k.to_ascii_lowercase(), v))
            .collect();
        if let Some(prefix) = entry.prefix.as_ref()
            && prefix.contains('/')
        {
            entry.prefix = None;
        }
    }
}
