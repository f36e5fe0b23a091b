use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::Instant;

use llmux_common::UpstreamKeyMapping;

pub const DEFAULT_SECRET_CACHE_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("read secrets file: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse secrets file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Per-request context a secret source may consult. The router fills in the
/// authenticated client key before resolving the upstream secret.
#[derive(Debug, Clone, Default)]
pub struct SecretCtx {
    pub client_key: Option<String>,
}

impl SecretCtx {
    pub fn for_client_key(key: impl Into<String>) -> Self {
        Self {
            client_key: Some(key.into()),
        }
    }
}

/// Resolves one upstream API key per request. An empty string is a valid
/// result and means "send no credentials upstream".
#[async_trait]
pub trait SecretSource: Send + Sync {
    async fn get(&self, ctx: &SecretCtx) -> Result<String, SecretError>;
}

/// Always returns the same key, trimmed once at construction.
pub struct StaticSecretSource {
    key: String,
}

impl StaticSecretSource {
    pub fn new(key: impl AsRef<str>) -> Self {
        Self {
            key: key.as_ref().trim().to_string(),
        }
    }
}

#[async_trait]
impl SecretSource for StaticSecretSource {
    async fn get(&self, _ctx: &SecretCtx) -> Result<String, SecretError> {
        Ok(self.key.clone())
    }
}

#[derive(Debug, Clone)]
struct FileCacheEntry {
    /// `None` records "file absent"; an empty string records "file present
    /// but no usable key". Both are cached to avoid read storms.
    value: Option<String>,
    fetched_at: Instant,
}

struct MultiState {
    explicit: Option<String>,
    file_cache: Option<FileCacheEntry>,
}

/// Resolves an upstream key with precedence explicit config > environment
/// variable > secrets file, caching the file layer for a TTL.
pub struct MultiSourceSecret {
    env_var: String,
    file_path: PathBuf,
    file_key: String,
    ttl: Duration,
    state: RwLock<MultiState>,
}

impl MultiSourceSecret {
    /// `provider` picks the on-disk location
    /// (`~/.local/share/<provider>/secrets.json`); `issuer_url` selects the
    /// entry inside it (`"apiKey@<issuer_url>"`).
    pub fn new(provider: &str, issuer_url: &str, env_var: impl Into<String>) -> Self {
        let file_path = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(provider)
            .join("secrets.json");
        Self::with_file_path(file_path, issuer_url, env_var)
    }

    pub fn with_file_path(
        file_path: impl Into<PathBuf>,
        issuer_url: &str,
        env_var: impl Into<String>,
    ) -> Self {
        Self {
            env_var: env_var.into(),
            file_path: file_path.into(),
            file_key: format!("apiKey@{issuer_url}"),
            ttl: DEFAULT_SECRET_CACHE_TTL,
            state: RwLock::new(MultiState {
                explicit: None,
                file_cache: None,
            }),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub async fn update_explicit_key(&self, key: &str) {
        let trimmed = key.trim();
        let mut state = self.state.write().await;
        state.explicit = if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        };
    }

    pub async fn invalidate_cache(&self) {
        self.state.write().await.file_cache = None;
    }

    fn env_key(&self) -> Option<String> {
        std::env::var(&self.env_var)
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    async fn read_file_key(&self) -> Result<Option<String>, SecretError> {
        let bytes = match tokio::fs::read(&self.file_path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        // Invalid JSON is surfaced, not cached as absent.
        let map: HashMap<String, serde_json::Value> = serde_json::from_slice(&bytes)?;
        Ok(Some(
            map.get(&self.file_key)
                .and_then(|v| v.as_str())
                .map(|v| v.trim().to_string())
                .unwrap_or_default(),
        ))
    }
}

#[async_trait]
impl SecretSource for MultiSourceSecret {
    async fn get(&self, _ctx: &SecretCtx) -> Result<String, SecretError> {
        {
            let state = self.state.read().await;
            if let Some(key) = state.explicit.as_ref() {
                return Ok(key.clone());
            }
            if let Some(key) = self.env_key() {
                return Ok(key);
            }
            if let Some(cache) = state.file_cache.as_ref()
                && cache.fetched_at.elapsed() < self.ttl
            {
                return Ok(cache.value.clone().unwrap_or_default());
            }
        }

        let mut state = self.state.write().await;
        // Re-check under the write lock; another task may have refreshed.
        if let Some(key) = state.explicit.as_ref() {
            return Ok(key.clone());
        }
        if let Some(cache) = state.file_cache.as_ref()
            && cache.fetched_at.elapsed() < self.ttl
        {
            return Ok(cache.value.clone().unwrap_or_default());
        }
        let value = self.read_file_key().await?;
        state.file_cache = Some(FileCacheEntry {
            value: value.clone(),
            fetched_at: Instant::now(),
        });
        Ok(value.unwrap_or_default())
    }
}

/// Adds a per-client mapping in front of a default source: an authenticated
/// client key found in the mapping routes to its own upstream key; anything
/// else falls through.
pub struct MappedSecretSource {
    default_source: Arc<dyn SecretSource>,
    mappings: ArcSwap<HashMap<String, String>>,
}

impl MappedSecretSource {
    pub fn new(default_source: Arc<dyn SecretSource>) -> Self {
        Self {
            default_source,
            mappings: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    /// Rebuild the lookup atomically. When the same client key appears more
    /// than once, the first entry wins.
    pub fn update_mappings(&self, entries: &[UpstreamKeyMapping]) {
        let mut map = HashMap::with_capacity(entries.len());
        for entry in entries {
            if entry.client_key.is_empty() || entry.upstream_key.is_empty() {
                continue;
            }
            if map.contains_key(&entry.client_key) {
                tracing::warn!(
                    client_key_prefix = %key_prefix(&entry.client_key),
                    "duplicate upstream key mapping ignored; first entry wins"
                );
                continue;
            }
            map.insert(entry.client_key.clone(), entry.upstream_key.clone());
        }
        self.mappings.store(Arc::new(map));
    }
}

fn key_prefix(key: &str) -> &str {
    &key[..key.len().min(8)]
}

#[async_trait]
impl SecretSource for MappedSecretSource {
    async fn get(&self, ctx: &SecretCtx) -> Result<String, SecretError> {
        if let Some(client_key) = ctx.client_key.as_ref()
            && let Some(upstream) = self.mappings.load().get(client_key)
        {
            return Ok(upstream.clone());
        }
        self.default_source.get(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn mapping(client: &str, upstream: &str) -> UpstreamKeyMapping {
        UpstreamKeyMapping {
            client_key: client.to_string(),
            upstream_key: upstream.to_string(),
        }
    }

    #[tokio::test]
    async fn static_source_trims() {
        let source = StaticSecretSource::new("  secret \n");
        assert_eq!(source.get(&SecretCtx::default()).await.unwrap(), "secret");
    }

    #[tokio::test]
    async fn precedence_explicit_env_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secrets.json");
        std::fs::write(
            &path,
            br#"{"apiKey@https://amp.example.com": " file-key "}"#,
        )
        .unwrap();

        let env_var = "LLMUX_TEST_PRECEDENCE_KEY";
        let source = MultiSourceSecret::with_file_path(&path, "https://amp.example.com", env_var);

        // File only.
        assert_eq!(source.get(&SecretCtx::default()).await.unwrap(), "file-key");

        // Env beats file.
        unsafe { std::env::set_var(env_var, " env-key ") };
        assert_eq!(source.get(&SecretCtx::default()).await.unwrap(), "env-key");

        // Explicit beats env.
        source.update_explicit_key(" explicit-key ").await;
        assert_eq!(
            source.get(&SecretCtx::default()).await.unwrap(),
            "explicit-key"
        );

        // Clearing the explicit key falls back down the chain.
        source.update_explicit_key("").await;
        assert_eq!(source.get(&SecretCtx::default()).await.unwrap(), "env-key");
        unsafe { std::env::remove_var(env_var) };
    }

    #[tokio::test]
    async fn missing_file_is_not_an_error_and_is_cached() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secrets.json");
        let source = MultiSourceSecret::with_file_path(
            &path,
            "https://amp.example.com",
            "LLMUX_TEST_ABSENT_KEY",
        );
        assert_eq!(source.get(&SecretCtx::default()).await.unwrap(), "");

        // A file written while the negative cache is fresh is not seen...
        std::fs::write(&path, br#"{"apiKey@https://amp.example.com": "k"}"#).unwrap();
        assert_eq!(source.get(&SecretCtx::default()).await.unwrap(), "");

        // ...until the cache is invalidated.
        source.invalidate_cache().await;
        assert_eq!(source.get(&SecretCtx::default()).await.unwrap(), "k");
    }

    #[tokio::test]
    async fn ttl_expiry_rereads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secrets.json");
        std::fs::write(&path, br#"{"apiKey@https://amp.example.com": "v1"}"#).unwrap();
        let source = MultiSourceSecret::with_file_path(
            &path,
            "https://amp.example.com",
            "LLMUX_TEST_TTL_KEY",
        )
        .with_ttl(Duration::from_millis(30));

        assert_eq!(source.get(&SecretCtx::default()).await.unwrap(), "v1");
        std::fs::write(&path, br#"{"apiKey@https://amp.example.com": "v2"}"#).unwrap();
        assert_eq!(source.get(&SecretCtx::default()).await.unwrap(), "v1");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(source.get(&SecretCtx::default()).await.unwrap(), "v2");
    }

    #[tokio::test]
    async fn invalid_json_surfaces_as_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secrets.json");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(b"{not json").unwrap();
        let source = MultiSourceSecret::with_file_path(
            &path,
            "https://amp.example.com",
            "LLMUX_TEST_BADJSON_KEY",
        );
        assert!(matches!(
            source.get(&SecretCtx::default()).await,
            Err(SecretError::Parse(_))
        ));
    }

    #[tokio::test]
    async fn mapped_source_hits_and_falls_back() {
        let mapped = MappedSecretSource::new(Arc::new(StaticSecretSource::new("default-key")));
        mapped.update_mappings(&[mapping("k1", "u1")]);

        assert_eq!(
            mapped.get(&SecretCtx::for_client_key("k1")).await.unwrap(),
            "u1"
        );
        assert_eq!(
            mapped.get(&SecretCtx::for_client_key("k2")).await.unwrap(),
            "default-key"
        );
        assert_eq!(mapped.get(&SecretCtx::default()).await.unwrap(), "default-key");
    }

    #[tokio::test]
    async fn duplicate_mapping_first_wins() {
        let mapped = MappedSecretSource::new(Arc::new(StaticSecretSource::new("")));
        mapped.update_mappings(&[mapping("k1", "u1"), mapping("k1", "u2")]);
        assert_eq!(
            mapped.get(&SecretCtx::for_client_key("k1")).await.unwrap(),
            "u1"
        );
    }
}
