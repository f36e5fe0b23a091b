use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};

use llmux_auth::entity::{
    Attributes, Auth, AuthStatus, RuntimeHandle, ATTR_API_KEY, ATTR_AUTH_KIND,
    ATTR_EXCLUDED_MODELS, ATTR_EXCLUDED_MODELS_HASH, ATTR_GEMINI_VIRTUAL_PARENT,
    ATTR_GEMINI_VIRTUAL_PRIMARY, ATTR_HEADER_PREFIX, ATTR_PRIORITY, AUTH_KIND_API_KEY,
};
use llmux_auth::runtime::{PoolTokens, SharedTokenPool};
use llmux_auth::AuthFile;
use llmux_common::AppConfig;

/// Builds the in-memory auth set from one source. Synthesizers run
/// top-to-bottom on every relevant watcher event: config entries first, then
/// the on-disk files.
pub trait Synthesizer: Send + Sync {
    fn synthesize(&self, config: &AppConfig) -> Vec<Auth>;
}

/// Lowercase, sort and dedupe the union of excluded-model lists.
pub fn merge_excluded_models(lists: &[&[String]]) -> Vec<String> {
    let mut set = BTreeSet::new();
    for list in lists {
        for model in *list {
            let model = model.trim().to_ascii_lowercase();
            if !model.is_empty() {
                set.insert(model);
            }
        }
    }
    set.into_iter().collect()
}

/// SHA-256 of the canonical comma-joined list; used only to detect changes.
pub fn excluded_models_hash(models: &[String]) -> String {
    let digest = Sha256::digest(models.join(",").as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

fn apply_excluded_models(attributes: &mut Attributes, models: &[String]) {
    if models.is_empty() {
        return;
    }
    attributes.insert(ATTR_EXCLUDED_MODELS.to_string(), models.join(","));
    attributes.insert(
        ATTR_EXCLUDED_MODELS_HASH.to_string(),
        excluded_models_hash(models),
    );
}

/// Auths declared directly in the config's provider key arrays.
#[derive(Debug, Default)]
pub struct ConfigSynthesizer;

impl Synthesizer for ConfigSynthesizer {
    fn synthesize(&self, config: &AppConfig) -> Vec<Auth> {
        let mut auths = Vec::new();
        for (provider, entry) in config.provider_key_entries() {
            let index = Auth::index_for_api_key(&entry.api_key);
            let id = format!("config-{provider}-{}", &index[..8]);

            let mut attributes = Attributes::new();
            attributes.insert("source".to_string(), "config".to_string());
            attributes.insert(ATTR_AUTH_KIND.to_string(), AUTH_KIND_API_KEY.to_string());
            attributes.insert(ATTR_API_KEY.to_string(), entry.api_key.clone());
            if entry.priority != 0 {
                attributes.insert(ATTR_PRIORITY.to_string(), entry.priority.to_string());
            }
            if let Some(base_url) = entry.base_url.as_ref() {
                attributes.insert("base_url".to_string(), base_url.clone());
            }
            for (name, value) in &entry.headers {
                attributes.insert(format!("{ATTR_HEADER_PREFIX}{name}"), value.clone());
            }
            apply_excluded_models(
                &mut attributes,
                &merge_excluded_models(&[&entry.excluded_models]),
            );

            auths.push(Auth {
                id,
                index,
                provider: provider.to_string(),
                prefix: entry.prefix.clone(),
                label: entry
                    .label
                    .clone()
                    .unwrap_or_else(|| format!("{provider} api key")),
                status: if entry.disabled {
                    AuthStatus::Disabled
                } else {
                    AuthStatus::Active
                },
                disabled: entry.disabled,
                proxy_url: entry.proxy_url.clone(),
                attributes,
                ..Auth::default()
            });
        }
        auths.sort_by(|a, b| a.id.cmp(&b.id));
        auths
    }
}

/// Auths parsed from the on-disk credential files, including the virtual
/// children of multi-project gemini credentials.
#[derive(Debug)]
pub struct FileSynthesizer {
    auth_dir: PathBuf,
}

impl FileSynthesizer {
    pub fn new(auth_dir: impl Into<PathBuf>) -> Self {
        Self {
            auth_dir: auth_dir.into(),
        }
    }

    fn walk_json(&self) -> Vec<(String, PathBuf)> {
        let mut files = Vec::new();
        let mut stack = vec![self.auth_dir.clone()];
        while let Some(dir) = stack.pop() {
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                    continue;
                }
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let rel = path
                    .strip_prefix(&self.auth_dir)
                    .unwrap_or(&path)
                    .to_string_lossy()
                    .replace('\\', "/");
                files.push((rel, path));
            }
        }
        files.sort();
        files
    }

    fn expand(&self, config: &AppConfig, rel: &str, file: &AuthFile) -> Vec<Auth> {
        let mut auth = file.to_auth(rel, rel);

        let config_excluded = config
            .oauth_excluded_models
            .get(&auth.provider)
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        let merged = merge_excluded_models(&[&file.excluded_models, config_excluded]);
        apply_excluded_models(&mut auth.attributes, &merged);

        let projects: Vec<String> = file
            .project_id
            .as_deref()
            .unwrap_or("")
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect();
        if auth.provider != "gemini-cli" || projects.len() <= 1 {
            return vec![auth];
        }

        // Multi-project credential: the primary never executes requests, one
        // virtual child per project does, and all children share one
        // refresh-token pool.
        let pool = Arc::new(SharedTokenPool::new(PoolTokens {
            access_token: file.access_token.clone().unwrap_or_default(),
            refresh_token: file.refresh_token.clone().unwrap_or_default(),
            expired: auth.expiration_time(),
        }));

        let mut out = Vec::with_capacity(projects.len() + 1);
        let mut primary = auth.clone();
        primary.disabled = true;
        primary.status = AuthStatus::Disabled;
        primary
            .attributes
            .insert(ATTR_GEMINI_VIRTUAL_PRIMARY.to_string(), "true".to_string());
        out.push(primary);

        for project in projects {
            let mut child = auth.clone();
            child.id = format!("{rel}#{project}");
            child.index = Auth::index_for_file(&child.id);
            child.label = format!("{}#{project}", auth.label);
            child
                .attributes
                .insert(ATTR_GEMINI_VIRTUAL_PARENT.to_string(), rel.to_string());
            child
                .metadata
                .insert("project_id".to_string(), serde_json::json!(project));
            child.runtime = Some(RuntimeHandle::new(pool.clone()));
            out.push(child);
        }
        out
    }

    /// Expand one parsed file; exposed for the watcher's incremental path.
    pub fn expand_file(&self, config: &AppConfig, rel: &str, file: &AuthFile) -> Vec<Auth> {
        self.expand(config, rel, file)
    }

    pub fn auth_dir(&self) -> &Path {
        &self.auth_dir
    }
}

impl Synthesizer for FileSynthesizer {
    fn synthesize(&self, config: &AppConfig) -> Vec<Auth> {
        let mut auths = Vec::new();
        for (rel, path) in self.walk_json() {
            let bytes = match std::fs::read(&path) {
                Ok(bytes) => bytes,
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "auth file read failed");
                    continue;
                }
            };
            match AuthFile::parse(&bytes) {
                Ok(file) => auths.extend(self.expand(config, &rel, &file)),
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "auth file parse failed");
                }
            }
        }
        auths.sort_by(|a, b| a.id.cmp(&b.id));
        auths
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use llmux_common::ProviderKeyEntry;

    #[test]
    fn merge_is_lowercase_sorted_deduped() {
        let a = vec!["Gemini-2.5-Flash".to_string(), "b-model".to_string()];
        let b = vec!["gemini-2.5-flash".to_string(), "A-Model".to_string()];
        let merged = merge_excluded_models(&[&a, &b]);
        assert_eq!(merged, vec!["a-model", "b-model", "gemini-2.5-flash"]);

        let h1 = excluded_models_hash(&merged);
        let h2 = excluded_models_hash(&merge_excluded_models(&[&b, &a]));
        assert_eq!(h1, h2);
    }

    #[test]
    fn config_synthesizer_builds_api_key_auths() {
        let mut config = AppConfig::default();
        config.claude_api_key.push(ProviderKeyEntry {
            api_key: "sk-1".to_string(),
            priority: 10,
            headers: [("x-extra".to_string(), "v".to_string())].into(),
            excluded_models: vec!["Claude-3-Haiku".to_string()],
            prefix: Some("teamA".to_string()),
            ..ProviderKeyEntry::default()
        });

        let auths = ConfigSynthesizer.synthesize(&config);
        assert_eq!(auths.len(), 1);
        let auth = &auths[0];
        assert_eq!(auth.provider, "claude");
        assert_eq!(auth.priority(), 10);
        assert_eq!(auth.prefix.as_deref(), Some("teamA"));
        assert_eq!(auth.attribute(ATTR_API_KEY), Some("sk-1"));
        assert!(!auth.is_oauth());
        assert_eq!(
            auth.header_attributes().collect::<Vec<_>>(),
            vec![("x-extra", "v")]
        );
        assert!(auth.is_model_excluded("claude-3-haiku"));
        assert_eq!(auth.index, Auth::index_for_api_key("sk-1"));
        // Stable id across runs.
        assert_eq!(auth.id, ConfigSynthesizer.synthesize(&config)[0].id);
    }

    #[test]
    fn file_synthesizer_merges_config_excluded_models() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("gemini.json"),
            br#"{"type":"gemini-cli","email":"a@example.com","access_token":"at","excluded_models":["file-model"]}"#,
        )
        .unwrap();

        let mut config = AppConfig::default();
        config
            .oauth_excluded_models
            .insert("gemini-cli".to_string(), vec!["Config-Model".to_string()]);

        let auths = FileSynthesizer::new(dir.path()).synthesize(&config);
        assert_eq!(auths.len(), 1);
        assert!(auths[0].is_model_excluded("file-model"));
        assert!(auths[0].is_model_excluded("config-model"));
        assert!(auths[0]
            .attribute(ATTR_EXCLUDED_MODELS_HASH)
            .is_some());
    }

    #[test]
    fn multi_project_gemini_expands_virtuals() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("gemini.json"),
            br#"{"type":"gemini-cli","email":"a@example.com","access_token":"at","refresh_token":"rt","project_id":"p1, p2"}"#,
        )
        .unwrap();

        let auths = FileSynthesizer::new(dir.path()).synthesize(&AppConfig::default());
        assert_eq!(auths.len(), 3);

        let primary = auths.iter().find(|a| a.id == "gemini.json").unwrap();
        assert!(primary.disabled);
        assert_eq!(
            primary.attribute(ATTR_GEMINI_VIRTUAL_PRIMARY),
            Some("true")
        );

        let children: Vec<&Auth> = auths
            .iter()
            .filter(|a| a.attribute(ATTR_GEMINI_VIRTUAL_PARENT).is_some())
            .collect();
        assert_eq!(children.len(), 2);
        for child in &children {
            assert!(!child.disabled);
            assert_eq!(
                child.attribute(ATTR_GEMINI_VIRTUAL_PARENT),
                Some("gemini.json")
            );
        }
        // Siblings share one token pool.
        let p1 = children[0].shared_pool().unwrap();
        let p2 = children[1].shared_pool().unwrap();
        assert!(Arc::ptr_eq(&p1, &p2));
        assert_eq!(p1.snapshot().access_token, "at");
    }

    #[test]
    fn single_project_gemini_stays_plain() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("gemini.json"),
            br#"{"type":"gemini-cli","access_token":"at","project_id":"p1"}"#,
        )
        .unwrap();
        let auths = FileSynthesizer::new(dir.path()).synthesize(&AppConfig::default());
        assert_eq!(auths.len(), 1);
        assert!(auths[0].runtime.is_none());
    }
}
