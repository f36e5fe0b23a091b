use serde::{Deserialize, Deserializer, Serialize};

use crate::entity::{
    Attributes, Auth, AuthStatus, Metadata, ATTR_AUTH_KIND, ATTR_PRIORITY, AUTH_KIND_OAUTH,
};

/// On-disk auth record.
///
/// The `type` field names the provider and is required; everything else is
/// optional. Both snake_case and kebab-case spellings are accepted for the
/// override fields, matching what different login tools have written over
/// time. Unknown fields are preserved round-trip through `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthFile {
    #[serde(rename = "type")]
    pub provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// RFC 3339 expiry of the access token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expired: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(
        deserialize_with = "priority_int_or_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub priority: Option<i32>,
    pub disabled: bool,
    /// Comma-separated for multi-project gemini credentials.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(alias = "excluded-models", skip_serializing_if = "Vec::is_empty")]
    pub excluded_models: Vec<String>,
    #[serde(alias = "disable-cooling", skip_serializing_if = "Option::is_none")]
    pub disable_cooling: Option<bool>,
    #[serde(alias = "request-retry", skip_serializing_if = "Option::is_none")]
    pub request_retry: Option<u32>,
    #[serde(alias = "tool-prefix-disabled", skip_serializing_if = "Option::is_none")]
    pub tool_prefix_disabled: Option<bool>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn priority_int_or_string<'de, D>(deserializer: D) -> Result<Option<i32>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum IntOrString {
        Int(i64),
        Str(String),
    }
    let value = Option::<IntOrString>::deserialize(deserializer)?;
    Ok(value.and_then(|v| match v {
        IntOrString::Int(n) => Some(n as i32),
        IntOrString::Str(s) => s.trim().parse().ok(),
    }))
}

#[derive(Debug, thiserror::Error)]
pub enum AuthFileError {
    #[error("parse auth file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("auth file has no type field")]
    MissingType,
}

impl AuthFile {
    pub fn parse(bytes: &[u8]) -> Result<Self, AuthFileError> {
        let file: AuthFile = serde_json::from_slice(bytes)?;
        if file.provider.trim().is_empty() {
            return Err(AuthFileError::MissingType);
        }
        Ok(file)
    }

    /// Build the base in-memory record for this file. The synthesizer layers
    /// config-level data (excluded-model merges, virtual children) on top.
    pub fn to_auth(&self, id: &str, file_name: &str) -> Auth {
        let mut attributes = Attributes::new();
        attributes.insert("path".to_string(), file_name.to_string());
        attributes.insert("source".to_string(), "file".to_string());
        attributes.insert(ATTR_AUTH_KIND.to_string(), AUTH_KIND_OAUTH.to_string());
        if let Some(priority) = self.priority {
            attributes.insert(ATTR_PRIORITY.to_string(), priority.to_string());
        }

        let mut metadata = Metadata::new();
        for (key, value) in [
            ("email", self.email.as_ref()),
            ("access_token", self.access_token.as_ref()),
            ("refresh_token", self.refresh_token.as_ref()),
            ("expired", self.expired.as_ref()),
            ("project_id", self.project_id.as_ref()),
        ] {
            if let Some(value) = value {
                metadata.insert(key.to_string(), serde_json::json!(value));
            }
        }
        if let Some(v) = self.disable_cooling {
            metadata.insert("disable_cooling".to_string(), serde_json::json!(v));
        }
        if let Some(v) = self.request_retry {
            metadata.insert("request_retry".to_string(), serde_json::json!(v));
        }
        if let Some(v) = self.tool_prefix_disabled {
            metadata.insert("tool_prefix_disabled".to_string(), serde_json::json!(v));
        }
        for (key, value) in &self.extra {
            metadata.entry(key.clone()).or_insert_with(|| value.clone());
        }

        let status = if self.disabled {
            AuthStatus::Disabled
        } else if self.access_token.as_deref().is_some_and(|t| !t.is_empty()) {
            AuthStatus::Active
        } else {
            AuthStatus::Pending
        };

        let mut auth = Auth {
            id: id.to_string(),
            index: Auth::index_for_file(file_name),
            provider: self.provider.to_ascii_lowercase(),
            prefix: self.prefix.clone(),
            file_name: file_name.to_string(),
            label: self.email.clone().unwrap_or_default(),
            status,
            disabled: self.disabled,
            proxy_url: self.proxy_url.clone(),
            attributes,
            metadata,
            ..Auth::default()
        };
        auth.ensure_index();
        auth
    }

    /// Project the persistable fields of an auth back into file shape.
    pub fn from_auth(auth: &Auth) -> Self {
        let str_meta = |key: &str| {
            auth.metadata
                .get(key)
                .and_then(|v| v.as_str())
                .map(str::to_string)
        };
        let mut extra = serde_json::Map::new();
        for (key, value) in &auth.metadata {
            match key.as_str() {
                "email" | "access_token" | "refresh_token" | "expired" | "project_id"
                | "disable_cooling" | "request_retry" | "tool_prefix_disabled" => {}
                _ => {
                    extra.insert(key.clone(), value.clone());
                }
            }
        }
        Self {
            provider: auth.provider.clone(),
            email: str_meta("email"),
            access_token: str_meta("access_token"),
            refresh_token: str_meta("refresh_token"),
            expired: str_meta("expired"),
            proxy_url: auth.proxy_url.clone(),
            prefix: auth.prefix.clone(),
            priority: auth
                .attribute(ATTR_PRIORITY)
                .and_then(|v| v.parse().ok()),
            disabled: auth.disabled,
            project_id: str_meta("project_id"),
            excluded_models: auth
                .excluded_models()
                .iter()
                .map(|m| (*m).to_string())
                .collect(),
            disable_cooling: auth.disable_cooling_override(),
            request_retry: auth.request_retry_override(),
            tool_prefix_disabled: auth.tool_prefix_disabled(),
            extra,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_kebab_and_snake_aliases() {
        let raw = br#"{
            "type": "gemini-cli",
            "email": "a@example.com",
            "access_token": "at",
            "excluded-models": ["gemini-2.5-flash"],
            "disable-cooling": true,
            "request_retry": 2,
            "priority": "10"
        }"#;
        let file = AuthFile::parse(raw).unwrap();
        assert_eq!(file.provider, "gemini-cli");
        assert_eq!(file.excluded_models, vec!["gemini-2.5-flash"]);
        assert_eq!(file.disable_cooling, Some(true));
        assert_eq!(file.request_retry, Some(2));
        assert_eq!(file.priority, Some(10));
    }

    #[test]
    fn missing_type_is_an_error() {
        assert!(matches!(
            AuthFile::parse(br#"{"email": "a@example.com"}"#),
            Err(AuthFileError::MissingType)
        ));
    }

    #[test]
    fn to_auth_builds_metadata_and_attributes() {
        let raw = br#"{
            "type": "Codex",
            "email": "a@example.com",
            "access_token": "at",
            "refresh_token": "rt",
            "expired": "2026-03-01T00:00:00Z",
            "priority": 5,
            "account_id": "acc-1"
        }"#;
        let file = AuthFile::parse(raw).unwrap();
        let auth = file.to_auth("codex-a.json", "codex-a.json");
        assert_eq!(auth.provider, "codex");
        assert_eq!(auth.label, "a@example.com");
        assert_eq!(auth.priority(), 5);
        assert_eq!(auth.status, AuthStatus::Active);
        assert!(auth.is_oauth());
        assert_eq!(auth.metadata["account_id"], "acc-1");
        assert_eq!(auth.index, Auth::index_for_file("codex-a.json"));
    }

    #[test]
    fn from_auth_round_trips_tokens() {
        let raw = br#"{
            "type": "codex",
            "email": "a@example.com",
            "access_token": "at",
            "refresh_token": "rt",
            "expired": "2026-03-01T00:00:00Z"
        }"#;
        let file = AuthFile::parse(raw).unwrap();
        let auth = file.to_auth("id", "codex-a.json");
        let back = AuthFile::from_auth(&auth);
        assert_eq!(back.provider, "codex");
        assert_eq!(back.access_token.as_deref(), Some("at"));
        assert_eq!(back.refresh_token.as_deref(), Some("rt"));
        assert_eq!(back.email.as_deref(), Some("a@example.com"));
    }

    #[test]
    fn pending_without_access_token() {
        let file = AuthFile::parse(br#"{"type": "qwen"}"#).unwrap();
        let auth = file.to_auth("id", "qwen.json");
        assert_eq!(auth.status, AuthStatus::Pending);
    }
}
