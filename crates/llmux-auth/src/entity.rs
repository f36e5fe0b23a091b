use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

use crate::model::suffix::parse_suffix;

/// Immutable routing metadata. Recognized keys: `path`, `source`, `priority`,
/// `auth_kind`, `excluded_models`, `excluded_models_hash`, `api_key`,
/// `header:*` and the `gemini_virtual_*` family.
pub type Attributes = BTreeMap<String, String>;

/// Mutable provider state: tokens, expiry, overrides, project ids.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

pub const ATTR_PRIORITY: &str = "priority";
pub const ATTR_AUTH_KIND: &str = "auth_kind";
pub const ATTR_EXCLUDED_MODELS: &str = "excluded_models";
pub const ATTR_EXCLUDED_MODELS_HASH: &str = "excluded_models_hash";
pub const ATTR_API_KEY: &str = "api_key";
pub const ATTR_HEADER_PREFIX: &str = "header:";
pub const ATTR_GEMINI_VIRTUAL_PRIMARY: &str = "gemini_virtual_primary";
pub const ATTR_GEMINI_VIRTUAL_PARENT: &str = "gemini_virtual_parent";

pub const AUTH_KIND_API_KEY: &str = "apikey";
pub const AUTH_KIND_OAUTH: &str = "oauth";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthStatus {
    #[default]
    Unknown,
    Active,
    Pending,
    Refreshing,
    Error,
    Disabled,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaState {
    pub exceeded: bool,
    pub reason: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub next_recover_at: Option<OffsetDateTime>,
    pub backoff_level: u32,
}

impl QuotaState {
    /// A quota whose recovery timestamp has passed counts as recovered.
    pub fn blocking(&self, now: OffsetDateTime) -> bool {
        self.exceeded && self.next_recover_at.is_some_and(|at| at > now)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LastError {
    pub code: String,
    pub message: String,
    pub retryable: bool,
    pub http_status: Option<u16>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelState {
    pub status: AuthStatus,
    pub status_message: Option<String>,
    pub unavailable: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub next_retry_after: Option<OffsetDateTime>,
    pub last_error: Option<LastError>,
    pub quota: QuotaState,
    #[serde(with = "time::serde::rfc3339::option")]
    pub updated_at: Option<OffsetDateTime>,
}

impl ModelState {
    /// Blocked means the selector must skip this model on this auth: it is
    /// marked unavailable and the retry timestamp is still in the future.
    /// Unavailable with no timestamp does not block (the next attempt will
    /// acquire one if the model is still failing).
    pub fn blocked(&self, now: OffsetDateTime) -> bool {
        if self.quota.blocking(now) {
            return true;
        }
        self.unavailable && self.next_retry_after.is_some_and(|at| at > now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthUpdateAction {
    Add,
    Modify,
    Delete,
}

/// One fine-grained change dispatched from the watcher (or the relay) into
/// the manager's update queue.
#[derive(Debug, Clone)]
pub struct AuthUpdate {
    pub action: AuthUpdateAction,
    pub id: String,
    pub auth: Option<Auth>,
}

/// Opaque in-memory state attached to an auth, invisible to persistence,
/// identity comparison and the update diff.
#[derive(Clone)]
pub struct RuntimeHandle(Arc<dyn Any + Send + Sync>);

impl RuntimeHandle {
    pub fn new(value: Arc<dyn Any + Send + Sync>) -> Self {
        Self(value)
    }

    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.0).downcast::<T>().ok()
    }
}

impl fmt::Debug for RuntimeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RuntimeHandle")
    }
}

/// One credential.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Auth {
    /// Unique and stable across restarts; for file-backed auths this is the
    /// relative file path.
    pub id: String,
    /// Stable runtime identifier used for log correlation.
    pub index: String,
    pub provider: String,
    pub prefix: Option<String>,
    pub file_name: String,
    pub label: String,
    pub status: AuthStatus,
    pub disabled: bool,
    pub unavailable: bool,
    pub proxy_url: Option<String>,
    pub attributes: Attributes,
    pub metadata: Metadata,
    pub quota: QuotaState,
    pub last_error: Option<LastError>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub created_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub updated_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_refreshed_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub next_refresh_after: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub next_retry_after: Option<OffsetDateTime>,
    pub model_states: HashMap<String, ModelState>,
    /// In-memory only; opaque to the core. Gemini virtual siblings share a
    /// token pool through this handle.
    #[serde(skip)]
    pub runtime: Option<RuntimeHandle>,
}

impl Auth {
    pub fn index_for_file(file_name: &str) -> String {
        hex_sha256(format!("file:{file_name}").as_bytes())
    }

    pub fn index_for_api_key(key: &str) -> String {
        hex_sha256(format!("api_key:{key}").as_bytes())
    }

    pub fn ensure_index(&mut self) {
        if !self.index.is_empty() {
            return;
        }
        self.index = if self.file_name.is_empty() {
            Self::index_for_api_key(self.attribute(ATTR_API_KEY).unwrap_or(&self.id))
        } else {
            Self::index_for_file(&self.file_name)
        };
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    /// Integer selection priority; missing or malformed means 0.
    pub fn priority(&self) -> i32 {
        self.attribute(ATTR_PRIORITY)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }

    pub fn is_oauth(&self) -> bool {
        self.attribute(ATTR_AUTH_KIND) == Some(AUTH_KIND_OAUTH)
    }

    /// The OAuth alias channel, when this auth participates in aliasing.
    pub fn channel(&self) -> Option<&str> {
        if !self.is_oauth() {
            return None;
        }
        llmux_common::OAUTH_ALIAS_CHANNELS
            .iter()
            .find(|c| **c == self.provider)
            .copied()
    }

    /// Per-entry upstream headers from `header:*` attributes.
    pub fn header_attributes(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attributes.iter().filter_map(|(k, v)| {
            k.strip_prefix(ATTR_HEADER_PREFIX)
                .map(|name| (name, v.as_str()))
        })
    }

    pub fn excluded_models(&self) -> Vec<&str> {
        self.attribute(ATTR_EXCLUDED_MODELS)
            .map(|v| v.split(',').filter(|m| !m.is_empty()).collect())
            .unwrap_or_default()
    }

    /// Case-insensitive match of the model's base name (suffix stripped)
    /// against the excluded list.
    pub fn is_model_excluded(&self, model: &str) -> bool {
        let base = parse_suffix(model).base.to_ascii_lowercase();
        self.excluded_models()
            .iter()
            .any(|m| m.eq_ignore_ascii_case(&base))
    }

    // ---- Typed metadata accessors ----

    /// Credential expiry (`expired`, RFC 3339).
    pub fn expiration_time(&self) -> Option<OffsetDateTime> {
        let raw = self.metadata.get("expired")?.as_str()?;
        OffsetDateTime::parse(raw, &time::format_description::well_known::Rfc3339).ok()
    }

    pub fn disable_cooling_override(&self) -> Option<bool> {
        self.metadata.get("disable_cooling")?.as_bool()
    }

    /// Per-auth retry budget; 0 disables retry for this auth.
    pub fn request_retry_override(&self) -> Option<u32> {
        let value = self.metadata.get("request_retry")?;
        value
            .as_u64()
            .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
            .map(|n| n as u32)
    }

    pub fn tool_prefix_disabled(&self) -> Option<bool> {
        self.metadata.get("tool_prefix_disabled")?.as_bool()
    }

    /// Account label, usually the email behind the credential.
    pub fn account_info(&self) -> Option<&str> {
        self.metadata.get("email")?.as_str()
    }

    pub fn model_state(&self, model: &str) -> Option<&ModelState> {
        self.model_states.get(parse_suffix(model).base)
    }

    pub fn model_state_mut(&mut self, model: &str) -> &mut ModelState {
        let base = parse_suffix(model).base.to_string();
        self.model_states.entry(base).or_default()
    }

    /// Recompute the aggregated availability from the per-model states.
    ///
    /// The auth as a whole is unavailable iff every tracked model is
    /// unavailable and at least one carries a future retry timestamp; the
    /// aggregated retry timestamp is the latest one among blocking entries.
    pub fn aggregate(&mut self, now: OffsetDateTime) {
        if self.model_states.is_empty() {
            self.unavailable = false;
            self.next_retry_after = None;
            return;
        }
        let all_unavailable = self.model_states.values().all(|ms| ms.unavailable);
        let max_retry = self
            .model_states
            .values()
            .filter(|ms| ms.unavailable)
            .filter_map(|ms| ms.next_retry_after)
            .filter(|at| *at > now)
            .max();
        self.unavailable = all_unavailable && max_retry.is_some();
        self.next_retry_after = if self.unavailable { max_retry } else { None };
    }

    /// Equality over the fields that matter for execution.
    ///
    /// Bookkeeping timestamps (`created_at`, `updated_at`,
    /// `last_refreshed_at`, `next_refresh_after`, `quota.next_recover_at`)
    /// and the opaque `runtime` handle are ignored, so a change confined to
    /// them never produces a `Modify` dispatch.
    pub fn same_execution_identity(&self, other: &Auth) -> bool {
        if self.id != other.id
            || self.index != other.index
            || self.provider != other.provider
            || self.prefix != other.prefix
            || self.file_name != other.file_name
            || self.label != other.label
            || self.status != other.status
            || self.disabled != other.disabled
            || self.unavailable != other.unavailable
            || self.proxy_url != other.proxy_url
            || self.attributes != other.attributes
            || self.metadata != other.metadata
            || !quota_identity_eq(&self.quota, &other.quota)
            || self.last_error != other.last_error
            || self.next_retry_after != other.next_retry_after
        {
            return false;
        }
        if self.model_states.len() != other.model_states.len() {
            return false;
        }
        self.model_states.iter().all(|(model, ms)| {
            other
                .model_states
                .get(model)
                .is_some_and(|o| model_state_identity_eq(ms, o))
        })
    }
}

fn quota_identity_eq(a: &QuotaState, b: &QuotaState) -> bool {
    a.exceeded == b.exceeded && a.reason == b.reason && a.backoff_level == b.backoff_level
}

fn model_state_identity_eq(a: &ModelState, b: &ModelState) -> bool {
    a.status == b.status
        && a.status_message == b.status_message
        && a.unavailable == b.unavailable
        && a.next_retry_after == b.next_retry_after
        && a.last_error == b.last_error
        && quota_identity_eq(&a.quota, &b.quota)
}

fn hex_sha256(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn auth(id: &str) -> Auth {
        Auth {
            id: id.to_string(),
            provider: "gemini-cli".to_string(),
            ..Auth::default()
        }
    }

    #[test]
    fn index_derivation_is_stable() {
        let a = Auth::index_for_file("team/alice.json");
        let b = Auth::index_for_file("team/alice.json");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, Auth::index_for_api_key("team/alice.json"));
    }

    #[test]
    fn aggregate_requires_timestamp_to_block() {
        let now = datetime!(2026-01-01 00:00:00 UTC);
        let mut a = auth("a");
        a.model_states.insert(
            "m1".to_string(),
            ModelState {
                unavailable: true,
                ..ModelState::default()
            },
        );
        a.model_states.insert(
            "m2".to_string(),
            ModelState {
                unavailable: true,
                ..ModelState::default()
            },
        );
        a.aggregate(now);
        // Every model is unavailable but none has a retry timestamp.
        assert!(!a.unavailable);

        a.model_states.get_mut("m2").unwrap().next_retry_after = Some(now + time::Duration::minutes(5));
        a.aggregate(now);
        assert!(a.unavailable);
        assert_eq!(a.next_retry_after, Some(now + time::Duration::minutes(5)));

        // One model recovering unblocks the auth as a whole.
        a.model_states.get_mut("m1").unwrap().unavailable = false;
        a.aggregate(now);
        assert!(!a.unavailable);
        assert_eq!(a.next_retry_after, None);
    }

    #[test]
    fn quota_past_recovery_is_not_blocking() {
        let now = datetime!(2026-01-01 00:00:00 UTC);
        let ms = ModelState {
            quota: QuotaState {
                exceeded: true,
                next_recover_at: Some(now - time::Duration::seconds(1)),
                ..QuotaState::default()
            },
            ..ModelState::default()
        };
        assert!(!ms.blocked(now));
    }

    #[test]
    fn identity_ignores_bookkeeping_fields() {
        let now = datetime!(2026-01-01 00:00:00 UTC);
        let mut a = auth("a");
        let mut b = a.clone();
        b.created_at = Some(now);
        b.updated_at = Some(now);
        b.last_refreshed_at = Some(now);
        b.next_refresh_after = Some(now);
        b.quota.next_recover_at = Some(now);
        assert!(a.same_execution_identity(&b));

        b.label = "other".to_string();
        assert!(!a.same_execution_identity(&b));

        a.metadata
            .insert("project_id".to_string(), serde_json::json!("p1"));
        let mut c = a.clone();
        assert!(a.same_execution_identity(&c));
        c.metadata
            .insert("project_id".to_string(), serde_json::json!("p2"));
        assert!(!a.same_execution_identity(&c));
    }

    #[test]
    fn excluded_models_matches_base_name() {
        let mut a = auth("a");
        a.attributes.insert(
            ATTR_EXCLUDED_MODELS.to_string(),
            "gemini-2.5-flash,claude-3-haiku".to_string(),
        );
        assert!(a.is_model_excluded("Gemini-2.5-Flash"));
        assert!(a.is_model_excluded("gemini-2.5-flash(8192)"));
        assert!(!a.is_model_excluded("gemini-2.5-pro"));
    }

    #[test]
    fn metadata_accessors() {
        let mut a = auth("a");
        a.metadata
            .insert("disable_cooling".to_string(), serde_json::json!(true));
        a.metadata
            .insert("request_retry".to_string(), serde_json::json!("2"));
        a.metadata
            .insert("email".to_string(), serde_json::json!("a@example.com"));
        a.metadata.insert(
            "expired".to_string(),
            serde_json::json!("2026-03-01T00:00:00Z"),
        );
        assert_eq!(a.disable_cooling_override(), Some(true));
        assert_eq!(a.request_retry_override(), Some(2));
        assert_eq!(a.account_info(), Some("a@example.com"));
        assert_eq!(
            a.expiration_time(),
            Some(datetime!(2026-03-01 00:00:00 UTC))
        );
    }
}
