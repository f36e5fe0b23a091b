use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::watch;

use crate::entity::{Auth, AuthStatus};
use crate::executor::ExecCtx;
use crate::manager::{AuthManager, OpCtx};

/// How long before credential expiry a refresh is attempted, per provider.
///
/// Injected into the manager at construction; there is no process-wide
/// registry.
#[derive(Debug, Clone)]
pub struct RefreshPolicy {
    leads: HashMap<String, Duration>,
    default_lead: Duration,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            leads: HashMap::new(),
            default_lead: Duration::from_secs(5 * 60),
        }
    }
}

impl RefreshPolicy {
    pub fn new(default_lead: Duration) -> Self {
        Self {
            leads: HashMap::new(),
            default_lead,
        }
    }

    pub fn with_lead(mut self, provider: &str, lead: Duration) -> Self {
        self.leads.insert(provider.to_string(), lead);
        self
    }

    pub fn lead_for(&self, provider: &str) -> Duration {
        self.leads.get(provider).copied().unwrap_or(self.default_lead)
    }
}

/// Base wait after a failed refresh; doubles per consecutive failure.
const REFRESH_RETRY_BASE: Duration = Duration::from_secs(30);
const REFRESH_RETRY_CAP: Duration = Duration::from_secs(1800);
/// Idle wake interval when nothing is scheduled.
const IDLE_WAKE: Duration = Duration::from_secs(3600);

fn refresh_retry_wait(failures: u32) -> Duration {
    REFRESH_RETRY_BASE
        .saturating_mul(1 << failures.min(8))
        .min(REFRESH_RETRY_CAP)
}

impl AuthManager {
    async fn earliest_refresh_deadline(&self) -> Option<OffsetDateTime> {
        let registry = self.registry.read().await;
        registry
            .values()
            .filter(|a| !a.disabled)
            .filter_map(|a| a.next_refresh_after)
            .min()
    }

    async fn due_refresh_ids(&self, now: OffsetDateTime) -> Vec<String> {
        let registry = self.registry.read().await;
        registry
            .values()
            .filter(|a| !a.disabled)
            .filter(|a| a.next_refresh_after.is_some_and(|at| at <= now))
            .map(|a| a.id.clone())
            .collect()
    }

    async fn refresh_lock_for(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.refresh_locks.lock().await;
        locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Refresh one auth under its per-auth lock and write the result back
    /// through the persisting update path.
    pub async fn refresh_auth(&self, id: &str, failures: &mut HashMap<String, u32>) {
        let lock = self.refresh_lock_for(id).await;
        let _guard = lock.lock().await;

        let Some(auth) = self.get_by_id(id).await else {
            return;
        };
        let Some(executor) = self.executor_for(&auth.provider) else {
            tracing::warn!(id, provider = %auth.provider, "no executor for refresh");
            self.reschedule_refresh(id, None).await;
            return;
        };

        let ctx = ExecCtx::new(None);
        let now = OffsetDateTime::now_utc();
        match executor.refresh(&ctx, &auth).await {
            Ok(mut refreshed) => {
                failures.remove(id);
                refreshed.id = auth.id.clone();
                refreshed.status = AuthStatus::Active;
                refreshed.last_refreshed_at = Some(now);
                refreshed.next_refresh_after = self.next_refresh_for(&refreshed, now);
                // Virtual siblings read refreshed tokens out of the shared
                // pool; the refresh path is the single writer.
                if let Some(pool) = refreshed.shared_pool() {
                    pool.store(crate::runtime::PoolTokens {
                        access_token: refreshed
                            .metadata
                            .get("access_token")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string(),
                        refresh_token: refreshed
                            .metadata
                            .get("refresh_token")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string(),
                        expired: refreshed.expiration_time(),
                    });
                }
                if let Err(err) = self.update(&OpCtx::default(), refreshed).await {
                    tracing::warn!(id, error = %err, "refresh write-back failed");
                }
            }
            Err(err) => {
                let count = failures.entry(id.to_string()).or_insert(0);
                *count = count.saturating_add(1);
                let wait = refresh_retry_wait(*count);
                tracing::warn!(id, error = %err, failures = *count, "refresh failed");
                self.mark_refresh_failed(id, err.to_string(), now + wait).await;
            }
        }
    }

    fn next_refresh_for(&self, auth: &Auth, now: OffsetDateTime) -> Option<OffsetDateTime> {
        let expiry = auth.expiration_time()?;
        let lead = self.refresh_policy().lead_for(&auth.provider);
        let at = expiry - lead;
        Some(if at <= now { now + Duration::from_secs(60) } else { at })
    }

    async fn reschedule_refresh(&self, id: &str, at: Option<OffsetDateTime>) {
        let mut registry = self.registry.write().await;
        if let Some(auth) = registry.get_mut(id) {
            auth.next_refresh_after = at;
        }
    }

    async fn mark_refresh_failed(&self, id: &str, message: String, retry_at: OffsetDateTime) {
        let mut registry = self.registry.write().await;
        if let Some(auth) = registry.get_mut(id) {
            auth.status = AuthStatus::Error;
            auth.last_error = Some(crate::entity::LastError {
                code: "RefreshFailed".to_string(),
                message,
                retryable: true,
                http_status: None,
            });
            auth.next_refresh_after = Some(retry_at);
        }
    }

    /// Background refresh scheduler. Wakes when the earliest
    /// `next_refresh_after` elapses, when a registry change bumps the
    /// schedule, or when shutdown is signalled.
    pub fn spawn_refresh_loop(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut failures: HashMap<String, u32> = HashMap::new();
            loop {
                let now = OffsetDateTime::now_utc();
                let sleep_for = match manager.earliest_refresh_deadline().await {
                    Some(at) if at <= now => Duration::ZERO,
                    Some(at) => Duration::from_secs_f64((at - now).as_seconds_f64().max(0.0)),
                    None => IDLE_WAKE,
                };

                tokio::select! {
                    _ = tokio::time::sleep(sleep_for) => {}
                    _ = manager.refresh_notify.notified() => continue,
                    result = shutdown.changed() => {
                        if result.is_err() || *shutdown.borrow() {
                            return;
                        }
                        continue;
                    }
                }

                let now = OffsetDateTime::now_utc();
                for id in manager.due_refresh_ids(now).await {
                    manager.refresh_auth(&id, &mut failures).await;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_lead_lookup() {
        let policy = RefreshPolicy::default()
            .with_lead("codex", Duration::from_secs(3600));
        assert_eq!(policy.lead_for("codex"), Duration::from_secs(3600));
        assert_eq!(policy.lead_for("gemini-cli"), Duration::from_secs(300));
    }

    #[test]
    fn refresh_retry_backoff_caps() {
        assert_eq!(refresh_retry_wait(1), Duration::from_secs(60));
        assert_eq!(refresh_retry_wait(2), Duration::from_secs(120));
        assert_eq!(refresh_retry_wait(20), REFRESH_RETRY_CAP);
    }
}
