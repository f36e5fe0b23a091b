pub mod refresh;
pub mod retry;
pub mod select;

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use time::OffsetDateTime;
use tokio::sync::{Notify, RwLock};

use llmux_common::AliasRule;

use crate::entity::{Auth, AuthStatus, AuthUpdate, AuthUpdateAction};
use crate::error::{AuthError, ExecError};
use crate::executor::{
    ExecCtx, ExecOptions, ExecRequest, ExecResponse, Executor, StreamResult,
    CLOSE_ALL_EXECUTION_SESSIONS,
};
use crate::model::alias::AliasTable;
use crate::store::TokenStore;

pub use refresh::RefreshPolicy;
pub use retry::RetryConfig;
pub use select::{PickError, PickOptions, Selector};

/// Pseudo-provider for cross-provider selection.
pub const MIXED_PROVIDER: &str = "mixed";

/// Per-operation context. The watcher marks file-sourced updates
/// skip-persist so the manager does not write back the file it just read.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpCtx {
    pub skip_persist: bool,
}

impl OpCtx {
    pub fn skip_persist() -> Self {
        Self { skip_persist: true }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub provider: Option<String>,
    pub status: Option<AuthStatus>,
    pub include_disabled: bool,
}

#[derive(Debug, Clone)]
pub enum Outcome {
    Success,
    Failure(ExecError),
}

/// The single payload through which execution results mutate quota and
/// cooldown state.
#[derive(Debug, Clone)]
pub struct ExecReport {
    pub auth_id: String,
    pub provider: String,
    pub model: String,
    pub attempt: u32,
    pub outcome: Outcome,
}

impl ExecReport {
    pub fn success(auth: &Auth, model: &str, attempt: u32) -> Self {
        Self {
            auth_id: auth.id.clone(),
            provider: auth.provider.clone(),
            model: model.to_string(),
            attempt,
            outcome: Outcome::Success,
        }
    }

    pub fn failure(auth: &Auth, model: &str, attempt: u32, err: ExecError) -> Self {
        Self {
            auth_id: auth.id.clone(),
            provider: auth.provider.clone(),
            model: model.to_string(),
            attempt,
            outcome: Outcome::Failure(err),
        }
    }
}

/// Registry of auths plus the selection, retry and refresh machinery.
///
/// One writer at a time, many readers: every mutable path takes the write
/// half of a single `RwLock`, selection takes the read half, and callers
/// only ever receive clones.
pub struct AuthManager {
    registry: RwLock<HashMap<String, Auth>>,
    executors: std::sync::RwLock<HashMap<String, Arc<dyn Executor>>>,
    selector: Box<dyn Selector>,
    alias: ArcSwap<AliasTable>,
    store: Arc<dyn TokenStore>,
    retry: ArcSwap<RetryConfig>,
    refresh_policy: RefreshPolicy,
    pub(crate) refresh_notify: Notify,
    pub(crate) refresh_locks: tokio::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl AuthManager {
    pub fn new(
        store: Arc<dyn TokenStore>,
        selector: Box<dyn Selector>,
        retry: RetryConfig,
        refresh_policy: RefreshPolicy,
    ) -> Self {
        Self {
            registry: RwLock::new(HashMap::new()),
            executors: std::sync::RwLock::new(HashMap::new()),
            selector,
            alias: ArcSwap::from_pointee(AliasTable::default()),
            store,
            retry: ArcSwap::from_pointee(retry),
            refresh_policy,
            refresh_notify: Notify::new(),
            refresh_locks: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn retry_config(&self) -> Arc<RetryConfig> {
        self.retry.load_full()
    }

    pub fn set_retry_config(&self, retry: RetryConfig) {
        self.retry.store(Arc::new(retry));
    }

    pub fn refresh_policy(&self) -> &RefreshPolicy {
        &self.refresh_policy
    }

    // ---- Registry ----

    /// Insert or replace by id.
    pub async fn register(&self, ctx: &OpCtx, mut auth: Auth) -> Result<Auth, AuthError> {
        auth.ensure_index();
        let now = OffsetDateTime::now_utc();
        auth.updated_at = Some(now);
        {
            let mut registry = self.registry.write().await;
            auth.created_at = registry
                .get(&auth.id)
                .and_then(|existing| existing.created_at)
                .or(Some(now));
            registry.insert(auth.id.clone(), auth.clone());
        }
        if !ctx.skip_persist {
            self.store.save(&auth).await?;
        }
        self.refresh_notify.notify_one();
        Ok(auth)
    }

    /// Modify in place by id; fails when the id is unknown.
    pub async fn update(&self, ctx: &OpCtx, mut auth: Auth) -> Result<Auth, AuthError> {
        auth.ensure_index();
        let now = OffsetDateTime::now_utc();
        auth.updated_at = Some(now);
        {
            let mut registry = self.registry.write().await;
            let existing = registry
                .get(&auth.id)
                .ok_or_else(|| AuthError::NotFound(auth.id.clone()))?;
            auth.created_at = existing.created_at;
            registry.insert(auth.id.clone(), auth.clone());
        }
        if !ctx.skip_persist {
            self.store.save(&auth).await?;
        }
        self.refresh_notify.notify_one();
        Ok(auth)
    }

    pub async fn delete(&self, ctx: &OpCtx, id: &str) -> Result<(), AuthError> {
        {
            let mut registry = self.registry.write().await;
            registry
                .remove(id)
                .ok_or_else(|| AuthError::NotFound(id.to_string()))?;
        }
        if !ctx.skip_persist {
            self.store.delete(id).await?;
        }
        self.refresh_locks.lock().await.remove(id);
        Ok(())
    }

    pub async fn get_by_id(&self, id: &str) -> Option<Auth> {
        self.registry.read().await.get(id).cloned()
    }

    pub async fn list(&self, filter: &ListFilter) -> Vec<Auth> {
        let registry = self.registry.read().await;
        let mut auths: Vec<Auth> = registry
            .values()
            .filter(|a| {
                if !filter.include_disabled && a.disabled {
                    return false;
                }
                if let Some(provider) = filter.provider.as_deref()
                    && a.provider != provider
                {
                    return false;
                }
                if let Some(status) = filter.status
                    && a.status != status
                {
                    return false;
                }
                true
            })
            .cloned()
            .collect();
        auths.sort_by(|a, b| a.id.cmp(&b.id));
        auths
    }

    /// Apply one watcher/relay-sourced update. File-sourced updates come in
    /// with the skip-persist marker already set by the caller.
    pub async fn apply_update(&self, ctx: &OpCtx, update: AuthUpdate) {
        let result = match (update.action, update.auth) {
            (AuthUpdateAction::Add, Some(auth)) => self.register(ctx, auth).await.map(|_| ()),
            (AuthUpdateAction::Modify, Some(auth)) => {
                match self.update(ctx, auth.clone()).await {
                    Err(AuthError::NotFound(_)) => self.register(ctx, auth).await.map(|_| ()),
                    other => other.map(|_| ()),
                }
            }
            (AuthUpdateAction::Delete, _) => match self.delete(ctx, &update.id).await {
                Err(AuthError::NotFound(_)) => Ok(()),
                other => other,
            },
            (_, None) => Ok(()),
        };
        if let Err(err) = result {
            tracing::warn!(id = %update.id, error = %err, "auth update failed");
        }
    }

    // ---- Selection ----

    /// Whether any live auth could serve the given (possibly prefixed) model.
    /// Used as the availability gate for request-time model mapping.
    pub async fn has_provider_for_model(&self, model: &str) -> bool {
        let (prefix, _) = split_prefix(model);
        let registry = self.registry.read().await;
        registry
            .values()
            .any(|a| !a.disabled && a.prefix.as_deref() == prefix)
    }

    pub async fn pick(
        &self,
        provider: &str,
        model: &str,
        opts: &PickOptions,
    ) -> Result<Auth, AuthError> {
        let (prefix, base_model) = split_prefix(model);
        let now = OffsetDateTime::now_utc();
        let registry = self.registry.read().await;
        let candidates: Vec<&Auth> = registry
            .values()
            .filter(|a| provider == MIXED_PROVIDER || a.provider == provider)
            .filter(|a| a.prefix.as_deref() == prefix)
            .collect();

        match self
            .selector
            .pick(provider, base_model, opts, &candidates, now)
        {
            Ok(id) => registry
                .get(&id)
                .cloned()
                .ok_or_else(|| AuthError::NotFound(id)),
            Err(PickError::NoCandidates) => Err(AuthError::NoAuthAvailable {
                provider: provider.to_string(),
                model: model.to_string(),
            }),
            Err(PickError::Cooldown { retry_after }) => Err(AuthError::ModelCooldown {
                provider: (provider != MIXED_PROVIDER).then(|| provider.to_string()),
                model: model.to_string(),
                retry_after,
            }),
        }
    }

    // ---- Execution ----

    pub async fn execute(
        &self,
        ctx: &ExecCtx,
        provider: &str,
        model: &str,
        req: ExecRequest,
        opts: ExecOptions,
    ) -> Result<ExecResponse, AuthError> {
        let mut attempt: u32 = 0;
        loop {
            let (auth, executor, exec_req) = self.prepare(provider, model, &req).await?;
            let exec_ctx = ExecCtx {
                trace_id: ctx.trace_id.clone(),
                attempt,
            };
            match executor.execute(&exec_ctx, &auth, exec_req, opts.clone()).await {
                Ok(resp) => {
                    self.mark_result(ExecReport::success(&auth, model, attempt))
                        .await;
                    return Ok(resp);
                }
                Err(err) => {
                    attempt += 1;
                    if let Some(wait) = self.handle_failure(&auth, model, attempt, &err).await {
                        tokio::time::sleep(wait).await;
                    } else {
                        return Err(err.into());
                    }
                }
            }
        }
    }

    pub async fn execute_stream(
        &self,
        ctx: &ExecCtx,
        provider: &str,
        model: &str,
        req: ExecRequest,
        opts: ExecOptions,
    ) -> Result<StreamResult, AuthError> {
        let mut attempt: u32 = 0;
        loop {
            let (auth, executor, exec_req) = self.prepare(provider, model, &req).await?;
            let exec_ctx = ExecCtx {
                trace_id: ctx.trace_id.clone(),
                attempt,
            };
            match executor
                .execute_stream(&exec_ctx, &auth, exec_req, opts.clone())
                .await
            {
                Ok(stream) => {
                    // Stream establishment counts as success; mid-stream
                    // failures surface on the chunk channel.
                    self.mark_result(ExecReport::success(&auth, model, attempt))
                        .await;
                    return Ok(stream);
                }
                Err(err) => {
                    attempt += 1;
                    if let Some(wait) = self.handle_failure(&auth, model, attempt, &err).await {
                        tokio::time::sleep(wait).await;
                    } else {
                        return Err(err.into());
                    }
                }
            }
        }
    }

    async fn prepare(
        &self,
        provider: &str,
        model: &str,
        req: &ExecRequest,
    ) -> Result<(Auth, Arc<dyn Executor>, ExecRequest), AuthError> {
        let auth = self.pick(provider, model, &PickOptions::default()).await?;
        let executor = self
            .executor_for(&auth.provider)
            .ok_or_else(|| AuthError::ExecutorMissing(auth.provider.clone()))?;
        let mut exec_req = req.clone();
        exec_req.model = self.resolve_upstream_model(&auth, model);
        Ok((auth, executor, exec_req))
    }

    /// Record the failure; `Some(wait)` means retry after that long.
    async fn handle_failure(
        &self,
        auth: &Auth,
        model: &str,
        attempt: u32,
        err: &ExecError,
    ) -> Option<std::time::Duration> {
        self.mark_result(ExecReport::failure(auth, model, attempt, err.clone()))
            .await;
        let retry_cfg = self.retry_config();
        let (wait, retry) = retry::should_retry_after_error(err, attempt, auth, &retry_cfg);
        retry.then_some(wait)
    }

    pub async fn mark_result(&self, report: ExecReport) {
        let now = OffsetDateTime::now_utc();
        let retry_cfg = self.retry_config();
        let mut needs_refresh = false;
        {
            let mut registry = self.registry.write().await;
            let Some(auth) = registry.get_mut(&report.auth_id) else {
                return;
            };
            match &report.outcome {
                Outcome::Success => retry::apply_success(auth, &report.model, now),
                Outcome::Failure(err) => {
                    retry::apply_failure(auth, &report.model, err, report.attempt, &retry_cfg, now);
                    needs_refresh = auth.status == AuthStatus::Refreshing;
                }
            }
        }
        if needs_refresh {
            self.refresh_notify.notify_one();
        }
    }

    // ---- Executors ----

    /// Register an executor keyed by its identifier. A replaced executor is
    /// told to tear down every session it still owns.
    pub fn register_executor(&self, executor: Arc<dyn Executor>) {
        let id = executor.identifier().to_string();
        let outgoing = {
            let mut table = self.executors.write().expect("executor table poisoned");
            table.insert(id, executor)
        };
        if let Some(outgoing) = outgoing {
            outgoing.close_execution_session(CLOSE_ALL_EXECUTION_SESSIONS);
        }
    }

    pub fn executor_for(&self, provider: &str) -> Option<Arc<dyn Executor>> {
        self.executors
            .read()
            .expect("executor table poisoned")
            .get(provider)
            .cloned()
    }

    // ---- Model alias ----

    pub fn set_oauth_model_alias(&self, config: &HashMap<String, Vec<AliasRule>>) {
        self.alias.store(Arc::new(AliasTable::compile(config)));
    }

    /// Substitute the upstream model for an aliased request, per the auth's
    /// OAuth channel. API-key auths pass through unchanged.
    pub fn resolve_upstream_model(&self, auth: &Auth, requested: &str) -> String {
        let Some(channel) = auth.channel() else {
            return requested.to_string();
        };
        self.alias
            .load()
            .resolve(channel, requested)
            .unwrap_or_else(|| requested.to_string())
    }
}

fn split_prefix(model: &str) -> (Option<&str>, &str) {
    match model.split_once('/') {
        Some((prefix, rest)) if !prefix.is_empty() && !rest.is_empty() => (Some(prefix), rest),
        _ => (None, model),
    }
}
