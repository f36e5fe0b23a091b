use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;

use llmux_auth::{
    Auth, AuthError, AuthManager, AuthStatus, ExecCtx, ExecError, ExecOptions, ExecRequest,
    ExecReport, ExecResponse, Executor, FillFirstSelector, ListFilter, OpCtx, PickOptions,
    RefreshPolicy, RetryConfig, RoundRobinSelector, StoreError, StreamResult, TokenStore,
    CLOSE_ALL_EXECUTION_SESSIONS,
};

#[derive(Default)]
struct MemoryStore {
    saves: Mutex<Vec<String>>,
    deletes: Mutex<Vec<String>>,
}

#[async_trait]
impl TokenStore for MemoryStore {
    async fn save(&self, auth: &Auth) -> Result<(), StoreError> {
        self.saves.lock().unwrap().push(auth.id.clone());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Auth>, StoreError> {
        Ok(Vec::new())
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.deletes.lock().unwrap().push(id.to_string());
        Ok(())
    }
}

struct ScriptedExecutor {
    id: String,
    script: Mutex<VecDeque<Result<u16, ExecError>>>,
    seen_models: Mutex<Vec<String>>,
    closed_sessions: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    fn new(id: &str, script: Vec<Result<u16, ExecError>>) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            script: Mutex::new(script.into()),
            seen_models: Mutex::new(Vec::new()),
            closed_sessions: Mutex::new(Vec::new()),
        })
    }

    fn next(&self) -> Result<ExecResponse, ExecError> {
        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(200));
        step.map(|status| ExecResponse {
            status,
            headers: Vec::new(),
            body: Bytes::from_static(b"{}"),
        })
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    fn identifier(&self) -> &str {
        &self.id
    }

    async fn execute(
        &self,
        _ctx: &ExecCtx,
        _auth: &Auth,
        req: ExecRequest,
        _opts: ExecOptions,
    ) -> Result<ExecResponse, ExecError> {
        self.seen_models.lock().unwrap().push(req.model.clone());
        self.next()
    }

    async fn execute_stream(
        &self,
        _ctx: &ExecCtx,
        _auth: &Auth,
        req: ExecRequest,
        _opts: ExecOptions,
    ) -> Result<StreamResult, ExecError> {
        self.seen_models.lock().unwrap().push(req.model.clone());
        self.next()?;
        let (tx, rx) = tokio::sync::mpsc::channel(4);
        tx.send(Ok(Bytes::from_static(b"chunk-1"))).await.ok();
        drop(tx);
        Ok(StreamResult { chunks: rx })
    }

    fn close_execution_session(&self, session_id: &str) {
        self.closed_sessions
            .lock()
            .unwrap()
            .push(session_id.to_string());
    }
}

fn auth(id: &str, provider: &str) -> Auth {
    Auth {
        id: id.to_string(),
        provider: provider.to_string(),
        status: AuthStatus::Active,
        ..Auth::default()
    }
}

fn manager_with(selector_round_robin: bool) -> AuthManager {
    let selector: Box<dyn llmux_auth::Selector> = if selector_round_robin {
        Box::new(RoundRobinSelector::default())
    } else {
        Box::new(FillFirstSelector)
    };
    AuthManager::new(
        Arc::new(MemoryStore::default()),
        selector,
        RetryConfig::default(),
        RefreshPolicy::default(),
    )
}

fn request(model: &str) -> ExecRequest {
    ExecRequest {
        method: http::Method::POST,
        url: "https://upstream.example.com/v1/messages".to_string(),
        headers: Vec::new(),
        body: Bytes::from_static(b"{}"),
        model: model.to_string(),
    }
}

#[tokio::test]
async fn register_is_replace_and_update_requires_existing() {
    let manager = manager_with(false);
    let ctx = OpCtx::default();

    manager.register(&ctx, auth("a", "claude")).await.unwrap();
    let mut replacement = auth("a", "claude");
    replacement.label = "replaced".to_string();
    manager.register(&ctx, replacement).await.unwrap();
    assert_eq!(manager.get_by_id("a").await.unwrap().label, "replaced");

    let err = manager.update(&ctx, auth("missing", "claude")).await.unwrap_err();
    assert!(matches!(err, AuthError::NotFound(_)));
}

#[tokio::test]
async fn skip_persist_marker_suppresses_store_writes() {
    let store = Arc::new(MemoryStore::default());
    let manager = AuthManager::new(
        store.clone(),
        Box::new(FillFirstSelector),
        RetryConfig::default(),
        RefreshPolicy::default(),
    );

    manager
        .register(&OpCtx::skip_persist(), auth("a", "claude"))
        .await
        .unwrap();
    assert!(store.saves.lock().unwrap().is_empty());

    manager.register(&OpCtx::default(), auth("b", "claude")).await.unwrap();
    assert_eq!(store.saves.lock().unwrap().as_slice(), ["b"]);

    manager
        .delete(&OpCtx::skip_persist(), "a")
        .await
        .unwrap();
    assert!(store.deletes.lock().unwrap().is_empty());
    manager.delete(&OpCtx::default(), "b").await.unwrap();
    assert_eq!(store.deletes.lock().unwrap().as_slice(), ["b"]);
}

#[tokio::test]
async fn list_filters_provider_status_and_disabled() {
    let manager = manager_with(false);
    let ctx = OpCtx::skip_persist();
    manager.register(&ctx, auth("a", "claude")).await.unwrap();
    let mut b = auth("b", "codex");
    b.disabled = true;
    manager.register(&ctx, b).await.unwrap();

    assert_eq!(manager.list(&ListFilter::default()).await.len(), 1);
    assert_eq!(
        manager
            .list(&ListFilter {
                include_disabled: true,
                ..ListFilter::default()
            })
            .await
            .len(),
        2
    );
    assert_eq!(
        manager
            .list(&ListFilter {
                provider: Some("codex".to_string()),
                include_disabled: true,
                ..ListFilter::default()
            })
            .await
            .len(),
        1
    );
}

#[tokio::test]
async fn quota_cooldown_excludes_then_success_clears() {
    let manager = manager_with(false);
    let ctx = OpCtx::skip_persist();
    manager.register(&ctx, auth("a", "claude")).await.unwrap();
    manager.register(&ctx, auth("b", "claude")).await.unwrap();

    let a = manager.get_by_id("a").await.unwrap();
    manager
        .mark_result(ExecReport::failure(
            &a,
            "m",
            1,
            ExecError::from_status(429, "rate limited"),
        ))
        .await;

    // `a` is cooling; selection falls to `b`.
    let picked = manager.pick("claude", "m", &PickOptions::default()).await.unwrap();
    assert_eq!(picked.id, "b");

    manager.mark_result(ExecReport::success(&a, "m", 0)).await;
    let picked = manager.pick("claude", "m", &PickOptions::default()).await.unwrap();
    assert_eq!(picked.id, "a");
}

#[tokio::test]
async fn cooldown_error_redacts_mixed_provider() {
    let manager = manager_with(false);
    let ctx = OpCtx::skip_persist();
    manager.register(&ctx, auth("a", "claude")).await.unwrap();
    let a = manager.get_by_id("a").await.unwrap();
    manager
        .mark_result(ExecReport::failure(
            &a,
            "m",
            1,
            ExecError::from_status(429, "rate limited"),
        ))
        .await;

    let err = manager
        .pick("claude", "m", &PickOptions::default())
        .await
        .unwrap_err();
    match &err {
        AuthError::ModelCooldown {
            provider,
            retry_after,
            ..
        } => {
            assert_eq!(provider.as_deref(), Some("claude"));
            assert!(retry_after.is_some());
        }
        other => panic!("unexpected error: {other:?}"),
    }

    let err = manager
        .pick("mixed", "m", &PickOptions::default())
        .await
        .unwrap_err();
    match &err {
        AuthError::ModelCooldown { provider, .. } => assert_eq!(provider.as_deref(), None),
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(err.to_json_body().get("provider").is_none());
}

#[tokio::test(start_paused = true)]
async fn execute_retries_with_cooling_disabled() {
    let manager = manager_with(false);
    let ctx = OpCtx::skip_persist();
    let mut a = auth("a", "claude");
    a.metadata
        .insert("disable_cooling".to_string(), serde_json::json!(true));
    manager.register(&ctx, a).await.unwrap();

    let executor = ScriptedExecutor::new(
        "claude",
        vec![
            Err(ExecError::from_status(503, "unavailable")),
            Err(ExecError::network("reset")),
            Ok(200),
        ],
    );
    manager.register_executor(executor.clone());

    let resp = manager
        .execute(
            &ExecCtx::new(None),
            "claude",
            "m",
            request("m"),
            ExecOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status, 200);
    assert_eq!(executor.seen_models.lock().unwrap().len(), 3);

    // With cooling disabled the 5xx failures never wrote a retry timestamp.
    let a = manager.get_by_id("a").await.unwrap();
    assert!(a
        .model_state("m")
        .is_none_or(|ms| ms.next_retry_after.is_none()));
}

#[tokio::test(start_paused = true)]
async fn execute_fails_over_to_sibling_after_transient() {
    let manager = manager_with(false);
    let ctx = OpCtx::skip_persist();
    manager.register(&ctx, auth("a", "claude")).await.unwrap();
    manager.register(&ctx, auth("b", "claude")).await.unwrap();

    let executor = ScriptedExecutor::new(
        "claude",
        vec![Err(ExecError::from_status(502, "bad gateway")), Ok(200)],
    );
    manager.register_executor(executor.clone());

    let resp = manager
        .execute(
            &ExecCtx::new(None),
            "claude",
            "m",
            request("m"),
            ExecOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status, 200);

    // Fill-first tried `a` first; its cooldown pushed the retry onto `b`.
    let a = manager.get_by_id("a").await.unwrap();
    assert!(a.model_state("m").unwrap().unavailable);
    let b = manager.get_by_id("b").await.unwrap();
    assert!(b.model_state("m").unwrap().next_retry_after.is_none());
}

#[tokio::test]
async fn execute_gives_up_on_fatal_error() {
    let manager = manager_with(false);
    let ctx = OpCtx::skip_persist();
    manager.register(&ctx, auth("a", "claude")).await.unwrap();
    let executor = ScriptedExecutor::new(
        "claude",
        vec![Err(ExecError::from_status(400, "bad request"))],
    );
    manager.register_executor(executor.clone());

    let err = manager
        .execute(
            &ExecCtx::new(None),
            "claude",
            "m",
            request("m"),
            ExecOptions::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.http_status(), 400);
    assert_eq!(executor.seen_models.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn request_retry_zero_override_disables_retry() {
    let manager = manager_with(false);
    let ctx = OpCtx::skip_persist();
    let mut a = auth("a", "claude");
    a.metadata
        .insert("request_retry".to_string(), serde_json::json!(0));
    manager.register(&ctx, a).await.unwrap();

    let executor = ScriptedExecutor::new(
        "claude",
        vec![Err(ExecError::from_status(503, "unavailable")), Ok(200)],
    );
    manager.register_executor(executor.clone());

    let err = manager
        .execute(
            &ExecCtx::new(None),
            "claude",
            "m",
            request("m"),
            ExecOptions::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.http_status(), 503);
    assert_eq!(executor.seen_models.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn execute_stream_establishment_reports_success() {
    let manager = manager_with(false);
    let ctx = OpCtx::skip_persist();
    manager.register(&ctx, auth("a", "claude")).await.unwrap();
    let executor = ScriptedExecutor::new("claude", vec![Ok(200)]);
    manager.register_executor(executor);

    let mut stream = manager
        .execute_stream(
            &ExecCtx::new(None),
            "claude",
            "m",
            request("m"),
            ExecOptions::default(),
        )
        .await
        .unwrap();
    let first = stream.chunks.recv().await.unwrap().unwrap();
    assert_eq!(&first[..], b"chunk-1");
    assert!(stream.chunks.recv().await.is_none());
}

#[tokio::test]
async fn alias_resolution_applies_per_channel() {
    let manager = manager_with(false);
    let ctx = OpCtx::skip_persist();

    let mut oauth = auth("a", "gemini-cli");
    oauth.attributes.insert(
        "auth_kind".to_string(),
        "oauth".to_string(),
    );
    manager.register(&ctx, oauth).await.unwrap();

    let mut aliases = std::collections::HashMap::new();
    aliases.insert(
        "gemini-cli".to_string(),
        vec![llmux_common::AliasRule {
            name: "gemini-2.5-pro-exp-03-25".to_string(),
            alias: "gemini-2.5-pro".to_string(),
            fork: false,
        }],
    );
    manager.set_oauth_model_alias(&aliases);

    let executor = ScriptedExecutor::new("gemini-cli", vec![Ok(200)]);
    manager.register_executor(executor.clone());

    manager
        .execute(
            &ExecCtx::new(None),
            "gemini-cli",
            "gemini-2.5-pro(8192)",
            request("gemini-2.5-pro(8192)"),
            ExecOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(
        executor.seen_models.lock().unwrap().as_slice(),
        ["gemini-2.5-pro-exp-03-25(8192)"]
    );
}

#[tokio::test]
async fn replaced_executor_is_told_to_close_sessions() {
    let manager = manager_with(false);
    let old = ScriptedExecutor::new("claude", vec![]);
    let new = ScriptedExecutor::new("claude", vec![]);
    manager.register_executor(old.clone());
    manager.register_executor(new);
    assert_eq!(
        old.closed_sessions.lock().unwrap().as_slice(),
        [CLOSE_ALL_EXECUTION_SESSIONS]
    );
}

#[tokio::test]
async fn prefixed_models_route_to_prefixed_auths() {
    let manager = manager_with(false);
    let ctx = OpCtx::skip_persist();
    let mut team = auth("team-auth", "gemini");
    team.prefix = Some("teamA".to_string());
    manager.register(&ctx, team).await.unwrap();
    manager.register(&ctx, auth("plain", "gemini")).await.unwrap();

    let picked = manager
        .pick("gemini", "teamA/gemini-3-pro", &PickOptions::default())
        .await
        .unwrap();
    assert_eq!(picked.id, "team-auth");

    let picked = manager
        .pick("gemini", "gemini-3-pro", &PickOptions::default())
        .await
        .unwrap();
    assert_eq!(picked.id, "plain");
}

#[tokio::test]
async fn round_robin_manager_cycle() {
    let manager = manager_with(true);
    let ctx = OpCtx::skip_persist();
    for id in ["a", "b", "c"] {
        manager.register(&ctx, auth(id, "claude")).await.unwrap();
    }

    let mut picks = Vec::new();
    for _ in 0..11 {
        picks.push(
            manager
                .pick("claude", "m", &PickOptions::default())
                .await
                .unwrap()
                .id,
        );
    }
    assert_eq!(
        picks,
        ["a", "b", "c", "a", "b", "c", "a", "b", "c", "a", "b"]
    );
}
