use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, Notify};

use llmux_auth::entity::{Auth, AuthStatus, AuthUpdate, AuthUpdateAction};
use llmux_auth::{
    ExecCtx, ExecError, ExecOptions, ExecRequest, ExecResponse, Executor, StreamResult,
    CLOSE_ALL_EXECUTION_SESSIONS,
};

pub const MAX_RELAY_MESSAGE_BYTES: usize = 64 * 1024 * 1024;
const PING_INTERVAL: Duration = Duration::from_secs(30);
const READ_TIMEOUT: Duration = Duration::from_secs(60);
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
/// Cap on waiting for a relayed response or stream start.
const RELAY_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeType {
    HttpRequest,
    HttpResponse,
    StreamStart,
    StreamChunk,
    StreamEnd,
    Error,
    Ping,
    Pong,
}

/// Wire envelope: `{id, type, payload?}`; `id` is the per-request UUID.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: EnvelopeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestPayload {
    pub method: String,
    pub url: String,
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    pub sent_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponsePayload {
    pub status: u16,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkPayload {
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

enum PendingEntry {
    Unary(oneshot::Sender<Result<ResponsePayload, ExecError>>),
    Stream {
        started: Option<oneshot::Sender<Result<(), ExecError>>>,
        chunks: mpsc::Sender<Result<Bytes, ExecError>>,
    },
}

/// One connected relay worker for one provider.
pub struct RelaySession {
    provider: String,
    outbound: mpsc::Sender<Envelope>,
    pending: Mutex<HashMap<String, PendingEntry>>,
    closed: AtomicBool,
    shutdown: Notify,
}

impl RelaySession {
    fn new(provider: impl Into<String>) -> (Arc<Self>, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(64);
        (
            Arc::new(Self {
                provider: provider.into(),
                outbound: tx,
                pending: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
                shutdown: Notify::new(),
            }),
            rx,
        )
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    fn register_unary(
        &self,
        id: &str,
    ) -> Result<oneshot::Receiver<Result<ResponsePayload, ExecError>>, ExecError> {
        let mut pending = self.pending.lock().expect("relay pending poisoned");
        if pending.contains_key(id) {
            return Err(ExecError::network(format!("duplicate relay request id {id}")));
        }
        let (tx, rx) = oneshot::channel();
        pending.insert(id.to_string(), PendingEntry::Unary(tx));
        Ok(rx)
    }

    #[allow(clippy::type_complexity)]
    fn register_stream(
        &self,
        id: &str,
    ) -> Result<
        (
            oneshot::Receiver<Result<(), ExecError>>,
            mpsc::Receiver<Result<Bytes, ExecError>>,
        ),
        ExecError,
    > {
        let mut pending = self.pending.lock().expect("relay pending poisoned");
        if pending.contains_key(id) {
            return Err(ExecError::network(format!("duplicate relay request id {id}")));
        }
        let (start_tx, start_rx) = oneshot::channel();
        let (chunk_tx, chunk_rx) = mpsc::channel(64);
        pending.insert(
            id.to_string(),
            PendingEntry::Stream {
                started: Some(start_tx),
                chunks: chunk_tx,
            },
        );
        Ok((start_rx, chunk_rx))
    }

    async fn send(&self, envelope: Envelope) -> Result<(), ExecError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(ExecError::network("relay session closed"));
        }
        self.outbound
            .send(envelope)
            .await
            .map_err(|_| ExecError::network("relay session closed"))
    }

    /// Route one inbound envelope to whoever is waiting on its id. Unknown
    /// or duplicate ids are dropped with a log line.
    async fn handle_envelope(&self, envelope: Envelope) {
        match envelope.kind {
            EnvelopeType::Ping => {
                let _ = self
                    .outbound
                    .try_send(Envelope {
                        id: envelope.id,
                        kind: EnvelopeType::Pong,
                        payload: None,
                    });
            }
            EnvelopeType::Pong => {}
            EnvelopeType::HttpResponse => {
                let entry = self.take_pending(&envelope.id);
                let Some(PendingEntry::Unary(tx)) = entry else {
                    tracing::debug!(id = %envelope.id, "relay response for unknown request");
                    return;
                };
                let result = envelope
                    .payload
                    .and_then(|p| serde_json::from_value::<ResponsePayload>(p).ok())
                    .ok_or_else(|| ExecError::network("malformed relay response payload"));
                let _ = tx.send(result);
            }
            EnvelopeType::StreamStart => {
                let mut pending = self.pending.lock().expect("relay pending poisoned");
                if let Some(PendingEntry::Stream { started, .. }) = pending.get_mut(&envelope.id) {
                    if let Some(tx) = started.take() {
                        let _ = tx.send(Ok(()));
                    }
                }
            }
            EnvelopeType::StreamChunk => {
                let chunks = {
                    let pending = self.pending.lock().expect("relay pending poisoned");
                    match pending.get(&envelope.id) {
                        Some(PendingEntry::Stream { chunks, .. }) => Some(chunks.clone()),
                        _ => None,
                    }
                };
                let Some(chunks) = chunks else { return };
                let data = envelope
                    .payload
                    .and_then(|p| serde_json::from_value::<ChunkPayload>(p).ok())
                    .map(|c| Bytes::from(c.data.into_bytes()));
                if let Some(data) = data {
                    let _ = chunks.send(Ok(data)).await;
                }
            }
            EnvelopeType::StreamEnd => {
                // Dropping the entry closes the chunk channel.
                self.take_pending(&envelope.id);
            }
            EnvelopeType::Error => {
                let payload = envelope
                    .payload
                    .and_then(|p| serde_json::from_value::<ErrorPayload>(p).ok())
                    .unwrap_or(ErrorPayload {
                        error: "relay error".to_string(),
                        status: None,
                    });
                let err = match payload.status {
                    Some(status) => ExecError::from_status(status, payload.error),
                    None => ExecError::network(payload.error),
                };
                match self.take_pending(&envelope.id) {
                    Some(PendingEntry::Unary(tx)) => {
                        let _ = tx.send(Err(err));
                    }
                    Some(PendingEntry::Stream { started, chunks }) => {
                        if let Some(tx) = started {
                            let _ = tx.send(Err(err));
                        } else {
                            let _ = chunks.send(Err(err)).await;
                        }
                    }
                    None => {}
                }
            }
            EnvelopeType::HttpRequest => {
                tracing::debug!(id = %envelope.id, "unexpected http_request from relay worker");
            }
        }
    }

    fn take_pending(&self, id: &str) -> Option<PendingEntry> {
        self.pending.lock().expect("relay pending poisoned").remove(id)
    }

    fn fail_pending(&self, id: &str, reason: &str) {
        if let Some(entry) = self.take_pending(id) {
            deliver_failure(entry, reason);
        }
    }

    /// Terminate the session: every pending request gets a terminal error
    /// and the writer task is told to stop.
    pub fn close(&self, reason: &str) {
        if self.closed.swap(true, Ordering::Relaxed) {
            return;
        }
        let entries: Vec<PendingEntry> = {
            let mut pending = self.pending.lock().expect("relay pending poisoned");
            pending.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            deliver_failure(entry, reason);
        }
        self.shutdown.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }
}

fn deliver_failure(entry: PendingEntry, reason: &str) {
    match entry {
        PendingEntry::Unary(tx) => {
            let _ = tx.send(Err(ExecError::network(reason)));
        }
        PendingEntry::Stream { started, chunks } => {
            if let Some(tx) = started {
                let _ = tx.send(Err(ExecError::network(reason)));
            } else {
                let _ = chunks.try_send(Err(ExecError::network(reason)));
            }
        }
    }
}

type UpdateHook = Box<dyn Fn(AuthUpdate) + Send + Sync>;

/// Registry of live relay sessions, one per provider key. A second worker
/// for the same provider replaces the first.
pub struct RelayHub {
    sessions: RwLock<HashMap<String, Arc<RelaySession>>>,
    on_update: Option<UpdateHook>,
}

impl RelayHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            on_update: None,
        })
    }

    /// Hook invoked with Add/Delete updates as workers connect and leave;
    /// the app routes these into the dispatcher alongside file updates.
    pub fn with_update_hook(hook: impl Fn(AuthUpdate) + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            on_update: Some(Box::new(hook)),
        })
    }

    pub fn session(&self, provider: &str) -> Option<Arc<RelaySession>> {
        self.sessions
            .read()
            .expect("relay sessions poisoned")
            .get(provider)
            .cloned()
    }

    fn install(&self, session: Arc<RelaySession>) -> Option<Arc<RelaySession>> {
        self.sessions
            .write()
            .expect("relay sessions poisoned")
            .insert(session.provider.clone(), session)
    }

    fn remove(&self, session: &Arc<RelaySession>) {
        let mut sessions = self.sessions.write().expect("relay sessions poisoned");
        if let Some(current) = sessions.get(session.provider())
            && Arc::ptr_eq(current, session)
        {
            sessions.remove(session.provider());
        }
    }

    pub fn close_all(&self, reason: &str) {
        let sessions: Vec<Arc<RelaySession>> = {
            let mut guard = self.sessions.write().expect("relay sessions poisoned");
            guard.drain().map(|(_, s)| s).collect()
        };
        for session in sessions {
            session.close(reason);
        }
    }

    fn emit_update(&self, update: AuthUpdate) {
        if let Some(hook) = self.on_update.as_ref() {
            hook(update);
        }
    }

    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/relay/{provider}", get(relay_upgrade))
            .with_state(Arc::clone(self))
    }
}

fn relay_auth(provider: &str) -> Auth {
    let mut auth = Auth {
        id: format!("relay-{provider}"),
        provider: provider.to_string(),
        label: format!("{provider} relay worker"),
        status: AuthStatus::Active,
        ..Auth::default()
    };
    auth.attributes
        .insert("source".to_string(), "relay".to_string());
    auth.ensure_index();
    auth
}

async fn relay_upgrade(
    ws: WebSocketUpgrade,
    Path(provider): Path<String>,
    State(hub): State<Arc<RelayHub>>,
) -> Response {
    ws.max_message_size(MAX_RELAY_MESSAGE_BYTES)
        .on_upgrade(move |socket| handle_socket(socket, provider, hub))
}

async fn handle_socket(socket: WebSocket, provider: String, hub: Arc<RelayHub>) {
    let (session, mut out_rx) = RelaySession::new(provider.clone());
    if let Some(old) = hub.install(session.clone()) {
        old.close("replaced by new connection");
    }
    hub.emit_update(AuthUpdate {
        action: AuthUpdateAction::Add,
        id: format!("relay-{provider}"),
        auth: Some(relay_auth(&provider)),
    });
    tracing::info!(%provider, "relay worker connected");

    let (mut sink, mut stream) = socket.split();

    // Writer half: serialized envelopes plus the keep-alive ping.
    let writer_session = session.clone();
    let writer = tokio::spawn(async move {
        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ping.tick().await;
        loop {
            let envelope = tokio::select! {
                env = out_rx.recv() => match env {
                    Some(env) => env,
                    None => return,
                },
                _ = ping.tick() => Envelope {
                    id: uuid::Uuid::new_v4().to_string(),
                    kind: EnvelopeType::Ping,
                    payload: None,
                },
                _ = writer_session.shutdown.notified() => return,
            };
            let Ok(text) = serde_json::to_string(&envelope) else {
                continue;
            };
            let send = sink.send(Message::Text(text.into()));
            if tokio::time::timeout(WRITE_TIMEOUT, send).await.is_err() {
                writer_session.close("relay write timeout");
                return;
            }
        }
    });

    // Reader half with the 60s deadline.
    loop {
        let next = tokio::time::timeout(READ_TIMEOUT, stream.next()).await;
        let message = match next {
            Err(_) => {
                tracing::warn!(%provider, "relay read deadline exceeded");
                break;
            }
            Ok(None) | Ok(Some(Err(_))) => break,
            Ok(Some(Ok(message))) => message,
        };
        let text = match message {
            Message::Text(text) => text.to_string(),
            Message::Binary(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => continue,
        };
        match serde_json::from_str::<Envelope>(&text) {
            Ok(envelope) => session.handle_envelope(envelope).await,
            Err(err) => tracing::debug!(%provider, error = %err, "undecodable relay envelope"),
        }
    }

    hub.remove(&session);
    session.close("relay session disconnected");
    writer.abort();
    hub.emit_update(AuthUpdate {
        action: AuthUpdateAction::Delete,
        id: format!("relay-{provider}"),
        auth: None,
    });
    tracing::info!(%provider, "relay worker disconnected");
}

/// Bridges relay workers into the manager's executor table: requests for the
/// provider are serialized onto the worker's websocket and the responses
/// correlated back by envelope id.
pub struct RelayExecutor {
    provider: String,
    hub: Arc<RelayHub>,
}

impl RelayExecutor {
    pub fn new(provider: impl Into<String>, hub: Arc<RelayHub>) -> Self {
        Self {
            provider: provider.into(),
            hub,
        }
    }

    fn session(&self) -> Result<Arc<RelaySession>, ExecError> {
        self.hub
            .session(&self.provider)
            .ok_or_else(|| ExecError::network("no relay worker connected"))
    }

    fn request_payload(req: &ExecRequest) -> RequestPayload {
        RequestPayload {
            method: req.method.to_string(),
            url: req.url.clone(),
            headers: req
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            body: if req.body.is_empty() {
                None
            } else {
                Some(String::from_utf8_lossy(&req.body).into_owned())
            },
            sent_at: time::OffsetDateTime::now_utc().unix_timestamp(),
        }
    }
}

#[async_trait]
impl Executor for RelayExecutor {
    fn identifier(&self) -> &str {
        &self.provider
    }

    async fn execute(
        &self,
        _ctx: &ExecCtx,
        _auth: &Auth,
        req: ExecRequest,
        _opts: ExecOptions,
    ) -> Result<ExecResponse, ExecError> {
        let session = self.session()?;
        let id = uuid::Uuid::new_v4().to_string();
        let rx = session.register_unary(&id)?;
        let payload = serde_json::to_value(Self::request_payload(&req))
            .map_err(|err| ExecError::network(err.to_string()))?;
        session
            .send(Envelope {
                id: id.clone(),
                kind: EnvelopeType::HttpRequest,
                payload: Some(payload),
            })
            .await?;

        let response = match tokio::time::timeout(RELAY_REQUEST_TIMEOUT, rx).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => return Err(ExecError::network("relay session dropped request")),
            Err(_) => {
                session.fail_pending(&id, "relay request timed out");
                return Err(ExecError::network("relay request timed out"));
            }
        };
        if response.status >= 400 {
            return Err(ExecError::from_status(
                response.status,
                response.body.unwrap_or_default(),
            ));
        }
        Ok(ExecResponse {
            status: response.status,
            headers: response.headers.into_iter().collect(),
            body: Bytes::from(response.body.unwrap_or_default().into_bytes()),
        })
    }

    async fn execute_stream(
        &self,
        _ctx: &ExecCtx,
        _auth: &Auth,
        req: ExecRequest,
        _opts: ExecOptions,
    ) -> Result<StreamResult, ExecError> {
        let session = self.session()?;
        let id = uuid::Uuid::new_v4().to_string();
        let (started, chunks) = session.register_stream(&id)?;
        let payload = serde_json::to_value(Self::request_payload(&req))
            .map_err(|err| ExecError::network(err.to_string()))?;
        session
            .send(Envelope {
                id: id.clone(),
                kind: EnvelopeType::HttpRequest,
                payload: Some(payload),
            })
            .await?;

        match tokio::time::timeout(RELAY_REQUEST_TIMEOUT, started).await {
            Ok(Ok(Ok(()))) => Ok(StreamResult { chunks }),
            Ok(Ok(Err(err))) => Err(err),
            Ok(Err(_)) => Err(ExecError::network("relay session dropped request")),
            Err(_) => {
                session.fail_pending(&id, "relay request timed out");
                Err(ExecError::network("relay stream start timed out"))
            }
        }
    }

    fn close_execution_session(&self, session_id: &str) {
        let Some(session) = self.hub.session(&self.provider) else {
            return;
        };
        if session_id == CLOSE_ALL_EXECUTION_SESSIONS {
            session.close("execution sessions closed");
        } else {
            session.fail_pending(session_id, "execution session closed");
        }
    }
}
