use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::entity::Auth;
use crate::error::ExecError;
use crate::headers::Headers;

/// Sentinel session id: release every session this executor owns. Sent when
/// an executor is replaced in the manager's table.
pub const CLOSE_ALL_EXECUTION_SESSIONS: &str = "*";

/// Ordered stream of body chunks. The channel closes when the upstream
/// stream ends or the request is cancelled.
pub type ChunkStream = tokio::sync::mpsc::Receiver<Result<Bytes, ExecError>>;

#[derive(Debug, Clone)]
pub struct ExecCtx {
    pub trace_id: Option<String>,
    pub attempt: u32,
}

impl ExecCtx {
    pub fn new(trace_id: Option<String>) -> Self {
        Self {
            trace_id,
            attempt: 0,
        }
    }
}

/// A provider-neutral upstream request. The body is whatever the wire
/// translator produced; the core never looks inside it.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub method: http::Method,
    pub url: String,
    pub headers: Headers,
    pub body: Bytes,
    /// Upstream model name, after alias resolution.
    pub model: String,
}

#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub alt: Option<String>,
    pub stream: bool,
    pub connect_timeout: Option<Duration>,
    pub request_timeout: Option<Duration>,
}

#[derive(Debug)]
pub struct ExecResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: Bytes,
}

#[derive(Debug)]
pub struct StreamResult {
    pub chunks: ChunkStream,
}

/// One per-provider execution façade.
///
/// The manager keyes executors by [`Executor::identifier`] and calls only
/// these methods; provider-specific request building, OAuth and transport
/// details stay behind the trait.
#[async_trait]
pub trait Executor: Send + Sync {
    fn identifier(&self) -> &str;

    async fn execute(
        &self,
        ctx: &ExecCtx,
        auth: &Auth,
        req: ExecRequest,
        opts: ExecOptions,
    ) -> Result<ExecResponse, ExecError>;

    async fn execute_stream(
        &self,
        ctx: &ExecCtx,
        auth: &Auth,
        req: ExecRequest,
        opts: ExecOptions,
    ) -> Result<StreamResult, ExecError>;

    /// Exchange the refresh token for fresh credentials. Idempotent; returns
    /// a clone with updated tokens and `last_refreshed_at`.
    async fn refresh(&self, _ctx: &ExecCtx, _auth: &Auth) -> Result<Auth, ExecError> {
        Err(ExecError::unsupported("refresh"))
    }

    async fn count_tokens(
        &self,
        _ctx: &ExecCtx,
        _auth: &Auth,
        _req: ExecRequest,
    ) -> Result<i64, ExecError> {
        Err(ExecError::unsupported("count_tokens"))
    }

    /// Raw HTTP pass-through used by the reverse-proxy front end.
    async fn http_request(
        &self,
        _ctx: &ExecCtx,
        _auth: &Auth,
        _req: http::Request<Bytes>,
    ) -> Result<ExecResponse, ExecError> {
        Err(ExecError::unsupported("http_request"))
    }

    /// Release long-lived per-session state. Called with
    /// [`CLOSE_ALL_EXECUTION_SESSIONS`] when this executor is being replaced.
    fn close_execution_session(&self, _session_id: &str) {}
}
