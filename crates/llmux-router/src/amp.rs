use std::collections::HashSet;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Router;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

use llmux_auth::{AuthManager, ModelMapper, SecretCtx, SecretSource};
use llmux_common::AppConfig;

use crate::management::localhost_allowed;
use crate::rewrite::{ResponseRewriter, SseRewriter};

const MANAGEMENT_PREFIX: &str = "/v0/management";
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const SSE_HEARTBEAT_FRAME: &[u8] = b": keep-alive\n\n";
const NONSTREAM_KEEPALIVE_FRAME: &[u8] = b" ";
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;
const UPSTREAM_ERROR_BODY: &str =
    r#"{"error":"amp_upstream_proxy_error","message":"Failed to reach Amp upstream"}"#;

/// Reverse-proxy gateway for the Amp upstream: injects upstream credentials,
/// strips client credentials, maps model names and repairs misidentified
/// gzip responses.
pub struct AmpGateway {
    manager: Arc<AuthManager>,
    secrets: Arc<dyn SecretSource>,
    mapper: ArcSwap<ModelMapper>,
    upstream_url: ArcSwap<Option<String>>,
    client: wreq::Client,
    restrict_management: AtomicBool,
    client_keys: ArcSwap<HashSet<String>>,
    streaming_keepalive_secs: AtomicU64,
    nonstream_keepalive_secs: AtomicU64,
}

impl AmpGateway {
    pub fn new(
        manager: Arc<AuthManager>,
        secrets: Arc<dyn SecretSource>,
        config: &AppConfig,
    ) -> Result<Arc<Self>, wreq::Error> {
        let client = wreq::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(86400))
            .read_timeout(Duration::from_secs(300))
            .build()?;
        let gateway = Arc::new(Self {
            manager,
            secrets,
            mapper: ArcSwap::from_pointee(ModelMapper::default()),
            upstream_url: ArcSwap::from_pointee(None),
            client,
            restrict_management: AtomicBool::new(false),
            client_keys: ArcSwap::from_pointee(HashSet::new()),
            streaming_keepalive_secs: AtomicU64::new(0),
            nonstream_keepalive_secs: AtomicU64::new(0),
        });
        gateway.apply_config(config);
        Ok(gateway)
    }

    /// Hot-reload entry point; every piece of gateway state swaps atomically.
    pub fn apply_config(&self, config: &AppConfig) {
        match ModelMapper::compile(
            &config.ampcode.model_mappings,
            config.ampcode.force_model_mappings,
        ) {
            Ok(mapper) => self.mapper.store(Arc::new(mapper)),
            Err(err) => tracing::error!(error = %err, "model mapping compile failed; keeping previous"),
        }
        self.upstream_url
            .store(Arc::new(config.ampcode.upstream_url.clone()));
        self.restrict_management.store(
            config.ampcode.restrict_management_to_localhost,
            Ordering::Relaxed,
        );
        self.client_keys
            .store(Arc::new(config.api_keys.iter().cloned().collect()));
        self.streaming_keepalive_secs
            .store(config.streaming_keepalive_secs, Ordering::Relaxed);
        self.nonstream_keepalive_secs
            .store(config.nonstream_keepalive_secs, Ordering::Relaxed);
    }

    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .fallback(proxy_handler)
            .with_state(Arc::clone(self))
    }

    /// Request-time model mapping with the provider-availability gate.
    pub async fn map_model(&self, requested: &str) -> Option<String> {
        let mapper = self.mapper.load();
        let target = mapper.target_for(requested)?;
        if target == requested {
            return None;
        }
        if mapper.is_forced() || self.manager.has_provider_for_model(&target).await {
            Some(target)
        } else {
            None
        }
    }
}

fn extract_client_key(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(header::AUTHORIZATION)
        && let Ok(s) = value.to_str()
    {
        let s = s.trim();
        let prefix = "Bearer ";
        if s.len() > prefix.len() && s[..prefix.len()].eq_ignore_ascii_case(prefix) {
            let token = s[prefix.len()..].trim();
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }
    headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Drop `key`/`auth_token` values that equal the client's own key; unrelated
/// values stay.
pub fn scrub_query(query: &str, client_key: Option<&str>) -> String {
    if query.is_empty() {
        return String::new();
    }
    let Ok(pairs) = serde_urlencoded::from_str::<Vec<(String, String)>>(query) else {
        return query.to_string();
    };
    let filtered: Vec<(String, String)> = pairs
        .into_iter()
        .filter(|(k, v)| {
            !((k == "key" || k == "auth_token") && client_key.is_some_and(|ck| ck == v))
        })
        .collect();
    serde_urlencoded::to_string(&filtered).unwrap_or_default()
}

fn skip_request_header(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "authorization" | "host" | "content-length" | "x-api-key" | "x-goog-api-key"
    )
}

fn wreq_method(method: &Method) -> wreq::Method {
    match *method {
        Method::GET => wreq::Method::GET,
        Method::POST => wreq::Method::POST,
        Method::PUT => wreq::Method::PUT,
        Method::PATCH => wreq::Method::PATCH,
        Method::DELETE => wreq::Method::DELETE,
        Method::HEAD => wreq::Method::HEAD,
        Method::OPTIONS => wreq::Method::OPTIONS,
        _ => wreq::Method::GET,
    }
}

fn upstream_unreachable() -> Response {
    (
        StatusCode::BAD_GATEWAY,
        [(header::CONTENT_TYPE, "application/json")],
        UPSTREAM_ERROR_BODY,
    )
        .into_response()
}

/// 2xx, non-SSE, no declared encoding: peek two bytes and transparently
/// decompress bodies the upstream mislabelled. A body shorter than the magic
/// is returned untouched.
pub fn decode_gzip_if_needed(status: StatusCode, headers: &mut HeaderMap, body: Bytes) -> Bytes {
    if !status.is_success() || headers.contains_key(header::CONTENT_ENCODING) {
        return body;
    }
    if body.len() < 2 || body[..2] != GZIP_MAGIC {
        return body;
    }
    let mut decoder = flate2::read::GzDecoder::new(&body[..]);
    let mut out = Vec::new();
    match std::io::Read::read_to_end(&mut decoder, &mut out) {
        Ok(_) => {
            headers.remove(header::CONTENT_ENCODING);
            Bytes::from(out)
        }
        Err(err) => {
            tracing::debug!(error = %err, "gzip peek matched but decompression failed");
            body
        }
    }
}

fn is_sse(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.to_ascii_lowercase().contains("text/event-stream"))
}

async fn proxy_handler(State(gw): State<Arc<AmpGateway>>, req: Request) -> Response {
    let client_key = extract_client_key(req.headers());

    let keys = gw.client_keys.load();
    if !keys.is_empty() {
        match client_key.as_deref() {
            Some(key) if keys.contains(key) => {}
            _ => {
                return (
                    StatusCode::UNAUTHORIZED,
                    [(header::CONTENT_TYPE, "application/json")],
                    r#"{"error":"unauthorized"}"#,
                )
                    .into_response();
            }
        }
    }

    if req.uri().path().starts_with(MANAGEMENT_PREFIX) {
        let remote = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ci| ci.0);
        if !localhost_allowed(
            gw.restrict_management.load(Ordering::Relaxed),
            remote.as_ref(),
        ) {
            return (
                StatusCode::FORBIDDEN,
                [(header::CONTENT_TYPE, "application/json")],
                r#"{"error":"management_restricted_to_localhost"}"#,
            )
                .into_response();
        }
    }

    let upstream = gw.upstream_url.load_full();
    let Some(base) = upstream.as_ref().as_deref() else {
        return upstream_unreachable();
    };

    let (parts, body) = req.into_parts();
    let body_bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => return (StatusCode::PAYLOAD_TOO_LARGE, "body too large").into_response(),
    };

    // Request-time model mapping; remember the client-visible name so the
    // response can be rewritten back.
    let mut out_body = body_bytes.clone();
    let mut original_model: Option<String> = None;
    if parts.method == Method::POST
        && let Ok(mut value) = serde_json::from_slice::<serde_json::Value>(&body_bytes)
        && let Some(model) = value
            .get("model")
            .and_then(|m| m.as_str())
            .map(str::to_string)
        && let Some(mapped) = gw.map_model(&model).await
    {
        value["model"] = serde_json::Value::String(mapped);
        if let Ok(bytes) = serde_json::to_vec(&value) {
            out_body = Bytes::from(bytes);
            original_model = Some(model);
        }
    }

    let query = scrub_query(parts.uri.query().unwrap_or(""), client_key.as_deref());
    let url = if query.is_empty() {
        format!("{base}{}", parts.uri.path())
    } else {
        format!("{base}{}?{query}", parts.uri.path())
    };

    let upstream_key = match gw
        .secrets
        .get(&SecretCtx {
            client_key: client_key.clone(),
        })
        .await
    {
        Ok(key) => key,
        Err(err) => {
            tracing::warn!(error = %err, "upstream secret resolution failed");
            String::new()
        }
    };

    let mut builder = gw.client.request(wreq_method(&parts.method), &url);
    for (name, value) in parts.headers.iter() {
        if skip_request_header(name) {
            continue;
        }
        if let Ok(v) = value.to_str() {
            builder = builder.header(name.as_str(), v);
        }
    }
    if !upstream_key.is_empty() {
        builder = builder
            .header("x-api-key", &upstream_key)
            .header("authorization", format!("Bearer {upstream_key}"));
    }
    if !out_body.is_empty() {
        builder = builder.body(out_body);
    }

    let nonstream_keepalive = gw.nonstream_keepalive_secs.load(Ordering::Relaxed);
    let wants_sse = parts
        .headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|a| a.contains("text/event-stream"));
    if nonstream_keepalive > 0 && parts.method == Method::POST && !wants_sse {
        return nonstream_keepalive_response(builder, original_model, nonstream_keepalive).await;
    }

    let resp = match builder.send().await {
        Ok(resp) => resp,
        Err(err) => {
            tracing::warn!(error = %err, url, "amp upstream dial failed");
            return upstream_unreachable();
        }
    };
    forward_response(&gw, resp, original_model).await
}

fn response_headers(resp: &wreq::Response) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in resp.headers() {
        if matches!(
            name.as_str(),
            "content-length" | "transfer-encoding" | "connection"
        ) {
            continue;
        }
        if let (Ok(header_name), Ok(v)) = (
            HeaderName::from_bytes(name.as_str().as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            headers.append(header_name, v);
        }
    }
    headers
}

async fn forward_response(
    gw: &AmpGateway,
    resp: wreq::Response,
    original_model: Option<String>,
) -> Response {
    let status =
        StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut headers = response_headers(&resp);

    if is_sse(&headers) {
        // SSE passes through chunk-for-chunk in receive order; only the model
        // fields inside `data:` lines are touched, and only when a mapping
        // was applied on the way in.
        let keepalive = gw.streaming_keepalive_secs.load(Ordering::Relaxed);
        let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, Infallible>>(32);
        tokio::spawn(async move {
            let mut rewriter = original_model.map(SseRewriter::new);
            let mut stream = resp.bytes_stream();
            loop {
                let next = if keepalive > 0 {
                    match tokio::time::timeout(Duration::from_secs(keepalive), stream.next()).await
                    {
                        Ok(item) => item,
                        Err(_) => {
                            if tx.send(Ok(Bytes::from_static(SSE_HEARTBEAT_FRAME))).await.is_err() {
                                return;
                            }
                            continue;
                        }
                    }
                } else {
                    stream.next().await
                };
                match next {
                    Some(Ok(chunk)) => {
                        let out = match rewriter.as_mut() {
                            Some(rw) => Bytes::from(rw.push_chunk(&chunk)),
                            None => chunk,
                        };
                        if !out.is_empty() && tx.send(Ok(out)).await.is_err() {
                            return;
                        }
                    }
                    Some(Err(_)) | None => {
                        if let Some(rw) = rewriter.as_mut() {
                            let rest = rw.finish();
                            if !rest.is_empty() {
                                let _ = tx.send(Ok(Bytes::from(rest))).await;
                            }
                        }
                        return;
                    }
                }
            }
        });
        let body = Body::from_stream(ReceiverStream::new(rx));
        return (status, headers, body).into_response();
    }

    let body = match resp.bytes().await {
        Ok(bytes) => bytes,
        Err(err) => {
            tracing::warn!(error = %err, "amp upstream body read failed");
            return upstream_unreachable();
        }
    };
    let body = decode_gzip_if_needed(status, &mut headers, body);
    let body = match original_model {
        Some(model) => {
            let rewriter = ResponseRewriter::new(model);
            rewriter
                .rewrite_body(&body)
                .map(Bytes::from)
                .unwrap_or(body)
        }
        None => body,
    };
    (status, headers, body).into_response()
}

/// Non-stream keep-alive: commit a 200 immediately, tick whitespace while
/// the upstream call is in flight, then append the final JSON body.
async fn nonstream_keepalive_response(
    builder: wreq::RequestBuilder,
    original_model: Option<String>,
    interval_secs: u64,
) -> Response {
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, Infallible>>(8);
    tokio::spawn(async move {
        let mut upstream = Box::pin(async move {
            match builder.send().await {
                Ok(resp) => {
                    let status = StatusCode::from_u16(resp.status().as_u16())
                        .unwrap_or(StatusCode::BAD_GATEWAY);
                    let mut headers = response_headers(&resp);
                    match resp.bytes().await {
                        Ok(body) => decode_gzip_if_needed(status, &mut headers, body),
                        Err(_) => Bytes::from_static(UPSTREAM_ERROR_BODY.as_bytes()),
                    }
                }
                Err(_) => Bytes::from_static(UPSTREAM_ERROR_BODY.as_bytes()),
            }
        });
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            tokio::select! {
                body = &mut upstream => {
                    let body = match original_model {
                        Some(model) => {
                            let rewriter = ResponseRewriter::new(model);
                            rewriter.rewrite_body(&body).map(Bytes::from).unwrap_or(body)
                        }
                        None => body,
                    };
                    let _ = tx.send(Ok(body)).await;
                    return;
                }
                _ = ticker.tick() => {
                    if tx.send(Ok(Bytes::from_static(NONSTREAM_KEEPALIVE_FRAME))).await.is_err() {
                        return;
                    }
                }
            }
        }
    });
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        Body::from_stream(ReceiverStream::new(rx)),
    )
        .into_response()
}

/// Middleware form of the request-time model mapping for locally handled
/// dialect routes: the inner handler sees the mapped model, the client sees
/// its own model name in the response.
pub async fn map_model_middleware(
    State(gw): State<Arc<AmpGateway>>,
    req: Request,
    next: Next,
) -> Response {
    let (mut parts, body) = req.into_parts();
    let body_bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => return (StatusCode::PAYLOAD_TOO_LARGE, "body too large").into_response(),
    };

    let mut original_model: Option<String> = None;
    let mut forward = Bytes::clone(&body_bytes);
    if parts.method == Method::POST
        && let Ok(mut value) = serde_json::from_slice::<serde_json::Value>(&body_bytes)
        && let Some(model) = value
            .get("model")
            .and_then(|m| m.as_str())
            .map(str::to_string)
        && let Some(mapped) = gw.map_model(&model).await
    {
        value["model"] = serde_json::Value::String(mapped);
        if let Ok(bytes) = serde_json::to_vec(&value) {
            forward = Bytes::from(bytes);
            original_model = Some(model);
        }
    }
    parts.headers.remove(header::CONTENT_LENGTH);

    let resp = next
        .run(Request::from_parts(parts, Body::from(forward)))
        .await;

    let Some(model) = original_model else {
        return resp;
    };
    let (mut parts, body) = resp.into_parts();
    if is_sse(&parts.headers) {
        let mut rewriter = SseRewriter::new(model);
        let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, axum::Error>>(32);
        tokio::spawn(async move {
            let mut stream = body.into_data_stream();
            while let Some(item) = stream.next().await {
                match item {
                    Ok(chunk) => {
                        let out = Bytes::from(rewriter.push_chunk(&chunk));
                        if !out.is_empty() && tx.send(Ok(out)).await.is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        let _ = tx.send(Err(err)).await;
                        return;
                    }
                }
            }
            let rest = rewriter.finish();
            if !rest.is_empty() {
                let _ = tx.send(Ok(Bytes::from(rest))).await;
            }
        });
        return Response::from_parts(parts, Body::from_stream(ReceiverStream::new(rx)));
    }

    let bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => return (StatusCode::BAD_GATEWAY, "response too large").into_response(),
    };
    let rewriter = ResponseRewriter::new(model);
    let bytes = rewriter.rewrite_body(&bytes).map(Bytes::from).unwrap_or(bytes);
    parts.headers.remove(header::CONTENT_LENGTH);
    Response::from_parts(parts, Body::from(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    #[test]
    fn scrub_drops_only_matching_credential_values() {
        let scrubbed = scrub_query(
            "key=client-key&key=keep&auth_token=client-key&foo=bar",
            Some("client-key"),
        );
        let pairs: Vec<(String, String)> = serde_urlencoded::from_str(&scrubbed).unwrap();
        assert!(pairs.contains(&("key".to_string(), "keep".to_string())));
        assert!(pairs.contains(&("foo".to_string(), "bar".to_string())));
        assert_eq!(pairs.len(), 2);
    }

    #[test]
    fn scrub_without_client_key_keeps_everything() {
        let scrubbed = scrub_query("key=a&auth_token=b", None);
        let pairs: Vec<(String, String)> = serde_urlencoded::from_str(&scrubbed).unwrap();
        assert_eq!(pairs.len(), 2);
    }

    #[test]
    fn gzip_peek_decompresses_mislabelled_body() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(br#"{"ok":true}"#).unwrap();
        let compressed = Bytes::from(encoder.finish().unwrap());

        let mut headers = HeaderMap::new();
        let body = decode_gzip_if_needed(StatusCode::OK, &mut headers, compressed);
        assert_eq!(&body[..], br#"{"ok":true}"#);
        assert_eq!(body.len(), 11);
        assert!(!headers.contains_key(header::CONTENT_ENCODING));
    }

    #[test]
    fn gzip_peek_is_safe_on_tiny_bodies() {
        let mut headers = HeaderMap::new();
        let body = decode_gzip_if_needed(StatusCode::OK, &mut headers, Bytes::from_static(&[0x1f]));
        assert_eq!(&body[..], &[0x1f]);
        assert!(!headers.contains_key(header::CONTENT_ENCODING));
    }

    #[test]
    fn gzip_peek_skips_declared_encoding_and_errors() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        let body = Bytes::from_static(&[0x1f, 0x8b, 0x00]);
        let out = decode_gzip_if_needed(StatusCode::OK, &mut headers.clone(), body.clone());
        assert_eq!(out, body);

        let mut headers = HeaderMap::new();
        let out = decode_gzip_if_needed(StatusCode::INTERNAL_SERVER_ERROR, &mut headers, body.clone());
        assert_eq!(out, body);
    }

    #[test]
    fn client_key_extraction_prefers_bearer() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer token-1"),
        );
        headers.insert("x-api-key", HeaderValue::from_static("token-2"));
        assert_eq!(extract_client_key(&headers).as_deref(), Some("token-1"));

        headers.remove(header::AUTHORIZATION);
        assert_eq!(extract_client_key(&headers).as_deref(), Some("token-2"));
    }
}
