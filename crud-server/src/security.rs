//! Request-path protections: fixed-window rate limiting, CSRF tokens, security headers and
//! the upload filter. Limiter and token state live in process memory, like the data stores.

use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderName, HeaderValue, Method},
    middleware::Next,
    response::{IntoResponse, Response},
    Router,
};
use tokio::{sync::{Mutex, RwLock}, time::Instant};
use tower_http::set_header::SetResponseHeaderLayer;
use uuid::Uuid;

use crate::models::AppError;

pub const CSRF_HEADER: &str = "x-csrf-token";

const RATE_LIMIT_LIMIT: HeaderName = HeaderName::from_static("ratelimit-limit");
const RATE_LIMIT_REMAINING: HeaderName = HeaderName::from_static("ratelimit-remaining");

/// Stale windows are swept once the map grows past this many clients.
const SWEEP_THRESHOLD: usize = 10_000;

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

/// Outcome of counting one request against a client's window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_after: Duration,
}

/// Fixed-window counter keyed by client. Cloning shares the counters.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    name: &'static str,
    limit: u32,
    window: Duration,
    windows: Arc<Mutex<HashMap<String, Window>>>,
}

impl RateLimiter {
    pub fn new(name: &'static str, limit: u32, window: Duration) -> Self {
        Self { name, limit, window, windows: Arc::new(Mutex::new(HashMap::new())) }
    }

    /// Counts one request for `key`.
    pub async fn check(&self, key: &str) -> RateDecision {
        let now = Instant::now();
        let mut windows = self.windows.lock().await;
        if windows.len() > SWEEP_THRESHOLD {
            let window = self.window;
            windows.retain(|_, w| now.duration_since(w.started) < window);
        }

        let entry = windows.entry(key.to_string()).or_insert(Window { started: now, count: 0 });
        if now.duration_since(entry.started) >= self.window {
            *entry = Window { started: now, count: 0 };
        }
        entry.count = entry.count.saturating_add(1);

        RateDecision {
            allowed: entry.count <= self.limit,
            limit: self.limit,
            remaining: self.limit.saturating_sub(entry.count),
            reset_after: self.window.saturating_sub(now.duration_since(entry.started)),
        }
    }
}

/// First `X-Forwarded-For` hop, else the peer address, else `unknown`.
pub fn client_key(req: &Request) -> String {
    let forwarded = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').map(str::trim).find(|s| !s.is_empty()));
    if let Some(ip) = forwarded {
        return ip.to_string();
    }
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

pub async fn rate_limit(State(limiter): State<RateLimiter>, req: Request, next: Next) -> Response {
    let key = client_key(&req);
    let decision = limiter.check(&key).await;
    if !decision.allowed {
        tracing::warn!(limiter = limiter.name, client = %key, "rate limit exceeded");
        let mut resp = AppError::TooManyRequests("Too many requests, please try again later.".into()).into_response();
        let retry = decision.reset_after.as_secs().max(1);
        resp.headers_mut().insert(header::RETRY_AFTER, HeaderValue::from(retry));
        return resp;
    }
    let mut resp = next.run(req).await;
    let headers = resp.headers_mut();
    headers.insert(RATE_LIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(RATE_LIMIT_REMAINING, HeaderValue::from(decision.remaining));
    resp
}

/// Issued CSRF tokens with their expiry.
#[derive(Debug, Clone)]
pub struct CsrfProtection {
    tokens: Arc<RwLock<HashMap<String, Instant>>>,
    ttl: Duration,
    enforce: bool,
}

impl CsrfProtection {
    pub fn new(ttl: Duration, enforce: bool) -> Self {
        Self { tokens: Arc::new(RwLock::new(HashMap::new())), ttl, enforce }
    }

    pub async fn issue(&self) -> String {
        let now = Instant::now();
        let token = Uuid::new_v4().simple().to_string();
        let mut tokens = self.tokens.write().await;
        tokens.retain(|_, expires| *expires > now);
        tokens.insert(token.clone(), now + self.ttl);
        token
    }

    /// Expired tokens are dropped on every check, not only when new ones are issued.
    pub async fn verify(&self, token: &str) -> bool {
        let now = Instant::now();
        let mut tokens = self.tokens.write().await;
        tokens.retain(|_, expires| *expires > now);
        tokens.contains_key(token)
    }

    pub fn enforces(&self) -> bool { self.enforce }
}

/// Checks `X-CSRF-Token` on state-changing requests. A present but unknown token is always
/// rejected; a missing token only when enforcement is on.
pub async fn csrf_guard(State(csrf): State<CsrfProtection>, req: Request, next: Next) -> Result<Response, AppError> {
    if matches!(*req.method(), Method::GET | Method::HEAD | Method::OPTIONS) {
        return Ok(next.run(req).await);
    }
    let token = req.headers().get(CSRF_HEADER).and_then(|v| v.to_str().ok()).map(str::to_string);
    match token {
        Some(token) => {
            if !csrf.verify(&token).await {
                tracing::warn!(path = %req.uri().path(), "rejected request with invalid CSRF token");
                return Err(AppError::Forbidden("Invalid CSRF token".into()));
            }
        }
        None if csrf.enforces() => return Err(AppError::Forbidden("CSRF token missing".into())),
        None => {}
    }
    Ok(next.run(req).await)
}

/// Adds the browser hardening headers to every response.
pub fn with_security_headers(router: Router) -> Router {
    router
        .layer(SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY")))
        .layer(SetResponseHeaderLayer::overriding(
            header::STRICT_TRANSPORT_SECURITY,
            HeaderValue::from_static("max-age=15552000; includeSubDomains"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_XSS_PROTECTION,
            HeaderValue::from_static("1; mode=block"),
        ))
}

const ALLOWED_MIME_TYPES: [&str; 4] = ["image/png", "image/jpeg", "image/gif", "image/webp"];
const BLOCKED_EXTENSIONS: [&str; 8] = ["exe", "js", "php", "sh", "bat", "cmd", "msi", "dll"];

/// Which uploads are accepted.
#[derive(Debug, Clone, Copy)]
pub struct UploadPolicy {
    max_bytes: usize,
}

impl UploadPolicy {
    pub fn new(max_bytes: usize) -> Self { Self { max_bytes } }

    pub fn max_bytes(&self) -> usize { self.max_bytes }

    /// Every extension segment is checked, so `shell.php.png` is rejected too.
    pub fn check_type(&self, filename: &str, content_type: &str) -> Result<(), AppError> {
        let blocked = filename
            .split('.')
            .skip(1)
            .any(|ext| BLOCKED_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()));
        let mime = content_type.split(';').next().unwrap_or_default().trim().to_ascii_lowercase();
        if blocked || !ALLOWED_MIME_TYPES.contains(&mime.as_str()) {
            return Err(AppError::Validation("File type not allowed".into()));
        }
        Ok(())
    }

    pub fn check_size(&self, size: usize) -> Result<(), AppError> {
        if size > self.max_bytes {
            return Err(AppError::PayloadTooLarge("File too large".into()));
        }
        Ok(())
    }
}
