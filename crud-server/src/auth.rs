//! Authentication service providing password hashing (bcrypt) and JWT (HS256) access/refresh tokens.
//! Logout revokes the token id (`jti`) in an in-memory denylist until the token would have expired anyway.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tokio::{sync::RwLock, task};
use uuid::Uuid;

use crate::{
    models::{AppError, Id},
    password::{self, DEFAULT_ROUNDS},
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    Access,
    Refresh,
}

/// JWT claims payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (numeric user id as a string).
    pub sub: String,
    /// Issued at (seconds since epoch).
    pub iat: usize,
    /// Expiration (seconds since epoch).
    pub exp: usize,
    /// Unique token id, used for revocation.
    pub jti: String,
    pub kind: TokenKind,
}

#[async_trait]
pub trait AuthService: Send + Sync {
    async fn hash_password(&self, password: String) -> Result<String, AppError>;
    async fn verify_password(&self, password: String, hash: String) -> Result<bool, AppError>;
    async fn generate_token(&self, user_id: Id) -> Result<String, AppError>;
    async fn generate_refresh_token(&self, user_id: Id) -> Result<String, AppError>;
    async fn validate_token(&self, token: &str) -> Result<Claims, AppError>;
    /// Exchanges a refresh token for a new access token.
    async fn refresh(&self, refresh_token: &str) -> Result<String, AppError>;
    async fn logout(&self, token: &str) -> Result<(), AppError>;
    async fn user_id_from_token(&self, token: &str) -> Result<Id, AppError> {
        let claims = self.validate_token(token).await?;
        claims.sub.parse::<Id>().map_err(|e| AppError::Parse(e.to_string()))
    }
}

/// Concrete JWT/bcrypt implementation.
#[derive(Clone)]
pub struct JwtAuthService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    refresh_encoding: EncodingKey,
    refresh_decoding: DecodingKey,
    access_ttl: Duration,
    refresh_ttl: Duration,
    bcrypt_cost: u32,
    /// Revoked `jti` -> expiry (seconds since epoch).
    revoked: Arc<RwLock<HashMap<String, usize>>>,
}

impl JwtAuthService {
    pub fn new(secret: &str, expiry_hours: i64) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            refresh_encoding: EncodingKey::from_secret(secret.as_bytes()),
            refresh_decoding: DecodingKey::from_secret(secret.as_bytes()),
            access_ttl: Duration::hours(expiry_hours),
            refresh_ttl: Duration::days(7),
            bcrypt_cost: DEFAULT_ROUNDS,
            revoked: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Signs refresh tokens with their own secret.
    pub fn with_refresh_secret(mut self, secret: &str, expiry_hours: i64) -> Self {
        self.refresh_encoding = EncodingKey::from_secret(secret.as_bytes());
        self.refresh_decoding = DecodingKey::from_secret(secret.as_bytes());
        self.refresh_ttl = Duration::hours(expiry_hours);
        self
    }

    pub fn with_access_ttl(mut self, ttl: Duration) -> Self {
        self.access_ttl = ttl;
        self
    }

    pub fn with_bcrypt_cost(mut self, cost: u32) -> Self {
        self.bcrypt_cost = cost;
        self
    }

    fn now_secs() -> usize { Utc::now().timestamp().max(0) as usize }

    fn sign(&self, user_id: Id, kind: TokenKind) -> Result<String, AppError> {
        let (key, ttl) = match kind {
            TokenKind::Access => (&self.encoding, self.access_ttl),
            TokenKind::Refresh => (&self.refresh_encoding, self.refresh_ttl),
        };
        let iat = Self::now_secs();
        let exp = (Utc::now() + ttl).timestamp().max(0) as usize;
        let claims = Claims { sub: user_id.to_string(), iat, exp, jti: Uuid::new_v4().to_string(), kind };
        encode(&Header::new(Algorithm::HS256), &claims, key).map_err(|e| AppError::Jwt(e.to_string()))
    }

    fn decode_kind(&self, token: &str, kind: TokenKind) -> Result<Claims, AppError> {
        let key = match kind {
            TokenKind::Access => &self.decoding,
            TokenKind::Refresh => &self.refresh_decoding,
        };
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 0;
        let data = decode::<Claims>(token, key, &validation)?;
        if data.claims.kind != kind {
            return Err(AppError::Unauthorized("Invalid token".into()));
        }
        Ok(data.claims)
    }

    async fn is_revoked(&self, jti: &str) -> bool { self.revoked.read().await.contains_key(jti) }
}

#[async_trait]
impl AuthService for JwtAuthService {
    async fn hash_password(&self, password: String) -> Result<String, AppError> {
        // Bcrypt is CPU-bound; use spawn_blocking to avoid blocking the async runtime.
        let cost = self.bcrypt_cost;
        task::spawn_blocking(move || password::hash_password(&password, cost))
            .await
            .map_err(|e| AppError::Bcrypt(e.to_string()))?
    }

    async fn verify_password(&self, password: String, hash_value: String) -> Result<bool, AppError> {
        task::spawn_blocking(move || password::compare_password(&password, &hash_value))
            .await
            .map_err(|e| AppError::Bcrypt(e.to_string()))?
    }

    async fn generate_token(&self, user_id: Id) -> Result<String, AppError> { self.sign(user_id, TokenKind::Access) }

    async fn generate_refresh_token(&self, user_id: Id) -> Result<String, AppError> {
        self.sign(user_id, TokenKind::Refresh)
    }

    async fn validate_token(&self, token: &str) -> Result<Claims, AppError> {
        let claims = self.decode_kind(token, TokenKind::Access)?;
        if self.is_revoked(&claims.jti).await {
            return Err(AppError::Unauthorized("Invalid token".into()));
        }
        Ok(claims)
    }

    async fn refresh(&self, refresh_token: &str) -> Result<String, AppError> {
        let claims = self
            .decode_kind(refresh_token, TokenKind::Refresh)
            .map_err(|_| AppError::Unauthorized("Invalid refresh token".into()))?;
        if self.is_revoked(&claims.jti).await {
            return Err(AppError::Unauthorized("Invalid refresh token".into()));
        }
        let user_id = claims.sub.parse::<Id>().map_err(|e| AppError::Parse(e.to_string()))?;
        self.sign(user_id, TokenKind::Access)
    }

    async fn logout(&self, token: &str) -> Result<(), AppError> {
        let claims = self.validate_token(token).await?;
        let now = Self::now_secs();
        let mut revoked = self.revoked.write().await;
        revoked.retain(|_, exp| *exp > now);
        revoked.insert(claims.jti, claims.exp);
        Ok(())
    }
}

/// Extracts the token from the Authorization header. The `Bearer ` prefix (with its space) is
/// optional, but the token must look like a JWT (three dot-separated segments).
pub fn token_from_headers(headers: &HeaderMap) -> Result<String, AppError> {
    let raw = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .unwrap_or_default();
    // A bare `Bearer` is what is left of `Bearer ` once the value is trimmed.
    let token = match raw.strip_prefix("Bearer ") {
        Some(rest) => rest.trim(),
        None if raw == "Bearer" => "",
        None => raw,
    };
    if token.is_empty() {
        return Err(AppError::Unauthorized("No token provided".into()));
    }
    if token.split('.').count() != 3 {
        return Err(AppError::Unauthorized("Invalid token format".into()));
    }
    Ok(token.to_string())
}
