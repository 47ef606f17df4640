//! Bearer token authentication
//!
//! Tokens are HS256 JWTs signed with `api.jwt_secret`. Browsers cannot set
//! headers on an `EventSource`, so the token may also arrive as the
//! `access_token` query parameter.

use super::ApiResponse;
use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, StatusCode},
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

/// Token claims
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject
    pub sub: String,
    /// Expiry (unix seconds)
    pub exp: usize,
}

/// Verification key shared by the middleware
#[derive(Clone)]
pub struct JwtKey {
    key: Arc<DecodingKey>,
    validation: Arc<Validation>,
}

impl JwtKey {
    /// Key for an HS256 secret
    pub fn new(secret: &str) -> Self {
        Self {
            key: Arc::new(DecodingKey::from_secret(secret.as_bytes())),
            validation: Arc::new(Validation::new(Algorithm::HS256)),
        }
    }

    /// Decode and validate `token`
    pub fn verify(&self, token: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
        decode::<Claims>(token, &self.key, &self.validation).map(|data| data.claims)
    }
}

/// Token from the `Authorization` header, else from `?access_token=`
pub fn extract_token(req: &Request) -> Option<String> {
    if let Some(value) = req.headers().get(AUTHORIZATION) {
        let value = value.to_str().ok()?;
        return value.strip_prefix("Bearer ").map(str::to_string);
    }

    req.uri()
        .query()?
        .split('&')
        .find_map(|pair| pair.strip_prefix("access_token="))
        .filter(|token| !token.is_empty())
        .map(str::to_string)
}

fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(ApiResponse::<()>::error(message)),
    )
        .into_response()
}

/// Reject requests without a valid token
pub async fn require_jwt(State(key): State<JwtKey>, mut req: Request, next: Next) -> Response {
    let Some(token) = extract_token(&req) else {
        return unauthorized("Missing bearer token");
    };

    match key.verify(&token) {
        Ok(claims) => {
            req.extensions_mut().insert(claims);
            next.run(req).await
        }
        Err(err) => {
            warn!("JWT validation failed: {:?}", err);
            unauthorized("Invalid or expired token")
        }
    }
}
