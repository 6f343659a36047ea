//! Bearer-token identity verification.
//!
//! Tokens have the shape `<claims>.<signature>`, both base64url without
//! padding. `claims` is the JSON object `{"sub": <user id>, "exp": <unix
//! seconds>}`; `signature` is HMAC-SHA256 over the encoded claims part.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{Duration, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

use crate::error::AuthError;
use crate::protocol::Identity;
use crate::store::MessageStore;

type HmacSha256 = Hmac<Sha256>;

/// Resolves a presented credential to a stable identity.
///
/// Implementations must not mutate anything on failure.
pub trait IdentityVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<Identity, AuthError>;
}

#[derive(Deserialize)]
struct Claims {
    sub: String,
    exp: i64,
}

/// HMAC-signed tokens checked against the store's user directory.
pub struct TokenVerifier {
    mac: HmacSha256,
    store: Arc<dyn MessageStore>,
}

impl TokenVerifier {
    pub fn new(secret: &[u8], store: Arc<dyn MessageStore>) -> anyhow::Result<Self> {
        let mac = HmacSha256::new_from_slice(secret)
            .map_err(|_| anyhow::anyhow!("token secret rejected by HMAC"))?;
        Ok(Self { mac, store })
    }

    /// Issue a token for `user_id` valid for `ttl`.
    pub fn issue(&self, user_id: &str, ttl: Duration) -> String {
        let exp = (Utc::now() + ttl).timestamp();
        let claims = serde_json::json!({ "sub": user_id, "exp": exp }).to_string();
        let claims_part = URL_SAFE_NO_PAD.encode(claims.as_bytes());
        let mut mac = self.mac.clone();
        mac.update(claims_part.as_bytes());
        let sig_part = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        format!("{claims_part}.{sig_part}")
    }

    fn decode_claims(&self, token: &str) -> Result<Claims, AuthError> {
        let (claims_part, sig_part) = token.split_once('.').ok_or(AuthError::InvalidToken)?;
        let sig = URL_SAFE_NO_PAD
            .decode(sig_part)
            .map_err(|_| AuthError::InvalidToken)?;
        let mut mac = self.mac.clone();
        mac.update(claims_part.as_bytes());
        mac.verify_slice(&sig).map_err(|_| AuthError::InvalidToken)?;

        let raw = URL_SAFE_NO_PAD
            .decode(claims_part)
            .map_err(|_| AuthError::InvalidToken)?;
        serde_json::from_slice(&raw).map_err(|_| AuthError::InvalidToken)
    }
}

impl IdentityVerifier for TokenVerifier {
    fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        let claims = self.decode_claims(token.trim())?;
        if claims.exp <= Utc::now().timestamp() {
            return Err(AuthError::ExpiredToken);
        }
        match self.store.find_identity(&claims.sub) {
            Ok(Some(identity)) => Ok(identity),
            Ok(None) => Err(AuthError::IdentityNotFound),
            Err(e) => {
                tracing::error!(user = %claims.sub, "Identity lookup failed: {e}");
                Err(AuthError::IdentityNotFound)
            }
        }
    }
}

/// Extract the token from an `Authorization: Bearer <token>` header value.
pub fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}
