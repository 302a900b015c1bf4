//! Session token verification.
//!
//! The `Authorization` header carries a JSON session token signed by the
//! login frontend with HMAC-SHA256 over its fields, keyed by the SHA-256 of
//! the shared session secret.

use actix_web::{dev::Payload, http::header::HeaderValue, web, FromRequest, HttpRequest};
use chrono::{Duration, Utc};
use futures::future::{ready, Ready};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::LedgerError;
use crate::schemas::UserId;

type HmacSha256 = Hmac<Sha256>;

/// Tokens older than this are rejected.
const MAX_TOKEN_AGE_DAYS: i64 = 7;

#[derive(Deserialize, Serialize, Debug, Clone)]
struct SessionToken {
    id: String,
    auth_date: i64,
    hash: String,
}

/// Shared secret used to verify session tokens.
#[derive(Clone)]
pub struct SessionKey {
    secret_hash: Vec<u8>,
}

impl SessionKey {
    pub fn new(secret: &str) -> Self {
        let mut sha256_hasher = Sha256::new();
        sha256_hasher.update(secret.as_bytes());
        Self {
            secret_hash: sha256_hasher.finalize().to_vec(),
        }
    }

    fn mac(&self, id: &str, auth_date: i64) -> HmacSha256 {
        let hash_content = format!("auth_date={auth_date}\nid={id}");
        let mut hmac_hasher =
            HmacSha256::new_from_slice(&self.secret_hash).expect("HMAC can take key of any size");
        hmac_hasher.update(hash_content.as_bytes());
        hmac_hasher
    }

    /// Signs a token for `user`, as the login frontend does.
    #[cfg(test)]
    pub fn issue(&self, user: &UserId) -> String {
        let auth_date = Utc::now().timestamp();
        let hash = hex::encode(self.mac(user.as_str(), auth_date).finalize().into_bytes());
        let token = SessionToken {
            id: user.to_string(),
            auth_date,
            hash,
        };
        serde_json::to_string(&token).unwrap_or_default()
    }

    /// Returns the user a token was issued to, if the signature holds and the
    /// token has not expired.
    pub fn verify(&self, raw: &str) -> Option<UserId> {
        let token: SessionToken = serde_json::from_str(raw).ok()?;
        let hash = hex::decode(&token.hash).ok()?;
        self.mac(&token.id, token.auth_date).verify_slice(&hash).ok()?;

        let age = Utc::now().timestamp() - token.auth_date;
        if age < 0 || age > Duration::days(MAX_TOKEN_AGE_DAYS).num_seconds() {
            return None;
        }
        Some(UserId(token.id))
    }
}

/// The caller, resolved from the request's session token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser(pub UserId);

fn check_authorization(request: &HttpRequest) -> Result<AuthenticatedUser, LedgerError> {
    let key = request
        .app_data::<web::Data<SessionKey>>()
        .ok_or_else(|| LedgerError::storage("session key not configured"))?;
    let authorization = request
        .headers()
        .get(actix_web::http::header::AUTHORIZATION)
        .map(HeaderValue::to_str)
        .and_then(Result::ok)
        .ok_or(LedgerError::Unauthenticated)?;
    key.verify(authorization)
        .map(AuthenticatedUser)
        .ok_or(LedgerError::Unauthenticated)
}

impl FromRequest for AuthenticatedUser {
    type Error = LedgerError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(request: &HttpRequest, _: &mut Payload) -> Self::Future {
        let result = check_authorization(request);
        if let Err(LedgerError::Unauthenticated) = result {
            tracing::debug!(path = %request.path(), "rejected unauthenticated request");
        }
        ready(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_token_verifies() {
        let key = SessionKey::new("secret");
        let token = key.issue(&UserId::from("alice"));
        assert_eq!(key.verify(&token), Some(UserId::from("alice")));
    }

    #[test]
    fn token_from_another_secret_is_rejected() {
        let token = SessionKey::new("other").issue(&UserId::from("alice"));
        assert_eq!(SessionKey::new("secret").verify(&token), None);
    }

    #[test]
    fn tampered_user_is_rejected() {
        let key = SessionKey::new("secret");
        let token = key.issue(&UserId::from("alice")).replace("alice", "mallory");
        assert_eq!(key.verify(&token), None);
    }

    #[test]
    fn expired_token_is_rejected() {
        let key = SessionKey::new("secret");
        let auth_date = Utc::now().timestamp() - Duration::days(MAX_TOKEN_AGE_DAYS + 1).num_seconds();
        let hash = hex::encode(key.mac("alice", auth_date).finalize().into_bytes());
        let token = serde_json::to_string(&SessionToken {
            id: "alice".into(),
            auth_date,
            hash,
        })
        .unwrap();
        assert_eq!(key.verify(&token), None);
    }

    #[test]
    fn garbage_is_rejected() {
        assert_eq!(SessionKey::new("secret").verify("not json"), None);
    }
}
