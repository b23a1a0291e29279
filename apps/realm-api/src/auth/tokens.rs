//! Signed access / refresh tokens with store-backed revocation.
//!
//! Access tokens are accepted unless their `jti` sits on a deny-list; refresh
//! tokens are accepted only while their `jti` sits on an allow-list. Both
//! lists live in the [`KeyValueStore`] and expire with the token itself.

use std::sync::Arc;

use chrono::Utc;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use realm_common::id::{prefix, prefixed_ulid};

use crate::config::Config;
use crate::db::kv::{KeyValueStore, StoreError};

/// Deny-list key prefix for revoked access tokens.
const DENY_PREFIX: &str = "blacklist:access:";

/// Allow-list key prefix for live refresh tokens.
const ALLOW_PREFIX: &str = "refresh_token:";

/// Clock-skew allowance when checking `exp`.
const LEEWAY_SECS: u64 = 5;

// ---------------------------------------------------------------------------
// Claims
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    Access,
    Refresh,
}

/// Claims embedded in every token this service signs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject: the user id.
    pub sub: String,
    #[serde(rename = "type")]
    pub kind: TokenKind,
    /// Unique token id, the key for revocation bookkeeping.
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
}

impl Claims {
    /// Seconds the token can still pass validation, counting the `exp` leeway.
    fn accepted_for_secs(&self) -> u64 {
        let deadline = self.exp.saturating_add(LEEWAY_SECS as i64);
        u64::try_from(deadline.saturating_sub(Utc::now().timestamp())).unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Why a token was refused. HTTP callers collapse all of these into a single
/// 401 (see `ApiError`), so the distinction never reaches a client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    #[error("token has expired")]
    Expired,
    #[error("token is malformed")]
    Malformed,
    #[error("token signature is invalid")]
    BadSignature,
    #[error("token has been revoked")]
    Revoked,
    #[error("refresh token not found or expired")]
    NotFoundOrExpired,
    #[error("token store unavailable")]
    StoreUnavailable,
    #[error("token signing failed")]
    Signing,
}

impl From<StoreError> for TokenError {
    fn from(err: StoreError) -> Self {
        tracing::warn!(%err, "token store unavailable, failing closed");
        Self::StoreUnavailable
    }
}

impl From<jsonwebtoken::errors::Error> for TokenError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        match err.kind() {
            ErrorKind::ExpiredSignature => Self::Expired,
            ErrorKind::InvalidSignature => Self::BadSignature,
            _ => Self::Malformed,
        }
    }
}

/// A freshly issued access + refresh pair.
#[derive(Debug, Clone)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    /// Access-token lifetime in seconds.
    pub expires_in: u64,
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

pub struct TokenService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    /// Full check: signature and expiry.
    validation: Validation,
    /// Signature only; revocation must still accept a token that just expired.
    revocation: Validation,
    store: Arc<dyn KeyValueStore>,
    access_ttl_secs: u64,
    refresh_ttl_secs: u64,
}

impl std::fmt::Debug for TokenService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenService")
            .field("access_ttl_secs", &self.access_ttl_secs)
            .field("refresh_ttl_secs", &self.refresh_ttl_secs)
            .finish_non_exhaustive()
    }
}

impl TokenService {
    pub fn new(
        secret: &[u8],
        store: Arc<dyn KeyValueStore>,
        access_ttl_secs: u64,
        refresh_ttl_secs: u64,
    ) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = LEEWAY_SECS;

        let mut revocation = Validation::new(Algorithm::HS256);
        revocation.validate_exp = false;

        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation,
            revocation,
            store,
            access_ttl_secs,
            refresh_ttl_secs,
        }
    }

    pub fn from_config(config: &Config, store: Arc<dyn KeyValueStore>) -> Self {
        Self::new(
            config.jwt_secret.as_bytes(),
            store,
            config.access_ttl_secs,
            config.refresh_ttl_secs,
        )
    }

    pub fn access_ttl_secs(&self) -> u64 {
        self.access_ttl_secs
    }

    fn mint(&self, user_id: &str, kind: TokenKind, ttl_secs: u64) -> Result<(String, Claims), TokenError> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: user_id.to_string(),
            kind,
            jti: prefixed_ulid(prefix::TOKEN),
            iat: now,
            exp: now.saturating_add(i64::try_from(ttl_secs).unwrap_or(i64::MAX)),
        };
        let token = jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| {
                tracing::error!(?e, "failed to sign token");
                TokenError::Signing
            })?;
        Ok((token, claims))
    }

    /// Verify signature and expiry, then the expected kind.
    fn verify(&self, token: &str, kind: TokenKind) -> Result<Claims, TokenError> {
        let claims = jsonwebtoken::decode::<Claims>(token, &self.decoding, &self.validation)?.claims;
        if claims.kind != kind {
            return Err(TokenError::Malformed);
        }
        Ok(claims)
    }

    /// Verify signature and kind, ignoring expiry.
    fn verify_for_revocation(&self, token: &str, kind: TokenKind) -> Result<Claims, TokenError> {
        let claims = jsonwebtoken::decode::<Claims>(token, &self.decoding, &self.revocation)?.claims;
        if claims.kind != kind {
            return Err(TokenError::Malformed);
        }
        Ok(claims)
    }

    /// Issue a short-lived access token. Nothing is written to the store.
    pub fn issue_access_token(&self, user_id: &str) -> Result<String, TokenError> {
        let (token, _) = self.mint(user_id, TokenKind::Access, self.access_ttl_secs)?;
        Ok(token)
    }

    /// Issue a long-lived refresh token and record it on the allow-list.
    pub async fn issue_refresh_token(&self, user_id: &str) -> Result<String, TokenError> {
        let (token, claims) = self.mint(user_id, TokenKind::Refresh, self.refresh_ttl_secs)?;
        let key = format!("{ALLOW_PREFIX}{}", claims.jti);
        self.store.set_ex(&key, user_id, self.refresh_ttl_secs).await?;
        Ok(token)
    }

    pub async fn issue_pair(&self, user_id: &str) -> Result<TokenPair, TokenError> {
        Ok(TokenPair {
            access_token: self.issue_access_token(user_id)?,
            refresh_token: self.issue_refresh_token(user_id).await?,
            expires_in: self.access_ttl_secs,
        })
    }

    /// Returns the token's user id unless it is invalid or on the deny-list.
    pub async fn validate_access_token(&self, token: &str) -> Result<String, TokenError> {
        let claims = self.verify(token, TokenKind::Access)?;
        let key = format!("{DENY_PREFIX}{}", claims.jti);
        if self.store.exists(&key).await? {
            return Err(TokenError::Revoked);
        }
        Ok(claims.sub)
    }

    /// Returns the token's user id only while its allow-list record exists.
    pub async fn validate_refresh_token(&self, token: &str) -> Result<String, TokenError> {
        let claims = self.verify(token, TokenKind::Refresh)?;
        let key = format!("{ALLOW_PREFIX}{}", claims.jti);
        if !self.store.exists(&key).await? {
            return Err(TokenError::NotFoundOrExpired);
        }
        Ok(claims.sub)
    }

    /// Deny-list the token for as long as validation would still accept it,
    /// which runs past `exp` by the leeway.
    ///
    /// A token already beyond that needs no entry, so nothing is written.
    pub async fn revoke_access_token(&self, token: &str) -> Result<(), TokenError> {
        let claims = self.verify_for_revocation(token, TokenKind::Access)?;
        let ttl = claims.accepted_for_secs();
        if ttl == 0 {
            return Ok(());
        }
        let key = format!("{DENY_PREFIX}{}", claims.jti);
        self.store.set_ex(&key, "revoked", ttl).await?;
        tracing::debug!(jti = %claims.jti, ttl, "access token revoked");
        Ok(())
    }

    /// Remove the token from the allow-list. Idempotent.
    pub async fn revoke_refresh_token(&self, token: &str) -> Result<(), TokenError> {
        let claims = self.verify_for_revocation(token, TokenKind::Refresh)?;
        let key = format!("{ALLOW_PREFIX}{}", claims.jti);
        self.store.del(&key).await?;
        Ok(())
    }

    /// Exchange a refresh token for a new pair. The presented token is
    /// consumed: the allow-list delete is the single point that decides a
    /// race between two concurrent rotations.
    pub async fn rotate(&self, refresh_token: &str) -> Result<(String, TokenPair), TokenError> {
        let claims = self.verify(refresh_token, TokenKind::Refresh)?;
        let key = format!("{ALLOW_PREFIX}{}", claims.jti);
        if !self.store.del(&key).await? {
            return Err(TokenError::NotFoundOrExpired);
        }
        let pair = self.issue_pair(&claims.sub).await?;
        Ok((claims.sub, pair))
    }

    /// Verified claims of a refresh token without consulting the store.
    pub fn refresh_claims(&self, token: &str) -> Result<Claims, TokenError> {
        self.verify_for_revocation(token, TokenKind::Refresh)
    }
}
