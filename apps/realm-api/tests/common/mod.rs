#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;
use jsonwebtoken::{Algorithm, EncodingKey, Header};

use realm_api::auth::tokens::{Claims, TokenKind};
use realm_api::config::Config;
use realm_api::db::kv::{KeyValueStore, MemoryStore, StoreError};
use realm_api::gateway::Hub;
use realm_api::AppState;

pub const TEST_SECRET: &str = "test-secret-0123456789abcdef0123456789";

pub fn test_config() -> Config {
    Config {
        jwt_secret: TEST_SECRET.to_string(),
        redis_url: None,
        port: 0,
        access_ttl_secs: 900,
        refresh_ttl_secs: 3600,
        outbound_queue: 64,
        ping_interval_secs: 30,
    }
}

/// Build a test AppState with an in-memory token store and a running hub.
pub fn test_state() -> AppState {
    test_state_with(test_config(), Arc::new(MemoryStore::new()))
}

pub fn test_state_with(config: Config, kv: Arc<dyn KeyValueStore>) -> AppState {
    let (hub, _task) = Hub::spawn();
    AppState::new(config, kv, hub)
}

/// Build the full application router wired to the test state.
pub fn test_app() -> (Router, AppState) {
    let state = test_state();
    let app = realm_api::routes::router().with_state(state.clone());
    (app, state)
}

/// Issue a fresh access + refresh pair for `user_id`.
pub async fn login(state: &AppState, user_id: &str) -> (String, String) {
    let pair = state.tokens.issue_pair(user_id).await.expect("issue pair");
    (pair.access_token, pair.refresh_token)
}

/// Sign arbitrary claims with `secret`, bypassing the token service.
pub fn mint(secret: &str, user_id: &str, kind: TokenKind, iat: i64, exp: i64) -> String {
    let claims = Claims {
        sub: user_id.to_string(),
        kind,
        jti: realm_common::id::prefixed_ulid(realm_common::id::prefix::TOKEN),
        iat,
        exp,
    };
    jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .expect("mint test token")
}

/// An access token that expired a minute ago.
pub fn expired_access_token(user_id: &str) -> String {
    let now = chrono::Utc::now().timestamp();
    mint(TEST_SECRET, user_id, TokenKind::Access, now - 960, now - 60)
}

/// A store whose every call fails, as if Redis were down.
pub struct FailingStore;

#[async_trait]
impl KeyValueStore for FailingStore {
    async fn set_ex(&self, _key: &str, _value: &str, _ttl_secs: u64) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }

    async fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }

    async fn del(&self, _key: &str) -> Result<bool, StoreError> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }

    async fn exists(&self, _key: &str) -> Result<bool, StoreError> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }
}
