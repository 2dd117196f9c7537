use crate::config::AuthConfig;
use async_trait::async_trait;
use axum::http::{header, HeaderMap};
use std::collections::HashMap;

/// User behind a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub id: String,
}

/// Resolves the user session carried by a request
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SessionResolver: Send + Sync {
    async fn resolve(&self, headers: &HeaderMap) -> Option<AuthenticatedUser>;
}

/// Bearer tokens configured statically
pub struct StaticTokenResolver {
    tokens: HashMap<String, String>,
}

impl StaticTokenResolver {
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            tokens: config
                .tokens
                .iter()
                .map(|t| (t.token.clone(), t.user_id.clone()))
                .collect(),
        }
    }
}

#[async_trait]
impl SessionResolver for StaticTokenResolver {
    async fn resolve(&self, headers: &HeaderMap) -> Option<AuthenticatedUser> {
        let token = bearer_token(headers)?;
        self.tokens
            .get(token)
            .map(|user_id| AuthenticatedUser { id: user_id.clone() })
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}
