use async_trait::async_trait;
use axum::{
    extract::{Query, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::collections::HashSet;
use std::sync::Arc;
use switchyard_core::config::AuthConfig;
use tracing::{debug, warn};

/// What a peer presented while upgrading.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    /// Key from the bearer header or the query string.
    pub api_key: Option<String>,
}

impl Credentials {
    /// `Authorization: Bearer <key>` first, then `?api_key=<key>`.
    pub fn from_request(headers: &HeaderMap, query: &AuthQuery) -> Self {
        let from_header = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(|s| s.trim().to_string());
        Self {
            api_key: from_header.or_else(|| query.api_key.clone()),
        }
    }
}

/// Pass/fail check run before a connection is opened.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Whether the peer may open a connection.
    async fn authenticate(&self, credentials: &Credentials) -> bool;
}

/// Admits everyone.
pub struct AllowAll;

#[async_trait]
impl Authenticator for AllowAll {
    async fn authenticate(&self, _credentials: &Credentials) -> bool {
        true
    }
}

/// Admits peers presenting one of a fixed set of API keys.
pub struct ApiKeyAuthenticator {
    api_keys: HashSet<String>,
}

impl ApiKeyAuthenticator {
    /// Accept exactly these keys.
    pub fn new(api_keys: impl IntoIterator<Item = String>) -> Self {
        Self {
            api_keys: api_keys.into_iter().collect(),
        }
    }
}

#[async_trait]
impl Authenticator for ApiKeyAuthenticator {
    async fn authenticate(&self, credentials: &Credentials) -> bool {
        credentials
            .api_key
            .as_ref()
            .is_some_and(|k| self.api_keys.contains(k))
    }
}

/// `AllowAll` when no keys are configured, otherwise key checking.
pub fn authenticator_from_config(config: &AuthConfig) -> Arc<dyn Authenticator> {
    if config.api_keys.is_empty() {
        Arc::new(AllowAll)
    } else {
        Arc::new(ApiKeyAuthenticator::new(config.api_keys.iter().cloned()))
    }
}

/// Query-string credentials for peers that cannot set headers.
#[derive(serde::Deserialize, Default)]
pub struct AuthQuery {
    /// `?api_key=`.
    pub api_key: Option<String>,
}

/// Rejects the request with 401 unless the authenticator admits it.
pub async fn auth_middleware(
    State(auth): State<Arc<dyn Authenticator>>,
    headers: HeaderMap,
    query: Query<AuthQuery>,
    request: Request,
    next: Next,
) -> Response {
    let credentials = Credentials::from_request(&headers, &query);
    if auth.authenticate(&credentials).await {
        debug!(path = %request.uri().path(), "Request authenticated");
        return next.run(request).await;
    }
    if credentials.api_key.is_some() {
        warn!("Rejected request: invalid API key");
        (StatusCode::UNAUTHORIZED, "Invalid API key").into_response()
    } else {
        warn!("Rejected request: missing API key");
        (StatusCode::UNAUTHORIZED, "API key required").into_response()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[tokio::test]
    async fn test_allow_all() {
        assert!(AllowAll.authenticate(&Credentials::default()).await);
    }

    #[tokio::test]
    async fn test_api_key_authenticator() {
        let auth = ApiKeyAuthenticator::new(vec!["key123".to_string()]);
        let good = Credentials {
            api_key: Some("key123".into()),
        };
        let bad = Credentials {
            api_key: Some("nope".into()),
        };
        assert!(auth.authenticate(&good).await);
        assert!(!auth.authenticate(&bad).await);
        assert!(!auth.authenticate(&Credentials::default()).await);
    }

    #[test]
    fn test_credentials_header_beats_query() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer from-header"));
        let query = AuthQuery {
            api_key: Some("from-query".into()),
        };
        let creds = Credentials::from_request(&headers, &query);
        assert_eq!(creds.api_key.as_deref(), Some("from-header"));

        let creds = Credentials::from_request(&HeaderMap::new(), &query);
        assert_eq!(creds.api_key.as_deref(), Some("from-query"));
    }

    #[tokio::test]
    async fn test_authenticator_from_config() {
        let open = authenticator_from_config(&AuthConfig::default());
        assert!(open.authenticate(&Credentials::default()).await);

        let locked = authenticator_from_config(&AuthConfig {
            api_keys: vec!["k".into()],
        });
        assert!(!locked.authenticate(&Credentials::default()).await);
    }
}
