//! Token resolution.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tether_core::AccountId;
use tracing::debug;

use crate::errors::AuthError;

/// Resolves an access token to the account that owns it.
#[async_trait]
pub trait AuthResolver: Send + Sync {
    /// Look up `token`. Any failure means the token is unusable.
    async fn resolve(&self, token: &str) -> Result<AccountId, AuthError>;
}

/// Token-info response from the account service.
#[derive(Debug, Deserialize)]
struct TokenInfo {
    #[serde(default)]
    resource_owner_id: Option<ObjectId>,
}

#[derive(Debug, Deserialize)]
struct ObjectId {
    #[serde(rename = "$oid", default)]
    oid: Option<String>,
}

/// [`AuthResolver`] backed by `GET {base}/oauth/token/info.json`.
#[derive(Clone, Debug)]
pub struct HttpAuthResolver {
    client: reqwest::Client,
    info_url: String,
}

impl HttpAuthResolver {
    /// Create a resolver for the service at `base_url`. Every lookup is
    /// bounded by `timeout`.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, AuthError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, base_url))
    }

    /// Create a resolver around an existing client.
    pub fn with_client(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            info_url: format!(
                "{}/oauth/token/info.json",
                base_url.trim_end_matches('/')
            ),
        }
    }
}

#[async_trait]
impl AuthResolver for HttpAuthResolver {
    async fn resolve(&self, token: &str) -> Result<AccountId, AuthError> {
        let resp = self
            .client
            .get(&self.info_url)
            .query(&[("access_token", token)])
            .send()
            .await?;

        let status = resp.status().as_u16();
        if status != 200 {
            debug!(status, "token info request rejected");
            return Err(AuthError::Rejected { status });
        }

        let body = resp.text().await?;
        let info: TokenInfo = serde_json::from_str(&body)?;
        info.resource_owner_id
            .and_then(|owner| owner.oid)
            .filter(|oid| !oid.is_empty())
            .map(AccountId::from_string)
            .ok_or(AuthError::MissingAccount)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn resolver_for(server: &MockServer) -> HttpAuthResolver {
        HttpAuthResolver::new(&server.uri(), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn resolves_account_id() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/oauth/token/info.json"))
            .and(query_param("access_token", "good-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "resource_owner_id": {"$oid": "5a1b2c3d"},
                "scopes": ["public"],
            })))
            .expect(1)
            .mount(&server)
            .await;

        let account = resolver_for(&server).await.resolve("good-token").await.unwrap();
        assert_eq!(account.as_str(), "5a1b2c3d");
    }

    #[tokio::test]
    async fn token_is_url_encoded() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/oauth/token/info.json"))
            .and(query_param("access_token", "a b&c=d"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "resource_owner_id": {"$oid": "acct"},
            })))
            .mount(&server)
            .await;

        let account = resolver_for(&server).await.resolve("a b&c=d").await.unwrap();
        assert_eq!(account.as_str(), "acct");
    }

    #[tokio::test]
    async fn non_200_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/oauth/token/info.json"))
            .respond_with(ResponseTemplate::new(401).set_body_string("Unauthorized"))
            .mount(&server)
            .await;

        let err = resolver_for(&server).await.resolve("bad").await.unwrap_err();
        assert!(matches!(err, AuthError::Rejected { status: 401 }));
    }

    #[tokio::test]
    async fn missing_owner_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/oauth/token/info.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "scopes": ["public"],
            })))
            .mount(&server)
            .await;

        let err = resolver_for(&server).await.resolve("t").await.unwrap_err();
        assert!(matches!(err, AuthError::MissingAccount));
    }

    #[tokio::test]
    async fn owner_without_oid_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/oauth/token/info.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "resource_owner_id": {},
            })))
            .mount(&server)
            .await;

        let err = resolver_for(&server).await.resolve("t").await.unwrap_err();
        assert!(matches!(err, AuthError::MissingAccount));
    }

    #[tokio::test]
    async fn empty_oid_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/oauth/token/info.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "resource_owner_id": {"$oid": ""},
            })))
            .mount(&server)
            .await;

        let err = resolver_for(&server).await.resolve("t").await.unwrap_err();
        assert!(matches!(err, AuthError::MissingAccount));
    }

    #[tokio::test]
    async fn malformed_body_is_a_decode_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/oauth/token/info.json"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let err = resolver_for(&server).await.resolve("t").await.unwrap_err();
        assert!(matches!(err, AuthError::Decode(_)));
    }

    #[tokio::test]
    async fn slow_upstream_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/oauth/token/info.json"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"resource_owner_id": {"$oid": "x"}}))
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let resolver = HttpAuthResolver::new(&server.uri(), Duration::from_millis(50)).unwrap();
        let err = resolver.resolve("t").await.unwrap_err();
        assert!(matches!(err, AuthError::Http(_)));
    }

    #[tokio::test]
    async fn unreachable_upstream_is_http_error() {
        let resolver =
            HttpAuthResolver::new("http://127.0.0.1:1", Duration::from_secs(1)).unwrap();
        let err = resolver.resolve("t").await.unwrap_err();
        assert!(matches!(err, AuthError::Http(_)));
    }

    #[test]
    fn trailing_slash_is_trimmed() {
        let resolver = HttpAuthResolver::with_client(reqwest::Client::new(), "https://auth.io/");
        assert_eq!(resolver.info_url, "https://auth.io/oauth/token/info.json");
    }
}
