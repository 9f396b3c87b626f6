use async_trait::async_trait;
use http::{header, HeaderMap};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CurrentUser {
    pub id: String,
    pub email: String,
}

/// Resolves the caller behind a bearer credential.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// `Ok(None)` means the credential is unknown.
    async fn current_user(&self, token: &str) -> anyhow::Result<Option<CurrentUser>>;
}

#[derive(Debug, Clone, Deserialize)]
pub struct StaticUser {
    pub id: String,
    pub email: String,
    pub token: String,
}

/// Token table loaded from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenIdentityProvider {
    users: Vec<StaticUser>,
}

impl StaticTokenIdentityProvider {
    pub fn new(users: Vec<StaticUser>) -> Self {
        Self { users }
    }
}

#[async_trait]
impl IdentityProvider for StaticTokenIdentityProvider {
    async fn current_user(&self, token: &str) -> anyhow::Result<Option<CurrentUser>> {
        // scan the whole table so timing does not depend on which entry matched
        let mut found = None;
        for user in &self.users {
            if secrets_match(token, &user.token) && found.is_none() {
                found = Some(CurrentUser {
                    id: user.id.clone(),
                    email: user.email.clone(),
                });
            }
        }
        Ok(found)
    }
}

pub fn secrets_match(provided: &str, expected: &str) -> bool {
    !expected.is_empty() && bool::from(provided.as_bytes().ct_eq(expected.as_bytes()))
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn provider() -> StaticTokenIdentityProvider {
        StaticTokenIdentityProvider::new(vec![
            StaticUser {
                id: "u1".to_string(),
                email: "one@example.com".to_string(),
                token: "token-one".to_string(),
            },
            StaticUser {
                id: "u2".to_string(),
                email: "two@example.com".to_string(),
                token: "token-two".to_string(),
            },
        ])
    }

    #[tokio::test]
    async fn resolves_known_tokens_only() {
        let provider = provider();
        let user = provider.current_user("token-two").await.expect("lookup");
        assert_eq!(user.map(|u| u.id), Some("u2".to_string()));
        assert!(provider.current_user("token-three").await.expect("lookup").is_none());
        assert!(provider.current_user("").await.expect("lookup").is_none());
    }

    #[test]
    fn extracts_bearer_credentials() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert_eq!(bearer_token(&headers), Some("abc"));
    }

    #[test]
    fn empty_secrets_never_match() {
        assert!(!secrets_match("", ""));
        assert!(secrets_match("s3cret", "s3cret"));
        assert!(!secrets_match("s3cret", "s3cret-longer"));
    }
}
