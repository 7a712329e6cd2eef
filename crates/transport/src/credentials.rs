//! Credential providers for the transport handshake

use async_trait::async_trait;
use std::sync::Arc;
use voice_client_config::CredentialsConfig;
use voice_client_core::{AccessToken, CallError, CredentialProvider, Result};

/// Fetches a short-lived token from an HTTP endpoint
///
/// The endpoint answers `GET` with `{ "token": "...", "expires_in": 30 }`.
#[derive(Debug, Clone)]
pub struct HttpCredentialProvider {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpCredentialProvider {
    pub fn new(endpoint: impl Into<String>, config: &CredentialsConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| CallError::collaborator("credentials", e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl CredentialProvider for HttpCredentialProvider {
    async fn fetch_token(&self) -> Result<AccessToken> {
        let response = self
            .client
            .get(&self.endpoint)
            .send()
            .await
            .map_err(|e| CallError::collaborator("credentials", e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(CallError::collaborator(
                "credentials",
                format!("token endpoint returned {status}"),
            ));
        }

        let token: AccessToken = response
            .json()
            .await
            .map_err(|e| CallError::collaborator("credentials", e.to_string()))?;
        if token.token.is_empty() {
            return Err(CallError::collaborator("credentials", "empty token"));
        }

        tracing::debug!(expires_in = ?token.expires_in, "Fetched provider token");
        Ok(token)
    }
}

/// Fixed token, for API keys and tests
#[derive(Debug, Clone)]
pub struct StaticCredentials {
    token: AccessToken,
}

impl StaticCredentials {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: AccessToken::new(token),
        }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn fetch_token(&self) -> Result<AccessToken> {
        Ok(self.token.clone())
    }
}

/// Pick the credential source the settings describe
pub fn from_config(config: &CredentialsConfig) -> Result<Arc<dyn CredentialProvider>> {
    match (&config.endpoint, &config.api_key) {
        (Some(endpoint), _) => Ok(Arc::new(HttpCredentialProvider::new(endpoint.clone(), config)?)),
        (None, Some(key)) => Ok(Arc::new(StaticCredentials::new(key.clone()))),
        (None, None) => Err(CallError::Configuration(
            "either credentials.endpoint or credentials.api_key must be set".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_credentials() {
        let provider = StaticCredentials::new("secret");
        let token = provider.fetch_token().await.unwrap();
        assert_eq!(token.token, "secret");
        assert!(!format!("{token:?}").contains("secret"));
    }

    #[test]
    fn test_from_config_requires_a_source() {
        let config = CredentialsConfig::default();
        assert!(matches!(
            from_config(&config),
            Err(CallError::Configuration(_))
        ));

        let config = CredentialsConfig {
            api_key: Some("k".into()),
            ..CredentialsConfig::default()
        };
        assert!(from_config(&config).is_ok());
    }
}
