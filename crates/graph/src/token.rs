use std::time::{Duration, Instant};

use config::{AzureConfig, CredentialKind};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::{Mutex, RwLock};

use crate::GraphError;

const GRAPH_SCOPE: &str = "https://graph.microsoft.com/.default";
const GRAPH_RESOURCE: &str = "https://graph.microsoft.com";
const IMDS_TOKEN_URL: &str = "http://169.254.169.254/metadata/identity/oauth2/token";

/// How long before expiry a cached token is refreshed.
const REFRESH_MARGIN: Duration = Duration::from_secs(30);

/// Acquires and caches Microsoft Graph access tokens for the proxy's own
/// directory credential.
///
/// Supports the client-credential flow against the tenant token endpoint and
/// managed identity through the instance metadata service. Tokens are cached
/// until shortly before expiry and refreshed behind a lock so concurrent
/// callers trigger a single request.
pub struct TokenProvider {
    client: reqwest::Client,
    credential: CredentialKind,
    token_url: String,
    client_id: String,
    client_secret: Option<SecretString>,
    token: RwLock<Option<(String, Instant)>>,
    refresh_lock: Mutex<()>,
}

impl TokenProvider {
    pub(crate) fn new(client: reqwest::Client, azure: &AzureConfig) -> Self {
        Self {
            client,
            credential: azure.credential,
            token_url: format!(
                "https://login.microsoftonline.com/{}/oauth2/v2.0/token",
                azure.tenant_id
            ),
            client_id: azure.client_id.clone(),
            client_secret: azure.client_secret.clone(),
            token: RwLock::new(None),
            refresh_lock: Mutex::new(()),
        }
    }

    /// Returns a bearer token for Microsoft Graph, refreshing it if needed.
    pub async fn bearer(&self) -> Result<String, GraphError> {
        if let Some((token, expires_at)) = self.token.read().await.as_ref()
            && Instant::now() + REFRESH_MARGIN < *expires_at
        {
            return Ok(token.clone());
        }

        let _refresh_guard = self.refresh_lock.lock().await;

        // Double-check: another task might have refreshed while we were waiting
        if let Some((token, expires_at)) = self.token.read().await.as_ref()
            && Instant::now() + REFRESH_MARGIN < *expires_at
        {
            return Ok(token.clone());
        }

        let response = self.request_token().await?;
        let expires_at = Instant::now() + Duration::from_secs(response.expires_in);

        {
            let mut cache = self.token.write().await;
            *cache = Some((response.access_token.clone(), expires_at));
        }

        Ok(response.access_token)
    }

    /// Whether the directory credential can currently produce a token. Used
    /// by the liveness probe.
    pub async fn is_valid(&self) -> bool {
        self.bearer().await.is_ok()
    }

    async fn request_token(&self) -> Result<TokenResponse, GraphError> {
        let response = match self.credential {
            CredentialKind::ClientSecret => {
                let secret = self
                    .client_secret
                    .as_ref()
                    .ok_or_else(|| GraphError::Credential("client secret is not configured".to_string()))?;

                self.client
                    .post(&self.token_url)
                    .form(&[
                        ("grant_type", "client_credentials"),
                        ("client_id", self.client_id.as_str()),
                        ("client_secret", secret.expose_secret()),
                        ("scope", GRAPH_SCOPE),
                    ])
                    .send()
                    .await?
            }
            CredentialKind::ManagedIdentity => {
                self.client
                    .get(IMDS_TOKEN_URL)
                    .query(&[("api-version", "2018-02-01"), ("resource", GRAPH_RESOURCE)])
                    .header("Metadata", "true")
                    .send()
                    .await?
            }
        };

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();

            return Err(GraphError::Credential(format!(
                "token request failed with status {status}: {body}"
            )));
        }

        Ok(response.json().await?)
    }
}

#[derive(serde::Deserialize)]
struct TokenResponse {
    access_token: String,
    // The instance metadata service returns this as a string, the tenant
    // token endpoint as a number.
    #[serde(deserialize_with = "deserialize_expires_in")]
    expires_in: u64,
}

fn deserialize_expires_in<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    struct ExpiresInVisitor;

    impl serde::de::Visitor<'_> for ExpiresInVisitor {
        type Value = u64;

        fn expecting(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            formatter.write_str("a number of seconds, as an integer or a string")
        }

        fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            Ok(value)
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            value.parse().map_err(E::custom)
        }
    }

    deserializer.deserialize_any(ExpiresInVisitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expires_in_as_number() {
        let response: TokenResponse =
            serde_json::from_str(r#"{"access_token": "tok", "expires_in": 3599}"#).unwrap();

        assert_eq!(response.expires_in, 3599);
    }

    #[test]
    fn expires_in_as_string() {
        let response: TokenResponse =
            serde_json::from_str(r#"{"access_token": "tok", "expires_in": "3599"}"#).unwrap();

        assert_eq!(response.expires_in, 3599);
    }
}
