//! Azure AD access tokens.
//!
//! [`TokenCredential`] hands out bearer tokens for a scope such as
//! `https://eventhubs.azure.net/.default`. [`ManagedIdentityCredential`]
//! fetches them from the instance metadata endpoint available to pods and VMs
//! with an assigned identity; [`StaticTokenCredential`] returns a fixed token
//! for local runs and tests.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{snippet, AzureError};

/// Default instance metadata token endpoint.
pub const IMDS_TOKEN_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";

const IMDS_API_VERSION: &str = "2018-02-01";

/// Tokens with less validity left than this many seconds are refreshed.
const REFRESH_MARGIN_SECS: i64 = 300;

/// A bearer token and its expiry.
pub struct AccessToken {
    /// The token value.
    pub token: SecretString,
    /// When the token stops being accepted.
    pub expires_on: DateTime<Utc>,
}

impl AccessToken {
    /// Creates a token.
    pub fn new(token: impl Into<String>, expires_on: DateTime<Utc>) -> Self {
        Self {
            token: SecretString::from(token.into()),
            expires_on,
        }
    }

    /// Returns `true` if the token is valid for longer than the refresh margin.
    pub fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_on - now > chrono::Duration::seconds(REFRESH_MARGIN_SECS)
    }

    /// `Authorization` header value for this token.
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.token.expose_secret())
    }
}

impl Clone for AccessToken {
    fn clone(&self) -> Self {
        Self::new(self.token.expose_secret(), self.expires_on)
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"[REDACTED]")
            .field("expires_on", &self.expires_on)
            .finish()
    }
}

/// Source of Azure AD bearer tokens.
#[async_trait]
pub trait TokenCredential: Send + Sync {
    /// Returns a token valid for `scope`.
    async fn get_token(&self, scope: &str) -> Result<AccessToken, AzureError>;
}

// ---------------------------------------------------------------------------
// Static token
// ---------------------------------------------------------------------------

/// Returns the same token for every scope.
pub struct StaticTokenCredential {
    token: SecretString,
}

impl StaticTokenCredential {
    /// Creates a credential that always returns `token`.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: SecretString::from(token.into()),
        }
    }
}

#[async_trait]
impl TokenCredential for StaticTokenCredential {
    async fn get_token(&self, _scope: &str) -> Result<AccessToken, AzureError> {
        Ok(AccessToken::new(
            self.token.expose_secret(),
            Utc::now() + chrono::Duration::days(1),
        ))
    }
}

// ---------------------------------------------------------------------------
// Managed identity
// ---------------------------------------------------------------------------

/// Token response from the instance metadata endpoint.
///
/// The endpoint encodes `expires_on` as a string of epoch seconds.
#[derive(Debug, Deserialize)]
struct ImdsTokenResponse {
    access_token: String,
    #[serde(deserialize_with = "epoch_seconds")]
    expires_on: i64,
}

fn epoch_seconds<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(i64),
        Text(String),
    }
    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

/// Acquires tokens for the managed identity assigned to the host.
///
/// Tokens are cached per scope and reused until fewer than five minutes of
/// validity remain.
pub struct ManagedIdentityCredential {
    client: reqwest::Client,
    endpoint: String,
    client_id: Option<String>,
    cache: Mutex<HashMap<String, AccessToken>>,
}

impl ManagedIdentityCredential {
    /// Uses the system-assigned identity, or the user-assigned identity with
    /// `client_id` when given.
    pub fn new(client_id: Option<String>) -> Result<Self, AzureError> {
        Self::with_endpoint(IMDS_TOKEN_ENDPOINT, client_id)
    }

    /// Uses a non-default token endpoint.
    pub fn with_endpoint(
        endpoint: impl Into<String>,
        client_id: Option<String>,
    ) -> Result<Self, AzureError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            client_id,
            cache: Mutex::new(HashMap::new()),
        })
    }

    async fn fetch(&self, scope: &str) -> Result<AccessToken, AzureError> {
        let resource = scope.trim_end_matches("/.default");
        let mut query = vec![("api-version", IMDS_API_VERSION), ("resource", resource)];
        if let Some(client_id) = &self.client_id {
            query.push(("client_id", client_id.as_str()));
        }

        let response = self
            .client
            .get(&self.endpoint)
            .header("Metadata", "true")
            .query(&query)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(AzureError::Token(format!(
                "status {}: {}",
                status.as_u16(),
                snippet(&body)
            )));
        }

        let parsed: ImdsTokenResponse =
            serde_json::from_str(&body).map_err(|e| AzureError::Token(e.to_string()))?;
        let expires_on = Utc
            .timestamp_opt(parsed.expires_on, 0)
            .single()
            .ok_or_else(|| AzureError::Token(format!("bad expiry {}", parsed.expires_on)))?;
        debug!(scope, %expires_on, "Acquired managed identity token");
        Ok(AccessToken::new(parsed.access_token, expires_on))
    }
}

#[async_trait]
impl TokenCredential for ManagedIdentityCredential {
    async fn get_token(&self, scope: &str) -> Result<AccessToken, AzureError> {
        let mut cache = self.cache.lock().await;
        if let Some(token) = cache.get(scope) {
            if token.is_fresh_at(Utc::now()) {
                return Ok(token.clone());
            }
        }
        let token = self.fetch(scope).await?;
        cache.insert(scope.to_owned(), token.clone());
        Ok(token)
    }
}
