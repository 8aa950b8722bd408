//! Key Vault secret client.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use reqwest::StatusCode;
use secrecy::SecretString;
use serde::Deserialize;
use tracing::{debug, instrument};

use domain::{SecretError, SecretProvider};

use crate::credential::TokenCredential;
use crate::error::{snippet, AzureError};

/// Azure AD scope for Key Vault data-plane access.
pub const KEY_VAULT_SCOPE: &str = "https://vault.azure.net/.default";

const API_VERSION: &str = "7.4";

#[derive(Deserialize)]
struct SecretBundle {
    value: String,
}

/// Returns `true` if `name` is a legal Key Vault secret name.
pub fn is_valid_secret_name(name: &str) -> bool {
    (1..=127).contains(&name.len())
        && name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
}

/// Reads secrets from one vault using an Azure AD credential.
pub struct KeyVaultClient {
    client: reqwest::Client,
    vault_url: String,
    credential: Arc<dyn TokenCredential>,
}

impl KeyVaultClient {
    /// Creates a client for the vault at `vault_url` (e.g.
    /// `https://my-vault.vault.azure.net`).
    pub fn new(
        vault_url: &str,
        credential: Arc<dyn TokenCredential>,
    ) -> Result<Self, AzureError> {
        let vault_url = vault_url.trim().trim_end_matches('/');
        url::Url::parse(vault_url).map_err(|_| AzureError::InvalidEndpoint(vault_url.to_owned()))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            vault_url: vault_url.to_owned(),
            credential,
        })
    }

    /// Fetches the latest version of `name`; `Ok(None)` if it does not exist.
    #[instrument(skip(self), fields(vault = %self.vault_url))]
    pub async fn fetch_secret(&self, name: &str) -> Result<Option<SecretString>, AzureError> {
        let token = self.credential.get_token(KEY_VAULT_SCOPE).await?;
        let response = self
            .client
            .get(format!("{}/secrets/{name}", self.vault_url))
            .query(&[("api-version", API_VERSION)])
            .header(AUTHORIZATION, token.bearer())
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            debug!("Secret not found");
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AzureError::Status {
                operation: "get secret",
                status: status.as_u16(),
                message: snippet(&body),
            });
        }

        let bundle: SecretBundle = response.json().await?;
        Ok(Some(SecretString::from(bundle.value)))
    }
}

#[async_trait]
impl SecretProvider for KeyVaultClient {
    async fn get_secret(&self, name: &str) -> Result<Option<SecretString>, SecretError> {
        if !is_valid_secret_name(name) {
            return Err(SecretError::InvalidName(name.to_owned()));
        }
        match self.fetch_secret(name).await {
            Ok(secret) => Ok(secret),
            Err(AzureError::Status { status: 401 | 403, .. }) => Err(SecretError::AccessDenied {
                name: name.to_owned(),
            }),
            Err(e) => Err(SecretError::Provider(e.to_string())),
        }
    }
}
