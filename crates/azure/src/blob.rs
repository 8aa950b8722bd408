//! Blob storage download client, used to fetch the replay dataset.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::AUTHORIZATION;
use reqwest::StatusCode;
use tracing::{info, instrument};
use url::Url;

use crate::credential::TokenCredential;
use crate::error::{snippet, AzureError};

/// Azure AD scope for Blob storage data-plane access.
pub const STORAGE_SCOPE: &str = "https://storage.azure.com/.default";

/// REST version sent with every request; bearer auth needs 2017-11-09 or later.
const STORAGE_API_VERSION: &str = "2021-08-06";

/// Downloads blobs from one storage account.
pub struct BlobClient {
    client: reqwest::Client,
    account_url: Url,
    credential: Arc<dyn TokenCredential>,
}

impl BlobClient {
    /// Creates a client for the account at `account_url` (e.g.
    /// `https://account.blob.core.windows.net`).
    pub fn new(
        account_url: &str,
        credential: Arc<dyn TokenCredential>,
    ) -> Result<Self, AzureError> {
        let account_url = Url::parse(account_url.trim())
            .map_err(|_| AzureError::InvalidEndpoint(account_url.to_owned()))?;
        if account_url.cannot_be_a_base() {
            return Err(AzureError::InvalidEndpoint(account_url.to_string()));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()?;
        Ok(Self {
            client,
            account_url,
            credential,
        })
    }

    fn blob_url(&self, container: &str, blob: &str) -> Result<Url, AzureError> {
        let mut url = self.account_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| AzureError::InvalidEndpoint(self.account_url.to_string()))?;
            segments.pop_if_empty().push(container);
            for part in blob.split('/').filter(|p| !p.is_empty()) {
                segments.push(part);
            }
        }
        Ok(url)
    }

    /// Downloads `container/blob` into memory.
    #[instrument(skip(self))]
    pub async fn download(&self, container: &str, blob: &str) -> Result<Vec<u8>, AzureError> {
        let url = self.blob_url(container, blob)?;
        let token = self.credential.get_token(STORAGE_SCOPE).await?;
        let response = self
            .client
            .get(url)
            .header(AUTHORIZATION, token.bearer())
            .header("x-ms-version", STORAGE_API_VERSION)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(AzureError::NotFound(format!("{container}/{blob}")));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AzureError::Status {
                operation: "download blob",
                status: status.as_u16(),
                message: snippet(&body),
            });
        }

        let bytes = response.bytes().await?;
        info!(bytes = bytes.len(), "Downloaded blob");
        Ok(bytes.to_vec())
    }
}
