//! Event Hubs publisher over the REST send-batch endpoint.
//!
//! Batches are POSTed to `{endpoint}/{hub}/messages` as a JSON array of
//! messages. Each message's partition key is the machine id, so events from
//! one machine land on one partition in emission order.
//!
//! Authentication is either an Azure AD bearer token or a Shared Access
//! Signature derived from a namespace connection string.
//!
//! Delivery is at-least-once: when a batch is split into several requests and
//! a later request fails, a retry re-sends the earlier ones as well. Consumers
//! deduplicate on `event_id`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER};
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use sha2::Sha256;
use tracing::{debug, instrument, warn};
use url::form_urlencoded;

use domain::{EventPublisher, PublishError, SensorEvent};

use crate::credential::TokenCredential;
use crate::error::{snippet, AzureError};

type HmacSha256 = Hmac<Sha256>;

/// Azure AD scope for Event Hubs data-plane access.
pub const EVENT_HUBS_SCOPE: &str = "https://eventhubs.azure.net/.default";

const API_VERSION: &str = "2014-01";
const BATCH_CONTENT_TYPE: &str = "application/vnd.microsoft.servicebus.json";
const SAS_VALIDITY_SECS: i64 = 3600;

/// Default maximum number of events per HTTP request.
pub const DEFAULT_MAX_BATCH_EVENTS: usize = 100;

// ---------------------------------------------------------------------------
// Endpoint and connection string handling
// ---------------------------------------------------------------------------

/// Turns a namespace setting into its HTTPS endpoint.
///
/// Accepts a bare namespace (`"sensors-ns"`), a fully qualified host
/// (`"sensors-ns.servicebus.windows.net"`), or a URL (`sb://` or `https://`).
pub fn namespace_endpoint(namespace: &str) -> Result<String, AzureError> {
    let namespace = namespace.trim().trim_end_matches('/');
    if namespace.is_empty() {
        return Err(AzureError::InvalidEndpoint(namespace.to_owned()));
    }
    if let Some(host) = namespace.strip_prefix("sb://") {
        return Ok(format!("https://{host}"));
    }
    if namespace.contains("://") {
        return Ok(namespace.to_owned());
    }
    if namespace.contains('.') {
        return Ok(format!("https://{namespace}"));
    }
    Ok(format!("https://{namespace}.servicebus.windows.net"))
}

/// The components of an Event Hubs connection string.
///
/// `Endpoint=sb://ns.servicebus.windows.net/;SharedAccessKeyName=send;SharedAccessKey=...;EntityPath=hub`
pub struct EventHubConnectionString {
    /// HTTPS endpoint of the namespace.
    pub endpoint: String,
    /// Name of the shared access policy.
    pub key_name: String,
    /// Shared access key.
    pub key: SecretString,
    /// Event hub the policy is scoped to, if any.
    pub entity_path: Option<String>,
}

impl EventHubConnectionString {
    /// Parses a connection string. Keys are matched case-insensitively.
    pub fn parse(raw: &str) -> Result<Self, AzureError> {
        let mut endpoint = None;
        let mut key_name = None;
        let mut key = None;
        let mut entity_path = None;

        for part in raw.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let (name, value) = part.split_once('=').ok_or_else(|| {
                AzureError::InvalidConnectionString("segment without '='".to_owned())
            })?;
            match name.to_ascii_lowercase().as_str() {
                "endpoint" => endpoint = Some(namespace_endpoint(value)?),
                "sharedaccesskeyname" => key_name = Some(value.to_owned()),
                "sharedaccesskey" => key = Some(SecretString::from(value.to_owned())),
                "entitypath" => entity_path = Some(value.to_owned()),
                _ => {}
            }
        }

        let missing = |what: &str| AzureError::InvalidConnectionString(format!("missing {what}"));
        Ok(Self {
            endpoint: endpoint.ok_or_else(|| missing("Endpoint"))?,
            key_name: key_name.ok_or_else(|| missing("SharedAccessKeyName"))?,
            key: key.ok_or_else(|| missing("SharedAccessKey"))?,
            entity_path,
        })
    }
}

impl std::fmt::Debug for EventHubConnectionString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHubConnectionString")
            .field("endpoint", &self.endpoint)
            .field("key_name", &self.key_name)
            .field("entity_path", &self.entity_path)
            .finish_non_exhaustive()
    }
}

fn url_encode(value: &str) -> String {
    form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

/// Builds a Shared Access Signature for `resource_uri` valid until `expiry`
/// (epoch seconds).
pub fn shared_access_signature(
    resource_uri: &str,
    key_name: &str,
    key: &SecretString,
    expiry: i64,
) -> Result<String, AzureError> {
    let encoded_uri = url_encode(&resource_uri.to_ascii_lowercase());
    let string_to_sign = format!("{encoded_uri}\n{expiry}");

    let mut mac = HmacSha256::new_from_slice(key.expose_secret().as_bytes())
        .map_err(|e| AzureError::InvalidConnectionString(e.to_string()))?;
    mac.update(string_to_sign.as_bytes());
    let signature = STANDARD.encode(mac.finalize().into_bytes());

    Ok(format!(
        "SharedAccessSignature sr={encoded_uri}&sig={}&se={expiry}&skn={key_name}",
        url_encode(&signature)
    ))
}

// ---------------------------------------------------------------------------
// Publisher
// ---------------------------------------------------------------------------

/// How the publisher authenticates.
pub enum EventHubAuth {
    /// Azure AD bearer token for [`EVENT_HUBS_SCOPE`].
    Token(Arc<dyn TokenCredential>),
    /// Shared access policy key; a fresh signature is generated per request.
    SharedAccessKey {
        /// Policy name.
        key_name: String,
        /// Policy key.
        key: SecretString,
    },
}

impl From<EventHubConnectionString> for EventHubAuth {
    fn from(conn: EventHubConnectionString) -> Self {
        Self::SharedAccessKey {
            key_name: conn.key_name,
            key: conn.key,
        }
    }
}

#[derive(Serialize)]
struct BrokerProperties<'a> {
    #[serde(rename = "PartitionKey")]
    partition_key: &'a str,
}

#[derive(Serialize)]
struct UserProperties<'a> {
    machine_id: &'a str,
    machine_status: &'a str,
}

#[derive(Serialize)]
struct BatchMessage<'a> {
    #[serde(rename = "Body")]
    body: String,
    #[serde(rename = "BrokerProperties")]
    broker_properties: BrokerProperties<'a>,
    #[serde(rename = "UserProperties")]
    user_properties: UserProperties<'a>,
}

/// Encodes events as the Event Hubs batch body.
fn encode_batch(events: &[SensorEvent]) -> Result<Vec<u8>, PublishError> {
    let messages = events
        .iter()
        .map(|event| {
            Ok(BatchMessage {
                body: serde_json::to_string(event)?,
                broker_properties: BrokerProperties {
                    partition_key: event.machine_id.as_str(),
                },
                user_properties: UserProperties {
                    machine_id: event.machine_id.as_str(),
                    machine_status: event.machine_status.as_str(),
                },
            })
        })
        .collect::<Result<Vec<_>, serde_json::Error>>()?;
    Ok(serde_json::to_vec(&messages)?)
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Maps a non-success send response to a [`PublishError`].
pub fn classify_status(status: StatusCode, headers: &HeaderMap, body: &str) -> PublishError {
    let code = status.as_u16();
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => PublishError::Unauthorized {
            message: snippet(body),
        },
        StatusCode::TOO_MANY_REQUESTS => PublishError::Throttled {
            retry_after: retry_after(headers),
        },
        StatusCode::SERVICE_UNAVAILABLE => match retry_after(headers) {
            Some(delay) => PublishError::Throttled {
                retry_after: Some(delay),
            },
            None => PublishError::Unavailable { status: code },
        },
        StatusCode::INTERNAL_SERVER_ERROR | StatusCode::BAD_GATEWAY | StatusCode::GATEWAY_TIMEOUT => {
            PublishError::Unavailable { status: code }
        }
        _ => PublishError::Rejected {
            status: code,
            message: snippet(body),
        },
    }
}

/// Publishes sensor events to one event hub.
pub struct EventHubPublisher {
    client: reqwest::Client,
    hub: String,
    messages_url: String,
    resource_uri: String,
    auth: EventHubAuth,
    max_batch_events: usize,
}

impl EventHubPublisher {
    /// Creates a publisher for `hub` in the namespace at `endpoint`.
    ///
    /// `endpoint` is anything [`namespace_endpoint`] accepts.
    pub fn new(endpoint: &str, hub: &str, auth: EventHubAuth) -> Result<Self, AzureError> {
        let endpoint = namespace_endpoint(endpoint)?;
        let hub = hub.trim_matches('/');
        if hub.is_empty() {
            return Err(AzureError::InvalidEndpoint(format!("{endpoint}/<empty hub>")));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            client,
            hub: hub.to_owned(),
            messages_url: format!(
                "{endpoint}/{hub}/messages?timeout=60&api-version={API_VERSION}"
            ),
            resource_uri: format!("{endpoint}/{hub}"),
            auth,
            max_batch_events: DEFAULT_MAX_BATCH_EVENTS,
        })
    }

    /// Caps the number of events sent per HTTP request (minimum 1).
    #[must_use]
    pub fn with_max_batch_events(mut self, max: usize) -> Self {
        self.max_batch_events = max.max(1);
        self
    }

    async fn authorization(&self) -> Result<String, PublishError> {
        match &self.auth {
            EventHubAuth::Token(credential) => credential
                .get_token(EVENT_HUBS_SCOPE)
                .await
                .map(|token| token.bearer())
                .map_err(|e| PublishError::Unauthorized {
                    message: e.to_string(),
                }),
            EventHubAuth::SharedAccessKey { key_name, key } => {
                let expiry = Utc::now().timestamp() + SAS_VALIDITY_SECS;
                shared_access_signature(&self.resource_uri, key_name, key, expiry).map_err(|e| {
                    PublishError::Unauthorized {
                        message: e.to_string(),
                    }
                })
            }
        }
    }

    #[instrument(skip_all, fields(hub = %self.hub, events = chunk.len()))]
    async fn send_chunk(&self, chunk: &[SensorEvent]) -> Result<(), PublishError> {
        let body = encode_batch(chunk)?;
        let authorization = self.authorization().await?;

        let response = self
            .client
            .post(&self.messages_url)
            .header(AUTHORIZATION, authorization)
            .header(CONTENT_TYPE, BATCH_CONTENT_TYPE)
            .body(body)
            .send()
            .await
            .map_err(|e| PublishError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            debug!(status = status.as_u16(), "Batch accepted");
            return Ok(());
        }

        let headers = response.headers().clone();
        let body = response.text().await.unwrap_or_default();
        let error = classify_status(status, &headers, &body);
        warn!(status = status.as_u16(), error = %error, "Batch send failed");
        Err(error)
    }
}

#[async_trait]
impl EventPublisher for EventHubPublisher {
    fn name(&self) -> &str {
        &self.hub
    }

    async fn publish(&self, events: &[SensorEvent]) -> Result<(), PublishError> {
        for chunk in events.chunks(self.max_batch_events) {
            self.send_chunk(chunk).await?;
        }
        Ok(())
    }
}
