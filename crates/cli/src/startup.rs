//! Start-up decisions: where the dataset comes from and how the publisher
//! authenticates.
//!
//! | Decision | Order |
//! |----------|-------|
//! | dataset | local file, then Blob storage (cached to the local path), then synthetic |
//! | publisher auth | Key Vault connection string (SAS), then managed identity |
//!
//! A connection string that cannot be used for the configured namespace and
//! hub is fatal; it would only produce `401` responses later.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context};
use secrecy::ExposeSecret;
use tracing::{info, warn};

use azure::{namespace_endpoint, BlobClient, EventHubAuth, EventHubConnectionString, TokenCredential};
use domain::SecretProvider;
use simulator::SensorDataset;

/// Shape of the fallback dataset used when no input file is available.
pub const SYNTHETIC_SENSORS: usize = 52;
pub const SYNTHETIC_ROWS: usize = 10_000;
const SYNTHETIC_SEED: u64 = 0x5EED;

/// A dataset blob to download when the local file is missing.
pub struct DatasetBlob<'a> {
    pub client: &'a BlobClient,
    pub container: &'a str,
    pub name: String,
}

/// Loads the dataset from `path`, else from `blob`, else generates a
/// synthetic one.
pub async fn load_dataset(
    path: &Path,
    blob: Option<DatasetBlob<'_>>,
) -> anyhow::Result<SensorDataset> {
    if tokio::fs::try_exists(path).await.unwrap_or(false) {
        let dataset = SensorDataset::load(path)
            .with_context(|| format!("failed to load dataset {}", path.display()))?;
        info!(
            path = %path.display(),
            rows = dataset.len(),
            sensors = dataset.sensors().len(),
            "Loaded dataset"
        );
        return Ok(dataset);
    }

    if let Some(DatasetBlob {
        client,
        container,
        name,
    }) = blob
    {
        let bytes = client
            .download(container, &name)
            .await
            .with_context(|| format!("failed to download {container}/{name}"))?;
        let dataset = SensorDataset::from_bytes(&bytes)
            .with_context(|| format!("failed to parse {container}/{name}"))?;
        info!(
            container = %container,
            blob = %name,
            rows = dataset.len(),
            "Loaded dataset from storage"
        );
        cache_dataset(path, &bytes).await;
        return Ok(dataset);
    }

    warn!(
        path = %path.display(),
        "Dataset not found and no storage configured, using synthetic data"
    );
    Ok(SensorDataset::synthetic(
        SYNTHETIC_SENSORS,
        SYNTHETIC_ROWS,
        SYNTHETIC_SEED,
    ))
}

async fn cache_dataset(path: &Path, bytes: &[u8]) {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            warn!(path = %parent.display(), error = %e, "Could not create dataset directory");
            return;
        }
    }
    if let Err(e) = tokio::fs::write(path, bytes).await {
        warn!(path = %path.display(), error = %e, "Could not cache downloaded dataset");
    }
}

/// Chooses how the Event Hubs publisher authenticates.
///
/// With a secret provider, the connection string stored under `secret_name`
/// selects SAS auth; a missing secret falls back to `credential`.
pub async fn publisher_auth(
    secrets: Option<&dyn SecretProvider>,
    secret_name: &str,
    namespace: &str,
    hub: &str,
    credential: Arc<dyn TokenCredential>,
) -> anyhow::Result<EventHubAuth> {
    let Some(secrets) = secrets else {
        info!("Authenticating with managed identity");
        return Ok(EventHubAuth::Token(credential));
    };

    let secret = secrets
        .get_secret(secret_name)
        .await
        .with_context(|| format!("failed to read secret '{secret_name}' from Key Vault"))?;
    let Some(secret) = secret else {
        warn!(
            secret = %secret_name,
            "Connection string secret not found, using managed identity"
        );
        return Ok(EventHubAuth::Token(credential));
    };

    let conn = EventHubConnectionString::parse(secret.expose_secret())
        .context("Key Vault secret is not an Event Hubs connection string")?;

    let expected = namespace_endpoint(namespace)?;
    if !conn.endpoint.eq_ignore_ascii_case(&expected) {
        bail!(
            "connection string endpoint {} does not match EVENTHUB_NAMESPACE ({expected})",
            conn.endpoint
        );
    }
    if let Some(entity) = &conn.entity_path {
        if entity != hub {
            bail!("connection string is scoped to event hub '{entity}', not EVENTHUB_NAME '{hub}'");
        }
    }

    info!(key_name = %conn.key_name, "Authenticating with shared access key");
    Ok(EventHubAuth::from(conn))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    use axum::extract::Path as UrlPath;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::Router;

    use azure::{KeyVaultClient, StaticTokenCredential};

    const CSV: &str = "timestamp,sensor_00,sensor_01\n2018-04-01 00:00:00,1.5,2.5\n";
    const CONNECTION: &str = "Endpoint=sb://sensors.servicebus.windows.net/;SharedAccessKeyName=send;SharedAccessKey=c2VjcmV0;EntityPath=readings";

    async fn spawn(app: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn credential() -> Arc<dyn TokenCredential> {
        Arc::new(StaticTokenCredential::new("test-token"))
    }

    // ---------------------------------------------------------------------
    // Dataset source
    // ---------------------------------------------------------------------

    async fn blob_mock() -> BlobClient {
        async fn blob(UrlPath((container, name)): UrlPath<(String, String)>) -> (StatusCode, String) {
            if container == "datasets" && name == "sensor.csv" {
                (StatusCode::OK, CSV.to_owned())
            } else {
                (StatusCode::NOT_FOUND, String::new())
            }
        }
        let addr = spawn(Router::new().route("/{container}/{name}", get(blob))).await;
        BlobClient::new(&format!("http://{addr}"), credential()).unwrap()
    }

    #[tokio::test]
    async fn local_file_is_preferred_over_storage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sensor.csv");
        std::fs::write(&path, "a,b\n1,2\n3,4\n").unwrap();
        let client = blob_mock().await;

        let blob = DatasetBlob {
            client: &client,
            container: "datasets",
            name: "sensor.csv".to_owned(),
        };
        let dataset = load_dataset(&path, Some(blob)).await.unwrap();

        assert_eq!(dataset.sensors(), ["a", "b"]);
        assert_eq!(dataset.len(), 2);
    }

    #[tokio::test]
    async fn missing_file_is_downloaded_and_cached() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("sensor.csv");
        let client = blob_mock().await;

        let blob = DatasetBlob {
            client: &client,
            container: "datasets",
            name: "sensor.csv".to_owned(),
        };
        let dataset = load_dataset(&path, Some(blob)).await.unwrap();

        assert_eq!(dataset.sensors(), ["sensor_00", "sensor_01"]);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), CSV);
    }

    #[tokio::test]
    async fn missing_blob_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let client = blob_mock().await;

        let blob = DatasetBlob {
            client: &client,
            container: "datasets",
            name: "other.csv".to_owned(),
        };
        let result = load_dataset(&dir.path().join("other.csv"), Some(blob)).await;

        assert!(result.is_err());
        assert!(!dir.path().join("other.csv").exists());
    }

    #[tokio::test]
    async fn synthetic_data_is_used_without_file_or_storage() {
        let dir = tempfile::tempdir().unwrap();

        let dataset = load_dataset(&dir.path().join("sensor.csv"), None).await.unwrap();

        assert_eq!(dataset.sensors().len(), SYNTHETIC_SENSORS);
        assert_eq!(dataset.len(), SYNTHETIC_ROWS);
    }

    // ---------------------------------------------------------------------
    // Publisher authentication
    // ---------------------------------------------------------------------

    async fn vault_mock() -> KeyVaultClient {
        async fn secret(UrlPath(name): UrlPath<String>) -> (StatusCode, String) {
            let value = match name.as_str() {
                "eventhub-connection-string" => CONNECTION,
                "garbage" => "not a connection string",
                "other-hub" => "Endpoint=sb://sensors.servicebus.windows.net/;SharedAccessKeyName=send;SharedAccessKey=c2VjcmV0;EntityPath=alerts",
                "other-namespace" => "Endpoint=sb://elsewhere.servicebus.windows.net/;SharedAccessKeyName=send;SharedAccessKey=c2VjcmV0",
                _ => return (StatusCode::NOT_FOUND, String::new()),
            };
            (StatusCode::OK, format!(r#"{{"value":"{value}"}}"#))
        }
        let addr = spawn(Router::new().route("/secrets/{name}", get(secret))).await;
        KeyVaultClient::new(&format!("http://{addr}"), credential()).unwrap()
    }

    async fn auth_from(vault: &KeyVaultClient, secret: &str) -> anyhow::Result<EventHubAuth> {
        let vault: &dyn SecretProvider = vault;
        publisher_auth(Some(vault), secret, "sensors", "readings", credential()).await
    }

    #[tokio::test]
    async fn connection_string_secret_selects_shared_access_key() {
        let vault = vault_mock().await;

        let auth = auth_from(&vault, "eventhub-connection-string").await.unwrap();

        match auth {
            EventHubAuth::SharedAccessKey { key_name, key } => {
                assert_eq!(key_name, "send");
                assert_eq!(key.expose_secret(), "c2VjcmV0");
            }
            EventHubAuth::Token(_) => panic!("expected shared access key auth"),
        }
    }

    #[tokio::test]
    async fn missing_secret_falls_back_to_managed_identity() {
        let vault = vault_mock().await;

        let auth = auth_from(&vault, "not-there").await.unwrap();

        assert!(matches!(auth, EventHubAuth::Token(_)));
    }

    #[tokio::test]
    async fn no_vault_uses_managed_identity() {
        let auth = publisher_auth(
            None,
            "eventhub-connection-string",
            "sensors",
            "readings",
            credential(),
        )
        .await
        .unwrap();

        assert!(matches!(auth, EventHubAuth::Token(_)));
    }

    #[tokio::test]
    async fn unusable_connection_strings_are_fatal() {
        let vault = vault_mock().await;

        let err = auth_from(&vault, "garbage").await.err().unwrap();
        assert!(format!("{err:#}").contains("not an Event Hubs connection string"));

        let err = auth_from(&vault, "other-hub").await.err().unwrap();
        assert!(err.to_string().contains("'alerts'"));

        let err = auth_from(&vault, "other-namespace").await.err().unwrap();
        assert!(err.to_string().contains("elsewhere"));
    }
}
