//! Publisher and client behaviour against local mock Azure endpoints.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::Router;
use secrecy::{ExposeSecret, SecretString};

use azure::{
    BlobClient, EventHubAuth, EventHubPublisher, KeyVaultClient, ManagedIdentityCredential,
    StaticTokenCredential, TokenCredential,
};
use domain::{
    EventPublisher, MachineId, MachineStatus, PublishError, SecretError, SecretProvider,
    SensorEvent, Timestamp,
};

#[derive(Default)]
struct Recorded {
    requests: Mutex<Vec<(HeaderMap, String)>>,
    responses: Mutex<Vec<StatusCode>>,
}

async fn spawn(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn eventhub_mock(recorded: Arc<Recorded>) -> SocketAddr {
    async fn messages(
        State(recorded): State<Arc<Recorded>>,
        Path(_hub): Path<String>,
        headers: HeaderMap,
        body: String,
    ) -> StatusCode {
        recorded.requests.lock().unwrap().push((headers, body));
        recorded
            .responses
            .lock()
            .unwrap()
            .pop()
            .unwrap_or(StatusCode::CREATED)
    }
    spawn(
        Router::new()
            .route("/{hub}/messages", post(messages))
            .with_state(recorded),
    )
    .await
}

fn event(machine: u32, sequence: u64) -> SensorEvent {
    SensorEvent {
        event_id: uuid::Uuid::new_v4(),
        machine_id: MachineId::simulated(machine),
        sequence,
        timestamp: Timestamp::now(),
        source_timestamp: None,
        values: [("sensor_00", 2.5), ("sensor_01", 40.0)].into_iter().collect(),
        machine_status: MachineStatus::Normal,
        failure_id: None,
    }
}

fn token_auth() -> EventHubAuth {
    EventHubAuth::Token(Arc::new(StaticTokenCredential::new("test-token")))
}

#[tokio::test]
async fn publish_sends_partitioned_batch_with_bearer_token() {
    let recorded = Arc::new(Recorded::default());
    let addr = eventhub_mock(recorded.clone()).await;
    let publisher =
        EventHubPublisher::new(&format!("http://{addr}"), "readings", token_auth()).unwrap();

    publisher.publish(&[event(1, 0), event(2, 0)]).await.unwrap();

    let requests = recorded.requests.lock().unwrap();
    assert_eq!(requests.len(), 1);
    let (headers, body) = &requests[0];
    assert_eq!(headers["authorization"], "Bearer test-token");
    assert_eq!(
        headers["content-type"],
        "application/vnd.microsoft.servicebus.json"
    );

    let messages: serde_json::Value = serde_json::from_str(body).unwrap();
    let messages = messages.as_array().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["BrokerProperties"]["PartitionKey"], "machine-001");
    assert_eq!(messages[1]["UserProperties"]["machine_id"], "machine-002");

    let inner: SensorEvent =
        serde_json::from_str(messages[0]["Body"].as_str().unwrap()).unwrap();
    assert_eq!(inner.machine_id.as_str(), "machine-001");
    assert_eq!(inner.values.get("sensor_01"), Some(40.0));
}

#[tokio::test]
async fn large_batches_are_split_into_chunks() {
    let recorded = Arc::new(Recorded::default());
    let addr = eventhub_mock(recorded.clone()).await;
    let publisher = EventHubPublisher::new(&format!("http://{addr}"), "readings", token_auth())
        .unwrap()
        .with_max_batch_events(2);

    let events: Vec<_> = (0..5).map(|i| event(i, 0)).collect();
    publisher.publish(&events).await.unwrap();

    let requests = recorded.requests.lock().unwrap();
    assert_eq!(requests.len(), 3);
    let sizes: Vec<usize> = requests
        .iter()
        .map(|(_, body)| {
            serde_json::from_str::<serde_json::Value>(body)
                .unwrap()
                .as_array()
                .unwrap()
                .len()
        })
        .collect();
    assert_eq!(sizes, vec![2, 2, 1]);
}

#[tokio::test]
async fn shared_access_key_auth_sends_signature() {
    let recorded = Arc::new(Recorded::default());
    let addr = eventhub_mock(recorded.clone()).await;
    let auth = EventHubAuth::SharedAccessKey {
        key_name: "send".to_owned(),
        key: SecretString::from("c2VjcmV0".to_owned()),
    };
    let publisher = EventHubPublisher::new(&format!("http://{addr}"), "readings", auth).unwrap();

    publisher.publish(&[event(0, 0)]).await.unwrap();

    let requests = recorded.requests.lock().unwrap();
    let authorization = requests[0].0["authorization"].to_str().unwrap();
    assert!(authorization.starts_with("SharedAccessSignature sr="));
    assert!(authorization.ends_with("&skn=send"));
}

#[tokio::test]
async fn error_statuses_map_to_publish_errors() {
    let recorded = Arc::new(Recorded::default());
    // Responses are popped from the end.
    recorded.responses.lock().unwrap().extend([
        StatusCode::BAD_REQUEST,
        StatusCode::UNAUTHORIZED,
        StatusCode::TOO_MANY_REQUESTS,
        StatusCode::INTERNAL_SERVER_ERROR,
    ]);
    let addr = eventhub_mock(recorded.clone()).await;
    let publisher =
        EventHubPublisher::new(&format!("http://{addr}"), "readings", token_auth()).unwrap();
    let batch = [event(0, 0)];

    let err = publisher.publish(&batch).await.unwrap_err();
    assert!(matches!(err, PublishError::Unavailable { status: 500 }));
    assert!(err.retry_policy().is_retryable());

    let err = publisher.publish(&batch).await.unwrap_err();
    assert!(matches!(err, PublishError::Throttled { .. }));

    let err = publisher.publish(&batch).await.unwrap_err();
    assert!(matches!(err, PublishError::Unauthorized { .. }));
    assert!(!err.retry_policy().is_retryable());

    let err = publisher.publish(&batch).await.unwrap_err();
    assert!(matches!(err, PublishError::Rejected { status: 400, .. }));
}

#[tokio::test]
async fn unreachable_hub_is_a_transport_error() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let publisher =
        EventHubPublisher::new(&format!("http://{addr}"), "readings", token_auth()).unwrap();
    let err = publisher.publish(&[event(0, 0)]).await.unwrap_err();
    assert!(matches!(err, PublishError::Transport(_)));
    assert!(err.retry_policy().is_retryable());
}

// ---------------------------------------------------------------------------
// Key Vault
// ---------------------------------------------------------------------------

async fn keyvault_mock() -> SocketAddr {
    async fn secret(Path(name): Path<String>, headers: HeaderMap) -> (StatusCode, String) {
        if headers.get("authorization").and_then(|v| v.to_str().ok()) != Some("Bearer kv-token") {
            return (StatusCode::UNAUTHORIZED, String::new());
        }
        match name.as_str() {
            "eventhub-connection-string" => (
                StatusCode::OK,
                r#"{"value":"Endpoint=sb://ns/;SharedAccessKeyName=a;SharedAccessKey=b","id":"x"}"#
                    .to_owned(),
            ),
            "forbidden" => (StatusCode::FORBIDDEN, String::new()),
            _ => (StatusCode::NOT_FOUND, String::new()),
        }
    }
    spawn(Router::new().route("/secrets/{name}", get(secret))).await
}

#[tokio::test]
async fn key_vault_resolves_present_and_missing_secrets() {
    let addr = keyvault_mock().await;
    let client = KeyVaultClient::new(
        &format!("http://{addr}/"),
        Arc::new(StaticTokenCredential::new("kv-token")),
    )
    .unwrap();

    let secret = client
        .get_secret("eventhub-connection-string")
        .await
        .unwrap()
        .unwrap();
    assert!(secret.expose_secret().starts_with("Endpoint=sb://ns/"));

    assert!(client.get_secret("missing").await.unwrap().is_none());
    assert!(matches!(
        client.get_secret("forbidden").await,
        Err(SecretError::AccessDenied { .. })
    ));
    assert!(matches!(
        client.get_secret("bad/name").await,
        Err(SecretError::InvalidName(_))
    ));
}

// ---------------------------------------------------------------------------
// Managed identity and Blob
// ---------------------------------------------------------------------------

#[tokio::test]
async fn managed_identity_tokens_are_cached_per_scope() {
    let calls = Arc::new(AtomicUsize::new(0));

    async fn token(State(calls): State<Arc<AtomicUsize>>, headers: HeaderMap) -> (StatusCode, String) {
        if headers.get("metadata").and_then(|v| v.to_str().ok()) != Some("true") {
            return (StatusCode::BAD_REQUEST, String::new());
        }
        let n = calls.fetch_add(1, Ordering::SeqCst);
        let expires_on = chrono::Utc::now().timestamp() + 3600;
        (
            StatusCode::OK,
            format!(r#"{{"access_token":"token-{n}","expires_on":"{expires_on}"}}"#),
        )
    }
    let addr = spawn(
        Router::new()
            .route("/token", get(token))
            .with_state(calls.clone()),
    )
    .await;

    let credential =
        ManagedIdentityCredential::with_endpoint(format!("http://{addr}/token"), None).unwrap();
    let first = credential.get_token("https://eventhubs.azure.net/.default").await.unwrap();
    let again = credential.get_token("https://eventhubs.azure.net/.default").await.unwrap();
    let other = credential.get_token("https://vault.azure.net/.default").await.unwrap();

    assert_eq!(first.token.expose_secret(), "token-0");
    assert_eq!(again.token.expose_secret(), "token-0");
    assert_eq!(other.token.expose_secret(), "token-1");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn blob_download_returns_body_and_maps_missing_blobs() {
    async fn blob(Path((container, name)): Path<(String, String)>, headers: HeaderMap) -> (StatusCode, String) {
        if headers.get("x-ms-version").is_none() {
            return (StatusCode::BAD_REQUEST, String::new());
        }
        if container == "data" && name == "sensor.csv" {
            (StatusCode::OK, "timestamp,sensor_00\n".to_owned())
        } else {
            (StatusCode::NOT_FOUND, String::new())
        }
    }
    let addr = spawn(Router::new().route("/{container}/{name}", get(blob))).await;
    let client = BlobClient::new(
        &format!("http://{addr}"),
        Arc::new(StaticTokenCredential::new("t")),
    )
    .unwrap();

    let bytes = client.download("data", "sensor.csv").await.unwrap();
    assert_eq!(bytes, b"timestamp,sensor_00\n");

    let err = client.download("data", "missing.csv").await.unwrap_err();
    assert!(matches!(err, azure::AzureError::NotFound(_)));
}
