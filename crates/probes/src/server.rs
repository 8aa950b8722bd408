//! Listener binding and graceful serving.

use std::net::SocketAddr;

use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::ProbeError;

/// Binds a listener on `addr`.
pub async fn bind(addr: SocketAddr) -> Result<TcpListener, ProbeError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| ProbeError::Bind { addr, source })
}

/// Serves `app` on `listener` until `cancel` fires, then drains connections.
pub async fn serve(
    name: &'static str,
    listener: TcpListener,
    app: Router,
    cancel: CancellationToken,
) -> Result<(), ProbeError> {
    let addr = listener.local_addr()?;
    info!(server = name, address = %addr, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;

    info!(server = name, "Stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::health::health_router;
    use simulator::HealthState;

    #[tokio::test]
    async fn serves_until_cancelled() {
        let listener = bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let app = health_router(Arc::new(HealthState::new()));
        let server = tokio::spawn(serve("health", listener, app, cancel.clone()));

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"));

        cancel.cancel();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn binding_a_used_port_fails() {
        let first = bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = first.local_addr().unwrap();
        assert!(matches!(bind(addr).await, Err(ProbeError::Bind { .. })));
    }
}
