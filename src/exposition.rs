//! HTTP endpoint serving the registry in the Prometheus text format.

use crate::error::BridgeError;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use log::{error, info};
use prometheus::{Encoder, Registry, TextEncoder};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Encodes everything gathered from `registry`.
pub fn render(registry: &Registry) -> Result<String, BridgeError> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&registry.gather(), &mut buffer)?;
    String::from_utf8(buffer)
        .map_err(|e| BridgeError::Transport(format!("metrics are not UTF-8: {e}")))
}

async fn metrics(State(registry): State<Arc<Registry>>) -> Response {
    match render(&registry) {
        Ok(body) => (
            [(header::CONTENT_TYPE, TextEncoder::new().format_type().to_string())],
            body,
        )
            .into_response(),
        Err(e) => {
            error!("Encoding metrics failed: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// Router with `GET /metrics`.
pub fn router(registry: Arc<Registry>) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .with_state(registry)
}

/// Serves `/metrics` on `listener` until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    registry: Arc<Registry>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), BridgeError> {
    if let Ok(addr) = listener.local_addr() {
        info!("Serving metrics on http://{addr}/metrics");
    }
    axum::serve(listener, router(registry))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Binds `addr` and serves `/metrics` until `shutdown` resolves.
pub async fn bind_and_serve(
    addr: SocketAddr,
    registry: Arc<Registry>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), BridgeError> {
    let listener = TcpListener::bind(addr).await?;
    serve(listener, registry, shutdown).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::IntGauge;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::sync::oneshot;

    fn registry() -> Arc<Registry> {
        let registry = Registry::new();
        let gauge = IntGauge::new("knx_test_value", "test value").unwrap();
        gauge.set(42);
        registry.register(Box::new(gauge)).unwrap();
        Arc::new(registry)
    }

    #[test]
    fn test_render() {
        let text = render(&registry()).unwrap();
        assert!(text.contains("# TYPE knx_test_value gauge"));
        assert!(text.contains("knx_test_value 42"));
    }

    #[tokio::test]
    async fn test_serve_metrics_over_http() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(serve(listener, registry(), async move {
            let _ = stop_rx.await;
        }));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("knx_test_value 42"));

        stop_tx.send(()).unwrap();
        server.await.unwrap().unwrap();
    }
}
