//! Endpoint server for exposing metrics and health checks

use anyhow::Result;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::chain::ConnectorRegistry;
use crate::metrics::metrics;

fn response(status: &str, content_type: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        content_type,
        body.len(),
        body
    )
}

async fn route(request_line: &str, registry: &ConnectorRegistry) -> String {
    let path = request_line.split_whitespace().nth(1).unwrap_or("/");
    match path {
        "/metrics" => match metrics().render() {
            Ok(body) => response("200 OK", "text/plain; version=0.0.4", &body),
            Err(e) => response("500 Internal Server Error", "text/plain", &e.to_string()),
        },
        "/health" => {
            let chains: Vec<serde_json::Value> = registry
                .connected_instances()
                .await
                .iter()
                .map(|c| {
                    serde_json::json!({
                        "chain": c.descriptor().ledger_id(),
                        "chain_id": c.descriptor().chain_id,
                        "state": format!("{:?}", c.state()),
                    })
                })
                .collect();
            let body = serde_json::json!({ "status": "ok", "chains": chains }).to_string();
            response("200 OK", "application/json", &body)
        }
        _ => response("404 Not Found", "text/plain", "not found"),
    }
}

/// Serve `/metrics` and `/health` until `shutdown` flips to true
pub async fn endpoint_server(
    port: u16,
    registry: Arc<ConnectorRegistry>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;

    tracing::info!("Metrics endpoint listening on {}", addr);

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((mut socket, _)) => {
                    let registry = registry.clone();
                    tokio::spawn(async move {
                        let mut buf = [0; 1024];
                        match socket.read(&mut buf).await {
                            Ok(n) => {
                                let request = String::from_utf8_lossy(&buf[..n]);
                                let first_line = request.lines().next().unwrap_or_default();
                                let reply = route(first_line, &registry).await;
                                let _ = socket.write_all(reply.as_bytes()).await;
                            }
                            Err(e) => {
                                tracing::error!("Failed to read from socket: {}", e);
                            }
                        }
                    });
                }
                Err(e) => {
                    tracing::error!("Failed to accept connection: {}", e);
                }
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ConnectorSettings;
    use crate::nonce_manager::ReconcilerConfig;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_routes() {
        let dir = TempDir::new().unwrap();
        let registry = ConnectorRegistry::new(
            ConnectorSettings {
                nonce_db_path: dir.path().join("nonce.db"),
                transaction_db_path: dir.path().join("tx.db"),
                reconciler: ReconcilerConfig::default(),
            },
            true,
        );

        let metrics_reply = route("GET /metrics HTTP/1.1", &registry).await;
        assert!(metrics_reply.starts_with("HTTP/1.1 200 OK"));
        assert!(metrics_reply.contains("nonce_allocations_total"));

        let health = route("GET /health HTTP/1.1", &registry).await;
        assert!(health.contains("\"status\":\"ok\""));

        let missing = route("GET /nope HTTP/1.1", &registry).await;
        assert!(missing.starts_with("HTTP/1.1 404"));
    }
}
