// HTTP status server
//
// Listens on 127.0.0.1:<port> when enabled:
// - /health    service status, auth status and CLI version
// - /api/info  server name, version and tools
// - /metrics   Prometheus scrape endpoint

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::auth::AuthSessionManager;
use crate::mcp::McpServer;
use crate::metrics;
use crate::tools::CommandRunner;

const VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
struct StatusState {
    auth: AuthSessionManager,
    runner: Arc<dyn CommandRunner>,
    started: Instant,
}

/// Build the status router
pub fn router(auth: AuthSessionManager, runner: Arc<dyn CommandRunner>) -> Router {
    let state = StatusState {
        auth,
        runner,
        started: Instant::now(),
    };
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/info", get(info_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the status HTTP server
///
/// Binds to loopback only; the endpoints expose account details. Metrics
/// must already be registered with [`metrics::init`].
pub async fn start_status_server(
    port: u16,
    auth: AuthSessionManager,
    runner: Arc<dyn CommandRunner>,
) -> Result<()> {
    let app = router(auth, runner);
    let addr = SocketAddr::from(([127, 0, 0, 1], port));

    info!("Starting status server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind status server")?;

    axum::serve(listener, app)
        .await
        .context("Status server error")?;

    Ok(())
}

/// Health endpoint: always 200 while the process is serving
///
/// `cli.available` is false when `--version` fails, which usually means
/// the binary is missing from PATH.
async fn health_handler(State(state): State<StatusState>) -> impl IntoResponse {
    let args = vec!["--version".to_string()];
    let probe = state.runner.run(&args, VERSION_PROBE_TIMEOUT).await;
    let cli = if probe.is_success() {
        json!({
            "available": true,
            "version": probe.stdout().lines().next().unwrap_or_default().trim(),
        })
    } else {
        json!({ "available": false, "error": probe.summary() })
    };

    Json(json!({
        "status": "ok",
        "auth": state.auth.session(),
        "cli": cli,
        "uptime_seconds": state.started.elapsed().as_secs(),
    }))
}

async fn info_handler() -> impl IntoResponse {
    let tools: Vec<String> = McpServer::tools().into_iter().map(|t| t.name).collect();
    Json(json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "tools": tools,
    }))
}

/// Metrics endpoint handler
async fn metrics_handler(State(state): State<StatusState>) -> Response {
    metrics::SERVER_UPTIME_SECONDS.set(state.started.elapsed().as_secs_f64());
    match metrics::gather_metrics() {
        Ok(metrics_text) => (StatusCode::OK, metrics_text).into_response(),
        Err(e) => {
            error!("Failed to gather metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Error gathering metrics: {}", e),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ProcessExecutor;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    fn router_for(binary: &str) -> Router {
        let runner: Arc<dyn CommandRunner> = Arc::new(ProcessExecutor::new(binary));
        router(
            AuthSessionManager::new(runner.clone(), Duration::from_secs(1)),
            runner,
        )
    }

    fn test_router() -> Router {
        router_for("definitely-not-a-real-binary-1234")
    }

    async fn get_json(app: Router, uri: &str) -> serde_json::Value {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_reports_auth_status() {
        let body = get_json(test_router(), "/health").await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["auth"]["status"], "unauthenticated");
        assert_eq!(body["cli"]["available"], false);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_health_reports_cli_version() {
        // echo prints its arguments back, standing in for `az --version`
        let body = get_json(router_for("echo"), "/health").await;
        assert_eq!(body["cli"]["available"], true);
        assert_eq!(body["cli"]["version"], "--version");
    }

    #[tokio::test]
    async fn test_info_lists_tools() {
        let body = get_json(test_router(), "/api/info").await;
        assert_eq!(body["name"], env!("CARGO_PKG_NAME"));
        assert_eq!(body["tools"][0], "execute_azure_cli_command");
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let response = test_router()
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
