//! HTTP surface.
//!
//! `POST /execute?timeout=<secs>` takes the raw snippet as the request body and
//! answers with the report text. `GET /health` reports interpreter
//! availability for container probes.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::supervisor::Supervisor;

/// Server configuration
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Listen address
    pub addr: SocketAddr,
    /// Largest accepted snippet body in bytes
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_body_bytes: 2 * 1024 * 1024, // 2 MiB
        }
    }
}

/// Query parameters of `POST /execute`
#[derive(Debug, Default, Deserialize)]
pub struct ExecuteParams {
    /// Timeout in whole seconds; the supervisor default applies when absent
    pub timeout: Option<u64>,
}

/// Body of `GET /health`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Health {
    /// Always `"ok"` while the service answers
    pub status: String,
    /// Snippet language
    pub runtime: String,
    /// Whether the interpreter can be started
    pub available: bool,
    /// Interpreter version, when known
    pub version: Option<String>,
}

/// Build the router
pub fn router(supervisor: Arc<Supervisor>, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/execute", post(execute))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(supervisor)
}

/// Bind and serve until `shutdown` resolves.
///
/// # Errors
/// Returns error if the address cannot be bound or the server fails
pub async fn serve<F>(
    config: &ServerConfig,
    supervisor: Arc<Supervisor>,
    shutdown: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = router(Arc::clone(&supervisor), config.max_body_bytes);
    let listener = tokio::net::TcpListener::bind(config.addr).await?;
    info!(addr = %listener.local_addr()?, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    supervisor.close();
    info!("server stopped");
    Ok(())
}

async fn execute(
    State(supervisor): State<Arc<Supervisor>>,
    Query(params): Query<ExecuteParams>,
    code: String,
) -> Response {
    let request = supervisor.request(code, params.timeout);
    match supervisor.run(&request).await {
        Ok(report) => (
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            report.body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "execution failed");
            (StatusCode::INTERNAL_SERVER_ERROR, format!("Execution error: {e}")).into_response()
        }
    }
}

async fn health(State(supervisor): State<Arc<Supervisor>>) -> Json<Health> {
    let runtime = supervisor.runtime();
    let language = runtime.language_name().to_string();
    // Probing spawns the interpreter, keep it off the async workers
    let probe = tokio::task::spawn_blocking(move || (runtime.is_available(), runtime.version()));
    let (available, version) = probe.await.unwrap_or((false, None));

    Json(Health {
        status: "ok".to_string(),
        runtime: language,
        available,
        version,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::SnippetRuntime;
    use crate::supervisor::SupervisorConfig;
    use crate::trace::TracePolicy;
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request};
    use tower::ServiceExt;

    struct ShellRuntime;

    impl SnippetRuntime for ShellRuntime {
        fn command(&self, _policy: &TracePolicy) -> std::process::Command {
            std::process::Command::new("sh")
        }

        fn is_available(&self) -> bool {
            true
        }

        fn version(&self) -> Option<String> {
            Some("sh".to_string())
        }

        fn language_name(&self) -> &'static str {
            "sh"
        }
    }

    fn app() -> Router {
        let supervisor = Supervisor::with_runtime(SupervisorConfig::default(), Arc::new(ShellRuntime));
        router(Arc::new(supervisor), 64)
    }

    fn post_execute(uri: &str, body: impl Into<Body>) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(header::CONTENT_TYPE, "text/plain")
            .body(body.into())
            .unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_returns_report() {
        let response = app()
            .oneshot(post_execute("/execute?timeout=5", "echo hi"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/plain; charset=utf-8"
        );
        assert_eq!(body_text(response).await, "hi\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_without_timeout_uses_default() {
        let response = app()
            .oneshot(post_execute("/execute", "echo default"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "default\n");
    }

    #[tokio::test]
    async fn test_zero_timeout() {
        let response = app()
            .oneshot(post_execute("/execute?timeout=0", "echo never"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "Execution timed out after 0s.");
    }

    #[tokio::test]
    async fn test_malformed_timeout_is_rejected() {
        for uri in ["/execute?timeout=abc", "/execute?timeout=-1", "/execute?timeout=1.5"] {
            let response = app().oneshot(post_execute(uri, "echo hi")).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{uri}");
        }
    }

    #[tokio::test]
    async fn test_non_utf8_body_is_rejected() {
        let response = app()
            .oneshot(post_execute("/execute", vec![0xff_u8, 0xfe]))
            .await
            .unwrap();

        assert!(response.status().is_client_error());
    }

    #[tokio::test]
    async fn test_oversized_body_is_rejected() {
        let response = app()
            .oneshot(post_execute("/execute", "x".repeat(1024)))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_wrong_method() {
        let request = Request::builder()
            .uri("/execute")
            .body(Body::empty())
            .unwrap();
        let response = app().oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_supervisor_error_is_500() {
        let supervisor = Arc::new(Supervisor::with_runtime(
            SupervisorConfig::default(),
            Arc::new(ShellRuntime),
        ));
        supervisor.close();
        let app = router(supervisor, 64);

        let response = app
            .oneshot(post_execute("/execute?timeout=5", "echo hi"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body_text(response).await.contains("shut down"));
    }

    #[tokio::test]
    async fn test_health() {
        let request = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let response = app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let health: Health = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(
            health,
            Health {
                status: "ok".to_string(),
                runtime: "sh".to_string(),
                available: true,
                version: Some("sh".to_string()),
            }
        );
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.addr.port(), 8080);
        assert!(config.addr.ip().is_unspecified());
        assert_eq!(config.max_body_bytes, 2 * 1024 * 1024);
    }
}
