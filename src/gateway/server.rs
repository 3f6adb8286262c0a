//! HTTP server and route handlers for the REST API.

use axum::{
    Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    routing::{get, post},
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::LatencyUnit;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

use super::ApiError;
use crate::models::{LogEntry, Message, MessagePair, Meta, NewNode, Node, NodeExport, Position};
use crate::service::NodeService;

/// Default bind host for the API.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default port for the API.
pub const DEFAULT_PORT: u16 = 8090;

type ApiResult<T> = Result<T, ApiError>;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<NodeService>,
}

#[derive(Debug, Deserialize)]
struct CreateNodeRequest {
    title: String,
    #[serde(default)]
    parent_hash: Option<String>,
    #[serde(default)]
    position: Option<Position>,
    #[serde(default)]
    cluster_hash: Option<String>,
    #[serde(default)]
    meta: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct AddMessageRequest {
    body: String,
}

#[derive(Debug, Deserialize)]
struct AddLogRequest {
    level: String,
    text: String,
    #[serde(default)]
    payload: Option<Value>,
}

/// Build the API router over a service.
pub fn router(service: Arc<NodeService>) -> Router {
    let state = AppState { service };

    Router::new()
        .route("/api/health", get(health))
        .route("/api/nodes", get(list_nodes).post(create_node))
        .route("/api/nodes/:hash", get(get_node))
        .route(
            "/api/nodes/:hash/messages",
            get(list_messages).post(add_message),
        )
        .route("/api/nodes/:hash/reset", post(reset_node))
        .route("/api/nodes/:hash/export", get(export_node))
        .route("/api/nodes/:hash/logs", get(list_logs).post(add_log))
        // One INFO line per request: method and path on the span, status and
        // latency on the response event.
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(
                    DefaultOnResponse::new()
                        .level(Level::INFO)
                        .latency_unit(LatencyUnit::Millis),
                ),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the API server and block until Ctrl+C or SIGTERM.
pub async fn start_server(
    service: Arc<NodeService>,
    host: &str,
    port: u16,
) -> Result<(), Box<dyn std::error::Error>> {
    let host_addr: std::net::IpAddr = host
        .parse()
        .map_err(|e| format!("Invalid host address '{}': {}", host, e))?;
    let addr = SocketAddr::from((host_addr, port));

    let inference = service.inference_kind();
    let app = router(service);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, inference, "thinknode API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("thinknode API stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown requested");
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "thinknode",
        "version": env!("CARGO_PKG_VERSION"),
        "commit": env!("TN_GIT_COMMIT"),
        "built": env!("TN_BUILD_TIMESTAMP"),
        "inference": state.service.inference_kind(),
        "time": Utc::now(),
    }))
}

async fn list_nodes(State(state): State<AppState>) -> ApiResult<Json<Vec<Node>>> {
    Ok(Json(state.service.list_nodes().await?))
}

async fn create_node(
    State(state): State<AppState>,
    payload: Result<Json<CreateNodeRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Node>)> {
    let Json(request) = payload?;

    let meta: Option<Meta> = match request.meta {
        None | Some(Value::Null) => None,
        Some(Value::Object(map)) => Some(map),
        Some(_) => return Err(ApiError::bad_request("meta must be a JSON object")),
    };

    let node = state
        .service
        .create_node(NewNode {
            title: request.title,
            parent_hash: request.parent_hash,
            position: request.position,
            cluster_hash: request.cluster_hash,
            meta,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(node)))
}

async fn get_node(State(state): State<AppState>, Path(hash): Path<String>) -> ApiResult<Json<Node>> {
    Ok(Json(state.service.get_node(&hash).await?))
}

async fn list_messages(
    State(state): State<AppState>,
    Path(hash): Path<String>,
) -> ApiResult<Json<Vec<Message>>> {
    Ok(Json(state.service.list_messages(&hash).await?))
}

async fn add_message(
    State(state): State<AppState>,
    Path(hash): Path<String>,
    payload: Result<Json<AddMessageRequest>, JsonRejection>,
) -> ApiResult<Json<MessagePair>> {
    let Json(request) = payload?;
    Ok(Json(state.service.add_message(&hash, &request.body).await?))
}

async fn reset_node(State(state): State<AppState>, Path(hash): Path<String>) -> ApiResult<Json<Value>> {
    let cleared = state.service.reset(&hash).await?;
    Ok(Json(json!({
        "status": "ok",
        "hash": hash,
        "cleared": cleared,
    })))
}

async fn export_node(
    State(state): State<AppState>,
    Path(hash): Path<String>,
) -> ApiResult<Json<NodeExport>> {
    Ok(Json(state.service.export(&hash).await?))
}

async fn list_logs(
    State(state): State<AppState>,
    Path(hash): Path<String>,
) -> ApiResult<Json<Vec<LogEntry>>> {
    Ok(Json(state.service.list_logs(&hash).await?))
}

async fn add_log(
    State(state): State<AppState>,
    Path(hash): Path<String>,
    payload: Result<Json<AddLogRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<LogEntry>)> {
    let Json(request) = payload?;
    let entry = state
        .service
        .add_log(&hash, &request.level, &request.text, request.payload)
        .await?;
    Ok((StatusCode::CREATED, Json(entry)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::{InferenceAdapter, InferenceSettings};
    use crate::test_utils::TestEnv;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, header};
    use std::time::Duration;
    use tower::ServiceExt;

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(json) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    async fn create(app: &Router, body: Value) -> Value {
        let (status, node) = send(app, "POST", "/api/nodes", Some(body)).await;
        assert_eq!(status, StatusCode::CREATED);
        node
    }

    #[tokio::test]
    async fn test_health() {
        let env = TestEnv::new();
        let app = router(env.mock_service());

        let (status, body) = send(&app, "GET", "/api/health", None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["inference"], "mock");
    }

    /// Log sink shared between a test subscriber and the assertions.
    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_requests_are_logged_at_info() {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(Level::INFO)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        let _default = tracing::subscriber::set_default(subscriber);

        let env = TestEnv::new();
        let app = router(env.mock_service());
        let (status, _) = send(&app, "GET", "/api/health", None).await;
        assert_eq!(status, StatusCode::OK);

        let output = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("finished processing request"), "{}", output);
        assert!(output.contains("uri=/api/health"), "{}", output);
        assert!(output.contains("status=200"), "{}", output);
        assert!(output.contains(" ms"), "{}", output);
    }

    #[tokio::test]
    async fn test_create_and_fetch_node() {
        let env = TestEnv::new();
        let app = router(env.mock_service());

        let node = create(
            &app,
            json!({
                "title": "root",
                "position": {"x": 1.0, "y": 2.0},
                "meta": {"color": "red"}
            }),
        )
        .await;
        let hash = node["hash"].as_str().unwrap();

        assert_eq!(node["position"], json!({"x": 1.0, "y": 2.0, "z": 0.0}));
        assert_eq!(node["parent_hash"], Value::Null);

        let (status, fetched) = send(&app, "GET", &format!("/api/nodes/{}", hash), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched, node);

        let (_, all) = send(&app, "GET", "/api/nodes", None).await;
        assert_eq!(all.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_create_node_validation() {
        let env = TestEnv::new();
        let app = router(env.mock_service());

        let (status, body) = send(&app, "POST", "/api/nodes", Some(json!({"title": ""}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());

        let (status, _) = send(&app, "POST", "/api/nodes", Some(json!({"parent_hash": "x"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(
            &app,
            "POST",
            "/api/nodes",
            Some(json!({"title": "t", "meta": [1]})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(
            &app,
            "POST",
            "/api/nodes",
            Some(json!({"title": "orphan", "parent_hash": "nope"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, all) = send(&app, "GET", "/api/nodes", None).await;
        assert!(all.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_node_routes_return_404() {
        let env = TestEnv::new();
        let app = router(env.mock_service());

        for (method, uri) in [
            ("GET", "/api/nodes/missing"),
            ("GET", "/api/nodes/missing/messages"),
            ("POST", "/api/nodes/missing/reset"),
            ("GET", "/api/nodes/missing/export"),
            ("GET", "/api/nodes/missing/logs"),
        ] {
            let (status, body) = send(&app, method, uri, None).await;
            assert_eq!(status, StatusCode::NOT_FOUND, "{} {}", method, uri);
            assert!(body["error"].as_str().unwrap().contains("missing"));
        }
    }

    #[tokio::test]
    async fn test_message_then_reset_scenario() {
        let env = TestEnv::new();
        let app = router(env.mock_service());
        let node = create(&app, json!({"title": "root"})).await;
        let base = format!("/api/nodes/{}", node["hash"].as_str().unwrap());

        let (status, pair) = send(
            &app,
            "POST",
            &format!("{}/messages", base),
            Some(json!({"body": "hello"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(pair["user_message"]["role"], "user");
        assert_eq!(pair["assistant_message"]["role"], "assistant");

        let (_, messages) = send(&app, "GET", &format!("{}/messages", base), None).await;
        assert_eq!(messages.as_array().unwrap().len(), 2);

        let (status, reset) = send(&app, "POST", &format!("{}/reset", base), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(reset["status"], "ok");
        assert_eq!(reset["cleared"], 2);

        let (_, messages) = send(&app, "GET", &format!("{}/messages", base), None).await;
        assert_eq!(messages, json!([]));
    }

    #[tokio::test]
    async fn test_empty_message_body_is_rejected() {
        let env = TestEnv::new();
        let app = router(env.mock_service());
        let node = create(&app, json!({"title": "root"})).await;
        let uri = format!("/api/nodes/{}/messages", node["hash"].as_str().unwrap());

        let (status, _) = send(&app, "POST", &uri, Some(json!({"body": ""}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&app, "POST", &uri, Some(json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_export_snapshot() {
        let env = TestEnv::new();
        let app = router(env.mock_service());
        let node = create(&app, json!({"title": "root"})).await;
        let base = format!("/api/nodes/{}", node["hash"].as_str().unwrap());
        send(&app, "POST", &format!("{}/messages", base), Some(json!({"body": "hi"}))).await;

        let (status, first) = send(&app, "GET", &format!("{}/export", base), None).await;
        let (_, second) = send(&app, "GET", &format!("{}/export", base), None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(first, second);
        assert_eq!(first["messages"].as_array().unwrap().len(), 2);
        assert_eq!(first["node"]["hash"], node["hash"]);
    }

    #[tokio::test]
    async fn test_bogus_log_level_is_rejected() {
        let env = TestEnv::new();
        let app = router(env.mock_service());
        let node = create(&app, json!({"title": "root"})).await;
        let uri = format!("/api/nodes/{}/logs", node["hash"].as_str().unwrap());

        let (status, _) = send(
            &app,
            "POST",
            &uri,
            Some(json!({"level": "bogus", "text": "x"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, logs) = send(&app, "GET", &uri, None).await;
        assert_eq!(logs, json!([]));

        let (status, entry) = send(
            &app,
            "POST",
            &uri,
            Some(json!({"level": "info", "text": "started", "payload": {"step": 1}})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(entry["level"], "info");
        assert_eq!(entry["payload"]["step"], 1);
    }

    #[tokio::test]
    async fn test_unreachable_backend_still_replies() {
        let env = TestEnv::new();
        let settings = InferenceSettings {
            backend_url: Some("http://127.0.0.1:1".to_string()),
            timeout: Duration::from_secs(2),
            ..InferenceSettings::default()
        };
        let app = router(env.service(InferenceAdapter::from_settings(&settings).unwrap()));
        let node = create(&app, json!({"title": "offline"})).await;
        let base = format!("/api/nodes/{}", node["hash"].as_str().unwrap());

        let (status, pair) = send(
            &app,
            "POST",
            &format!("{}/messages", base),
            Some(json!({"body": "hello"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(
            pair["assistant_message"]["body"]
                .as_str()
                .unwrap()
                .starts_with("[offline]")
        );

        let (_, logs) = send(&app, "GET", &format!("{}/logs", base), None).await;
        let logs = logs.as_array().unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0]["level"], "error");
    }
}
