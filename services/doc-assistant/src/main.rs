//! Document Q&A and quiz service
//!
//! Single-binary Rust service that:
//! 1. Reads Gemini API keys from the environment into a rotating key pool
//! 2. Turns uploaded PDFs into a per-session retrieval index
//! 3. Answers follow-up questions and writes quizzes, rotating keys on quota

mod api;
mod assistant;
mod chunking;
mod config;
mod conversation;
mod documents;
mod error;
mod index;
mod metrics;
mod session;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::{DefaultBodyLimit, State};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use key_pool::{KeyPool, Resilient};
use metrics_exporter_prometheus::PrometheusHandle;
use provider::gemini::GeminiClient;

use crate::assistant::{Assistant, Settings};
use crate::config::Config;
use crate::session::SessionStore;

/// How long in-flight requests get to finish after a shutdown signal.
/// Uploads embed whole documents, so this is longer than a single call.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    assistant: Assistant,
    sessions: Arc<SessionStore>,
    prometheus: PrometheusHandle,
}

/// Build the axum router with all routes and shared state.
///
/// Uploads are capped at `max_upload_bytes`; total concurrent requests at
/// `max_connections`.
fn build_router(state: AppState, max_connections: usize, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/sessions", post(api::create_session))
        .route("/sessions/{id}", delete(api::delete_session))
        .route("/sessions/{id}/questions", post(api::ask_question))
        .route("/sessions/{id}/quiz", post(api::create_quiz))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting doc-assistant");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle =
        metrics::install_recorder().context("failed to install Prometheus recorder")?;

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let (config_path, explicit) = Config::resolve_path(cli_config_path);
    let mut config = if explicit || config_path.exists() {
        info!(path = %config_path.display(), "loading configuration");
        Config::load(&config_path)
            .with_context(|| format!("failed to load config from {}", config_path.display()))?
    } else {
        info!(path = %config_path.display(), "no config file, using defaults");
        Config::from_defaults().context("failed to build default configuration")?
    };

    info!(
        listen_addr = %config.server.listen_addr,
        base_url = %config.gemini.base_url,
        chat_model = %config.gemini.chat_model,
        "configuration loaded"
    );

    let pool = Arc::new(KeyPool::new(
        std::mem::take(&mut config.api_keys),
        Duration::from_secs(config.pool.rotation_cooldown_secs),
    ));
    let resilient = Resilient::new(pool.clone(), config.pool.max_retries);
    if pool.is_empty() {
        warn!(
            vars = ?config.pool.key_env_vars,
            "no API keys found; model calls will fail until keys are configured"
        );
    }
    info!(
        keys = pool.len(),
        cooldown_secs = pool.rotation_cooldown().as_secs(),
        max_retries = resilient.max_retries(),
        "retry policy configured"
    );

    let gemini = Arc::new(
        GeminiClient::new(
            config.gemini.base_url.clone(),
            Duration::from_secs(config.gemini.timeout_secs),
        )
        .context("failed to build Gemini client")?,
    );
    let assistant = Assistant::new(
        resilient,
        gemini.clone(),
        gemini,
        Settings::from_config(&config),
    );

    let app_state = AppState {
        assistant,
        sessions: Arc::new(SessionStore::new()),
        prometheus: prometheus_handle,
    };
    let app = build_router(
        app_state,
        config.server.max_connections,
        config.server.max_upload_bytes,
    );

    let listen_addr = config.server.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // The drain timeout starts at signal receipt, not at server start.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            warn!(
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// Health endpoint: key pool summary plus open session count.
/// Returns 503 when no key is usable.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let mut body = state.assistant.resilient().pool().health().await;
    body["sessions"] = serde_json::json!(state.sessions.len().await);

    let status_code = if body["status"] == "unhealthy" {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    } else {
        axum::http::StatusCode::OK
    };

    (
        status_code,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assistant::tests::{FakeModels, test_assistant};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use key_pool::PoolKey;
    use tower::ServiceExt;

    const BOUNDARY: &str = "doc-assistant-test-boundary";

    /// PrometheusHandle for tests without installing a global recorder.
    fn test_prometheus_handle() -> PrometheusHandle {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        recorder.handle()
    }

    /// Test "PDF" parser: the file bytes are the text.
    fn fixture_text(bytes: &[u8]) -> std::result::Result<String, String> {
        String::from_utf8(bytes.to_vec()).map_err(|e| e.to_string())
    }

    fn app_with(assistant: Assistant, max_upload_bytes: usize) -> Router {
        let state = AppState {
            assistant: assistant.with_extractor(fixture_text),
            sessions: Arc::new(SessionStore::new()),
            prometheus: test_prometheus_handle(),
        };
        build_router(state, 100, max_upload_bytes)
    }

    fn app(secrets: &[&str], models: Arc<FakeModels>) -> Router {
        app_with(test_assistant(secrets, models), 1024 * 1024)
    }

    /// Multipart body with one part per `(field, filename, bytes)`.
    fn multipart(parts: &[(&str, &str, &[u8])]) -> Request<Body> {
        let mut body = Vec::new();
        for (field, filename, bytes) in parts {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"{filename}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
                )
                .as_bytes(),
            );
            body.extend_from_slice(bytes);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

        Request::builder()
            .method("POST")
            .uri("/sessions")
            .header(
                "content-type",
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    fn json_post(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn empty(method: &str, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let json = if body.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&body).unwrap()
        };
        (status, json)
    }

    async fn upload(app: &Router) -> String {
        let (status, json) = send(
            app,
            multipart(&[
                ("documents", "rust.pdf", "Rust has no garbage collector.\n\n".as_bytes()),
                ("documents", "ocean.pdf", "The ocean covers most of Earth.".as_bytes()),
            ]),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "upload failed: {json}");
        json["session_id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn health_reports_pool_and_sessions() {
        let app = app(&["k1", "k2"], Arc::new(FakeModels::default()));
        let (status, json) = send(&app, empty("GET", "/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["keys_total"], 2);
        assert_eq!(json["sessions"], 0);
        assert_eq!(json["keys"][0]["label"], "KEY_1");
        assert!(!json.to_string().contains("k1"), "secrets must not leak");
    }

    #[tokio::test]
    async fn health_without_keys_is_503() {
        let app = app(&[], Arc::new(FakeModels::default()));
        let (status, json) = send(&app, empty("GET", "/health")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["status"], "unhealthy");
    }

    #[tokio::test]
    async fn metrics_endpoint_serves_text() {
        let app = app(&["k1"], Arc::new(FakeModels::default()));
        let response = app.oneshot(empty("GET", "/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["content-type"],
            "text/plain; version=0.0.4; charset=utf-8"
        );
    }

    #[tokio::test]
    async fn upload_ask_quiz_delete_flow() {
        let models = Arc::new(FakeModels::default());
        models.reply_to("Use the following pieces of context", "It covers most of Earth.");
        models.reply_to("Create 5 multiple-choice", "Q1. What covers Earth?");
        let app = app(&["good"], models.clone());

        let (status, created) = send(
            &app,
            multipart(&[
                ("documents", "rust.pdf", "Rust has no garbage collector.\n\n".as_bytes()),
                ("documents", "ocean.pdf", "The ocean covers most of Earth.".as_bytes()),
            ]),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["documents"], 2);
        assert_eq!(created["characters"], 63);
        assert_eq!(created["chunks"], 2);
        let id = created["session_id"].as_str().unwrap();

        let (status, reply) = send(
            &app,
            json_post(
                &format!("/sessions/{id}/questions"),
                serde_json::json!({"question": "What about the ocean?"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(reply["answer"], "It covers most of Earth.");
        assert_eq!(reply["chat_history"][0]["role"], "user");
        assert_eq!(reply["chat_history"][0]["content"], "What about the ocean?");
        assert_eq!(reply["chat_history"][1]["role"], "assistant");

        let (status, quiz) = send(&app, empty("POST", &format!("/sessions/{id}/quiz"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(quiz["quiz"], "Q1. What covers Earth?");
        let quiz_prompt = models.real_prompts().last().unwrap().clone();
        assert!(quiz_prompt.ends_with(
            "Rust has no garbage collector.\n\nThe ocean covers most of Earth."
        ));

        let (status, _) = send(&app, empty("DELETE", &format!("/sessions/{id}"))).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = send(&app, empty("DELETE", &format!("/sessions/{id}"))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, json) = send(
            &app,
            json_post(
                &format!("/sessions/{id}/questions"),
                serde_json::json!({"question": "still there?"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["error"]["type"], "not_found_error");
    }

    #[tokio::test]
    async fn repeated_question_does_not_call_models_again() {
        let models = Arc::new(FakeModels::default());
        let app = app(&["good"], models.clone());
        let id = upload(&app).await;
        let ask = || {
            json_post(
                &format!("/sessions/{id}/questions"),
                serde_json::json!({"question": "Is Rust fast?"}),
            )
        };

        let (_, first) = send(&app, ask()).await;
        let calls = models.prompts.lock().unwrap().len();
        let (status, second) = send(&app, ask()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(second, first);
        assert_eq!(models.prompts.lock().unwrap().len(), calls);
    }

    #[tokio::test]
    async fn upload_without_pdfs_is_rejected() {
        let app = app(&["good"], Arc::new(FakeModels::default()));

        let (status, json) = send(&app, multipart(&[])).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"]["message"], "upload at least one PDF");

        let (status, json) = send(
            &app,
            multipart(&[("documents", "notes.txt", "plain text".as_bytes()), ("other", "a.pdf", "x".as_bytes())]),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"]["message"], "upload at least one PDF");
    }

    #[tokio::test]
    async fn upload_with_no_text_is_rejected() {
        let app = app(&["good"], Arc::new(FakeModels::default()));
        let (status, json) = send(&app, multipart(&[("documents", "scan.pdf", "  \n ".as_bytes())])).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(
            json["error"]["message"],
            "no extractable text in the uploaded documents"
        );
    }

    #[tokio::test]
    async fn unreadable_pdf_is_rejected_with_its_name() {
        let app = app(&["good"], Arc::new(FakeModels::default()));
        let (status, json) = send(
            &app,
            multipart(&[("documents", "broken.pdf", &[0xff_u8, 0xfe, 0x00][..])]),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(
            json["error"]["message"]
                .as_str()
                .unwrap()
                .starts_with("could not read broken.pdf")
        );
    }

    #[tokio::test]
    async fn exhausted_pool_returns_generic_503() {
        let app = app(&["quota", "quota"], Arc::new(FakeModels::default()));
        let (status, json) = send(
            &app,
            multipart(&[("documents", "rust.pdf", "Rust has no garbage collector.".as_bytes())]),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            json["error"]["message"],
            "AI service unavailable right now, please try again later"
        );
        assert!(!json.to_string().contains("KEY_"));
    }

    #[tokio::test]
    async fn bad_question_body_is_400() {
        let app = app(&["good"], Arc::new(FakeModels::default()));
        let id = upload(&app).await;

        let (status, json) = send(
            &app,
            json_post(&format!("/sessions/{id}/questions"), serde_json::json!({"q": 1})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"]["type"], "invalid_request_error");

        let (status, json) = send(
            &app,
            json_post(&format!("/sessions/{id}/questions"), serde_json::json!({"question": " "})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"]["message"], "question must not be empty");
    }

    #[tokio::test]
    async fn quiz_on_unknown_session_is_404() {
        let app = app(&["good"], Arc::new(FakeModels::default()));
        let (status, _) = send(
            &app,
            empty("POST", &format!("/sessions/{}/quiz", uuid::Uuid::new_v4())),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&app, empty("POST", "/sessions/not-a-uuid/quiz")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn oversized_upload_is_413() {
        let app = app_with(
            test_assistant(&["good"], Arc::new(FakeModels::default())),
            64,
        );
        let big = vec![b'a'; 4096];
        let (status, json) = send(&app, multipart(&[("documents", "big.pdf", big.as_slice())])).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(json["error"]["type"], "request_too_large");
    }

    /// Mock Gemini API: `quota-key` always gets 429; other keys succeed.
    /// Embeddings are 2-dim keyword vectors (rust, ocean).
    async fn start_mock_gemini() -> String {
        use axum::Json;
        use axum::http::HeaderMap;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());

        let app = Router::new().route(
            "/v1beta/models/{action}",
            post(
                |headers: HeaderMap,
                 axum::extract::Path(action): axum::extract::Path<String>,
                 Json(body): Json<serde_json::Value>| async move {
                    let key = headers
                        .get("x-goog-api-key")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("");
                    if key == "quota-key" {
                        return (
                            StatusCode::TOO_MANY_REQUESTS,
                            Json(serde_json::json!({
                                "error": {"code": 429, "message": "Resource has been exhausted (e.g. check quota).", "status": "RESOURCE_EXHAUSTED"}
                            })),
                        );
                    }
                    if action.ends_with(":batchEmbedContents") {
                        let embeddings: Vec<serde_json::Value> = body["requests"]
                            .as_array()
                            .cloned()
                            .unwrap_or_default()
                            .iter()
                            .map(|r| {
                                let text = r["content"]["parts"][0]["text"]
                                    .as_str()
                                    .unwrap_or("")
                                    .to_lowercase();
                                let rust = if text.contains("rust") { 1.0 } else { 0.0 };
                                let ocean = if text.contains("ocean") { 1.0 } else { 0.0 };
                                serde_json::json!({"values": [rust, ocean]})
                            })
                            .collect();
                        return (
                            StatusCode::OK,
                            Json(serde_json::json!({"embeddings": embeddings})),
                        );
                    }
                    let prompt = body["contents"][0]["parts"][0]["text"]
                        .as_str()
                        .unwrap_or("")
                        .to_string();
                    let reply = if prompt.contains("Rust has no garbage collector.") {
                        "Rust manages memory with ownership."
                    } else {
                        "pong"
                    };
                    (
                        StatusCode::OK,
                        Json(serde_json::json!({
                            "candidates": [{"content": {"parts": [{"text": reply}]}}]
                        })),
                    )
                },
            ),
        );
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        url
    }

    #[tokio::test]
    async fn end_to_end_against_mock_gemini_rotates_past_quota_key() {
        let base_url = start_mock_gemini().await;
        let gemini = Arc::new(GeminiClient::new(base_url, Duration::from_secs(5)).unwrap());
        let pool = Arc::new(KeyPool::new(
            vec![
                PoolKey::new("GOOGLE_API_KEY", "quota-key"),
                PoolKey::new("GOOGLE_API_KEY_2", "good-key"),
            ],
            Duration::ZERO,
        ));
        let assistant = Assistant::new(
            Resilient::new(pool, 3),
            gemini.clone(),
            gemini,
            Settings::from_config(&Config::default()),
        );
        let app = app_with(assistant, 1024 * 1024);

        let id = upload(&app).await;
        let (status, reply) = send(
            &app,
            json_post(
                &format!("/sessions/{id}/questions"),
                serde_json::json!({"question": "How does Rust handle memory?"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "got {reply}");
        assert_eq!(reply["answer"], "Rust manages memory with ownership.");

        let (status, health) = send(&app, empty("GET", "/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(health["status"], "degraded");
        assert_eq!(health["keys_quota_exceeded"], 1);
        assert_eq!(health["sessions"], 1);
        assert_eq!(health["keys"][1]["active"], true);
        assert!(!health.to_string().contains("quota-key"));
    }
}
