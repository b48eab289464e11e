use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use cognicode_core::{JobEvent, OperationRequest, ValidationError};
use cognicode_engine::{Orchestrator, OrchestratorError};
use cognicode_telemetry::TelemetryGuard;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::client::{self, ClientId, ClientRegistry};
use crate::handlers::{self, HandlerState};
use crate::rpc::{RpcRequest, RpcResponse};
use crate::wire;

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_send_queue: usize,
    pub request_timeout_secs: u64,
    /// Dead-client and expired-session sweep period.
    pub cleanup_interval: Duration,
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 5000,
            max_send_queue: 256,
            request_timeout_secs: 300,
            cleanup_interval: Duration::from_secs(60),
            max_body_bytes: 32 * 1024 * 1024,
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub handler_state: Arc<HandlerState>,
    pub client_registry: Arc<ClientRegistry>,
    pub message_tx: mpsc::Sender<(ClientId, String)>,
}

pub fn build_router(state: AppState, config: &ServerConfig) -> Router {
    let api = Router::new()
        .route("/health", get(health_handler))
        .route("/api/status", get(status_handler))
        .route("/api/agents/status", get(status_handler))
        .route("/api/jobs", post(submit_job_handler))
        .layer(TimeoutLayer::new(Duration::from_secs(config.request_timeout_secs)));

    Router::new()
        .route("/ws", get(ws_handler))
        .merge(api)
        .with_state(state)
        .layer(DefaultBodyLimit::max(config.max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind and serve. The returned handle keeps the background tasks alive.
pub async fn start(
    config: ServerConfig,
    orchestrator: Orchestrator,
    telemetry: Option<Arc<TelemetryGuard>>,
) -> Result<ServerHandle, std::io::Error> {
    let client_registry = Arc::new(ClientRegistry::new(config.max_send_queue));

    let mut handler_state = HandlerState::new(orchestrator.clone(), Arc::clone(&client_registry));
    if let Some(telemetry) = telemetry {
        handler_state = handler_state.with_telemetry(telemetry);
    }
    let handler_state = Arc::new(handler_state);

    let cleanup = start_cleanup_task(
        Arc::clone(&client_registry),
        orchestrator,
        config.cleanup_interval,
    );

    let (msg_tx, msg_rx) = mpsc::channel::<(ClientId, String)>(1024);
    let rpc = tokio::spawn(process_rpc_messages(msg_rx, Arc::clone(&handler_state)));

    let app_state = AppState {
        handler_state,
        client_registry,
        message_tx: msg_tx,
    };
    let router = build_router(app_state, &config);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!(addr = %local_addr, "cognicode server started");

    let shutdown = CancellationToken::new();
    let server_shutdown = shutdown.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(server_shutdown.cancelled_owned())
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "server stopped with error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        shutdown,
        server,
        rpc,
        cleanup,
    })
}

pub struct ServerHandle {
    pub port: u16,
    shutdown: CancellationToken,
    server: tokio::task::JoinHandle<()>,
    rpc: tokio::task::JoinHandle<()>,
    cleanup: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    /// Stop accepting connections and wait for in-progress HTTP requests.
    pub async fn stop(self) {
        self.shutdown.cancel();
        let _ = self.server.await;
        self.rpc.abort();
        self.cleanup.abort();
    }
}

/// Periodically drop dead clients, expired sessions and expired cache entries.
pub fn start_cleanup_task(
    registry: Arc<ClientRegistry>,
    orchestrator: Orchestrator,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let clients = registry.cleanup_dead_clients();
            let (sessions, cache_entries) = orchestrator.sweep();
            if clients + sessions + cache_entries > 0 {
                tracing::info!(clients, sessions, cache_entries, "periodic cleanup");
            }
        }
    })
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (client_id, rx) = state.client_registry.register();
    let session_id = handlers::connect(&state.handler_state, &client_id);
    tracing::info!(client_id = %client_id, session_id = %session_id, "websocket client connected");
    state
        .client_registry
        .send_to(&client_id, wire::connected_frame(&session_id));

    client::handle_ws_connection(
        socket,
        client_id.clone(),
        rx,
        Arc::clone(&state.client_registry),
        state.message_tx,
    )
    .await;

    handlers::disconnect(&state.handler_state, &client_id);
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let (healthy, report) = handlers::health_report(&state.handler_state);
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.handler_state.orchestrator.status())
}

fn error_body(kind: &str, message: impl Into<String>) -> Value {
    json!({ "error": { "kind": kind, "message": message.into() } })
}

/// HTTP status for a terminal event returned by the synchronous endpoint.
fn terminal_status(event: &JobEvent) -> StatusCode {
    match event {
        JobEvent::Error { kind, .. } => match kind.as_str() {
            "resource_exhausted" | "unavailable" => StatusCode::SERVICE_UNAVAILABLE,
            "timeout" => StatusCode::GATEWAY_TIMEOUT,
            "inference_error" => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        },
        _ => StatusCode::OK,
    }
}

/// Synchronous fallback: submit, wait for the terminal event, return it.
async fn submit_job_handler(State(state): State<AppState>, Json(body): Json<Value>) -> impl IntoResponse {
    let request: OperationRequest = match serde_json::from_value(body) {
        Ok(r) => r,
        Err(e) => {
            let err = ValidationError::Malformed(e.to_string());
            return (StatusCode::BAD_REQUEST, Json(error_body(err.kind(), err.to_string())));
        }
    };

    match state.handler_state.orchestrator.submit_and_wait(&request).await {
        Ok((outcome, event)) => {
            let mut body = wire::event_to_value(&event);
            if let Some(obj) = body.as_object_mut() {
                obj.insert("deduplicated".into(), json!(outcome.deduplicated));
            }
            (terminal_status(&event), Json(body))
        }
        Err(e @ OrchestratorError::Validation(_)) => {
            (StatusCode::BAD_REQUEST, Json(error_body(e.kind(), e.to_string())))
        }
        Err(e @ OrchestratorError::ShuttingDown) => {
            (StatusCode::SERVICE_UNAVAILABLE, Json(error_body(e.kind(), e.to_string())))
        }
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, Json(error_body(e.kind(), e.to_string()))),
    }
}

/// Process incoming RPC frames from WebSocket clients, in arrival order.
async fn process_rpc_messages(mut rx: mpsc::Receiver<(ClientId, String)>, state: Arc<HandlerState>) {
    while let Some((client_id, raw_message)) = rx.recv().await {
        let response = match serde_json::from_str::<RpcRequest>(&raw_message) {
            Ok(request) => {
                let params = request.params.unwrap_or_else(|| json!({}));
                handlers::dispatch(&state, &client_id, &request.method, &params, request.id)
            }
            Err(_) => RpcResponse::parse_error(),
        };
        if let Ok(json) = serde_json::to_string(&response) {
            state.registry.send_to(&client_id, json);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cognicode_agents::{StubAgent, StubBehavior};
    use cognicode_core::{Agent, InferenceError, JobId, Operation};
    use cognicode_engine::{AgentFactory, EngineConfig, PerOperation, PoolConfig};

    fn orchestrator_with(stub: &StubAgent, config: EngineConfig) -> Orchestrator {
        let stub = stub.clone();
        let factory: AgentFactory = Arc::new(move |_, _| Arc::new(stub.clone()) as Arc<dyn Agent>);
        Orchestrator::new(config, factory)
    }

    async fn serve(orchestrator: Orchestrator) -> ServerHandle {
        let config = ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            ..Default::default()
        };
        start(config, orchestrator, None).await.unwrap()
    }

    fn url(handle: &ServerHandle, path: &str) -> String {
        format!("http://127.0.0.1:{}{}", handle.port, path)
    }

    #[tokio::test]
    async fn server_starts_and_serves_health() {
        let stub = StubAgent::new(Operation::Analyze, StubBehavior::Echo);
        let handle = serve(orchestrator_with(&stub, EngineConfig::default())).await;
        assert!(handle.port > 0);

        let resp = reqwest::get(url(&handle, "/health")).await.unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["clients"], 0);
    }

    #[tokio::test]
    async fn status_routes_report_pools() {
        let stub = StubAgent::new(Operation::Analyze, StubBehavior::Echo);
        let handle = serve(orchestrator_with(&stub, EngineConfig::default())).await;
        for path in ["/api/status", "/api/agents/status"] {
            let body: Value = reqwest::get(url(&handle, path)).await.unwrap().json().await.unwrap();
            let ops = body["operations"].as_array().unwrap();
            assert_eq!(ops.len(), 3);
            assert_eq!(ops[0]["operation"], "analyze");
            assert!(body["cache"]["fast"]["capacity"].as_u64().unwrap() > 0);
        }
    }

    #[tokio::test]
    async fn sync_submit_returns_result_then_cached() {
        let stub = StubAgent::new(Operation::Analyze, StubBehavior::Succeed(json!({"issues": []})));
        let handle = serve(orchestrator_with(&stub, EngineConfig::default())).await;
        let http = reqwest::Client::new();
        let body = json!({"operation": "analyze", "code": "let a = 1;", "language": "javascript"});

        let resp = http.post(url(&handle, "/api/jobs")).json(&body).send().await.unwrap();
        assert_eq!(resp.status(), 200);
        let first: Value = resp.json().await.unwrap();
        assert_eq!(first["type"], "result");
        assert_eq!(first["cached"], false);

        let second: Value = http
            .post(url(&handle, "/api/jobs"))
            .json(&body)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(second["cached"], true);
        assert_eq!(second["data"], first["data"]);
        assert_eq!(stub.executions(), 1);
    }

    #[tokio::test]
    async fn sync_submit_maps_failures_to_status_codes() {
        let stub = StubAgent::scripted(
            Operation::Analyze,
            vec![StubBehavior::Fail(InferenceError::new("model_error", "boom"))],
        );
        let handle = serve(orchestrator_with(&stub, EngineConfig::default())).await;
        let http = reqwest::Client::new();

        let resp = http
            .post(url(&handle, "/api/jobs"))
            .json(&json!({"operation": "analyze", "code": "x"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 502);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["kind"], "inference_error");
        assert_eq!(body["reason"], "model_error");

        let resp = http
            .post(url(&handle, "/api/jobs"))
            .json(&json!({"operation": "analyze", "code": ""}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"]["kind"], "validation_error");

        let resp = http
            .post(url(&handle, "/api/jobs"))
            .json(&json!({"code": "x"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
    }

    #[tokio::test]
    async fn sync_submit_times_out_with_504() {
        let stub = StubAgent::new(Operation::Analyze, StubBehavior::Hang);
        let config = EngineConfig {
            pools: PerOperation::uniform(PoolConfig {
                size: 1,
                execution_timeout: Duration::from_millis(100),
            }),
            cancel_grace: Duration::from_millis(50),
            ..EngineConfig::default()
        };
        let handle = serve(orchestrator_with(&stub, config)).await;
        let resp = reqwest::Client::new()
            .post(url(&handle, "/api/jobs"))
            .json(&json!({"operation": "analyze", "code": "while(true){}"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 504);
    }

    #[tokio::test]
    async fn shutting_down_reports_unavailable() {
        let stub = StubAgent::new(Operation::Analyze, StubBehavior::Echo);
        let orchestrator = orchestrator_with(&stub, EngineConfig::default());
        let handle = serve(orchestrator.clone()).await;
        orchestrator.shutdown().await;

        let resp = reqwest::get(url(&handle, "/health")).await.unwrap();
        assert_eq!(resp.status(), 503);
        let resp = reqwest::Client::new()
            .post(url(&handle, "/api/jobs"))
            .json(&json!({"operation": "analyze", "code": "x"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 503);
        handle.stop().await;
    }

    #[test]
    fn terminal_status_mapping() {
        let job_id = JobId::from_raw("job_1");
        let error = |kind: &str| JobEvent::Error {
            job_id: job_id.clone(),
            sequence: 1,
            kind: kind.into(),
            message: String::new(),
            retryable: true,
            reason: None,
        };
        assert_eq!(terminal_status(&error("resource_exhausted")), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(terminal_status(&error("timeout")), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(terminal_status(&error("inference_error")), StatusCode::BAD_GATEWAY);
        assert_eq!(terminal_status(&error("internal_error")), StatusCode::INTERNAL_SERVER_ERROR);
        let cancelled = JobEvent::Cancelled {
            job_id: job_id.clone(),
            sequence: 2,
        };
        assert_eq!(terminal_status(&cancelled), StatusCode::OK);
    }
}
