//! RPC method handlers and connection lifecycle.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use cognicode_core::{JobId, Operation, OperationRequest, SessionId};
use cognicode_engine::{event_channel, ChannelSession, EventReceiver, JobSubscriber, Orchestrator};
use cognicode_telemetry::TelemetryGuard;
use serde_json::{json, Value};

use crate::bridge;
use crate::client::{ClientId, ClientRegistry};
use crate::rpc::{self, ErrorCode, RpcResponse};
use crate::wire;

/// Shared state available to all RPC handlers.
pub struct HandlerState {
    pub orchestrator: Orchestrator,
    pub registry: Arc<ClientRegistry>,
    pub telemetry: Option<Arc<TelemetryGuard>>,
    pub started_at: Instant,
}

impl HandlerState {
    pub fn new(orchestrator: Orchestrator, registry: Arc<ClientRegistry>) -> Self {
        Self {
            orchestrator,
            registry,
            telemetry: None,
            started_at: Instant::now(),
        }
    }

    pub fn with_telemetry(mut self, telemetry: Arc<TelemetryGuard>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    fn session_for(&self, client_id: &ClientId) -> Option<Arc<ChannelSession>> {
        let session_id = self.registry.session_of(client_id)?;
        self.orchestrator.sessions().get(&session_id)
    }
}

/// Open a fresh session for a newly connected client and return its id.
pub fn connect(state: &HandlerState, client_id: &ClientId) -> SessionId {
    let (tx, rx) = event_channel();
    let session = state.orchestrator.open_session(tx);
    bind_session(state, client_id, session.id(), rx);
    session.id().clone()
}

/// Forget a client. Its session lingers, detached, until resumed or swept.
pub fn disconnect(state: &HandlerState, client_id: &ClientId) {
    if let Some(session_id) = state.registry.unregister(client_id) {
        if state.registry.clients_for_session(&session_id).is_empty() {
            state.orchestrator.detach_session(&session_id);
        }
    }
    tracing::debug!(client_id = %client_id, "client disconnected");
}

fn bind_session(
    state: &HandlerState,
    client_id: &ClientId,
    session_id: &SessionId,
    rx: EventReceiver,
) {
    for other in state.registry.clients_for_session(session_id) {
        if &other != client_id {
            state.registry.unbind(&other);
        }
    }
    if let Some(previous) = state.registry.set_session(client_id, session_id.clone()) {
        if &previous != session_id {
            state.orchestrator.detach_session(&previous);
        }
    }
    bridge::spawn_session_pump(state.registry.clone(), client_id.clone(), rx);
}

/// Dispatch an RPC method. camelCase params are normalized first, so every
/// handler reads snake_case keys.
pub fn dispatch(
    state: &Arc<HandlerState>,
    client_id: &ClientId,
    method: &str,
    params: &Value,
    id: Option<Value>,
) -> RpcResponse {
    let params = wire::normalize_params(params);

    match method {
        "session.open" => session_open(state, client_id, id),
        "session.resume" => session_resume(state, client_id, &params, id),

        "job.submit" => job_submit(state, client_id, &params, None, id),
        "analyze_code" => job_submit(state, client_id, &params, Some(Operation::Analyze), id),
        "generate_refactoring" => job_submit(state, client_id, &params, Some(Operation::Refactor), id),
        "generate_tests" => job_submit(state, client_id, &params, Some(Operation::GenerateTests), id),
        "job.subscribe" => job_subscribe(state, client_id, &params, id),
        "job.cancel" => job_cancel(state, client_id, &params, id),
        "job.status" => job_status(state, &params, id),

        "system.status" => system_status(state, id),
        "system.ping" => system_ping(id),
        "health" => health(state, id),

        "telemetry.metrics" => telemetry_metrics(state, &params, id),
        "telemetry.setLevel" => telemetry_set_level(state, &params, id),

        _ => RpcResponse::method_not_found(id, method),
    }
}

fn no_session(id: Option<Value>) -> RpcResponse {
    RpcResponse::error(id, ErrorCode::InvalidRequest, "No session bound to this connection")
}

fn session_open(state: &HandlerState, client_id: &ClientId, id: Option<Value>) -> RpcResponse {
    let session_id = connect(state, client_id);
    RpcResponse::success(id, json!({ "sessionId": session_id }))
}

fn session_resume(state: &HandlerState, client_id: &ClientId, params: &Value, id: Option<Value>) -> RpcResponse {
    let session_id = match rpc::require_str(params, "session_id") {
        Ok(s) => SessionId::from_raw(s),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    // what the client says it rendered, per job
    let last_seen: HashMap<JobId, u64> = match rpc::optional_u64_map(params, "last_sequences") {
        Ok(pairs) => pairs
            .into_iter()
            .map(|(job, sequence)| (JobId::from_raw(job), sequence))
            .collect(),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let (tx, rx) = event_channel();
    let resumed = match state.orchestrator.resume_session(&session_id, tx, &last_seen) {
        Ok(resumed) => resumed,
        Err(e) => return RpcResponse::rejected(id, &e),
    };
    bind_session(state, client_id, &session_id, rx);

    let jobs: Vec<Value> = resumed
        .replayed
        .iter()
        .filter_map(|job_id| state.orchestrator.job_status(job_id).ok())
        .map(|snapshot| wire::job_snapshot(&snapshot))
        .collect();
    RpcResponse::success(
        id,
        json!({
            "sessionId": session_id,
            "resumed": true,
            "jobs": jobs,
            "expired": resumed.expired,
        }),
    )
}

/// Build the request from params. Aliases fix the operation.
fn operation_request(params: &Value, alias: Option<Operation>) -> Result<OperationRequest, String> {
    let operation = match alias {
        Some(op) => op.as_str().to_string(),
        None => rpc::require_str(params, "operation")?.to_string(),
    };
    let code = match params.get("code") {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(_) => return Err("Parameter code must be a string".into()),
    };
    let language = match params.get("language") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => return Err("Parameter language must be a string".into()),
    };
    Ok(OperationRequest {
        operation,
        code,
        language,
        options: params.get("options").cloned(),
    })
}

fn job_submit(
    state: &HandlerState,
    client_id: &ClientId,
    params: &Value,
    alias: Option<Operation>,
    id: Option<Value>,
) -> RpcResponse {
    let request = match operation_request(params, alias) {
        Ok(r) => r,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let Some(session) = state.session_for(client_id) else {
        return no_session(id);
    };
    let subscriber: Arc<dyn JobSubscriber> = session;
    match state.orchestrator.submit(subscriber, &request) {
        Ok(outcome) => RpcResponse::success(id, wire::submit_outcome(&outcome)),
        Err(e) => RpcResponse::rejected(id, &e),
    }
}

fn job_id_param(params: &Value) -> Result<JobId, String> {
    rpc::require_str(params, "job_id").map(JobId::from_raw)
}

fn job_subscribe(state: &HandlerState, client_id: &ClientId, params: &Value, id: Option<Value>) -> RpcResponse {
    let job_id = match job_id_param(params) {
        Ok(j) => j,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let after_sequence = match rpc::optional_u64(params, "after_sequence") {
        Ok(a) => a,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let Some(session) = state.session_for(client_id) else {
        return no_session(id);
    };
    let subscriber: Arc<dyn JobSubscriber> = session;
    match state.orchestrator.subscribe(&subscriber, &job_id, after_sequence) {
        Ok(snapshot) => RpcResponse::success(id, wire::job_snapshot(&snapshot)),
        Err(e) => RpcResponse::rejected(id, &e),
    }
}

fn job_cancel(state: &HandlerState, client_id: &ClientId, params: &Value, id: Option<Value>) -> RpcResponse {
    let job_id = match job_id_param(params) {
        Ok(j) => j,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let Some(session_id) = state.registry.session_of(client_id) else {
        return no_session(id);
    };
    match state.orchestrator.cancel(&session_id, &job_id) {
        Ok(job_state) => RpcResponse::success(id, json!({ "jobId": job_id, "state": job_state.as_str() })),
        Err(e) => RpcResponse::rejected(id, &e),
    }
}

fn job_status(state: &HandlerState, params: &Value, id: Option<Value>) -> RpcResponse {
    let job_id = match job_id_param(params) {
        Ok(j) => j,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    match state.orchestrator.job_status(&job_id) {
        Ok(snapshot) => RpcResponse::success(id, wire::job_snapshot(&snapshot)),
        Err(e) => RpcResponse::rejected(id, &e),
    }
}

fn system_status(state: &HandlerState, id: Option<Value>) -> RpcResponse {
    match serde_json::to_value(state.orchestrator.status()) {
        Ok(status) => RpcResponse::success(id, status),
        Err(e) => RpcResponse::internal_error(id, e.to_string()),
    }
}

fn system_ping(id: Option<Value>) -> RpcResponse {
    RpcResponse::success(id, json!({ "pong": true, "serverTime": wire::now_iso8601() }))
}

/// Liveness summary shared by the `health` method and `GET /health`.
pub fn health_report(state: &HandlerState) -> (bool, Value) {
    let healthy = !state.orchestrator.is_shutting_down();
    let sessions = state.orchestrator.sessions().counts();
    let report = json!({
        "status": if healthy { "healthy" } else { "shutting_down" },
        "uptimeSecs": state.started_at.elapsed().as_secs(),
        "clients": state.registry.count(),
        "sessions": sessions,
    });
    (healthy, report)
}

fn health(state: &HandlerState, id: Option<Value>) -> RpcResponse {
    RpcResponse::success(id, health_report(state).1)
}

fn telemetry_metrics(state: &HandlerState, params: &Value, id: Option<Value>) -> RpcResponse {
    let prefix = rpc::optional_str(params, "name");
    let metrics: Vec<_> = state
        .orchestrator
        .metrics()
        .snapshot()
        .into_iter()
        .filter(|m| prefix.map_or(true, |p| m.name.starts_with(p)))
        .collect();
    RpcResponse::success(
        id,
        json!({
            "totalCount": metrics.len(),
            "metrics": metrics,
        }),
    )
}

fn telemetry_set_level(state: &HandlerState, params: &Value, id: Option<Value>) -> RpcResponse {
    let module = match rpc::require_str(params, "module") {
        Ok(m) => m,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let level = match rpc::require_str(params, "level").map(tracing::Level::from_str) {
        Ok(Ok(level)) => level,
        Ok(Err(_)) => return RpcResponse::invalid_params(id, "Unknown log level"),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let Some(telemetry) = &state.telemetry else {
        return RpcResponse::success(id, json!({ "enabled": false }));
    };
    telemetry.set_module_level(module, level);
    let levels: Vec<Value> = telemetry
        .module_levels()
        .into_iter()
        .map(|(m, l)| json!({ "module": m, "level": l.to_string().to_lowercase() }))
        .collect();
    RpcResponse::success(id, json!({ "enabled": true, "levels": levels }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    use cognicode_agents::{StubAgent, StubBehavior};
    use cognicode_core::Agent;
    use cognicode_engine::{AgentFactory, EngineConfig};

    fn state_with(stub: &StubAgent) -> Arc<HandlerState> {
        let stub = stub.clone();
        let factory: AgentFactory = Arc::new(move |_, _| Arc::new(stub.clone()) as Arc<dyn Agent>);
        let orchestrator = Orchestrator::new(EngineConfig::default(), factory);
        Arc::new(HandlerState::new(orchestrator, Arc::new(ClientRegistry::new(64))))
    }

    async fn next_frame(rx: &mut mpsc::Receiver<String>) -> Value {
        let text = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        serde_json::from_str(&text).unwrap()
    }

    async fn frames_until_terminal(rx: &mut mpsc::Receiver<String>) -> Vec<Value> {
        let mut frames = Vec::new();
        loop {
            let frame = next_frame(rx).await;
            let done = frame["type"] != "progress";
            frames.push(frame);
            if done {
                return frames;
            }
        }
    }

    fn submit_params(code: &str) -> Value {
        json!({ "operation": "analyze", "code": code, "language": "javascript" })
    }

    #[tokio::test]
    async fn submit_streams_events_to_client() {
        let stub = StubAgent::new(
            Operation::Analyze,
            StubBehavior::staged(Duration::from_millis(1), StubBehavior::Succeed(json!({"ok": 1}))),
        );
        let state = state_with(&stub);
        let (client, mut rx) = state.registry.register();
        connect(&state, &client);

        let resp = dispatch(&state, &client, "job.submit", &submit_params("f()"), Some(json!(1)));
        assert!(resp.success);
        let result = resp.result.unwrap();
        assert_eq!(result["cached"], false);
        let job_id = result["jobId"].clone();

        let frames = frames_until_terminal(&mut rx).await;
        let seqs: Vec<u64> = frames.iter().map(|f| f["sequence"].as_u64().unwrap()).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
        assert!(frames.iter().all(|f| f["jobId"] == job_id));
        let last = frames.last().unwrap();
        assert_eq!(last["type"], "result");
        assert_eq!(last["data"]["ok"], 1);
    }

    #[tokio::test]
    async fn alias_fixes_operation() {
        let stub = StubAgent::new(Operation::Refactor, StubBehavior::Echo);
        let state = state_with(&stub);
        let (client, mut rx) = state.registry.register();
        connect(&state, &client);

        let resp = dispatch(
            &state,
            &client,
            "generate_refactoring",
            &json!({ "code": "var x = 1;", "language": "javascript" }),
            Some(json!("r1")),
        );
        assert!(resp.success);
        assert_eq!(resp.result.unwrap()["operation"], "refactor");
        let frames = frames_until_terminal(&mut rx).await;
        assert_eq!(frames.last().unwrap()["type"], "result");
    }

    #[tokio::test]
    async fn validation_rejected_synchronously() {
        let stub = StubAgent::new(Operation::Analyze, StubBehavior::Echo);
        let state = state_with(&stub);
        let (client, mut rx) = state.registry.register();
        connect(&state, &client);

        let resp = dispatch(&state, &client, "analyze_code", &json!({ "code": "" }), Some(json!(1)));
        assert!(!resp.success);
        assert_eq!(resp.error.unwrap().code, "VALIDATION_ERROR");
        let resp = dispatch(&state, &client, "job.submit", &json!({ "code": 5 }), Some(json!(2)));
        assert_eq!(resp.error.unwrap().code, "INVALID_PARAMS");
        assert!(rx.try_recv().is_err());
        assert_eq!(stub.executions(), 0);
    }

    #[tokio::test]
    async fn cancel_requires_subscription() {
        let stub = StubAgent::new(
            Operation::Analyze,
            StubBehavior::delayed(Duration::from_secs(60), StubBehavior::Echo),
        );
        let state = state_with(&stub);
        let (owner, mut owner_rx) = state.registry.register();
        let (stranger, _stranger_rx) = state.registry.register();
        connect(&state, &owner);
        connect(&state, &stranger);

        let resp = dispatch(&state, &owner, "job.submit", &submit_params("slow()"), None);
        let job_id = resp.result.unwrap()["jobId"].clone();

        let resp = dispatch(&state, &stranger, "job.cancel", &json!({ "jobId": job_id }), None);
        assert_eq!(resp.error.unwrap().code, "NOT_SUBSCRIBED");

        let resp = dispatch(&state, &owner, "job.cancel", &json!({ "jobId": job_id }), None);
        assert!(resp.success);
        let frames = frames_until_terminal(&mut owner_rx).await;
        assert_eq!(frames.last().unwrap()["type"], "cancelled");
    }

    #[tokio::test]
    async fn resume_replays_missed_events() {
        let stub = StubAgent::new(
            Operation::Analyze,
            StubBehavior::delayed(Duration::from_millis(50), StubBehavior::Succeed(json!({"v": 2}))),
        );
        let state = state_with(&stub);
        let (first, _first_rx) = state.registry.register();
        let session_id = connect(&state, &first);
        dispatch(&state, &first, "job.submit", &submit_params("later()"), None);
        disconnect(&state, &first);
        assert!(!state.orchestrator.sessions().get(&session_id).unwrap().is_attached());

        tokio::time::sleep(Duration::from_millis(200)).await;

        let (second, mut second_rx) = state.registry.register();
        connect(&state, &second);
        let resp = dispatch(
            &state,
            &second,
            "session.resume",
            &json!({ "sessionId": session_id }),
            Some(json!(9)),
        );
        let result = resp.result.unwrap();
        assert_eq!(result["jobs"].as_array().unwrap().len(), 1);
        assert_eq!(result["expired"], json!([]));
        let frame = next_frame(&mut second_rx).await;
        assert_eq!(frame["type"], "result");
        assert_eq!(frame["data"]["v"], 2);
    }

    #[tokio::test]
    async fn resume_rejects_malformed_last_sequences() {
        let stub = StubAgent::new(Operation::Analyze, StubBehavior::Echo);
        let state = state_with(&stub);
        let (first, _first_rx) = state.registry.register();
        let session_id = connect(&state, &first);
        disconnect(&state, &first);

        let (second, _second_rx) = state.registry.register();
        let params = json!({ "sessionId": session_id, "lastSequences": { "job_x": -2 } });
        let resp = dispatch(&state, &second, "session.resume", &params, None);
        assert_eq!(resp.error.unwrap().code, "INVALID_PARAMS");
    }

    #[tokio::test]
    async fn resume_unknown_session_fails() {
        let stub = StubAgent::new(Operation::Analyze, StubBehavior::Echo);
        let state = state_with(&stub);
        let (client, _rx) = state.registry.register();
        let resp = dispatch(&state, &client, "session.resume", &json!({ "sessionId": "sess_nope" }), None);
        assert_eq!(resp.error.unwrap().code, "UNKNOWN_SESSION");
    }

    #[tokio::test]
    async fn status_and_ping() {
        let stub = StubAgent::new(Operation::Analyze, StubBehavior::Echo);
        let state = state_with(&stub);
        let (client, _rx) = state.registry.register();

        let resp = dispatch(&state, &client, "system.status", &Value::Null, None);
        let status = resp.result.unwrap();
        assert_eq!(status["operations"].as_array().unwrap().len(), 3);
        assert_eq!(status["operations"][0]["size"], 3);

        let resp = dispatch(&state, &client, "system.ping", &Value::Null, None);
        assert_eq!(resp.result.unwrap()["pong"], true);

        let resp = dispatch(&state, &client, "job.status", &json!({ "jobId": "job_missing" }), None);
        assert_eq!(resp.error.unwrap().code, "UNKNOWN_JOB");

        let resp = dispatch(&state, &client, "no.such", &Value::Null, None);
        assert_eq!(resp.error.unwrap().code, "METHOD_NOT_FOUND");
    }

    #[tokio::test]
    async fn submit_without_session_is_rejected() {
        let stub = StubAgent::new(Operation::Analyze, StubBehavior::Echo);
        let state = state_with(&stub);
        let (client, _rx) = state.registry.register();
        let resp = dispatch(&state, &client, "job.submit", &submit_params("f()"), None);
        assert_eq!(resp.error.unwrap().code, "INVALID_REQUEST");
    }
}
