//! End-to-end tests over a real WebSocket.

use std::sync::Arc;
use std::time::Duration;

use cognicode_agents::{StubAgent, StubBehavior};
use cognicode_core::{Agent, Operation};
use cognicode_engine::{AgentFactory, EngineConfig, Orchestrator};
use cognicode_server::{start, ServerConfig, ServerHandle};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

const TIMEOUT: Duration = Duration::from_secs(5);

type WsStream = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn boot(stub: &StubAgent) -> (String, ServerHandle) {
    let stub = stub.clone();
    let factory: AgentFactory = Arc::new(move |_, _| Arc::new(stub.clone()) as Arc<dyn Agent>);
    let orchestrator = Orchestrator::new(EngineConfig::default(), factory);
    let config = ServerConfig {
        host: "127.0.0.1".into(),
        port: 0,
        ..Default::default()
    };
    let handle = start(config, orchestrator, None).await.unwrap();
    (format!("ws://127.0.0.1:{}/ws", handle.port), handle)
}

async fn read_json(ws: &mut WsStream) -> Value {
    loop {
        let msg = timeout(TIMEOUT, ws.next())
            .await
            .expect("timeout waiting for message")
            .expect("stream closed")
            .expect("ws error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

/// Connect and consume the `connected` frame. Returns the session id.
async fn connect(url: &str) -> (WsStream, String) {
    let (mut ws, _) = connect_async(url).await.unwrap();
    let hello = read_json(&mut ws).await;
    assert_eq!(hello["type"], "connected");
    let session_id = hello["sessionId"].as_str().unwrap().to_string();
    (ws, session_id)
}

/// Send a request and collect frames until its response arrives. Job events
/// that arrive first are returned alongside it.
async fn rpc_call(ws: &mut WsStream, id: &str, method: &str, params: Value) -> (Value, Vec<Value>) {
    let req = json!({"id": id, "method": method, "params": params});
    ws.send(Message::text(req.to_string())).await.unwrap();
    let mut events = Vec::new();
    loop {
        let frame = read_json(ws).await;
        if frame.get("id").and_then(|v| v.as_str()) == Some(id) {
            return (frame, events);
        }
        events.push(frame);
    }
}

async fn read_until_terminal(ws: &mut WsStream, mut events: Vec<Value>) -> Vec<Value> {
    while events.last().map_or(true, |e| e["type"] == "progress") {
        events.push(read_json(ws).await);
    }
    events
}

#[tokio::test]
async fn connected_frame_first() {
    let stub = StubAgent::new(Operation::Analyze, StubBehavior::Echo);
    let (url, _server) = boot(&stub).await;
    let (_ws, session_id) = connect(&url).await;
    assert!(session_id.starts_with("sess"));
}

#[tokio::test]
async fn analyze_streams_progress_then_result() {
    let stub = StubAgent::new(
        Operation::Analyze,
        StubBehavior::staged(Duration::from_millis(5), StubBehavior::Succeed(json!({"score": 90}))),
    );
    let (url, _server) = boot(&stub).await;
    let (mut ws, _) = connect(&url).await;

    let (resp, early) = rpc_call(
        &mut ws,
        "r1",
        "analyze_code",
        json!({"code": "function f() {}", "language": "javascript"}),
    )
    .await;
    assert_eq!(resp["success"], true);
    let job_id = resp["result"]["jobId"].clone();

    let events = read_until_terminal(&mut ws, early).await;
    let percents: Vec<u64> = events
        .iter()
        .filter(|e| e["type"] == "progress")
        .map(|e| e["percent"].as_u64().unwrap())
        .collect();
    assert_eq!(percents, vec![25, 50, 75, 100]);
    let last = events.last().unwrap();
    assert_eq!(last["type"], "result");
    assert_eq!(last["jobId"], job_id);
    assert_eq!(last["data"]["score"], 90);
}

#[tokio::test]
async fn two_clients_share_one_execution() {
    let stub = StubAgent::new(
        Operation::Analyze,
        StubBehavior::delayed(Duration::from_millis(100), StubBehavior::Succeed(json!({"n": 1}))),
    );
    let (url, _server) = boot(&stub).await;
    let (mut a, _) = connect(&url).await;
    let (mut b, _) = connect(&url).await;
    let params = json!({"operation": "analyze", "code": "x = 1", "language": "python"});

    let (ra, ea) = rpc_call(&mut a, "a1", "job.submit", params.clone()).await;
    let (rb, eb) = rpc_call(&mut b, "b1", "job.submit", params).await;
    assert_eq!(ra["result"]["jobId"], rb["result"]["jobId"]);
    assert_eq!(rb["result"]["deduplicated"], true);

    let ea = read_until_terminal(&mut a, ea).await;
    let eb = read_until_terminal(&mut b, eb).await;
    assert_eq!(ea.last().unwrap()["data"], eb.last().unwrap()["data"]);
    assert_eq!(stub.executions(), 1);
}

#[tokio::test]
async fn reconnect_resumes_session() {
    let stub = StubAgent::new(
        Operation::Analyze,
        StubBehavior::delayed(Duration::from_millis(200), StubBehavior::Succeed(json!({"late": true}))),
    );
    let (url, _server) = boot(&stub).await;
    let (mut ws, session_id) = connect(&url).await;
    let (resp, _) = rpc_call(
        &mut ws,
        "r1",
        "job.submit",
        json!({"operation": "analyze", "code": "slow()"}),
    )
    .await;
    let job_id = resp["result"]["jobId"].clone();
    ws.close(None).await.unwrap();
    drop(ws);

    tokio::time::sleep(Duration::from_millis(400)).await;

    let (mut ws, _) = connect(&url).await;
    let (resp, early) = rpc_call(&mut ws, "r2", "session.resume", json!({"sessionId": session_id})).await;
    assert_eq!(resp["success"], true);
    let events = read_until_terminal(&mut ws, early).await;
    let last = events.last().unwrap();
    assert_eq!(last["type"], "result");
    assert_eq!(last["jobId"], job_id);
    assert_eq!(last["data"]["late"], true);
}

#[tokio::test]
async fn cancel_running_job() {
    let stub = StubAgent::new(
        Operation::Analyze,
        StubBehavior::delayed(Duration::from_secs(30), StubBehavior::Echo),
    );
    let (url, _server) = boot(&stub).await;
    let (mut ws, _) = connect(&url).await;
    let (resp, _) = rpc_call(&mut ws, "r1", "job.submit", json!({"operation": "analyze", "code": "wait()"})).await;
    let job_id = resp["result"]["jobId"].clone();

    let (resp, early) = rpc_call(&mut ws, "r2", "job.cancel", json!({"jobId": job_id})).await;
    assert_eq!(resp["success"], true);
    let events = read_until_terminal(&mut ws, early).await;
    assert_eq!(events.last().unwrap()["type"], "cancelled");
}

#[tokio::test]
async fn malformed_frame_gets_parse_error() {
    let stub = StubAgent::new(Operation::Analyze, StubBehavior::Echo);
    let (url, _server) = boot(&stub).await;
    let (mut ws, _) = connect(&url).await;
    ws.send(Message::text("{not json")).await.unwrap();
    let frame = read_json(&mut ws).await;
    assert_eq!(frame["success"], false);
    assert_eq!(frame["error"]["code"], "PARSE_ERROR");
}
