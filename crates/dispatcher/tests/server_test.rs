use std::net::SocketAddr;
use std::time::Duration;

use axum::{
    extract::{ws::Message as AxumMessage, ws::WebSocket, Request},
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::{net::TcpStream, sync::mpsc, time::timeout};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use workerhub_core::{DispatchError, ServerConfig, WorkerInfo, WorkerStatus};
use workerhub_dispatcher::{RouteHandler, ServerState, WorkerDisconnected, WorkerServer};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(5);

fn test_config(auth_token: Option<&str>) -> ServerConfig {
    ServerConfig {
        bind_address: "127.0.0.1".to_string(),
        port: 0,
        auth_token: auth_token.map(str::to_string),
        health_check_interval_ms: 0,
        shutdown_timeout_seconds: 5,
        ..ServerConfig::default()
    }
}

async fn start_server(auth_token: Option<&str>) -> (WorkerServer, SocketAddr) {
    let server = WorkerServer::new(test_config(auth_token));
    let addr = server.start().await.unwrap();
    (server, addr)
}

async fn connect(addr: SocketAddr, path: &str) -> Client {
    let (ws, _) = connect_async(format!("ws://{addr}{path}")).await.unwrap();
    ws
}

fn registration(worker_id: &str, token: Option<&str>) -> Value {
    let mut message = json!({
        "type": "worker_registration",
        "workerId": worker_id,
        "workerName": format!("{worker_id} box"),
        "capabilities": {
            "models": [{
                "modelId": "llama-3-8b",
                "displayName": "Llama 3 8B",
                "maxContextTokens": 8192,
                "maxOutputTokens": 2048,
                "supportsStreaming": true
            }],
            "maxConcurrentRequests": 2
        }
    });
    if let Some(token) = token {
        message["authToken"] = json!(token);
    }
    message
}

async fn send_json(ws: &mut Client, value: &Value) {
    ws.send(Message::text(value.to_string())).await.unwrap();
}

/// Next text frame as JSON, or `None` once the server closes.
async fn recv_json(ws: &mut Client) -> Option<Value> {
    loop {
        let frame = timeout(WAIT, ws.next()).await.expect("timed out waiting for frame");
        match frame {
            Some(Ok(Message::Text(text))) => return Some(serde_json::from_str(text.as_str()).unwrap()),
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return None,
            Some(Ok(_)) => continue,
        }
    }
}

async fn register(addr: SocketAddr, worker_id: &str, token: Option<&str>) -> (Client, Value) {
    let mut ws = connect(addr, "/").await;
    send_json(&mut ws, &registration(worker_id, token)).await;
    let ack = recv_json(&mut ws).await.expect("no registration ack");
    (ws, ack)
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn connected_events(server: &WorkerServer) -> mpsc::UnboundedReceiver<WorkerInfo> {
    let (tx, rx) = mpsc::unbounded_channel();
    let _ = server.on_worker_connected(move |info| {
        let _ = tx.send(info.clone());
    });
    rx
}

fn disconnected_events(server: &WorkerServer) -> mpsc::UnboundedReceiver<WorkerDisconnected> {
    let (tx, rx) = mpsc::unbounded_channel();
    let _ = server.on_worker_disconnected(move |event| {
        let _ = tx.send(event.clone());
    });
    rx
}

async fn next_event<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

#[tokio::test]
async fn test_registration_with_valid_token() {
    let (server, addr) = start_server(Some("s3cret")).await;
    let mut connected = connected_events(&server);

    let (_ws, ack) = register(addr, "gpu-1", Some("s3cret")).await;

    assert_eq!(ack["type"], "worker_registration_ack");
    assert_eq!(ack["success"], true);
    let session_id = ack["sessionId"].as_str().unwrap().to_string();
    assert!(!session_id.is_empty());

    let info = next_event(&mut connected).await;
    assert_eq!(info.id, "gpu-1");
    assert_eq!(info.name, "gpu-1 box");
    assert_eq!(info.status, WorkerStatus::Available);
    assert_eq!(info.session_id, session_id);
    assert_eq!(server.get_worker_count(), 1);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_registration_with_invalid_token_is_rejected() {
    let (server, addr) = start_server(Some("s3cret")).await;
    let mut connected = connected_events(&server);

    let (mut ws, ack) = register(addr, "gpu-1", Some("guess")).await;

    assert_eq!(ack["success"], false);
    assert!(ack["error"].as_str().unwrap().to_lowercase().contains("authentication"));
    assert!(ack.get("sessionId").is_none());
    // the server hangs up after rejecting
    assert!(recv_json(&mut ws).await.is_none());

    assert_eq!(server.get_worker_count(), 0);
    assert!(connected.try_recv().is_err());

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_missing_token_is_rejected_when_secret_configured() {
    let (server, addr) = start_server(Some("s3cret")).await;

    let (_ws, ack) = register(addr, "gpu-1", None).await;
    assert_eq!(ack["success"], false);
    assert_eq!(server.get_worker_count(), 0);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_zero_capacity_registration_is_rejected() {
    let (server, addr) = start_server(None).await;
    let mut connected = connected_events(&server);

    let mut ws = connect(addr, "/").await;
    let mut message = registration("gpu-0", None);
    message["capabilities"]["maxConcurrentRequests"] = json!(0);
    send_json(&mut ws, &message).await;

    let ack = recv_json(&mut ws).await.expect("no registration ack");
    assert_eq!(ack["success"], false);
    assert!(ack["error"].as_str().unwrap().contains("maxConcurrentRequests"));
    assert!(recv_json(&mut ws).await.is_none());

    assert_eq!(server.get_worker_count(), 0);
    assert!(connected.try_recv().is_err());

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_bearer_header_authenticates_registration() {
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;

    let (server, addr) = start_server(Some("s3cret")).await;

    let mut request = format!("ws://{addr}/").into_client_request().unwrap();
    request
        .headers_mut()
        .insert("Authorization", "Bearer s3cret".parse().unwrap());
    let (mut ws, _) = connect_async(request).await.unwrap();
    send_json(&mut ws, &registration("gpu-1", None)).await;

    let ack = recv_json(&mut ws).await.unwrap();
    assert_eq!(ack["success"], true);
    assert_eq!(server.get_worker_count(), 1);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_open_server_accepts_without_token() {
    let (server, addr) = start_server(None).await;

    let (_ws, ack) = register(addr, "gpu-1", None).await;
    assert_eq!(ack["success"], true);
    assert_eq!(server.get_worker_count(), 1);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_abrupt_close_reports_pending_requests() {
    let (server, addr) = start_server(None).await;
    let mut disconnected = disconnected_events(&server);

    let (ws, _ack) = register(addr, "gpu-1", None).await;
    assert!(server.track_request("gpu-1", "req-1", None));
    assert_eq!(server.get_worker_info("gpu-1").unwrap().active_requests, 1);

    // drop the TCP stream without a close handshake
    drop(ws);

    let event = next_event(&mut disconnected).await;
    assert_eq!(event.worker.id, "gpu-1");
    assert!(event.pending_requests.contains(&"req-1".to_string()));
    assert_eq!(server.get_worker_count(), 0);

    // the orphaned request is gone with its worker
    assert!(!server.release_request("req-1", true));

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_message_routing_by_type() {
    let (server, addr) = start_server(None).await;
    let (tx, mut completions) = mpsc::unbounded_channel::<(String, Value)>();

    let handle = server.clone();
    server.on_worker_message("work_complete", move |worker, message| {
        let request_id = message["requestId"].as_str().unwrap_or_default();
        handle.release_request(request_id, true);
        let _ = tx.send((worker.id.clone(), message.clone()));
    });

    let (mut ws, _ack) = register(addr, "gpu-1", None).await;
    server.track_request("gpu-1", "req-9", None);

    ws.send(Message::text("{not json")).await.unwrap();
    send_json(&mut ws, &json!({"type": "telemetry", "load": 0.4})).await;
    send_json(&mut ws, &json!({"type": "work_complete", "requestId": "req-9"})).await;

    let (worker_id, message) = next_event(&mut completions).await;
    assert_eq!(worker_id, "gpu-1");
    assert_eq!(message["requestId"], "req-9");

    let info = server.get_worker_info("gpu-1").unwrap();
    assert_eq!(info.active_requests, 0);
    assert_eq!(info.completed_requests, 1);
    assert!(completions.try_recv().is_err());

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_later_handler_replaces_earlier() {
    let (server, addr) = start_server(None).await;
    let (tx, mut seen) = mpsc::unbounded_channel::<&'static str>();

    let first = tx.clone();
    server.on_worker_message("status", move |_, _| {
        let _ = first.send("first");
    });
    server.on_worker_message("status", move |_, _| {
        let _ = tx.send("second");
    });

    let (mut ws, _ack) = register(addr, "gpu-1", None).await;
    send_json(&mut ws, &json!({"type": "status"})).await;

    assert_eq!(next_event(&mut seen).await, "second");
    assert!(seen.try_recv().is_err());

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_send_and_broadcast_reach_workers() {
    let (server, addr) = start_server(None).await;
    let (mut ws1, _) = register(addr, "gpu-1", None).await;
    let (mut ws2, _) = register(addr, "gpu-2", None).await;

    assert!(server.send("gpu-1", &json!({"type": "work_request", "requestId": "r1"})));
    assert!(!server.send("ghost", &json!({"type": "work_request"})));
    let message = recv_json(&mut ws1).await.unwrap();
    assert_eq!(message["requestId"], "r1");

    assert_eq!(server.broadcast(&json!({"type": "config_update"})), 2);
    assert_eq!(recv_json(&mut ws1).await.unwrap()["type"], "config_update");
    assert_eq!(recv_json(&mut ws2).await.unwrap()["type"], "config_update");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_pool_passthroughs() {
    let (server, addr) = start_server(None).await;
    let (_ws1, _) = register(addr, "gpu-1", None).await;
    let (_ws2, _) = register(addr, "gpu-2", None).await;

    server.track_request("gpu-1", "r1", None);
    let chosen = server.get_available_worker("llama-3-8b", None).unwrap();
    assert_eq!(chosen.id, "gpu-2");
    assert!(server.get_available_worker("unknown-model", None).is_none());
    assert_eq!(server.get_available_slot_count("llama-3-8b", None), 3);

    server.track_request("gpu-1", "r2", None);
    server.track_request("gpu-2", "r3", None);
    server.track_request("gpu-2", "r4", None);
    assert!(server.get_available_worker("llama-3-8b", None).is_none());
    assert_eq!(server.get_any_available_worker().unwrap().status, WorkerStatus::Busy);
    assert_eq!(server.get_worker_info_list().len(), 2);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_duplicate_registration_replaces_stale_connection() {
    let (server, addr) = start_server(None).await;
    let mut disconnected = disconnected_events(&server);

    let (mut old_ws, old_ack) = register(addr, "gpu-1", None).await;
    server.track_request("gpu-1", "req-old", None);

    let (_new_ws, new_ack) = register(addr, "gpu-1", None).await;
    assert_ne!(old_ack["sessionId"], new_ack["sessionId"]);

    let event = next_event(&mut disconnected).await;
    assert_eq!(event.worker.session_id, old_ack["sessionId"].as_str().unwrap());
    assert_eq!(event.pending_requests, vec!["req-old".to_string()]);

    // the stale socket is closed by the server and its close leaves the new entry alone
    assert!(recv_json(&mut old_ws).await.is_none());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.get_worker_count(), 1);
    assert_eq!(
        server.get_worker_info("gpu-1").unwrap().session_id,
        new_ack["sessionId"].as_str().unwrap()
    );

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_health_check_evicts_silent_worker() {
    let server = WorkerServer::new(ServerConfig {
        heartbeat_timeout_ms: 100,
        ..test_config(None)
    });
    let addr = server.start().await.unwrap();
    let mut disconnected = disconnected_events(&server);

    let (mut ws, _) = register(addr, "quiet", None).await;
    server.track_request("quiet", "req-1", None);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(server.run_health_check().is_empty());
    assert_eq!(server.get_worker_info("quiet").unwrap().status, WorkerStatus::Unhealthy);

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(server.run_health_check(), vec!["quiet".to_string()]);

    let event = next_event(&mut disconnected).await;
    assert_eq!(event.pending_requests, vec!["req-1".to_string()]);
    assert_eq!(server.get_worker_count(), 0);
    assert!(recv_json(&mut ws).await.is_none());

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_inbound_frames_refresh_heartbeat() {
    let server = WorkerServer::new(ServerConfig {
        heartbeat_timeout_ms: 100,
        ..test_config(None)
    });
    let addr = server.start().await.unwrap();

    let (mut ws, _) = register(addr, "chatty", None).await;
    tokio::time::sleep(Duration::from_millis(150)).await;
    server.run_health_check();
    assert_eq!(server.get_worker_info("chatty").unwrap().status, WorkerStatus::Unhealthy);

    ws.send(Message::Ping(Vec::new().into())).await.unwrap();
    wait_for(|| server.get_worker_info("chatty").unwrap().status == WorkerStatus::Available).await;

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_background_monitor_evicts() {
    let server = WorkerServer::new(ServerConfig {
        heartbeat_timeout_ms: 20,
        health_check_interval_ms: 20,
        ..test_config(None)
    });
    let addr = server.start().await.unwrap();

    let (_ws, _) = register(addr, "quiet", None).await;
    wait_for(|| server.get_worker_count() == 0).await;

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_http_fallback_chain() {
    let (server, addr) = start_server(None).await;
    server.add_http_handler(RouteHandler::get("/health", |_req: Request| async {
        "ok".into_response()
    }));

    let base = format!("http://{addr}");
    let response = reqwest::get(format!("{base}/health")).await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "ok");

    let response = reqwest::get(format!("{base}/missing")).await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_websocket_endpoint_shares_port() {
    let (server, addr) = start_server(None).await;
    server.add_websocket_endpoint("/dashboard", |mut socket: WebSocket| async move {
        while let Some(Ok(message)) = socket.recv().await {
            if let AxumMessage::Text(text) = message {
                if socket.send(AxumMessage::Text(text)).await.is_err() {
                    break;
                }
            }
        }
    });

    let mut ws = connect(addr, "/dashboard").await;
    send_json(&mut ws, &registration("not-a-worker", None)).await;
    let echoed = recv_json(&mut ws).await.unwrap();
    assert_eq!(echoed["type"], "worker_registration");
    assert_eq!(server.get_worker_count(), 0);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_lifecycle() {
    let server = WorkerServer::new(test_config(None));
    assert_eq!(server.state(), ServerState::Stopped);
    assert!(server.local_addr().is_none());

    // stop before start is harmless
    server.stop().await.unwrap();

    let addr = server.start().await.unwrap();
    assert_eq!(server.state(), ServerState::Running);
    assert_eq!(server.local_addr(), Some(addr));

    let err = server.start().await.unwrap_err();
    assert!(matches!(err, DispatchError::AlreadyRunning));
    assert!(err.is_fatal());

    server.stop().await.unwrap();
    server.stop().await.unwrap();
    assert_eq!(server.state(), ServerState::Stopped);

    // a stopped server can be started again
    server.start().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_closes_worker_sockets() {
    let (server, addr) = start_server(None).await;
    let mut disconnected = disconnected_events(&server);
    let (mut ws, _) = register(addr, "gpu-1", None).await;

    server.stop().await.unwrap();

    assert!(recv_json(&mut ws).await.is_none());
    assert_eq!(server.get_worker_count(), 0);
    assert!(disconnected.try_recv().is_err());
}
