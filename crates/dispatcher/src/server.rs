//! WebSocket front door for workers.
//!
//! One listener serves three kinds of traffic: worker connections (any
//! WebSocket upgrade on a path without a dedicated endpoint), extra WebSocket
//! endpoints registered with [`WorkerServer::add_websocket_endpoint`], and
//! plain HTTP walked through the handler chain in [`crate::http`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        FromRequestParts, Request, State,
    },
    http::{header::UPGRADE, HeaderMap},
    response::{IntoResponse, Response},
    Router,
};
use futures::{future::BoxFuture, SinkExt, StreamExt};
use metrics::{counter, gauge};
use serde::Serialize;
use serde_json::Value;
use tokio::{
    net::TcpListener,
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use workerhub_core::{
    message_type, ControlMessage, DispatchError, DispatchResult, EventListeners, RegistrationAck,
    RequestId, ServerConfig, Subscription, WorkerInfo, WorkerRegistration, WORKER_REGISTRATION,
};

use crate::auth::{bearer_token, verify_registration};
use crate::health::spawn_health_monitor;
use crate::http::{run_chain, HttpHandler};
use crate::pool::{ConnectedWorker, WorkerPool, WorkerSocket};

const CLOSE_POLICY_VIOLATION: u16 = 1008;
const AUTH_FAILED_MESSAGE: &str = "Invalid authentication token";

type MessageHandler = Arc<dyn Fn(&WorkerInfo, &Value) + Send + Sync>;
type EndpointHandler = Arc<dyn Fn(WebSocket) -> BoxFuture<'static, ()> + Send + Sync>;

/// Payload of the worker-disconnected event.
#[derive(Debug, Clone)]
pub struct WorkerDisconnected {
    pub worker: WorkerInfo,
    /// Requests that were in flight on the worker and now have no owner.
    pub pending_requests: Vec<RequestId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

struct Lifecycle {
    state: ServerState,
    local_addr: Option<SocketAddr>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    serve_task: Option<JoinHandle<()>>,
    monitor_task: Option<JoinHandle<()>>,
}

/// State shared between the server handle, the router and connection tasks.
pub(crate) struct ServerShared {
    config: ServerConfig,
    pool: Mutex<WorkerPool>,
    message_handlers: RwLock<HashMap<String, MessageHandler>>,
    endpoints: RwLock<HashMap<String, EndpointHandler>>,
    http_handlers: RwLock<Vec<Arc<dyn HttpHandler>>>,
    connected: EventListeners<WorkerInfo>,
    disconnected: EventListeners<WorkerDisconnected>,
}

/// Accepts worker connections and keeps the [`WorkerPool`] in sync with them.
///
/// Cloning yields another handle to the same server.
#[derive(Clone)]
pub struct WorkerServer {
    shared: Arc<ServerShared>,
    lifecycle: Arc<Mutex<Lifecycle>>,
}

impl WorkerServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            shared: Arc::new(ServerShared {
                config,
                pool: Mutex::new(WorkerPool::new()),
                message_handlers: RwLock::new(HashMap::new()),
                endpoints: RwLock::new(HashMap::new()),
                http_handlers: RwLock::new(Vec::new()),
                connected: EventListeners::new(),
                disconnected: EventListeners::new(),
            }),
            lifecycle: Arc::new(Mutex::new(Lifecycle {
                state: ServerState::Stopped,
                local_addr: None,
                shutdown_tx: None,
                serve_task: None,
                monitor_task: None,
            })),
        }
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> ServerState {
        self.lifecycle().state
    }

    /// Address actually bound, which differs from the configured one when port 0 is used.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lifecycle().local_addr
    }

    /// Binds the listener and starts serving.
    pub async fn start(&self) -> DispatchResult<SocketAddr> {
        {
            let mut lifecycle = self.lifecycle();
            if lifecycle.state != ServerState::Stopped {
                return Err(DispatchError::AlreadyRunning);
            }
            lifecycle.state = ServerState::Starting;
        }

        let listener = match self.bind().await {
            Ok(listener) => listener,
            Err(e) => {
                self.lifecycle().state = ServerState::Stopped;
                return Err(e);
            }
        };
        let local_addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                self.lifecycle().state = ServerState::Stopped;
                return Err(e.into());
            }
        };

        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        let router = self.router();

        let serve_task = tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.recv().await;
                })
                .await;
            if let Err(e) = result {
                error!(error = %e, "worker server terminated with error");
            }
        });

        let monitor_task = (self.shared.config.health_check_interval_ms > 0).then(|| {
            spawn_health_monitor(
                self.shared.clone(),
                Duration::from_millis(self.shared.config.health_check_interval_ms),
                Duration::from_millis(self.shared.config.heartbeat_timeout_ms),
                shutdown_tx.subscribe(),
            )
        });

        {
            let mut lifecycle = self.lifecycle();
            lifecycle.state = ServerState::Running;
            lifecycle.local_addr = Some(local_addr);
            lifecycle.shutdown_tx = Some(shutdown_tx);
            lifecycle.serve_task = Some(serve_task);
            lifecycle.monitor_task = monitor_task;
        }

        info!(%local_addr, auth = self.shared.config.auth_token.is_some(), "worker server listening");
        Ok(local_addr)
    }

    /// Router carrying all traffic of this server, for mounting on a listener
    /// the caller owns. [`start`](Self::start) serves the same router.
    pub fn router(&self) -> Router {
        Router::new()
            .fallback(route_request)
            .with_state(self.shared.clone())
    }

    async fn bind(&self) -> DispatchResult<TcpListener> {
        let addr = self
            .shared
            .config
            .socket_addr()
            .map_err(|e| DispatchError::config_error(e.to_string()))?;
        Ok(TcpListener::bind(addr).await?)
    }

    /// Closes every worker socket and shuts the listener down. Calling it on a
    /// server that is not running does nothing.
    pub async fn stop(&self) -> DispatchResult<()> {
        let (shutdown_tx, serve_task, monitor_task) = {
            let mut lifecycle = self.lifecycle();
            if lifecycle.state != ServerState::Running {
                return Ok(());
            }
            lifecycle.state = ServerState::Stopping;
            (
                lifecycle.shutdown_tx.take(),
                lifecycle.serve_task.take(),
                lifecycle.monitor_task.take(),
            )
        };

        info!("stopping worker server");
        self.shared.pool().close_all();
        gauge!("workerhub_workers_connected").set(0.0);

        if let Some(tx) = shutdown_tx {
            let _ = tx.send(());
        }
        if let Some(task) = monitor_task {
            let _ = task.await;
        }
        if let Some(mut task) = serve_task {
            let grace = Duration::from_secs(self.shared.config.shutdown_timeout_seconds);
            if tokio::time::timeout(grace, &mut task).await.is_err() {
                warn!(grace_secs = grace.as_secs(), "listener did not drain in time, aborting");
                task.abort();
            }
        }

        let mut lifecycle = self.lifecycle();
        lifecycle.state = ServerState::Stopped;
        lifecycle.local_addr = None;
        info!("worker server stopped");
        Ok(())
    }

    pub fn on_worker_connected<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&WorkerInfo) + Send + Sync + 'static,
    {
        self.shared.connected.subscribe(listener)
    }

    pub fn on_worker_disconnected<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&WorkerDisconnected) + Send + Sync + 'static,
    {
        self.shared.disconnected.subscribe(listener)
    }

    /// Routes post-registration messages whose `type` equals `message_type`.
    /// A later registration for the same type replaces the earlier handler.
    pub fn on_worker_message<F>(&self, message_type: impl Into<String>, handler: F)
    where
        F: Fn(&WorkerInfo, &Value) + Send + Sync + 'static,
    {
        self.shared
            .message_handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(message_type.into(), Arc::new(handler));
    }

    /// Serves WebSocket upgrades on `path` with `handler` instead of the worker protocol.
    pub fn add_websocket_endpoint<F, Fut>(&self, path: impl Into<String>, handler: F)
    where
        F: Fn(WebSocket) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let handler: EndpointHandler = Arc::new(move |socket| Box::pin(handler(socket)));
        self.shared
            .endpoints
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.into(), handler);
    }

    pub fn add_http_handler<H>(&self, handler: H)
    where
        H: HttpHandler + 'static,
    {
        self.shared
            .http_handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(handler));
    }

    pub fn send<T: Serialize + ?Sized>(&self, worker_id: &str, message: &T) -> bool {
        self.shared.pool().send(worker_id, message)
    }

    pub fn broadcast<T: Serialize + ?Sized>(&self, message: &T) -> usize {
        self.shared.pool().broadcast(message)
    }

    pub fn get_available_worker(&self, model_id: &str, category: Option<&str>) -> Option<WorkerInfo> {
        self.shared
            .pool()
            .get_available_worker(model_id, category)
            .map(ConnectedWorker::info)
    }

    pub fn get_any_available_worker(&self) -> Option<WorkerInfo> {
        self.shared
            .pool()
            .get_any_available_worker()
            .map(ConnectedWorker::info)
    }

    pub fn get_available_slot_count(&self, model_id: &str, category: Option<&str>) -> u32 {
        self.shared.pool().get_available_slot_count(model_id, category)
    }

    pub fn get_worker_count(&self) -> usize {
        self.shared.pool().get_count()
    }

    pub fn get_worker_info(&self, worker_id: &str) -> Option<WorkerInfo> {
        self.shared.pool().get_info(worker_id)
    }

    pub fn get_worker_info_list(&self) -> Vec<WorkerInfo> {
        self.shared.pool().get_worker_info_list()
    }

    pub fn track_request(&self, worker_id: &str, request_id: &str, category: Option<&str>) -> bool {
        self.shared.pool().track_request(worker_id, request_id, category)
    }

    pub fn release_request(&self, request_id: &str, increment_completed: bool) -> bool {
        self.shared.pool().release_request(request_id, increment_completed)
    }

    /// Removes a worker, closes its socket and reports its orphaned requests.
    pub fn evict_worker(&self, worker_id: &str) -> bool {
        self.shared.evict_worker(worker_id, "evicted")
    }

    /// One health sweep: marks stale workers and evicts dead ones. Returns the evicted ids.
    pub fn run_health_check(&self) -> Vec<String> {
        self.shared
            .run_health_check(Duration::from_millis(self.shared.config.heartbeat_timeout_ms))
    }
}

impl ServerShared {
    fn pool(&self) -> MutexGuard<'_, WorkerPool> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn endpoint(&self, path: &str) -> Option<EndpointHandler> {
        self.endpoints
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .cloned()
    }

    fn http_handlers(&self) -> Vec<Arc<dyn HttpHandler>> {
        self.http_handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn message_handler(&self, message_type: &str) -> Option<MessageHandler> {
        self.message_handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(message_type)
            .cloned()
    }

    pub(crate) fn run_health_check(&self, timeout: Duration) -> Vec<String> {
        let dead = self.pool().check_health(timeout);
        dead.into_iter()
            .filter(|worker_id| self.evict_worker(worker_id, "heartbeat timeout"))
            .collect()
    }

    fn evict_worker(&self, worker_id: &str, reason: &str) -> bool {
        let (removed, remaining) = {
            let mut pool = self.pool();
            (pool.remove(worker_id), pool.get_count())
        };
        match removed {
            Some(worker) => {
                counter!("workerhub_workers_evicted_total").increment(1);
                self.worker_gone(worker, remaining, reason);
                true
            }
            None => false,
        }
    }

    /// Removes the worker only if `session_id` still owns its pool entry.
    fn connection_closed(&self, worker_id: &str, session_id: &str) {
        let (removed, remaining) = {
            let mut pool = self.pool();
            let owned = pool
                .get(worker_id)
                .is_some_and(|w| w.session_id == session_id);
            let removed = if owned { pool.remove(worker_id) } else { None };
            (removed, pool.get_count())
        };
        if let Some(worker) = removed {
            self.worker_gone(worker, remaining, "connection closed");
        }
    }

    fn worker_gone(&self, worker: ConnectedWorker, remaining: usize, reason: &str) {
        worker.socket.close();
        let info = worker.info();
        let pending_requests = info.pending_requests.clone();

        info!(
            worker_id = %info.id,
            session_id = %info.session_id,
            pending = pending_requests.len(),
            reason,
            "worker disconnected"
        );
        counter!("workerhub_worker_disconnects_total").increment(1);
        gauge!("workerhub_workers_connected").set(remaining as f64);

        self.disconnected.emit(&WorkerDisconnected {
            worker: info,
            pending_requests,
        });
    }

    fn register(
        &self,
        text: &str,
        socket: &ChannelSocket,
        upgrade_token: Option<&str>,
    ) -> RegistrationOutcome {
        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "malformed frame before registration");
                return RegistrationOutcome::Ignored;
            }
        };
        if message_type(&value) != Some(WORKER_REGISTRATION) {
            warn!(kind = ?message_type(&value), "message before registration ignored");
            return RegistrationOutcome::Ignored;
        }

        let registration: WorkerRegistration = match serde_json::from_value(value) {
            Ok(registration) => registration,
            Err(e) => {
                warn!(error = %e, "invalid worker registration");
                socket.send_ack(RegistrationAck::rejected(format!("Invalid registration: {e}")));
                socket.close_with(CLOSE_POLICY_VIOLATION, "invalid registration");
                return RegistrationOutcome::Rejected;
            }
        };

        if !verify_registration(
            self.config.auth_token.as_deref(),
            registration.auth_token.as_deref(),
            upgrade_token,
        ) {
            warn!(worker_id = %registration.worker_id, "worker registration failed authentication");
            counter!("workerhub_registration_auth_failures_total").increment(1);
            socket.send_ack(RegistrationAck::rejected(AUTH_FAILED_MESSAGE));
            socket.close_with(CLOSE_POLICY_VIOLATION, "authentication failed");
            return RegistrationOutcome::Rejected;
        }

        if registration.capabilities.max_concurrent_requests == 0 {
            warn!(worker_id = %registration.worker_id, "worker registered without capacity");
            socket.send_ack(RegistrationAck::rejected(
                "Invalid registration: maxConcurrentRequests must be greater than 0",
            ));
            socket.close_with(CLOSE_POLICY_VIOLATION, "invalid registration");
            return RegistrationOutcome::Rejected;
        }

        let session_id = Uuid::new_v4().to_string();
        let worker_id = registration.worker_id.clone();
        let worker = ConnectedWorker::new(
            registration.worker_id,
            registration.worker_name,
            session_id.clone(),
            registration.capabilities,
            Box::new(socket.clone()),
        );

        let (stale, info, count) = {
            let mut pool = self.pool();
            let stale = pool.remove(&worker_id);
            pool.add(worker);
            (stale, pool.get_info(&worker_id), pool.get_count())
        };

        if let Some(stale) = stale {
            info!(worker_id = %worker_id, "worker re-registered, replacing stale connection");
            self.worker_gone(stale, count, "replaced by new registration");
        }

        socket.send_ack(RegistrationAck::accepted(session_id.clone()));
        counter!("workerhub_worker_registrations_total").increment(1);
        gauge!("workerhub_workers_connected").set(count as f64);

        if let Some(info) = info {
            info!(
                worker_id = %info.id,
                worker_name = %info.name,
                session_id = %session_id,
                models = info.capabilities.models.len(),
                max_concurrent = info.capabilities.max_concurrent_requests,
                "worker registered"
            );
            self.connected.emit(&info);
        }

        RegistrationOutcome::Accepted {
            worker_id,
            session_id,
        }
    }

    fn route_message(&self, worker_id: &str, text: &str) {
        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => {
                warn!(worker_id, error = %e, "dropping malformed message from worker");
                return;
            }
        };
        let Some(kind) = message_type(&value) else {
            debug!(worker_id, "message without type ignored");
            return;
        };
        let Some(handler) = self.message_handler(kind) else {
            trace!(worker_id, kind, "no handler for message type");
            return;
        };
        let Some(info) = self.pool().get_info(worker_id) else {
            return;
        };
        trace!(worker_id, kind, "routing worker message");
        handler(&info, &value);
    }
}

enum RegistrationOutcome {
    Accepted { worker_id: String, session_id: String },
    Rejected,
    Ignored,
}

enum Outbound {
    Text(String),
    Close(Option<(u16, String)>),
}

/// Pool-side handle to a worker connection. Writes are queued to the task
/// that owns the socket sink.
#[derive(Clone)]
struct ChannelSocket {
    tx: mpsc::UnboundedSender<Outbound>,
    open: Arc<AtomicBool>,
}

impl ChannelSocket {
    fn send_ack(&self, ack: RegistrationAck) {
        match ControlMessage::WorkerRegistrationAck(ack).to_json() {
            Ok(text) => {
                let _ = self.tx.send(Outbound::Text(text));
            }
            Err(e) => error!(error = %e, "failed to encode registration ack"),
        }
    }

    fn close_with(&self, code: u16, reason: &str) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.tx.send(Outbound::Close(Some((code, reason.to_string()))));
        }
    }
}

impl WorkerSocket for ChannelSocket {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.tx.is_closed()
    }

    fn send(&self, text: String) -> DispatchResult<()> {
        self.tx
            .send(Outbound::Text(text))
            .map_err(|_| DispatchError::websocket("worker connection closed"))
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.tx.send(Outbound::Close(None));
        }
    }
}

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

async fn route_request(State(shared): State<Arc<ServerShared>>, request: Request) -> Response {
    if !is_websocket_upgrade(request.headers()) {
        let handlers = shared.http_handlers();
        return run_chain(&handlers, request).await;
    }

    let path = request.uri().path().to_string();
    let upgrade_token = bearer_token(request.headers()).map(str::to_owned);
    let (mut parts, _body) = request.into_parts();
    let upgrade = match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
        Ok(upgrade) => upgrade,
        Err(rejection) => return rejection.into_response(),
    };

    match shared.endpoint(&path) {
        Some(handler) => {
            debug!(path = %path, "websocket endpoint connection");
            upgrade.on_upgrade(move |socket| handler(socket))
        }
        None => upgrade.on_upgrade(move |socket| serve_worker(shared, socket, upgrade_token)),
    }
}

async fn serve_worker(shared: Arc<ServerShared>, socket: WebSocket, upgrade_token: Option<String>) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = ChannelSocket {
        tx,
        open: Arc::new(AtomicBool::new(true)),
    };

    let writer_open = handle.open.clone();
    let writer = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            match outbound {
                Outbound::Text(text) => {
                    if let Err(e) = sink.send(Message::Text(text.into())).await {
                        debug!(error = %e, "worker socket write failed");
                        break;
                    }
                }
                Outbound::Close(frame) => {
                    let frame = frame.map(|(code, reason)| CloseFrame {
                        code,
                        reason: reason.into(),
                    });
                    let _ = sink.send(Message::Close(frame)).await;
                    break;
                }
            }
        }
        writer_open.store(false, Ordering::SeqCst);
        let _ = sink.close().await;
    });

    let mut registered: Option<(String, String)> = None;

    while let Some(frame) = stream.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                debug!(error = %e, "worker socket read failed");
                break;
            }
        };

        if let Some((worker_id, _)) = &registered {
            shared.pool().record_heartbeat(worker_id);
            match frame {
                Message::Text(text) => shared.route_message(worker_id, text.as_str()),
                Message::Binary(_) => debug!(worker_id = %worker_id, "binary frame ignored"),
                Message::Close(_) => break,
                Message::Ping(_) | Message::Pong(_) => {}
            }
            continue;
        }

        match frame {
            Message::Text(text) => match shared.register(text.as_str(), &handle, upgrade_token.as_deref()) {
                RegistrationOutcome::Accepted {
                    worker_id,
                    session_id,
                } => registered = Some((worker_id, session_id)),
                RegistrationOutcome::Rejected => break,
                RegistrationOutcome::Ignored => {}
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    if let Some((worker_id, session_id)) = registered {
        shared.connection_closed(&worker_id, &session_id);
    }
    handle.close();
    drop(handle);
    let _ = writer.await;
}
