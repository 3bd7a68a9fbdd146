use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use workerhub_core::{
    message_type, ControlMessage, DispatchResult, EventListeners, RegistrationAck,
    RequestTracker, Subscription, WorkerCapabilities, WorkerConfig, WorkerRegistration,
    WORKER_REGISTRATION_ACK,
};

use super::connection::{ClientEvent, ConnectionOptions, ReconnectingWebSocket};
use crate::token::StaticTokenProvider;

type MessageHandler = Arc<dyn Fn(&Value) + Send + Sync>;

struct AgentShared {
    worker_id: String,
    worker_name: String,
    capabilities: WorkerCapabilities,
    session_id: Mutex<Option<String>>,
    handlers: RwLock<HashMap<String, MessageHandler>>,
    registered: EventListeners<String>,
    tracker: RequestTracker,
}

/// Worker-side session with the dispatcher.
///
/// Registers on every (re)connect, routes dispatcher messages by `type` and
/// gates new work through a [`RequestTracker`] so a draining worker refuses it.
#[derive(Clone)]
pub struct WorkerAgent {
    shared: Arc<AgentShared>,
    connection: ReconnectingWebSocket,
}

impl WorkerAgent {
    pub fn new(
        worker_id: impl Into<String>,
        worker_name: impl Into<String>,
        capabilities: WorkerCapabilities,
        options: ConnectionOptions,
    ) -> DispatchResult<Self> {
        let shared = Arc::new(AgentShared {
            worker_id: worker_id.into(),
            worker_name: worker_name.into(),
            capabilities,
            session_id: Mutex::new(None),
            handlers: RwLock::new(HashMap::new()),
            registered: EventListeners::new(),
            tracker: RequestTracker::new(),
        });
        let connection = ReconnectingWebSocket::new(options)?;

        let listener_shared = shared.clone();
        let weak = connection.downgrade();
        let _ = connection.on_event(move |event| {
            if let Some(connection) = weak.upgrade() {
                listener_shared.handle_event(&connection, event);
            }
        });

        Ok(Self { shared, connection })
    }

    pub fn from_config(config: &WorkerConfig) -> DispatchResult<Self> {
        let mut options = ConnectionOptions::new(config.server_url.clone())
            .with_backoff(config.backoff.clone())
            .with_heartbeat(config.heartbeat.clone());
        options.headers = config.headers.clone();
        if let Some(token) = &config.auth_token {
            options = options.with_token_provider(StaticTokenProvider::new(token.clone()));
        }
        Self::new(
            config.worker_id.clone(),
            config.worker_name.clone(),
            config.capabilities(),
            options,
        )
    }

    pub fn worker_id(&self) -> &str {
        &self.shared.worker_id
    }

    pub fn start(&self) {
        info!(worker_id = %self.shared.worker_id, url = %self.connection.url(), "starting worker agent");
        self.connection.connect();
    }

    pub async fn stop(&self) {
        self.connection.disconnect().await;
        *self.shared.session() = None;
        info!(worker_id = %self.shared.worker_id, "worker agent stopped");
    }

    /// Handles dispatcher messages of `message_type`. Replaces any earlier handler for that type.
    pub fn on_message<F>(&self, message_type: impl Into<String>, handler: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.shared
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(message_type.into(), Arc::new(handler));
    }

    /// Fires with the session id after every accepted registration.
    pub fn on_registered<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.shared
            .registered
            .subscribe(move |session_id: &String| listener(session_id.as_str()))
    }

    pub fn session_id(&self) -> Option<String> {
        self.shared.session().clone()
    }

    pub fn is_registered(&self) -> bool {
        self.connection.connected() && self.shared.session().is_some()
    }

    pub fn send<T: Serialize + ?Sized>(&self, message: &T) -> bool {
        self.connection.send(message)
    }

    pub fn connection(&self) -> &ReconnectingWebSocket {
        &self.connection
    }

    pub fn tracker(&self) -> &RequestTracker {
        &self.shared.tracker
    }

    /// Admits one unit of work unless the agent is draining. The permit
    /// completes the request when dropped.
    pub fn begin_request(&self) -> Option<RequestPermit> {
        self.shared.tracker.try_accept().then(|| RequestPermit {
            shared: self.shared.clone(),
        })
    }

    /// Stops admitting work and waits up to `timeout` for in-flight work.
    /// Returns whether everything finished in time.
    pub async fn drain(&self, reason: &str, timeout: Duration) -> bool {
        self.shared.tracker.start_draining(reason);
        let drained = tokio::time::timeout(timeout, self.shared.tracker.wait_drained())
            .await
            .is_ok();
        if !drained {
            warn!(
                worker_id = %self.shared.worker_id,
                active = self.shared.tracker.active(),
                "drain timed out with work still in flight"
            );
        }
        drained
    }
}

impl AgentShared {
    fn session(&self) -> MutexGuard<'_, Option<String>> {
        self.session_id.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handle_event(&self, connection: &ReconnectingWebSocket, event: &ClientEvent) {
        match event {
            ClientEvent::Open => self.register(connection),
            ClientEvent::Message(message) => self.route(connection, message),
            ClientEvent::Close { .. } => {
                *self.session() = None;
            }
            ClientEvent::Error(e) => debug!(worker_id = %self.worker_id, error = %e, "connection error"),
        }
    }

    fn register(&self, connection: &ReconnectingWebSocket) {
        *self.session() = None;
        let registration = ControlMessage::WorkerRegistration(WorkerRegistration {
            worker_id: self.worker_id.clone(),
            worker_name: self.worker_name.clone(),
            capabilities: self.capabilities.clone(),
            auth_token: connection.current_token(),
        });
        if connection.send(&registration) {
            debug!(worker_id = %self.worker_id, "registration sent");
        } else {
            warn!(worker_id = %self.worker_id, "could not send registration");
        }
    }

    fn route(&self, connection: &ReconnectingWebSocket, message: &Value) {
        match message_type(message) {
            Some(WORKER_REGISTRATION_ACK) => self.handle_ack(connection, message),
            Some(kind) => {
                let handler = self
                    .handlers
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get(kind)
                    .cloned();
                match handler {
                    Some(handler) => handler(message),
                    None => debug!(worker_id = %self.worker_id, kind, "no handler for message type"),
                }
            }
            None => debug!(worker_id = %self.worker_id, "message without type ignored"),
        }
    }

    fn handle_ack(&self, connection: &ReconnectingWebSocket, message: &Value) {
        let ack: RegistrationAck = match serde_json::from_value(message.clone()) {
            Ok(ack) => ack,
            Err(e) => {
                warn!(error = %e, "malformed registration ack");
                return;
            }
        };

        let auth_failure = ack.is_auth_failure();
        match (ack.success, ack.session_id) {
            (true, Some(session_id)) => {
                info!(worker_id = %self.worker_id, session_id = %session_id, "registered with dispatcher");
                *self.session() = Some(session_id.clone());
                self.registered.emit(&session_id);
            }
            (true, None) => warn!(worker_id = %self.worker_id, "registration ack without session id"),
            (false, _) if auth_failure => {
                error!(
                    worker_id = %self.worker_id,
                    error = ?ack.error,
                    "registration rejected for authentication, not reconnecting"
                );
                connection.stop_reconnecting();
            }
            (false, _) => warn!(worker_id = %self.worker_id, error = ?ack.error, "registration rejected"),
        }
    }
}

/// Admission for one unit of work, released on drop.
pub struct RequestPermit {
    shared: Arc<AgentShared>,
}

impl Drop for RequestPermit {
    fn drop(&mut self) {
        self.shared.tracker.complete();
    }
}

impl std::fmt::Debug for RequestPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestPermit")
            .field("worker_id", &self.shared.worker_id)
            .finish()
    }
}
