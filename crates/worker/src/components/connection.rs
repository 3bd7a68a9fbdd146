use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::{
    net::TcpStream,
    sync::mpsc,
    task::JoinHandle,
    time::{interval_at, sleep, sleep_until, Instant, MissedTickBehavior},
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{header::AUTHORIZATION, HeaderName, HeaderValue},
        protocol::{frame::coding::CloseCode, CloseFrame},
        Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, trace, warn};

use workerhub_core::{
    BackoffConfig, DispatchError, DispatchResult, EventListeners, HeartbeatConfig, Subscription,
};

use crate::backoff::get_backoff_delay;
use crate::token::TokenProvider;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Close code reported when the link dies without a close handshake.
pub const ABNORMAL_CLOSURE: u16 = 1006;
const NORMAL_CLOSURE: u16 = 1000;
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Construction options for [`ReconnectingWebSocket`].
#[derive(Clone)]
pub struct ConnectionOptions {
    pub url: String,
    pub token_provider: Option<Arc<dyn TokenProvider>>,
    /// Sent on every handshake. `Authorization` is overridden when a token provider is set.
    pub headers: HashMap<String, String>,
    pub backoff: BackoffConfig,
    pub heartbeat: HeartbeatConfig,
    pub connect_timeout: Duration,
}

impl ConnectionOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token_provider: None,
            headers: HashMap::new(),
            backoff: BackoffConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_token_provider(mut self, provider: impl TokenProvider + 'static) -> Self {
        self.token_provider = Some(Arc::new(provider));
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: HeartbeatConfig) -> Self {
        self.heartbeat = heartbeat;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Open,
    Message(Value),
    Close { code: Option<u16>, reason: String },
    Error(String),
}

enum Control {
    Reconnect,
    Disconnect,
}

enum ConnectionEnd {
    Closed,
    Reconnect,
    Disconnect,
}

struct ClientState {
    state: ConnectionState,
    attempt: u32,
    should_reconnect: bool,
    outbound: Option<mpsc::UnboundedSender<Message>>,
    control: Option<mpsc::UnboundedSender<Control>>,
    supervisor: Option<JoinHandle<()>>,
    token: Option<String>,
}

struct Inner {
    options: ConnectionOptions,
    state: Mutex<ClientState>,
    events: EventListeners<ClientEvent>,
}

/// WebSocket client that keeps reconnecting with exponential backoff.
///
/// A supervisor task owns the socket. It fetches a token before every
/// handshake, pings on the heartbeat interval and tears the link down when a
/// pong is late. Sends while disconnected are dropped, not queued.
///
/// The supervisor keeps running after every handle is dropped; call
/// [`disconnect`](Self::disconnect) to end it.
#[derive(Clone)]
pub struct ReconnectingWebSocket {
    inner: Arc<Inner>,
}

#[derive(Clone)]
pub(crate) struct WeakConnection {
    inner: Weak<Inner>,
}

impl WeakConnection {
    pub(crate) fn upgrade(&self) -> Option<ReconnectingWebSocket> {
        self.inner.upgrade().map(|inner| ReconnectingWebSocket { inner })
    }
}

impl ReconnectingWebSocket {
    /// Fails when the backoff or heartbeat settings would stall the supervisor.
    pub fn new(options: ConnectionOptions) -> DispatchResult<Self> {
        options
            .backoff
            .validate()
            .and_then(|_| options.heartbeat.validate())
            .map_err(|e| DispatchError::config_error(e.to_string()))?;

        Ok(Self {
            inner: Arc::new(Inner {
                options,
                state: Mutex::new(ClientState {
                    state: ConnectionState::Disconnected,
                    attempt: 0,
                    should_reconnect: true,
                    outbound: None,
                    control: None,
                    supervisor: None,
                    token: None,
                }),
                events: EventListeners::new(),
            }),
        })
    }

    pub(crate) fn downgrade(&self) -> WeakConnection {
        WeakConnection {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn url(&self) -> &str {
        &self.inner.options.url
    }

    /// Starts the supervisor and re-enables reconnects. Does not open a
    /// second connection while one is connecting or connected.
    pub fn connect(&self) {
        let mut state = self.inner.lock();
        state.should_reconnect = true;
        if state.supervisor.as_ref().is_some_and(|task| !task.is_finished()) {
            debug!(url = %self.inner.options.url, "connect ignored, connection already active");
            return;
        }

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        state.state = ConnectionState::Connecting;
        state.control = Some(control_tx);
        state.supervisor = Some(tokio::spawn(supervise(self.inner.clone(), control_rx)));
    }

    /// Stops reconnecting and closes the current connection, then waits for
    /// the supervisor to exit. Must not be awaited from an event listener.
    pub async fn disconnect(&self) {
        let supervisor = {
            let mut state = self.inner.lock();
            state.should_reconnect = false;
            if let Some(control) = state.control.take() {
                let _ = control.send(Control::Disconnect);
            }
            state.supervisor.take()
        };
        if let Some(task) = supervisor {
            let _ = task.await;
        }
    }

    /// Disables future reconnects but leaves the current connection open.
    pub fn stop_reconnecting(&self) {
        self.inner.lock().should_reconnect = false;
    }

    /// Closes the current connection and opens a new one right away,
    /// fetching a fresh token.
    pub fn reconnect(&self) {
        let mut state = self.inner.lock();
        state.should_reconnect = true;
        let running = state.supervisor.as_ref().is_some_and(|task| !task.is_finished());
        match state.control.clone().filter(|_| running) {
            Some(control) => {
                let _ = control.send(Control::Reconnect);
            }
            None => {
                drop(state);
                self.connect();
            }
        }
    }

    /// Serializes and writes `message` if connected; returns `false` when it was dropped.
    pub fn send<T: Serialize + ?Sized>(&self, message: &T) -> bool {
        let state = self.inner.lock();
        let Some(outbound) = state.outbound.as_ref().filter(|_| state.state == ConnectionState::Connected) else {
            debug!("dropping message while disconnected");
            return false;
        };
        match serde_json::to_string(message) {
            Ok(text) => outbound.send(Message::text(text)).is_ok(),
            Err(e) => {
                warn!(error = %e, "failed to serialize outbound message");
                false
            }
        }
    }

    pub fn connected(&self) -> bool {
        self.inner.lock().state == ConnectionState::Connected
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    /// Consecutive failed attempts since the last successful open.
    pub fn reconnect_attempt(&self) -> u32 {
        self.inner.lock().attempt
    }

    /// Token presented on the most recent handshake.
    pub fn current_token(&self) -> Option<String> {
        self.inner.lock().token.clone()
    }

    pub fn on_event<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ClientEvent) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(listener)
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ConnectionState) {
        self.lock().state = state;
    }

    fn should_reconnect(&self) -> bool {
        self.lock().should_reconnect
    }

    /// Returns the attempt number to back off for and counts it.
    fn next_attempt(&self) -> u32 {
        let mut state = self.lock();
        let attempt = state.attempt;
        state.attempt = state.attempt.saturating_add(1);
        attempt
    }

    async fn open(&self) -> DispatchResult<Socket> {
        let url = &self.options.url;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| DispatchError::config_error(format!("invalid url {url}: {e}")))?;

        let token = match &self.options.token_provider {
            Some(provider) => Some(provider.get_token().await?),
            None => None,
        };

        let headers = request.headers_mut();
        for (name, value) in &self.options.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| DispatchError::config_error(format!("invalid header name {name}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| DispatchError::config_error(format!("invalid header value for {name}: {e}")))?;
            headers.insert(name, value);
        }
        if let Some(token) = &token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|_| DispatchError::authentication("token is not a valid header value"))?;
            headers.insert(AUTHORIZATION, value);
        }
        self.lock().token = token;

        debug!(url = %url, "opening connection");
        let (socket, _response) = tokio::time::timeout(self.options.connect_timeout, connect_async(request))
            .await
            .map_err(|_| DispatchError::Timeout(format!("connecting to {url}")))?
            .map_err(|e| DispatchError::websocket(e.to_string()))?;
        Ok(socket)
    }

    fn deliver(&self, payload: &[u8]) {
        match serde_json::from_slice::<Value>(payload) {
            Ok(value) => self.events.emit(&ClientEvent::Message(value)),
            Err(e) => {
                warn!(error = %e, "dropping frame that is not valid JSON");
                self.events
                    .emit(&ClientEvent::Error(format!("invalid JSON frame: {e}")));
            }
        }
    }

    async fn run_connection(
        &self,
        socket: Socket,
        control: &mut mpsc::UnboundedReceiver<Control>,
    ) -> ConnectionEnd {
        let (mut sink, mut stream) = socket.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
        {
            let mut state = self.lock();
            state.state = ConnectionState::Connected;
            state.attempt = 0;
            state.outbound = Some(outbound_tx);
        }
        info!(url = %self.options.url, "connected");
        self.events.emit(&ClientEvent::Open);

        let heartbeat = &self.options.heartbeat;
        let ping_every = Duration::from_millis(heartbeat.interval_ms);
        let pong_timeout = Duration::from_millis(heartbeat.timeout_ms);
        let mut ping_timer = interval_at(Instant::now() + ping_every, ping_every);
        ping_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut pong_deadline: Option<Instant> = None;

        let (end, code, reason) = loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.deliver(text.as_bytes()),
                    Some(Ok(Message::Binary(data))) => self.deliver(&data),
                    Some(Ok(Message::Pong(_))) => {
                        trace!("pong received");
                        pong_deadline = None;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = frame
                            .map(|f| (Some(u16::from(f.code)), f.reason.as_str().to_string()))
                            .unwrap_or((None, String::new()));
                        break (ConnectionEnd::Closed, code, reason);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "connection read failed");
                        self.events.emit(&ClientEvent::Error(e.to_string()));
                        break (ConnectionEnd::Closed, Some(ABNORMAL_CLOSURE), e.to_string());
                    }
                    None => break (ConnectionEnd::Closed, Some(ABNORMAL_CLOSURE), "connection lost".to_string()),
                },
                Some(message) = outbound_rx.recv() => {
                    if let Err(e) = sink.send(message).await {
                        warn!(error = %e, "connection write failed");
                        self.events.emit(&ClientEvent::Error(e.to_string()));
                        break (ConnectionEnd::Closed, Some(ABNORMAL_CLOSURE), e.to_string());
                    }
                }
                _ = ping_timer.tick() => {
                    if pong_deadline.is_none() {
                        trace!("sending heartbeat ping");
                        if let Err(e) = sink.send(Message::Ping(Vec::new().into())).await {
                            warn!(error = %e, "heartbeat ping failed");
                            break (ConnectionEnd::Closed, Some(ABNORMAL_CLOSURE), e.to_string());
                        }
                        pong_deadline = Some(Instant::now() + pong_timeout);
                    }
                }
                _ = sleep_until(pong_deadline.unwrap_or_else(Instant::now)), if pong_deadline.is_some() => {
                    warn!(timeout_ms = heartbeat.timeout_ms, "no pong within timeout, terminating connection");
                    // dropping both halves below closes the TCP stream with no close handshake
                    break (ConnectionEnd::Closed, Some(ABNORMAL_CLOSURE), "heartbeat timeout".to_string());
                }
                command = control.recv() => {
                    let (end, reason) = match command {
                        Some(Control::Reconnect) => (ConnectionEnd::Reconnect, "reconnect requested"),
                        Some(Control::Disconnect) | None => (ConnectionEnd::Disconnect, "client disconnect"),
                    };
                    let frame = CloseFrame {
                        code: CloseCode::Normal,
                        reason: reason.into(),
                    };
                    let _ = tokio::time::timeout(CLOSE_GRACE, async {
                        let _ = sink.send(Message::Close(Some(frame))).await;
                        let _ = sink.close().await;
                    })
                    .await;
                    break (end, Some(NORMAL_CLOSURE), reason.to_string());
                }
            }
        };

        drop(sink);
        drop(stream);
        {
            let mut state = self.lock();
            state.outbound = None;
            state.state = ConnectionState::Disconnected;
        }
        info!(url = %self.options.url, code = ?code, reason = %reason, "connection closed");
        self.events.emit(&ClientEvent::Close { code, reason });
        end
    }

    fn finish(&self) {
        let mut state = self.lock();
        state.state = ConnectionState::Disconnected;
        state.outbound = None;
        state.control = None;
    }
}

async fn supervise(inner: Arc<Inner>, mut control: mpsc::UnboundedReceiver<Control>) {
    loop {
        inner.set_state(ConnectionState::Connecting);

        let opened = tokio::select! {
            opened = inner.open() => opened,
            command = control.recv() => match command {
                Some(Control::Reconnect) => continue,
                Some(Control::Disconnect) | None => break,
            },
        };

        let end = match opened {
            Ok(socket) => inner.run_connection(socket, &mut control).await,
            Err(e) => {
                warn!(url = %inner.options.url, error = %e, "connection attempt failed");
                inner.events.emit(&ClientEvent::Error(e.to_string()));
                ConnectionEnd::Closed
            }
        };

        match end {
            ConnectionEnd::Disconnect => break,
            ConnectionEnd::Reconnect => continue,
            ConnectionEnd::Closed => {}
        }

        if !inner.should_reconnect() {
            info!(url = %inner.options.url, "reconnection disabled, staying disconnected");
            break;
        }

        let attempt = inner.next_attempt();
        let delay = get_backoff_delay(attempt, &inner.options.backoff);
        inner.set_state(ConnectionState::Connecting);
        info!(
            url = %inner.options.url,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "scheduling reconnect"
        );

        tokio::select! {
            _ = sleep(delay) => {}
            command = control.recv() => match command {
                Some(Control::Reconnect) => {}
                Some(Control::Disconnect) | None => break,
            },
        }

        if !inner.should_reconnect() {
            break;
        }
    }

    inner.finish();
}
