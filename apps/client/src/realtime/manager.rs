//! Connection manager: owns the single realtime transport.
//!
//! Lifecycle: Closed → Connecting → Open → Closed, with a fixed-delay,
//! bounded reconnect on unexpected closes. A normal closure (1000), an
//! authentication rejection, or `disconnect()` never reconnects.
//!
//! Every transport gets a session number. Callbacks from a transport whose
//! session is no longer current are ignored, so a late close or message from
//! a superseded socket can never trigger a reconnect or reach new handlers.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::credentials::CredentialSource;
use crate::errors::ConnectError;
use crate::models::envelope::Decoded;
use crate::models::{Envelope, Topic};
use crate::realtime::registry::{Handler, Subscription, SubscriptionId, TopicRegistry};
use crate::realtime::transport::{
    CloseInfo, Connector, Inbound, Outbound, TransportHandle, NORMAL_CLOSURE, POLICY_VIOLATION,
};

/// Lower-cased substrings of a close reason that mean the credential was refused.
const AUTH_FAILURE_MARKERS: [&str; 6] = [
    "unauthorized",
    "unauthenticated",
    "invalid token",
    "token expired",
    "expired token",
    "未认证",
];

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Connecting,
    Open,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    /// Fixed delay before every attempt; there is no backoff.
    pub interval: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            interval: Duration::from_millis(3000),
        }
    }
}

/// Lifecycle notifications for callers that want to surface connectivity.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Connected,
    Closed { code: u16, reason: String },
    ReconnectScheduled { attempt: u32, delay: Duration },
    /// The retry budget is spent; only an explicit `connect()` will try again.
    ReconnectExhausted { attempts: u32 },
    /// The credential was refused; a fresh token and `connect()` are required.
    AuthRejected { code: u16, reason: String },
}

struct ConnState {
    state: ConnectionState,
    reconnect_attempts: u32,
    manually_closed: bool,
    session: u64,
    outbound: Option<mpsc::UnboundedSender<Outbound>>,
    reconnect_task: Option<JoinHandle<()>>,
}

struct Inner {
    ws_url: String,
    policy: ReconnectPolicy,
    credentials: Arc<dyn CredentialSource>,
    connector: Arc<dyn Connector>,
    conn: Mutex<ConnState>,
    registry: Mutex<TopicRegistry>,
    events: broadcast::Sender<ConnectionEvent>,
}

/// Cheap to clone; all clones drive the same connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(
        ws_url: impl Into<String>,
        policy: ReconnectPolicy,
        credentials: Arc<dyn CredentialSource>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                ws_url: ws_url.into(),
                policy,
                credentials,
                connector,
                conn: Mutex::new(ConnState {
                    state: ConnectionState::Closed,
                    reconnect_attempts: 0,
                    manually_closed: false,
                    session: 0,
                    outbound: None,
                    reconnect_task: None,
                }),
                registry: Mutex::new(TopicRegistry::default()),
                events,
            }),
        }
    }

    /// Opens the connection. Resolves immediately if already open.
    pub async fn connect(&self) -> Result<(), ConnectError> {
        self.inner.connect().await
    }

    /// Closes the connection for good: clears every subscription and
    /// cancels any pending reconnect.
    pub fn disconnect(&self) {
        self.inner.disconnect();
    }

    pub fn subscribe<F>(&self, topic: Topic, handler: F) -> Subscription
    where
        F: Fn(&Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.inner.lock_registry().insert(topic, Arc::new(handler));
        debug!(%topic, "Handler subscribed");

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        Subscription::new(topic, id, move |topic, id| {
            if let Some(inner) = weak.upgrade() {
                inner.lock_registry().remove(topic, id);
            }
        })
    }

    /// Subscribes with `data` decoded into `T`. Payloads that do not decode
    /// are logged and skipped for this handler only.
    pub fn subscribe_typed<T, F>(&self, topic: Topic, handler: F) -> Subscription
    where
        T: DeserializeOwned + 'static,
        F: Fn(T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.subscribe(topic, move |data: &Value| {
            match T::deserialize(data) {
                Ok(payload) => handler(payload),
                Err(e) => {
                    warn!(%topic, "Dropping malformed payload: {e}");
                    Ok(())
                }
            }
        })
    }

    /// Removes one registration; unknown ids are ignored.
    #[allow(dead_code)]
    pub fn unsubscribe(&self, topic: Topic, id: SubscriptionId) -> bool {
        self.inner.lock_registry().remove(topic, id)
    }

    #[allow(dead_code)]
    pub fn unsubscribe_all(&self, topic: Topic) {
        self.inner.lock_registry().remove_topic(topic);
    }

    #[allow(dead_code)]
    pub fn clear_all_subscriptions(&self) {
        self.inner.lock_registry().clear();
        info!("Cleared all realtime subscriptions");
    }

    /// Best-effort send. Dropped with a warning unless the connection is open.
    #[allow(dead_code)]
    pub fn send<T: Serialize>(&self, topic: Topic, data: T) {
        let text = match serde_json::to_string(&Envelope::now(topic, data)) {
            Ok(text) => text,
            Err(e) => {
                warn!(%topic, "Could not serialize outbound message: {e}");
                return;
            }
        };

        let conn = self.inner.lock_conn();
        match (&conn.state, &conn.outbound) {
            (ConnectionState::Open, Some(tx)) => {
                if tx.send(Outbound::Text(text)).is_err() {
                    warn!(%topic, "Transport went away; message dropped");
                }
            }
            _ => warn!(%topic, "Realtime connection not open; message dropped"),
        }
    }

    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock_conn().state
    }

    #[allow(dead_code)]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    #[allow(dead_code)]
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.lock_conn().reconnect_attempts
    }

    #[allow(dead_code)]
    pub fn handler_count(&self, topic: Topic) -> usize {
        self.inner.lock_registry().handler_count(topic)
    }
}

impl Inner {
    fn lock_conn(&self) -> MutexGuard<'_, ConnState> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_registry(&self) -> MutexGuard<'_, TopicRegistry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: ConnectionEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    async fn connect(self: &Arc<Self>) -> Result<(), ConnectError> {
        let (session, url) = {
            let mut conn = self.lock_conn();
            match conn.state {
                ConnectionState::Open => return Ok(()),
                ConnectionState::Connecting => return Err(ConnectError::AlreadyConnecting),
                ConnectionState::Closed => {}
            }

            let Some(token) = self.credentials.token() else {
                error!("No bearer token available; realtime connection not attempted");
                return Err(ConnectError::MissingCredential);
            };

            if let Some(pending) = conn.reconnect_task.take() {
                pending.abort();
            }
            conn.state = ConnectionState::Connecting;
            conn.manually_closed = false;
            conn.session += 1;
            (conn.session, build_connect_url(&self.ws_url, &token))
        };

        info!(url = %redact_token(&url), "Opening realtime connection");
        let mut pending = PendingOpen {
            inner: self,
            session,
            armed: true,
        };
        let result = self.connector.open(&url).await;
        pending.armed = false;

        let mut conn = self.lock_conn();
        if conn.session != session {
            // disconnect() ran while the socket was opening.
            if let Ok(handle) = result {
                let _ = handle
                    .outbound
                    .send(Outbound::Close(CloseInfo::normal("Client disconnect")));
            }
            return Err(ConnectError::Aborted);
        }

        match result {
            Ok(TransportHandle { outbound, inbound }) => {
                conn.state = ConnectionState::Open;
                conn.reconnect_attempts = 0;
                conn.outbound = Some(outbound);
                drop(conn);

                tokio::spawn(Arc::clone(self).read_loop(session, inbound));
                info!("Realtime connection established");
                self.emit(ConnectionEvent::Connected);
                Ok(())
            }
            Err(e) => {
                conn.state = ConnectionState::Closed;
                drop(conn);

                error!("Realtime connection failed: {e}");
                if let ConnectError::AuthRejected { status } = &e {
                    self.emit(ConnectionEvent::AuthRejected {
                        code: *status,
                        reason: e.to_string(),
                    });
                }
                Err(e)
            }
        }
    }

    fn disconnect(&self) {
        let outbound = {
            let mut conn = self.lock_conn();
            conn.manually_closed = true;
            conn.state = ConnectionState::Closed;
            conn.session += 1;
            if let Some(pending) = conn.reconnect_task.take() {
                pending.abort();
            }
            conn.outbound.take()
        };

        self.lock_registry().clear();

        if let Some(tx) = outbound {
            let _ = tx.send(Outbound::Close(CloseInfo::normal("Client disconnect")));
        }
        info!("Realtime connection closed and all subscriptions cleared");
    }

    async fn read_loop(self: Arc<Self>, session: u64, mut inbound: mpsc::UnboundedReceiver<Inbound>) {
        while let Some(frame) = inbound.recv().await {
            match frame {
                Inbound::Text(text) => {
                    if self.lock_conn().session != session {
                        debug!("Ignoring frame from a superseded transport");
                        continue;
                    }
                    self.dispatch(&text);
                }
                Inbound::Closed(close) => {
                    self.handle_close(session, close);
                    return;
                }
            }
        }
        self.handle_close(session, CloseInfo::abnormal("transport dropped"));
    }

    fn dispatch(&self, text: &str) {
        let envelope = match Envelope::decode(text) {
            Ok(Decoded::Message(envelope)) => envelope,
            Ok(Decoded::UnknownTopic(kind)) => {
                debug!(kind = %kind, "Dropping message for unknown topic");
                return;
            }
            Err(e) => {
                warn!("Dropping malformed realtime message: {e}");
                return;
            }
        };

        if let Some(action) = envelope.action_topic() {
            if action != envelope.topic {
                self.invoke(action, &envelope.data);
            }
        }
        self.invoke(envelope.topic, &envelope.data);
    }

    /// Runs a topic's handlers in order. One failing handler never stops the rest.
    fn invoke(&self, topic: Topic, data: &Value) {
        let handlers: Vec<Handler> = self.lock_registry().handlers(topic);
        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(data))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(%topic, "Realtime handler failed: {e:#}"),
                Err(_) => error!(%topic, "Realtime handler panicked"),
            }
        }
    }

    fn handle_close(self: &Arc<Self>, session: u64, close: CloseInfo) {
        let mut conn = self.lock_conn();
        if conn.session != session {
            return;
        }
        conn.state = ConnectionState::Closed;
        conn.outbound = None;

        info!(code = close.code, reason = %close.reason, "Realtime connection closed");
        self.emit(ConnectionEvent::Closed {
            code: close.code,
            reason: close.reason.clone(),
        });

        if conn.manually_closed {
            return;
        }
        if is_auth_failure(&close) {
            warn!("Realtime credential rejected by server; not reconnecting");
            self.emit(ConnectionEvent::AuthRejected {
                code: close.code,
                reason: close.reason,
            });
            return;
        }
        if close.code == NORMAL_CLOSURE {
            return;
        }
        self.schedule_reconnect(&mut conn);
    }

    /// A reconnect attempt that failed to open counts as another unexpected close.
    fn on_reconnect_failed(self: &Arc<Self>) {
        let mut conn = self.lock_conn();
        if conn.manually_closed || conn.state != ConnectionState::Closed {
            return;
        }
        self.schedule_reconnect(&mut conn);
    }

    fn schedule_reconnect(self: &Arc<Self>, conn: &mut ConnState) {
        if conn.reconnect_attempts >= self.policy.max_attempts {
            warn!(
                attempts = conn.reconnect_attempts,
                "Reconnect attempts exhausted; giving up"
            );
            self.emit(ConnectionEvent::ReconnectExhausted {
                attempts: conn.reconnect_attempts,
            });
            return;
        }

        conn.reconnect_attempts += 1;
        let attempt = conn.reconnect_attempts;
        let delay = self.policy.interval;
        info!(
            "Reconnecting in {}ms ({attempt}/{})",
            delay.as_millis(),
            self.policy.max_attempts
        );
        self.emit(ConnectionEvent::ReconnectScheduled { attempt, delay });

        let session = conn.session;
        conn.reconnect_task = Some(tokio::spawn(Arc::clone(self).reconnect_after(
            delay, session, attempt,
        )));
    }

    async fn reconnect_after(self: Arc<Self>, delay: Duration, session: u64, attempt: u32) {
        tokio::time::sleep(delay).await;
        {
            let mut conn = self.lock_conn();
            // disconnect() or a caller's connect() may have won the race with the timer.
            if conn.manually_closed || conn.session != session {
                debug!("Reconnect attempt {attempt} superseded");
                return;
            }
            // Detach our own handle so connect() does not abort this task.
            conn.reconnect_task = None;
        }
        match self.connect().await {
            Ok(()) => {}
            Err(e) if e.is_retryable() => {
                warn!("Reconnect attempt {attempt} failed: {e}");
                self.on_reconnect_failed();
            }
            Err(e) => warn!("Reconnect abandoned: {e}"),
        }
    }
}

/// Armed while `connect()` awaits the connector. If the future is dropped
/// mid-open, a `Connecting` state it left behind is reset to `Closed`.
struct PendingOpen<'a> {
    inner: &'a Inner,
    session: u64,
    armed: bool,
}

impl Drop for PendingOpen<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut conn = self.inner.lock_conn();
        if conn.session == self.session && conn.state == ConnectionState::Connecting {
            conn.state = ConnectionState::Closed;
            debug!("Connect attempt dropped before the transport opened");
        }
    }
}

fn is_auth_failure(close: &CloseInfo) -> bool {
    let reason = close.reason.to_lowercase();
    close.code == POLICY_VIOLATION || AUTH_FAILURE_MARKERS.iter().any(|m| reason.contains(m))
}

/// `<base>?token=<urlencoded>`, appending with `&` when the base already has a query.
pub fn build_connect_url(base: &str, token: &str) -> String {
    let separator = if base.contains('?') { '&' } else { '?' };
    format!("{base}{separator}token={}", urlencoding::encode(token))
}

/// Connect URL with the token value masked, for logs.
pub fn redact_token(url: &str) -> String {
    let Some(start) = url.find("token=").map(|i| i + "token=".len()) else {
        return url.to_string();
    };
    let end = url[start..].find('&').map_or(url.len(), |i| start + i);
    format!("{}***{}", &url[..start], &url[end..])
}
