//! Connection lifecycle coordinator
//!
//! One [`ConnectionCoordinator`] exists per connection handle. It owns the
//! protocol engine for that handle and is the only place the handle's
//! [`ConnectionState`] changes. Caller operations carry an [`ActivityToken`] and
//! are answered on the handle's event sink as [`ServiceEvent::ActionComplete`],
//! so no failure ever crosses back into the caller synchronously.
//!
//! Inbound messages are written to the [`MessageStore`] before anything else and
//! are only handed over live while `Connected`. Anything that arrives while the
//! session is still being established stays in the store and is handed over by
//! the backlog flush, which runs under the same lock as the transition to
//! `Connected`.

use crate::engine::{DeliveryToken, EngineEvent, EngineFactory, ProtocolEngine};
use crate::error::ServiceError;
use crate::message::{ActivityToken, ConnectOptions, ConnectionHandle, MessageId, MqttMessage, QoS};
use crate::observability::metrics::metrics;
use crate::ping::{PingScheduler, WakeLock};
use crate::store::MessageStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

/// Maximum number of entries kept in a connection's history log
pub const HISTORY_LIMIT: usize = 100;

/// Lifecycle state of one connection handle
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    /// Never connected
    None,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
    /// The last caller-initiated connect failed
    Error(String),
}

/// Events a coordinator reports to whoever owns the handle
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceEvent {
    /// A caller operation finished
    ActionComplete {
        token: ActivityToken,
        result: Result<(), ServiceError>,
    },
    MessageArrived {
        id: MessageId,
        topic: String,
        message: MqttMessage,
    },
    /// An established session broke. Sent at most once per session.
    ConnectionLost { cause: String },
    /// The broker completed the QoS flow of an earlier publish
    DeliveryComplete {
        token: ActivityToken,
        topic: String,
        message: MqttMessage,
    },
    ConnectComplete { reconnect: bool, server_uri: String },
}

pub type EventSink = mpsc::UnboundedSender<ServiceEvent>;

/// In-flight publish waiting for protocol-level completion
#[derive(Debug, Clone)]
pub struct PendingDelivery {
    pub topic: String,
    pub message: MqttMessage,
    pub token: ActivityToken,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub event: String,
}

/// Point-in-time view of a connection, for diagnostics and the health endpoint
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionRecord {
    pub handle: ConnectionHandle,
    pub server_uri: String,
    pub client_id: String,
    pub state: ConnectionState,
    pub clean_session: Option<bool>,
    pub subscriptions: BTreeMap<String, QoS>,
    pub pending_deliveries: usize,
    pub history: Vec<HistoryEntry>,
}

struct Inner {
    state: ConnectionState,
    is_connecting: bool,
    /// Snapshot from the last caller connect, reused verbatim on reconnect
    options: Option<ConnectOptions>,
    /// Clean-session flag of the last session that reached `Connected`
    last_session_clean: Option<bool>,
    user_disconnected: bool,
    closed: bool,
    connect_waiters: Vec<ActivityToken>,
    deferred_disconnects: Vec<(ActivityToken, Option<Duration>)>,
    /// Connects requested while a disconnect was still releasing the engine
    deferred_connects: Vec<(ActivityToken, ConnectOptions)>,
    pending_deliveries: HashMap<DeliveryToken, PendingDelivery>,
    subscriptions: BTreeMap<String, QoS>,
    history: VecDeque<HistoryEntry>,
    sink: Option<EventSink>,
}

impl Inner {
    fn emit(&self, event: ServiceEvent) {
        match &self.sink {
            Some(sink) => {
                if sink.send(event).is_err() {
                    debug!("Event sink closed, dropping event");
                }
            }
            None => debug!("No event sink attached, dropping event"),
        }
    }

    fn complete(&self, token: ActivityToken, result: Result<(), ServiceError>) {
        self.emit(ServiceEvent::ActionComplete { token, result });
    }

    fn note(&mut self, event: impl Into<String>) {
        if self.history.len() == HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back(HistoryEntry {
            timestamp: Utc::now(),
            event: event.into(),
        });
    }

    fn clean_session(&self) -> bool {
        self.options.as_ref().is_some_and(|o| o.clean_session)
    }

    /// Forget publishes of a session the engine will never complete
    fn prune_deliveries(&mut self, handle: &ConnectionHandle, reason: &str) {
        let count = self.pending_deliveries.len();
        if count == 0 {
            return;
        }
        self.pending_deliveries.clear();
        debug!(handle = %handle, count, reason, "Dropped pending deliveries");
        self.note(format!("dropped {count} pending deliveries ({reason})"));
    }
}

/// Owns one protocol engine and drives the lifecycle of one connection handle
pub struct ConnectionCoordinator {
    handle: ConnectionHandle,
    server_uri: String,
    client_id: String,
    store: Arc<dyn MessageStore>,
    engine: Arc<dyn ProtocolEngine>,
    ping: PingScheduler,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<ConnectionState>,
    pump: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionCoordinator {
    /// Create the coordinator and its engine. Must be called inside a tokio runtime.
    pub fn create(
        handle: ConnectionHandle,
        server_uri: &str,
        client_id: &str,
        store: Arc<dyn MessageStore>,
        factory: &dyn EngineFactory,
        wake_lock: Arc<dyn WakeLock>,
    ) -> Result<Arc<Self>, ServiceError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let engine = factory
            .create(server_uri, client_id, events_tx)
            .map_err(|e| ServiceError::engine(&handle, e))?;
        let (state_tx, _) = watch::channel(ConnectionState::None);

        let coordinator = Arc::new(Self {
            ping: PingScheduler::new(handle.clone(), engine.clone(), wake_lock),
            handle,
            server_uri: server_uri.to_string(),
            client_id: client_id.to_string(),
            store,
            engine,
            inner: Mutex::new(Inner {
                state: ConnectionState::None,
                is_connecting: false,
                options: None,
                last_session_clean: None,
                user_disconnected: false,
                closed: false,
                connect_waiters: Vec::new(),
                deferred_disconnects: Vec::new(),
                deferred_connects: Vec::new(),
                pending_deliveries: HashMap::new(),
                subscriptions: BTreeMap::new(),
                history: VecDeque::new(),
                sink: None,
            }),
            state_tx,
            pump: std::sync::Mutex::new(None),
        });

        let pump = tokio::spawn(Self::pump(Arc::downgrade(&coordinator), events_rx));
        if let Ok(mut slot) = coordinator.pump.lock() {
            *slot = Some(pump);
        }

        debug!(handle = %coordinator.handle, "Connection coordinator created");
        Ok(coordinator)
    }

    async fn pump(weak: Weak<Self>, mut events: mpsc::UnboundedReceiver<EngineEvent>) {
        while let Some(event) = events.recv().await {
            let Some(coordinator) = weak.upgrade() else {
                break;
            };
            coordinator.handle_engine_event(event).await;
        }
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    pub fn server_uri(&self) -> &str {
        &self.server_uri
    }

    /// Current state without taking the coordinator lock
    pub fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    /// Watch state transitions
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn ping_scheduler(&self) -> &PingScheduler {
        &self.ping
    }

    /// Route events for this handle to `sink`, replacing any previous sink
    pub async fn attach(&self, sink: EventSink) {
        self.inner.lock().await.sink = Some(sink);
    }

    fn transition(&self, inner: &mut Inner, state: ConnectionState) {
        debug!(handle = %self.handle, from = ?inner.state, to = ?state, "State transition");
        let entry = format!("{:?} -> {:?}", inner.state, state);
        inner.note(entry);
        inner.state = state.clone();
        self.state_tx.send_replace(state);
    }

    fn purge(&self, inner: &mut Inner) {
        match self.store.clear(Some(&self.handle)) {
            Ok(count) => {
                if count > 0 {
                    info!(handle = %self.handle, count, "Purged buffered messages for clean session");
                }
                inner.note(format!("purged {count} buffered messages"));
            }
            Err(e) => {
                metrics().record_store_failure();
                warn!(handle = %self.handle, "Failed to purge buffered messages: {}", e);
            }
        }
    }

    /// Start a caller-initiated connect. The outcome is reported for `token`.
    pub async fn connect(&self, token: ActivityToken, options: ConnectOptions) {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            inner.complete(token, Err(ServiceError::InvalidHandle(self.handle.to_string())));
            return;
        }
        if inner.is_connecting {
            debug!(handle = %self.handle, %token, "Connect already in flight, waiting on its outcome");
            inner.connect_waiters.push(token);
            return;
        }
        if inner.state == ConnectionState::Connected {
            debug!(handle = %self.handle, %token, "Already connected");
            inner.complete(token, Ok(()));
            return;
        }
        if inner.state == ConnectionState::Disconnecting {
            info!(handle = %self.handle, %token, "Connect deferred until disconnect resolves");
            inner.note("connect deferred");
            inner.deferred_connects.push((token, options));
            return;
        }

        inner.is_connecting = true;
        inner.user_disconnected = false;
        inner.connect_waiters.push(token);
        // a clean start or changed options replaces the engine session
        if options.clean_session || inner.options.as_ref() != Some(&options) {
            inner.prune_deliveries(&self.handle, "session replaced");
        }
        inner.options = Some(options.clone());
        inner.note(format!(
            "connect requested (clean_session={}, keep_alive={}s)",
            options.clean_session,
            options.keep_alive.as_secs()
        ));
        self.transition(&mut inner, ConnectionState::Connecting);
        if options.clean_session {
            self.purge(&mut inner);
        }
        drop(inner);

        metrics().record_connect_attempt(false);
        self.establish(false, options).await;
    }

    /// Re-establish a dropped persistent session with the captured options.
    ///
    /// Returns whether an attempt was started. Only a handle whose last session
    /// used clean-session=false, that is `Disconnected`, not already connecting
    /// and not explicitly disconnected by its owner qualifies.
    pub async fn reconnect(&self) -> bool {
        let mut inner = self.inner.lock().await;
        let eligible = !inner.closed
            && !inner.is_connecting
            && !inner.user_disconnected
            && inner.state == ConnectionState::Disconnected
            && inner.last_session_clean == Some(false);
        let options = match (eligible, inner.options.clone()) {
            (true, Some(options)) => options,
            _ => {
                debug!(handle = %self.handle, state = ?inner.state, "Not a reconnect candidate");
                return false;
            }
        };

        inner.is_connecting = true;
        inner.note("reconnect requested");
        self.transition(&mut inner, ConnectionState::Connecting);
        drop(inner);

        info!(handle = %self.handle, "Reconnecting persistent session");
        metrics().record_connect_attempt(true);
        self.establish(true, options).await;
        true
    }

    async fn establish(&self, reconnect: bool, options: ConnectOptions) {
        let span = crate::lifecycle_span!(handle = %self.handle, reconnect);
        let result = self.engine.connect(&options).instrument(span).await;
        match result {
            Ok(()) => self.on_connected(reconnect, &options).await,
            Err(e) => {
                let error = ServiceError::engine(&self.handle, e);
                self.on_connect_failed(reconnect, error).await;
            }
        }
    }

    async fn on_connected(&self, reconnect: bool, options: &ConnectOptions) {
        let mut inner = self.inner.lock().await;
        inner.is_connecting = false;
        if inner.closed {
            drop(inner);
            debug!(handle = %self.handle, "Handle closed while connecting, dropping session");
            let _ = self.engine.disconnect(None).await;
            return;
        }

        inner.last_session_clean = Some(options.clean_session);
        self.transition(&mut inner, ConnectionState::Connected);
        for token in std::mem::take(&mut inner.connect_waiters) {
            inner.complete(token, Ok(()));
        }
        inner.emit(ServiceEvent::ConnectComplete {
            reconnect,
            server_uri: self.server_uri.clone(),
        });

        match self.store.all_arrived(Some(&self.handle)) {
            Ok(backlog) => {
                if !backlog.is_empty() {
                    info!(handle = %self.handle, count = backlog.len(), "Redelivering buffered messages");
                    metrics().record_messages_redelivered(backlog.len());
                }
                for stored in backlog {
                    inner.emit(ServiceEvent::MessageArrived {
                        id: stored.id,
                        topic: stored.topic,
                        message: stored.message,
                    });
                }
            }
            Err(e) => {
                metrics().record_store_failure();
                warn!(handle = %self.handle, "Failed to read buffered messages: {}", e);
            }
        }
        let deferred = std::mem::take(&mut inner.deferred_disconnects);
        drop(inner);

        metrics().record_connection_established();
        self.ping.start(options.keep_alive);
        info!(handle = %self.handle, reconnect, "Connected");

        for (token, quiesce) in deferred {
            self.disconnect(token, quiesce).await;
        }
    }

    async fn on_connect_failed(&self, reconnect: bool, error: ServiceError) {
        let mut inner = self.inner.lock().await;
        inner.is_connecting = false;
        inner.note(format!("connect failed: {error}"));
        // a failed reconnect leaves the handle a reconnect candidate
        let next = if reconnect {
            ConnectionState::Disconnected
        } else {
            ConnectionState::Error(error.to_string())
        };
        self.transition(&mut inner, next);
        for token in std::mem::take(&mut inner.connect_waiters) {
            inner.complete(token, Err(error.clone()));
        }
        let deferred = std::mem::take(&mut inner.deferred_disconnects);
        drop(inner);

        metrics().record_connect_failure();
        warn!(handle = %self.handle, reconnect, "Connect failed: {}", error);

        for (token, quiesce) in deferred {
            self.disconnect(token, quiesce).await;
        }
    }

    /// Caller-initiated disconnect.
    ///
    /// A disconnect that arrives while a connect is in flight is held until the
    /// connect resolves and then applied, so the handshake is never torn down
    /// half-way and the request is never silently dropped.
    pub async fn disconnect(&self, token: ActivityToken, quiesce: Option<Duration>) {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            inner.complete(token, Err(ServiceError::InvalidHandle(self.handle.to_string())));
            return;
        }
        if inner.is_connecting {
            info!(handle = %self.handle, %token, "Disconnect deferred until connect resolves");
            inner.note("disconnect deferred");
            inner.deferred_disconnects.push((token, quiesce));
            return;
        }

        inner.user_disconnected = true;
        let clean = inner.clean_session();
        if inner.state != ConnectionState::Connected {
            if clean {
                self.purge(&mut inner);
            }
            let state = inner.state.clone();
            inner.complete(token, Err(ServiceError::not_connected(&self.handle, state)));
            return;
        }

        self.transition(&mut inner, ConnectionState::Disconnecting);
        drop(inner);

        self.ping.stop();
        let result = self.engine.disconnect(quiesce).await;

        let mut inner = self.inner.lock().await;
        if inner.state == ConnectionState::Disconnecting {
            self.transition(&mut inner, ConnectionState::Disconnected);
        }
        if clean {
            self.purge(&mut inner);
            inner.prune_deliveries(&self.handle, "clean session ended");
            inner.subscriptions.clear();
        }
        let result = result.map_err(|e| ServiceError::engine(&self.handle, e));
        inner.complete(token, result);
        let deferred = std::mem::take(&mut inner.deferred_connects);
        drop(inner);

        metrics().record_connection_ended(false);
        info!(handle = %self.handle, "Disconnected");
        self.resume_connects(deferred).await;
    }

    /// The engine reported that an established session broke
    pub async fn connection_lost(&self, cause: &str) {
        let mut inner = self.inner.lock().await;
        if inner.state != ConnectionState::Connected {
            debug!(handle = %self.handle, state = ?inner.state, "Ignoring connection loss");
            return;
        }
        inner.note(format!("connection lost: {cause}"));
        self.transition(&mut inner, ConnectionState::Disconnecting);
        drop(inner);

        warn!(handle = %self.handle, "Connection lost: {}", cause);
        self.ping.stop();
        metrics().record_connection_ended(true);

        // the session is already broken; this only releases engine resources
        if let Err(e) = self.engine.disconnect(None).await {
            debug!(handle = %self.handle, "Disconnect after loss failed: {}", e);
        }

        let mut inner = self.inner.lock().await;
        if inner.state == ConnectionState::Disconnecting {
            self.transition(&mut inner, ConnectionState::Disconnected);
        }
        inner.emit(ServiceEvent::ConnectionLost {
            cause: cause.to_string(),
        });
        let deferred = std::mem::take(&mut inner.deferred_connects);
        drop(inner);

        self.resume_connects(deferred).await;
    }

    /// Run connects that were parked behind a disconnect, in arrival order
    async fn resume_connects(&self, deferred: Vec<(ActivityToken, ConnectOptions)>) {
        for (token, options) in deferred {
            self.boxed_connect(token, options).await;
        }
    }

    // connect can end in a deferred disconnect, which can resume a connect
    fn boxed_connect(
        &self,
        token: ActivityToken,
        options: ConnectOptions,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(self.connect(token, options))
    }

    /// Connectivity went away. A connected persistent session is treated as lost
    /// right away instead of waiting for the keep-alive to expire.
    pub async fn offline(&self) {
        let offline = {
            let inner = self.inner.lock().await;
            inner.state == ConnectionState::Connected && inner.last_session_clean == Some(false)
        };
        if offline {
            self.connection_lost("network unreachable").await;
        }
    }

    pub async fn publish(&self, token: ActivityToken, topic: String, message: MqttMessage) {
        let mut inner = self.inner.lock().await;
        if let Err(e) = self.check_ready(&inner) {
            metrics().record_publish_failure();
            inner.complete(token, Err(e));
            return;
        }
        if topic.is_empty() || topic.contains(['+', '#']) {
            metrics().record_publish_failure();
            inner.complete(
                token,
                Err(ServiceError::InvalidArgument(format!("invalid publish topic '{topic}'"))),
            );
            return;
        }

        let span = crate::mqtt_span!(handle = %self.handle, topic = %topic, %token);
        match self.engine.publish(&topic, &message).instrument(span).await {
            Ok(delivery) => {
                metrics().record_message_published();
                debug!(handle = %self.handle, topic = %topic, ?delivery, "Publish accepted");
                inner
                    .pending_deliveries
                    .insert(delivery, PendingDelivery { topic, message, token });
                inner.complete(token, Ok(()));
            }
            Err(e) => {
                metrics().record_publish_failure();
                warn!(handle = %self.handle, topic = %topic, "Publish failed: {}", e);
                inner.complete(token, Err(ServiceError::engine(&self.handle, e)));
            }
        }
    }

    pub async fn subscribe(&self, token: ActivityToken, filters: Vec<(String, QoS)>) {
        let mut inner = self.inner.lock().await;
        if let Err(e) = self.check_ready(&inner) {
            inner.complete(token, Err(e));
            return;
        }
        if filters.is_empty() || filters.iter().any(|(f, _)| f.is_empty()) {
            inner.complete(
                token,
                Err(ServiceError::InvalidArgument("empty topic filter".to_string())),
            );
            return;
        }

        match self.engine.subscribe(&filters).await {
            Ok(()) => {
                inner.note(format!("subscribed to {} filter(s)", filters.len()));
                inner.subscriptions.extend(filters);
                inner.complete(token, Ok(()));
            }
            Err(e) => inner.complete(token, Err(ServiceError::engine(&self.handle, e))),
        }
    }

    pub async fn unsubscribe(&self, token: ActivityToken, topics: Vec<String>) {
        let mut inner = self.inner.lock().await;
        if let Err(e) = self.check_ready(&inner) {
            inner.complete(token, Err(e));
            return;
        }
        if topics.is_empty() {
            inner.complete(
                token,
                Err(ServiceError::InvalidArgument("no topics to unsubscribe".to_string())),
            );
            return;
        }

        match self.engine.unsubscribe(&topics).await {
            Ok(()) => {
                for topic in &topics {
                    inner.subscriptions.remove(topic);
                }
                inner.note(format!("unsubscribed from {} topic(s)", topics.len()));
                inner.complete(token, Ok(()));
            }
            Err(e) => inner.complete(token, Err(ServiceError::engine(&self.handle, e))),
        }
    }

    fn check_ready(&self, inner: &Inner) -> Result<(), ServiceError> {
        if inner.closed {
            return Err(ServiceError::InvalidHandle(self.handle.to_string()));
        }
        if inner.state != ConnectionState::Connected {
            return Err(ServiceError::not_connected(&self.handle, inner.state.clone()));
        }
        Ok(())
    }

    /// The application consumed a message. Returns whether a buffered record was removed.
    pub fn acknowledge(&self, id: &MessageId) -> Result<bool, ServiceError> {
        let removed = self
            .store
            .discard(&self.handle, id)
            .map_err(|e| ServiceError::persistence(&self.handle, e))?;
        if removed {
            metrics().record_message_acknowledged();
        } else {
            debug!(handle = %self.handle, id = %id, "Acknowledged message was not buffered");
        }
        Ok(removed)
    }

    async fn message_arrived(&self, topic: String, message: MqttMessage) {
        let inner = self.inner.lock().await;
        metrics().record_message_arrived();

        let (id, stored) = match self.store.store(&self.handle, &topic, &message) {
            Ok(id) => (id, true),
            Err(e) => {
                // still hand the message over; only its durability is lost
                metrics().record_store_failure();
                warn!(handle = %self.handle, topic = %topic, "Failed to buffer arrived message: {}", e);
                (MessageId::generate(), false)
            }
        };

        if inner.state == ConnectionState::Connected || !stored {
            inner.emit(ServiceEvent::MessageArrived { id, topic, message });
        } else {
            debug!(
                handle = %self.handle,
                topic = %topic,
                state = ?inner.state,
                "Message buffered until the session is established"
            );
        }
    }

    async fn delivery_complete(&self, delivery: DeliveryToken) {
        let mut inner = self.inner.lock().await;
        match inner.pending_deliveries.remove(&delivery) {
            Some(pending) => {
                metrics().record_delivery_completed();
                inner.emit(ServiceEvent::DeliveryComplete {
                    token: pending.token,
                    topic: pending.topic,
                    message: pending.message,
                });
            }
            None => debug!(handle = %self.handle, ?delivery, "Completion for unknown delivery"),
        }
    }

    /// Apply one asynchronous engine event
    pub async fn handle_engine_event(&self, event: EngineEvent) {
        match event {
            EngineEvent::MessageArrived { topic, message } => {
                self.message_arrived(topic, message).await
            }
            EngineEvent::ConnectionLost { cause } => self.connection_lost(&cause).await,
            EngineEvent::DeliveryComplete(delivery) => self.delivery_complete(delivery).await,
        }
    }

    /// Invalidate the handle. Pending connect callers are failed and the engine is released.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return;
        }
        inner.closed = true;
        let invalid = ServiceError::InvalidHandle(self.handle.to_string());
        for token in std::mem::take(&mut inner.connect_waiters) {
            inner.complete(token, Err(invalid.clone()));
        }
        for (token, _) in std::mem::take(&mut inner.deferred_disconnects) {
            inner.complete(token, Err(invalid.clone()));
        }
        for (token, _) in std::mem::take(&mut inner.deferred_connects) {
            inner.complete(token, Err(invalid.clone()));
        }
        let was_connected = inner.state == ConnectionState::Connected;
        inner.note("closed");
        self.transition(&mut inner, ConnectionState::Disconnected);
        inner.sink = None;
        drop(inner);

        self.ping.stop();
        if was_connected {
            metrics().record_connection_ended(false);
            if let Err(e) = self.engine.disconnect(None).await {
                debug!(handle = %self.handle, "Disconnect on close failed: {}", e);
            }
        }
        info!(handle = %self.handle, "Connection handle closed");
    }

    pub async fn record(&self) -> ConnectionRecord {
        let inner = self.inner.lock().await;
        ConnectionRecord {
            handle: self.handle.clone(),
            server_uri: self.server_uri.clone(),
            client_id: self.client_id.clone(),
            state: inner.state.clone(),
            clean_session: inner.options.as_ref().map(|o| o.clean_session),
            subscriptions: inner.subscriptions.clone(),
            pending_deliveries: inner.pending_deliveries.len(),
            history: inner.history.iter().cloned().collect(),
        }
    }
}

impl Drop for ConnectionCoordinator {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.pump.lock() {
            if let Some(pump) = slot.take() {
                pump.abort();
            }
        }
    }
}
