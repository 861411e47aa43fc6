//! Mock implementations for testing
//!
//! Provides a scriptable protocol engine, its factory, a counting wake lock
//! and a store that always fails, so the coordinator can be exercised without a
//! broker.

use crate::engine::{
    DeliveryToken, EngineError, EngineEvent, EngineEventSender, EngineFactory, ProtocolEngine,
};
use crate::message::{ConnectOptions, ConnectionHandle, MessageId, MqttMessage, QoS};
use crate::ping::WakeLock;
use crate::store::{MessageStore, StoreError, StoredMessage};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scriptable protocol engine
pub struct MockEngine {
    pub server_uri: String,
    pub client_id: String,
    events: EngineEventSender,
    connected: AtomicBool,
    connect_calls: AtomicUsize,
    disconnect_calls: AtomicUsize,
    check_calls: AtomicUsize,
    next_delivery: AtomicU64,
    connect_results: Mutex<Vec<Result<(), EngineError>>>,
    fail_requests: AtomicBool,
    fail_checks: AtomicBool,
    gate: watch::Sender<bool>,
    disconnect_gate: watch::Sender<bool>,
    last_options: Mutex<Option<ConnectOptions>>,
    published: Mutex<Vec<(DeliveryToken, String, MqttMessage)>>,
    subscribed: Mutex<Vec<(String, QoS)>>,
    unsubscribed: Mutex<Vec<String>>,
}

impl MockEngine {
    pub fn new(server_uri: &str, client_id: &str, events: EngineEventSender) -> Self {
        let (gate, _) = watch::channel(true);
        let (disconnect_gate, _) = watch::channel(true);
        Self {
            server_uri: server_uri.to_string(),
            client_id: client_id.to_string(),
            events,
            connected: AtomicBool::new(false),
            connect_calls: AtomicUsize::new(0),
            disconnect_calls: AtomicUsize::new(0),
            check_calls: AtomicUsize::new(0),
            next_delivery: AtomicU64::new(1),
            connect_results: Mutex::new(Vec::new()),
            fail_requests: AtomicBool::new(false),
            fail_checks: AtomicBool::new(false),
            gate,
            disconnect_gate,
            last_options: Mutex::new(None),
            published: Mutex::new(Vec::new()),
            subscribed: Mutex::new(Vec::new()),
            unsubscribed: Mutex::new(Vec::new()),
        }
    }

    /// Queue the outcome of the next connect. Unscripted connects succeed.
    pub fn push_connect_result(&self, result: Result<(), EngineError>) {
        locked(&self.connect_results).push(result);
    }

    /// Make connects block until [`MockEngine::release_connects`] is called
    pub fn hold_connects(&self) {
        self.gate.send_replace(false);
    }

    pub fn release_connects(&self) {
        self.gate.send_replace(true);
    }

    /// Make disconnects block until [`MockEngine::release_disconnects`] is called
    pub fn hold_disconnects(&self) {
        self.disconnect_gate.send_replace(false);
    }

    pub fn release_disconnects(&self) {
        self.disconnect_gate.send_replace(true);
    }

    pub fn fail_requests(&self, fail: bool) {
        self.fail_requests.store(fail, Ordering::SeqCst);
    }

    pub fn fail_checks(&self, fail: bool) {
        self.fail_checks.store(fail, Ordering::SeqCst);
    }

    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn disconnect_calls(&self) -> usize {
        self.disconnect_calls.load(Ordering::SeqCst)
    }

    pub fn check_calls(&self) -> usize {
        self.check_calls.load(Ordering::SeqCst)
    }

    pub fn last_options(&self) -> Option<ConnectOptions> {
        locked(&self.last_options).clone()
    }

    pub fn published(&self) -> Vec<(DeliveryToken, String, MqttMessage)> {
        locked(&self.published).clone()
    }

    pub fn subscribed(&self) -> Vec<(String, QoS)> {
        locked(&self.subscribed).clone()
    }

    pub fn unsubscribed(&self) -> Vec<String> {
        locked(&self.unsubscribed).clone()
    }

    /// Simulate a message from the broker
    pub fn inject_message(&self, topic: &str, message: MqttMessage) {
        let _ = self.events.send(EngineEvent::MessageArrived {
            topic: topic.to_string(),
            message,
        });
    }

    /// Simulate the broker connection dropping
    pub fn drop_connection(&self, cause: &str) {
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.events.send(EngineEvent::ConnectionLost {
            cause: cause.to_string(),
        });
    }

    pub fn complete_delivery(&self, token: DeliveryToken) {
        let _ = self.events.send(EngineEvent::DeliveryComplete(token));
    }

    fn check_request(&self) -> Result<(), EngineError> {
        if self.fail_requests.load(Ordering::SeqCst) {
            return Err(EngineError::RequestFailed("mock request failure".to_string()));
        }
        if !self.connected.load(Ordering::SeqCst) {
            return Err(EngineError::NotConnected);
        }
        Ok(())
    }
}

#[async_trait]
impl ProtocolEngine for MockEngine {
    async fn connect(&self, options: &ConnectOptions) -> Result<(), EngineError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        *locked(&self.last_options) = Some(options.clone());

        let mut gate = self.gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;

        let result = {
            let mut scripted = locked(&self.connect_results);
            if scripted.is_empty() {
                Ok(())
            } else {
                scripted.remove(0)
            }
        };
        self.connected.store(result.is_ok(), Ordering::SeqCst);
        result
    }

    async fn disconnect(&self, _quiesce: Option<Duration>) -> Result<(), EngineError> {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        let mut gate = self.disconnect_gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        message: &MqttMessage,
    ) -> Result<DeliveryToken, EngineError> {
        self.check_request()?;
        let token = DeliveryToken(self.next_delivery.fetch_add(1, Ordering::SeqCst));
        locked(&self.published).push((token, topic.to_string(), message.clone()));
        Ok(token)
    }

    async fn subscribe(&self, filters: &[(String, QoS)]) -> Result<(), EngineError> {
        self.check_request()?;
        locked(&self.subscribed).extend_from_slice(filters);
        Ok(())
    }

    async fn unsubscribe(&self, topics: &[String]) -> Result<(), EngineError> {
        self.check_request()?;
        locked(&self.unsubscribed).extend_from_slice(topics);
        Ok(())
    }

    async fn check_activity(&self) -> Result<(), EngineError> {
        self.check_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_checks.load(Ordering::SeqCst) {
            return Err(EngineError::Timeout("mock keep-alive failure".to_string()));
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Factory that hands out [`MockEngine`]s and keeps them for inspection
#[derive(Default)]
pub struct MockEngineFactory {
    engines: Mutex<HashMap<String, Arc<MockEngine>>>,
    created: AtomicUsize,
}

impl MockEngineFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine created for `client_id`, if any
    pub fn engine(&self, client_id: &str) -> Option<Arc<MockEngine>> {
        locked(&self.engines).get(client_id).cloned()
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl EngineFactory for MockEngineFactory {
    fn create(
        &self,
        server_uri: &str,
        client_id: &str,
        events: EngineEventSender,
    ) -> Result<Arc<dyn ProtocolEngine>, EngineError> {
        if !server_uri.contains("://") {
            return Err(EngineError::InvalidServerUri(server_uri.to_string()));
        }
        let engine = Arc::new(MockEngine::new(server_uri, client_id, events));
        locked(&self.engines).insert(client_id.to_string(), engine.clone());
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(engine)
    }
}

/// Wake lock that counts acquisitions and releases
#[derive(Debug, Default)]
pub struct CountingWakeLock {
    acquired: AtomicUsize,
    released: AtomicUsize,
}

impl CountingWakeLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    /// Number of acquisitions not yet released
    pub fn held(&self) -> usize {
        self.acquired().saturating_sub(self.released())
    }
}

impl WakeLock for CountingWakeLock {
    fn acquire(&self, _tag: &str) {
        self.acquired.fetch_add(1, Ordering::SeqCst);
    }

    fn release(&self, _tag: &str) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// Store whose every operation fails
#[derive(Debug, Default)]
pub struct FailingMessageStore;

impl MessageStore for FailingMessageStore {
    fn store(
        &self,
        _handle: &ConnectionHandle,
        _topic: &str,
        _message: &MqttMessage,
    ) -> Result<MessageId, StoreError> {
        Err(StoreError::Poisoned)
    }

    fn discard(&self, _handle: &ConnectionHandle, _id: &MessageId) -> Result<bool, StoreError> {
        Err(StoreError::Poisoned)
    }

    fn all_arrived(
        &self,
        _handle: Option<&ConnectionHandle>,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        Err(StoreError::Poisoned)
    }

    fn clear(&self, _handle: Option<&ConnectionHandle>) -> Result<usize, StoreError> {
        Err(StoreError::Poisoned)
    }
}
