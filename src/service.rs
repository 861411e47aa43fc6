//! Service surface behind the client facade
//!
//! [`MqttService`] owns the shared message store, the engine factory and the
//! connection registry, and routes every call to the coordinator of the handle
//! it names. Outcomes are reported on the handle's event sink. The only
//! synchronous failure is an unknown handle, because there is no sink to report
//! it on.

use crate::coordinator::{ConnectionCoordinator, ConnectionRecord, EventSink};
use crate::engine::EngineFactory;
use crate::error::{ServiceError, ServiceResult};
use crate::message::{ActivityToken, ConnectOptions, ConnectionHandle, MessageId, MqttMessage, QoS};
use crate::network::{NetworkMonitor, Reachability};
use crate::ping::WakeLock;
use crate::registry::ConnectionRegistry;
use crate::store::MessageStore;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

pub struct MqttService {
    store: Arc<dyn MessageStore>,
    engines: Arc<dyn EngineFactory>,
    wake_lock: Arc<dyn WakeLock>,
    registry: Arc<ConnectionRegistry>,
    reachability: watch::Sender<Reachability>,
    monitor: NetworkMonitor,
    /// Tokens are unique across every client of the service
    next_token: AtomicU64,
}

impl MqttService {
    /// Create the service and start its network monitor. Must be called inside a tokio runtime.
    pub fn new(
        store: Arc<dyn MessageStore>,
        engines: Arc<dyn EngineFactory>,
        wake_lock: Arc<dyn WakeLock>,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let (reachability, reachability_rx) = watch::channel(Reachability::Reachable);
        let monitor = NetworkMonitor::spawn(registry.clone(), reachability_rx);

        Self {
            store,
            engines,
            wake_lock,
            registry,
            reachability,
            monitor,
            next_token: AtomicU64::new(1),
        }
    }

    /// Allocate a correlation token no other client of this service holds
    pub fn next_token(&self) -> ActivityToken {
        ActivityToken(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }

    /// Resolve the handle for `{server_uri, client_id, app_id}`, creating its
    /// coordinator on first use, and route its events to `sink`.
    pub async fn get_client(
        &self,
        server_uri: &str,
        client_id: &str,
        app_id: &str,
        sink: EventSink,
    ) -> ServiceResult<ConnectionHandle> {
        if client_id.is_empty() {
            return Err(ServiceError::InvalidArgument(
                "client id must not be empty".to_string(),
            ));
        }

        let handle = ConnectionHandle::new(server_uri, client_id, app_id);
        let coordinator = self
            .registry
            .get_or_insert_with(&handle, || {
                ConnectionCoordinator::create(
                    handle.clone(),
                    server_uri,
                    client_id,
                    self.store.clone(),
                    self.engines.as_ref(),
                    self.wake_lock.clone(),
                )
            })
            .await?;
        coordinator.attach(sink).await;
        Ok(handle)
    }

    pub async fn connect(
        &self,
        handle: &ConnectionHandle,
        token: ActivityToken,
        options: ConnectOptions,
    ) -> ServiceResult<()> {
        let coordinator = self.registry.require(handle).await?;
        coordinator.connect(token, options).await;
        Ok(())
    }

    pub async fn disconnect(
        &self,
        handle: &ConnectionHandle,
        token: ActivityToken,
        quiesce: Option<Duration>,
    ) -> ServiceResult<()> {
        let coordinator = self.registry.require(handle).await?;
        coordinator.disconnect(token, quiesce).await;
        Ok(())
    }

    pub async fn publish(
        &self,
        handle: &ConnectionHandle,
        token: ActivityToken,
        topic: String,
        message: MqttMessage,
    ) -> ServiceResult<()> {
        let coordinator = self.registry.require(handle).await?;
        coordinator.publish(token, topic, message).await;
        Ok(())
    }

    pub async fn subscribe(
        &self,
        handle: &ConnectionHandle,
        token: ActivityToken,
        filters: Vec<(String, QoS)>,
    ) -> ServiceResult<()> {
        let coordinator = self.registry.require(handle).await?;
        coordinator.subscribe(token, filters).await;
        Ok(())
    }

    pub async fn unsubscribe(
        &self,
        handle: &ConnectionHandle,
        token: ActivityToken,
        topics: Vec<String>,
    ) -> ServiceResult<()> {
        let coordinator = self.registry.require(handle).await?;
        coordinator.unsubscribe(token, topics).await;
        Ok(())
    }

    /// Remove a consumed message from the buffer. Returns whether it was still buffered.
    pub async fn acknowledge_message_arrival(
        &self,
        handle: &ConnectionHandle,
        id: &MessageId,
    ) -> ServiceResult<bool> {
        let coordinator = self.registry.require(handle).await?;
        coordinator.acknowledge(id)
    }

    /// Invalidate a handle and release its engine
    pub async fn close(&self, handle: &ConnectionHandle) -> ServiceResult<()> {
        let coordinator = self
            .registry
            .remove(handle)
            .await
            .ok_or_else(|| ServiceError::InvalidHandle(handle.to_string()))?;
        coordinator.close().await;
        Ok(())
    }

    pub async fn is_connected(&self, handle: &ConnectionHandle) -> bool {
        match self.registry.get(handle).await {
            Some(coordinator) => coordinator.is_connected(),
            None => false,
        }
    }

    pub async fn connection_record(&self, handle: &ConnectionHandle) -> Option<ConnectionRecord> {
        let coordinator = self.registry.get(handle).await?;
        Some(coordinator.record().await)
    }

    pub async fn connection_records(&self) -> Vec<ConnectionRecord> {
        let mut records = Vec::new();
        for coordinator in self.registry.all().await {
            records.push(coordinator.record().await);
        }
        records.sort_by(|a, b| a.handle.cmp(&b.handle));
        records
    }

    /// Report host connectivity. Only changes reach the network monitor.
    pub fn set_reachability(&self, reachability: Reachability) {
        self.reachability.send_if_modified(|current| {
            if *current == reachability {
                false
            } else {
                *current = reachability;
                true
            }
        });
    }

    pub fn reachability(&self) -> Reachability {
        *self.reachability.borrow()
    }

    /// Stop network monitoring and close every handle
    pub async fn shutdown(&self) {
        self.monitor.stop();
        let coordinators = self.registry.all().await;
        info!(connections = coordinators.len(), "Shutting down MQTT service");
        for coordinator in coordinators {
            self.registry.remove(coordinator.handle()).await;
            coordinator.close().await;
        }
    }
}
