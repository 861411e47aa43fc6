//! Caller-facing MQTT client
//!
//! [`MqttClient`] hides the service/coordinator split. Each operation is tagged
//! with a fresh [`ActivityToken`], a oneshot sender is parked under that token,
//! and the operation is dispatched to the service on its own task. A dispatcher
//! task reads the handle's event sink, resolves each token exactly once by
//! removing it from the pending map before completing it, and forwards
//! everything else to the application as [`ClientEvent`]s.
//!
//! Pending operations are not persisted. If the process dies, their outcome is
//! lost; only messages already written to the store survive.

use crate::coordinator::ServiceEvent;
use crate::error::{ServiceError, ServiceResult};
use crate::message::{ActivityToken, ConnectOptions, ConnectionHandle, MessageId, MqttMessage, QoS};
use crate::service::MqttService;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// When an arrived message is removed from the buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckMode {
    /// As soon as it has been handed to the application channel
    #[default]
    Auto,
    /// Only when the application calls [`MqttClient::acknowledge`]
    Manual,
}

/// Events delivered to the application
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    MessageArrived {
        id: MessageId,
        topic: String,
        message: MqttMessage,
    },
    ConnectionLost {
        cause: String,
    },
    DeliveryComplete {
        topic: String,
        message: MqttMessage,
    },
    ConnectComplete {
        reconnect: bool,
        server_uri: String,
    },
}

type PendingMap = HashMap<ActivityToken, oneshot::Sender<ServiceResult<()>>>;

fn lock_pending(pending: &Mutex<PendingMap>) -> MutexGuard<'_, PendingMap> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct MqttClient {
    service: Arc<MqttService>,
    handle: ConnectionHandle,
    ack_mode: AckMode,
    pending: Arc<Mutex<PendingMap>>,
    dispatcher: JoinHandle<()>,
}

impl MqttClient {
    /// Open a client for `{server_uri, client_id, app_id}`.
    ///
    /// Returns the client and the receiver on which arrived messages and
    /// connection notifications are delivered.
    pub async fn new(
        service: Arc<MqttService>,
        server_uri: &str,
        client_id: &str,
        app_id: &str,
        ack_mode: AckMode,
    ) -> ServiceResult<(Self, mpsc::UnboundedReceiver<ClientEvent>)> {
        let (sink, service_events) = mpsc::unbounded_channel();
        let handle = service.get_client(server_uri, client_id, app_id, sink).await?;
        let (app_tx, app_rx) = mpsc::unbounded_channel();
        let pending = Arc::new(Mutex::new(PendingMap::new()));

        let dispatcher = tokio::spawn(Self::dispatch(
            service_events,
            pending.clone(),
            app_tx,
            ack_mode,
            service.clone(),
            handle.clone(),
        ));

        let client = Self {
            service,
            handle,
            ack_mode,
            pending,
            dispatcher,
        };
        Ok((client, app_rx))
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    pub fn ack_mode(&self) -> AckMode {
        self.ack_mode
    }

    /// Number of operations still waiting for their outcome
    pub fn pending_operations(&self) -> usize {
        lock_pending(&self.pending).len()
    }

    pub async fn is_connected(&self) -> bool {
        self.service.is_connected(&self.handle).await
    }

    pub async fn connect(&self, options: ConnectOptions) -> ServiceResult<()> {
        self.request(move |service, handle, token| async move {
            service.connect(&handle, token, options).await
        })
        .await
    }

    pub async fn disconnect(&self, quiesce: Option<Duration>) -> ServiceResult<()> {
        self.request(move |service, handle, token| async move {
            service.disconnect(&handle, token, quiesce).await
        })
        .await
    }

    /// Publish a message. Resolves once the engine has accepted it;
    /// [`ClientEvent::DeliveryComplete`] follows when the broker completes the QoS flow.
    pub async fn publish(&self, topic: impl Into<String>, message: MqttMessage) -> ServiceResult<()> {
        let topic = topic.into();
        self.request(move |service, handle, token| async move {
            service.publish(&handle, token, topic, message).await
        })
        .await
    }

    pub async fn subscribe(&self, filters: Vec<(String, QoS)>) -> ServiceResult<()> {
        self.request(move |service, handle, token| async move {
            service.subscribe(&handle, token, filters).await
        })
        .await
    }

    pub async fn unsubscribe(&self, topics: Vec<String>) -> ServiceResult<()> {
        self.request(move |service, handle, token| async move {
            service.unsubscribe(&handle, token, topics).await
        })
        .await
    }

    /// Mark a message as consumed. Returns whether it was still buffered.
    pub async fn acknowledge(&self, id: &MessageId) -> ServiceResult<bool> {
        self.service
            .acknowledge_message_arrival(&self.handle, id)
            .await
    }

    /// Invalidate the handle. Buffered messages stay in the store.
    pub async fn close(self) -> ServiceResult<()> {
        self.service.close(&self.handle).await
    }

    async fn request<F, Fut>(&self, operation: F) -> ServiceResult<()>
    where
        F: FnOnce(Arc<MqttService>, ConnectionHandle, ActivityToken) -> Fut,
        Fut: Future<Output = ServiceResult<()>> + Send + 'static,
    {
        let token = self.service.next_token();
        let (tx, rx) = oneshot::channel();
        lock_pending(&self.pending).insert(token, tx);

        let call = operation(self.service.clone(), self.handle.clone(), token);
        let pending = self.pending.clone();
        // the operation runs to completion even if the caller stops waiting
        tokio::spawn(async move {
            if let Err(e) = call.await {
                if let Some(tx) = lock_pending(&pending).remove(&token) {
                    let _ = tx.send(Err(e));
                }
            }
        });

        rx.await.unwrap_or(Err(ServiceError::ServiceUnavailable))
    }

    async fn dispatch(
        mut events: mpsc::UnboundedReceiver<ServiceEvent>,
        pending: Arc<Mutex<PendingMap>>,
        app: mpsc::UnboundedSender<ClientEvent>,
        ack_mode: AckMode,
        service: Arc<MqttService>,
        handle: ConnectionHandle,
    ) {
        while let Some(event) = events.recv().await {
            match event {
                ServiceEvent::ActionComplete { token, result } => {
                    let waiter = lock_pending(&pending).remove(&token);
                    match waiter {
                        Some(tx) => {
                            if tx.send(result).is_err() {
                                debug!(%token, "Caller stopped waiting for result");
                            }
                        }
                        None => warn!(%token, "Result for unknown or already resolved token"),
                    }
                }
                ServiceEvent::MessageArrived { id, topic, message } => {
                    let handed_over = app
                        .send(ClientEvent::MessageArrived {
                            id: id.clone(),
                            topic,
                            message,
                        })
                        .is_ok();
                    if handed_over && ack_mode == AckMode::Auto {
                        if let Err(e) = service.acknowledge_message_arrival(&handle, &id).await {
                            warn!(handle = %handle, id = %id, "Auto-acknowledge failed: {}", e);
                        }
                    }
                }
                ServiceEvent::ConnectionLost { cause } => {
                    let _ = app.send(ClientEvent::ConnectionLost { cause });
                }
                ServiceEvent::DeliveryComplete { topic, message, .. } => {
                    let _ = app.send(ClientEvent::DeliveryComplete { topic, message });
                }
                ServiceEvent::ConnectComplete {
                    reconnect,
                    server_uri,
                } => {
                    let _ = app.send(ClientEvent::ConnectComplete {
                        reconnect,
                        server_uri,
                    });
                }
            }
        }

        // sink detached: nobody will ever answer the remaining tokens
        for (_, tx) in lock_pending(&pending).drain() {
            let _ = tx.send(Err(ServiceError::ServiceUnavailable));
        }
        debug!(handle = %handle, "Client dispatcher stopped");
    }
}

impl Drop for MqttClient {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}
