//! rumqttc-backed protocol engine
//!
//! Wraps a rumqttc v5 `AsyncClient` and polls its `EventLoop` on a tokio task.
//! The event loop is not left to reconnect on its own: when a session breaks the
//! poll task reports [`EngineEvent::ConnectionLost`] and stops, and the next
//! `connect` call resumes polling the same client.

use super::{
    DeliveryToken, EngineError, EngineEvent, EngineEventSender, EngineFactory, ProtocolEngine,
};
use crate::message::{ConnectOptions, MqttMessage, QoS};
use async_trait::async_trait;
use rumqttc::v5::mqttbytes::v5::{ConnectReturnCode, LastWill, Packet};
use rumqttc::v5::mqttbytes::QoS as WireQoS;
use rumqttc::v5::{AsyncClient, Event, EventLoop, MqttOptions};
use rumqttc::Outgoing;
use rumqttc::Transport as RumqttcTransport;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use url::Url;

/// Link state as seen by the poll task
#[derive(Debug, Clone, PartialEq)]
enum LinkState {
    Idle,
    Connecting,
    Connected,
    Closing,
    Failed(String),
}

/// Broker address parsed from a server URI
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl BrokerAddress {
    /// Parse `tcp://`, `mqtt://`, `ssl://` or `mqtts://` URIs
    pub fn parse(server_uri: &str) -> Result<Self, EngineError> {
        let url = Url::parse(server_uri)
            .map_err(|_| EngineError::InvalidServerUri(server_uri.to_string()))?;

        let tls = match url.scheme() {
            "tcp" | "mqtt" => false,
            "ssl" | "mqtts" => true,
            _ => return Err(EngineError::InvalidServerUri(server_uri.to_string())),
        };
        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| EngineError::InvalidServerUri(server_uri.to_string()))?
            .to_string();
        let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });

        Ok(Self { host, port, tls })
    }
}

fn to_wire_qos(qos: QoS) -> WireQoS {
    match qos {
        QoS::AtMostOnce => WireQoS::AtMostOnce,
        QoS::AtLeastOnce => WireQoS::AtLeastOnce,
        QoS::ExactlyOnce => WireQoS::ExactlyOnce,
    }
}

fn from_wire_qos(qos: WireQoS) -> QoS {
    match qos {
        WireQoS::AtMostOnce => QoS::AtMostOnce,
        WireQoS::AtLeastOnce => QoS::AtLeastOnce,
        WireQoS::ExactlyOnce => QoS::ExactlyOnce,
    }
}

/// Build rumqttc options from a connect-options snapshot
pub fn configure_mqtt_options(
    client_id: &str,
    address: &BrokerAddress,
    options: &ConnectOptions,
) -> MqttOptions {
    let mut mqtt_options = MqttOptions::new(client_id, address.host.clone(), address.port);

    if address.tls {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    // rumqttc rejects very short keep-alives; zero keeps the library default
    if !options.keep_alive.is_zero() {
        mqtt_options.set_keep_alive(options.keep_alive.max(Duration::from_secs(5)));
    }
    mqtt_options.set_clean_start(options.clean_session);
    mqtt_options.set_max_packet_size(Some(256 * 1024));

    if let Some(username) = &options.username {
        let password = options.password.clone().unwrap_or_default();
        mqtt_options.set_credentials(username, &password);
    }

    if let Some(will) = &options.will {
        let lwt = LastWill::new(
            &will.topic,
            will.payload.clone(),
            to_wire_qos(will.qos),
            will.retained,
            None,
        );
        mqtt_options.set_last_will(lwt);
    }

    mqtt_options
}

/// Matches engine delivery tokens to packet ids.
///
/// Publishes leave the event loop in the order they were queued, so the n-th
/// `Outgoing::Publish` belongs to the n-th queued token.
#[derive(Debug, Default)]
struct DeliveryTracker {
    queued: VecDeque<(DeliveryToken, QoS)>,
    inflight: HashMap<u16, DeliveryToken>,
}

impl DeliveryTracker {
    /// Returns a token that is already complete (QoS 0)
    fn on_outgoing_publish(&mut self, pkid: u16) -> Option<DeliveryToken> {
        if pkid != 0 && self.inflight.contains_key(&pkid) {
            // retransmission of a publish we already track
            return None;
        }
        let (token, qos) = self.queued.pop_front()?;
        if qos == QoS::AtMostOnce || pkid == 0 {
            Some(token)
        } else {
            self.inflight.insert(pkid, token);
            None
        }
    }

    fn on_ack(&mut self, pkid: u16) -> Option<DeliveryToken> {
        self.inflight.remove(&pkid)
    }
}

struct Session {
    options: ConnectOptions,
    client: AsyncClient,
    event_loop: Arc<Mutex<EventLoop>>,
    poll_task: Option<JoinHandle<()>>,
    shutdown_tx: Option<watch::Sender<bool>>,
}

/// Shared between the engine and its poll task
struct Shared {
    state_tx: watch::Sender<LinkState>,
    events: EngineEventSender,
    last_inbound: std::sync::Mutex<Instant>,
    deliveries: std::sync::Mutex<DeliveryTracker>,
}

impl Shared {
    fn touch(&self) {
        if let Ok(mut last) = self.last_inbound.lock() {
            *last = Instant::now();
        }
    }

    fn idle_for(&self) -> Duration {
        self.last_inbound
            .lock()
            .map(|last| last.elapsed())
            .unwrap_or_default()
    }

    fn state(&self) -> LinkState {
        self.state_tx.borrow().clone()
    }
}

/// Production engine over rumqttc
pub struct RumqttcEngine {
    client_id: String,
    address: BrokerAddress,
    shared: Arc<Shared>,
    session: Mutex<Option<Session>>,
    next_token: AtomicU64,
}

impl RumqttcEngine {
    pub fn new(
        server_uri: &str,
        client_id: &str,
        events: EngineEventSender,
    ) -> Result<Self, EngineError> {
        let address = BrokerAddress::parse(server_uri)?;
        let (state_tx, _) = watch::channel(LinkState::Idle);

        Ok(Self {
            client_id: client_id.to_string(),
            address,
            shared: Arc::new(Shared {
                state_tx,
                events,
                last_inbound: std::sync::Mutex::new(Instant::now()),
                deliveries: std::sync::Mutex::new(DeliveryTracker::default()),
            }),
            session: Mutex::new(None),
            next_token: AtomicU64::new(1),
        })
    }

    /// Wait for the poll task to report ConnAck or failure
    async fn wait_for_connection_confirmation(
        mut state_rx: watch::Receiver<LinkState>,
        timeout: Duration,
    ) -> Result<(), EngineError> {
        let timeout_result = tokio::time::timeout(timeout, async {
            loop {
                match &*state_rx.borrow_and_update() {
                    LinkState::Connected => return Ok(()),
                    LinkState::Failed(reason) => {
                        return Err(EngineError::ConnectionFailed(reason.clone()))
                    }
                    LinkState::Idle | LinkState::Closing => {
                        return Err(EngineError::ConnectionFailed(
                            "connect abandoned".to_string(),
                        ))
                    }
                    LinkState::Connecting => {}
                }
                if state_rx.changed().await.is_err() {
                    return Err(EngineError::ConnectionFailed(
                        "State channel closed".to_string(),
                    ));
                }
            }
        })
        .await;

        match timeout_result {
            Ok(result) => result,
            Err(_) => Err(EngineError::Timeout(
                "ConnAck timeout - no connection confirmation received".to_string(),
            )),
        }
    }

    async fn poll_loop(
        client_id: String,
        event_loop: Arc<Mutex<EventLoop>>,
        shared: Arc<Shared>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut event_loop = event_loop.lock().await;
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        debug!(target: "mqtt_transport", client_id = %client_id, "Poll task shutting down");
                        break;
                    }
                }
                result = event_loop.poll() => {
                    match result {
                        Ok(event) => {
                            if !Self::route_event(&client_id, event, &shared) {
                                break;
                            }
                        }
                        Err(e) => {
                            Self::handle_poll_error(&client_id, e.to_string(), &shared);
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Returns false when the poll task should stop
    fn route_event(client_id: &str, event: Event, shared: &Shared) -> bool {
        match event {
            Event::Incoming(packet) => {
                shared.touch();
                match packet {
                    Packet::ConnAck(ack) => {
                        if ack.code == ConnectReturnCode::Success {
                            info!(target: "mqtt_transport", client_id = %client_id, session_present = ack.session_present, "ConnAck received");
                            let _ = shared.state_tx.send_replace(LinkState::Connected);
                            true
                        } else {
                            let reason = format!("{:?}", ack.code);
                            warn!(target: "mqtt_transport", client_id = %client_id, reason = %reason, "Broker refused connection");
                            let _ = shared.state_tx.send_replace(LinkState::Failed(reason));
                            false
                        }
                    }
                    Packet::Publish(publish) => {
                        let topic = String::from_utf8_lossy(&publish.topic).to_string();
                        let message = MqttMessage {
                            payload: publish.payload.to_vec(),
                            qos: from_wire_qos(publish.qos),
                            retained: publish.retain,
                            duplicate: publish.dup,
                        };
                        let _ = shared
                            .events
                            .send(EngineEvent::MessageArrived { topic, message });
                        true
                    }
                    Packet::PubAck(ack) => {
                        Self::complete_delivery(ack.pkid, shared);
                        true
                    }
                    Packet::PubComp(comp) => {
                        Self::complete_delivery(comp.pkid, shared);
                        true
                    }
                    Packet::Disconnect(disconnect) => {
                        let cause = format!("Broker disconnected: {:?}", disconnect.reason_code);
                        Self::handle_poll_error(client_id, cause, shared);
                        false
                    }
                    other => {
                        debug!(target: "mqtt_transport", "MQTT event: {:?}", other);
                        true
                    }
                }
            }
            Event::Outgoing(Outgoing::Publish(pkid)) => {
                let completed = shared
                    .deliveries
                    .lock()
                    .ok()
                    .and_then(|mut tracker| tracker.on_outgoing_publish(pkid));
                if let Some(token) = completed {
                    let _ = shared.events.send(EngineEvent::DeliveryComplete(token));
                }
                true
            }
            Event::Outgoing(Outgoing::Disconnect) => {
                // our own DISCONNECT has been written
                !matches!(shared.state(), LinkState::Closing)
            }
            Event::Outgoing(_) => true,
        }
    }

    fn complete_delivery(pkid: u16, shared: &Shared) {
        let completed = shared
            .deliveries
            .lock()
            .ok()
            .and_then(|mut tracker| tracker.on_ack(pkid));
        if let Some(token) = completed {
            let _ = shared.events.send(EngineEvent::DeliveryComplete(token));
        }
    }

    fn handle_poll_error(client_id: &str, cause: String, shared: &Shared) {
        match shared.state() {
            LinkState::Connecting => {
                warn!(target: "mqtt_transport", client_id = %client_id, "Connect attempt failed: {}", cause);
                let _ = shared.state_tx.send_replace(LinkState::Failed(cause));
            }
            LinkState::Connected => {
                error!(target: "mqtt_transport", client_id = %client_id, "Connection lost: {}", cause);
                let _ = shared.state_tx.send_replace(LinkState::Failed(cause.clone()));
                let _ = shared.events.send(EngineEvent::ConnectionLost { cause });
            }
            _ => {
                debug!(target: "mqtt_transport", client_id = %client_id, "Event loop ended: {}", cause);
            }
        }
    }

    async fn stop_poll_task(session: &mut Session, grace: Duration) {
        if let Some(shutdown_tx) = session.shutdown_tx.take() {
            let _ = shutdown_tx.send(true);
        }
        if let Some(handle) = session.poll_task.take() {
            if tokio::time::timeout(grace, handle).await.is_err() {
                warn!(target: "mqtt_transport", "Poll task didn't stop in time");
            }
        }
    }

    async fn connected_client(&self) -> Result<AsyncClient, EngineError> {
        if self.shared.state() != LinkState::Connected {
            return Err(EngineError::NotConnected);
        }
        let session = self.session.lock().await;
        session
            .as_ref()
            .map(|s| s.client.clone())
            .ok_or(EngineError::NotConnected)
    }
}

#[async_trait]
impl ProtocolEngine for RumqttcEngine {
    async fn connect(&self, options: &ConnectOptions) -> Result<(), EngineError> {
        let mut guard = self.session.lock().await;

        if let Some(session) = guard.as_mut() {
            Self::stop_poll_task(session, Duration::from_millis(500)).await;
        }

        // reuse the client (and its in-flight session state) unless the options changed
        let reuse = guard.as_ref().is_some_and(|s| s.options == *options);
        if !reuse {
            let mqtt_options = configure_mqtt_options(&self.client_id, &self.address, options);
            let (client, event_loop) = AsyncClient::new(mqtt_options, 10);
            if let Ok(mut tracker) = self.shared.deliveries.lock() {
                *tracker = DeliveryTracker::default();
            }
            *guard = Some(Session {
                options: options.clone(),
                client,
                event_loop: Arc::new(Mutex::new(event_loop)),
                poll_task: None,
                shutdown_tx: None,
            });
        }

        let session = guard.as_mut().ok_or(EngineError::NotConnected)?;
        let _ = self.shared.state_tx.send_replace(LinkState::Connecting);
        let state_rx = self.shared.state_tx.subscribe();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        session.shutdown_tx = Some(shutdown_tx);
        session.poll_task = Some(tokio::spawn(Self::poll_loop(
            self.client_id.clone(),
            session.event_loop.clone(),
            self.shared.clone(),
            shutdown_rx,
        )));
        drop(guard);

        let result =
            Self::wait_for_connection_confirmation(state_rx, options.connection_timeout).await;
        if result.is_err() {
            let _ = self.shared.state_tx.send_replace(LinkState::Idle);
            if let Some(session) = self.session.lock().await.as_mut() {
                Self::stop_poll_task(session, Duration::from_millis(500)).await;
            }
        }
        result
    }

    async fn disconnect(&self, quiesce: Option<Duration>) -> Result<(), EngineError> {
        let mut guard = self.session.lock().await;
        let Some(session) = guard.as_mut() else {
            return Ok(());
        };

        let was_connected = self.shared.state() == LinkState::Connected;
        let _ = self.shared.state_tx.send_replace(LinkState::Closing);

        let result = if was_connected {
            session
                .client
                .disconnect()
                .await
                .map_err(|e| EngineError::RequestFailed(e.to_string()))
        } else {
            Ok(())
        };

        // let the poll task write the DISCONNECT before stopping it
        if let Some(handle) = session.poll_task.take() {
            let grace = quiesce.unwrap_or(Duration::from_secs(2));
            match tokio::time::timeout(grace, handle).await {
                Ok(_) => debug!(target: "mqtt_transport", "Poll task finished after disconnect"),
                Err(_) => warn!(target: "mqtt_transport", "Poll task didn't finish after disconnect"),
            }
        }
        session.shutdown_tx = None;
        let _ = self.shared.state_tx.send_replace(LinkState::Idle);
        result
    }

    async fn publish(
        &self,
        topic: &str,
        message: &MqttMessage,
    ) -> Result<DeliveryToken, EngineError> {
        let client = self.connected_client().await?;
        let token = DeliveryToken(self.next_token.fetch_add(1, Ordering::Relaxed));

        if let Ok(mut tracker) = self.shared.deliveries.lock() {
            tracker.queued.push_back((token, message.qos));
        }

        let result = client
            .publish(
                topic,
                to_wire_qos(message.qos),
                message.retained,
                message.payload.clone(),
            )
            .await;

        if let Err(e) = result {
            if let Ok(mut tracker) = self.shared.deliveries.lock() {
                tracker.queued.retain(|(queued, _)| *queued != token);
            }
            return Err(EngineError::RequestFailed(e.to_string()));
        }
        Ok(token)
    }

    async fn subscribe(&self, filters: &[(String, QoS)]) -> Result<(), EngineError> {
        let client = self.connected_client().await?;
        for (topic, qos) in filters {
            client
                .subscribe(topic.as_str(), to_wire_qos(*qos))
                .await
                .map_err(|e| EngineError::RequestFailed(format!("subscribe {topic}: {e}")))?;
        }
        Ok(())
    }

    async fn unsubscribe(&self, topics: &[String]) -> Result<(), EngineError> {
        let client = self.connected_client().await?;
        for topic in topics {
            client
                .unsubscribe(topic.as_str())
                .await
                .map_err(|e| EngineError::RequestFailed(format!("unsubscribe {topic}: {e}")))?;
        }
        Ok(())
    }

    async fn check_activity(&self) -> Result<(), EngineError> {
        if self.shared.state() != LinkState::Connected {
            return Err(EngineError::NotConnected);
        }
        let keep_alive = self
            .session
            .lock()
            .await
            .as_ref()
            .map(|s| s.options.keep_alive)
            .unwrap_or_default();
        if keep_alive.is_zero() {
            return Ok(());
        }

        // rumqttc sends PINGREQ itself; a healthy link always has inbound traffic
        let idle = self.shared.idle_for();
        if idle > keep_alive * 3 / 2 {
            return Err(EngineError::Timeout(format!(
                "no broker traffic for {}ms",
                idle.as_millis()
            )));
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.shared.state() == LinkState::Connected
    }
}

/// Factory producing [`RumqttcEngine`]s
#[derive(Debug, Default, Clone)]
pub struct RumqttcEngineFactory;

impl EngineFactory for RumqttcEngineFactory {
    fn create(
        &self,
        server_uri: &str,
        client_id: &str,
        events: EngineEventSender,
    ) -> Result<Arc<dyn ProtocolEngine>, EngineError> {
        Ok(Arc::new(RumqttcEngine::new(server_uri, client_id, events)?))
    }
}
