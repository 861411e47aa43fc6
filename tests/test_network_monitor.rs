//! Network monitor tests: reachability transitions drive recovery across
//! every registered connection.

use mqttlink::client::{AckMode, ClientEvent, MqttClient};
use mqttlink::coordinator::ConnectionState;
use mqttlink::message::{ConnectOptions, MqttMessage, QoS};
use mqttlink::network::{NetworkMonitor, Reachability};
use mqttlink::ping::NoopWakeLock;
use mqttlink::service::MqttService;
use mqttlink::store::SqliteMessageStore;
use mqttlink::testing::MockEngineFactory;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

const BROKER: &str = "tcp://broker.test:1883";

fn service() -> (Arc<MqttService>, Arc<MockEngineFactory>) {
    let factory = Arc::new(MockEngineFactory::new());
    let service = Arc::new(MqttService::new(
        Arc::new(SqliteMessageStore::in_memory().unwrap()),
        factory.clone(),
        Arc::new(NoopWakeLock),
    ));
    (service, factory)
}

async fn connected_client(
    service: &Arc<MqttService>,
    client_id: &str,
    options: ConnectOptions,
) -> (MqttClient, UnboundedReceiver<ClientEvent>) {
    let (client, events) = MqttClient::new(service.clone(), BROKER, client_id, "net", AckMode::Auto)
        .await
        .unwrap();
    client.connect(options).await.unwrap();
    (client, events)
}

async fn wait_for(client: &MqttClient, service: &MqttService, state: ConnectionState) {
    let coordinator = service.registry().require(client.handle()).await.unwrap();
    let mut watch = coordinator.watch_state();
    timeout(Duration::from_secs(2), watch.wait_for(|current| *current == state))
        .await
        .expect("timed out waiting for state")
        .expect("state channel closed");
}

#[tokio::test]
async fn test_unreachable_then_reachable_recovers_persistent_session() {
    // Arrange
    let (service, factory) = service();
    let (client, mut events) =
        connected_client(&service, "roaming", ConnectOptions::persistent()).await;

    // Act: network goes away
    service.set_reachability(Reachability::Unreachable);
    wait_for(&client, &service, ConnectionState::Disconnected).await;

    // Assert: loss reported without waiting for keep-alive expiry
    let cause = timeout(Duration::from_secs(2), async {
        while let Some(event) = events.recv().await {
            if let ClientEvent::ConnectionLost { cause } = event {
                return Some(cause);
            }
        }
        None
    })
    .await
    .unwrap();
    assert_eq!(cause.as_deref(), Some("network unreachable"));

    // Act: network comes back
    service.set_reachability(Reachability::Reachable);
    wait_for(&client, &service, ConnectionState::Connected).await;

    // Assert
    let reconnected = timeout(Duration::from_secs(2), async {
        while let Some(event) = events.recv().await {
            if let ClientEvent::ConnectComplete { reconnect, .. } = event {
                return reconnect;
            }
        }
        false
    })
    .await
    .unwrap();
    assert!(reconnected);
    assert_eq!(factory.engine("roaming").unwrap().connect_calls(), 2);
}

#[tokio::test]
async fn test_repeated_reachability_reports_are_ignored() {
    let (service, factory) = service();
    let (client, _events) =
        connected_client(&service, "steady", ConnectOptions::persistent()).await;

    service.set_reachability(Reachability::Reachable);
    service.set_reachability(Reachability::Reachable);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(client.is_connected().await);
    assert_eq!(service.reachability(), Reachability::Reachable);
    assert_eq!(factory.engine("steady").unwrap().connect_calls(), 1);
}

#[tokio::test]
async fn test_apply_counts_affected_connections() {
    let (service, factory) = service();
    let (_persistent, _p_events) =
        connected_client(&service, "persistent", ConnectOptions::persistent()).await;
    let (clean, _c_events) = connected_client(&service, "clean", ConnectOptions::default()).await;
    let (_idle, _i_events) =
        MqttClient::new(service.clone(), BROKER, "idle", "net", AckMode::Auto)
            .await
            .unwrap();

    let lost = NetworkMonitor::apply(service.registry(), Reachability::Unreachable).await;
    assert_eq!(lost, 1, "only the persistent session is dropped early");
    assert!(clean.is_connected().await);

    let restarted = NetworkMonitor::apply(service.registry(), Reachability::Reachable).await;
    assert_eq!(restarted, 1);
    assert_eq!(factory.engine("persistent").unwrap().connect_calls(), 2);
    assert_eq!(factory.engine("idle").unwrap().connect_calls(), 0);

    let again = NetworkMonitor::apply(service.registry(), Reachability::Reachable).await;
    assert_eq!(again, 0);
}

#[tokio::test]
async fn test_explicit_disconnect_is_not_recovered() {
    let (service, factory) = service();
    let (client, _events) =
        connected_client(&service, "parked", ConnectOptions::persistent()).await;
    client.disconnect(None).await.unwrap();

    let restarted = NetworkMonitor::apply(service.registry(), Reachability::Reachable).await;

    assert_eq!(restarted, 0);
    assert!(!client.is_connected().await);
    assert_eq!(factory.engine("parked").unwrap().connect_calls(), 1);
}

#[tokio::test]
async fn test_messages_buffered_across_outage_are_redelivered() {
    let (service, factory) = service();
    let (client, mut events) =
        MqttClient::new(service.clone(), BROKER, "outage", "net", AckMode::Manual)
            .await
            .unwrap();
    client.connect(ConnectOptions::persistent()).await.unwrap();
    let engine = factory.engine("outage").unwrap();
    engine.inject_message("t", MqttMessage::new("before", QoS::AtLeastOnce));
    timeout(Duration::from_secs(2), async {
        while let Some(event) = events.recv().await {
            if matches!(event, ClientEvent::MessageArrived { .. }) {
                break;
            }
        }
    })
    .await
    .expect("live delivery");

    service.set_reachability(Reachability::Unreachable);
    wait_for(&client, &service, ConnectionState::Disconnected).await;
    service.set_reachability(Reachability::Reachable);
    wait_for(&client, &service, ConnectionState::Connected).await;

    let mut payloads = Vec::new();
    while let Ok(Some(event)) = timeout(Duration::from_millis(200), events.recv()).await {
        if let ClientEvent::MessageArrived { message, .. } = event {
            payloads.push(message.payload_str());
        }
    }
    assert_eq!(payloads, vec!["before"], "unacknowledged message redelivered once");
}
