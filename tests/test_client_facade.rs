//! Client facade tests
//!
//! Drive [`MqttClient`] end to end over a mock engine: token correlation,
//! acknowledgement modes and handle invalidation.

use futures::future::join_all;
use mqttlink::client::{AckMode, ClientEvent, MqttClient};
use mqttlink::error::ServiceError;
use mqttlink::message::{ConnectOptions, MqttMessage, QoS};
use mqttlink::ping::NoopWakeLock;
use mqttlink::service::MqttService;
use mqttlink::store::SqliteMessageStore;
use mqttlink::testing::{MockEngine, MockEngineFactory};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{sleep, timeout};

const BROKER: &str = "tcp://broker.test:1883";

struct Fixture {
    service: Arc<MqttService>,
    factory: Arc<MockEngineFactory>,
    store: Arc<SqliteMessageStore>,
}

impl Fixture {
    fn new() -> Self {
        let factory = Arc::new(MockEngineFactory::new());
        let store = Arc::new(SqliteMessageStore::in_memory().unwrap());
        let service = Arc::new(MqttService::new(
            store.clone(),
            factory.clone(),
            Arc::new(NoopWakeLock),
        ));
        Self {
            service,
            factory,
            store,
        }
    }

    async fn client(
        &self,
        client_id: &str,
        ack_mode: AckMode,
    ) -> (MqttClient, UnboundedReceiver<ClientEvent>, Arc<MockEngine>) {
        let (client, events) =
            MqttClient::new(self.service.clone(), BROKER, client_id, "facade-tests", ack_mode)
                .await
                .unwrap();
        let engine = self.factory.engine(client_id).unwrap();
        (client, events, engine)
    }
}

async fn next_arrival(events: &mut UnboundedReceiver<ClientEvent>) -> ClientEvent {
    timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await {
                Some(event @ ClientEvent::MessageArrived { .. }) => return event,
                Some(_) => continue,
                None => panic!("client event stream closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for a message")
}

async fn wait_for_count(store: &SqliteMessageStore, client: &MqttClient, expected: usize) {
    for _ in 0..100 {
        if store.count(client.handle()).unwrap() == expected {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("store never reached {expected} messages");
}

#[tokio::test]
async fn test_operations_resolve_through_tokens() {
    // Arrange
    let fixture = Fixture::new();
    let (client, _events, engine) = fixture.client("tokens", AckMode::Auto).await;

    // Act
    client.connect(ConnectOptions::persistent()).await.unwrap();
    client
        .subscribe(vec![("sensors/#".to_string(), QoS::AtLeastOnce)])
        .await
        .unwrap();
    client
        .publish("sensors/a", MqttMessage::new("21.5", QoS::AtLeastOnce))
        .await
        .unwrap();
    client.unsubscribe(vec!["sensors/#".to_string()]).await.unwrap();

    // Assert
    assert!(client.is_connected().await);
    assert_eq!(engine.subscribed().len(), 1);
    assert_eq!(engine.published().len(), 1);
    assert_eq!(client.pending_operations(), 0);
}

#[tokio::test]
async fn test_failures_arrive_on_the_right_token() {
    let fixture = Fixture::new();
    let (client, _events, _) = fixture.client("failures", AckMode::Auto).await;

    let publish = client
        .publish("a/b", MqttMessage::new("x", QoS::AtMostOnce))
        .await;
    let disconnect = client.disconnect(None).await;

    assert!(publish.unwrap_err().is_not_connected());
    assert!(disconnect.unwrap_err().is_not_connected());
    assert_eq!(client.pending_operations(), 0);
}

#[tokio::test]
async fn test_concurrent_connects_all_resolve() {
    let fixture = Fixture::new();
    let (client, _events, engine) = fixture.client("concurrent", AckMode::Auto).await;
    engine.hold_connects();

    let release = async {
        sleep(Duration::from_millis(50)).await;
        engine.release_connects();
    };
    let connects = join_all((0..3).map(|_| client.connect(ConnectOptions::persistent())));
    let (results, _) = tokio::join!(connects, release);

    assert!(results.iter().all(Result::is_ok), "{results:?}");
    assert_eq!(engine.connect_calls(), 1);
    assert_eq!(client.pending_operations(), 0);
}

#[tokio::test]
async fn test_auto_ack_removes_message_after_handover() {
    let fixture = Fixture::new();
    let (client, mut events, engine) = fixture.client("auto", AckMode::Auto).await;
    client.connect(ConnectOptions::persistent()).await.unwrap();

    engine.inject_message("t", MqttMessage::new("hello", QoS::AtLeastOnce));

    match next_arrival(&mut events).await {
        ClientEvent::MessageArrived { topic, message, .. } => {
            assert_eq!(topic, "t");
            assert_eq!(message.payload_str(), "hello");
        }
        other => panic!("unexpected event {other:?}"),
    }
    wait_for_count(&fixture.store, &client, 0).await;
}

#[tokio::test]
async fn test_manual_ack_keeps_message_until_acknowledged() {
    let fixture = Fixture::new();
    let (client, mut events, engine) = fixture.client("manual", AckMode::Manual).await;
    client.connect(ConnectOptions::persistent()).await.unwrap();

    engine.inject_message("t", MqttMessage::new("hello", QoS::AtLeastOnce));
    let ClientEvent::MessageArrived { id, .. } = next_arrival(&mut events).await else {
        unreachable!("next_arrival only returns arrivals");
    };
    sleep(Duration::from_millis(50)).await;
    assert_eq!(fixture.store.count(client.handle()).unwrap(), 1);

    assert!(client.acknowledge(&id).await.unwrap());
    assert!(!client.acknowledge(&id).await.unwrap());
    assert_eq!(fixture.store.count(client.handle()).unwrap(), 0);
}

#[tokio::test]
async fn test_close_invalidates_handle_but_keeps_buffer() {
    // Arrange
    let fixture = Fixture::new();
    let (client, mut events, engine) = fixture.client("closing", AckMode::Manual).await;
    client.connect(ConnectOptions::persistent()).await.unwrap();
    engine.inject_message("t", MqttMessage::new("unacked", QoS::AtLeastOnce));
    next_arrival(&mut events).await;
    let handle = client.handle().clone();

    // Act
    client.close().await.unwrap();

    // Assert
    let err = fixture
        .service
        .publish(
            &handle,
            mqttlink::message::ActivityToken(1),
            "t".to_string(),
            MqttMessage::new("x", QoS::AtMostOnce),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::InvalidHandle(_)));
    assert!(matches!(
        fixture.service.close(&handle).await,
        Err(ServiceError::InvalidHandle(_))
    ));
    assert_eq!(fixture.store.count(&handle).unwrap(), 1);
    assert!(!fixture.service.is_connected(&handle).await);
}

#[tokio::test]
async fn test_reopened_handle_redelivers_backlog() {
    let fixture = Fixture::new();
    let (client, mut events, engine) = fixture.client("reopen", AckMode::Manual).await;
    client.connect(ConnectOptions::persistent()).await.unwrap();
    engine.inject_message("t", MqttMessage::new("kept", QoS::AtLeastOnce));
    next_arrival(&mut events).await;
    client.close().await.unwrap();

    let (client, mut events, _) = fixture.client("reopen", AckMode::Auto).await;
    client.connect(ConnectOptions::persistent()).await.unwrap();

    let ClientEvent::MessageArrived { message, .. } = next_arrival(&mut events).await else {
        unreachable!("next_arrival only returns arrivals");
    };
    assert_eq!(message.payload_str(), "kept");
    wait_for_count(&fixture.store, &client, 0).await;
}

#[tokio::test]
async fn test_empty_client_id_rejected() {
    let fixture = Fixture::new();

    let result = MqttClient::new(fixture.service.clone(), BROKER, "", "app", AckMode::Auto).await;

    assert!(matches!(result, Err(ServiceError::InvalidArgument(_))));
}

#[tokio::test]
async fn test_connection_records_sorted_by_handle() {
    let fixture = Fixture::new();
    let (b, _b_events, _) = fixture.client("b-client", AckMode::Auto).await;
    let (a, _a_events, _) = fixture.client("a-client", AckMode::Auto).await;
    a.connect(ConnectOptions::default()).await.unwrap();

    let records = fixture.service.connection_records().await;

    assert_eq!(records.len(), 2);
    assert_eq!(&records[0].handle, a.handle());
    assert_eq!(&records[1].handle, b.handle());
    assert_eq!(records[0].clean_session, Some(true));
    assert_eq!(records[1].clean_session, None);
}

#[tokio::test]
async fn test_second_client_on_a_handle_never_resolves_first_clients_tokens() {
    // Arrange
    let fixture = Fixture::new();
    let (first, _first_events, engine) = fixture.client("shared", AckMode::Auto).await;
    engine.hold_connects();

    // Act: a second client takes over the handle while the first connect is in flight
    let takeover = async {
        sleep(Duration::from_millis(20)).await;
        let (second, second_events, _) = fixture.client("shared", AckMode::Auto).await;
        engine.release_connects();
        (second, second_events)
    };
    let (first_result, (second, _second_events)) =
        tokio::join!(first.connect(ConnectOptions::persistent()), takeover);

    // Assert: the first caller is released, the second sees only its own outcomes
    assert_eq!(first_result, Err(ServiceError::ServiceUnavailable));
    assert_eq!(second.connect(ConnectOptions::persistent()).await, Ok(()));
    second
        .publish("a/b", MqttMessage::new("x", QoS::AtLeastOnce))
        .await
        .unwrap();
    assert_eq!(second.pending_operations(), 0);
    assert_eq!(engine.connect_calls(), 1);
    assert_ne!(fixture.service.next_token(), fixture.service.next_token());
}
