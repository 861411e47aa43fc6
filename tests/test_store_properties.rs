//! Property tests for the durable inbound buffer

use mqttlink::message::{ConnectionHandle, MqttMessage, QoS};
use mqttlink::store::{MessageStore, SqliteMessageStore};
use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use tempfile::TempDir;

fn handle(index: usize) -> ConnectionHandle {
    ConnectionHandle::new("tcp://broker.test:1883", &format!("client-{index}"), "props")
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Each handle sees exactly its own messages, oldest first
    #[test]
    fn prop_handles_are_isolated_and_ordered(
        arrivals in prop::collection::vec((0usize..3, "[a-z]{0,12}"), 0..40)
    ) {
        let store = SqliteMessageStore::in_memory().unwrap();
        for (index, payload) in &arrivals {
            store
                .store(&handle(*index), "t", &MqttMessage::new(payload.as_str(), QoS::AtLeastOnce))
                .unwrap();
        }

        for index in 0..3 {
            let expected: Vec<String> = arrivals
                .iter()
                .filter(|(i, _)| *i == index)
                .map(|(_, payload)| payload.clone())
                .collect();
            let actual: Vec<String> = store
                .all_arrived(Some(&handle(index)))
                .unwrap()
                .iter()
                .map(|stored| stored.message.payload_str())
                .collect();
            prop_assert_eq!(actual, expected);
        }
        prop_assert_eq!(store.all_arrived(None).unwrap().len(), arrivals.len());
    }

    /// Discarding a subset leaves exactly the rest, still in order
    #[test]
    fn prop_discard_removes_only_named_records(
        payloads in prop::collection::vec("[a-z]{1,8}", 1..20),
        mask in prop::collection::vec(any::<bool>(), 20)
    ) {
        let store = SqliteMessageStore::in_memory().unwrap();
        let owner = handle(0);
        let ids: Vec<_> = payloads
            .iter()
            .map(|p| store.store(&owner, "t", &MqttMessage::new(p.as_str(), QoS::AtMostOnce)).unwrap())
            .collect();

        let mut kept = Vec::new();
        for (i, id) in ids.iter().enumerate() {
            if mask[i] {
                prop_assert!(store.discard(&owner, id).unwrap());
                prop_assert!(!store.discard(&owner, id).unwrap());
            } else {
                kept.push(payloads[i].clone());
            }
        }

        let remaining: Vec<String> = store
            .all_arrived(Some(&owner))
            .unwrap()
            .iter()
            .map(|stored| stored.message.payload_str())
            .collect();
        prop_assert_eq!(remaining, kept);
    }

    /// Assigned ids never collide
    #[test]
    fn prop_ids_are_unique(count in 1usize..50) {
        let store = SqliteMessageStore::in_memory().unwrap();
        let ids: HashSet<_> = (0..count)
            .map(|i| store.store(&handle(i % 2), "t", &MqttMessage::new(vec![i as u8], QoS::AtMostOnce)).unwrap())
            .collect();
        prop_assert_eq!(ids.len(), count);
    }
}

#[test]
fn test_buffer_survives_reopen() {
    // Arrange
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("buffer.db");
    let owner = handle(0);
    let kept_id = {
        let store = SqliteMessageStore::open(&path).unwrap();
        let dropped = store
            .store(&owner, "a", &MqttMessage::new("acked", QoS::AtLeastOnce))
            .unwrap();
        let kept = store
            .store(&owner, "b", &MqttMessage::new("pending", QoS::ExactlyOnce).retained(true))
            .unwrap();
        store.discard(&owner, &dropped).unwrap();
        kept
    };

    // Act
    let reopened = SqliteMessageStore::open(&path).unwrap();
    let backlog = reopened.all_arrived(Some(&owner)).unwrap();

    // Assert
    assert_eq!(backlog.len(), 1);
    assert_eq!(backlog[0].id, kept_id);
    assert_eq!(backlog[0].topic, "b");
    assert_eq!(backlog[0].message, MqttMessage::new("pending", QoS::ExactlyOnce).retained(true));
}

#[test]
fn test_new_arrivals_after_reopen_sort_after_old_ones() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("buffer.db");
    let owner = handle(1);
    {
        let store = SqliteMessageStore::open(&path).unwrap();
        store.store(&owner, "t", &MqttMessage::new("first", QoS::AtLeastOnce)).unwrap();
    }

    let store = SqliteMessageStore::open(&path).unwrap();
    store.store(&owner, "t", &MqttMessage::new("second", QoS::AtLeastOnce)).unwrap();

    let payloads: Vec<String> = store
        .all_arrived(Some(&owner))
        .unwrap()
        .iter()
        .map(|stored| stored.message.payload_str())
        .collect();
    assert_eq!(payloads, vec!["first", "second"]);
}

#[test]
fn test_concurrent_writers_keep_handles_isolated_and_ordered() {
    // Arrange
    const WRITERS: usize = 4;
    const PER_WRITER: usize = 30;
    let store = Arc::new(SqliteMessageStore::in_memory().unwrap());

    // Act: each writer stores under its own handle and acknowledges every third message
    let writers: Vec<_> = (0..WRITERS)
        .map(|index| {
            let store = store.clone();
            thread::spawn(move || {
                let owner = handle(index);
                let mut kept = Vec::new();
                for n in 0..PER_WRITER {
                    let payload = format!("w{index}-{n}");
                    let id = store
                        .store(&owner, "t", &MqttMessage::new(payload.as_str(), QoS::AtLeastOnce))
                        .unwrap();
                    if n % 3 == 0 {
                        assert!(store.discard(&owner, &id).unwrap());
                    } else {
                        kept.push(payload);
                    }
                    // reads race the other writers
                    assert_eq!(store.all_arrived(Some(&owner)).unwrap().len(), kept.len());
                }
                kept
            })
        })
        .collect();
    let expected: Vec<Vec<String>> = writers.into_iter().map(|w| w.join().unwrap()).collect();

    // Assert
    for (index, kept) in expected.iter().enumerate() {
        let backlog = store.all_arrived(Some(&handle(index))).unwrap();
        assert!(backlog.iter().all(|stored| stored.handle == handle(index)));
        let payloads: Vec<String> = backlog.iter().map(|stored| stored.message.payload_str()).collect();
        assert_eq!(&payloads, kept);
    }
    let everything = store.all_arrived(None).unwrap();
    assert_eq!(everything.len(), WRITERS * (PER_WRITER - PER_WRITER / 3));
    assert!(everything
        .windows(2)
        .all(|pair| pair[0].arrived_at <= pair[1].arrived_at));
}
