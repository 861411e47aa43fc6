//! SQLite-backed message store.

use super::{MessageStore, StoreError, StoredMessage};
use crate::message::{ConnectionHandle, MessageId, MqttMessage, QoS};
use chrono::{TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS arrived_messages (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        handle TEXT NOT NULL,
        topic TEXT NOT NULL,
        payload BLOB NOT NULL,
        qos INTEGER NOT NULL,
        retained INTEGER NOT NULL,
        duplicate INTEGER NOT NULL,
        arrived_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_arrived_messages_handle
        ON arrived_messages (handle, arrived_at, seq);
";

struct Inner {
    conn: Connection,
    /// Last assigned arrival timestamp (epoch millis). Keeps timestamps strictly increasing.
    last_arrival: i64,
}

/// Message store persisted in a local SQLite database.
pub struct SqliteMessageStore {
    inner: Mutex<Inner>,
}

impl SqliteMessageStore {
    /// Opens or creates a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open(path)?)
    }

    /// Creates an in-memory store (for testing).
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        let last_arrival: Option<i64> = conn
            .query_row("SELECT MAX(arrived_at) FROM arrived_messages", [], |row| {
                row.get(0)
            })
            .optional()?
            .flatten();

        Ok(Self {
            inner: Mutex::new(Inner {
                conn,
                last_arrival: last_arrival.unwrap_or(0),
            }),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Counts buffered messages for a handle.
    pub fn count(&self, handle: &ConnectionHandle) -> Result<usize, StoreError> {
        let inner = self.lock()?;
        let count: i64 = inner.conn.query_row(
            "SELECT COUNT(*) FROM arrived_messages WHERE handle = ?1",
            params![handle.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

type RawRow = (String, String, String, Vec<u8>, i64, bool, bool, i64);

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn into_stored(raw: RawRow) -> Result<StoredMessage, StoreError> {
    let (id, handle, topic, payload, qos, retained, duplicate, arrived_at) = raw;
    let qos = u8::try_from(qos)
        .ok()
        .and_then(QoS::from_u8)
        .ok_or_else(|| StoreError::CorruptRecord {
            id: id.clone(),
            reason: format!("invalid qos {qos}"),
        })?;
    let arrived_at = Utc
        .timestamp_millis_opt(arrived_at)
        .single()
        .ok_or_else(|| StoreError::CorruptRecord {
            id: id.clone(),
            reason: format!("invalid timestamp {arrived_at}"),
        })?;

    Ok(StoredMessage {
        id: MessageId::from(id),
        handle: ConnectionHandle::from(handle.as_str()),
        topic,
        message: MqttMessage {
            payload,
            qos,
            retained,
            duplicate,
        },
        arrived_at,
    })
}

impl MessageStore for SqliteMessageStore {
    fn store(
        &self,
        handle: &ConnectionHandle,
        topic: &str,
        message: &MqttMessage,
    ) -> Result<MessageId, StoreError> {
        let mut inner = self.lock()?;
        let id = MessageId::generate();
        let arrived_at = Utc::now().timestamp_millis().max(inner.last_arrival + 1);

        inner.conn.execute(
            "INSERT INTO arrived_messages
             (id, handle, topic, payload, qos, retained, duplicate, arrived_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                id.as_str(),
                handle.as_str(),
                topic,
                message.payload,
                message.qos.as_u8() as i64,
                message.retained,
                message.duplicate,
                arrived_at,
            ],
        )?;
        inner.last_arrival = arrived_at;

        debug!(handle = %handle, id = %id, topic = %topic, "Buffered arrived message");
        Ok(id)
    }

    fn discard(&self, handle: &ConnectionHandle, id: &MessageId) -> Result<bool, StoreError> {
        let inner = self.lock()?;
        let rows_affected = inner.conn.execute(
            "DELETE FROM arrived_messages WHERE handle = ?1 AND id = ?2",
            params![handle.as_str(), id.as_str()],
        )?;
        Ok(rows_affected > 0)
    }

    fn all_arrived(
        &self,
        handle: Option<&ConnectionHandle>,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        let inner = self.lock()?;
        let raw = match handle {
            Some(handle) => {
                let mut stmt = inner.conn.prepare(
                    "SELECT id, handle, topic, payload, qos, retained, duplicate, arrived_at
                     FROM arrived_messages WHERE handle = ?1 ORDER BY arrived_at, seq",
                )?;
                let rows = stmt.query_map(params![handle.as_str()], read_row)?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
            None => {
                let mut stmt = inner.conn.prepare(
                    "SELECT id, handle, topic, payload, qos, retained, duplicate, arrived_at
                     FROM arrived_messages ORDER BY arrived_at, seq",
                )?;
                let rows = stmt.query_map([], read_row)?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
        };

        raw.into_iter().map(into_stored).collect()
    }

    fn clear(&self, handle: Option<&ConnectionHandle>) -> Result<usize, StoreError> {
        let inner = self.lock()?;
        let rows_affected = match handle {
            Some(handle) => inner.conn.execute(
                "DELETE FROM arrived_messages WHERE handle = ?1",
                params![handle.as_str()],
            )?,
            None => inner.conn.execute("DELETE FROM arrived_messages", [])?,
        };
        Ok(rows_affected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(name: &str) -> ConnectionHandle {
        ConnectionHandle::new("tcp://localhost:1883", name, "tests")
    }

    #[test]
    fn test_store_and_read_back() {
        let store = SqliteMessageStore::in_memory().unwrap();
        let h = handle("a");
        let message = MqttMessage::new("hello", QoS::ExactlyOnce).retained(true);

        let id = store.store(&h, "sensors/1", &message).unwrap();
        let all = store.all_arrived(Some(&h)).unwrap();

        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, id);
        assert_eq!(all[0].topic, "sensors/1");
        assert_eq!(all[0].message, message);
        assert_eq!(all[0].handle, h);
    }

    #[test]
    fn test_discard_missing_is_not_an_error() {
        let store = SqliteMessageStore::in_memory().unwrap();
        let h = handle("a");
        let id = store.store(&h, "t", &MqttMessage::new("x", QoS::AtLeastOnce)).unwrap();

        assert!(store.discard(&h, &id).unwrap());
        assert!(!store.discard(&h, &id).unwrap());
        assert!(!store.discard(&h, &MessageId::generate()).unwrap());
    }

    #[test]
    fn test_discard_requires_matching_handle() {
        let store = SqliteMessageStore::in_memory().unwrap();
        let id = store
            .store(&handle("a"), "t", &MqttMessage::new("x", QoS::AtLeastOnce))
            .unwrap();

        assert!(!store.discard(&handle("b"), &id).unwrap());
        assert_eq!(store.count(&handle("a")).unwrap(), 1);
    }

    #[test]
    fn test_arrival_timestamps_strictly_increase() {
        let store = SqliteMessageStore::in_memory().unwrap();
        let h = handle("a");
        for i in 0..20 {
            store
                .store(&h, "t", &MqttMessage::new(format!("{i}"), QoS::AtMostOnce))
                .unwrap();
        }

        let all = store.all_arrived(Some(&h)).unwrap();
        assert!(all.windows(2).all(|w| w[0].arrived_at < w[1].arrived_at));
        let payloads: Vec<String> = all.iter().map(|m| m.message.payload_str()).collect();
        let expected: Vec<String> = (0..20).map(|i| i.to_string()).collect();
        assert_eq!(payloads, expected);
    }

    #[test]
    fn test_clear_scoped_and_global() {
        let store = SqliteMessageStore::in_memory().unwrap();
        let m = MqttMessage::new("x", QoS::AtLeastOnce);
        store.store(&handle("a"), "t", &m).unwrap();
        store.store(&handle("a"), "t", &m).unwrap();
        store.store(&handle("b"), "t", &m).unwrap();

        assert_eq!(store.clear(Some(&handle("a"))).unwrap(), 2);
        assert_eq!(store.all_arrived(None).unwrap().len(), 1);
        assert_eq!(store.clear(None).unwrap(), 1);
        assert!(store.all_arrived(None).unwrap().is_empty());
    }
}
