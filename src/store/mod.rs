//! Durable buffer for inbound messages
//!
//! A message that arrives from the broker is written here before it is handed
//! to the application, and stays until the application acknowledges it. On
//! (re)connection the coordinator reads the backlog back in arrival order.

use crate::message::{ConnectionHandle, MessageId, MqttMessage};
use chrono::{DateTime, Utc};
use thiserror::Error;

pub mod sqlite;

pub use sqlite::SqliteMessageStore;

/// Store error types
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Corrupt record {id}: {reason}")]
    CorruptRecord { id: String, reason: String },

    #[error("Store lock poisoned")]
    Poisoned,
}

/// A buffered inbound message
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub id: MessageId,
    pub handle: ConnectionHandle,
    pub topic: String,
    pub message: MqttMessage,
    pub arrived_at: DateTime<Utc>,
}

/// Storage for arrived-but-unacknowledged messages, keyed by connection handle.
///
/// Implementations must tolerate concurrent use from several coordinators and
/// keep per-handle arrival order.
pub trait MessageStore: Send + Sync {
    /// Persist a message and return its freshly assigned id
    fn store(
        &self,
        handle: &ConnectionHandle,
        topic: &str,
        message: &MqttMessage,
    ) -> Result<MessageId, StoreError>;

    /// Remove one record. `Ok(false)` means nothing matched, which is not an error.
    fn discard(&self, handle: &ConnectionHandle, id: &MessageId) -> Result<bool, StoreError>;

    /// All records for `handle` (or every handle when `None`), oldest first
    fn all_arrived(
        &self,
        handle: Option<&ConnectionHandle>,
    ) -> Result<Vec<StoredMessage>, StoreError>;

    /// Bulk-discard records for `handle` (or everything when `None`), returning the count
    fn clear(&self, handle: Option<&ConnectionHandle>) -> Result<usize, StoreError>;
}
