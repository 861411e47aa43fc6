//! Registry of live connection coordinators
//!
//! Maps each [`ConnectionHandle`] to its single [`ConnectionCoordinator`]. The
//! registry is an ordinary value shared by `Arc` between the service and the
//! network monitor; there is no process-wide instance.

use crate::coordinator::ConnectionCoordinator;
use crate::error::ServiceError;
use crate::message::ConnectionHandle;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Thread-safe map of connection handles to coordinators
#[derive(Default)]
pub struct ConnectionRegistry {
    coordinators: RwLock<HashMap<ConnectionHandle, Arc<ConnectionCoordinator>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the coordinator for `handle`, creating it with `create` if absent.
    ///
    /// Creation happens under the write lock, so two callers racing on the same
    /// handle always end up sharing one coordinator.
    pub async fn get_or_insert_with<F>(
        &self,
        handle: &ConnectionHandle,
        create: F,
    ) -> Result<Arc<ConnectionCoordinator>, ServiceError>
    where
        F: FnOnce() -> Result<Arc<ConnectionCoordinator>, ServiceError>,
    {
        if let Some(existing) = self.get(handle).await {
            return Ok(existing);
        }

        let mut coordinators = self.coordinators.write().await;
        if let Some(existing) = coordinators.get(handle) {
            return Ok(existing.clone());
        }
        let coordinator = create()?;
        coordinators.insert(handle.clone(), coordinator.clone());
        info!(handle = %handle, "Registered connection");
        Ok(coordinator)
    }

    pub async fn get(&self, handle: &ConnectionHandle) -> Option<Arc<ConnectionCoordinator>> {
        self.coordinators.read().await.get(handle).cloned()
    }

    /// Look up a handle or fail with `InvalidHandle`
    pub async fn require(
        &self,
        handle: &ConnectionHandle,
    ) -> Result<Arc<ConnectionCoordinator>, ServiceError> {
        self.get(handle)
            .await
            .ok_or_else(|| ServiceError::InvalidHandle(handle.to_string()))
    }

    pub async fn remove(&self, handle: &ConnectionHandle) -> Option<Arc<ConnectionCoordinator>> {
        let removed = self.coordinators.write().await.remove(handle);
        if removed.is_some() {
            debug!(handle = %handle, "Removed connection from registry");
        }
        removed
    }

    /// Snapshot of every registered coordinator
    pub async fn all(&self) -> Vec<Arc<ConnectionCoordinator>> {
        self.coordinators.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.coordinators.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.coordinators.read().await.is_empty()
    }
}
