//! Caller-visible error taxonomy
//!
//! Every failure that leaves the coordinator is one of these variants. Engine and
//! store errors are wrapped with the connection handle they happened on, and the
//! whole type is `Clone` so one connect outcome can be handed to every caller that
//! was waiting on it.

use crate::coordinator::ConnectionState;
use crate::engine::EngineError;
use crate::message::ConnectionHandle;
use crate::store::StoreError;
use thiserror::Error;

/// Main error type for service operations
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ServiceError {
    #[error("Not connected ({handle}): current state {state:?}")]
    NotConnected {
        handle: ConnectionHandle,
        state: ConnectionState,
    },

    #[error("Engine failure ({handle}): {message}")]
    EngineFailure {
        handle: ConnectionHandle,
        message: String,
    },

    #[error("Persistence failure ({handle}): {message}")]
    Persistence {
        handle: ConnectionHandle,
        message: String,
    },

    #[error("Timed out ({handle}): {message}")]
    Timeout {
        handle: ConnectionHandle,
        message: String,
    },

    #[error("Unknown connection handle: {0}")]
    InvalidHandle(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Service is no longer available")]
    ServiceUnavailable,
}

impl ServiceError {
    /// Wrap an engine error with handle context
    pub fn engine(handle: &ConnectionHandle, error: EngineError) -> Self {
        match error {
            EngineError::Timeout(message) => Self::Timeout {
                handle: handle.clone(),
                message,
            },
            other => Self::EngineFailure {
                handle: handle.clone(),
                message: other.to_string(),
            },
        }
    }

    /// Wrap a store error with handle context
    pub fn persistence(handle: &ConnectionHandle, error: StoreError) -> Self {
        Self::Persistence {
            handle: handle.clone(),
            message: error.to_string(),
        }
    }

    pub fn not_connected(handle: &ConnectionHandle, state: ConnectionState) -> Self {
        Self::NotConnected {
            handle: handle.clone(),
            state,
        }
    }

    pub fn is_not_connected(&self) -> bool {
        matches!(self, Self::NotConnected { .. })
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;
