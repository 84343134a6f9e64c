//! Errors surfaced to MDK callers.

use mdk_core::{InteractionError, ServiceKey, TokenError, UplinkError};
use mdk_discovery::ResolveError;
use thiserror::Error;

use crate::config::ConfigError;

/// MDK error.
#[derive(Debug, Error)]
pub enum MdkError {
    /// No matching node arrived before the deadline. Safe to retry.
    #[error("Timed out resolving {0}")]
    ResolutionTimeout(ServiceKey),
    /// The uplink connection is down; pending work was failed. Retry after
    /// reconnect.
    #[error("Uplink disconnected")]
    UplinkDisconnected,
    /// Discovery reported the service as unknown.
    #[error("Service not found: {0}")]
    ServiceNotFound(ServiceKey),
    /// `finish_interaction` without a matching `start_interaction`.
    #[error("Interaction stack underflow")]
    InteractionStackUnderflow,
    /// A context token could not be decoded.
    #[error("Invalid context token: {0}")]
    InvalidContextToken(#[from] TokenError),
    /// The MDK was stopped.
    #[error("MDK stopped")]
    MdkStopped,
    /// The uplink failed to start.
    #[error("Uplink error: {0}")]
    Uplink(#[from] UplinkError),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl From<ResolveError> for MdkError {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::Timeout(key) => Self::ResolutionTimeout(key),
            ResolveError::UplinkDisconnected => Self::UplinkDisconnected,
            ResolveError::NotFound(key) => Self::ServiceNotFound(key),
            ResolveError::Stopped => Self::MdkStopped,
        }
    }
}

impl From<InteractionError> for MdkError {
    fn from(err: InteractionError) -> Self {
        match err {
            InteractionError::StackUnderflow => Self::InteractionStackUnderflow,
        }
    }
}
