//! Error types for the client core.
//!
//! Everything that crosses a completion sink is a [`KelpError`]; richer
//! provider-side detail ([`ConfigError`]) is folded into it at the
//! boundary so errors stay cloneable for fan-out (a parser error is
//! delivered both to the request and into the row stream).

use crate::retry::RetryReason;
use kelp_config::provider::{CancelCause, ConfigError};
use std::fmt;

/// Why a request was cancelled instead of completed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancellationReason {
    /// The deadline registered with the timer expired.
    Timeout,
    /// The core shut down while the request was in flight (or arrived after).
    Shutdown,
    /// The operation completed on another node/connection first.
    RetriedElsewhere,
    /// The channel that carried the request went away before a response.
    StoppedListening,
    /// The retry strategy declined to reschedule after a dispatch failure.
    NoMoreRetries(RetryReason),
}

impl fmt::Display for CancellationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancellationReason::Timeout => f.write_str("timeout"),
            CancellationReason::Shutdown => f.write_str("shutdown"),
            CancellationReason::RetriedElsewhere => f.write_str("retried elsewhere"),
            CancellationReason::StoppedListening => f.write_str("stopped listening"),
            CancellationReason::NoMoreRetries(reason) => {
                write!(f, "no more retries ({})", reason)
            }
        }
    }
}

/// The error type delivered through request completion sinks and returned
/// by the synchronous validation paths.
#[derive(Clone, Debug, thiserror::Error)]
pub enum KelpError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The requested collection is not known to the channel.
    #[error("collection not found: {0}")]
    CollectionNotFound(String),

    /// The cluster does not support the requested feature.
    #[error("feature not available: {0}")]
    FeatureNotAvailable(String),

    /// The request was cancelled; `context` names the operation.
    #[error("request cancelled ({reason}): {context}")]
    RequestCanceled {
        reason: CancellationReason,
        context: String,
    },

    #[error("config error: {0}")]
    Config(String),

    #[error("global config not found")]
    GlobalConfigNotFound,

    #[error("unsupported config mechanism")]
    UnsupportedConfigMechanism,

    #[error("already shut down")]
    AlreadyShutdown,

    #[error("{0}")]
    Generic(String),
}

impl From<ConfigError> for KelpError {
    fn from(error: ConfigError) -> Self {
        match error {
            ConfigError::GlobalConfigNotFound => KelpError::GlobalConfigNotFound,
            ConfigError::UnsupportedMechanism => KelpError::UnsupportedConfigMechanism,
            ConfigError::AlreadyShutdown => KelpError::AlreadyShutdown,
            ConfigError::Canceled {
                cause: CancelCause::Shutdown,
            } => KelpError::RequestCanceled {
                reason: CancellationReason::Shutdown,
                context: "config request".to_string(),
            },
            ConfigError::Canceled {
                cause: CancelCause::Timeout,
            } => KelpError::RequestCanceled {
                reason: CancellationReason::Timeout,
                context: "config request".to_string(),
            },
            other => KelpError::Config(other.to_string()),
        }
    }
}
