//! Error types for cellmap-core.
//!
//! Most failures in the sampling pipeline are not surfaced to callers at all:
//! provider faults degrade to "no data from this source", validation
//! rejections are plain outcomes, and persistence failures are logged. The
//! variants here are what provider implementations and the store hand back
//! before that policy is applied.

use thiserror::Error;

use cellmap_types::LocationSource;

/// Errors that can occur in the sampling pipeline.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A location provider failed to answer a query or subscription.
    #[error("Location provider {provider} failed: {message}")]
    Provider {
        /// The positioning source that failed.
        provider: LocationSource,
        /// Description of the failure.
        message: String,
    },

    /// The telephony collaborator failed.
    #[error("Telephony error: {0}")]
    Telephony(String),

    /// Event sink was dropped while a provider was still delivering.
    #[error("Event channel closed")]
    ChannelClosed,

    /// Persistence error.
    #[error(transparent)]
    Store(#[from] cellmap_store::Error),
}

impl Error {
    /// Create a provider error for `provider`.
    pub fn provider(provider: LocationSource, message: impl Into<String>) -> Self {
        Self::Provider {
            provider,
            message: message.into(),
        }
    }
}

/// Result type for cellmap-core operations.
pub type Result<T> = std::result::Result<T, Error>;
