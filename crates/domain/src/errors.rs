//! Error and retry-policy types for the sensor domain.
//!
//! Each port has its own error type: [`StoreError`] for the document store,
//! [`PublishError`] for event publishers, [`SecretError`] for secret
//! providers.
//!
//! [`RetryPolicy`] is a cross-cutting concern: any error type that participates
//! in retry decisions must be able to produce a [`RetryPolicy`].

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{Collection, DocumentId};

// ---------------------------------------------------------------------------
// Retry semantics
// ---------------------------------------------------------------------------

/// Whether an error condition is safe to retry and, if so, after what delay.
///
/// Returned by infrastructure error types to let the producer loop decide
/// whether to re-send a batch or give up.
///
/// - `Retryable` errors: timeouts, throttling, transient server errors.
/// - `NonRetryable` errors: rejected credentials, malformed requests,
///   invalid configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RetryPolicy {
    /// The operation may be retried.
    ///
    /// `after` optionally specifies the minimum delay before retrying (e.g.
    /// derived from a `Retry-After` response header).
    Retryable {
        /// Minimum back-off before the next attempt. `None` means apply the
        /// caller's own back-off schedule.
        after: Option<Duration>,
    },
    /// The operation must not be retried.
    NonRetryable,
}

impl RetryPolicy {
    /// Returns `true` for [`RetryPolicy::Retryable`].
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable { .. })
    }
}

// ---------------------------------------------------------------------------
// Document store errors
// ---------------------------------------------------------------------------

/// Errors produced by a [`crate::DocumentStore`] or the repository on top of it.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The referenced document does not exist.
    #[error("document {id} not found in '{collection}'")]
    NotFound {
        /// Collection that was searched.
        collection: Collection,
        /// Identifier that was not found.
        id: DocumentId,
    },

    /// A document with the same `_id` already exists.
    #[error("document {id} already exists in '{collection}'")]
    DuplicateId {
        /// Target collection.
        collection: Collection,
        /// Conflicting identifier.
        id: DocumentId,
    },

    /// The insert would violate a unique constraint of the collection.
    #[error("unique constraint ({fields}) violated in '{collection}'")]
    DuplicateKey {
        /// Target collection.
        collection: Collection,
        /// Comma-separated field names of the violated constraint.
        fields: String,
    },

    /// A document could not be converted to or from its stored form.
    #[error("serialisation error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The document was stored without an `_id` or is not a JSON object.
    #[error("malformed document in '{collection}': {reason}")]
    Malformed {
        /// Collection the document belongs to.
        collection: Collection,
        /// What is wrong with it.
        reason: String,
    },

    /// The storage backend failed.
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

// ---------------------------------------------------------------------------
// Publisher errors
// ---------------------------------------------------------------------------

/// Errors produced by an [`crate::EventPublisher`].
#[derive(Debug, Error)]
pub enum PublishError {
    /// The messaging endpoint rejected the credentials (401/403).
    #[error("publisher rejected credentials: {message}")]
    Unauthorized {
        /// Response detail from the endpoint.
        message: String,
    },

    /// The endpoint is throttling this client.
    #[error("publisher throttled")]
    Throttled {
        /// Delay requested by the endpoint, if it sent one.
        retry_after: Option<Duration>,
    },

    /// The endpoint is temporarily unavailable (5xx).
    #[error("publisher unavailable (status {status})")]
    Unavailable {
        /// HTTP status returned.
        status: u16,
    },

    /// The endpoint rejected the batch itself (non-retryable 4xx).
    #[error("publisher rejected batch (status {status}): {message}")]
    Rejected {
        /// HTTP status returned.
        status: u16,
        /// Response detail from the endpoint.
        message: String,
    },

    /// The request never produced a response (connect error, timeout).
    #[error("publisher transport error: {0}")]
    Transport(String),

    /// The events could not be encoded.
    #[error("event encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl PublishError {
    /// Classifies this error for the producer's retry loop.
    pub fn retry_policy(&self) -> RetryPolicy {
        match self {
            Self::Throttled { retry_after } => RetryPolicy::Retryable {
                after: *retry_after,
            },
            Self::Unavailable { .. } | Self::Transport(_) => RetryPolicy::Retryable { after: None },
            Self::Unauthorized { .. } | Self::Rejected { .. } | Self::Encoding(_) => {
                RetryPolicy::NonRetryable
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Secret provider errors
// ---------------------------------------------------------------------------

/// Errors produced by a [`crate::SecretProvider`].
#[derive(Debug, Error)]
pub enum SecretError {
    /// The secret name is not acceptable to the provider.
    #[error("invalid secret name '{0}'")]
    InvalidName(String),

    /// The provider refused access to the secret.
    #[error("access to secret '{name}' denied")]
    AccessDenied {
        /// Secret that was requested.
        name: String,
    },

    /// The provider could not be reached or returned an unexpected response.
    #[error("secret provider error: {0}")]
    Provider(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttling_carries_the_requested_delay() {
        let err = PublishError::Throttled {
            retry_after: Some(Duration::from_secs(3)),
        };
        assert_eq!(
            err.retry_policy(),
            RetryPolicy::Retryable {
                after: Some(Duration::from_secs(3))
            }
        );
    }

    #[test]
    fn credential_and_request_errors_are_not_retried() {
        let unauthorized = PublishError::Unauthorized {
            message: "expired".into(),
        };
        let rejected = PublishError::Rejected {
            status: 413,
            message: "too large".into(),
        };
        assert!(!unauthorized.retry_policy().is_retryable());
        assert!(!rejected.retry_policy().is_retryable());
    }

    #[test]
    fn transient_errors_are_retried_on_caller_schedule() {
        assert_eq!(
            PublishError::Unavailable { status: 503 }.retry_policy(),
            RetryPolicy::Retryable { after: None }
        );
        assert!(PublishError::Transport("reset".into())
            .retry_policy()
            .is_retryable());
    }
}
