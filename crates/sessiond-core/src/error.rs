//! Broker error taxonomy.
//!
//! Every operation surfaced by the engine fails with one of these
//! variants. The taxonomy is deliberately small so callers (and the
//! wire layer) can branch on the failure class without string matching:
//!
//! - [`BrokerError::InvalidArgument`] and [`BrokerError::NotSupported`]
//!   are rejected *before* the authorization gate is consulted, so a
//!   malformed request never leaks state through the policy oracle.
//! - [`BrokerError::Denied`] covers both an explicit policy denial and
//!   an unreachable oracle (never silently allowed).
//! - [`BrokerError::NotFound`] is address resolution failure and is
//!   never conflated with a denial.
//! - [`BrokerError::Internal`] marks invariant violations; the affected
//!   operation is aborted loudly rather than continued in an
//!   inconsistent state.

use thiserror::Error;

/// Errors returned by broker operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BrokerError {
    /// The request carried a malformed or out-of-range argument.
    ///
    /// Rejected before any gate consultation; no state change occurred.
    #[error("invalid argument: {reason}")]
    InvalidArgument {
        /// Description of the rejected argument.
        reason: String,
    },

    /// The operation is not supported by the target object.
    ///
    /// Rejected before any gate consultation; no state change occurred.
    #[error("not supported: {reason}")]
    NotSupported {
        /// Why the target cannot service the request.
        reason: String,
    },

    /// The authorization gate rejected the operation.
    #[error("access denied: {reason}")]
    Denied {
        /// Reason surfaced to the originator.
        reason: String,
    },

    /// Address resolution failed; no such object.
    #[error("no such object: {address}")]
    NotFound {
        /// The address that failed to resolve.
        address: String,
    },

    /// Descriptor or allocation failure during lease creation.
    ///
    /// All partially created state for the attempt has been rolled
    /// back: no orphaned inhibitor id, no leaked descriptor.
    #[error("resource exhausted: {reason}")]
    ResourceExhausted {
        /// Description of the exhausted resource.
        reason: String,
    },

    /// Internal invariant violation.
    #[error("internal invariant violated: {reason}")]
    Internal {
        /// The violated invariant.
        reason: String,
    },
}

impl BrokerError {
    /// Create an invalid-argument error.
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Create a not-supported error.
    pub fn not_supported(reason: impl Into<String>) -> Self {
        Self::NotSupported {
            reason: reason.into(),
        }
    }

    /// Create a denied error.
    pub fn denied(reason: impl Into<String>) -> Self {
        Self::Denied {
            reason: reason.into(),
        }
    }

    /// Create a not-found error for an address.
    pub fn not_found(address: impl Into<String>) -> Self {
        Self::NotFound {
            address: address.into(),
        }
    }

    /// Create a resource-exhausted error.
    pub fn resource_exhausted(reason: impl Into<String>) -> Self {
        Self::ResourceExhausted {
            reason: reason.into(),
        }
    }

    /// Create an internal invariant-violation error.
    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }

    /// Returns `true` if the failure was detected before the
    /// authorization gate was consulted.
    #[must_use]
    pub const fn is_pre_gate(&self) -> bool {
        matches!(
            self,
            Self::InvalidArgument { .. } | Self::NotSupported { .. } | Self::NotFound { .. }
        )
    }
}

/// Result type for broker operations.
pub type BrokerResult<T> = Result<T, BrokerError>;
