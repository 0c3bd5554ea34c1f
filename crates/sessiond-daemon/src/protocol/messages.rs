//! Wire message types.
//!
//! Requests address users by object address string; responses either
//! carry a payload, an `ok` acknowledgement, or a structured error
//! mirroring the broker's error taxonomy. A [`Response::Lease`] is
//! special: the lease descriptor itself cannot travel as JSON, so the
//! response frame is followed by a one-byte ancillary message carrying
//! the descriptor (see [`super::fd_passing`]).

use serde::{Deserialize, Serialize};
use sessiond_core::{BrokerError, InhibitorInfo, SessionRecord, UserProperties};

/// A request from a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Request {
    /// Enumerate live user addresses.
    ListUsers,
    /// Read one user's derived properties.
    GetUser {
        /// Canonical or self-alias object address.
        address: String,
    },
    /// Forcibly stop all of a user's sessions.
    TerminateUser {
        /// Target object address.
        address: String,
    },
    /// Deliver a signal to all session-owned processes of a user.
    KillUser {
        /// Target object address.
        address: String,
        /// Signal number.
        signal: i32,
    },
    /// Secure-lock a user.
    SecureLockUser {
        /// Target object address.
        address: String,
        /// Reserved; must be zero.
        #[serde(default)]
        flags: u64,
    },
    /// Clear a user's secure-lock state.
    SecureUnlockUser {
        /// Target object address.
        address: String,
    },
    /// Take an inhibitor lease. On success the response is
    /// [`Response::Lease`] and the descriptor follows out of band.
    Inhibit {
        /// Target object address.
        address: String,
        /// Raw capability mask.
        what: u64,
        /// Requesting identity, free text.
        who: String,
        /// Reason, free text.
        why: String,
        /// Delay instead of block.
        #[serde(default)]
        delay: bool,
    },
    /// Query the inhibitor registry for one user.
    ListInhibitors {
        /// Target uid.
        uid: u32,
        /// Raw capability mask.
        what: u64,
    },
    /// Feed a session attach from the session subsystem. Root only.
    AttachSession {
        /// Owning uid.
        uid: u32,
        /// Owning primary gid.
        gid: u32,
        /// User name.
        name: String,
        /// Session facts.
        session: SessionRecord,
    },
    /// Feed a session detach from the session subsystem. Root only.
    DetachSession {
        /// Owning uid.
        uid: u32,
        /// Detached session id.
        session_id: String,
    },
    /// Feed updated session facts. Root only.
    UpdateSession {
        /// Owning uid.
        uid: u32,
        /// Session facts.
        session: SessionRecord,
    },
    /// Mark a user's backing service ready. Root only.
    ServiceReady {
        /// Target uid.
        uid: u32,
    },
}

/// A response to one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Response {
    /// The operation completed with no payload.
    Ok,
    /// Live user addresses.
    Users {
        /// Addresses, canonical order with self appended when live.
        addresses: Vec<String>,
    },
    /// One user's derived properties.
    User {
        /// The properties.
        properties: UserProperties,
    },
    /// Inhibitor registry query result.
    Inhibitors {
        /// Number of BLOCK-mode inhibitors.
        blocking: usize,
        /// DELAY-mode holders in notification order.
        delay_holders: Vec<InhibitorInfo>,
    },
    /// A lease was created; its descriptor follows out of band.
    Lease,
    /// The request failed.
    Error {
        /// Stable machine-readable code.
        code: ErrorCode,
        /// Human-readable message.
        message: String,
    },
}

impl Response {
    /// Shortcut for building an error response.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }
}

/// Stable error codes mirroring the broker error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    /// A request argument failed validation.
    InvalidArgument,
    /// The target cannot support the operation.
    NotSupported,
    /// Authorization was denied.
    Denied,
    /// The addressed object does not exist.
    NotFound,
    /// A kernel resource could not be allocated.
    ResourceExhausted,
    /// Internal invariant violation.
    Internal,
}

impl From<BrokerError> for Response {
    fn from(err: BrokerError) -> Self {
        let code = match &err {
            BrokerError::InvalidArgument { .. } => ErrorCode::InvalidArgument,
            BrokerError::NotSupported { .. } => ErrorCode::NotSupported,
            BrokerError::Denied { .. } => ErrorCode::Denied,
            BrokerError::NotFound { .. } => ErrorCode::NotFound,
            BrokerError::ResourceExhausted { .. } => ErrorCode::ResourceExhausted,
            _ => ErrorCode::Internal,
        };
        Self::Error {
            code,
            message: err.to_string(),
        }
    }
}
