//! Outbound change notifications.
//!
//! The engine broadcasts one [`Notification`] per observable
//! transition. Property changes are batched: a single
//! [`Notification::PropertiesChanged`] carries every property name
//! that changed in one transition, and it is emitted only after the
//! mutation that produced it is fully applied.

use crate::directory::ObjectAddress;

/// A broadcast notification about a user object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// A user object came into existence.
    UserNew {
        /// The new user's uid.
        uid: u32,
        /// The new user's canonical address.
        address: ObjectAddress,
    },
    /// A user object was destroyed.
    UserRemoved {
        /// The removed user's uid.
        uid: u32,
        /// The removed user's canonical address.
        address: ObjectAddress,
    },
    /// One batch of changed properties for a user.
    PropertiesChanged {
        /// The user's canonical address.
        address: ObjectAddress,
        /// Names of the properties that changed, one entry each.
        properties: Vec<String>,
    },
    /// The user is about to be secure-locked; holders of delay-mode
    /// inhibitors should finish up.
    PrepareForSecureLock {
        /// The user's canonical address.
        address: ObjectAddress,
    },
    /// The user was secure-unlocked.
    SecureUnlocked {
        /// The user's canonical address.
        address: ObjectAddress,
    },
}

impl Notification {
    /// The address the notification concerns.
    #[must_use]
    pub fn address(&self) -> &ObjectAddress {
        match self {
            Self::UserNew { address, .. }
            | Self::UserRemoved { address, .. }
            | Self::PropertiesChanged { address, .. }
            | Self::PrepareForSecureLock { address }
            | Self::SecureUnlocked { address } => address,
        }
    }
}
