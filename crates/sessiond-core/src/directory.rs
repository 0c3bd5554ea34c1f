//! Object addressing and the live-user directory.
//!
//! Users are addressed either by the canonical uid-encoded form
//! (`/sessiond/user/_1000`) or by the caller-relative alias
//! (`/sessiond/user/self`), which resolves through the in-flight
//! call's credential snapshot. Alias resolution failing is `NotFound`,
//! exactly like a canonical address for a uid with no live user;
//! callers cannot distinguish which form was used.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::credentials::CredentialSnapshot;
use crate::user::User;

/// Prefix of canonical user addresses.
pub const USER_PATH_PREFIX: &str = "/sessiond/user/_";

/// The caller-relative alias address.
pub const SELF_PATH: &str = "/sessiond/user/self";

/// A stable external address for a user object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectAddress(String);

/// Parsed form of an [`ObjectAddress`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressKind {
    /// Canonical address naming a specific uid.
    User(u32),
    /// The caller-relative alias.
    SelfAlias,
}

impl ObjectAddress {
    /// Wrap an arbitrary address string (validated at resolution).
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    /// The canonical address for `uid`.
    #[must_use]
    pub fn user(uid: u32) -> Self {
        Self(format!("{USER_PATH_PREFIX}{uid}"))
    }

    /// The caller-relative alias address.
    #[must_use]
    pub fn self_alias() -> Self {
        Self(SELF_PATH.to_string())
    }

    /// The address as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse the address, or `None` if it names nothing addressable.
    #[must_use]
    pub fn kind(&self) -> Option<AddressKind> {
        if self.0 == SELF_PATH {
            return Some(AddressKind::SelfAlias);
        }
        let uid = self.0.strip_prefix(USER_PATH_PREFIX)?;
        // Reject empty, signed, or non-canonical encodings so every
        // live uid has exactly one canonical address.
        if uid.is_empty() || (uid.len() > 1 && uid.starts_with('0')) {
            return None;
        }
        uid.parse().ok().map(AddressKind::User)
    }
}

impl fmt::Display for ObjectAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Registry of live users keyed by uid.
///
/// Owned by the engine for the daemon's run lifetime; there is no
/// ambient global.
#[derive(Debug, Default)]
pub struct UserDirectory {
    users: HashMap<u32, User>,
}

impl UserDirectory {
    /// Create an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a user, replacing any previous object for the uid.
    pub fn insert(&mut self, user: User) {
        self.users.insert(user.uid(), user);
    }

    /// Remove and return the user for `uid`.
    pub fn remove(&mut self, uid: u32) -> Option<User> {
        self.users.remove(&uid)
    }

    /// Look up a user by uid.
    #[must_use]
    pub fn get(&self, uid: u32) -> Option<&User> {
        self.users.get(&uid)
    }

    /// Look up a user by uid, mutably.
    pub fn get_mut(&mut self, uid: u32) -> Option<&mut User> {
        self.users.get_mut(&uid)
    }

    /// Whether a user object exists for `uid`.
    #[must_use]
    pub fn contains(&self, uid: u32) -> bool {
        self.users.contains_key(&uid)
    }

    /// Number of live users.
    #[must_use]
    pub fn len(&self) -> usize {
        self.users.len()
    }

    /// Whether the directory is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Iterate over live users in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = &User> {
        self.users.values()
    }

    /// Resolve an address to the uid of a live user.
    ///
    /// The self alias resolves through `caller`; a caller whose uid has
    /// no live user gets `None`, indistinguishable from an unknown
    /// canonical address.
    #[must_use]
    pub fn resolve_uid(&self, address: &ObjectAddress, caller: &CredentialSnapshot) -> Option<u32> {
        let uid = match address.kind()? {
            AddressKind::User(uid) => uid,
            AddressKind::SelfAlias => caller.uid,
        };
        self.contains(uid).then_some(uid)
    }

    /// Resolve an address to the live user it names.
    #[must_use]
    pub fn resolve(&self, address: &ObjectAddress, caller: &CredentialSnapshot) -> Option<&User> {
        self.resolve_uid(address, caller).and_then(|uid| self.get(uid))
    }

    /// Point-in-time enumeration of live user addresses.
    ///
    /// Canonical addresses sorted by uid for determinism, with the
    /// self alias appended iff the caller's uid maps to a live user.
    #[must_use]
    pub fn enumerate(&self, caller: &CredentialSnapshot) -> Vec<ObjectAddress> {
        let mut uids: Vec<u32> = self.users.keys().copied().collect();
        uids.sort_unstable();

        let mut addresses: Vec<ObjectAddress> = uids.into_iter().map(ObjectAddress::user).collect();
        if self.contains(caller.uid) {
            addresses.push(ObjectAddress::self_alias());
        }
        addresses
    }
}
