//! Linger flag persistence.
//!
//! Whether a user lingers (persists across zero-session periods) is
//! recorded outside this crate. The flag is read lazily through
//! [`LingerStore`] whenever it is needed, never cached in the user
//! object, so it can never desynchronize from its source.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::RwLock;

/// Reader for the externally persisted linger flag.
pub trait LingerStore: Send + Sync {
    /// Returns `true` if linger is enabled for the user.
    fn check_linger(&self, uid: u32, name: &str) -> bool;
}

/// Linger store backed by flag files named after the user.
///
/// A user lingers iff a file with their name exists in the configured
/// directory.
#[derive(Debug, Clone)]
pub struct FileLingerStore {
    dir: PathBuf,
}

impl FileLingerStore {
    /// Create a store rooted at `dir`.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The directory holding the flag files.
    #[must_use]
    pub fn dir(&self) -> &std::path::Path {
        &self.dir
    }
}

impl LingerStore for FileLingerStore {
    fn check_linger(&self, _uid: u32, name: &str) -> bool {
        // User names never contain path separators; refuse any that do
        // rather than traverse outside the flag directory.
        if name.is_empty() || name.contains('/') {
            return false;
        }
        self.dir.join(name).exists()
    }
}

/// In-memory linger store for testing.
#[derive(Debug, Default)]
pub struct StaticLingerStore {
    lingering: RwLock<HashSet<u32>>,
}

impl StaticLingerStore {
    /// Create a store with linger disabled for everyone.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable linger for `uid`.
    pub fn set(&self, uid: u32) {
        self.lingering.write().expect("lock poisoned").insert(uid);
    }

    /// Disable linger for `uid`.
    pub fn clear(&self, uid: u32) {
        self.lingering.write().expect("lock poisoned").remove(&uid);
    }
}

impl LingerStore for StaticLingerStore {
    fn check_linger(&self, uid: u32, _name: &str) -> bool {
        self.lingering.read().expect("lock poisoned").contains(&uid)
    }
}
