//! The per-user state machine.
//!
//! A [`User`] exists while at least one session is attached (or linger
//! keeps it alive across zero-session periods). Its externally visible
//! state is *derived* on demand from session membership, lifecycle
//! booleans, and the linger flag; it is never stored redundantly, so it
//! cannot desynchronize from its sources.
//!
//! Mutations that touch an externally observable property return the
//! list of changed property names. The engine batches those into a
//! single change notification per transition, which keeps rapid session
//! churn from turning into a notification storm.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::error::{BrokerError, BrokerResult};
use crate::inhibit::{InhibitMode, Inhibitor, InhibitWhat};
use crate::session::{SessionKind, SessionRecord};

/// Property names used in change notification batches.
pub mod properties {
    /// The user's display session changed.
    pub const DISPLAY: &str = "Display";
    /// The aggregated idle hint changed.
    pub const IDLE_HINT: &str = "IdleHint";
    /// The idle-since timestamp changed.
    pub const IDLE_SINCE_HINT: &str = "IdleSinceHint";
    /// The secure-lock capability changed.
    pub const CAN_SECURE_LOCK: &str = "CanSecureLock";
    /// The secure-locked flag changed.
    pub const SECURE_LOCKED: &str = "SecureLocked";
}

/// Attempts to mint a fresh inhibitor id before declaring the id space
/// corrupt. Collisions only occur after counter wraparound or restore
/// from snapshotted state, so a handful of retries is plenty.
const MAX_ID_MINT_ATTEMPTS: u32 = 64;

/// Externally observable lifecycle state, derived and never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserState {
    /// No sessions and no linger; the object is about to go away.
    Offline,
    /// Sessions attached but the user's service is not yet ready.
    Opening,
    /// Sessions attached, none in the foreground.
    Online,
    /// At least one session is in the foreground.
    Active,
    /// The user is being torn down.
    Closing,
    /// No sessions, but linger keeps the user alive.
    Lingering,
}

impl UserState {
    /// Stable string form of the state.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Offline => "offline",
            Self::Opening => "opening",
            Self::Online => "online",
            Self::Active => "active",
            Self::Closing => "closing",
            Self::Lingering => "lingering",
        }
    }
}

impl fmt::Display for UserState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregated idle hint for a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleHint {
    /// `true` iff the user has sessions and all of them are idle.
    pub idle: bool,
    /// The most recent idle-since timestamp across sessions.
    pub since: Option<DateTime<Utc>>,
}

/// One logged-in user.
pub struct User {
    uid: u32,
    gid: u32,
    name: String,
    created_at: DateTime<Utc>,
    /// Sessions in attach order.
    sessions: Vec<SessionRecord>,
    /// Id of the display session, if any (first graphical session).
    display: Option<String>,
    /// Set once the user's backing service reported ready.
    started: bool,
    /// Set once termination has begun.
    stopping: bool,
    secure_locked: bool,
    inhibit_counter: u64,
    inhibitors: HashMap<String, Inhibitor>,
}

impl User {
    /// Create a user with no sessions attached yet.
    #[must_use]
    pub fn new(uid: u32, gid: u32, name: impl Into<String>) -> Self {
        Self {
            uid,
            gid,
            name: name.into(),
            created_at: Utc::now(),
            sessions: Vec::new(),
            display: None,
            started: false,
            stopping: false,
            secure_locked: false,
            inhibit_counter: 0,
            inhibitors: HashMap::new(),
        }
    }

    /// The user's uid.
    #[must_use]
    pub const fn uid(&self) -> u32 {
        self.uid
    }

    /// The user's primary gid.
    #[must_use]
    pub const fn gid(&self) -> u32 {
        self.gid
    }

    /// The user's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// When the user object was created.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Sessions in attach order.
    #[must_use]
    pub fn sessions(&self) -> &[SessionRecord] {
        &self.sessions
    }

    /// Id of the display session, if any.
    #[must_use]
    pub fn display(&self) -> Option<&str> {
        self.display.as_deref()
    }

    /// Whether the backing service reported ready.
    #[must_use]
    pub const fn started(&self) -> bool {
        self.started
    }

    /// Whether termination has begun.
    #[must_use]
    pub const fn stopping(&self) -> bool {
        self.stopping
    }

    /// Whether the user is currently secure-locked.
    #[must_use]
    pub const fn secure_locked(&self) -> bool {
        self.secure_locked
    }

    /// Derive the externally visible state.
    #[must_use]
    pub fn state(&self, linger: bool) -> UserState {
        if self.stopping {
            UserState::Closing
        } else if self.sessions.is_empty() {
            if linger {
                UserState::Lingering
            } else {
                UserState::Offline
            }
        } else if !self.started {
            UserState::Opening
        } else if self.sessions.iter().any(|s| s.active) {
            UserState::Active
        } else {
            UserState::Online
        }
    }

    /// Aggregated idle hint: idle iff every session is idle, with the
    /// most recent idle-since timestamp. A user with no sessions is
    /// not idle.
    #[must_use]
    pub fn idle_hint(&self) -> IdleHint {
        if self.sessions.is_empty() {
            return IdleHint {
                idle: false,
                since: None,
            };
        }
        let idle = self.sessions.iter().all(|s| s.idle);
        let since = if idle {
            self.sessions.iter().filter_map(|s| s.idle_since).max()
        } else {
            None
        };
        IdleHint { idle, since }
    }

    /// Whether the session composition supports secure locking: the
    /// user must have sessions, and every one of them must support it.
    /// This is a read-only input computed from collaborator facts.
    #[must_use]
    pub fn can_secure_lock(&self) -> bool {
        !self.sessions.is_empty() && self.sessions.iter().all(|s| s.supports_secure_lock)
    }

    /// Mark the backing service ready (`Opening` -> `Online`/`Active`).
    pub fn mark_started(&mut self) {
        self.started = true;
    }

    /// Mark termination begun. Returns `false` if it already had.
    pub fn mark_stopping(&mut self) -> bool {
        if self.stopping {
            return false;
        }
        self.stopping = true;
        true
    }

    /// Attach a session; returns the changed property names.
    pub fn attach_session(&mut self, record: SessionRecord) -> Vec<&'static str> {
        self.observe(|user| {
            user.sessions.retain(|s| s.id != record.id);
            user.sessions.push(record);
            user.recompute_display();
        })
    }

    /// Detach a session by id; returns the changed property names.
    pub fn detach_session(&mut self, session_id: &str) -> Vec<&'static str> {
        self.observe(|user| {
            user.sessions.retain(|s| s.id != session_id);
            user.recompute_display();
        })
    }

    /// Replace a session's facts in place; returns the changed
    /// property names. Unknown sessions are ignored.
    pub fn update_session(&mut self, record: SessionRecord) -> Vec<&'static str> {
        self.observe(|user| {
            if let Some(existing) = user.sessions.iter_mut().find(|s| s.id == record.id) {
                *existing = record;
                user.recompute_display();
            }
        })
    }

    /// Set the secure-locked flag; returns the changed property names
    /// (empty when the flag did not change).
    pub fn set_secure_locked(&mut self, locked: bool) -> Vec<&'static str> {
        if self.secure_locked == locked {
            return Vec::new();
        }
        self.secure_locked = locked;
        vec![properties::SECURE_LOCKED]
    }

    /// The display session is the first graphical session in attach
    /// order.
    fn recompute_display(&mut self) {
        self.display = self
            .sessions
            .iter()
            .find(|s| s.kind == SessionKind::Graphical)
            .map(|s| s.id.clone());
    }

    /// Run a mutation and report which observable properties changed.
    fn observe(&mut self, mutate: impl FnOnce(&mut Self)) -> Vec<&'static str> {
        let display_before = self.display.clone();
        let idle_before = self.idle_hint();
        let can_lock_before = self.can_secure_lock();

        mutate(self);

        let mut changed = Vec::new();
        if self.display != display_before {
            changed.push(properties::DISPLAY);
        }
        let idle_after = self.idle_hint();
        if idle_after.idle != idle_before.idle {
            changed.push(properties::IDLE_HINT);
        }
        if idle_after.since != idle_before.since {
            changed.push(properties::IDLE_SINCE_HINT);
        }
        if self.can_secure_lock() != can_lock_before {
            changed.push(properties::CAN_SECURE_LOCK);
        }
        changed
    }

    /// Mint a unique inhibitor id from the per-user counter.
    ///
    /// The counter wraps; an id that is still registered (possible
    /// after wraparound or restored state) is skipped and a fresh one
    /// minted. Exhausting the retry budget means the id space is
    /// corrupt, which is an internal invariant violation.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Internal`] if no unused id was found.
    pub fn mint_inhibitor_id(&mut self) -> BrokerResult<String> {
        for _ in 0..MAX_ID_MINT_ATTEMPTS {
            self.inhibit_counter = self.inhibit_counter.wrapping_add(1);
            let id = self.inhibit_counter.to_string();
            if !self.inhibitors.contains_key(&id) {
                return Ok(id);
            }
            debug!(uid = self.uid, %id, "inhibitor id collision, retrying");
        }
        Err(BrokerError::internal(format!(
            "inhibitor id space exhausted for uid {}",
            self.uid
        )))
    }

    /// Set the inhibitor id counter, used when restoring state.
    pub fn set_inhibit_counter(&mut self, counter: u64) {
        self.inhibit_counter = counter;
    }

    /// Register an inhibitor under its minted id.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Internal`] if the id is already taken;
    /// minting guarantees uniqueness, so a duplicate here is a bug.
    pub fn register_inhibitor(&mut self, inhibitor: Inhibitor) -> BrokerResult<()> {
        let id = inhibitor.id.clone();
        if self.inhibitors.contains_key(&id) {
            return Err(BrokerError::internal(format!(
                "duplicate inhibitor id {id} for uid {}",
                self.uid
            )));
        }
        self.inhibitors.insert(id, inhibitor);
        Ok(())
    }

    /// Remove an inhibitor by id, returning it if present.
    pub fn remove_inhibitor(&mut self, id: &str) -> Option<Inhibitor> {
        self.inhibitors.remove(id)
    }

    /// Look up an inhibitor by id.
    #[must_use]
    pub fn inhibitor(&self, id: &str) -> Option<&Inhibitor> {
        self.inhibitors.get(id)
    }

    /// Number of registered inhibitors.
    #[must_use]
    pub fn inhibitor_count(&self) -> usize {
        self.inhibitors.len()
    }

    /// Number of BLOCK-mode inhibitors covering `what`.
    #[must_use]
    pub fn blocking_count(&self, what: InhibitWhat) -> usize {
        self.inhibitors
            .values()
            .filter(|i| i.mode == InhibitMode::Block && i.what.contains(what))
            .count()
    }

    /// DELAY-mode inhibitors covering `what`, ordered by numeric id
    /// for deterministic notification fan-out.
    #[must_use]
    pub fn delay_holders(&self, what: InhibitWhat) -> Vec<&Inhibitor> {
        let mut holders: Vec<&Inhibitor> = self
            .inhibitors
            .values()
            .filter(|i| i.mode == InhibitMode::Delay && i.what.contains(what))
            .collect();
        holders.sort_by_key(|i| i.id.parse::<u64>().unwrap_or(u64::MAX));
        holders
    }
}

impl fmt::Debug for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("User")
            .field("uid", &self.uid)
            .field("name", &self.name)
            .field("sessions", &self.sessions.len())
            .field("inhibitors", &self.inhibitors.len())
            .field("secure_locked", &self.secure_locked)
            .finish_non_exhaustive()
    }
}
