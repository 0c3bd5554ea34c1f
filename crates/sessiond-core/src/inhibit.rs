//! Inhibitor leases against sensitive state transitions.
//!
//! An inhibitor is a caller-held reservation that blocks or delays one
//! class of user state transition (currently only secure-lock). The
//! lease is backed by a liveness channel: creation hands the caller the
//! write end of a pipe, and the registry watches the read end. Closure
//! of the caller's end is the *sole* release trigger; there is no
//! time-based expiry.
//!
//! Modes:
//!
//! - [`InhibitMode::Block`]: the gated transition cannot proceed while
//!   the inhibitor is registered.
//! - [`InhibitMode::Delay`]: the transition proceeds after the holder
//!   is notified and at most a bounded grace window elapses. Delay mode
//!   is only legal when the requested capability set is exactly
//!   secure-lock; that rule is validated before the authorization gate
//!   is ever consulted.

use std::fmt;
use std::fs::File;
use std::io;
use std::os::fd::OwnedFd;

use nix::fcntl::OFlag;
use nix::unistd::pipe2;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

/// Bitmask of state transitions a lease inhibits.
///
/// Only secure-lock is modeled at the user scope today; the mask form
/// is kept so the wire contract does not change when more transitions
/// are added.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InhibitWhat(u64);

impl InhibitWhat {
    /// Inhibit the secure-lock transition.
    pub const SECURE_LOCK: Self = Self(1);

    /// All currently defined bits.
    const ALL: u64 = 1;

    /// Parse a raw mask, rejecting zero and undefined bits.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Option<Self> {
        if raw != 0 && raw & !Self::ALL == 0 {
            Some(Self(raw))
        } else {
            None
        }
    }

    /// The raw mask value.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Returns `true` if every bit of `other` is set in `self`.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns `true` if the mask is exactly `other`, no more.
    #[must_use]
    pub const fn is_exactly(self, other: Self) -> bool {
        self.0 == other.0
    }
}

/// Whether a lease blocks or merely delays the gated transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InhibitMode {
    /// The transition cannot proceed at all while the lease is held.
    Block,
    /// The transition proceeds after notification plus a grace window.
    Delay,
}

impl fmt::Display for InhibitMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Block => write!(f, "block"),
            Self::Delay => write!(f, "delay"),
        }
    }
}

/// Liveness channel backing one lease.
///
/// The holder end goes back to the requesting client; the monitor end
/// stays with the registry, which observes EOF as the release event.
/// Both ends are `O_CLOEXEC` and non-blocking so the monitor end can be
/// driven by the async reactor directly.
#[derive(Debug)]
pub struct LeaseChannel {
    /// Write end handed to the lease holder.
    pub holder: OwnedFd,
    /// Read end retained by the registry for closure detection.
    pub monitor: File,
}

/// Allocate the liveness channel for a new lease.
///
/// # Errors
///
/// Returns the underlying OS error when the process is out of
/// descriptors; the caller maps this to a resource-exhausted failure
/// and nothing is left behind (both ends close on drop).
pub fn lease_channel() -> io::Result<LeaseChannel> {
    let (read, write) = pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK).map_err(io::Error::from)?;
    Ok(LeaseChannel {
        holder: write,
        monitor: File::from(read),
    })
}

/// An active inhibitor lease registered under one user.
///
/// Dropping the inhibitor aborts its monitor task, which closes the
/// registry's end of the liveness channel.
#[derive(Debug)]
pub struct Inhibitor {
    /// Unique id within the owning user, minted from the per-user
    /// counter.
    pub id: String,
    /// The transitions this lease inhibits.
    pub what: InhibitWhat,
    /// Block or delay semantics.
    pub mode: InhibitMode,
    /// Requesting identity (free text).
    pub who: String,
    /// Reason for the lease (free text).
    pub why: String,
    /// Effective uid of the requester, captured at the grant point.
    pub uid: u32,
    /// Pid of the requester, captured at the grant point.
    pub pid: i32,
    /// Task watching the monitor end of the liveness channel.
    pub(crate) monitor_task: JoinHandle<()>,
}

impl Drop for Inhibitor {
    fn drop(&mut self) {
        self.monitor_task.abort();
    }
}

/// Serializable snapshot of an inhibitor, used for registry queries
/// and the wire surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InhibitorInfo {
    /// Lease id.
    pub id: String,
    /// Inhibited transitions (raw mask).
    pub what: u64,
    /// Block or delay.
    pub mode: InhibitMode,
    /// Requesting identity.
    pub who: String,
    /// Reason for the lease.
    pub why: String,
    /// Requester effective uid.
    pub uid: u32,
    /// Requester pid.
    pub pid: i32,
}

impl From<&Inhibitor> for InhibitorInfo {
    fn from(inhibitor: &Inhibitor) -> Self {
        Self {
            id: inhibitor.id.clone(),
            what: inhibitor.what.raw(),
            mode: inhibitor.mode,
            who: inhibitor.who.clone(),
            why: inhibitor.why.clone(),
            uid: inhibitor.uid,
            pid: inhibitor.pid,
        }
    }
}
