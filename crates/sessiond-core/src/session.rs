//! Session collaborator boundary.
//!
//! Session accounting and process supervision live outside this crate;
//! the broker consumes session facts as [`SessionRecord`] values fed
//! through attach/detach/update events, and delegates termination and
//! signal delivery through the [`SessionSubsystem`] trait.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::BrokerResult;

/// Highest legal signal number (`SIGRTMAX` on Linux).
const SIGNAL_MAX: i32 = 64;

/// Returns `true` if `signo` is in the legal OS signal range.
///
/// Validated before signal delivery is even authorized: an invalid
/// signal fails fast with an invalid-argument error instead of paying
/// for an authorization round-trip.
#[must_use]
pub const fn signal_in_range(signo: i32) -> bool {
    signo >= 1 && signo <= SIGNAL_MAX
}

/// Kind of a session, as reported by the session subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionKind {
    /// A graphical session; candidates for the user's display session.
    Graphical,
    /// A text console or remote shell session.
    Tty,
    /// A non-interactive background session.
    Background,
}

/// Point-in-time facts about one session, owned by the session
/// subsystem and mirrored into the user object on attach/update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Session identifier, unique across the host.
    pub id: String,
    /// Session kind.
    pub kind: SessionKind,
    /// Whether the session is currently in the foreground.
    pub active: bool,
    /// Whether the session reports itself idle.
    pub idle: bool,
    /// When the session became idle, if it is.
    pub idle_since: Option<DateTime<Utc>>,
    /// Whether the session's composition supports secure locking.
    pub supports_secure_lock: bool,
}

/// Command side of the session subsystem collaborator.
///
/// Implementations start/stop nothing themselves here; they forward to
/// whatever supervises the sessions.
pub trait SessionSubsystem: Send + Sync {
    /// Forcibly stop all sessions and backing services of `uid`.
    fn terminate_user(&self, uid: u32) -> BrokerResult<()>;

    /// Deliver `signal` to all session-owned processes of `uid`.
    ///
    /// The signal has already been range-validated by the caller.
    fn kill_user(&self, uid: u32, signal: i32) -> BrokerResult<()>;
}

/// A command forwarded to the session subsystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    /// All sessions of the uid were terminated.
    Terminate {
        /// Target uid.
        uid: u32,
    },
    /// A signal was delivered to the uid's sessions.
    Kill {
        /// Target uid.
        uid: u32,
        /// Delivered signal.
        signal: i32,
    },
}

/// Session subsystem that records every command, for testing.
#[derive(Debug, Default)]
pub struct RecordingSessionSubsystem {
    commands: Mutex<Vec<SessionCommand>>,
}

impl RecordingSessionSubsystem {
    /// Create an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands received so far, in order.
    #[must_use]
    pub fn commands(&self) -> Vec<SessionCommand> {
        self.commands.lock().expect("lock poisoned").clone()
    }
}

impl SessionSubsystem for RecordingSessionSubsystem {
    fn terminate_user(&self, uid: u32) -> BrokerResult<()> {
        self.commands
            .lock()
            .expect("lock poisoned")
            .push(SessionCommand::Terminate { uid });
        Ok(())
    }

    fn kill_user(&self, uid: u32, signal: i32) -> BrokerResult<()> {
        self.commands
            .lock()
            .expect("lock poisoned")
            .push(SessionCommand::Kill { uid, signal });
        Ok(())
    }
}
