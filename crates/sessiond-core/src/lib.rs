//! Core engine of the session broker.
//!
//! This crate models host-wide login state: which users are present,
//! which sessions they hold, and which privileged transitions (secure
//! locking, termination, signal delivery) are currently permitted.
//! Everything funnels through a single sequential engine
//! ([`manager::Manager`]) so there are no lock orders to reason about;
//! the interesting concurrency is *suspension*, not parallelism.
//!
//! The main pieces:
//!
//! - [`manager`]: the event-loop engine and its cloneable handle.
//! - [`authz`]: the asynchronous authorization gate over an external
//!   policy oracle, with re-entrant continuations.
//! - [`inhibit`]: fd-backed inhibitor leases with block/delay modes.
//! - [`user`]: the per-user state machine with derived states.
//! - [`directory`]: object addressing, including the self alias.
//! - [`credentials`]: caller snapshots with pid-reuse protection.
//!
//! Session accounting, the policy oracle, and linger persistence are
//! collaborator boundaries ([`session::SessionSubsystem`],
//! [`authz::PolicyOracle`], [`linger::LingerStore`]); the daemon crate
//! wires them to the host.

pub mod authz;
pub mod config;
pub mod credentials;
pub mod directory;
pub mod error;
pub mod inhibit;
pub mod linger;
pub mod manager;
pub mod notify;
pub mod session;
pub mod user;

pub use authz::{AuthToken, AuthVerdict, Decision, PolicyOracle, SelfServiceOracle};
pub use config::ManagerConfig;
pub use credentials::{CredentialSnapshot, ProcessMonitor, ProcfsMonitor};
pub use directory::ObjectAddress;
pub use error::{BrokerError, BrokerResult};
pub use inhibit::{InhibitMode, InhibitWhat, InhibitorInfo};
pub use linger::{FileLingerStore, LingerStore};
pub use manager::{CallOutcome, Manager, ManagerHandle, UserCall, UserProperties};
pub use notify::Notification;
pub use session::{SessionKind, SessionRecord, SessionSubsystem};
pub use user::UserState;
