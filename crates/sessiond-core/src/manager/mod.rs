//! The broker engine: one sequential dispatch context owning all
//! mutable state.
//!
//! Every mutation of users, inhibitors, and pending authorization
//! continuations happens inside [`Manager::run`], which drains a
//! single event mailbox. There is no locking discipline because there
//! is no concurrent mutation; the only concurrency concern is
//! *suspension*:
//!
//! - a call whose authorization comes back `Pending` is parked and
//!   re-dispatched from the top when the oracle resolves;
//! - a secure-lock transition blocked by inhibitors is held open and
//!   completed when the last blocking lease is released (or the
//!   delay-holder grace window elapses);
//! - lease liveness monitoring is a passive wait that feeds release
//!   events back into the mailbox, never a suspension of any caller.
//!
//! Change notifications for a transition are emitted only after the
//! mutation that produced them is fully applied.
//!
//! Conflicting calls against one user while another is suspended are
//! independently authorized and applied in completion order
//! (last-authorized-wins for conflicting mutations).

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::os::fd::OwnedFd;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::authz::{
    operations, AuthToken, AuthVerdict, AuthorizationGate, CallId, GateStatus, PolicyOracle,
};
use crate::config::ManagerConfig;
use crate::credentials::{CredentialSnapshot, ProcessMonitor};
use crate::directory::{ObjectAddress, UserDirectory};
use crate::error::{BrokerError, BrokerResult};
use crate::inhibit::{lease_channel, InhibitMode, Inhibitor, InhibitWhat, InhibitorInfo};
use crate::linger::LingerStore;
use crate::notify::Notification;
use crate::session::{signal_in_range, SessionRecord, SessionSubsystem};
use crate::user::User;

#[cfg(test)]
mod tests;

/// A call addressed to one user object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserCall {
    /// Forcibly stop all of the user's sessions. Idempotent.
    Terminate,
    /// Deliver a signal to all session-owned processes.
    Kill {
        /// Signal number; validated before the gate is consulted.
        signal: i32,
    },
    /// Secure-lock the user.
    SecureLock {
        /// Reserved; must be zero.
        flags: u64,
    },
    /// Clear the secure-lock state.
    SecureUnlock,
    /// Take an inhibitor lease against the user's transitions.
    Inhibit {
        /// Raw capability mask (see [`InhibitWhat`]).
        what: u64,
        /// Requesting identity, free text.
        who: String,
        /// Reason, free text.
        why: String,
        /// Delay instead of block.
        delay: bool,
    },
    /// Read the user's current derived properties. Unauthenticated.
    GetProperties,
}

/// Successful result of a [`UserCall`].
#[derive(Debug)]
pub enum CallOutcome {
    /// The operation completed with no payload.
    Done,
    /// An inhibitor lease was created; the descriptor is the holder's
    /// end of the liveness channel. Closing it releases the lease.
    Lease(OwnedFd),
    /// Current derived properties of the user.
    Properties(UserProperties),
}

/// Point-in-time view of a user's observable properties.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProperties {
    /// The user's uid.
    pub uid: u32,
    /// The user's primary gid.
    pub gid: u32,
    /// The user's name.
    pub name: String,
    /// When the user object was created.
    pub created_at: DateTime<Utc>,
    /// Derived lifecycle state.
    pub state: String,
    /// Id of the display session, if any.
    pub display: Option<String>,
    /// Session ids in attach order.
    pub sessions: Vec<String>,
    /// Aggregated idle hint.
    pub idle_hint: bool,
    /// When the user became idle, if idle.
    pub idle_since: Option<DateTime<Utc>>,
    /// Externally persisted linger flag, read at call time.
    pub linger: bool,
    /// Whether the session composition supports secure locking.
    pub can_secure_lock: bool,
    /// Whether the user is secure-locked.
    pub secure_locked: bool,
}

/// A call parked while its authorization or lock transition is in
/// flight.
struct SuspendedCall {
    target: ObjectAddress,
    caller: CredentialSnapshot,
    call: UserCall,
    reply: oneshot::Sender<BrokerResult<CallOutcome>>,
}

/// A secure-lock transition held open by inhibitors.
struct PendingLock {
    waiters: Vec<oneshot::Sender<BrokerResult<CallOutcome>>>,
    /// Set once the delay-holder grace window has elapsed.
    grace_elapsed: bool,
    /// Matches [`EngineEvent::LockGraceElapsed`] to this hold.
    epoch: u64,
    grace_timer: Option<JoinHandle<()>>,
}

impl Drop for PendingLock {
    fn drop(&mut self) {
        if let Some(timer) = self.grace_timer.take() {
            timer.abort();
        }
    }
}

/// Events drained by the engine's mailbox.
enum EngineEvent {
    Call {
        target: ObjectAddress,
        caller: CredentialSnapshot,
        call: UserCall,
        reply: oneshot::Sender<BrokerResult<CallOutcome>>,
    },
    ListUsers {
        caller: CredentialSnapshot,
        reply: oneshot::Sender<Vec<ObjectAddress>>,
    },
    InhibitorQuery {
        uid: u32,
        what: InhibitWhat,
        reply: oneshot::Sender<BrokerResult<InhibitorQueryResult>>,
    },
    AuthorizationResolved {
        token: AuthToken,
        verdict: AuthVerdict,
    },
    SessionAttached {
        uid: u32,
        gid: u32,
        name: String,
        record: SessionRecord,
    },
    SessionDetached {
        uid: u32,
        session_id: String,
    },
    SessionUpdated {
        uid: u32,
        record: SessionRecord,
    },
    ServiceReady {
        uid: u32,
    },
    LeaseClosed {
        uid: u32,
        inhibitor_id: String,
    },
    LockGraceElapsed {
        uid: u32,
        epoch: u64,
    },
    Shutdown,
}

/// Result of an inhibitor registry query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InhibitorQueryResult {
    /// Number of BLOCK-mode inhibitors for the queried capability.
    pub blocking: usize,
    /// DELAY-mode holders, ordered for notification fan-out.
    pub delay_holders: Vec<InhibitorInfo>,
}

/// Cloneable front door to the engine.
///
/// All methods are safe to call from any task; they post events into
/// the engine mailbox and (where applicable) await the reply.
#[derive(Clone)]
pub struct ManagerHandle {
    events: mpsc::UnboundedSender<EngineEvent>,
    monitor: Arc<dyn ProcessMonitor>,
    notifications: broadcast::Sender<Notification>,
}

/// Reason used when the engine mailbox is gone.
const ENGINE_STOPPED: &str = "session broker engine is not running";

impl ManagerHandle {
    /// Dispatch a call addressed to a user object.
    ///
    /// Completes when the operation does, including across `Pending`
    /// authorization and held secure-lock transitions.
    ///
    /// # Errors
    ///
    /// Any [`BrokerError`]; [`BrokerError::Internal`] if the engine
    /// has stopped.
    pub async fn call(
        &self,
        target: ObjectAddress,
        caller: CredentialSnapshot,
        call: UserCall,
    ) -> BrokerResult<CallOutcome> {
        let (reply, rx) = oneshot::channel();
        self.events
            .send(EngineEvent::Call {
                target,
                caller,
                call,
                reply,
            })
            .map_err(|_| BrokerError::internal(ENGINE_STOPPED))?;
        rx.await.map_err(|_| BrokerError::internal(ENGINE_STOPPED))?
    }

    /// Enumerate live user addresses as seen by `caller`.
    ///
    /// # Errors
    ///
    /// [`BrokerError::Internal`] if the engine has stopped.
    pub async fn list_users(
        &self,
        caller: CredentialSnapshot,
    ) -> BrokerResult<Vec<ObjectAddress>> {
        let (reply, rx) = oneshot::channel();
        self.events
            .send(EngineEvent::ListUsers { caller, reply })
            .map_err(|_| BrokerError::internal(ENGINE_STOPPED))?;
        rx.await.map_err(|_| BrokerError::internal(ENGINE_STOPPED))
    }

    /// Query the inhibitor registry for one user and capability.
    ///
    /// # Errors
    ///
    /// [`BrokerError::NotFound`] for an unknown uid,
    /// [`BrokerError::Internal`] if the engine has stopped.
    pub async fn inhibitors(
        &self,
        uid: u32,
        what: InhibitWhat,
    ) -> BrokerResult<InhibitorQueryResult> {
        let (reply, rx) = oneshot::channel();
        self.events
            .send(EngineEvent::InhibitorQuery { uid, what, reply })
            .map_err(|_| BrokerError::internal(ENGINE_STOPPED))?;
        rx.await.map_err(|_| BrokerError::internal(ENGINE_STOPPED))?
    }

    /// Number of BLOCK-mode inhibitors for `what` held against `uid`.
    ///
    /// # Errors
    ///
    /// Same as [`ManagerHandle::inhibitors`].
    pub async fn blocking_count(&self, uid: u32, what: InhibitWhat) -> BrokerResult<usize> {
        Ok(self.inhibitors(uid, what).await?.blocking)
    }

    /// Deliver the oracle's verdict for a pending authorization.
    pub fn resolve_authorization(&self, token: AuthToken, verdict: AuthVerdict) {
        let _ = self
            .events
            .send(EngineEvent::AuthorizationResolved { token, verdict });
    }

    /// Feed a session attach event from the session subsystem.
    pub fn session_attached(&self, uid: u32, gid: u32, name: impl Into<String>, record: SessionRecord) {
        let _ = self.events.send(EngineEvent::SessionAttached {
            uid,
            gid,
            name: name.into(),
            record,
        });
    }

    /// Feed a session detach event from the session subsystem.
    pub fn session_detached(&self, uid: u32, session_id: impl Into<String>) {
        let _ = self.events.send(EngineEvent::SessionDetached {
            uid,
            session_id: session_id.into(),
        });
    }

    /// Feed updated session facts from the session subsystem.
    pub fn session_updated(&self, uid: u32, record: SessionRecord) {
        let _ = self.events.send(EngineEvent::SessionUpdated { uid, record });
    }

    /// Mark a user's backing service ready.
    pub fn service_ready(&self, uid: u32) {
        let _ = self.events.send(EngineEvent::ServiceReady { uid });
    }

    /// Subscribe to broadcast notifications.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    /// Capture a credential snapshot for an inbound caller.
    #[must_use]
    pub fn capture_credentials(&self, uid: u32, pid: i32) -> CredentialSnapshot {
        CredentialSnapshot::capture(uid, pid, &*self.monitor)
    }

    /// Ask the engine to stop after draining queued events.
    pub fn shutdown(&self) {
        let _ = self.events.send(EngineEvent::Shutdown);
    }
}

/// The engine. Owns the directory, the gate, and all pending state.
pub struct Manager {
    config: ManagerConfig,
    directory: UserDirectory,
    gate: AuthorizationGate,
    sessions: Arc<dyn SessionSubsystem>,
    linger: Arc<dyn LingerStore>,
    monitor: Arc<dyn ProcessMonitor>,
    notifications: broadcast::Sender<Notification>,
    events: mpsc::UnboundedReceiver<EngineEvent>,
    events_tx: mpsc::UnboundedSender<EngineEvent>,
    next_call: u64,
    next_epoch: u64,
    suspended: HashMap<CallId, SuspendedCall>,
    pending_locks: HashMap<u32, PendingLock>,
}

impl Manager {
    /// Create an engine and its handle.
    #[must_use]
    pub fn new(
        config: ManagerConfig,
        oracle: Arc<dyn PolicyOracle>,
        sessions: Arc<dyn SessionSubsystem>,
        linger: Arc<dyn LingerStore>,
        monitor: Arc<dyn ProcessMonitor>,
    ) -> (Self, ManagerHandle) {
        let (events_tx, events) = mpsc::unbounded_channel();
        let (notifications, _) = broadcast::channel(config.notification_capacity);
        let handle = ManagerHandle {
            events: events_tx.clone(),
            monitor: Arc::clone(&monitor),
            notifications: notifications.clone(),
        };
        let manager = Self {
            config,
            directory: UserDirectory::new(),
            gate: AuthorizationGate::new(oracle),
            sessions,
            linger,
            monitor,
            notifications,
            events,
            events_tx,
            next_call: 0,
            next_epoch: 0,
            suspended: HashMap::new(),
            pending_locks: HashMap::new(),
        };
        (manager, handle)
    }

    /// Create an engine and run it on a fresh task.
    #[must_use]
    pub fn spawn(
        config: ManagerConfig,
        oracle: Arc<dyn PolicyOracle>,
        sessions: Arc<dyn SessionSubsystem>,
        linger: Arc<dyn LingerStore>,
        monitor: Arc<dyn ProcessMonitor>,
    ) -> (ManagerHandle, JoinHandle<()>) {
        let (manager, handle) = Self::new(config, oracle, sessions, linger, monitor);
        (handle, tokio::spawn(manager.run()))
    }

    /// Drain the mailbox until shutdown.
    pub async fn run(mut self) {
        info!("session broker engine running");
        while let Some(event) = self.events.recv().await {
            if !self.handle_event(event) {
                break;
            }
        }
        info!(
            users = self.directory.len(),
            suspended = self.suspended.len(),
            "session broker engine stopped"
        );
    }

    fn handle_event(&mut self, event: EngineEvent) -> bool {
        match event {
            EngineEvent::Call {
                target,
                caller,
                call,
                reply,
            } => {
                self.next_call += 1;
                let id = CallId(self.next_call);
                self.dispatch(
                    id,
                    SuspendedCall {
                        target,
                        caller,
                        call,
                        reply,
                    },
                );
            }
            EngineEvent::ListUsers { caller, reply } => {
                let _ = reply.send(self.directory.enumerate(&caller));
            }
            EngineEvent::InhibitorQuery { uid, what, reply } => {
                let _ = reply.send(self.inhibitor_query(uid, what));
            }
            EngineEvent::AuthorizationResolved { token, verdict } => {
                self.on_authorization_resolved(token, verdict);
            }
            EngineEvent::SessionAttached {
                uid,
                gid,
                name,
                record,
            } => self.on_session_attached(uid, gid, &name, record),
            EngineEvent::SessionDetached { uid, session_id } => {
                self.on_session_detached(uid, &session_id);
            }
            EngineEvent::SessionUpdated { uid, record } => self.on_session_updated(uid, record),
            EngineEvent::ServiceReady { uid } => {
                if let Some(user) = self.directory.get_mut(uid) {
                    user.mark_started();
                    debug!(uid, "user service ready");
                }
            }
            EngineEvent::LeaseClosed { uid, inhibitor_id } => {
                self.on_lease_closed(uid, &inhibitor_id);
            }
            EngineEvent::LockGraceElapsed { uid, epoch } => {
                self.on_lock_grace_elapsed(uid, epoch);
            }
            EngineEvent::Shutdown => return false,
        }
        true
    }

    /// Run a call from the top. Re-entered verbatim when a `Pending`
    /// authorization resolves; the gate's verdict cache makes the
    /// second pass cheap and side effects only ever run after a
    /// confirmed allow.
    fn dispatch(&mut self, id: CallId, call: SuspendedCall) {
        let Some(uid) = self.directory.resolve_uid(&call.target, &call.caller) else {
            let _ = call
                .reply
                .send(Err(BrokerError::not_found(call.target.as_str())));
            return;
        };

        match &call.call {
            UserCall::GetProperties => {
                let result = self.user_properties(uid);
                let _ = call.reply.send(result.map(CallOutcome::Properties));
            }
            UserCall::Terminate => match self.gate.check(id, operations::MANAGE, &call.caller, uid)
            {
                GateStatus::Granted => {
                    let result = self.do_terminate(uid);
                    let _ = call.reply.send(result.map(|()| CallOutcome::Done));
                }
                GateStatus::Deferred(_) => {
                    self.suspended.insert(id, call);
                }
                GateStatus::Rejected { reason } => {
                    let _ = call.reply.send(Err(BrokerError::denied(reason.clone())));
                }
            },
            UserCall::Kill { signal } => {
                let signal = *signal;
                if !signal_in_range(signal) {
                    let _ = call.reply.send(Err(BrokerError::invalid_argument(format!(
                        "invalid signal {signal}"
                    ))));
                    return;
                }
                match self.gate.check(id, operations::MANAGE, &call.caller, uid) {
                    GateStatus::Granted => {
                        let result = self.sessions.kill_user(uid, signal);
                        let _ = call.reply.send(result.map(|()| CallOutcome::Done));
                    }
                    GateStatus::Deferred(_) => {
                        self.suspended.insert(id, call);
                    }
                    GateStatus::Rejected { reason } => {
                        let _ = call.reply.send(Err(BrokerError::denied(reason.clone())));
                    }
                }
            }
            UserCall::SecureLock { flags } => {
                let flags = *flags;
                let can_lock = self
                    .directory
                    .get(uid)
                    .is_some_and(User::can_secure_lock);
                if !can_lock {
                    let _ = call.reply.send(Err(BrokerError::not_supported(
                        "user does not support secure locking",
                    )));
                    return;
                }
                if flags != 0 {
                    let _ = call
                        .reply
                        .send(Err(BrokerError::invalid_argument("invalid flags parameter")));
                    return;
                }
                match self
                    .gate
                    .check(id, operations::SECURE_LOCK_USERS, &call.caller, uid)
                {
                    GateStatus::Granted => self.start_secure_lock(uid, call.reply),
                    GateStatus::Deferred(_) => {
                        self.suspended.insert(id, call);
                    }
                    GateStatus::Rejected { reason } => {
                        let _ = call.reply.send(Err(BrokerError::denied(reason.clone())));
                    }
                }
            }
            UserCall::SecureUnlock => {
                match self
                    .gate
                    .check(id, operations::SECURE_LOCK_USERS, &call.caller, uid)
                {
                    GateStatus::Granted => {
                        let result = self.do_secure_unlock(uid);
                        let _ = call.reply.send(result.map(|()| CallOutcome::Done));
                    }
                    GateStatus::Deferred(_) => {
                        self.suspended.insert(id, call);
                    }
                    GateStatus::Rejected { reason } => {
                        let _ = call.reply.send(Err(BrokerError::denied(reason.clone())));
                    }
                }
            }
            UserCall::Inhibit {
                what,
                who,
                why,
                delay,
            } => {
                let (who, why, delay) = (who.clone(), why.clone(), *delay);
                let Some(what) = InhibitWhat::from_raw(*what) else {
                    let _ = call
                        .reply
                        .send(Err(BrokerError::invalid_argument("invalid what mask")));
                    return;
                };
                // Policy violation, not an authorization failure:
                // rejected before the gate so the oracle never sees it.
                if delay && !what.is_exactly(InhibitWhat::SECURE_LOCK) {
                    let _ = call.reply.send(Err(BrokerError::invalid_argument(
                        "delay is only supported for secure-lock",
                    )));
                    return;
                }
                match self
                    .gate
                    .check(id, operations::INHIBIT_SECURE_LOCK, &call.caller, uid)
                {
                    GateStatus::Granted => {
                        let result =
                            self.create_inhibitor(uid, &call.caller, what, who, why, delay);
                        let _ = call.reply.send(result);
                    }
                    GateStatus::Deferred(_) => {
                        self.suspended.insert(id, call);
                    }
                    GateStatus::Rejected { reason } => {
                        let _ = call.reply.send(Err(BrokerError::denied(reason.clone())));
                    }
                }
            }
        }
    }

    fn on_authorization_resolved(&mut self, token: AuthToken, verdict: AuthVerdict) {
        let Some(call_id) = self.gate.resolve(token, verdict) else {
            warn!(?token, "authorization resolved for unknown token");
            return;
        };
        let Some(call) = self.suspended.remove(&call_id) else {
            self.gate.abandon(call_id);
            warn!(?call_id, "resolved authorization had no suspended call");
            return;
        };
        // The caller may have died during the suspension; a dead
        // caller's operation must not be applied posthumously.
        if !call.caller.is_alive(&*self.monitor) {
            self.gate.abandon(call_id);
            debug!(?call_id, pid = call.caller.pid, "caller died while authorization was pending");
            let _ = call.reply.send(Err(BrokerError::denied(
                "caller exited before authorization completed",
            )));
            return;
        }
        self.dispatch(call_id, call);
    }

    fn do_terminate(&mut self, uid: u32) -> BrokerResult<()> {
        let already_stopping = self
            .directory
            .get(uid)
            .ok_or_else(|| BrokerError::not_found(ObjectAddress::user(uid).as_str()))?
            .stopping();
        if already_stopping {
            // Terminating an already-terminating user is a no-op.
            return Ok(());
        }
        self.sessions.terminate_user(uid)?;
        if let Some(user) = self.directory.get_mut(uid) {
            user.mark_stopping();
        }
        info!(uid, "user termination started");
        Ok(())
    }

    /// Begin a secure-lock transition after authorization.
    ///
    /// A transition emits exactly one prepare notification no matter
    /// how many callers end up waiting on it: the first caller opens
    /// the hold and broadcasts, later callers join silently. Completion
    /// resolves every held caller exactly once.
    fn start_secure_lock(&mut self, uid: u32, reply: oneshot::Sender<BrokerResult<CallOutcome>>) {
        let Some(user) = self.directory.get(uid) else {
            let _ = reply.send(Err(BrokerError::not_found(
                ObjectAddress::user(uid).as_str(),
            )));
            return;
        };
        if user.secure_locked() {
            let _ = reply.send(Ok(CallOutcome::Done));
            return;
        }

        let blocking = user.blocking_count(InhibitWhat::SECURE_LOCK);
        let delaying = !user.delay_holders(InhibitWhat::SECURE_LOCK).is_empty();

        if !self.pending_locks.contains_key(&uid) {
            self.emit(Notification::PrepareForSecureLock {
                address: ObjectAddress::user(uid),
            });
            if blocking == 0 && !delaying {
                self.complete_secure_lock(uid, vec![reply]);
                return;
            }
            debug!(uid, blocking, delaying, "secure-lock held by inhibitors");
        }

        let next_epoch = &mut self.next_epoch;
        let hold = self.pending_locks.entry(uid).or_insert_with(|| {
            *next_epoch += 1;
            PendingLock {
                waiters: Vec::new(),
                grace_elapsed: false,
                epoch: *next_epoch,
                grace_timer: None,
            }
        });
        hold.waiters.push(reply);
        self.try_complete_secure_lock(uid);
    }

    fn on_lock_grace_elapsed(&mut self, uid: u32, epoch: u64) {
        match self.pending_locks.get_mut(&uid) {
            Some(hold) if hold.epoch == epoch => {
                hold.grace_elapsed = true;
                debug!(uid, "delay-holder grace window elapsed");
                self.try_complete_secure_lock(uid);
            }
            _ => debug!(uid, epoch, "stale lock grace event ignored"),
        }
    }

    /// Complete a held secure-lock if nothing blocks it anymore.
    ///
    /// The sole place the delay grace timer is armed: the clock starts
    /// when delay holders are the only remaining obstacle, which also
    /// covers holders registered after the hold opened.
    fn try_complete_secure_lock(&mut self, uid: u32) {
        let grace_elapsed = match self.pending_locks.get(&uid) {
            Some(hold) => hold.grace_elapsed,
            None => return,
        };
        let Some(user) = self.directory.get(uid) else {
            // User vanished while the transition was held.
            if let Some(hold) = self.pending_locks.remove(&uid) {
                Self::fail_waiters(hold, uid);
            }
            return;
        };
        let blocking = user.blocking_count(InhibitWhat::SECURE_LOCK);
        let delaying = !user.delay_holders(InhibitWhat::SECURE_LOCK).is_empty();
        if blocking > 0 {
            return;
        }
        if delaying && !grace_elapsed {
            let tx = self.events_tx.clone();
            let grace = self.config.secure_lock_grace;
            if let Some(hold) = self.pending_locks.get_mut(&uid) {
                if hold.grace_timer.is_none() {
                    let epoch = hold.epoch;
                    hold.grace_timer = Some(tokio::spawn(async move {
                        tokio::time::sleep(grace).await;
                        let _ = tx.send(EngineEvent::LockGraceElapsed { uid, epoch });
                    }));
                }
            }
            return;
        }
        if let Some(mut hold) = self.pending_locks.remove(&uid) {
            let waiters = std::mem::take(&mut hold.waiters);
            self.complete_secure_lock(uid, waiters);
        }
    }

    fn complete_secure_lock(
        &mut self,
        uid: u32,
        waiters: Vec<oneshot::Sender<BrokerResult<CallOutcome>>>,
    ) {
        let Some(user) = self.directory.get_mut(uid) else {
            for waiter in waiters {
                let _ = waiter.send(Err(BrokerError::not_found(
                    ObjectAddress::user(uid).as_str(),
                )));
            }
            return;
        };
        let changed = user.set_secure_locked(true);
        self.emit_properties_changed(uid, &changed);
        info!(uid, "user secure-locked");
        for waiter in waiters {
            let _ = waiter.send(Ok(CallOutcome::Done));
        }
    }

    fn fail_waiters(mut hold: PendingLock, uid: u32) {
        for waiter in hold.waiters.drain(..) {
            let _ = waiter.send(Err(BrokerError::not_found(
                ObjectAddress::user(uid).as_str(),
            )));
        }
    }

    fn do_secure_unlock(&mut self, uid: u32) -> BrokerResult<()> {
        let user = self
            .directory
            .get_mut(uid)
            .ok_or_else(|| BrokerError::not_found(ObjectAddress::user(uid).as_str()))?;
        let changed = user.set_secure_locked(false);
        if changed.is_empty() {
            // Already unlocked.
            return Ok(());
        }
        self.emit_properties_changed(uid, &changed);
        self.emit(Notification::SecureUnlocked {
            address: ObjectAddress::user(uid),
        });
        info!(uid, "user secure-unlocked");
        Ok(())
    }

    /// Create an inhibitor lease after authorization.
    ///
    /// The requester's identity is re-validated as live here, at the
    /// (possibly resumed) grant point, so a caller that died during a
    /// `Pending` suspension cannot have a lease created in its name.
    /// Every failure path before registration leaks nothing: the pipe
    /// ends close on drop and no id has been registered.
    fn create_inhibitor(
        &mut self,
        uid: u32,
        caller: &CredentialSnapshot,
        what: InhibitWhat,
        who: String,
        why: String,
        delay: bool,
    ) -> BrokerResult<CallOutcome> {
        if !caller.is_alive(&*self.monitor) {
            return Err(BrokerError::denied("caller is no longer alive"));
        }
        let user = self
            .directory
            .get_mut(uid)
            .ok_or_else(|| BrokerError::not_found(ObjectAddress::user(uid).as_str()))?;

        let mode = if delay {
            InhibitMode::Delay
        } else {
            InhibitMode::Block
        };
        let id = user.mint_inhibitor_id()?;
        let channel = lease_channel().map_err(|err| {
            BrokerError::resource_exhausted(format!("failed to allocate lease channel: {err}"))
        })?;

        let monitor_task =
            spawn_lease_monitor(channel.monitor, uid, id.clone(), self.events_tx.clone());
        let inhibitor = Inhibitor {
            id: id.clone(),
            what,
            mode,
            who,
            why,
            uid: caller.uid,
            pid: caller.pid,
            monitor_task,
        };
        user.register_inhibitor(inhibitor)?;

        debug!(uid, %id, %mode, "inhibitor lease created");
        Ok(CallOutcome::Lease(channel.holder))
    }

    fn on_lease_closed(&mut self, uid: u32, inhibitor_id: &str) {
        let Some(user) = self.directory.get_mut(uid) else {
            debug!(uid, inhibitor_id, "lease closed for removed user");
            return;
        };
        let Some(inhibitor) = user.remove_inhibitor(inhibitor_id) else {
            debug!(uid, inhibitor_id, "lease closed for unknown inhibitor");
            return;
        };
        debug!(uid, inhibitor_id, who = %inhibitor.who, "inhibitor lease released");
        if inhibitor.what.contains(InhibitWhat::SECURE_LOCK) {
            self.try_complete_secure_lock(uid);
        }
    }

    fn inhibitor_query(
        &self,
        uid: u32,
        what: InhibitWhat,
    ) -> BrokerResult<InhibitorQueryResult> {
        let user = self
            .directory
            .get(uid)
            .ok_or_else(|| BrokerError::not_found(ObjectAddress::user(uid).as_str()))?;
        Ok(InhibitorQueryResult {
            blocking: user.blocking_count(what),
            delay_holders: user
                .delay_holders(what)
                .into_iter()
                .map(InhibitorInfo::from)
                .collect(),
        })
    }

    fn user_properties(&self, uid: u32) -> BrokerResult<UserProperties> {
        let user = self
            .directory
            .get(uid)
            .ok_or_else(|| BrokerError::not_found(ObjectAddress::user(uid).as_str()))?;
        let linger = self.linger.check_linger(uid, user.name());
        let idle = user.idle_hint();
        Ok(UserProperties {
            uid: user.uid(),
            gid: user.gid(),
            name: user.name().to_string(),
            created_at: user.created_at(),
            state: user.state(linger).as_str().to_string(),
            display: user.display().map(str::to_string),
            sessions: user.sessions().iter().map(|s| s.id.clone()).collect(),
            idle_hint: idle.idle,
            idle_since: idle.since,
            linger,
            can_secure_lock: user.can_secure_lock(),
            secure_locked: user.secure_locked(),
        })
    }

    fn on_session_attached(&mut self, uid: u32, gid: u32, name: &str, record: SessionRecord) {
        if !self.directory.contains(uid) {
            self.directory.insert(User::new(uid, gid, name));
            info!(uid, name, "user created");
            self.emit(Notification::UserNew {
                uid,
                address: ObjectAddress::user(uid),
            });
        }
        let Some(user) = self.directory.get_mut(uid) else {
            return;
        };
        let changed = user.attach_session(record);
        let started = user.started();
        if started {
            self.emit_properties_changed(uid, &changed);
        }
    }

    fn on_session_detached(&mut self, uid: u32, session_id: &str) {
        let Some(user) = self.directory.get_mut(uid) else {
            debug!(uid, session_id, "detach for unknown user");
            return;
        };
        let changed = user.detach_session(session_id);
        let started = user.started();
        let empty = user.sessions().is_empty();
        let name = user.name().to_string();
        if started {
            self.emit_properties_changed(uid, &changed);
        }
        if empty && !self.linger.check_linger(uid, &name) {
            self.remove_user(uid);
        }
    }

    fn on_session_updated(&mut self, uid: u32, record: SessionRecord) {
        let Some(user) = self.directory.get_mut(uid) else {
            return;
        };
        let changed = user.update_session(record);
        let started = user.started();
        if started {
            self.emit_properties_changed(uid, &changed);
        }
    }

    /// Destroy a user object: inhibitor monitors are aborted (their
    /// registry descriptors close) and held lock transitions fail.
    fn remove_user(&mut self, uid: u32) {
        let Some(user) = self.directory.remove(uid) else {
            return;
        };
        info!(uid, name = user.name(), "user removed");
        drop(user);
        if let Some(hold) = self.pending_locks.remove(&uid) {
            Self::fail_waiters(hold, uid);
        }
        self.emit(Notification::UserRemoved {
            uid,
            address: ObjectAddress::user(uid),
        });
    }

    /// Emit one batched property-change notification, or nothing when
    /// no observable property changed.
    fn emit_properties_changed(&self, uid: u32, changed: &[&'static str]) {
        if changed.is_empty() {
            return;
        }
        self.emit(Notification::PropertiesChanged {
            address: ObjectAddress::user(uid),
            properties: changed.iter().map(|p| (*p).to_string()).collect(),
        });
    }

    fn emit(&self, notification: Notification) {
        // No subscribers is fine.
        let _ = self.notifications.send(notification);
    }
}

/// Watch the registry end of a lease channel and report closure.
///
/// Closure of the holder's end is the sole release trigger for a
/// lease; this task feeds exactly one `LeaseClosed` event back into
/// the engine mailbox and exits.
fn spawn_lease_monitor(
    monitor: File,
    uid: u32,
    inhibitor_id: String,
    tx: mpsc::UnboundedSender<EngineEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        match AsyncFd::with_interest(monitor, Interest::READABLE) {
            Ok(fd) => {
                let mut buf = [0u8; 64];
                loop {
                    let mut guard = match fd.readable().await {
                        Ok(guard) => guard,
                        Err(_) => break,
                    };
                    match guard.try_io(|inner| {
                        let mut end = inner.get_ref();
                        end.read(&mut buf)
                    }) {
                        // EOF: the holder closed its end.
                        Ok(Ok(0)) => break,
                        // Stray writes on the lease fd are ignored.
                        Ok(Ok(_)) => {}
                        Ok(Err(_)) => break,
                        // Spurious readiness; wait again.
                        Err(_would_block) => {}
                    }
                }
            }
            Err(err) => {
                warn!(uid, %inhibitor_id, %err, "lease monitor registration failed");
            }
        }
        let _ = tx.send(EngineEvent::LeaseClosed { uid, inhibitor_id });
    })
}
