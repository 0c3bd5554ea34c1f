use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::timeout;

use super::*;
use crate::authz::Decision;
use crate::credentials::StaticProcessMonitor;
use crate::linger::StaticLingerStore;
use crate::session::{RecordingSessionSubsystem, SessionCommand, SessionKind};

/// Oracle that plays back a scripted decision sequence, answering
/// `Allowed` once the script runs out.
struct ScriptedOracle {
    script: Mutex<VecDeque<Decision>>,
    evaluations: AtomicU64,
}

impl ScriptedOracle {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            evaluations: AtomicU64::new(0),
        })
    }

    fn push(&self, decision: Decision) {
        self.script.lock().unwrap().push_back(decision);
    }

    fn evaluations(&self) -> u64 {
        self.evaluations.load(Ordering::SeqCst)
    }
}

impl PolicyOracle for ScriptedOracle {
    fn evaluate(
        &self,
        _operation: &str,
        _caller: &CredentialSnapshot,
        _target_uid: u32,
    ) -> Result<Decision, crate::authz::OracleError> {
        self.evaluations.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Decision::Allowed))
    }
}

struct Harness {
    handle: ManagerHandle,
    oracle: Arc<ScriptedOracle>,
    sessions: Arc<RecordingSessionSubsystem>,
    linger: Arc<StaticLingerStore>,
    monitor: Arc<StaticProcessMonitor>,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(ManagerConfig::new().with_secure_lock_grace(Duration::from_millis(50)))
    }

    fn with_config(config: ManagerConfig) -> Self {
        let oracle = ScriptedOracle::new();
        let sessions = Arc::new(RecordingSessionSubsystem::new());
        let linger = Arc::new(StaticLingerStore::new());
        let monitor = Arc::new(StaticProcessMonitor::new());
        let (handle, _engine) = Manager::spawn(
            config,
            oracle.clone(),
            sessions.clone(),
            linger.clone(),
            monitor.clone(),
        );
        Self {
            handle,
            oracle,
            sessions,
            linger,
            monitor,
        }
    }

    fn caller(&self, uid: u32, pid: i32) -> CredentialSnapshot {
        self.monitor.add(pid);
        self.handle.capture_credentials(uid, pid)
    }

    fn attach(&self, uid: u32, name: &str, record: SessionRecord) {
        self.handle.session_attached(uid, uid, name, record);
    }

    /// Bring up a started user with one lockable graphical session.
    async fn started_user(&self, uid: u32, name: &str) {
        self.attach(uid, name, graphical("s1"));
        self.handle.service_ready(uid);
        // A round-trip through the mailbox proves the feeds landed.
        let caller = self.caller(uid, 1);
        self.handle
            .call(ObjectAddress::user(uid), caller, UserCall::GetProperties)
            .await
            .unwrap();
    }

    async fn properties(&self, uid: u32) -> BrokerResult<UserProperties> {
        let caller = self.caller(uid, 1);
        match self
            .handle
            .call(ObjectAddress::user(uid), caller, UserCall::GetProperties)
            .await?
        {
            CallOutcome::Properties(props) => Ok(props),
            other => panic!("unexpected outcome {other:?}"),
        }
    }
}

fn graphical(id: &str) -> SessionRecord {
    SessionRecord {
        id: id.to_string(),
        kind: SessionKind::Graphical,
        active: true,
        idle: false,
        idle_since: None,
        supports_secure_lock: true,
    }
}

fn drain(rx: &mut broadcast::Receiver<Notification>) -> Vec<Notification> {
    let mut out = Vec::new();
    while let Ok(notification) = rx.try_recv() {
        out.push(notification);
    }
    out
}

async fn wait_for_no_blockers(handle: &ManagerHandle, uid: u32) {
    for _ in 0..200 {
        if handle
            .blocking_count(uid, InhibitWhat::SECURE_LOCK)
            .await
            .unwrap()
            == 0
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("blocking lease was never released");
}

#[tokio::test]
async fn terminate_is_idempotent_and_forwards_once() {
    let h = Harness::new();
    h.started_user(1000, "alice").await;
    let caller = h.caller(1000, 10);

    let outcome = h
        .handle
        .call(ObjectAddress::user(1000), caller.clone(), UserCall::Terminate)
        .await
        .unwrap();
    assert!(matches!(outcome, CallOutcome::Done));

    // Terminating a user already being torn down is a no-op success.
    h.handle
        .call(ObjectAddress::user(1000), caller, UserCall::Terminate)
        .await
        .unwrap();

    assert_eq!(
        h.sessions.commands(),
        vec![SessionCommand::Terminate { uid: 1000 }]
    );
    assert_eq!(h.properties(1000).await.unwrap().state, "closing");
}

#[tokio::test]
async fn invalid_signal_fails_before_authorization() {
    let h = Harness::new();
    h.started_user(1000, "alice").await;
    let caller = h.caller(1000, 10);

    let err = h
        .handle
        .call(
            ObjectAddress::user(1000),
            caller,
            UserCall::Kill { signal: 999 },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::InvalidArgument { .. }));
    // started_user performed no gated call, so the oracle saw nothing.
    assert_eq!(h.oracle.evaluations(), 0);
    assert!(h.sessions.commands().is_empty());
}

#[tokio::test]
async fn kill_delivers_validated_signal() {
    let h = Harness::new();
    h.started_user(1000, "alice").await;
    let caller = h.caller(1000, 10);

    h.handle
        .call(
            ObjectAddress::user(1000),
            caller,
            UserCall::Kill { signal: 15 },
        )
        .await
        .unwrap();
    assert_eq!(
        h.sessions.commands(),
        vec![SessionCommand::Kill {
            uid: 1000,
            signal: 15
        }]
    );
}

#[tokio::test]
async fn self_alias_and_canonical_address_reach_the_same_user() {
    let h = Harness::new();
    h.started_user(1000, "alice").await;
    let caller = h.caller(1000, 10);

    let via_self = match h
        .handle
        .call(
            ObjectAddress::self_alias(),
            caller.clone(),
            UserCall::GetProperties,
        )
        .await
        .unwrap()
    {
        CallOutcome::Properties(props) => props,
        other => panic!("unexpected outcome {other:?}"),
    };
    let via_canonical = h.properties(1000).await.unwrap();
    assert_eq!(via_self, via_canonical);
    assert_eq!(via_self.uid, 1000);

    // A caller with no live user cannot use the alias; the failure is
    // indistinguishable from an unknown canonical address.
    let stranger = h.caller(2000, 11);
    let err = h
        .handle
        .call(ObjectAddress::self_alias(), stranger, UserCall::GetProperties)
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::NotFound { .. }));
}

#[tokio::test]
async fn enumeration_is_sorted_with_self_appended() {
    let h = Harness::new();
    h.started_user(1001, "bob").await;
    h.started_user(1000, "alice").await;

    let own = h.handle.list_users(h.caller(1000, 10)).await.unwrap();
    assert_eq!(
        own,
        vec![
            ObjectAddress::user(1000),
            ObjectAddress::user(1001),
            ObjectAddress::self_alias(),
        ]
    );

    let stranger = h.handle.list_users(h.caller(2000, 11)).await.unwrap();
    assert_eq!(
        stranger,
        vec![ObjectAddress::user(1000), ObjectAddress::user(1001)]
    );
}

#[tokio::test]
async fn pending_authorization_resumes_without_a_second_oracle_round_trip() {
    let h = Harness::new();
    h.started_user(1000, "alice").await;
    let caller = h.caller(2000, 20);
    h.oracle.push(Decision::Pending {
        token: AuthToken(7),
    });

    let handle = h.handle.clone();
    let call = tokio::spawn(async move {
        handle
            .call(ObjectAddress::user(1000), caller, UserCall::Terminate)
            .await
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!call.is_finished());
    assert!(h.sessions.commands().is_empty());

    h.handle
        .resolve_authorization(AuthToken(7), AuthVerdict::Allowed);
    let outcome = call.await.unwrap().unwrap();
    assert!(matches!(outcome, CallOutcome::Done));
    assert_eq!(
        h.sessions.commands(),
        vec![SessionCommand::Terminate { uid: 1000 }]
    );
    assert_eq!(h.oracle.evaluations(), 1);
}

#[tokio::test]
async fn pending_denial_surfaces_the_reason() {
    let h = Harness::new();
    h.started_user(1000, "alice").await;
    let caller = h.caller(2000, 20);
    h.oracle.push(Decision::Pending {
        token: AuthToken(3),
    });

    let handle = h.handle.clone();
    let call = tokio::spawn(async move {
        handle
            .call(ObjectAddress::user(1000), caller, UserCall::Terminate)
            .await
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    h.handle.resolve_authorization(
        AuthToken(3),
        AuthVerdict::Denied {
            reason: "operator said no".to_string(),
        },
    );

    let err = call.await.unwrap().unwrap_err();
    assert!(matches!(err, BrokerError::Denied { .. }));
    assert!(h.sessions.commands().is_empty());
}

#[tokio::test]
async fn caller_death_during_suspension_blocks_posthumous_application() {
    let h = Harness::new();
    h.started_user(1000, "alice").await;
    let caller = h.caller(2000, 42);
    h.oracle.push(Decision::Pending {
        token: AuthToken(5),
    });

    let handle = h.handle.clone();
    let call = tokio::spawn(async move {
        handle
            .call(ObjectAddress::user(1000), caller, UserCall::Terminate)
            .await
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    // The caller dies while the oracle is still deciding; even an
    // eventual allow must not apply its operation.
    h.monitor.remove(42);
    h.handle
        .resolve_authorization(AuthToken(5), AuthVerdict::Allowed);

    let err = call.await.unwrap().unwrap_err();
    assert!(matches!(err, BrokerError::Denied { .. }));
    assert!(h.sessions.commands().is_empty());
}

#[tokio::test]
async fn invalid_inhibit_mask_fails_before_authorization() {
    let h = Harness::new();
    h.started_user(1000, "alice").await;
    let caller = h.caller(1000, 10);

    for raw in [0u64, 2, 1 << 63] {
        let err = h
            .handle
            .call(
                ObjectAddress::user(1000),
                caller.clone(),
                UserCall::Inhibit {
                    what: raw,
                    who: "tester".to_string(),
                    why: "testing".to_string(),
                    delay: false,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::InvalidArgument { .. }));
    }
    assert_eq!(h.oracle.evaluations(), 0);
    assert_eq!(
        h.handle
            .inhibitors(1000, InhibitWhat::SECURE_LOCK)
            .await
            .unwrap()
            .blocking,
        0
    );
}

#[tokio::test]
async fn lease_closure_is_the_sole_release_trigger() {
    let h = Harness::new();
    h.started_user(1000, "alice").await;
    let caller = h.caller(1000, 10);

    let lease = match h
        .handle
        .call(
            ObjectAddress::user(1000),
            caller,
            UserCall::Inhibit {
                what: InhibitWhat::SECURE_LOCK.raw(),
                who: "updater".to_string(),
                why: "applying updates".to_string(),
                delay: false,
            },
        )
        .await
        .unwrap()
    {
        CallOutcome::Lease(fd) => fd,
        other => panic!("unexpected outcome {other:?}"),
    };

    assert_eq!(
        h.handle
            .blocking_count(1000, InhibitWhat::SECURE_LOCK)
            .await
            .unwrap(),
        1
    );

    drop(lease);
    wait_for_no_blockers(&h.handle, 1000).await;
}

#[tokio::test]
async fn secure_lock_completes_immediately_without_inhibitors() {
    let h = Harness::new();
    h.started_user(1000, "alice").await;
    let mut notifications = h.handle.subscribe();
    let caller = h.caller(1000, 10);

    let outcome = h
        .handle
        .call(
            ObjectAddress::user(1000),
            caller.clone(),
            UserCall::SecureLock { flags: 0 },
        )
        .await
        .unwrap();
    assert!(matches!(outcome, CallOutcome::Done));
    assert!(h.properties(1000).await.unwrap().secure_locked);

    let events = drain(&mut notifications);
    assert_eq!(
        events,
        vec![
            Notification::PrepareForSecureLock {
                address: ObjectAddress::user(1000)
            },
            Notification::PropertiesChanged {
                address: ObjectAddress::user(1000),
                properties: vec!["SecureLocked".to_string()],
            },
        ]
    );

    // Locking an already-locked user succeeds without another prepare.
    h.handle
        .call(
            ObjectAddress::user(1000),
            caller,
            UserCall::SecureLock { flags: 0 },
        )
        .await
        .unwrap();
    assert!(drain(&mut notifications).is_empty());
}

#[tokio::test]
async fn secure_lock_rejects_nonzero_flags_and_unsupported_users() {
    let h = Harness::new();
    h.started_user(1000, "alice").await;
    let caller = h.caller(1000, 10);

    let err = h
        .handle
        .call(
            ObjectAddress::user(1000),
            caller.clone(),
            UserCall::SecureLock { flags: 1 },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::InvalidArgument { .. }));

    // One session without secure-lock support vetoes the whole user.
    let mut tty = graphical("tty1");
    tty.kind = SessionKind::Tty;
    tty.supports_secure_lock = false;
    h.attach(1000, "alice", tty);

    let err = h
        .handle
        .call(
            ObjectAddress::user(1000),
            caller,
            UserCall::SecureLock { flags: 0 },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::NotSupported { .. }));
    assert_eq!(h.oracle.evaluations(), 0);
}

#[tokio::test]
async fn secure_lock_waits_for_blocking_lease_release() {
    let h = Harness::new();
    h.started_user(1000, "alice").await;
    let mut notifications = h.handle.subscribe();
    let caller = h.caller(1000, 10);

    let lease = match h
        .handle
        .call(
            ObjectAddress::user(1000),
            caller.clone(),
            UserCall::Inhibit {
                what: InhibitWhat::SECURE_LOCK.raw(),
                who: "updater".to_string(),
                why: "applying updates".to_string(),
                delay: false,
            },
        )
        .await
        .unwrap()
    {
        CallOutcome::Lease(fd) => fd,
        other => panic!("unexpected outcome {other:?}"),
    };

    let handle = h.handle.clone();
    let mut lock = tokio::spawn(async move {
        handle
            .call(
                ObjectAddress::user(1000),
                caller,
                UserCall::SecureLock { flags: 0 },
            )
            .await
    });
    // The transition is held open behind the blocking lease.
    assert!(timeout(Duration::from_millis(40), &mut lock).await.is_err());
    assert!(!h.properties(1000).await.unwrap().secure_locked);

    drop(lease);
    let outcome = lock.await.unwrap().unwrap();
    assert!(matches!(outcome, CallOutcome::Done));
    assert!(h.properties(1000).await.unwrap().secure_locked);

    // Exactly one prepare and one completion batch across the hold.
    let events = drain(&mut notifications);
    let prepares = events
        .iter()
        .filter(|n| matches!(n, Notification::PrepareForSecureLock { .. }))
        .count();
    let batches = events
        .iter()
        .filter(|n| matches!(n, Notification::PropertiesChanged { .. }))
        .count();
    assert_eq!(prepares, 1);
    assert_eq!(batches, 1);
}

#[tokio::test]
async fn secure_lock_proceeds_after_delay_grace_window() {
    let h = Harness::new();
    h.started_user(1000, "alice").await;
    let caller = h.caller(1000, 10);

    let lease = match h
        .handle
        .call(
            ObjectAddress::user(1000),
            caller.clone(),
            UserCall::Inhibit {
                what: InhibitWhat::SECURE_LOCK.raw(),
                who: "player".to_string(),
                why: "saving state".to_string(),
                delay: true,
            },
        )
        .await
        .unwrap()
    {
        CallOutcome::Lease(fd) => fd,
        other => panic!("unexpected outcome {other:?}"),
    };

    let started = std::time::Instant::now();
    let outcome = h
        .handle
        .call(
            ObjectAddress::user(1000),
            caller,
            UserCall::SecureLock { flags: 0 },
        )
        .await
        .unwrap();
    assert!(matches!(outcome, CallOutcome::Done));
    // The delay holder never released; the grace window bounded it.
    assert!(started.elapsed() >= Duration::from_millis(45));
    drop(lease);
}

#[tokio::test]
async fn delay_holder_arriving_mid_hold_is_bounded_by_grace() {
    let h = Harness::new();
    h.started_user(1000, "alice").await;
    let caller = h.caller(1000, 10);

    let blocker = match h
        .handle
        .call(
            ObjectAddress::user(1000),
            caller.clone(),
            UserCall::Inhibit {
                what: InhibitWhat::SECURE_LOCK.raw(),
                who: "updater".to_string(),
                why: "applying updates".to_string(),
                delay: false,
            },
        )
        .await
        .unwrap()
    {
        CallOutcome::Lease(fd) => fd,
        other => panic!("unexpected outcome {other:?}"),
    };

    let handle = h.handle.clone();
    let lock_caller = caller.clone();
    let lock = tokio::spawn(async move {
        handle
            .call(
                ObjectAddress::user(1000),
                lock_caller,
                UserCall::SecureLock { flags: 0 },
            )
            .await
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!lock.is_finished());

    // A delay holder registers while the transition is already held
    // open behind the blocker.
    let delayer = match h
        .handle
        .call(
            ObjectAddress::user(1000),
            caller,
            UserCall::Inhibit {
                what: InhibitWhat::SECURE_LOCK.raw(),
                who: "player".to_string(),
                why: "saving state".to_string(),
                delay: true,
            },
        )
        .await
        .unwrap()
    {
        CallOutcome::Lease(fd) => fd,
        other => panic!("unexpected outcome {other:?}"),
    };

    drop(blocker);

    // The delay holder never releases; the grace window must still
    // bound the transition once the blocker is gone.
    let outcome = timeout(Duration::from_millis(500), lock)
        .await
        .expect("secure-lock held past the delay grace window")
        .unwrap()
        .unwrap();
    assert!(matches!(outcome, CallOutcome::Done));
    assert!(h.properties(1000).await.unwrap().secure_locked);
    drop(delayer);
}

#[tokio::test]
async fn joined_lock_callers_share_one_prepare_and_completion() {
    let h = Harness::new();
    h.started_user(1000, "alice").await;
    let mut notifications = h.handle.subscribe();
    let caller = h.caller(1000, 10);

    let lease = match h
        .handle
        .call(
            ObjectAddress::user(1000),
            caller.clone(),
            UserCall::Inhibit {
                what: InhibitWhat::SECURE_LOCK.raw(),
                who: "updater".to_string(),
                why: "applying updates".to_string(),
                delay: false,
            },
        )
        .await
        .unwrap()
    {
        CallOutcome::Lease(fd) => fd,
        other => panic!("unexpected outcome {other:?}"),
    };

    let mut locks = Vec::new();
    for pid in [10, 11] {
        let handle = h.handle.clone();
        let caller = h.caller(1000, pid);
        locks.push(tokio::spawn(async move {
            handle
                .call(
                    ObjectAddress::user(1000),
                    caller,
                    UserCall::SecureLock { flags: 0 },
                )
                .await
        }));
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    drop(lease);
    for lock in locks {
        let outcome = lock.await.unwrap().unwrap();
        assert!(matches!(outcome, CallOutcome::Done));
    }

    // One transition: one prepare, one completion batch, no matter how
    // many callers joined the hold.
    let events = drain(&mut notifications);
    let prepares = events
        .iter()
        .filter(|n| matches!(n, Notification::PrepareForSecureLock { .. }))
        .count();
    let batches = events
        .iter()
        .filter(|n| matches!(n, Notification::PropertiesChanged { .. }))
        .count();
    assert_eq!(prepares, 1);
    assert_eq!(batches, 1);
}

#[tokio::test]
async fn secure_unlock_clears_state_and_signals() {
    let h = Harness::new();
    h.started_user(1000, "alice").await;
    let caller = h.caller(1000, 10);
    h.handle
        .call(
            ObjectAddress::user(1000),
            caller.clone(),
            UserCall::SecureLock { flags: 0 },
        )
        .await
        .unwrap();

    let mut notifications = h.handle.subscribe();
    h.handle
        .call(
            ObjectAddress::user(1000),
            caller.clone(),
            UserCall::SecureUnlock,
        )
        .await
        .unwrap();
    assert!(!h.properties(1000).await.unwrap().secure_locked);

    let events = drain(&mut notifications);
    assert_eq!(
        events,
        vec![
            Notification::PropertiesChanged {
                address: ObjectAddress::user(1000),
                properties: vec!["SecureLocked".to_string()],
            },
            Notification::SecureUnlocked {
                address: ObjectAddress::user(1000)
            },
        ]
    );

    // Unlocking an unlocked user succeeds silently.
    h.handle
        .call(ObjectAddress::user(1000), caller, UserCall::SecureUnlock)
        .await
        .unwrap();
    assert!(drain(&mut notifications).is_empty());
}

#[tokio::test]
async fn last_detach_removes_user_unless_linger() {
    let h = Harness::new();
    h.started_user(1000, "alice").await;
    let mut notifications = h.handle.subscribe();

    h.handle.session_detached(1000, "s1");
    let err = h.properties(1000).await.unwrap_err();
    assert!(matches!(err, BrokerError::NotFound { .. }));
    assert!(drain(&mut notifications).contains(&Notification::UserRemoved {
        uid: 1000,
        address: ObjectAddress::user(1000),
    }));

    // With linger enabled the user survives at zero sessions.
    h.linger.set(1001);
    h.started_user(1001, "bob").await;
    h.handle.session_detached(1001, "s1");
    let props = h.properties(1001).await.unwrap();
    assert_eq!(props.state, "lingering");
    assert!(props.sessions.is_empty());
}

#[tokio::test]
async fn user_removal_fails_held_lock_transitions() {
    let h = Harness::new();
    h.started_user(1000, "alice").await;
    let caller = h.caller(1000, 10);

    let lease = match h
        .handle
        .call(
            ObjectAddress::user(1000),
            caller.clone(),
            UserCall::Inhibit {
                what: InhibitWhat::SECURE_LOCK.raw(),
                who: "updater".to_string(),
                why: "applying updates".to_string(),
                delay: false,
            },
        )
        .await
        .unwrap()
    {
        CallOutcome::Lease(fd) => fd,
        other => panic!("unexpected outcome {other:?}"),
    };

    let handle = h.handle.clone();
    let lock = tokio::spawn(async move {
        handle
            .call(
                ObjectAddress::user(1000),
                caller,
                UserCall::SecureLock { flags: 0 },
            )
            .await
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    h.handle.session_detached(1000, "s1");
    let err = lock.await.unwrap().unwrap_err();
    assert!(matches!(err, BrokerError::NotFound { .. }));
    drop(lease);
}

#[tokio::test]
async fn property_batches_are_suppressed_until_started() {
    let h = Harness::new();
    let mut notifications = h.handle.subscribe();

    h.attach(1000, "alice", graphical("s1"));
    let props = h.properties(1000).await.unwrap();
    assert_eq!(props.state, "opening");

    // Only the creation event so far; the display change from the
    // first attach stayed internal.
    let events = drain(&mut notifications);
    assert_eq!(
        events,
        vec![Notification::UserNew {
            uid: 1000,
            address: ObjectAddress::user(1000),
        }]
    );

    h.handle.service_ready(1000);
    let mut idle = graphical("s1");
    idle.idle = true;
    idle.idle_since = Some(Utc::now());
    h.handle.session_updated(1000, idle);

    let props = h.properties(1000).await.unwrap();
    assert_eq!(props.state, "active");
    assert!(props.idle_hint);

    let events = drain(&mut notifications);
    assert_eq!(events.len(), 1);
    match &events[0] {
        Notification::PropertiesChanged { properties, .. } => {
            assert!(properties.contains(&"IdleHint".to_string()));
            assert!(properties.contains(&"IdleSinceHint".to_string()));
        }
        other => panic!("unexpected notification {other:?}"),
    }
}

#[tokio::test]
async fn unknown_address_is_not_found() {
    let h = Harness::new();
    let caller = h.caller(1000, 10);
    let err = h
        .handle
        .call(
            ObjectAddress::new("/sessiond/user/_01"),
            caller.clone(),
            UserCall::GetProperties,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::NotFound { .. }));

    let err = h
        .handle
        .call(ObjectAddress::user(4242), caller, UserCall::GetProperties)
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::NotFound { .. }));
}

#[tokio::test]
async fn inhibitor_query_reports_modes_and_holders() {
    let h = Harness::new();
    h.started_user(1000, "alice").await;
    let caller = h.caller(1000, 10);

    let mut leases = Vec::new();
    for (who, delay) in [("updater", false), ("player", true)] {
        let outcome = h
            .handle
            .call(
                ObjectAddress::user(1000),
                caller.clone(),
                UserCall::Inhibit {
                    what: InhibitWhat::SECURE_LOCK.raw(),
                    who: who.to_string(),
                    why: "testing".to_string(),
                    delay,
                },
            )
            .await
            .unwrap();
        match outcome {
            CallOutcome::Lease(fd) => leases.push(fd),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    let query = h
        .handle
        .inhibitors(1000, InhibitWhat::SECURE_LOCK)
        .await
        .unwrap();
    assert_eq!(query.blocking, 1);
    assert_eq!(query.delay_holders.len(), 1);
    assert_eq!(query.delay_holders[0].who, "player");
    assert_eq!(query.delay_holders[0].mode, InhibitMode::Delay);
    assert_eq!(query.delay_holders[0].uid, 1000);
}
