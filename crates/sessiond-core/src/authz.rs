//! Asynchronous authorization gate.
//!
//! Every privileged operation is wrapped in a check against an external
//! policy oracle. The oracle may answer synchronously (allow/deny) or
//! ask for out-of-band confirmation, in which case the in-flight call
//! is suspended and later re-dispatched *from the top* once the oracle
//! resolves. The gate keeps the bookkeeping that makes the re-run
//! cheap and safe:
//!
//! - A `Pending` answer parks the call id under the oracle's
//!   continuation token.
//! - [`AuthorizationGate::resolve`] moves the verdict into a per-call
//!   cache, so the re-dispatched call's [`AuthorizationGate::check`]
//!   returns it without consulting the oracle a second time.
//! - Side effects therefore occur strictly after a confirmed allow;
//!   nothing before the check is ever re-applied.
//!
//! An unreachable or failing oracle maps to a denial with a generic
//! reason, never to a silent allow.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use crate::credentials::CredentialSnapshot;

/// Stable identifiers for the privileged operations gated by the
/// broker, used as the `operation` argument to the policy oracle.
pub mod operations {
    /// Terminating or signalling a user's sessions.
    pub const MANAGE: &str = "sessiond.manage";
    /// Secure-locking or unlocking a user.
    pub const SECURE_LOCK_USERS: &str = "sessiond.secure-lock-users";
    /// Taking an inhibitor lease against secure-lock.
    pub const INHIBIT_SECURE_LOCK: &str = "sessiond.inhibit-secure-lock";
}

/// Correlation token minted by the oracle for a pending decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AuthToken(pub u64);

/// Identifier assigned to each in-flight call by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallId(pub u64);

/// Immediate answer from the policy oracle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// The caller may proceed synchronously.
    Allowed,
    /// The caller must abort; `reason` is surfaced to the originator.
    Denied {
        /// Reason for the denial.
        reason: String,
    },
    /// The oracle needs out-of-band confirmation; the decision arrives
    /// later through [`AuthorizationGate::resolve`] under `token`.
    Pending {
        /// Continuation token for the eventual resolution.
        token: AuthToken,
    },
}

/// Final verdict for a previously pending decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthVerdict {
    /// The operation was confirmed.
    Allowed,
    /// The operation was rejected.
    Denied {
        /// Reason for the denial.
        reason: String,
    },
}

/// Failure talking to the policy oracle.
#[derive(Debug, Error)]
pub enum OracleError {
    /// The oracle could not be reached or returned an error.
    #[error("policy oracle unavailable: {0}")]
    Unavailable(String),
}

/// External policy decision function.
///
/// The oracle decides whether `caller` may perform `operation` on the
/// user object owned by `target_uid` (self-service vs. administrative
/// rights are the oracle's business, not the broker's).
pub trait PolicyOracle: Send + Sync {
    /// Evaluate a single authorization request.
    fn evaluate(
        &self,
        operation: &str,
        caller: &CredentialSnapshot,
        target_uid: u32,
    ) -> Result<Decision, OracleError>;
}

/// Built-in default policy: root may do anything, any caller may act
/// on their own user object, everything else is denied synchronously.
#[derive(Debug, Default, Clone, Copy)]
pub struct SelfServiceOracle;

impl SelfServiceOracle {
    /// Create the default self-service policy.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl PolicyOracle for SelfServiceOracle {
    fn evaluate(
        &self,
        operation: &str,
        caller: &CredentialSnapshot,
        target_uid: u32,
    ) -> Result<Decision, OracleError> {
        if caller.uid == 0 || caller.uid == target_uid {
            Ok(Decision::Allowed)
        } else {
            Ok(Decision::Denied {
                reason: format!("{operation} on uid {target_uid} requires administrative rights"),
            })
        }
    }
}

/// Outcome of one gate consultation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateStatus {
    /// Proceed with the operation now.
    Granted,
    /// The call must suspend; resolution arrives under the token.
    Deferred(AuthToken),
    /// The call must abort with a denial.
    Rejected {
        /// Reason surfaced to the originator.
        reason: String,
    },
}

/// Reason surfaced when the oracle itself fails.
const ORACLE_UNAVAILABLE: &str = "authorization unavailable";

/// Gate wrapping privileged operations in oracle consultations.
///
/// Owned by the engine and only touched from its dispatch context, so
/// no internal locking is needed.
pub struct AuthorizationGate {
    oracle: Arc<dyn PolicyOracle>,
    /// Verdicts resolved for suspended calls, consumed by the re-run.
    decided: HashMap<CallId, AuthVerdict>,
    /// Pending continuation tokens mapped back to their call.
    pending: HashMap<AuthToken, CallId>,
}

impl AuthorizationGate {
    /// Create a gate backed by the given oracle.
    #[must_use]
    pub fn new(oracle: Arc<dyn PolicyOracle>) -> Self {
        Self {
            oracle,
            decided: HashMap::new(),
            pending: HashMap::new(),
        }
    }

    /// Check whether `caller` may perform `operation` on `target_uid`.
    ///
    /// If the call was previously suspended and its verdict has since
    /// been resolved, the cached verdict is consumed and the oracle is
    /// not consulted again.
    pub fn check(
        &mut self,
        call: CallId,
        operation: &str,
        caller: &CredentialSnapshot,
        target_uid: u32,
    ) -> GateStatus {
        if let Some(verdict) = self.decided.remove(&call) {
            return match verdict {
                AuthVerdict::Allowed => GateStatus::Granted,
                AuthVerdict::Denied { reason } => GateStatus::Rejected { reason },
            };
        }

        match self.oracle.evaluate(operation, caller, target_uid) {
            Ok(Decision::Allowed) => GateStatus::Granted,
            Ok(Decision::Denied { reason }) => GateStatus::Rejected { reason },
            Ok(Decision::Pending { token }) => {
                debug!(?call, ?token, operation, target_uid, "authorization pending");
                self.pending.insert(token, call);
                GateStatus::Deferred(token)
            }
            Err(err) => {
                warn!(operation, target_uid, %err, "policy oracle failed, denying");
                GateStatus::Rejected {
                    reason: ORACLE_UNAVAILABLE.to_string(),
                }
            }
        }
    }

    /// Record the verdict for a pending token.
    ///
    /// Returns the call id to re-dispatch, or `None` for an unknown
    /// token (stale or duplicate resolution).
    pub fn resolve(&mut self, token: AuthToken, verdict: AuthVerdict) -> Option<CallId> {
        let call = self.pending.remove(&token)?;
        self.decided.insert(call, verdict);
        Some(call)
    }

    /// Drop the cached verdict for a call that will not be re-run
    /// (e.g. its caller died during the suspension).
    pub fn abandon(&mut self, call: CallId) {
        self.decided.remove(&call);
    }

    /// Number of decisions still pending at the oracle.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;
    use crate::credentials::{ProcessMonitor, StaticProcessMonitor};

    fn snapshot(uid: u32) -> CredentialSnapshot {
        let monitor = StaticProcessMonitor::new();
        monitor.add(7);
        CredentialSnapshot::capture(uid, 7, &monitor)
    }

    struct CountingOracle {
        calls: AtomicU64,
        decision: Decision,
    }

    impl CountingOracle {
        fn new(decision: Decision) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU64::new(0),
                decision,
            })
        }
    }

    impl PolicyOracle for CountingOracle {
        fn evaluate(
            &self,
            _operation: &str,
            _caller: &CredentialSnapshot,
            _target_uid: u32,
        ) -> Result<Decision, OracleError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.decision.clone())
        }
    }

    struct FailingOracle;

    impl PolicyOracle for FailingOracle {
        fn evaluate(
            &self,
            _operation: &str,
            _caller: &CredentialSnapshot,
            _target_uid: u32,
        ) -> Result<Decision, OracleError> {
            Err(OracleError::Unavailable("bus gone".into()))
        }
    }

    #[test]
    fn allowed_passes_through() {
        let oracle = CountingOracle::new(Decision::Allowed);
        let mut gate = AuthorizationGate::new(oracle.clone());
        let status = gate.check(CallId(1), operations::MANAGE, &snapshot(1000), 1000);
        assert_eq!(status, GateStatus::Granted);
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn oracle_failure_is_generic_denial() {
        let mut gate = AuthorizationGate::new(Arc::new(FailingOracle));
        let status = gate.check(CallId(1), operations::MANAGE, &snapshot(1000), 1000);
        assert_eq!(
            status,
            GateStatus::Rejected {
                reason: ORACLE_UNAVAILABLE.to_string()
            }
        );
    }

    #[test]
    fn pending_resolution_skips_second_oracle_round_trip() {
        let token = AuthToken(9);
        let oracle = CountingOracle::new(Decision::Pending { token });
        let mut gate = AuthorizationGate::new(oracle.clone());
        let caller = snapshot(1000);

        let status = gate.check(CallId(3), operations::MANAGE, &caller, 1000);
        assert_eq!(status, GateStatus::Deferred(token));
        assert_eq!(gate.pending_len(), 1);

        assert_eq!(gate.resolve(token, AuthVerdict::Allowed), Some(CallId(3)));
        assert_eq!(gate.pending_len(), 0);

        // Re-run from the top consumes the cached verdict.
        let status = gate.check(CallId(3), operations::MANAGE, &caller, 1000);
        assert_eq!(status, GateStatus::Granted);
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unknown_token_is_ignored() {
        let mut gate = AuthorizationGate::new(CountingOracle::new(Decision::Allowed));
        assert_eq!(gate.resolve(AuthToken(1), AuthVerdict::Allowed), None);
    }

    #[test]
    fn abandoned_verdict_falls_back_to_oracle() {
        let token = AuthToken(4);
        let oracle = CountingOracle::new(Decision::Pending { token });
        let mut gate = AuthorizationGate::new(oracle);
        let caller = snapshot(1000);

        gate.check(CallId(8), operations::MANAGE, &caller, 1000);
        gate.resolve(token, AuthVerdict::Allowed);
        gate.abandon(CallId(8));

        // Without the cached verdict the oracle is consulted again.
        let status = gate.check(CallId(8), operations::MANAGE, &caller, 1000);
        assert!(matches!(status, GateStatus::Deferred(_)));
    }

    #[test]
    fn self_service_policy() {
        let oracle = SelfServiceOracle::new();
        let own = oracle
            .evaluate(operations::MANAGE, &snapshot(1000), 1000)
            .unwrap();
        assert_eq!(own, Decision::Allowed);

        let root = oracle
            .evaluate(operations::MANAGE, &snapshot(0), 1000)
            .unwrap();
        assert_eq!(root, Decision::Allowed);

        let other = oracle
            .evaluate(operations::MANAGE, &snapshot(2000), 1000)
            .unwrap();
        assert!(matches!(other, Decision::Denied { .. }));
    }
}
