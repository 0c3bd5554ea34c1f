//! Host-side session subsystem wiring.

use sessiond_core::error::BrokerResult;
use sessiond_core::session::SessionSubsystem;
use tracing::info;

/// Session subsystem that records intent in the log.
///
/// Termination and signal delivery are ultimately carried out by the
/// host's service manager, which watches for these entries; the broker
/// itself never touches foreign processes directly.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingSessionSubsystem;

impl LoggingSessionSubsystem {
    /// Create the logging subsystem.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl SessionSubsystem for LoggingSessionSubsystem {
    fn terminate_user(&self, uid: u32) -> BrokerResult<()> {
        info!(uid, "terminating all sessions");
        Ok(())
    }

    fn kill_user(&self, uid: u32, signal: i32) -> BrokerResult<()> {
        info!(uid, signal, "signalling all session processes");
        Ok(())
    }
}
