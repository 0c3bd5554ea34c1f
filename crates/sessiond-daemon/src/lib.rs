//! Daemon surface of the session broker.
//!
//! Hosts the [`sessiond_core`] engine behind a Unix socket: the
//! [`protocol`] module owns the transport and request dispatch, and
//! [`sessions`] wires the engine's session-subsystem boundary to the
//! host. The binary in `main.rs` assembles both around a running
//! engine.

pub mod protocol;
pub mod sessions;
