//! Unix-socket wire protocol for the broker.
//!
//! Transport: length-prefixed JSON frames ([`framing`]) over a single
//! credential-checked Unix socket ([`socket`]), with lease descriptors
//! transferred as ancillary data ([`fd_passing`]). [`dispatch`] maps
//! decoded requests onto the engine handle.

pub mod dispatch;
pub mod error;
pub mod fd_passing;
pub mod framing;
pub mod messages;
pub mod socket;

pub use dispatch::serve_connection;
pub use error::{ProtocolError, ProtocolResult, MAX_FRAME_SIZE};
pub use messages::{ErrorCode, Request, Response};
pub use socket::{BrokerSocket, PeerIdentity, SocketConfig};
