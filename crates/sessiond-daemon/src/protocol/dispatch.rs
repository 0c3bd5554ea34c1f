//! Request dispatch.
//!
//! One task per connection. Requests are served strictly in order on
//! their connection; a request that suspends inside the engine (for a
//! pending authorization or a held lock transition) keeps only its own
//! connection waiting.
//!
//! Caller identity is the accepted connection's kernel credentials; a
//! fresh snapshot is captured per request so liveness re-validation
//! inside the engine sees the current process table. The session-feed
//! requests are reserved for the session subsystem and accepted only
//! from root peers.

use std::os::fd::{AsFd, OwnedFd};

use sessiond_core::manager::{CallOutcome, ManagerHandle, UserCall};
use sessiond_core::{InhibitWhat, ObjectAddress};
use tokio::net::UnixStream;
use tracing::{debug, warn};

use super::error::{ProtocolError, ProtocolResult};
use super::fd_passing::send_fd;
use super::framing::{read_frame, write_frame};
use super::messages::{ErrorCode, Request, Response};
use super::socket::PeerIdentity;

/// Serve one connection until the peer closes it.
///
/// # Errors
///
/// Transport-level failures only; broker failures are answered inline
/// as [`Response::Error`] and do not end the connection.
pub async fn serve_connection(
    manager: ManagerHandle,
    mut stream: UnixStream,
    peer: PeerIdentity,
) -> ProtocolResult<()> {
    loop {
        let request: Request = match read_frame(&mut stream).await {
            Ok(request) => request,
            Err(ProtocolError::ConnectionClosed) => {
                debug!(uid = peer.uid, pid = peer.pid, "connection closed");
                return Ok(());
            }
            Err(err) => {
                if err.is_protocol_violation() {
                    warn!(uid = peer.uid, pid = peer.pid, %err, "protocol violation");
                }
                return Err(err);
            }
        };

        let (response, lease) = dispatch_request(&manager, peer, request).await;
        write_frame(&mut stream, &response).await?;
        if let Some(fd) = lease {
            send_fd(&stream, fd.as_fd()).await?;
        }
    }
}

async fn dispatch_request(
    manager: &ManagerHandle,
    peer: PeerIdentity,
    request: Request,
) -> (Response, Option<OwnedFd>) {
    match request {
        Request::ListUsers => {
            let caller = manager.capture_credentials(peer.uid, peer.pid);
            match manager.list_users(caller).await {
                Ok(addresses) => (
                    Response::Users {
                        addresses: addresses
                            .iter()
                            .map(|address| address.as_str().to_string())
                            .collect(),
                    },
                    None,
                ),
                Err(err) => (err.into(), None),
            }
        }
        Request::GetUser { address } => {
            user_call(manager, peer, address, UserCall::GetProperties).await
        }
        Request::TerminateUser { address } => {
            user_call(manager, peer, address, UserCall::Terminate).await
        }
        Request::KillUser { address, signal } => {
            user_call(manager, peer, address, UserCall::Kill { signal }).await
        }
        Request::SecureLockUser { address, flags } => {
            user_call(manager, peer, address, UserCall::SecureLock { flags }).await
        }
        Request::SecureUnlockUser { address } => {
            user_call(manager, peer, address, UserCall::SecureUnlock).await
        }
        Request::Inhibit {
            address,
            what,
            who,
            why,
            delay,
        } => {
            user_call(
                manager,
                peer,
                address,
                UserCall::Inhibit {
                    what,
                    who,
                    why,
                    delay,
                },
            )
            .await
        }
        Request::ListInhibitors { uid, what } => {
            let Some(what) = InhibitWhat::from_raw(what) else {
                return (
                    Response::error(ErrorCode::InvalidArgument, "invalid what mask"),
                    None,
                );
            };
            match manager.inhibitors(uid, what).await {
                Ok(result) => (
                    Response::Inhibitors {
                        blocking: result.blocking,
                        delay_holders: result.delay_holders,
                    },
                    None,
                ),
                Err(err) => (err.into(), None),
            }
        }
        Request::AttachSession {
            uid,
            gid,
            name,
            session,
        } => feed(peer, || manager.session_attached(uid, gid, name, session)),
        Request::DetachSession { uid, session_id } => {
            feed(peer, || manager.session_detached(uid, session_id))
        }
        Request::UpdateSession { uid, session } => {
            feed(peer, || manager.session_updated(uid, session))
        }
        Request::ServiceReady { uid } => feed(peer, || manager.service_ready(uid)),
    }
}

async fn user_call(
    manager: &ManagerHandle,
    peer: PeerIdentity,
    address: String,
    call: UserCall,
) -> (Response, Option<OwnedFd>) {
    let caller = manager.capture_credentials(peer.uid, peer.pid);
    match manager.call(ObjectAddress::new(address), caller, call).await {
        Ok(CallOutcome::Done) => (Response::Ok, None),
        Ok(CallOutcome::Properties(properties)) => (Response::User { properties }, None),
        Ok(CallOutcome::Lease(fd)) => (Response::Lease, Some(fd)),
        Err(err) => (err.into(), None),
    }
}

/// Run a session-feed request, which only root peers may issue.
fn feed(peer: PeerIdentity, apply: impl FnOnce()) -> (Response, Option<OwnedFd>) {
    if peer.uid != 0 {
        return (
            Response::error(
                ErrorCode::Denied,
                "session feeds are reserved for the session subsystem",
            ),
            None,
        );
    }
    apply();
    (Response::Ok, None)
}
