//! Descriptor transfer over the broker socket.
//!
//! A lease descriptor cannot be encoded in a JSON frame; it travels as
//! `SCM_RIGHTS` ancillary data on a one-byte carrier message sent
//! immediately after the [`Response::Lease`] frame. The carrier byte
//! keeps the message non-empty, which some kernels require for
//! ancillary-only sends.
//!
//! [`Response::Lease`]: super::messages::Response::Lease

use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};

use nix::cmsg_space;
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags, UnixAddr};
use tokio::io::Interest;
use tokio::net::UnixStream;

use super::error::{ProtocolError, ProtocolResult};

/// Carrier byte accompanying a transferred descriptor.
const LEASE_MARKER: u8 = 0x4c;

/// Send `fd` to the peer of `stream`.
///
/// # Errors
///
/// An I/O error if the send fails; the descriptor stays owned by the
/// caller either way.
pub async fn send_fd(stream: &UnixStream, fd: BorrowedFd<'_>) -> ProtocolResult<()> {
    loop {
        stream.writable().await?;
        let result = stream.try_io(Interest::WRITABLE, || {
            let payload = [LEASE_MARKER];
            let iov = [IoSlice::new(&payload)];
            let fds = [fd.as_raw_fd()];
            let cmsgs = [ControlMessage::ScmRights(&fds)];
            sendmsg::<UnixAddr>(stream.as_raw_fd(), &iov, &cmsgs, MsgFlags::empty(), None)
                .map_err(io::Error::from)
        });
        match result {
            Ok(_) => return Ok(()),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => return Err(err.into()),
        }
    }
}

/// Receive a descriptor from a blocking client-side stream.
///
/// Intended for synchronous clients (and tests); the daemon side only
/// ever sends.
///
/// # Errors
///
/// [`ProtocolError::ConnectionClosed`] if the peer closed instead of
/// sending, [`ProtocolError::InvalidFrame`] if the carrier message
/// arrived without an attached descriptor.
pub fn recv_fd_blocking(stream: &std::os::unix::net::UnixStream) -> ProtocolResult<OwnedFd> {
    let mut payload = [0u8; 1];
    let mut iov = [IoSliceMut::new(&mut payload)];
    let mut cmsg_buf = cmsg_space!([std::os::fd::RawFd; 1]);
    let message = recvmsg::<UnixAddr>(
        stream.as_raw_fd(),
        &mut iov,
        Some(&mut cmsg_buf),
        MsgFlags::empty(),
    )
    .map_err(io::Error::from)?;

    if message.bytes == 0 {
        return Err(ProtocolError::ConnectionClosed);
    }
    for cmsg in message.cmsgs().map_err(io::Error::from)? {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            if let Some(&fd) = fds.first() {
                // SAFETY: the kernel just installed this descriptor in
                // our table for us; we are its sole owner.
                return Ok(unsafe { OwnedFd::from_raw_fd(fd) });
            }
        }
    }
    Err(ProtocolError::invalid_frame(
        "lease carrier arrived without a descriptor",
    ))
}
