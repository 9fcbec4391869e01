//! Raw socket operations shared by the async [`Transport`](super::Transport)
//! and the synchronous node-side runner.
//!
//! A descriptor always travels in its own `sendmsg` call together with a
//! single payload byte. On receipt the payload byte is the last byte of the
//! chunk that carried the rights and is discarded.

use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

use nix::fcntl::{FcntlArg, FdFlag, OFlag, fcntl};
use nix::sys::socket::{
    AddressFamily, ControlMessage, ControlMessageOwned, MsgFlags, SockFlag, SockType, recvmsg,
    sendmsg, socketpair,
};

/// Descriptors accepted per received chunk.
pub(crate) const MAX_FDS_PER_CHUNK: usize = 8;

/// Size of one receive buffer.
pub(crate) const CHUNK_SIZE: usize = 64 * 1024;

/// Payload byte accompanying a passed descriptor.
const FD_PAYLOAD: [u8; 1] = [0];

#[cfg(any(target_os = "linux", target_os = "android"))]
const RECV_FLAGS: MsgFlags = MsgFlags::MSG_CMSG_CLOEXEC;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const RECV_FLAGS: MsgFlags = MsgFlags::empty();

/// One `recvmsg` worth of data.
pub(crate) struct Chunk {
    /// Payload bytes, with descriptor payload bytes already removed.
    pub data: Vec<u8>,
    /// Descriptors received alongside.
    pub fds: Vec<OwnedFd>,
    /// The peer closed the socket.
    pub eof: bool,
}

/// Creates a connected pair of unix sockets with close-on-exec set.
pub(crate) fn socket_pair(kind: SockType) -> nix::Result<(OwnedFd, OwnedFd)> {
    let (a, b) = socketpair(AddressFamily::Unix, kind, None, SockFlag::empty())?;
    set_cloexec(raw(&a), true)?;
    set_cloexec(raw(&b), true)?;
    Ok((a, b))
}

/// Receives one chunk from `fd`.
pub(crate) fn recv_chunk(fd: RawFd, buf: &mut [u8]) -> nix::Result<Chunk> {
    let mut cmsg = nix::cmsg_space!([RawFd; MAX_FDS_PER_CHUNK]);
    let mut iov = [IoSliceMut::new(buf)];
    let (bytes, fds) = {
        let msg = recvmsg::<()>(fd, &mut iov, Some(&mut cmsg), RECV_FLAGS)?;
        let mut fds = Vec::new();
        for cmsg in msg.cmsgs()? {
            if let ControlMessageOwned::ScmRights(received) = cmsg {
                // SAFETY: the kernel just installed these descriptors for us.
                fds.extend(received.into_iter().map(|raw| unsafe { OwnedFd::from_raw_fd(raw) }));
            }
        }
        (msg.bytes, fds)
    };

    let payload = if fds.is_empty() { bytes } else { bytes.saturating_sub(1) };
    Ok(Chunk {
        data: buf[..payload].to_vec(),
        eof: bytes == 0 && fds.is_empty(),
        fds,
    })
}

/// Sends `bytes` once; returns how many were written.
pub(crate) fn send_bytes(fd: RawFd, bytes: &[u8]) -> nix::Result<usize> {
    sendmsg::<()>(fd, &[IoSlice::new(bytes)], &[], MsgFlags::empty(), None)
}

/// Sends `passed` as ancillary data with a single payload byte.
pub(crate) fn send_fd(fd: RawFd, passed: RawFd) -> nix::Result<()> {
    let rights = [passed];
    let cmsgs = [ControlMessage::ScmRights(&rights)];
    let n = sendmsg::<()>(fd, &[IoSlice::new(&FD_PAYLOAD)], &cmsgs, MsgFlags::empty(), None)?;
    if n != FD_PAYLOAD.len() {
        return Err(nix::Error::EIO);
    }
    Ok(())
}

/// Sets or clears `FD_CLOEXEC`.
pub(crate) fn set_cloexec(fd: RawFd, on: bool) -> nix::Result<()> {
    let flags = if on { FdFlag::FD_CLOEXEC } else { FdFlag::empty() };
    fcntl(fd, FcntlArg::F_SETFD(flags)).map(drop)
}

/// Puts `fd` into non-blocking mode.
pub(crate) fn set_nonblocking(fd: RawFd) -> nix::Result<()> {
    let current = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    fcntl(fd, FcntlArg::F_SETFL(current | OFlag::O_NONBLOCK)).map(drop)
}

pub(crate) fn raw(fd: &OwnedFd) -> RawFd {
    use std::os::fd::AsRawFd;
    fd.as_raw_fd()
}
