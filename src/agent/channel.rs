//! Blocking counterpart of [`Transport`](crate::transport::Transport) for use
//! inside node processes, where no async runtime may run across `fork`.

use std::collections::VecDeque;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd};

use nix::errno::Errno;
use nix::sys::socket::SockType;

use crate::error::TransportError;
use crate::transport::TERMINATOR;
use crate::transport::frame::check_frame;
use crate::transport::sys;

/// Framed messages plus descriptor passing over a blocking unix socket.
#[derive(Debug)]
pub struct Channel {
    fd: OwnedFd,
    buf: Vec<u8>,
    fds: VecDeque<OwnedFd>,
    eof: bool,
}

impl Channel {
    /// Wraps a connected, blocking unix socket.
    pub fn new(fd: OwnedFd) -> Self {
        Self {
            fd,
            buf: Vec::new(),
            fds: VecDeque::new(),
            eof: false,
        }
    }

    /// Creates a connected pair: the first end is kept, the second is passed on.
    pub fn pair() -> Result<(Self, OwnedFd), TransportError> {
        let (local, remote) = sys::socket_pair(SockType::Stream)?;
        Ok((Self::new(local), remote))
    }

    /// Reads the next frame.
    pub fn read_message(&mut self) -> Result<String, TransportError> {
        loop {
            if let Some(end) = self.buf.iter().position(|b| *b == TERMINATOR) {
                let frame = String::from_utf8_lossy(&self.buf[..end]).into_owned();
                self.buf.drain(..=end);
                return Ok(frame);
            }
            if !self.fds.is_empty() {
                self.fds.clear();
                return Err(TransportError::UnexpectedDescriptor);
            }
            if self.eof {
                return Err(TransportError::Closed);
            }
            self.fill()?;
        }
    }

    /// Reads the next passed descriptor.
    pub fn read_fd(&mut self) -> Result<OwnedFd, TransportError> {
        loop {
            if let Some(fd) = self.fds.pop_front() {
                return Ok(fd);
            }
            if self.buf.contains(&TERMINATOR) {
                return Err(TransportError::MissingDescriptor);
            }
            if self.eof {
                return Err(TransportError::Closed);
            }
            self.fill()?;
        }
    }

    /// Writes one frame.
    pub fn write_message(&self, msg: &str) -> Result<(), TransportError> {
        check_frame(msg)?;
        let mut bytes = Vec::with_capacity(msg.len() + 1);
        bytes.extend_from_slice(msg.as_bytes());
        bytes.push(TERMINATOR);

        let mut sent = 0;
        while sent < bytes.len() {
            match sys::send_bytes(self.fd.as_raw_fd(), &bytes[sent..]) {
                Ok(n) => sent += n,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Passes a descriptor. The caller keeps its own copy open.
    pub fn write_fd(&self, fd: BorrowedFd<'_>) -> Result<(), TransportError> {
        loop {
            match sys::send_fd(self.fd.as_raw_fd(), fd.as_raw_fd()) {
                Ok(()) => return Ok(()),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn fill(&mut self) -> Result<(), TransportError> {
        let mut buf = vec![0u8; sys::CHUNK_SIZE];
        loop {
            match sys::recv_chunk(self.fd.as_raw_fd(), &mut buf) {
                Ok(chunk) => {
                    self.buf.extend_from_slice(&chunk.data);
                    self.fds.extend(chunk.fds);
                    self.eof |= chunk.eof;
                    return Ok(());
                }
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}
