//! # Async control transport.
//!
//! [`Transport`] carries `\0`-terminated text frames and passed descriptors
//! over one unix stream socket (socket pairs towards node processes, accepted
//! connections towards clients).
//!
//! ```text
//!  write_message("S:code") ──► "S:code\0"
//!  write_fd(fd)            ──► [0x00] + SCM_RIGHTS(fd)
//!
//!  read_message()  ◄── next frame; error if only a descriptor is queued
//!  read_fd()       ◄── next descriptor; error if a frame arrives instead
//! ```
//!
//! ## Rules
//! - At most one read and one write are in flight; each side holds its own lock.
//! - Multi-frame exchanges that must not interleave hold [`Transport::lock_exchange`].
//! - Received descriptors are queued in arrival order and owned by the transport
//!   until handed out by [`Transport::read_fd`].

use std::collections::VecDeque;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

use nix::sys::socket::{Shutdown, SockType, shutdown};
use tokio::io::Interest;
use tokio::io::unix::AsyncFd;
use tokio::sync::{Mutex, MutexGuard};

use super::frame::{TERMINATOR, check_frame};
use super::sys;
use crate::error::TransportError;

#[derive(Default)]
struct ReadState {
    buf: Vec<u8>,
    fds: VecDeque<OwnedFd>,
    eof: bool,
}

impl ReadState {
    /// Removes and returns the next complete frame, if buffered.
    fn take_frame(&mut self) -> Option<String> {
        let end = self.buf.iter().position(|b| *b == TERMINATOR)?;
        let frame = String::from_utf8_lossy(&self.buf[..end]).into_owned();
        self.buf.drain(..=end);
        Some(frame)
    }

    fn has_frame(&self) -> bool {
        self.buf.contains(&TERMINATOR)
    }
}

/// Framed messages plus descriptor passing over a unix socket.
pub struct Transport {
    io: AsyncFd<OwnedFd>,
    reader: Mutex<ReadState>,
    writer: Mutex<()>,
    exchange: Mutex<()>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("fd", &self.io.as_raw_fd())
            .finish()
    }
}

impl Transport {
    /// Wraps a connected unix socket. Must be called within a tokio runtime.
    pub fn from_fd(fd: OwnedFd) -> io::Result<Self> {
        sys::set_nonblocking(fd.as_raw_fd())?;
        Ok(Self {
            io: AsyncFd::with_interest(fd, Interest::READABLE | Interest::WRITABLE)?,
            reader: Mutex::new(ReadState::default()),
            writer: Mutex::new(()),
            exchange: Mutex::new(()),
        })
    }

    /// Wraps an accepted client connection.
    pub fn from_unix_stream(stream: tokio::net::UnixStream) -> io::Result<Self> {
        let std = stream.into_std()?;
        Self::from_fd(OwnedFd::from(std))
    }

    /// Creates a connected transport pair.
    pub fn pair() -> io::Result<(Self, Self)> {
        let (a, b) = sys::socket_pair(SockType::Stream)?;
        Ok((Self::from_fd(a)?, Self::from_fd(b)?))
    }

    /// Serializes a multi-frame exchange against other exchanges on this transport.
    pub async fn lock_exchange(&self) -> MutexGuard<'_, ()> {
        self.exchange.lock().await
    }

    /// Reads the next frame.
    ///
    /// Fails with [`TransportError::UnexpectedDescriptor`] if a descriptor is
    /// pending and no frame is buffered; the descriptor is closed.
    pub async fn read_message(&self) -> Result<String, TransportError> {
        let mut state = self.reader.lock().await;
        loop {
            if let Some(frame) = state.take_frame() {
                return Ok(frame);
            }
            if !state.fds.is_empty() {
                state.fds.clear();
                return Err(TransportError::UnexpectedDescriptor);
            }
            if state.eof {
                return Err(TransportError::Closed);
            }
            self.fill(&mut state).await?;
        }
    }

    /// Reads the next passed descriptor.
    ///
    /// Fails with [`TransportError::MissingDescriptor`] if a complete frame
    /// arrives first; the frame stays buffered.
    pub async fn read_fd(&self) -> Result<OwnedFd, TransportError> {
        let mut state = self.reader.lock().await;
        loop {
            if let Some(fd) = state.fds.pop_front() {
                return Ok(fd);
            }
            if state.has_frame() {
                return Err(TransportError::MissingDescriptor);
            }
            if state.eof {
                return Err(TransportError::Closed);
            }
            self.fill(&mut state).await?;
        }
    }

    /// Writes one frame.
    pub async fn write_message(&self, msg: &str) -> Result<(), TransportError> {
        check_frame(msg)?;
        let mut bytes = Vec::with_capacity(msg.len() + 1);
        bytes.extend_from_slice(msg.as_bytes());
        bytes.push(TERMINATOR);

        let _guard = self.writer.lock().await;
        let mut sent = 0;
        while sent < bytes.len() {
            let rest = &bytes[sent..];
            sent += self
                .write_io(|fd| sys::send_bytes(fd, rest))
                .await?;
        }
        Ok(())
    }

    /// Passes a descriptor. The caller keeps its own copy open.
    pub async fn write_fd(&self, fd: BorrowedFd<'_>) -> Result<(), TransportError> {
        let passed = fd.as_raw_fd();
        let _guard = self.writer.lock().await;
        self.write_io(|sock| sys::send_fd(sock, passed)).await
    }

    /// Shuts the socket down in both directions, waking blocked readers with EOF.
    pub fn shutdown(&self) {
        let _ = shutdown(self.io.as_raw_fd(), Shutdown::Both);
    }

    async fn fill(&self, state: &mut ReadState) -> Result<(), TransportError> {
        let mut buf = vec![0u8; sys::CHUNK_SIZE];
        loop {
            let mut guard = self.io.readable().await?;
            match guard.try_io(|inner| {
                sys::recv_chunk(inner.as_raw_fd(), &mut buf).map_err(io::Error::from)
            }) {
                Ok(Ok(chunk)) => {
                    state.buf.extend_from_slice(&chunk.data);
                    state.fds.extend(chunk.fds);
                    state.eof |= chunk.eof;
                    return Ok(());
                }
                Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
                Ok(Err(e)) => return Err(e.into()),
                Err(_would_block) => continue,
            }
        }
    }

    async fn write_io<R>(
        &self,
        mut op: impl FnMut(RawFd) -> nix::Result<R>,
    ) -> Result<R, TransportError> {
        loop {
            let mut guard = self.io.writable().await?;
            match guard.try_io(|inner| op(inner.as_raw_fd()).map_err(io::Error::from)) {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
                Ok(Err(e)) => return Err(e.into()),
                Err(_would_block) => continue,
            }
        }
    }
}

impl AsFd for Transport {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.io.get_ref().as_fd()
    }
}
