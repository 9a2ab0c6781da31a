//! Chat client: non-blocking connect plus a single framed peer connection.

use std::collections::VecDeque;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, poll};
use nix::sys::socket::{
    self, AddressFamily, MsgFlags, SockFlag, SockType, SockaddrIn, sockopt,
};

use super::buffer::{InBuf, OutBuf};
use super::{ChatError, Interest, Message, poll_timeout};

/// Non-blocking TCP chat client.
///
/// [`ChatClient::connect`] returns as soon as the connect is underway; while
/// it is, the event mask is write-only and [`ChatClient::update`] finishes
/// the handshake by checking `SO_ERROR` on write readiness. After that the
/// client behaves like a single-peer server side: [`ChatClient::feed`]
/// queues outbound lines, `update` moves bytes both ways, and received
/// lines come back out of [`ChatClient::pop_next`].
#[derive(Debug, Default)]
pub struct ChatClient {
    sock: Option<OwnedFd>,
    connecting: bool,
    inbound: InBuf,
    outbound: OutBuf,
    messages: VecDeque<Message>,
}

impl ChatClient {
    /// Creates a disconnected client.
    pub fn new() -> Self {
        ChatClient::default()
    }

    /// Starts a non-blocking connect to `addr` (`"host:port"`). On return
    /// the connection may still be in progress; completion happens inside
    /// [`ChatClient::update`].
    pub fn connect(&mut self, addr: &str) -> Result<(), ChatError> {
        if addr.is_empty() {
            return Err(ChatError::InvalidArgument);
        }
        if self.sock.is_some() {
            return Err(ChatError::AlreadyStarted);
        }
        let endpoint = addr
            .to_socket_addrs()
            .map_err(|_| ChatError::NoAddr)?
            .find_map(|candidate| match candidate {
                SocketAddr::V4(v4) => Some(v4),
                SocketAddr::V6(_) => None,
            })
            .ok_or(ChatError::NoAddr)?;

        let sock = socket::socket(
            AddressFamily::Inet,
            SockType::Stream,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            None,
        )?;
        match socket::connect(sock.as_raw_fd(), &SockaddrIn::from(endpoint)) {
            Ok(()) => self.connecting = false,
            Err(Errno::EINPROGRESS) => self.connecting = true,
            Err(err) => return Err(err.into()),
        }
        log::debug!(
            "connect to {endpoint} {}",
            if self.connecting { "in progress" } else { "done" }
        );
        self.sock = Some(sock);
        Ok(())
    }

    /// Oldest received message, if any.
    pub fn pop_next(&mut self) -> Option<Message> {
        self.messages.pop_front()
    }

    /// Raw socket descriptor for embedding in an outer event loop.
    pub fn descriptor(&self) -> Option<RawFd> {
        self.sock.as_ref().map(AsRawFd::as_raw_fd)
    }

    /// Directions the client currently cares about. Write-only while the
    /// connect is still in flight.
    pub fn events(&self) -> Interest {
        if self.sock.is_none() {
            return Interest::empty();
        }
        if self.connecting {
            return Interest::OUTPUT;
        }
        let mut events = Interest::INPUT;
        if self.outbound.has_pending() {
            events |= Interest::OUTPUT;
        }
        events
    }

    /// Queues outbound lines: the input splits on newlines, each line is
    /// trimmed, empties are dropped, and every survivor goes out terminated
    /// by a single `\n`.
    pub fn feed(&mut self, text: &str) -> Result<(), ChatError> {
        if self.sock.is_none() {
            return Err(ChatError::NotStarted);
        }
        for line in text.split('\n') {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            self.outbound.push(trimmed.as_bytes());
            self.outbound.push(b"\n");
        }
        Ok(())
    }

    /// Waits up to `timeout` (`None` waits indefinitely) and advances the
    /// connection: finishes the connect, drains the send queue, frames
    /// received lines. `Err(Timeout)` means nothing became ready.
    pub fn update(&mut self, timeout: Option<Duration>) -> Result<(), ChatError> {
        let sock = self.sock.as_ref().ok_or(ChatError::NotStarted)?;

        let mut interest = PollFlags::empty();
        if self.connecting {
            interest |= PollFlags::POLLOUT;
        } else {
            interest |= PollFlags::POLLIN;
            if self.outbound.has_pending() {
                interest |= PollFlags::POLLOUT;
            }
        }
        let mut pollfds = [PollFd::new(sock.as_fd(), interest)];
        let ready = loop {
            match poll(&mut pollfds, poll_timeout(timeout)) {
                Ok(n) => break n,
                Err(Errno::EINTR) => continue,
                Err(err) => return Err(err.into()),
            }
        };
        if ready == 0 {
            return Err(ChatError::Timeout);
        }
        let revents = pollfds[0].revents().unwrap_or(PollFlags::empty());
        drop(pollfds);

        if self.connecting && revents.contains(PollFlags::POLLOUT) {
            self.finish_connect()?;
        }
        if !self.connecting {
            if revents.contains(PollFlags::POLLOUT) {
                self.flush()?;
            }
            if revents.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR) {
                self.drain();
            }
        }
        Ok(())
    }

    /// Verifies the asynchronous connect via `SO_ERROR`.
    fn finish_connect(&mut self) -> Result<(), ChatError> {
        let Some(sock) = self.sock.as_ref() else {
            return Err(ChatError::NotStarted);
        };
        match socket::getsockopt(sock, sockopt::SocketError) {
            Ok(0) => {
                log::debug!("connect finished");
                self.connecting = false;
                Ok(())
            }
            Ok(raw) => {
                self.sock = None;
                Err(Errno::from_raw(raw).into())
            }
            Err(err) => {
                self.sock = None;
                Err(err.into())
            }
        }
    }

    fn flush(&mut self) -> Result<(), ChatError> {
        let Some(sock) = self.sock.as_ref() else {
            return Ok(());
        };
        let fd = sock.as_raw_fd();
        while self.outbound.has_pending() {
            match socket::send(fd, self.outbound.pending(), MsgFlags::MSG_NOSIGNAL) {
                Ok(sent) => self.outbound.advance(sent),
                Err(Errno::EAGAIN) => break,
                Err(Errno::EINTR) => continue,
                Err(err) => {
                    self.sock = None;
                    return Err(err.into());
                }
            }
        }
        Ok(())
    }

    /// Reads whatever the socket has and frames it into the message FIFO.
    fn drain(&mut self) {
        let Some(sock) = self.sock.as_ref() else {
            return;
        };
        let fd = sock.as_raw_fd();
        let mut closed = false;
        let mut chunk = [0u8; 4096];
        loop {
            match socket::recv(fd, &mut chunk, MsgFlags::empty()) {
                Ok(0) => {
                    closed = true;
                    break;
                }
                Ok(n) => self.inbound.extend(&chunk[..n]),
                Err(Errno::EAGAIN) => break,
                Err(Errno::EINTR) => continue,
                Err(err) => {
                    log::warn!("recv: {err}");
                    closed = true;
                    break;
                }
            }
        }
        while let Some(line) = self.inbound.next_line() {
            let trimmed = line.trim_ascii();
            if trimmed.is_empty() {
                continue;
            }
            self.messages.push_back(Message {
                text: String::from_utf8_lossy(trimmed).into_owned(),
            });
        }
        self.inbound.compact();
        if closed {
            log::debug!("server went away");
            self.sock = None;
        }
    }
}
