//! Chat server: listen, accept, frame, fan out.

use std::collections::VecDeque;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd};
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, poll};
use nix::sys::socket::{
    self, AddressFamily, Backlog, MsgFlags, SockFlag, SockType, SockaddrIn, sockopt,
};
use smallvec::SmallVec;

use super::buffer::{InBuf, OutBuf};
use super::{ChatError, Interest, Message, poll_timeout};

#[derive(Debug)]
struct Peer {
    sock: OwnedFd,
    inbound: InBuf,
    outbound: OutBuf,
    dead: bool,
}

impl Peer {
    fn new(sock: OwnedFd) -> Self {
        Peer {
            sock,
            inbound: InBuf::default(),
            outbound: OutBuf::default(),
            dead: false,
        }
    }
}

/// Non-blocking TCP chat server.
///
/// Drive it by calling [`ChatServer::update`] in a loop; received messages
/// queue up behind [`ChatServer::pop_next`] while broadcast copies queue on
/// each peer's outbound buffer.
#[derive(Debug, Default)]
pub struct ChatServer {
    listener: Option<OwnedFd>,
    peers: Vec<Peer>,
    messages: VecDeque<Message>,
}

impl ChatServer {
    /// Creates a server that is not yet listening.
    pub fn new() -> Self {
        ChatServer::default()
    }

    /// Binds `port` on all interfaces and starts listening. Port 0 asks the
    /// kernel for an ephemeral port, observable via
    /// [`ChatServer::local_port`].
    pub fn listen(&mut self, port: u16) -> Result<(), ChatError> {
        if self.listener.is_some() {
            return Err(ChatError::AlreadyStarted);
        }
        let sock = socket::socket(
            AddressFamily::Inet,
            SockType::Stream,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            None,
        )?;
        socket::setsockopt(&sock, sockopt::ReuseAddr, &true)?;
        let addr = SockaddrIn::new(0, 0, 0, 0, port);
        match socket::bind(sock.as_raw_fd(), &addr) {
            Ok(()) => {}
            Err(Errno::EADDRINUSE) => return Err(ChatError::PortBusy),
            Err(err) => return Err(err.into()),
        }
        socket::listen(&sock, Backlog::MAXCONN)?;
        log::info!("chat server listening on port {}", port);
        self.listener = Some(sock);
        Ok(())
    }

    /// Port actually bound, once listening.
    pub fn local_port(&self) -> Option<u16> {
        let fd = self.listener.as_ref()?;
        socket::getsockname::<SockaddrIn>(fd.as_raw_fd())
            .ok()
            .map(|addr| addr.port())
    }

    /// Oldest received message, if any.
    pub fn pop_next(&mut self) -> Option<Message> {
        self.messages.pop_front()
    }

    /// Number of connected peers.
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Directions the server currently has an appetite for.
    pub fn events(&self) -> Interest {
        if self.listener.is_none() {
            return Interest::empty();
        }
        let mut events = Interest::INPUT;
        if self.peers.iter().any(|peer| peer.outbound.has_pending()) {
            events |= Interest::OUTPUT;
        }
        events
    }

    /// Waits up to `timeout` (`None` waits indefinitely) and services
    /// whatever became ready: new connections, inbound lines, outbound
    /// drains, disconnects. `Err(Timeout)` means nothing happened.
    pub fn update(&mut self, timeout: Option<Duration>) -> Result<(), ChatError> {
        let listener = self.listener.as_ref().ok_or(ChatError::NotStarted)?;

        let mut pollfds: SmallVec<[PollFd<'_>; 16]> = SmallVec::new();
        pollfds.push(PollFd::new(listener.as_fd(), PollFlags::POLLIN));
        for peer in &self.peers {
            let mut flags = PollFlags::POLLIN;
            if peer.outbound.has_pending() {
                flags |= PollFlags::POLLOUT;
            }
            pollfds.push(PollFd::new(peer.sock.as_fd(), flags));
        }

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
        let revents: SmallVec<[PollFlags; 16]> = pollfds
            .iter()
            .map(|pfd| pfd.revents().unwrap_or(PollFlags::empty()))
            .collect();
        drop(pollfds);

        if revents[0].intersects(PollFlags::POLLIN) {
            self.accept_pending();
        }
        // Peers accepted above sit past the polled range and get their first
        // readiness report next tick.
        for idx in 0..revents.len() - 1 {
            let flags = revents[idx + 1];
            if flags.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR) {
                self.read_peer(idx);
            }
            if flags.contains(PollFlags::POLLOUT) {
                self.flush_peer(idx);
            }
        }
        self.peers.retain(|peer| {
            if peer.dead {
                log::debug!("dropping peer fd {}", peer.sock.as_raw_fd());
            }
            !peer.dead
        });
        Ok(())
    }

    fn accept_pending(&mut self) {
        loop {
            let Some(listener) = self.listener.as_ref() else {
                return;
            };
            match socket::accept4(
                listener.as_raw_fd(),
                SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            ) {
                Ok(fd) => {
                    log::debug!("accepted peer fd {fd}");
                    self.peers.push(Peer::new(unsafe { OwnedFd::from_raw_fd(fd) }));
                }
                Err(Errno::EAGAIN) => break,
                Err(Errno::EINTR) => continue,
                Err(err) => {
                    log::warn!("accept: {err}");
                    break;
                }
            }
        }
    }

    fn read_peer(&mut self, idx: usize) {
        let mut chunk = [0u8; 4096];
        loop {
            let peer = &mut self.peers[idx];
            match socket::recv(peer.sock.as_raw_fd(), &mut chunk, MsgFlags::empty()) {
                Ok(0) => {
                    peer.dead = true;
                    break;
                }
                Ok(n) => peer.inbound.extend(&chunk[..n]),
                Err(Errno::EAGAIN) => break,
                Err(Errno::EINTR) => continue,
                Err(err) => {
                    log::warn!("recv: {err}");
                    peer.dead = true;
                    break;
                }
            }
        }
        self.dispatch_lines(idx);
    }

    /// Carves complete lines out of peer `idx`, records each as a message,
    /// and schedules the broadcast copy onto every other peer.
    fn dispatch_lines(&mut self, idx: usize) {
        while let Some(line) = self.peers[idx].inbound.next_line() {
            let trimmed = line.trim_ascii();
            if trimmed.is_empty() {
                continue;
            }
            self.messages.push_back(Message {
                text: String::from_utf8_lossy(trimmed).into_owned(),
            });
            let mut wire = Vec::with_capacity(trimmed.len() + 1);
            wire.extend_from_slice(trimmed);
            wire.push(b'\n');
            for (other, peer) in self.peers.iter_mut().enumerate() {
                if other != idx && !peer.dead {
                    peer.outbound.push(&wire);
                }
            }
        }
        self.peers[idx].inbound.compact();
    }

    fn flush_peer(&mut self, idx: usize) {
        let peer = &mut self.peers[idx];
        while peer.outbound.has_pending() {
            match socket::send(
                peer.sock.as_raw_fd(),
                peer.outbound.pending(),
                MsgFlags::MSG_NOSIGNAL,
            ) {
                Ok(sent) => peer.outbound.advance(sent),
                Err(Errno::EAGAIN) => break,
                Err(Errno::EINTR) => continue,
                Err(err) => {
                    log::warn!("send: {err}");
                    peer.dead = true;
                    break;
                }
            }
        }
    }
}
