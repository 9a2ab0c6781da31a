//! Line-framed TCP chat over readiness multiplexing.
//!
//! [`ChatServer`] accepts peers, frames their byte streams into
//! newline-terminated messages, and fans every message out to all other
//! peers. [`ChatClient`] is the matching single-connection side with a
//! non-blocking connect. Both are single-threaded: they block only inside
//! `poll` with a caller-chosen timeout, and both rebuild their interest sets
//! on every tick, so readiness is never lost between calls.
//!
//! The wire format is plain UTF-8, one message per `\n`-delimited line,
//! surrounding whitespace trimmed and empty lines dropped. No handshake, no
//! authentication.

mod buffer;
mod client;
mod server;

pub use client::ChatClient;
pub use server::ChatServer;

use std::time::Duration;

use bitflags::bitflags;
use nix::errno::Errno;
use nix::poll::PollTimeout;
use thiserror::Error;

/// One received chat message, without the line terminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Trimmed message body.
    pub text: String,
}

/// Failure modes shared by server and client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ChatError {
    /// Malformed input, such as an empty address string.
    #[error("invalid argument")]
    InvalidArgument,
    /// The address did not resolve to an IPv4 endpoint.
    #[error("address did not resolve")]
    NoAddr,
    /// Listen or connect was already issued.
    #[error("already started")]
    AlreadyStarted,
    /// No socket yet; call listen or connect first.
    #[error("not started")]
    NotStarted,
    /// The requested port is taken.
    #[error("port is busy")]
    PortBusy,
    /// The update window elapsed with nothing to do.
    #[error("timed out")]
    Timeout,
    /// Any other system call failure.
    #[error("system error: {0}")]
    Sys(#[from] Errno),
}

bitflags! {
    /// Readiness directions an endpoint currently cares about.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Interest: u32 {
        /// Wants to read.
        const INPUT = 1;
        /// Has queued bytes to write.
        const OUTPUT = 2;
    }
}

fn poll_timeout(timeout: Option<Duration>) -> PollTimeout {
    match timeout {
        None => PollTimeout::NONE,
        Some(window) => i32::try_from(window.as_millis())
            .ok()
            .and_then(|ms| PollTimeout::try_from(ms).ok())
            .unwrap_or(PollTimeout::MAX),
    }
}
