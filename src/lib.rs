//! Four small systems engines sharing one discipline: explicit state
//! machines, explicit ownership of buffers and descriptors, explicit
//! readiness.
//!
//! - [`bus`]: bounded channels between cooperatively scheduled tasks, with
//!   FIFO wakeups, vectorized transfer, and broadcast.
//! - [`shell`]: a streaming POSIX-style command-line lexer and parser plus
//!   an executor that wires pipes, forks children, honors `cd`/`exit`, and
//!   reaps background jobs.
//! - [`ufs`]: an in-memory block-structured file store with descriptor
//!   semantics, including delete-while-open and resize.
//! - [`chat`]: a non-blocking TCP chat server and client pair built on
//!   `poll`, with line framing and fan-out broadcast.
//!
//! The engines share no runtime state; each can be used on its own.

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod bus;
pub mod chat;
pub mod shell;
pub mod ufs;

mod slot_table;

pub use bus::{Bus, BusError, ChannelId};
pub use chat::{ChatClient, ChatError, ChatServer, Interest, Message};
pub use shell::{BackgroundJobs, CommandLine, ExecError, ParseError, Parser, execute_line};
pub use ufs::{Fd, OpenFlags, UfsError, UserFs};
