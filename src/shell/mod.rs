//! POSIX-style command-line engine: streaming lexer, parser, and executor.
//!
//! Input bytes flow into a [`Parser`]; each complete line comes out as a
//! [`CommandLine`] and goes through [`execute_line`]. Backgrounded children
//! land in a caller-owned [`BackgroundJobs`] set. Reading stdin, argument
//! flags, and signal handling belong to the embedding program.

mod ast;
mod exec;
mod lexer;
mod parser;

pub use ast::{Command, CommandLine, Expr, OutputMode};
pub use exec::{BackgroundJobs, ExecError, ExecResult, execute_line};
pub use parser::{ParseError, Parser};
