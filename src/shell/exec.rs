//! Command-line execution: pipelines, built-ins, background jobs.
//!
//! A pipeline segment is a maximal run of commands joined only by `|`; the
//! segments of a line are chained by `&&`/`||`. Each segment is wired with
//! pipes and forked left to right. Output redirection and backgrounding
//! apply to the final segment only.

use std::ffi::CString;
use std::os::fd::{AsFd, OwnedFd};
use std::process;

use nix::errno::Errno;
use nix::fcntl::{OFlag, open};
use nix::sys::stat::Mode;
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, chdir, dup2_stdin, dup2_stdout, execvp, fork, pipe};
use smallvec::SmallVec;
use thiserror::Error;

use super::ast::{Command, CommandLine, Expr, OutputMode};

/// Failures that abort the whole line. The caller should treat them as a
/// reason to shut the shell down.
#[derive(Debug, Error)]
pub enum ExecError {
    /// `pipe(2)` failed while wiring a segment.
    #[error("pipe failed: {0}")]
    Pipe(Errno),
    /// `fork(2)` failed while spawning a segment.
    #[error("fork failed: {0}")]
    Fork(Errno),
}

/// What executing one line produced.
#[derive(Debug, Default)]
pub struct ExecResult {
    /// Exit status of the last segment that actually ran.
    pub status: i32,
    /// True when an in-process `exit` asked the shell to terminate with
    /// `status`.
    pub exit_requested: bool,
    /// Children of a backgrounded final segment, to be adopted into a
    /// [`BackgroundJobs`] set.
    pub background: Vec<Pid>,
}

#[derive(Debug, Clone, Copy)]
enum SeqOp {
    And,
    Or,
}

struct SegmentOutcome {
    status: i32,
    exit_requested: bool,
    background: Vec<Pid>,
}

/// Runs one parsed line to completion (except for backgrounded children).
pub fn execute_line(line: &CommandLine) -> Result<ExecResult, ExecError> {
    let segments = split_segments(line);
    let total = segments.len();

    let mut result = ExecResult::default();
    for (idx, (op, commands)) in segments.into_iter().enumerate() {
        let run = match op {
            None => true,
            Some(SeqOp::And) => result.status == 0,
            Some(SeqOp::Or) => result.status != 0,
        };
        if !run {
            continue;
        }
        let last = idx + 1 == total;
        let redirect = if last {
            line.out_file
                .as_deref()
                .filter(|_| line.out_mode != OutputMode::Stdout)
                .map(|file| (file, line.out_mode))
        } else {
            None
        };
        let wait = !(last && line.background);
        let outcome = run_segment(&commands, redirect, wait)?;
        result.status = outcome.status;
        result.background.extend(outcome.background);
        if outcome.exit_requested {
            result.exit_requested = true;
            return Ok(result);
        }
    }
    Ok(result)
}

fn split_segments(line: &CommandLine) -> Vec<(Option<SeqOp>, Vec<&Command>)> {
    let mut segments = Vec::new();
    let mut current = Vec::new();
    let mut pending = None;
    for expr in &line.exprs {
        match expr {
            Expr::Command(cmd) => current.push(cmd),
            Expr::Pipe => {}
            Expr::And | Expr::Or => {
                segments.push((pending, std::mem::take(&mut current)));
                pending = Some(if matches!(expr, Expr::And) {
                    SeqOp::And
                } else {
                    SeqOp::Or
                });
            }
        }
    }
    segments.push((pending, current));
    segments
}

fn run_segment(
    commands: &[&Command],
    redirect: Option<(&str, OutputMode)>,
    wait: bool,
) -> Result<SegmentOutcome, ExecError> {
    let mut pids: SmallVec<[Pid; 4]> = SmallVec::new();
    let mut prev_read: Option<OwnedFd> = None;
    let total = commands.len();

    for (idx, cmd) in commands.iter().enumerate() {
        let last = idx + 1 == total;

        // `cd` runs in-process, but only as the sole command of its
        // segment; piped it behaves like any failing external command.
        if cmd.exe == "cd" && last && pids.is_empty() {
            return Ok(SegmentOutcome {
                status: builtin_cd(cmd),
                exit_requested: false,
                background: Vec::new(),
            });
        }

        // `exit` never runs as a pipe child. Trailing a pipeline it still
        // sets the status, but it terminates the shell only when it had the
        // segment to itself.
        if cmd.exe == "exit" && last {
            let sole = pids.is_empty();
            let code = cmd
                .args
                .first()
                .and_then(|arg| arg.parse::<i32>().ok())
                .unwrap_or(0);
            drop(prev_read);
            wait_pipeline(&pids);
            return Ok(SegmentOutcome {
                status: code,
                exit_requested: sole,
                background: Vec::new(),
            });
        }

        let next_pipe = if last {
            None
        } else {
            Some(pipe().map_err(ExecError::Pipe)?)
        };

        match unsafe { fork() }.map_err(ExecError::Fork)? {
            ForkResult::Child => {
                let (pipe_read, pipe_write) = match next_pipe {
                    Some((read, write)) => (Some(read), Some(write)),
                    None => (None, None),
                };
                let code = child_exec(
                    cmd,
                    prev_read.take(),
                    pipe_read,
                    pipe_write,
                    if last { redirect } else { None },
                    wait || !pids.is_empty(),
                );
                process::exit(code);
            }
            ForkResult::Parent { child } => {
                log::debug!("spawned {child} for {}", cmd.exe);
                pids.push(child);
                // Drop our copies of the ends the child now owns; keeping
                // the write end open would starve the next stage of EOF.
                drop(prev_read.take());
                prev_read = next_pipe.map(|(read, write)| {
                    drop(write);
                    read
                });
            }
        }
    }
    drop(prev_read);

    if wait {
        Ok(SegmentOutcome {
            status: wait_pipeline(&pids),
            exit_requested: false,
            background: Vec::new(),
        })
    } else {
        Ok(SegmentOutcome {
            status: 0,
            exit_requested: false,
            background: pids.to_vec(),
        })
    }
}

/// Child-side setup after `fork`. Only returns on failure, with the child's
/// exit code.
fn child_exec(
    cmd: &Command,
    stdin_fd: Option<OwnedFd>,
    pipe_read: Option<OwnedFd>,
    pipe_write: Option<OwnedFd>,
    redirect: Option<(&str, OutputMode)>,
    inherit_stdin: bool,
) -> i32 {
    // The read end of the pipe to the next stage belongs to our sibling.
    drop(pipe_read);

    if let Some(fd) = &stdin_fd {
        if dup2_stdin(fd.as_fd()).is_err() {
            return 1;
        }
    } else if !inherit_stdin {
        // First command of a background pipeline detaches from stdin.
        let _ = nix::unistd::close(libc::STDIN_FILENO);
    }
    drop(stdin_fd);

    if let Some((path, mode)) = redirect {
        let mut flags = OFlag::O_CREAT | OFlag::O_WRONLY;
        flags |= if mode == OutputMode::FileAppend {
            OFlag::O_APPEND
        } else {
            OFlag::O_TRUNC
        };
        match open(path, flags, Mode::from_bits_truncate(0o644)) {
            Ok(file) => {
                if dup2_stdout(file.as_fd()).is_err() {
                    return 1;
                }
            }
            Err(_) => return 1,
        }
    } else if let Some(fd) = &pipe_write {
        if dup2_stdout(fd.as_fd()).is_err() {
            return 1;
        }
    }
    drop(pipe_write);

    let Ok(exe) = CString::new(cmd.exe.as_bytes()) else {
        return 1;
    };
    let mut argv: SmallVec<[CString; 8]> = SmallVec::new();
    argv.push(exe.clone());
    for arg in &cmd.args {
        match CString::new(arg.as_bytes()) {
            Ok(arg) => argv.push(arg),
            Err(_) => return 1,
        }
    }
    let _ = execvp(&exe, &argv);
    1
}

fn builtin_cd(cmd: &Command) -> i32 {
    if cmd.args.len() != 1 {
        eprintln!("cd: expected exactly one argument");
        return 1;
    }
    match chdir(cmd.args[0].as_str()) {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("cd: {}: {err}", cmd.args[0]);
            1
        }
    }
}

/// Reaps every pid in order; the segment status is the last command's.
fn wait_pipeline(pids: &[Pid]) -> i32 {
    let mut status = 0;
    for pid in pids {
        match waitpid(*pid, None) {
            Ok(WaitStatus::Exited(_, code)) => status = code,
            Ok(WaitStatus::Signaled(_, signal, _)) => status = 128 + signal as i32,
            Ok(_) => {}
            Err(err) => log::warn!("waitpid {pid}: {err}"),
        }
    }
    status
}

/// Children launched with `&`, reaped without blocking between lines and
/// drained for good at shutdown.
#[derive(Debug, Default)]
pub struct BackgroundJobs {
    pids: Vec<Pid>,
}

impl BackgroundJobs {
    /// Creates an empty job set.
    pub fn new() -> Self {
        BackgroundJobs::default()
    }

    /// Takes ownership of freshly backgrounded children.
    pub fn adopt(&mut self, pids: Vec<Pid>) {
        self.pids.extend(pids);
    }

    /// Number of children not yet reaped.
    pub fn len(&self) -> usize {
        self.pids.len()
    }

    /// True when no children are pending.
    pub fn is_empty(&self) -> bool {
        self.pids.is_empty()
    }

    /// Non-blocking sweep; call between input lines.
    pub fn reap(&mut self) {
        self.pids.retain(|pid| {
            match waitpid(*pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => true,
                Ok(status) => {
                    log::debug!("background {pid} finished: {status:?}");
                    false
                }
                // Already collected or never ours anymore.
                Err(_) => false,
            }
        });
    }

    /// Blocks until every remaining child is gone; call at shutdown.
    pub fn wait_all(&mut self) {
        for pid in self.pids.drain(..) {
            if let Err(err) = waitpid(pid, None) {
                log::warn!("waitpid {pid}: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::Parser;

    fn parse(input: &str) -> CommandLine {
        let mut parser = Parser::new();
        parser.feed(input.as_bytes());
        parser.pop_next().unwrap().unwrap()
    }

    #[test]
    fn true_and_false_statuses() {
        assert_eq!(execute_line(&parse("true\n")).unwrap().status, 0);
        assert_ne!(execute_line(&parse("false\n")).unwrap().status, 0);
    }

    #[test]
    fn and_or_chain_skips_segments() {
        // The skipped middle segment must leave the status untouched.
        let result = execute_line(&parse("false && false || true\n")).unwrap();
        assert_eq!(result.status, 0);
        let result = execute_line(&parse("true || false && false\n")).unwrap();
        // `||` skips, then `&&` sees status 0 and runs.
        assert_ne!(result.status, 0);
    }

    #[test]
    fn exit_requests_shell_termination_only_when_sole() {
        let result = execute_line(&parse("exit 7\n")).unwrap();
        assert!(result.exit_requested);
        assert_eq!(result.status, 7);

        let result = execute_line(&parse("true | exit 3\n")).unwrap();
        assert!(!result.exit_requested);
        assert_eq!(result.status, 3);
    }

    #[test]
    fn exit_without_argument_is_zero() {
        let result = execute_line(&parse("exit\n")).unwrap();
        assert!(result.exit_requested);
        assert_eq!(result.status, 0);
    }

    #[test]
    fn missing_executable_fails_the_segment() {
        let result = execute_line(&parse("definitely-not-a-command-9a7f\n")).unwrap();
        assert_ne!(result.status, 0);
    }

    #[test]
    fn cd_rejects_wrong_arity() {
        let result = execute_line(&parse("cd a b\n")).unwrap();
        assert_ne!(result.status, 0);
    }
}
