//! Incremental command-line parser.
//!
//! Bytes are fed in whatever chunks arrive from the terminal or a script;
//! [`Parser::pop_next`] assembles one [`CommandLine`] per call, consuming
//! the input through the terminating newline. A buffer that does not yet
//! hold a complete line yields `Ok(None)` and is left intact. A structural
//! error discards the remainder of the offending line so the caller can
//! carry on with the next one.

use memchr::memchr;
use thiserror::Error;

use super::ast::{Command, CommandLine, Expr, OutputMode};
use super::lexer::{Token, scan_token};

/// Structural errors of a single line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ParseError {
    /// `|` with nothing before it.
    #[error("pipe with no left argument")]
    PipeWithNoLeftArg,
    /// `|` directly after another separator.
    #[error("pipe after a separator")]
    PipeLeftArgNotACommand,
    /// `&&` with nothing before it.
    #[error("and with no left argument")]
    AndWithNoLeftArg,
    /// `&&` directly after another separator.
    #[error("and after a separator")]
    AndLeftArgNotACommand,
    /// `||` with nothing before it.
    #[error("or with no left argument")]
    OrWithNoLeftArg,
    /// `||` directly after another separator.
    #[error("or after a separator")]
    OrLeftArgNotACommand,
    /// `>` or `>>` not followed by a file name.
    #[error("output redirect lacks a file name")]
    OutputRedirectBadArg,
    /// Content after the redirect target or the background marker.
    #[error("arguments after redirect or background marker")]
    TooLateArguments,
    /// Line ends on a dangling separator.
    #[error("line does not end with a command")]
    EndsNotWithACommand,
}

/// Streaming parser state: the unconsumed byte buffer.
#[derive(Debug, Default)]
pub struct Parser {
    buf: Vec<u8>,
    discarding: bool,
}

impl Parser {
    /// Creates an empty parser.
    pub fn new() -> Self {
        Parser::default()
    }

    /// Appends raw input bytes.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Extracts the next complete line. `Ok(None)` means more input is
    /// needed; the buffered bytes stay untouched.
    pub fn pop_next(&mut self) -> Result<Option<CommandLine>, ParseError> {
        if self.discarding && !self.skip_bad_line() {
            return Ok(None);
        }

        let mut pos = 0;
        let mut line = CommandLine::default();
        let tail = loop {
            let Some((token, used)) = scan_token(&self.buf[pos..]) else {
                return Ok(None);
            };
            pos += used;
            match token {
                Token::Str(text) => match line.exprs.last_mut() {
                    Some(Expr::Command(cmd)) => cmd.args.push(text),
                    _ => line.exprs.push(Expr::Command(Command {
                        exe: text,
                        args: Vec::new(),
                    })),
                },
                Token::Newline => {
                    // Blank lines are skipped, not surfaced.
                    if line.exprs.is_empty() {
                        continue;
                    }
                    break Token::Newline;
                }
                Token::Pipe | Token::And | Token::Or => {
                    match line.exprs.last() {
                        None => return self.fail(pos, false, no_left_arg(&token)),
                        Some(Expr::Command(_)) => {}
                        Some(_) => return self.fail(pos, false, left_arg_not_command(&token)),
                    }
                    line.exprs.push(match token {
                        Token::Pipe => Expr::Pipe,
                        Token::And => Expr::And,
                        _ => Expr::Or,
                    });
                }
                tail => break tail,
            }
        };

        let mut tail = tail;
        if matches!(tail, Token::OutNew | Token::OutAppend) {
            line.out_mode = match tail {
                Token::OutNew => OutputMode::FileNew,
                _ => OutputMode::FileAppend,
            };
            let Some((token, used)) = scan_token(&self.buf[pos..]) else {
                return Ok(None);
            };
            pos += used;
            match token {
                Token::Str(name) => line.out_file = Some(name),
                other => {
                    let at_eol = matches!(other, Token::Newline);
                    return self.fail(pos, at_eol, ParseError::OutputRedirectBadArg);
                }
            }
            let Some((token, used)) = scan_token(&self.buf[pos..]) else {
                return Ok(None);
            };
            pos += used;
            tail = token;
        }
        if matches!(tail, Token::Background) {
            line.background = true;
            let Some((token, used)) = scan_token(&self.buf[pos..]) else {
                return Ok(None);
            };
            pos += used;
            tail = token;
        }
        if !matches!(tail, Token::Newline) {
            return self.fail(pos, false, ParseError::TooLateArguments);
        }
        if matches!(line.exprs.last(), Some(Expr::Pipe | Expr::And | Expr::Or)) {
            return self.fail(pos, true, ParseError::EndsNotWithACommand);
        }

        self.buf.drain(..pos);
        Ok(Some(line))
    }

    /// Drops everything up to and including the next newline. Returns false
    /// when the newline has not arrived yet.
    fn skip_bad_line(&mut self) -> bool {
        match memchr(b'\n', &self.buf) {
            Some(idx) => {
                self.buf.drain(..=idx);
                self.discarding = false;
                true
            }
            None => {
                self.buf.clear();
                false
            }
        }
    }

    /// Reports `err` and drops the offending line. When the terminating
    /// newline was already inside the scanned range (`at_eol`), the line is
    /// gone with it; otherwise the remainder is discarded as it arrives.
    fn fail(
        &mut self,
        pos: usize,
        at_eol: bool,
        err: ParseError,
    ) -> Result<Option<CommandLine>, ParseError> {
        self.buf.drain(..pos);
        if !at_eol {
            self.discarding = true;
            self.skip_bad_line();
        }
        Err(err)
    }
}

fn no_left_arg(token: &Token) -> ParseError {
    match token {
        Token::Pipe => ParseError::PipeWithNoLeftArg,
        Token::And => ParseError::AndWithNoLeftArg,
        _ => ParseError::OrWithNoLeftArg,
    }
}

fn left_arg_not_command(token: &Token) -> ParseError {
    match token {
        Token::Pipe => ParseError::PipeLeftArgNotACommand,
        Token::And => ParseError::AndLeftArgNotACommand,
        _ => ParseError::OrLeftArgNotACommand,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_one(input: &str) -> CommandLine {
        let mut parser = Parser::new();
        parser.feed(input.as_bytes());
        parser.pop_next().unwrap().unwrap()
    }

    fn parse_err(input: &str) -> ParseError {
        let mut parser = Parser::new();
        parser.feed(input.as_bytes());
        parser.pop_next().unwrap_err()
    }

    fn cmd(exe: &str, args: &[&str]) -> Expr {
        Expr::Command(Command {
            exe: exe.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        })
    }

    #[test]
    fn single_command_with_args() {
        let line = parse_one("ls -l /tmp\n");
        assert_eq!(line.exprs, vec![cmd("ls", &["-l", "/tmp"])]);
        assert!(line.out_file.is_none());
        assert!(!line.background);
    }

    #[test]
    fn pipeline_and_logic() {
        let line = parse_one("a | b && c || d\n");
        assert_eq!(
            line.exprs,
            vec![
                cmd("a", &[]),
                Expr::Pipe,
                cmd("b", &[]),
                Expr::And,
                cmd("c", &[]),
                Expr::Or,
                cmd("d", &[]),
            ]
        );
    }

    #[test]
    fn redirect_and_background_tail() {
        let line = parse_one("make test >> build.log &\n");
        assert_eq!(line.exprs, vec![cmd("make", &["test"])]);
        assert_eq!(line.out_file.as_deref(), Some("build.log"));
        assert_eq!(line.out_mode, OutputMode::FileAppend);
        assert!(line.background);
    }

    #[test]
    fn incomplete_line_leaves_buffer_intact() {
        let mut parser = Parser::new();
        parser.feed(b"echo partial");
        assert_eq!(parser.pop_next(), Ok(None));
        parser.feed(b" word\n");
        let line = parser.pop_next().unwrap().unwrap();
        assert_eq!(line.exprs, vec![cmd("echo", &["partial", "word"])]);
    }

    #[test]
    fn one_call_per_buffered_line() {
        let mut parser = Parser::new();
        parser.feed(b"one\ntwo\n");
        assert_eq!(parser.pop_next().unwrap().unwrap().exprs, vec![cmd("one", &[])]);
        assert_eq!(parser.pop_next().unwrap().unwrap().exprs, vec![cmd("two", &[])]);
        assert_eq!(parser.pop_next(), Ok(None));
    }

    #[test]
    fn blank_lines_are_skipped() {
        let mut parser = Parser::new();
        parser.feed(b"\n\n  \nls\n");
        let line = parser.pop_next().unwrap().unwrap();
        assert_eq!(line.exprs, vec![cmd("ls", &[])]);
    }

    #[test]
    fn every_structural_error_has_a_canonical_line() {
        assert_eq!(parse_err("| a\n"), ParseError::PipeWithNoLeftArg);
        assert_eq!(parse_err("a | | b\n"), ParseError::PipeLeftArgNotACommand);
        assert_eq!(parse_err("&& a\n"), ParseError::AndWithNoLeftArg);
        assert_eq!(parse_err("a && && b\n"), ParseError::AndLeftArgNotACommand);
        assert_eq!(parse_err("|| a\n"), ParseError::OrWithNoLeftArg);
        assert_eq!(parse_err("a || || b\n"), ParseError::OrLeftArgNotACommand);
        assert_eq!(parse_err("a > > b\n"), ParseError::OutputRedirectBadArg);
        assert_eq!(parse_err("a > f b\n"), ParseError::TooLateArguments);
        assert_eq!(parse_err("a & b\n"), ParseError::TooLateArguments);
        assert_eq!(parse_err("a > f > g\n"), ParseError::TooLateArguments);
        assert_eq!(parse_err("a & > f\n"), ParseError::TooLateArguments);
        assert_eq!(parse_err("a |\n"), ParseError::EndsNotWithACommand);
        assert_eq!(parse_err("a &&\n"), ParseError::EndsNotWithACommand);
    }

    #[test]
    fn parsing_continues_after_an_error() {
        let mut parser = Parser::new();
        parser.feed(b"| broken\nls\n");
        assert_eq!(parser.pop_next(), Err(ParseError::PipeWithNoLeftArg));
        let line = parser.pop_next().unwrap().unwrap();
        assert_eq!(line.exprs, vec![cmd("ls", &[])]);
    }

    #[test]
    fn error_at_end_of_line_spares_the_next_line() {
        for bad in ["a >\n", "a |\n"] {
            let mut parser = Parser::new();
            parser.feed(bad.as_bytes());
            parser.feed(b"ls\n");
            assert!(parser.pop_next().is_err());
            let line = parser.pop_next().unwrap().unwrap();
            assert_eq!(line.exprs, vec![cmd("ls", &[])], "after {bad:?}");
        }
    }

    #[test]
    fn render_parse_round_trip() {
        for input in [
            "echo hi | wc -c\n",
            "false && echo A || echo B\n",
            "grep -r needle . > out.txt &\n",
            "echo \"a b\" 'c|d' >> log\n",
            "printf %s weird\\ arg\n",
        ] {
            let first = parse_one(input);
            let rendered = format!("{first}\n");
            let second = parse_one(&rendered);
            assert_eq!(first, second, "round trip of {input:?} via {rendered:?}");
        }
    }
}
