//! Parsed command-line representation.
//!
//! A [`CommandLine`] is an ordered, forward-only sequence of expressions:
//! commands interleaved with the three separators. Rendering via `Display`
//! re-quotes words so a rendered line parses back to an equal tree.

use std::fmt;

/// One executable invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Program name as written, resolved through `PATH` at execution time.
    pub exe: String,
    /// Arguments in order, not including the program name.
    pub args: Vec<String>,
}

/// A node of the command sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    /// A command to run.
    Command(Command),
    /// `|` between two commands.
    Pipe,
    /// `&&` between two pipeline segments.
    And,
    /// `||` between two pipeline segments.
    Or,
}

/// Where the final pipeline segment's standard output goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    /// Inherited standard output.
    #[default]
    Stdout,
    /// `> file`: truncate.
    FileNew,
    /// `>> file`: append.
    FileAppend,
}

/// One complete logical line.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandLine {
    /// Commands and separators in source order. A separator never starts or
    /// ends the sequence and its left neighbor is always a command.
    pub exprs: Vec<Expr>,
    /// Redirect target when `out_mode` is not [`OutputMode::Stdout`].
    pub out_file: Option<String>,
    /// Redirect kind.
    pub out_mode: OutputMode,
    /// Trailing `&`: do not wait for the final segment.
    pub background: bool,
}

fn needs_quoting(word: &str) -> bool {
    word.is_empty()
        || word
            .bytes()
            .any(|b| b.is_ascii_whitespace() || b"|&>'\"#\\".contains(&b))
}

fn write_word(f: &mut fmt::Formatter<'_>, word: &str) -> fmt::Result {
    if !needs_quoting(word) {
        return f.write_str(word);
    }
    f.write_str("\"")?;
    for c in word.chars() {
        if c == '"' || c == '\\' {
            f.write_str("\\")?;
        }
        write!(f, "{c}")?;
    }
    f.write_str("\"")
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_word(f, &self.exe)?;
        for arg in &self.args {
            f.write_str(" ")?;
            write_word(f, arg)?;
        }
        Ok(())
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, expr) in self.exprs.iter().enumerate() {
            if idx > 0 {
                f.write_str(" ")?;
            }
            match expr {
                Expr::Command(cmd) => write!(f, "{cmd}")?,
                Expr::Pipe => f.write_str("|")?,
                Expr::And => f.write_str("&&")?,
                Expr::Or => f.write_str("||")?,
            }
        }
        if let Some(file) = &self.out_file {
            match self.out_mode {
                OutputMode::Stdout => {}
                OutputMode::FileNew => f.write_str(" > ")?,
                OutputMode::FileAppend => f.write_str(" >> ")?,
            }
            write_word(f, file)?;
        }
        if self.background {
            f.write_str(" &")?;
        }
        Ok(())
    }
}
