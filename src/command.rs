use crate::env::Environment;
use anyhow::Result;
use std::io::{BufRead, Write};

/// Conventional process exit code type used by this crate.
///
/// A value of 0 indicates success; any non-zero value indicates failure.
/// Jobs killed by a signal report `128 + signal`, as POSIX shells do.
pub type ExitCode = i32;

/// Object-safe trait for a command that runs inside the shell process.
///
/// Built-ins implement it through a blanket impl in [`crate::builtin`].
/// External programs never go through this trait: they are launched by
/// [`crate::job::JobControl`].
pub trait ExecutableCommand {
    /// Executes the command.
    ///
    /// `stdin` is line-oriented so that confirmation prompts (`exit`) can read
    /// an answer without disturbing the line editor.
    fn execute(
        self: Box<Self>,
        stdin: &mut dyn BufRead,
        stdout: &mut dyn Write,
        env: &mut Environment,
    ) -> Result<ExitCode>;
}

/// Factory that tries to create a command from a name and its arguments.
///
/// Returns `None` when the factory doesn't recognize the `name`.
pub trait CommandFactory {
    /// Attempt to create a command instance for the provided name and arguments.
    fn try_create(&self, name: &str, args: &[&str]) -> Option<Box<dyn ExecutableCommand>>;
}
