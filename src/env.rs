use std::env as stdenv;
use std::path::PathBuf;

/// Mutable, user-level view of the shell process state shared with built-ins.
///
/// The environment contains:
/// - `current_dir`: the working directory last observed or set by `cd`.
/// - `should_exit`: a flag the command loop checks to know when to terminate.
#[derive(Debug, Clone)]
pub struct Environment {
    /// The current working directory for command execution.
    pub current_dir: PathBuf,
    /// When set to true, the interactive loop stops after the current line.
    pub should_exit: bool,
}

impl Environment {
    /// Capture the current process state into a new `Environment` instance.
    pub fn new() -> Self {
        let current_dir = stdenv::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self {
            current_dir,
            should_exit: false,
        }
    }

    /// Re-read the working directory from the process.
    ///
    /// Returns `None` when the directory cannot be determined (for instance
    /// because it was removed underneath the shell).
    pub fn refresh_current_dir(&mut self) -> Option<&PathBuf> {
        match stdenv::current_dir() {
            Ok(dir) => {
                self.current_dir = dir;
                Some(&self.current_dir)
            }
            Err(_) => None,
        }
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}
