//! Controlling-terminal ownership as an explicit single-owner resource.
//!
//! Only two parties ever own the terminal: the shell's process group, or the
//! process group of the one foreground job. Ownership moves to a job through
//! [`Terminal::acquire`], which returns a guard; dropping the guard (or calling
//! [`Foreground::release`]) hands the terminal back to the shell.
//!
//! When the shell is not attached to a terminal every hand-off is tracked
//! logically but no system call is made.

use std::io::IsTerminal;
use std::os::fd::BorrowedFd;

use nix::sys::signal::{self, SigHandler, Signal};
use nix::unistd::{self, Pid};
use tracing::{debug, warn};

/// Signals the interactive shell ignores and foreground jobs get back.
pub const JOB_CONTROL_SIGNALS: [Signal; 5] = [
    Signal::SIGINT,
    Signal::SIGQUIT,
    Signal::SIGTSTP,
    Signal::SIGTTIN,
    Signal::SIGTTOU,
];

/// Borrow of fd 0 that allocates nothing, so a forked child may use it.
pub(crate) fn stdin_fd() -> BorrowedFd<'static> {
    // SAFETY: fd 0 stays open for the whole life of the process.
    unsafe { BorrowedFd::borrow_raw(libc::STDIN_FILENO) }
}

#[derive(Debug)]
pub struct Terminal {
    interactive: bool,
    shell_pgid: Pid,
    owner: Pid,
}

impl Terminal {
    /// Inspect stdin and, when it is a terminal, establish the shell's
    /// start-up invariant: own process group, terminal owner, job-control
    /// signals ignored.
    pub fn init() -> nix::Result<Self> {
        if !std::io::stdin().is_terminal() {
            return Ok(Self::detached());
        }

        // Wait until we are in the foreground before taking anything over.
        loop {
            let shell_pgid = unistd::getpgrp();
            match unistd::tcgetpgrp(stdin_fd()) {
                Ok(fg) if fg == shell_pgid => break,
                Ok(_) => signal::killpg(shell_pgid, Signal::SIGTTIN)?,
                Err(e) => return Err(e),
            }
        }

        for sig in JOB_CONTROL_SIGNALS {
            // SAFETY: installing SIG_IGN runs no code in signal context.
            unsafe { signal::signal(sig, SigHandler::SigIgn) }?;
        }

        let pid = unistd::getpid();
        if let Err(e) = unistd::setpgid(pid, pid) {
            // A session leader is already its own group leader.
            debug!("setpgid on shell failed: {e}");
        }
        let shell_pgid = unistd::getpgrp();
        unistd::tcsetpgrp(stdin_fd(), shell_pgid)?;
        debug!(pgid = shell_pgid.as_raw(), "shell owns the terminal");

        Ok(Self {
            interactive: true,
            shell_pgid,
            owner: shell_pgid,
        })
    }

    /// A terminal for a shell reading from a pipe or file.
    pub fn detached() -> Self {
        let shell_pgid = unistd::getpgrp();
        Self {
            interactive: false,
            shell_pgid,
            owner: shell_pgid,
        }
    }

    pub fn is_interactive(&self) -> bool {
        self.interactive
    }

    pub fn shell_pgid(&self) -> Pid {
        self.shell_pgid
    }

    /// Process group currently holding the terminal.
    pub fn owner(&self) -> Pid {
        self.owner
    }

    /// Hand the terminal to `pgid` for the lifetime of the returned guard.
    pub fn acquire(&mut self, pgid: Pid) -> nix::Result<Foreground<'_>> {
        if self.interactive {
            unistd::tcsetpgrp(stdin_fd(), pgid)?;
        }
        self.owner = pgid;
        debug!(pgid = pgid.as_raw(), "terminal handed to job");
        Ok(Foreground {
            terminal: self,
            released: false,
        })
    }

    fn release_to_shell(&mut self) -> nix::Result<()> {
        if self.interactive {
            unistd::tcsetpgrp(stdin_fd(), self.shell_pgid)?;
        }
        self.owner = self.shell_pgid;
        debug!("terminal returned to shell");
        Ok(())
    }
}

/// Proof that a foreground job currently owns the terminal.
#[must_use = "dropping the guard returns the terminal to the shell immediately"]
pub struct Foreground<'a> {
    terminal: &'a mut Terminal,
    released: bool,
}

impl Foreground<'_> {
    #[cfg(test)]
    pub(crate) fn owner(&self) -> Pid {
        self.terminal.owner
    }

    /// Give the terminal back to the shell, reporting failure.
    pub fn release(mut self) -> nix::Result<()> {
        self.released = true;
        self.terminal.release_to_shell()
    }
}

impl Drop for Foreground<'_> {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.terminal.release_to_shell() {
                warn!("failed to reclaim terminal: {e}");
            }
        }
    }
}
