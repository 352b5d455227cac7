//! Launching external programs as jobs.
//!
//! Every job is forked into its own process group (`pgid == pid`). Foreground
//! jobs borrow the controlling terminal for as long as the shell waits on
//! them; background jobs are registered in the [`JobTable`] and from then on
//! only the reaper looks at them.

use std::ffi::{CString, NulError};
use std::fmt;

use nix::errno::Errno;
use nix::sys::signal::{self, SigHandler, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{self, ForkResult, Pid};
use thiserror::Error;
use tracing::debug;

use crate::command::ExitCode;
use crate::reaper::JobTable;
use crate::terminal::{JOB_CONTROL_SIGNALS, Terminal, stdin_fd};

/// Exit status of a child whose program could not be loaded.
pub const EXIT_NOT_FOUND: i32 = 127;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("empty command")]
    EmptyCommand,
    #[error("argument contains a NUL byte: {0}")]
    InvalidArgument(#[from] NulError),
    #[error("fork: {0}")]
    Fork(#[source] Errno),
    #[error("pipe: {0}")]
    Pipe(#[source] Errno),
    #[error("waitpid: {0}")]
    Wait(#[source] Errno),
    #[error("syntax error: both sides of a pipe need a command")]
    PipeSyntax,
}

/// Last observed state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Running,
    Stopped(Signal),
    Exited(i32),
    Signaled(Signal),
}

impl JobStatus {
    /// Exit code in shell convention: signals map to `128 + signo`.
    pub fn exit_code(&self) -> ExitCode {
        match *self {
            JobStatus::Running => 0,
            JobStatus::Exited(code) => code,
            JobStatus::Stopped(sig) | JobStatus::Signaled(sig) => 128 + sig as i32,
        }
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self, JobStatus::Exited(_) | JobStatus::Signaled(_))
    }
}

/// One launched external program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub pid: Pid,
    pub pgid: Pid,
    pub argv: Vec<String>,
    pub background: bool,
    pub status: JobStatus,
}

impl Job {
    pub fn command_line(&self) -> String {
        self.argv.join(" ")
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[PID {}] {}", self.pid, self.command_line())
    }
}

/// The job control engine: owns the terminal and the background job table.
pub struct JobControl {
    terminal: Terminal,
    table: JobTable,
}

impl JobControl {
    pub fn new(terminal: Terminal, table: JobTable) -> Self {
        Self { terminal, table }
    }

    pub fn terminal(&self) -> &Terminal {
        &self.terminal
    }

    pub fn table(&self) -> &JobTable {
        &self.table
    }

    /// Start `argv` as a new job.
    ///
    /// In the foreground this blocks until the job exits, is killed or stops;
    /// the returned job carries that status. In the background it returns as
    /// soon as the job is registered, with status [`JobStatus::Running`].
    pub fn launch(&mut self, argv: &[String], background: bool) -> Result<Job, JobError> {
        let plan = ExecPlan::new(argv)?;
        let foreground = !background;
        let take_terminal = foreground && self.terminal.is_interactive();

        // SAFETY: the child branch only calls async-signal-safe functions
        // (setpgid, tcsetpgrp, sigaction, execvp, write, _exit) on data
        // prepared before the fork.
        let pid = match unsafe { unistd::fork() } {
            Err(e) => return Err(JobError::Fork(e)),
            Ok(ForkResult::Child) => {
                let _ = unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0));
                if take_terminal {
                    let _ = unistd::tcsetpgrp(stdin_fd(), unistd::getpid());
                    restore_default_signals(&JOB_CONTROL_SIGNALS);
                }
                plan.exec()
            }
            Ok(ForkResult::Parent { child }) => child,
        };

        // The child may not have run yet; make the group exist before anyone
        // (tcsetpgrp, killpg) refers to it. EACCES means it already exec'd.
        if let Err(e) = unistd::setpgid(pid, pid) {
            debug!(pid = pid.as_raw(), "parent setpgid: {e}");
        }

        let mut job = Job {
            pid,
            pgid: pid,
            argv: argv.to_vec(),
            background,
            status: JobStatus::Running,
        };

        if background {
            self.table.insert(job.clone());
            println!("[PID {}] started (background)", pid);
            return Ok(job);
        }

        let waited = {
            let fg = self
                .terminal
                .acquire(job.pgid)
                .map_err(|e| debug!("tcsetpgrp to job failed: {e}"))
                .ok();
            let waited = wait_foreground(pid);
            if let Some(fg) = fg {
                let _ = fg.release();
            }
            waited
        };

        job.status = waited?;
        debug!(pid = pid.as_raw(), status = ?job.status, "foreground job returned");

        if let JobStatus::Stopped(_) = job.status {
            // From here on it behaves like a background job.
            println!("\n{} stopped", job);
            self.table.insert(job.clone());
        }
        Ok(job)
    }
}

/// Block until `pid` exits, is killed or stops.
pub(crate) fn wait_foreground(pid: Pid) -> Result<JobStatus, JobError> {
    loop {
        match waitpid(pid, Some(WaitPidFlag::WUNTRACED)) {
            Ok(WaitStatus::Exited(_, code)) => return Ok(JobStatus::Exited(code)),
            Ok(WaitStatus::Signaled(_, sig, _)) => return Ok(JobStatus::Signaled(sig)),
            Ok(WaitStatus::Stopped(_, sig)) => return Ok(JobStatus::Stopped(sig)),
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(JobError::Wait(e)),
        }
    }
}

/// Block until `pid` terminates; stops are not reported.
pub(crate) fn wait_terminated(pid: Pid) -> Result<JobStatus, JobError> {
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => return Ok(JobStatus::Exited(code)),
            Ok(WaitStatus::Signaled(_, sig, _)) => return Ok(JobStatus::Signaled(sig)),
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(JobError::Wait(e)),
        }
    }
}

/// Put the given signals back to their default disposition.
///
/// Used in a forked child, so it must stay async-signal-safe.
pub(crate) fn restore_default_signals(signals: &[Signal]) {
    for &sig in signals {
        // SAFETY: SIG_DFL installs no handler code.
        let _ = unsafe { signal::signal(sig, SigHandler::SigDfl) };
    }
}

/// Everything the child needs to exec, allocated before `fork`.
pub(crate) struct ExecPlan {
    args: Vec<CString>,
    not_found: Vec<u8>,
}

impl ExecPlan {
    pub(crate) fn new(argv: &[String]) -> Result<Self, JobError> {
        let first = argv.first().ok_or(JobError::EmptyCommand)?;
        let args = argv
            .iter()
            .map(|a| CString::new(a.as_bytes()))
            .collect::<Result<Vec<_>, _>>()?;
        let not_found = format!("{}: command not found\n", first).into_bytes();
        Ok(Self { args, not_found })
    }

    /// Replace the current process image. Never returns.
    pub(crate) fn exec(&self) -> ! {
        let _ = unistd::execvp(&self.args[0], &self.args);
        // SAFETY: write(2) and _exit(2) are async-signal-safe; the buffer
        // outlives the call.
        unsafe {
            libc::write(
                libc::STDERR_FILENO,
                self.not_found.as_ptr().cast(),
                self.not_found.len(),
            );
            libc::_exit(EXIT_NOT_FOUND)
        }
    }
}
