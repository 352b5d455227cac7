//! `left | right`: two jobs joined by one anonymous pipe.
//!
//! Both stages run in the foreground as a pair and stay in the shell's
//! process group; there is no pipeline group and no terminal hand-off.

use std::os::fd::{AsRawFd, OwnedFd};

use nix::fcntl::OFlag;
use nix::sys::signal::Signal;
use nix::unistd::{self, ForkResult, Pid};
use tracing::debug;

use crate::job::{
    ExecPlan, Job, JobControl, JobError, JobStatus, restore_default_signals, wait_terminated,
};

/// Signals a pipe stage gets back so Ctrl-C and Ctrl-\ reach it. Stop
/// signals stay ignored: the shell waits without `WUNTRACED` and would hang
/// on a stopped stage.
const PIPE_STAGE_SIGNALS: [Signal; 2] = [Signal::SIGINT, Signal::SIGQUIT];

#[derive(Clone, Copy)]
enum PipeEnd {
    /// stdout goes into the pipe.
    Writer,
    /// stdin comes from the pipe.
    Reader,
}

impl JobControl {
    /// Run `left | right` and wait until both stages have terminated.
    pub fn connect(&mut self, left: &[String], right: &[String]) -> Result<(Job, Job), JobError> {
        if left.is_empty() || right.is_empty() {
            return Err(JobError::PipeSyntax);
        }
        let left_plan = ExecPlan::new(left)?;
        let right_plan = ExecPlan::new(right)?;
        let interactive = self.terminal().is_interactive();

        let (read_end, write_end) = unistd::pipe2(OFlag::O_CLOEXEC).map_err(JobError::Pipe)?;

        let ends = (&read_end, &write_end);
        let left_pid = spawn_stage(&left_plan, PipeEnd::Writer, ends, interactive)?;
        let right_pid = match spawn_stage(&right_plan, PipeEnd::Reader, ends, interactive) {
            Ok(pid) => pid,
            Err(e) => {
                drop(write_end);
                drop(read_end);
                let _ = wait_terminated(left_pid);
                return Err(e);
            }
        };

        // The reader only sees end-of-stream once every write end is closed.
        drop(write_end);
        drop(read_end);
        println!("[Pipe] processes {} -> {} started", left_pid, right_pid);

        let left_status = wait_terminated(left_pid);
        let right_status = wait_terminated(right_pid);
        let stage = |pid: Pid, argv: &[String], status: JobStatus| Job {
            pid,
            pgid: unistd::getpgrp(),
            argv: argv.to_vec(),
            background: false,
            status,
        };
        let jobs = (
            stage(left_pid, left, left_status?),
            stage(right_pid, right, right_status?),
        );
        debug!(left = ?jobs.0.status, right = ?jobs.1.status, "pipe finished");
        Ok(jobs)
    }
}

fn spawn_stage(
    plan: &ExecPlan,
    end: PipeEnd,
    (read_end, write_end): (&OwnedFd, &OwnedFd),
    interactive: bool,
) -> Result<Pid, JobError> {
    // SAFETY: the child only calls dup2, close, sigaction and the exec path
    // of `ExecPlan`, all async-signal-safe, on data prepared before the fork.
    match unsafe { unistd::fork() } {
        Err(e) => Err(JobError::Fork(e)),
        Ok(ForkResult::Parent { child }) => Ok(child),
        Ok(ForkResult::Child) => {
            let redirected = match end {
                PipeEnd::Writer => unistd::dup2(write_end.as_raw_fd(), libc::STDOUT_FILENO),
                PipeEnd::Reader => unistd::dup2(read_end.as_raw_fd(), libc::STDIN_FILENO),
            };
            if redirected.is_err() {
                // SAFETY: _exit is async-signal-safe.
                unsafe { libc::_exit(1) };
            }
            // Both originals are O_CLOEXEC, but close them now anyway so
            // nothing but fd 0/1 refers to the pipe from here on.
            let _ = unistd::close(read_end.as_raw_fd());
            let _ = unistd::close(write_end.as_raw_fd());
            if interactive {
                restore_default_signals(&PIPE_STAGE_SIGNALS);
            }
            plan.exec()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reaper::JobTable;
    use crate::terminal::Terminal;
    use std::fs;

    fn argv(words: &[&str]) -> Vec<String> {
        words.iter().map(|s| s.to_string()).collect()
    }

    fn engine() -> JobControl {
        JobControl::new(Terminal::detached(), JobTable::new())
    }

    #[test]
    fn test_missing_side_spawns_nothing() {
        let mut jobs = engine();
        assert!(matches!(
            jobs.connect(&[], &argv(&["wc"])),
            Err(JobError::PipeSyntax)
        ));
        assert!(matches!(
            jobs.connect(&argv(&["ls"]), &[]),
            Err(JobError::PipeSyntax)
        ));
    }

    #[test]
    fn test_line_count_matches_directory_entries() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a", "b", "c", "d", "e"] {
            fs::write(dir.path().join(name), name).unwrap();
        }
        let scratch = tempfile::tempdir().unwrap();
        let out = scratch.path().join("count");
        let dir_arg = dir.path().to_string_lossy().into_owned();
        let script = format!("wc -l > '{}'", out.display());

        let mut jobs = engine();
        let (left, right) = jobs
            .connect(&argv(&["ls", "-1", &dir_arg]), &argv(&["sh", "-c", &script]))
            .unwrap();

        assert_eq!(left.status, JobStatus::Exited(0));
        assert_eq!(right.status, JobStatus::Exited(0));
        let expected = fs::read_dir(dir.path()).unwrap().count();
        let counted: usize = fs::read_to_string(&out).unwrap().trim().parse().unwrap();
        assert_eq!(counted, expected);
    }

    #[test]
    fn test_reader_sees_end_of_stream_and_both_stages_finish() {
        let mut jobs = engine();
        let (left, right) = jobs
            .connect(
                &argv(&["printf", "x\\ny\\n"]),
                &argv(&["sh", "-c", "cat >/dev/null; exit 5"]),
            )
            .unwrap();
        assert_eq!(left.status, JobStatus::Exited(0));
        assert_eq!(right.status, JobStatus::Exited(5));
        assert!(!left.background && !right.background);
    }

    #[test]
    fn test_missing_program_on_either_side() {
        let mut jobs = engine();
        let (left, right) = jobs
            .connect(&argv(&["no-such-program-abc"]), &argv(&["cat"]))
            .unwrap();
        assert_eq!(left.status, JobStatus::Exited(127));
        assert_eq!(right.status, JobStatus::Exited(0));
    }
}
