//! Asynchronous reaping of background jobs.
//!
//! The SIGCHLD handler does nothing but write one byte into a non-blocking
//! self-pipe. A dedicated thread sleeps on the read end and, whenever it
//! wakes, drains every pending state change of the registered background
//! jobs. Foreground jobs and pipe stages are never registered, so the thread
//! cannot steal a status the command loop is waiting for.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{self, Pid};
use tracing::{debug, warn};

use crate::job::{Job, JobStatus};

/// Write end of the wake-up pipe, or -1 while no reaper is installed.
static WAKE_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn on_sigchld(_: libc::c_int) {
    wake_reaper();
}

/// Ask the reaper thread for a sweep. Async-signal-safe.
fn wake_reaper() {
    let fd = WAKE_FD.load(Ordering::Relaxed);
    if fd < 0 {
        return;
    }
    let byte = 1u8;
    // SAFETY: errno is thread-local and write(2) is async-signal-safe; a full
    // pipe just drops the byte, one pending byte already guarantees a drain.
    unsafe {
        let errno = libc::__errno_location();
        let saved = *errno;
        libc::write(fd, (&byte as *const u8).cast(), 1);
        *errno = saved;
    }
}

/// A state change observed for a background job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    Stopped(Job),
    Continued(Job),
    /// Exited or killed; the job has been dropped from the table.
    Terminated(Job),
}

impl JobEvent {
    /// Line shown to the user, if the event is worth reporting.
    pub fn report(&self) -> Option<String> {
        match self {
            JobEvent::Stopped(job) => Some(format!("{} stopped", job)),
            JobEvent::Continued(job) => Some(format!("{} continued", job)),
            JobEvent::Terminated(_) => None,
        }
    }
}

/// Background jobs the reaper is responsible for.
#[derive(Debug, Clone, Default)]
pub struct JobTable {
    jobs: Arc<Mutex<HashMap<Pid, Job>>>,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Pid, Job>> {
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a job. The reaper is poked afterwards in case the child
    /// already changed state before it was in the table.
    pub fn insert(&self, job: Job) {
        self.lock().insert(job.pid, job);
        wake_reaper();
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.lock().contains_key(&pid)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Collect every pending state change without blocking.
    ///
    /// Signals coalesce, so one wake-up may stand for several children; the
    /// table is swept repeatedly until a whole pass reports nothing.
    pub fn drain(&self) -> Vec<JobEvent> {
        let flags = WaitPidFlag::WNOHANG | WaitPidFlag::WUNTRACED | WaitPidFlag::WCONTINUED;
        let mut events = Vec::new();

        loop {
            let pids: Vec<Pid> = self.lock().keys().copied().collect();
            let mut progressed = false;

            for pid in pids {
                let status = match waitpid(pid, Some(flags)) {
                    Ok(WaitStatus::StillAlive) => continue,
                    Ok(WaitStatus::Stopped(_, sig)) => JobStatus::Stopped(sig),
                    Ok(WaitStatus::Continued(_)) => JobStatus::Running,
                    Ok(WaitStatus::Exited(_, code)) => JobStatus::Exited(code),
                    Ok(WaitStatus::Signaled(_, sig, _)) => JobStatus::Signaled(sig),
                    Ok(_) => continue,
                    Err(Errno::EINTR) => {
                        progressed = true;
                        continue;
                    }
                    Err(Errno::ECHILD) => {
                        // Collected by someone else; nothing left to track.
                        debug!(pid = pid.as_raw(), "background job vanished");
                        self.lock().remove(&pid);
                        continue;
                    }
                    Err(e) => {
                        warn!(pid = pid.as_raw(), "waitpid failed: {e}");
                        continue;
                    }
                };
                progressed = true;
                if let Some(event) = self.apply(pid, status) {
                    events.push(event);
                }
            }

            if !progressed {
                return events;
            }
        }
    }

    fn apply(&self, pid: Pid, status: JobStatus) -> Option<JobEvent> {
        let mut jobs = self.lock();
        if status.is_terminated() {
            let mut job = jobs.remove(&pid)?;
            job.status = status;
            debug!(pid = pid.as_raw(), ?status, "background job reaped");
            return Some(JobEvent::Terminated(job));
        }
        let job = jobs.get_mut(&pid)?;
        job.status = status;
        let job = job.clone();
        Some(match status {
            JobStatus::Stopped(_) => JobEvent::Stopped(job),
            _ => JobEvent::Continued(job),
        })
    }
}

/// Owner of the SIGCHLD handler and the draining thread.
///
/// Dropping it restores the default SIGCHLD disposition and stops the thread.
pub struct Reaper {
    wake_tx: Option<OwnedFd>,
    handle: Option<JoinHandle<()>>,
}

impl Reaper {
    /// Install the handler and start reporting events of `table` to stdout.
    pub fn spawn(table: JobTable) -> io::Result<Self> {
        Self::spawn_with(table, |event| {
            if let Some(line) = event.report() {
                println!("\n{line}");
            }
        })
    }

    pub fn spawn_with<F>(table: JobTable, mut report: F) -> io::Result<Self>
    where
        F: FnMut(JobEvent) + Send + 'static,
    {
        let (wake_rx, wake_tx) = unistd::pipe2(OFlag::O_CLOEXEC)?;
        nix::fcntl::fcntl(
            wake_tx.as_raw_fd(),
            nix::fcntl::FcntlArg::F_SETFL(OFlag::O_NONBLOCK),
        )?;

        let handle = thread::Builder::new()
            .name("reaper".into())
            .spawn(move || {
                let mut wake = File::from(wake_rx);
                let mut buf = [0u8; 64];
                loop {
                    match wake.read(&mut buf) {
                        Ok(0) => break,
                        Ok(_) => {}
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            warn!("reaper wake pipe failed: {e}");
                            break;
                        }
                    }
                    for event in table.drain() {
                        report(event);
                    }
                }
            })?;

        WAKE_FD.store(wake_tx.as_raw_fd(), Ordering::Relaxed);
        let action = SigAction::new(
            SigHandler::Handler(on_sigchld),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        // SAFETY: the handler only touches an atomic and calls write(2).
        unsafe { signal::sigaction(Signal::SIGCHLD, &action) }?;
        debug!("SIGCHLD reaper installed");

        Ok(Self {
            wake_tx: Some(wake_tx),
            handle: Some(handle),
        })
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
        // SAFETY: restoring SIG_DFL installs no code.
        if let Err(e) = unsafe { signal::sigaction(Signal::SIGCHLD, &default) } {
            warn!("failed to restore SIGCHLD: {e}");
        }
        WAKE_FD.store(-1, Ordering::Relaxed);
        // Closing the write end makes the thread read EOF.
        drop(self.wake_tx.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobControl, wait_terminated};
    use crate::terminal::Terminal;
    use std::time::{Duration, Instant};

    fn argv(words: &[&str]) -> Vec<String> {
        words.iter().map(|s| s.to_string()).collect()
    }

    fn drain_until<P>(table: &JobTable, mut pred: P) -> Vec<JobEvent>
    where
        P: FnMut(&[JobEvent]) -> bool,
    {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut seen = Vec::new();
        while Instant::now() < deadline {
            seen.extend(table.drain());
            if pred(&seen) {
                break;
            }
            thread::sleep(Duration::from_millis(20));
        }
        seen
    }

    #[test]
    fn test_drain_on_empty_table_is_a_no_op() {
        let table = JobTable::new();
        assert!(table.drain().is_empty());
    }

    #[test]
    fn test_drain_reports_stop_continue_and_discards_exit() {
        let table = JobTable::new();
        let mut jobs = JobControl::new(Terminal::detached(), table.clone());
        let job = jobs.launch(&argv(&["sleep", "30"]), true).unwrap();

        // Nothing pending yet: a spurious wake must not block or report.
        assert!(table.drain().is_empty());

        signal::kill(job.pid, Signal::SIGSTOP).unwrap();
        let events = drain_until(&table, |e| !e.is_empty());
        assert!(matches!(&events[..], [JobEvent::Stopped(j)] if j.pid == job.pid));
        assert_eq!(
            events[0].report(),
            Some(format!("[PID {}] sleep 30 stopped", job.pid))
        );

        signal::kill(job.pid, Signal::SIGCONT).unwrap();
        let events = drain_until(&table, |e| !e.is_empty());
        assert!(matches!(&events[..], [JobEvent::Continued(j)] if j.pid == job.pid));

        signal::kill(job.pid, Signal::SIGKILL).unwrap();
        let events = drain_until(&table, |e| !e.is_empty());
        assert!(matches!(
            &events[..],
            [JobEvent::Terminated(j)] if j.status == JobStatus::Signaled(Signal::SIGKILL)
        ));
        assert_eq!(events[0].report(), None);
        assert!(table.is_empty());
        // Reaped for real: nothing left to wait on.
        assert_eq!(waitpid(job.pid, Some(WaitPidFlag::WNOHANG)), Err(Errno::ECHILD));
    }

    #[test]
    fn test_one_drain_collects_several_children() {
        let table = JobTable::new();
        let mut jobs = JobControl::new(Terminal::detached(), table.clone());
        let a = jobs.launch(&argv(&["true"]), true).unwrap();
        let b = jobs.launch(&argv(&["sh", "-c", "exit 4"]), true).unwrap();
        assert_eq!(table.len(), 2);

        // Let both finish before the first sweep.
        thread::sleep(Duration::from_millis(300));
        let events = drain_until(&table, |e| e.len() == 2);

        assert_eq!(events.len(), 2);
        let pids: Vec<Pid> = events
            .iter()
            .map(|e| match e {
                JobEvent::Terminated(j) => j.pid,
                other => panic!("unexpected event {other:?}"),
            })
            .collect();
        assert!(pids.contains(&a.pid) && pids.contains(&b.pid));
        assert!(table.is_empty());
    }

    #[test]
    fn test_reaper_thread_reports_on_sigchld() {
        let table = JobTable::new();
        let (tx, rx) = std::sync::mpsc::channel();
        let reaper = Reaper::spawn_with(table.clone(), move |event| {
            let _ = tx.send(event);
        })
        .unwrap();

        let mut jobs = JobControl::new(Terminal::detached(), table.clone());
        let job = jobs.launch(&argv(&["sh", "-c", "exit 2"]), true).unwrap();

        let event = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        match event {
            JobEvent::Terminated(j) => {
                assert_eq!(j.pid, job.pid);
                assert_eq!(j.status, JobStatus::Exited(2));
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(table.is_empty());
        drop(reaper);
    }

    #[test]
    fn test_unregistered_children_are_left_alone() {
        let table = JobTable::new();
        let mut jobs = JobControl::new(Terminal::detached(), JobTable::new());
        let job = jobs.launch(&argv(&["true"]), true).unwrap();

        thread::sleep(Duration::from_millis(200));
        assert!(table.drain().is_empty());
        assert_eq!(wait_terminated(job.pid).unwrap(), JobStatus::Exited(0));
    }
}
