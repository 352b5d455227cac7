//! An interactive shell with job control and a CPU-load prompt.
//!
//! The shell runs external programs as jobs in their own process groups,
//! hands the controlling terminal to whichever job is in the foreground, and
//! reports background jobs that stop, continue or finish. Two commands can be
//! joined with a single `|`.
//!
//! The prompt shows the machine's CPU utilization as published by the
//! `cpuloadd` daemon over a POSIX message queue; see [`channel`],
//! [`sampler`] and [`producer`] for the publishing side and [`telemetry`] for
//! the shell's receiver.

pub mod builtin;
pub mod channel;
pub mod command;
pub mod env;
pub mod interpreter;
pub mod job;
pub mod lexer;
pub mod logging;
pub mod parser;
pub mod pipe;
pub mod producer;
pub mod reaper;
pub mod sampler;
pub mod telemetry;
pub mod terminal;

pub use interpreter::Interpreter;
pub use job::{Job, JobControl, JobError, JobStatus};
pub use reaper::{JobTable, Reaper};
pub use telemetry::{CpuReading, LoadCell, TelemetryConfig, TelemetryConsumer};
pub use terminal::Terminal;

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::{Mutex, MutexGuard, OnceLock};

    /// Serializes tests that read or change the process working directory.
    pub fn lock_current_dir() -> MutexGuard<'static, ()> {
        static MUTEX: OnceLock<Mutex<()>> = OnceLock::new();
        MUTEX
            .get_or_init(|| Mutex::new(()))
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
