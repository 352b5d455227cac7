//! CPU utilization sampling from `/proc/stat`, with a synthetic fallback.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;
use tracing::warn;

/// Consecutive failures tolerated before switching to synthetic data for good.
pub const FAILURE_BUDGET: u32 = 3;
/// Gap between the two snapshots of one measurement.
pub const BASELINE_DELAY: Duration = Duration::from_secs(1);

const SYNTHETIC_START: f64 = 35.0;
const SYNTHETIC_STEP: f64 = 5.5;

#[derive(Debug, Error)]
pub enum SampleError {
    #[error("reading cpu counters: {0}")]
    Io(#[from] io::Error),
    #[error("malformed cpu line {0:?}")]
    Malformed(String),
    #[error("cpu counters did not advance")]
    NoProgress,
}

/// Aggregate jiffy counters from the `cpu` line of `/proc/stat`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuTimes {
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
    pub steal: u64,
}

impl CpuTimes {
    /// Parse `cpu  user nice system idle [iowait irq softirq steal ...]`.
    ///
    /// At least four counters are required; missing trailing ones are zero.
    pub fn parse_stat_line(line: &str) -> Result<Self, SampleError> {
        let malformed = || SampleError::Malformed(line.trim_end().to_string());
        let mut fields = line.split_whitespace();
        if fields.next() != Some("cpu") {
            return Err(malformed());
        }
        let mut counters = [0u64; 8];
        let mut seen = 0;
        for (slot, field) in counters.iter_mut().zip(fields) {
            *slot = field.parse().map_err(|_| malformed())?;
            seen += 1;
        }
        if seen < 4 {
            return Err(malformed());
        }
        let [user, nice, system, idle, iowait, irq, softirq, steal] = counters;
        Ok(Self {
            user,
            nice,
            system,
            idle,
            iowait,
            irq,
            softirq,
            steal,
        })
    }

    fn idle_time(&self) -> u64 {
        self.idle.saturating_add(self.iowait)
    }

    fn total(&self) -> u64 {
        [
            self.user,
            self.nice,
            self.system,
            self.idle,
            self.iowait,
            self.irq,
            self.softirq,
            self.steal,
        ]
        .iter()
        .fold(0u64, |acc, v| acc.saturating_add(*v))
    }

    /// Busy percentage between `earlier` and `self`, or `None` when the
    /// counters did not move forward.
    pub fn utilization_since(&self, earlier: &CpuTimes) -> Option<f64> {
        let total = self.total().checked_sub(earlier.total())?;
        let idle = self.idle_time().checked_sub(earlier.idle_time())?;
        if total == 0 {
            return None;
        }
        let busy = total.saturating_sub(idle);
        Some((100.0 * busy as f64 / total as f64).clamp(0.0, 100.0))
    }
}

/// Where counter snapshots come from.
pub trait CpuTimesSource {
    fn read(&mut self) -> Result<CpuTimes, SampleError>;
}

/// The kernel's `/proc/stat`.
#[derive(Debug, Clone)]
pub struct ProcStat {
    path: PathBuf,
}

impl Default for ProcStat {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/proc/stat"),
        }
    }
}

impl ProcStat {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl CpuTimesSource for ProcStat {
    fn read(&mut self) -> Result<CpuTimes, SampleError> {
        let mut line = String::new();
        BufReader::new(File::open(&self.path)?).read_line(&mut line)?;
        CpuTimes::parse_stat_line(&line)
    }
}

/// Bounded random walk standing in for real utilization.
#[derive(Debug)]
pub struct SyntheticLoad<R = StdRng> {
    value: f64,
    rng: R,
}

impl SyntheticLoad<StdRng> {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    pub fn seeded(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }
}

impl Default for SyntheticLoad<StdRng> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Rng> SyntheticLoad<R> {
    pub fn with_rng(rng: R) -> Self {
        Self {
            value: SYNTHETIC_START,
            rng,
        }
    }

    /// Advance the walk one step and return the new value.
    pub fn step(&mut self) -> f64 {
        let next = self.value + self.rng.gen_range(-SYNTHETIC_STEP..=SYNTHETIC_STEP);
        // A single step is far smaller than the range, so one bounce suffices.
        let reflected = if next < 0.0 {
            -next
        } else if next > 100.0 {
            200.0 - next
        } else {
            next
        };
        self.value = reflected.clamp(0.0, 100.0);
        self.value
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Real,
    Synthetic,
}

impl Origin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Origin::Real => "real",
            Origin::Synthetic => "synthetic",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub value: f64,
    pub origin: Origin,
}

/// Produces one reading per call, degrading to synthetic data on failure.
pub struct Sampler<S, R = StdRng> {
    source: S,
    synthetic: SyntheticLoad<R>,
    budget: u32,
    synthetic_only: bool,
    baseline_delay: Duration,
}

impl<S: CpuTimesSource> Sampler<S> {
    pub fn new(source: S) -> Self {
        Self::with_parts(source, SyntheticLoad::new(), BASELINE_DELAY)
    }
}

impl<S: CpuTimesSource, R: Rng> Sampler<S, R> {
    pub fn with_parts(source: S, synthetic: SyntheticLoad<R>, baseline_delay: Duration) -> Self {
        Self {
            source,
            synthetic,
            budget: FAILURE_BUDGET,
            synthetic_only: false,
            baseline_delay,
        }
    }

    /// Stop looking at real counters for the rest of this sampler's life.
    pub fn force_synthetic(&mut self) {
        self.synthetic_only = true;
    }

    pub fn is_synthetic_only(&self) -> bool {
        self.synthetic_only
    }

    #[cfg(test)]
    pub(crate) fn remaining_budget(&self) -> u32 {
        self.budget
    }

    fn measure(&mut self) -> Result<f64, SampleError> {
        let before = self.source.read()?;
        thread::sleep(self.baseline_delay);
        let after = self.source.read()?;
        after
            .utilization_since(&before)
            .ok_or(SampleError::NoProgress)
    }

    pub fn sample(&mut self) -> Sample {
        if self.synthetic_only {
            return self.synthetic();
        }
        match self.measure() {
            Ok(value) => {
                self.budget = FAILURE_BUDGET;
                Sample {
                    value,
                    origin: Origin::Real,
                }
            }
            Err(e) => {
                self.budget = self.budget.saturating_sub(1);
                warn!(remaining = self.budget, "cpu sampling failed: {e}");
                if self.budget == 0 {
                    warn!("cpu counters unavailable, switching to simulated load");
                    self.synthetic_only = true;
                }
                self.synthetic()
            }
        }
    }

    fn synthetic(&mut self) -> Sample {
        Sample {
            value: self.synthetic.step(),
            origin: Origin::Synthetic,
        }
    }
}
