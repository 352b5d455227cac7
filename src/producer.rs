//! The publishing side of the telemetry channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;
use rand::rngs::StdRng;
use tracing::{info, warn};

use crate::channel::{ChannelError, ChannelSender, encode_reading};
use crate::sampler::{CpuTimesSource, Sample, Sampler};

pub const DEFAULT_PERIOD: Duration = Duration::from_secs(10);

/// Upper bound on how long a stop request can go unnoticed between cycles.
const STOP_POLL: Duration = Duration::from_millis(100);

/// Anything a reading can be pushed into without blocking.
pub trait ReadingSink {
    fn send(&mut self, payload: &[u8]) -> Result<(), ChannelError>;
}

impl ReadingSink for ChannelSender {
    fn send(&mut self, payload: &[u8]) -> Result<(), ChannelError> {
        ChannelSender::send(self, payload)
    }
}

pub struct Publisher<S, K, R = StdRng> {
    sampler: Sampler<S, R>,
    sink: K,
}

impl<S: CpuTimesSource, K: ReadingSink, R: Rng> Publisher<S, K, R> {
    pub fn new(sampler: Sampler<S, R>, sink: K) -> Self {
        Self { sampler, sink }
    }

    pub fn sampler(&self) -> &Sampler<S, R> {
        &self.sampler
    }

    /// Take one sample and offer it to the sink. A rejected send is logged
    /// and the reading dropped.
    pub fn publish_once(&mut self) -> Sample {
        let sample = self.sampler.sample();
        info!(origin = sample.origin.as_str(), "cpu load {:.1}%", sample.value);
        match self.sink.send(encode_reading(sample.value).as_bytes()) {
            Ok(()) => {}
            Err(ChannelError::Full) => warn!("telemetry queue full, reading dropped"),
            Err(e) => warn!("publishing reading failed: {e}"),
        }
        sample
    }

    /// Publish once per `period` until `stop` is set. The cycle in progress
    /// is always completed.
    pub fn run(&mut self, period: Duration, stop: &AtomicBool) -> u64 {
        let mut published = 0;
        while !stop.load(Ordering::Relaxed) {
            let started = Instant::now();
            self.publish_once();
            published += 1;
            while !stop.load(Ordering::Relaxed) {
                let elapsed = started.elapsed();
                if elapsed >= period {
                    break;
                }
                thread::sleep((period - elapsed).min(STOP_POLL));
            }
        }
        published
    }
}
