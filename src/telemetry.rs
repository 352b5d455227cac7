//! The shell's view of CPU telemetry: a background receiver feeding a shared
//! cell that the prompt reads.
//!
//! The cell is created here and handed out by [`TelemetryConsumer::load`];
//! nothing else in the shell holds telemetry state. When the channel does not
//! exist the consumer starts in the disabled state and the cell stays
//! [`CpuReading::Unknown`].

use std::fmt;
use std::os::unix::thread::JoinHandleExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Once};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::pthread::pthread_kill;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use tracing::{debug, warn};

use crate::channel::{ChannelConfig, ChannelReceiver, decode_reading};

pub const DEFAULT_GRACE: Duration = Duration::from_millis(200);
pub const DEFAULT_BACKOFF: Duration = Duration::from_millis(100);

/// Signal used to knock the receiver thread out of a blocking receive.
const INTERRUPT: Signal = Signal::SIGUSR1;
const INTERRUPT_ATTEMPTS: u32 = 50;
const INTERRUPT_SPACING: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    pub channel: ChannelConfig,
    /// How long shutdown waits for the receiver to notice the stop flag.
    pub grace: Duration,
    /// Pause after a receive error other than EINTR.
    pub backoff: Duration,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            channel: ChannelConfig::default(),
            grace: DEFAULT_GRACE,
            backoff: DEFAULT_BACKOFF,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CpuReading {
    Percent(u8),
    #[default]
    Unknown,
}

impl fmt::Display for CpuReading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CpuReading::Percent(p) => write!(f, "CPU {}%", p),
            CpuReading::Unknown => f.write_str("CPU n/a"),
        }
    }
}

/// Latest reading, shared between the receiver and the prompt.
#[derive(Debug, Clone, Default)]
pub struct LoadCell(Arc<Mutex<CpuReading>>);

impl LoadCell {
    fn lock(&self) -> MutexGuard<'_, CpuReading> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn snapshot(&self) -> CpuReading {
        *self.lock()
    }

    fn store(&self, reading: CpuReading) {
        *self.lock() = reading;
    }
}

/// A blocking message source the receiver thread can drain.
pub trait MessageSource: Send + 'static {
    /// Block until one message is available. An interrupted wait returns
    /// `Err(Errno::EINTR)`.
    fn receive_into(&mut self, out: &mut Vec<u8>) -> Result<(), Errno>;
}

impl MessageSource for ChannelReceiver {
    fn receive_into(&mut self, out: &mut Vec<u8>) -> Result<(), Errno> {
        let payload = self.receive()?;
        out.clear();
        out.extend_from_slice(payload);
        Ok(())
    }
}

struct Receiver {
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

pub struct TelemetryConsumer {
    cell: LoadCell,
    receiver: Option<Receiver>,
    grace: Duration,
}

impl TelemetryConsumer {
    /// Connect to the channel if it exists. Never blocks and never fails:
    /// problems leave the consumer disabled.
    pub fn start(config: &TelemetryConfig) -> Self {
        match ChannelReceiver::open(&config.channel) {
            Ok(Some(channel)) => match Self::with_source(channel, config) {
                Ok(consumer) => consumer,
                Err(e) => {
                    warn!("telemetry receiver not started: {e}");
                    Self::disabled()
                }
            },
            Ok(None) => {
                debug!(name = %config.channel.name, "telemetry channel absent");
                Self::disabled()
            }
            Err(e) => {
                warn!("telemetry unavailable: {e}");
                Self::disabled()
            }
        }
    }

    pub fn disabled() -> Self {
        Self {
            cell: LoadCell::default(),
            receiver: None,
            grace: DEFAULT_GRACE,
        }
    }

    /// Start a receiver thread draining `source`.
    pub fn with_source<M: MessageSource>(
        source: M,
        config: &TelemetryConfig,
    ) -> std::io::Result<Self> {
        install_interrupt_handler();
        let cell = LoadCell::default();
        let running = Arc::new(AtomicBool::new(true));
        let handle = {
            let cell = cell.clone();
            let running = Arc::clone(&running);
            let backoff = config.backoff;
            thread::Builder::new()
                .name("telemetry".into())
                .spawn(move || receive_loop(source, &cell, &running, backoff))?
        };
        Ok(Self {
            cell,
            receiver: Some(Receiver { running, handle }),
            grace: config.grace,
        })
    }

    /// Handle to the shared reading.
    pub fn load(&self) -> LoadCell {
        self.cell.clone()
    }

    #[cfg(test)]
    pub(crate) fn is_running(&self) -> bool {
        self.receiver.is_some()
    }

    /// Stop the receiver and wait for it. Idempotent.
    pub fn shutdown(&mut self) {
        let Some(Receiver { running, handle }) = self.receiver.take() else {
            return;
        };
        running.store(false, Ordering::Release);

        let deadline = Instant::now() + self.grace;
        while !handle.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }

        // Still blocked in receive: interrupt it until it notices the flag.
        let mut attempts = 0;
        while !handle.is_finished() && attempts < INTERRUPT_ATTEMPTS {
            if let Err(e) = pthread_kill(handle.as_pthread_t(), INTERRUPT) {
                debug!("interrupting telemetry receiver: {e}");
                break;
            }
            thread::sleep(INTERRUPT_SPACING);
            attempts += 1;
        }

        if handle.is_finished() {
            if handle.join().is_err() {
                warn!("telemetry receiver panicked");
            }
        } else {
            warn!("telemetry receiver did not stop, detaching it");
        }
        self.cell.store(CpuReading::Unknown);
    }
}

impl Drop for TelemetryConsumer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn receive_loop<M: MessageSource>(
    mut source: M,
    cell: &LoadCell,
    running: &AtomicBool,
    backoff: Duration,
) {
    let mut payload = Vec::new();
    while running.load(Ordering::Acquire) {
        match source.receive_into(&mut payload) {
            Ok(()) => match decode_reading(&payload) {
                Ok(percent) => cell.store(CpuReading::Percent(percent)),
                Err(e) => warn!("skipping telemetry message: {e}"),
            },
            Err(Errno::EINTR) => continue,
            Err(e) => {
                debug!("telemetry receive failed: {e}");
                thread::sleep(backoff);
            }
        }
    }
    debug!("telemetry receiver finished");
}

extern "C" fn on_interrupt(_: libc::c_int) {}

/// The interrupt signal must not restart the receive and must not kill the
/// process, so it gets an empty handler without `SA_RESTART`.
fn install_interrupt_handler() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        let action = SigAction::new(
            SigHandler::Handler(on_interrupt),
            SaFlags::empty(),
            SigSet::empty(),
        );
        // SAFETY: the handler does nothing.
        if let Err(e) = unsafe { signal::sigaction(INTERRUPT, &action) } {
            warn!("installing {INTERRUPT} handler: {e}");
        }
    });
}
