//! Publishes the machine's CPU utilization to the telemetry queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use argh::FromArgs;
use jobshell::channel::{
    self, ChannelConfig, ChannelSender, DEFAULT_CAPACITY, DEFAULT_MESSAGE_SIZE, DEFAULT_QUEUE_NAME,
};
use jobshell::logging;
use jobshell::producer::Publisher;
use jobshell::sampler::{ProcStat, Sampler};
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use tracing::info;

const SIMULATE_ENV: &str = "CPULOAD_SIM";

static STOP: AtomicBool = AtomicBool::new(false);

extern "C" fn request_stop(_: libc::c_int) {
    STOP.store(true, Ordering::Relaxed);
}

#[derive(FromArgs)]
/// Sample CPU utilization and publish it on a POSIX message queue.
struct Args {
    /// queue name, e.g. /cpuload.
    #[argh(option, default = "DEFAULT_QUEUE_NAME.to_string()")]
    queue: String,

    /// seconds between readings.
    #[argh(option, default = "10")]
    period: u64,

    /// publish simulated load instead of reading /proc/stat.
    #[argh(switch)]
    simulate: bool,

    /// maximum queued readings when creating the queue.
    #[argh(option, default = "DEFAULT_CAPACITY")]
    capacity: usize,

    /// maximum message size in bytes when creating the queue.
    #[argh(option, default = "DEFAULT_MESSAGE_SIZE")]
    message_size: usize,

    /// remove the queue name on exit.
    #[argh(switch)]
    unlink_on_exit: bool,
}

fn install_stop_handlers() -> anyhow::Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(request_stop),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    for sig in [Signal::SIGINT, Signal::SIGTERM] {
        // SAFETY: the handler only stores to an atomic.
        unsafe { sigaction(sig, &action) }.with_context(|| format!("installing {sig} handler"))?;
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args: Args = argh::from_env();
    logging::init("info");

    let simulate = args.simulate || std::env::var(SIMULATE_ENV).is_ok_and(|v| v.trim() == "1");
    let config = ChannelConfig {
        name: args.queue,
        capacity: args.capacity,
        message_size: args.message_size,
    };

    install_stop_handlers()?;
    let sender = ChannelSender::create(&config).context("can't create telemetry queue")?;

    let mut sampler = Sampler::new(ProcStat::default());
    if simulate {
        sampler.force_synthetic();
    }
    info!(
        queue = %config.name,
        period = args.period,
        "publishing {} cpu load",
        if simulate { "simulated" } else { "real" }
    );

    let period = Duration::from_secs(args.period.max(1));
    let published = Publisher::new(sampler, sender).run(period, &STOP);
    info!(published, "stopping");

    if args.unlink_on_exit {
        channel::unlink(&config).context("can't remove telemetry queue")?;
    }
    Ok(())
}
