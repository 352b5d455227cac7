use anyhow::Context;
use argh::FromArgs;
use jobshell::channel::{ChannelConfig, DEFAULT_QUEUE_NAME};
use jobshell::{
    Interpreter, JobControl, JobTable, Reaper, TelemetryConfig, TelemetryConsumer, Terminal,
    logging,
};

#[derive(FromArgs)]
/// Interactive shell with job control and a CPU-load prompt.
struct Args {
    /// telemetry queue to read CPU load from.
    #[argh(option, default = "DEFAULT_QUEUE_NAME.to_string()")]
    queue: String,

    /// do not connect to the telemetry queue; the prompt shows n/a.
    #[argh(switch)]
    no_telemetry: bool,
}

fn main() -> anyhow::Result<()> {
    let args: Args = argh::from_env();
    logging::init("warn");

    let terminal = Terminal::init().context("can't take control of the terminal")?;
    let table = JobTable::new();
    let reaper = Reaper::spawn(table.clone()).context("can't start the job reaper")?;

    let mut consumer = if args.no_telemetry {
        TelemetryConsumer::disabled()
    } else {
        TelemetryConsumer::start(&TelemetryConfig {
            channel: ChannelConfig::named(args.queue),
            ..TelemetryConfig::default()
        })
    };

    let mut shell = Interpreter::with_jobs(JobControl::new(terminal, table), consumer.load());
    let result = shell.repl();

    consumer.shutdown();
    drop(reaper);
    println!("Shell terminated.");
    result.context("line editor failed")
}
