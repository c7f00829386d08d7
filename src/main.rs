use clap::{Args, Parser, Subcommand};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use lamport_machines::abstractions::choice::{EventWeights, RateRange};
use lamport_machines::abstractions::logging::EventLogger;
use lamport_machines::config::{NodeConfig, PeerAddr};
use lamport_machines::coordinator::run_node;
use lamport_machines::{Coordinator, MachineReport, SimulationConfig};

/// Machines with independent tick rates exchanging Lamport-timestamped
/// messages.
#[derive(Parser, Debug)]
#[command(name = "lamport-machines")]
#[command(version)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run every machine in this process over in-memory links
    Simulate(SimulateArgs),
    /// Run a single machine that talks to its peers over TCP
    Machine(MachineArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Slowest tick rate a machine can draw (ticks per second)
    #[arg(long, default_value_t = 1)]
    min_rate: u32,

    /// Fastest tick rate a machine can draw (ticks per second)
    #[arg(long, default_value_t = 20)]
    max_rate: u32,

    /// Weights for send-to-first,send-to-second,send-to-both,internal
    #[arg(long, default_value = "1,1,1,17")]
    weights: EventWeights,

    /// Seconds to run; 0 runs until Ctrl-C
    #[arg(long, default_value_t = 60)]
    duration: u64,

    /// Trial number, used in log file names
    #[arg(long, default_value_t = 1)]
    trial: u32,

    /// Seed for reproducible rates and event choices
    #[arg(long)]
    seed: Option<u64>,

    /// Directory for vm_<id>_trial<n>.log files
    #[arg(long, default_value = ".")]
    log_dir: PathBuf,
}

impl RunArgs {
    fn duration(&self) -> Option<Duration> {
        (self.duration > 0).then(|| Duration::from_secs(self.duration))
    }
}

#[derive(Args, Debug)]
struct SimulateArgs {
    /// Number of machines
    #[arg(long, default_value_t = 3)]
    machines: usize,

    /// Number of consecutive trials, starting at --trial
    #[arg(long, default_value_t = 1)]
    trials: u32,

    #[command(flatten)]
    run: RunArgs,
}

#[derive(Args, Debug)]
struct MachineArgs {
    /// This machine's id
    #[arg(long)]
    id: usize,

    /// Address to accept peer connections on
    #[arg(long, default_value = "127.0.0.1:8001")]
    listen: SocketAddr,

    /// Peer as <id>=<host:port>; repeat for each peer
    #[arg(long = "peer", required = true)]
    peers: Vec<PeerAddr>,

    /// Seconds between connection attempts to a peer
    #[arg(long, default_value_t = 2)]
    connect_retry: u64,

    #[command(flatten)]
    run: RunArgs,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let cancel_token = CancellationToken::new();
    tokio::spawn({
        let cancel_token = cancel_token.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("shutdown requested");
                    cancel_token.cancel();
                }
                Err(err) => error!("unable to listen for shutdown signal: {}", err),
            }
        }
    });

    match cli.command {
        Command::Simulate(args) => simulate(args, cancel_token).await,
        Command::Machine(args) => machine(args, cancel_token).await,
    }
}

async fn simulate(
    args: SimulateArgs,
    cancel_token: CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    let rates = RateRange::new(args.run.min_rate, args.run.max_rate)?;
    let first_trial = args.run.trial;

    for trial in first_trial..first_trial.saturating_add(args.trials) {
        if cancel_token.is_cancelled() {
            break;
        }
        let config = SimulationConfig {
            machines: args.machines,
            rates,
            weights: args.run.weights,
            duration: args.run.duration(),
            trial,
            seed: args.run.seed.map(|seed| seed.wrapping_add(u64::from(trial))),
        };

        let (logger, event_sender) = EventLogger::new(&args.run.log_dir, trial);
        let logger = logger.start();
        let report = Coordinator::new(config, event_sender)?
            .run(cancel_token.clone())
            .await?;
        let lines = logger.await??;

        info!(trial, run_id = %report.run_id, lines, "trial complete");
        report.machines.iter().for_each(log_report);
    }
    Ok(())
}

async fn machine(
    args: MachineArgs,
    cancel_token: CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    let peers: BTreeMap<_, _> = args.peers.iter().map(|peer| (peer.id, peer.addr)).collect();
    let config = NodeConfig {
        id: args.id,
        listen: args.listen,
        peers,
        rates: RateRange::new(args.run.min_rate, args.run.max_rate)?,
        weights: args.run.weights,
        duration: args.run.duration(),
        trial: args.run.trial,
        seed: args.run.seed,
        connect_retry: Duration::from_secs(args.connect_retry),
    };

    let (logger, event_sender) = EventLogger::new(&args.run.log_dir, config.trial);
    let logger = logger.start();
    let report = run_node(config, event_sender, cancel_token).await?;
    logger.await??;
    log_report(&report);
    Ok(())
}

fn log_report(report: &MachineReport) {
    info!(
        machine = report.id,
        rate = report.rate.per_second(),
        final_clock = report.final_clock,
        internal = report.counts.internal,
        send = report.counts.send,
        receive = report.counts.receive,
        delivery_failures = report.counts.delivery_failures,
        discarded_backlog = report.discarded_backlog,
        "machine report"
    );
}
