use std::{mem, path::PathBuf, process};

use anyhow::Context;
use fedsim::{
    algorithms::AlgorithmName,
    registry::Registry,
    sampling::SampleScheme,
    settings::{Overrides, Settings},
    state_machine::{
        events::{EventSubscriber, ModelUpdate, ScoreUpdate},
        StateMachineInitializer,
    },
};
use structopt::StructOpt;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Debug, StructOpt)]
#[structopt(name = "fedsim", about = "Runs a simulated federated learning experiment")]
struct Opt {
    /// Path of the configuration file
    #[structopt(short, long = "config", parse(from_os_str))]
    config_path: PathBuf,

    /// Number of rounds
    #[structopt(long)]
    rounds: Option<u64>,

    /// Number of simulated clients
    #[structopt(long = "n-clients")]
    num_clients: Option<usize>,

    /// Client sampling scheme (`uniform` or `sequential`)
    #[structopt(long = "client-sample-scheme")]
    sample_scheme: Option<SampleScheme>,

    /// Share of clients selected per round
    #[structopt(long = "client-sample-rate")]
    sample_rate: Option<f64>,

    /// Federated learning algorithm (`fedavg`, `fednova`, `fedprox` or `feddyn`)
    #[structopt(long)]
    algorithm: Option<AlgorithmName>,

    /// Number of local epochs per round
    #[structopt(long)]
    epochs: Option<usize>,

    /// Local batch size
    #[structopt(long)]
    batch_size: Option<usize>,

    /// Batch size of the score evaluation
    #[structopt(long)]
    test_batch_size: Option<usize>,

    /// Seed of the run
    #[structopt(long)]
    seed: Option<u64>,

    /// Directory of the metric log
    #[structopt(long, parse(from_os_str))]
    log_dir: Option<PathBuf>,

    /// Gap in rounds between two evaluations of the global scores
    #[structopt(long)]
    log_freq: Option<u64>,

    /// Number of most recent reports averaged into the summary
    #[structopt(long)]
    n_point_summary: Option<usize>,

    /// Number of local training workers
    #[structopt(long)]
    workers: Option<usize>,
}

impl Opt {
    fn overrides(&self) -> Overrides {
        Overrides {
            rounds: self.rounds,
            num_clients: self.num_clients,
            sample_scheme: self.sample_scheme,
            sample_rate: self.sample_rate,
            algorithm: self.algorithm,
            epochs: self.epochs,
            batch_size: self.batch_size,
            test_batch_size: self.test_batch_size,
            seed: self.seed,
            log_dir: self.log_dir.clone(),
            log_freq: self.log_freq,
            n_point_summary: self.n_point_summary,
            workers: self.workers,
        }
    }
}

fn main() {
    let opt = Opt::from_args();

    let mut settings =
        Settings::with_overrides(&opt.config_path, &opt.overrides()).unwrap_or_else(|err| {
            eprintln!("{}", err);
            process::exit(1);
        });

    // the initializer only needs the directory of the log settings
    let filter = mem::replace(&mut settings.log.filter, EnvFilter::new(""));
    let _fmt_subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_ansi(true)
        .init();

    if let Err(err) = run(settings) {
        error!("{:#}", err);
        process::exit(1);
    }
}

fn run(settings: Settings) -> anyhow::Result<()> {
    let (state_machine, events) =
        StateMachineInitializer::new(settings, Registry::with_defaults())
            .init()
            .context("failed to initialize the state machine")?;

    let result = state_machine.run();
    log_final_events(&events);

    let summary = result.context("the federation failed")?;
    for (key, value) in summary {
        info!("{}: {:.6}", key, value);
        println!("{}\t{}", key, value);
    }
    Ok(())
}

/// Logs the last event of every channel.
fn log_final_events(events: &EventSubscriber) {
    let phase = events.phase_listener().get_latest();
    info!("stopped in the {} phase of round {}", phase.event, phase.round_id);

    let selection = events.selection_listener().get_latest();
    debug!(
        "round {} selected {} clients",
        selection.round_id,
        selection.event.len()
    );

    let model = events.model_listener().get_latest();
    match model.event {
        ModelUpdate::New(params) => info!(
            "the global model of round {} has {} parameters",
            model.round_id,
            params.len()
        ),
        ModelUpdate::Invalidate => warn!("no valid global model"),
    }

    let report = events.scores_listener().get_latest();
    if let ScoreUpdate::New(scores) = report.event {
        for (key, value) in scores.iter() {
            debug!("round {} reported {}: {:.6}", report.round_id, key, value);
        }
    }
}
