// src/main.rs
//
// CLI entrypoint: evolve linear policies on the built-in corridor level.
//
// Constraints:
// - Config precedence: CLI flag > EVORUN_* environment variable > default.
// - Deterministic runs via --seed (all rollout seeds derive from it).
// - Ctrl-C requests a stop between generations; in-flight rollouts finish
//   and the last scored generation is checkpointed before exit.
// - Outputs under --output-dir: checkpoints/, telemetry.jsonl,
//   run_summary.json and, when solved, winner.json.
// - Exit codes: 0 on a clean finish (including interruption), 1 on a
//   systemic fault, 2 on invalid arguments or configuration.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::thread;

use anyhow::Context;
use clap::{ArgAction, Parser};
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use evorun::checkpoint::{atomic_write, CheckpointStore, JsonCheckpointStore};
use evorun::config::EvoConfig;
use evorun::error::EvoError;
use evorun::evolution::{MutationConfig, MutationEngine};
use evorun::logging::FileSink;
use evorun::rl::{
    ActionLayout, CorridorConfig, CorridorFactory, LinearPolicy, Policy, ScalingEncoder,
    CORRIDOR_OBS_DIM,
};
use evorun::scheduler::{CancellationToken, PopulationScheduler, RunOutcome, Terminal};

const CHECKPOINT_DIR: &str = "checkpoints";
const TELEMETRY_FILE: &str = "telemetry.jsonl";
const SUMMARY_FILE: &str = "run_summary.json";
const WINNER_FILE: &str = "winner.json";

/// Scale of the initial random policy weights.
const INITIAL_WEIGHT_SCALE: f32 = 1.0;

#[derive(Debug, Parser)]
#[command(
    name = "evorun",
    about = "Population-based neuroevolution of control policies (corridor harness)",
    version
)]
struct Args {
    /// Directory for checkpoints, telemetry and run outputs.
    #[arg(long, default_value = "evorun-out")]
    output_dir: PathBuf,

    /// Stop after this many generations (unbounded if omitted).
    #[arg(long)]
    generations: Option<u64>,

    /// Number of rollout workers (default: available parallelism).
    #[arg(long)]
    workers: Option<usize>,

    /// Base seed for rollouts and breeding.
    #[arg(long)]
    seed: Option<u64>,

    /// Query the policy every N environment steps.
    #[arg(long)]
    frame_jump: Option<u32>,

    /// Step limit per rollout.
    #[arg(long)]
    max_steps: Option<u64>,

    /// Candidates per generation.
    #[arg(long, default_value_t = 50)]
    population: usize,

    /// Running average a candidate must hold through verification.
    #[arg(long)]
    solved_threshold: Option<f64>,

    /// Number of verification trials.
    #[arg(long)]
    solved_trials: Option<u32>,

    /// Checkpoint every N generations (0 disables the generation trigger).
    #[arg(long)]
    checkpoint_every: Option<u64>,

    /// Continue from the latest checkpoint in --output-dir.
    #[arg(long)]
    resume: bool,

    /// Short noiseless level (smoke tests and demos).
    #[arg(long)]
    quick_level: bool,

    /// Verbosity: -v, -vv
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

impl Args {
    fn apply(&self, mut cfg: EvoConfig) -> EvoConfig {
        if let Some(n) = self.generations {
            cfg.max_generations = Some(n);
        }
        if let Some(w) = self.workers {
            cfg.worker_count = w;
        }
        if let Some(s) = self.seed {
            cfg.base_seed = s;
        }
        if let Some(f) = self.frame_jump {
            cfg.frame_jump = f;
        }
        if let Some(m) = self.max_steps {
            cfg.max_steps = m;
        }
        if let Some(t) = self.solved_threshold {
            cfg.solved_score_threshold = t;
        }
        if let Some(t) = self.solved_trials {
            cfg.solved_verification_trials = t;
        }
        if let Some(n) = self.checkpoint_every {
            cfg.checkpoint_every_n_generations = (n > 0).then_some(n);
        }
        cfg
    }
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_env("EVORUN_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Cancel `token` on the first Ctrl-C. The listener runs on its own small
/// runtime so the rollout workers stay plain threads.
fn spawn_interrupt_listener(token: CancellationToken) {
    let spawned = thread::Builder::new()
        .name("evorun-signal".into())
        .spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    warn!(error = %e, "signal runtime unavailable; Ctrl-C will not stop cleanly");
                    return;
                }
            };
            rt.block_on(async {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => {
                        warn!("interrupt received; stopping after the current generation");
                        token.cancel();
                    }
                    Err(e) => warn!(error = %e, "failed to listen for Ctrl-C"),
                }
            });
        });
    if let Err(e) = spawned {
        warn!(error = %e, "failed to spawn signal listener");
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    let cfg = args.apply(EvoConfig::from_env_or_default());
    if let Err(e) = cfg.validate() {
        eprintln!("evorun: {e}");
        return ExitCode::from(2);
    }
    let mutation = MutationConfig {
        population_size: args.population,
        ..MutationConfig::default()
    };
    if let Err(e) = mutation.validate() {
        eprintln!("evorun: {e}");
        return ExitCode::from(2);
    }

    match run(&args, cfg, mutation) {
        Ok(outcome) => {
            println!(
                "evorun | terminal={:?} generations={} best_fitness={}",
                outcome.terminal,
                outcome.generations_evaluated,
                outcome
                    .best
                    .as_ref()
                    .and_then(|c| c.fitness)
                    .map(|f| format!("{f:.1}"))
                    .unwrap_or_else(|| "n/a".into()),
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("evorun: {e:#}");
            let invalid = e
                .downcast_ref::<EvoError>()
                .is_some_and(|err| matches!(err, EvoError::InvalidConfig(_)));
            ExitCode::from(if invalid { 2 } else { 1 })
        }
    }
}

fn run(args: &Args, cfg: EvoConfig, mutation: MutationConfig) -> anyhow::Result<RunOutcome<LinearPolicy>> {
    cfg.log_startup();

    let out = args.output_dir.as_path();
    std::fs::create_dir_all(out)
        .with_context(|| format!("creating output dir {}", out.display()))?;

    let level = if args.quick_level {
        CorridorConfig::deterministic()
    } else {
        CorridorConfig::default()
    };
    let layout = ActionLayout::default();
    let outputs = layout.num_outputs();

    let mut engine = MutationEngine::new(mutation, cfg.base_seed)?;
    let store = JsonCheckpointStore::new(out.join(CHECKPOINT_DIR));

    let mut sink = FileSink::from_env();
    if !sink.is_enabled() {
        sink = FileSink::enable(out.join(TELEMETRY_FILE));
    }

    let mut scheduler: PopulationScheduler<LinearPolicy, _, _, FileSink> = PopulationScheduler::new(
        cfg.clone(),
        CorridorFactory::new(level),
        ScalingEncoder::new(CORRIDOR_OBS_DIM),
    )?
    .with_sink(sink)
    .with_checkpoint_store(Box::new(store.clone()));

    let restored = if args.resume {
        CheckpointStore::<LinearPolicy>::load(&store).context("loading checkpoint")?
    } else {
        None
    };
    let population = match restored {
        Some(checkpoint) => scheduler.resume(checkpoint, &mut engine)?,
        None => {
            if args.resume {
                warn!(dir = %store.dir().display(), "no checkpoint found; starting fresh");
            }
            engine.seed_population(|rng| {
                LinearPolicy::random(CORRIDOR_OBS_DIM, outputs, INITIAL_WEIGHT_SCALE, rng)
            })?
        }
    };

    let token = CancellationToken::new();
    spawn_interrupt_listener(token.clone());

    let outcome = scheduler.run(population, &mut engine, &token)?;

    write_summary(out, &cfg, &outcome)?;
    if outcome.terminal == Terminal::Solved {
        if let Some(best) = outcome.best.as_ref() {
            let winner = json!({
                "candidate_id": best.id,
                "fitness": best.fitness,
                "policy_version": best.policy.version(),
                "policy": best.policy,
                "verification": outcome.verification,
            });
            write_json(&out.join(WINNER_FILE), &winner)?;
            info!(candidate = %best.id, "winner saved");
        }
    }
    Ok(outcome)
}

fn write_summary(out: &Path, cfg: &EvoConfig, outcome: &RunOutcome<LinearPolicy>) -> anyhow::Result<()> {
    let summary = json!({
        "config": cfg,
        "terminal": outcome.terminal,
        "generations_evaluated": outcome.generations_evaluated,
        "last_generation": outcome.last_generation,
        "best_candidate": outcome.best.as_ref().map(|c| c.id),
        "best_fitness": outcome.best.as_ref().and_then(|c| c.fitness),
        "verification": outcome.verification,
        "score_history": outcome.score_history,
        "fitness_history": outcome.fitness_history,
    });
    write_json(&out.join(SUMMARY_FILE), &summary)
}

fn write_json(path: &Path, value: &serde_json::Value) -> anyhow::Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write(path, &bytes).with_context(|| format!("writing {}", path.display()))
}
