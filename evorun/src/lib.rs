//! Evorun core library.
//!
//! Population-based neuroevolution of control policies. The library
//! evaluates each generation of candidate policies in parallel rollouts,
//! turns rollout outcomes into fitness, and drives the generation loop
//! around a pluggable evolution engine. The binary (`src/main.rs`) is a thin
//! CLI around these components using the built-in corridor environment.
//!
//! # Architecture
//!
//! - **Rollout** (`rl`): environment, encoder and policy contracts plus the
//!   frame-skip rollout runner. A rollout never raises: faults are folded
//!   into the evaluation result of the candidate that caused them.
//!
//! - **Population** (`population`): candidates with stable ids, fitness and
//!   per-generation status.
//!
//! - **Scheduler** (`scheduler`): dispatches a generation to a fixed-size
//!   worker pool, waits at the barrier, aggregates, checkpoints, verifies
//!   and breeds.
//!
//! - **Evolution** (`evolution`): the breeding interface and a reference
//!   truncation-selection engine with elitism.
//!
//! - **Persistence** (`checkpoint`): versioned, hash-checked checkpoint
//!   envelopes written atomically, and the checkpoint cadence.
//!
//! - **Verification** (`verify`): deterministic re-runs of the best
//!   candidate against the solved threshold.
//!
//! - **Telemetry** (`logging`, `history`, `metrics`): per-generation records,
//!   score and fitness histories, and the trailing fitness report.

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod evolution;
pub mod history;
pub mod logging;
pub mod metrics;
pub mod population;
pub mod rl;
pub mod scheduler;
pub mod verify;

// --- Re-exports for ergonomic external use ---------------------------------

pub use config::EvoConfig;
pub use error::{EvoError, Result, RolloutFault};

pub use checkpoint::{
    atomic_write, Checkpoint, CheckpointCadence, CheckpointStore, JsonCheckpointStore,
    CHECKPOINT_SCHEMA_VERSION,
};

pub use evolution::{EvolutionEngine, Genome, MutationConfig, MutationEngine};

pub use history::{FitnessHistory, FitnessSample, ScoreHistory, ScoreSample};

pub use logging::{EventSink, FileSink, GenerationRecord, MemorySink, NoopSink};

pub use population::{Candidate, CandidateId, CandidateStatus, Population};

pub use scheduler::{
    CancellationToken, GenerationPhase, GenerationReport, PopulationScheduler, RunOutcome,
    Terminal,
};

pub use verify::{verify_solved, VerificationOutcome};

pub use rl::{
    derive_seed, Action, ActionLayout, EnvFactory, Environment, EvaluationResult, LinearPolicy,
    ObservationEncoder, Policy, RolloutLimits, RolloutRunner, TerminationReason,
};
