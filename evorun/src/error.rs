// src/error.rs
//
// Error taxonomy for the evaluation scheduler.
//
// - RolloutFault: contained to one candidate's EvaluationResult, never
//   propagated past the runner.
// - EvoError: everything the scheduler, checkpoint store or config loader
//   can surface to a caller. Only the systemic variants end a run.

use std::io;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

use crate::population::CandidateId;

/// Fault raised inside a single rollout.
#[derive(Debug, Clone, Error, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RolloutFault {
    #[error("environment fault at step {step}: {reason}")]
    Environment { step: u64, reason: String },

    #[error("encoder fault at step {step}: {reason}")]
    Encoder { step: u64, reason: String },

    #[error("policy fault at step {step}: {reason}")]
    Policy { step: u64, reason: String },

    #[error("non-finite reward {reward} at step {step}")]
    Diverged { step: u64, reward: f64 },

    #[error("environment unavailable after {attempts} attempts: {reason}")]
    EnvironmentUnavailable { attempts: u32, reason: String },

    #[error("rollout panicked at step {step}: {message}")]
    Panicked { step: u64, message: String },
}

impl RolloutFault {
    /// True when the environment could not be built at all.
    pub fn is_environment_unavailable(&self) -> bool {
        matches!(self, RolloutFault::EnvironmentUnavailable { .. })
    }
}

#[derive(Debug, Error)]
pub enum EvoError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("no environment could be constructed for any of {candidates} candidates in generation {generation}")]
    NoEnvironment { generation: u64, candidates: usize },

    #[error("evolution engine failed: {0}")]
    EvolutionEngine(String),

    #[error("population is empty")]
    EmptyPopulation,

    #[error("duplicate candidate id {0} in population")]
    DuplicateCandidate(CandidateId),

    #[error("no result returned for candidate {0}")]
    MissingResult(CandidateId),

    #[error("failed to build worker pool: {0}")]
    WorkerPool(String),

    #[error("checkpoint write to {path:?} failed: {source}")]
    CheckpointWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("checkpoint read from {path:?} failed: {source}")]
    CheckpointRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("checkpoint {path:?} is corrupt: {reason}")]
    CheckpointCorrupt { path: PathBuf, reason: String },

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, EvoError>;
