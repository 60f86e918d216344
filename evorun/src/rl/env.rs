// src/rl/env.rs
//
// Environment adapter and factory interfaces.
//
// Environments are Gym-style: reset() -> observation, step(action) ->
// (observation, reward, done). Every rollout asks the factory for a fresh
// instance, so no state leaks between candidates.

use thiserror::Error;

use super::action::Action;

/// Error raised by an environment or its factory.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct EnvError(pub String);

impl EnvError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Result of a single environment step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome<O> {
    pub observation: O,
    pub reward: f64,
    pub done: bool,
}

/// Resettable stateful simulation.
pub trait Environment {
    type Observation;

    /// Start a new episode and return the initial observation.
    fn reset(&mut self) -> Result<Self::Observation, EnvError>;

    /// Advance one native step with the given action.
    fn step(&mut self, action: &Action) -> Result<StepOutcome<Self::Observation>, EnvError>;

    /// Human-facing playback hook. Never called by the scheduler.
    fn render(&mut self) {}
}

/// Produces fresh environment instances. Shared read-only across workers.
pub trait EnvFactory: Send + Sync {
    type Env: Environment;

    /// Build a new instance. `seed` is derived per rollout so that results do
    /// not depend on which worker ran the rollout.
    fn create(&self, seed: u64) -> Result<Self::Env, EnvError>;
}

impl<E, F> EnvFactory for F
where
    E: Environment,
    F: Fn(u64) -> Result<E, EnvError> + Send + Sync,
{
    type Env = E;

    fn create(&self, seed: u64) -> Result<E, EnvError> {
        self(seed)
    }
}

/// Observation type produced by a factory's environments.
pub type FactoryObservation<F> = <<F as EnvFactory>::Env as Environment>::Observation;
