// src/config.rs
//
// Scheduler configuration.
//
// Defaults reproduce the reference training run (60 fps game, controller at
// 15 fps, 4500-step episodes, 600 steps of patience). Every field can be
// overridden through an EVORUN_* environment variable; the CLI layers its
// own flags on top (CLI > env > default).

use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::thread;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{EvoError, Result};

pub const DEFAULT_FRAME_JUMP: u32 = 4;
pub const DEFAULT_MAX_STEPS: u64 = 4500;
pub const DEFAULT_MAX_STEPS_WITHOUT_PROGRESS: u64 = 600;
pub const DEFAULT_CHECKPOINT_EVERY_N_GENERATIONS: u64 = 10;
pub const DEFAULT_CHECKPOINT_EVERY_N_SECONDS: u64 = 900;
pub const DEFAULT_SOLVED_SCORE_THRESHOLD: f64 = 9000.0;
pub const DEFAULT_SOLVED_VERIFICATION_TRIALS: u32 = 100;
pub const DEFAULT_FITNESS_WINDOW: usize = 5;
pub const DEFAULT_ENV_RETRY_BACKOFF_MS: u64 = 250;
pub const DEFAULT_BASE_SEED: u64 = 1;

/// Configuration surface consumed by the scheduler and rollout runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvoConfig {
    /// Policy is queried every `frame_jump` environment steps (>= 1).
    pub frame_jump: u32,
    /// Rollout stops once the step index reaches this value.
    pub max_steps: u64,
    /// Rollout stops after this many consecutive steps without a new best score.
    pub max_steps_without_progress: u64,
    /// Number of rollout workers (>= 1).
    pub worker_count: usize,
    /// Checkpoint when this many generations have passed since the last one.
    /// `None` disables the generation trigger.
    pub checkpoint_every_n_generations: Option<u64>,
    /// Checkpoint when this many seconds have passed since the last one.
    /// `None` disables the time trigger.
    pub checkpoint_every_n_seconds: Option<u64>,
    /// Verification passes only if the running trial average never drops below this.
    pub solved_score_threshold: f64,
    /// Number of deterministic verification trials.
    pub solved_verification_trials: u32,
    /// Window for the trailing mean/min fitness report.
    pub fitness_window: usize,
    /// Delay before the single retry of a failed environment construction.
    pub env_retry_backoff_ms: u64,
    /// Base seed; per-rollout seeds are derived from it.
    pub base_seed: u64,
    /// Stop after this many generations (unbounded when `None`).
    pub max_generations: Option<u64>,
}

impl Default for EvoConfig {
    fn default() -> Self {
        Self {
            frame_jump: DEFAULT_FRAME_JUMP,
            max_steps: DEFAULT_MAX_STEPS,
            max_steps_without_progress: DEFAULT_MAX_STEPS_WITHOUT_PROGRESS,
            worker_count: default_worker_count(),
            checkpoint_every_n_generations: Some(DEFAULT_CHECKPOINT_EVERY_N_GENERATIONS),
            checkpoint_every_n_seconds: Some(DEFAULT_CHECKPOINT_EVERY_N_SECONDS),
            solved_score_threshold: DEFAULT_SOLVED_SCORE_THRESHOLD,
            solved_verification_trials: DEFAULT_SOLVED_VERIFICATION_TRIALS,
            fitness_window: DEFAULT_FITNESS_WINDOW,
            env_retry_backoff_ms: DEFAULT_ENV_RETRY_BACKOFF_MS,
            base_seed: DEFAULT_BASE_SEED,
            max_generations: None,
        }
    }
}

/// One worker per independently schedulable execution unit.
pub fn default_worker_count() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl EvoConfig {
    /// Defaults with environment overrides applied.
    ///
    /// Recognised variables:
    ///   - EVORUN_FRAME_JUMP                  (u32, >= 1)
    ///   - EVORUN_MAX_STEPS                   (u64)
    ///   - EVORUN_MAX_STEPS_WITHOUT_PROGRESS  (u64)
    ///   - EVORUN_WORKERS                     (usize, >= 1)
    ///   - EVORUN_CHECKPOINT_EVERY            (u64 generations, 0 disables)
    ///   - EVORUN_CHECKPOINT_SECONDS          (u64 seconds, 0 disables)
    ///   - EVORUN_SOLVED_THRESHOLD            (f64)
    ///   - EVORUN_SOLVED_TRIALS               (u32)
    ///   - EVORUN_FITNESS_WINDOW              (usize)
    ///   - EVORUN_ENV_RETRY_BACKOFF_MS        (u64)
    ///   - EVORUN_SEED                        (u64)
    ///   - EVORUN_MAX_GENERATIONS             (u64, 0 means unbounded)
    ///
    /// Any variable that fails to parse is ignored with a warning.
    pub fn from_env_or_default() -> Self {
        let mut cfg = Self::default();

        override_from_env("EVORUN_FRAME_JUMP", &mut cfg.frame_jump);
        override_from_env("EVORUN_MAX_STEPS", &mut cfg.max_steps);
        override_from_env(
            "EVORUN_MAX_STEPS_WITHOUT_PROGRESS",
            &mut cfg.max_steps_without_progress,
        );
        override_from_env("EVORUN_WORKERS", &mut cfg.worker_count);
        override_optional_from_env(
            "EVORUN_CHECKPOINT_EVERY",
            &mut cfg.checkpoint_every_n_generations,
        );
        override_optional_from_env(
            "EVORUN_CHECKPOINT_SECONDS",
            &mut cfg.checkpoint_every_n_seconds,
        );
        override_from_env("EVORUN_SOLVED_THRESHOLD", &mut cfg.solved_score_threshold);
        override_from_env("EVORUN_SOLVED_TRIALS", &mut cfg.solved_verification_trials);
        override_from_env("EVORUN_FITNESS_WINDOW", &mut cfg.fitness_window);
        override_from_env("EVORUN_ENV_RETRY_BACKOFF_MS", &mut cfg.env_retry_backoff_ms);
        override_from_env("EVORUN_SEED", &mut cfg.base_seed);
        override_optional_from_env("EVORUN_MAX_GENERATIONS", &mut cfg.max_generations);

        cfg
    }

    /// Reject values the scheduler cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.frame_jump == 0 {
            return Err(EvoError::InvalidConfig("frame_jump must be >= 1".into()));
        }
        if self.worker_count == 0 {
            return Err(EvoError::InvalidConfig("worker_count must be >= 1".into()));
        }
        if self.max_steps == 0 {
            return Err(EvoError::InvalidConfig("max_steps must be >= 1".into()));
        }
        if self.max_steps_without_progress == 0 {
            return Err(EvoError::InvalidConfig(
                "max_steps_without_progress must be >= 1".into(),
            ));
        }
        if self.solved_verification_trials == 0 {
            return Err(EvoError::InvalidConfig(
                "solved_verification_trials must be >= 1".into(),
            ));
        }
        if self.fitness_window == 0 {
            return Err(EvoError::InvalidConfig("fitness_window must be >= 1".into()));
        }
        if !self.solved_score_threshold.is_finite() {
            return Err(EvoError::InvalidConfig(
                "solved_score_threshold must be finite".into(),
            ));
        }
        Ok(())
    }

    pub fn with_frame_jump(mut self, frame_jump: u32) -> Self {
        self.frame_jump = frame_jump;
        self
    }

    pub fn with_max_steps(mut self, max_steps: u64) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_max_steps_without_progress(mut self, steps: u64) -> Self {
        self.max_steps_without_progress = steps;
        self
    }

    pub fn with_worker_count(mut self, workers: usize) -> Self {
        self.worker_count = workers;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.base_seed = seed;
        self
    }

    pub fn with_max_generations(mut self, generations: Option<u64>) -> Self {
        self.max_generations = generations;
        self
    }

    /// Log the effective configuration at startup.
    pub fn log_startup(&self) {
        info!(
            frame_jump = self.frame_jump,
            max_steps = self.max_steps,
            max_steps_without_progress = self.max_steps_without_progress,
            workers = self.worker_count,
            checkpoint_every = ?self.checkpoint_every_n_generations,
            checkpoint_seconds = ?self.checkpoint_every_n_seconds,
            solved_threshold = self.solved_score_threshold,
            solved_trials = self.solved_verification_trials,
            seed = self.base_seed,
            "effective configuration"
        );
    }
}

fn override_from_env<T>(name: &str, slot: &mut T)
where
    T: FromStr + Display,
{
    let Ok(raw) = env::var(name) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(v) => {
            info!("{name} = {v} (overrode default)");
            *slot = v;
        }
        Err(_) => {
            warn!("could not parse {name} = {raw:?}; keeping {slot}");
        }
    }
}

/// Like `override_from_env`, but `0` maps to `None`.
fn override_optional_from_env(name: &str, slot: &mut Option<u64>) {
    let Ok(raw) = env::var(name) else {
        return;
    };
    match raw.trim().parse::<u64>() {
        Ok(0) => {
            info!("{name} = 0 (disabled)");
            *slot = None;
        }
        Ok(v) => {
            info!("{name} = {v} (overrode default)");
            *slot = Some(v);
        }
        Err(_) => {
            warn!("could not parse {name} = {raw:?}; keeping {slot:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_reference_run() {
        let cfg = EvoConfig::default();
        assert_eq!(cfg.frame_jump, 4);
        assert_eq!(cfg.max_steps, 4500);
        assert_eq!(cfg.max_steps_without_progress, 600);
        assert_eq!(cfg.checkpoint_every_n_generations, Some(10));
        assert_eq!(cfg.checkpoint_every_n_seconds, Some(900));
        assert_eq!(cfg.solved_verification_trials, 100);
        assert_eq!(cfg.fitness_window, 5);
        assert!(cfg.worker_count >= 1);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_frame_jump() {
        let cfg = EvoConfig::default().with_frame_jump(0);
        assert!(matches!(cfg.validate(), Err(EvoError::InvalidConfig(_))));
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let cfg = EvoConfig::default().with_worker_count(0);
        assert!(matches!(cfg.validate(), Err(EvoError::InvalidConfig(_))));
    }

    #[test]
    fn test_validate_rejects_non_finite_threshold() {
        let cfg = EvoConfig {
            solved_score_threshold: f64::NAN,
            ..EvoConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_builder_chain() {
        let cfg = EvoConfig::default()
            .with_frame_jump(2)
            .with_max_steps(100)
            .with_max_steps_without_progress(10)
            .with_worker_count(3)
            .with_seed(9)
            .with_max_generations(Some(4));
        assert_eq!(cfg.frame_jump, 2);
        assert_eq!(cfg.max_steps, 100);
        assert_eq!(cfg.max_steps_without_progress, 10);
        assert_eq!(cfg.worker_count, 3);
        assert_eq!(cfg.base_seed, 9);
        assert_eq!(cfg.max_generations, Some(4));
    }

    #[test]
    fn test_config_serialization_roundtrip() {
        let cfg = EvoConfig::default().with_seed(77);
        let json = serde_json::to_string(&cfg).unwrap();
        let parsed: EvoConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg, parsed);
    }
}
