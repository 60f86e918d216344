// src/rl/runner.rs
//
// Rollout runner: executes one candidate for one episode under the
// frame-skip / action-repeat protocol and returns an EvaluationResult.
//
// Per step t = 0, 1, ...:
// - the policy is queried only when t % frame_jump == 0, otherwise the last
//   decided action is repeated verbatim
// - total_score accumulates the reward; a new running maximum resets the
//   stall counter and records best_score_step = t
// - stop on done (Done), else t >= max_steps (MaxSteps), else
//   stall >= max_steps_without_progress (Stalled)
//
// Faults (error returns, non-finite rewards, panics) are contained: the
// result is marked Failed and carries the score accumulated so far.

use std::panic::{self, AssertUnwindSafe};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::EvoConfig;
use crate::error::RolloutFault;
use crate::population::{fitness, CandidateId};

use super::action::{Action, ActionLayout};
use super::encoder::ObservationEncoder;
use super::env::{EnvFactory, Environment, FactoryObservation};
use super::policy::Policy;

/// Multiplier separating per-generation seed streams.
const SEED_STREAM_STRIDE: u64 = 1_000_003;

/// Seed stream reserved for solved-verification trials.
pub const VERIFICATION_STREAM: u64 = u64::MAX;

/// Seed for one rollout, a pure function of (base, stream, index).
///
/// Training rollouts use stream = generation and index = candidate id, so a
/// result never depends on which worker ran it.
pub fn derive_seed(base_seed: u64, stream: u64, index: u64) -> u64 {
    base_seed
        .wrapping_add(stream.wrapping_mul(SEED_STREAM_STRIDE))
        .wrapping_add(index)
}

/// Episode termination reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TerminationReason {
    /// Environment reported done.
    Done,
    /// Step index reached max_steps.
    MaxSteps,
    /// No new best score for max_steps_without_progress steps.
    Stalled,
    /// Environment, encoder or policy fault.
    Failed,
}

/// Per-rollout limits, derived from EvoConfig.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RolloutLimits {
    pub frame_jump: u32,
    pub max_steps: u64,
    pub max_steps_without_progress: u64,
    /// Delay before the single retry of environment construction.
    pub env_retry_backoff: Duration,
}

impl Default for RolloutLimits {
    fn default() -> Self {
        Self::from(&EvoConfig::default())
    }
}

impl From<&EvoConfig> for RolloutLimits {
    fn from(cfg: &EvoConfig) -> Self {
        Self {
            frame_jump: cfg.frame_jump,
            max_steps: cfg.max_steps,
            max_steps_without_progress: cfg.max_steps_without_progress,
            env_retry_backoff: Duration::from_millis(cfg.env_retry_backoff_ms),
        }
    }
}

impl RolloutLimits {
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

    pub fn with_env_retry_backoff(mut self, backoff: Duration) -> Self {
        self.env_retry_backoff = backoff;
        self
    }
}

/// Outcome of one rollout.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationResult {
    pub candidate_id: CandidateId,
    /// Sum of rewards over the rollout (partial when Failed).
    pub total_score: f64,
    /// Step index at which the running maximum was last raised (0 if never).
    pub best_score_step: u64,
    pub termination_reason: TerminationReason,
    /// Steps executed: t + 1 on normal termination, completed steps on a fault.
    pub step_count: u64,
    /// Number of policy activations.
    pub policy_queries: u64,
    /// Set only when termination_reason is Failed.
    pub fault: Option<RolloutFault>,
}

impl EvaluationResult {
    pub fn fitness(&self) -> f64 {
        fitness(self.total_score, self.best_score_step)
    }

    pub fn is_failed(&self) -> bool {
        self.termination_reason == TerminationReason::Failed
    }

    /// True when the environment could not be constructed at all.
    pub fn is_environment_unavailable(&self) -> bool {
        self.fault
            .as_ref()
            .is_some_and(RolloutFault::is_environment_unavailable)
    }
}

/// Rollout bookkeeping kept outside the unwind boundary so a panic still
/// reports the partial score.
#[derive(Debug, Clone, Default)]
struct RolloutProgress {
    step: u64,
    steps_completed: u64,
    total_score: f64,
    best_score: f64,
    best_score_step: u64,
    stall: u64,
    policy_queries: u64,
}

impl RolloutProgress {
    fn into_result(
        self,
        candidate_id: CandidateId,
        termination_reason: TerminationReason,
        fault: Option<RolloutFault>,
    ) -> EvaluationResult {
        EvaluationResult {
            candidate_id,
            total_score: self.total_score,
            best_score_step: self.best_score_step,
            termination_reason,
            step_count: self.steps_completed,
            policy_queries: self.policy_queries,
            fault,
        }
    }
}

/// Executes rollouts against fresh environments from `factory`.
///
/// Shared by reference across worker threads; holds no per-rollout state.
pub struct RolloutRunner<F, E> {
    factory: F,
    encoder: E,
    layout: ActionLayout,
    limits: RolloutLimits,
}

impl<F, E> RolloutRunner<F, E>
where
    F: EnvFactory,
    E: ObservationEncoder<FactoryObservation<F>>,
{
    pub fn new(factory: F, encoder: E, limits: RolloutLimits) -> Self {
        Self {
            factory,
            encoder,
            layout: ActionLayout::default(),
            limits,
        }
    }

    pub fn with_layout(mut self, layout: ActionLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn limits(&self) -> &RolloutLimits {
        &self.limits
    }

    pub fn layout(&self) -> &ActionLayout {
        &self.layout
    }

    pub fn encoder(&self) -> &E {
        &self.encoder
    }

    /// Run one episode. Never panics and never returns an error: every
    /// fault is folded into a Failed result.
    pub fn evaluate<P>(&self, candidate_id: CandidateId, policy: &P, seed: u64) -> EvaluationResult
    where
        P: Policy + ?Sized,
    {
        let mut progress = RolloutProgress::default();

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            let mut env = self.create_env(candidate_id, seed)?;
            self.drive(&mut env, policy, &mut progress)
        }));

        let result = match outcome {
            Ok(Ok(reason)) => progress.into_result(candidate_id, reason, None),
            Ok(Err(fault)) => {
                debug!(candidate = %candidate_id, %fault, "rollout failed");
                progress.into_result(candidate_id, TerminationReason::Failed, Some(fault))
            }
            Err(payload) => {
                let fault = RolloutFault::Panicked {
                    step: progress.step,
                    message: panic_message(payload.as_ref()),
                };
                warn!(candidate = %candidate_id, %fault, "rollout panicked");
                progress.into_result(candidate_id, TerminationReason::Failed, Some(fault))
            }
        };

        debug!(
            candidate = %candidate_id,
            seed,
            total_score = result.total_score,
            best_score_step = result.best_score_step,
            steps = result.step_count,
            reason = ?result.termination_reason,
            "rollout finished"
        );
        result
    }

    /// Build a fresh environment, retrying once after the configured backoff.
    fn create_env(&self, candidate_id: CandidateId, seed: u64) -> Result<F::Env, RolloutFault> {
        match self.factory.create(seed) {
            Ok(env) => Ok(env),
            Err(first) => {
                warn!(
                    candidate = %candidate_id,
                    error = %first,
                    backoff_ms = self.limits.env_retry_backoff.as_millis() as u64,
                    "environment construction failed, retrying once"
                );
                thread::sleep(self.limits.env_retry_backoff);
                self.factory
                    .create(seed)
                    .map_err(|e| RolloutFault::EnvironmentUnavailable {
                        attempts: 2,
                        reason: e.to_string(),
                    })
            }
        }
    }

    fn drive<P>(
        &self,
        env: &mut F::Env,
        policy: &P,
        progress: &mut RolloutProgress,
    ) -> Result<TerminationReason, RolloutFault>
    where
        P: Policy + ?Sized,
    {
        let frame_jump = u64::from(self.limits.frame_jump.max(1));

        let mut observation = env.reset().map_err(|e| RolloutFault::Environment {
            step: 0,
            reason: e.to_string(),
        })?;
        let mut action = Action::released(self.layout.pad_size);

        let mut t: u64 = 0;
        loop {
            progress.step = t;

            if t % frame_jump == 0 {
                let latent = self
                    .encoder
                    .encode(&observation)
                    .map_err(|e| RolloutFault::Encoder {
                        step: t,
                        reason: e.to_string(),
                    })?;
                let logits = policy.activate(&latent).map_err(|e| RolloutFault::Policy {
                    step: t,
                    reason: e.to_string(),
                })?;
                progress.policy_queries += 1;
                action = self.layout.decode(&logits);
            }

            let outcome = env
                .step(&action)
                .map_err(|e| RolloutFault::Environment {
                    step: t,
                    reason: e.to_string(),
                })?;
            if !outcome.reward.is_finite() {
                return Err(RolloutFault::Diverged {
                    step: t,
                    reward: outcome.reward,
                });
            }

            progress.total_score += outcome.reward;
            progress.steps_completed = t + 1;
            if progress.total_score > progress.best_score {
                progress.best_score = progress.total_score;
                progress.best_score_step = t;
                progress.stall = 0;
            } else {
                progress.stall += 1;
            }
            observation = outcome.observation;

            if outcome.done {
                return Ok(TerminationReason::Done);
            }
            if t >= self.limits.max_steps {
                return Ok(TerminationReason::MaxSteps);
            }
            if progress.stall >= self.limits.max_steps_without_progress {
                return Ok(TerminationReason::Stalled);
            }
            t += 1;
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rl::encoder::{EncodeError, LatentVector};
    use crate::rl::env::{EnvError, StepOutcome};
    use crate::rl::policy::{ConstantPolicy, PolicyError};
    use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
    use std::sync::Arc;

    /// Replays a fixed reward script. Faults or panics at `fail_at` if set.
    #[derive(Clone)]
    struct ScriptedEnv {
        rewards: Vec<f64>,
        done_at: Option<u64>,
        fail_at: Option<u64>,
        panic_at: Option<u64>,
        t: u64,
    }

    impl Environment for ScriptedEnv {
        type Observation = u64;

        fn reset(&mut self) -> Result<u64, EnvError> {
            self.t = 0;
            Ok(0)
        }

        fn step(&mut self, _action: &Action) -> Result<StepOutcome<u64>, EnvError> {
            let t = self.t;
            if self.fail_at == Some(t) {
                return Err(EnvError::new("emulator crashed"));
            }
            if self.panic_at == Some(t) {
                panic!("emulator exploded at {t}");
            }
            self.t += 1;
            let reward = if self.rewards.is_empty() {
                0.0
            } else {
                self.rewards[(t as usize).min(self.rewards.len() - 1)]
            };
            Ok(StepOutcome {
                observation: self.t,
                reward,
                done: self.done_at == Some(t),
            })
        }
    }

    fn scripted(rewards: Vec<f64>) -> ScriptedEnv {
        ScriptedEnv {
            rewards,
            done_at: None,
            fail_at: None,
            panic_at: None,
            t: 0,
        }
    }

    struct UnitEncoder;

    impl ObservationEncoder<u64> for UnitEncoder {
        fn latent_dim(&self) -> usize {
            1
        }

        fn encode(&self, observation: &u64) -> Result<LatentVector, EncodeError> {
            Ok(vec![*observation as f32])
        }
    }

    /// Counts activations and records which latent values it saw.
    #[derive(Default)]
    struct CountingPolicy {
        calls: AtomicU64,
    }

    impl Policy for CountingPolicy {
        fn activate(&self, _latent: &[f32]) -> Result<Vec<f32>, PolicyError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![1.0, 0.0, 0.0, 0.0])
        }
    }

    fn runner_for(
        env: ScriptedEnv,
        limits: RolloutLimits,
    ) -> RolloutRunner<impl EnvFactory<Env = ScriptedEnv>, UnitEncoder> {
        let factory = move |_seed: u64| -> Result<ScriptedEnv, EnvError> { Ok(env.clone()) };
        RolloutRunner::new(factory, UnitEncoder, limits)
    }

    fn limits() -> RolloutLimits {
        RolloutLimits::default()
            .with_frame_jump(1)
            .with_max_steps(1_000)
            .with_max_steps_without_progress(1_000)
            .with_env_retry_backoff(Duration::ZERO)
    }

    #[test]
    fn test_frame_skip_scenario() {
        // F=4, reward 1.0 per step, done at step 9
        let env = ScriptedEnv {
            done_at: Some(9),
            ..scripted(vec![1.0])
        };
        let runner = runner_for(env, limits().with_frame_jump(4));
        let policy = CountingPolicy::default();

        let r = runner.evaluate(CandidateId(0), &policy, 0);
        assert_eq!(r.termination_reason, TerminationReason::Done);
        assert_eq!(r.total_score, 10.0);
        assert_eq!(r.best_score_step, 9);
        assert_eq!(r.fitness(), 1.0);
        assert_eq!(r.step_count, 10);
        assert_eq!(r.policy_queries, 3);
        assert_eq!(policy.calls.load(Ordering::SeqCst), 3);
        assert!(r.fault.is_none());
    }

    #[test]
    fn test_query_count_is_ceil_n_over_f() {
        for frame_jump in 1..=7u32 {
            for n in 1..=20u64 {
                let env = ScriptedEnv {
                    done_at: Some(n - 1),
                    ..scripted(vec![1.0])
                };
                let runner = runner_for(env, limits().with_frame_jump(frame_jump));
                let r = runner.evaluate(CandidateId(0), &ConstantPolicy::new(vec![]), 0);
                let f = u64::from(frame_jump);
                assert_eq!(r.step_count, n);
                assert_eq!(r.policy_queries, (n + f - 1) / f, "F={f} N={n}");
            }
        }
    }

    #[test]
    fn test_stall_scenario() {
        let runner = runner_for(
            scripted(vec![5.0, 0.0, 0.0, 0.0]),
            limits().with_max_steps_without_progress(2),
        );
        let r = runner.evaluate(CandidateId(1), &ConstantPolicy::new(vec![]), 0);
        assert_eq!(r.termination_reason, TerminationReason::Stalled);
        assert_eq!(r.step_count, 3);
        assert_eq!(r.total_score, 5.0);
        assert_eq!(r.best_score_step, 0);
        assert_eq!(r.fitness(), 5.0);
    }

    #[test]
    fn test_max_steps_bounds_rollout() {
        // Ever-increasing score: never stalls, never done
        let runner = runner_for(scripted(vec![1.0]), limits().with_max_steps(50));
        let r = runner.evaluate(CandidateId(0), &ConstantPolicy::new(vec![]), 0);
        assert_eq!(r.termination_reason, TerminationReason::MaxSteps);
        assert_eq!(r.step_count, 51);
        assert_eq!(r.best_score_step, 50);
    }

    #[test]
    fn test_termination_check_order() {
        let env = ScriptedEnv {
            done_at: Some(2),
            ..scripted(vec![0.0])
        };
        let runner = runner_for(
            env,
            limits().with_max_steps(2).with_max_steps_without_progress(1),
        );
        let r = runner.evaluate(CandidateId(0), &ConstantPolicy::new(vec![]), 0);
        // stall hits 1 at step 0 already
        assert_eq!(r.termination_reason, TerminationReason::Stalled);
        assert_eq!(r.step_count, 1);

        let env = ScriptedEnv {
            done_at: Some(2),
            ..scripted(vec![1.0])
        };
        let runner = runner_for(env, limits().with_max_steps(2));
        let r = runner.evaluate(CandidateId(0), &ConstantPolicy::new(vec![]), 0);
        assert_eq!(r.termination_reason, TerminationReason::Done);
        assert_eq!(r.step_count, 3);
    }

    #[test]
    fn test_negative_rewards_never_raise_best() {
        let runner = runner_for(
            scripted(vec![-1.0]),
            limits().with_max_steps_without_progress(4),
        );
        let r = runner.evaluate(CandidateId(0), &ConstantPolicy::new(vec![]), 0);
        assert_eq!(r.termination_reason, TerminationReason::Stalled);
        assert_eq!(r.best_score_step, 0);
        assert_eq!(r.total_score, -4.0);
        assert_eq!(r.fitness(), -4.0);
    }

    #[test]
    fn test_env_fault_keeps_partial_score() {
        let env = ScriptedEnv {
            fail_at: Some(3),
            ..scripted(vec![1.0, 1.0, 0.0])
        };
        let runner = runner_for(env, limits());
        let r = runner.evaluate(CandidateId(2), &ConstantPolicy::new(vec![]), 0);
        assert_eq!(r.termination_reason, TerminationReason::Failed);
        assert_eq!(r.total_score, 2.0);
        assert_eq!(r.step_count, 3);
        assert!(matches!(
            r.fault,
            Some(RolloutFault::Environment { step: 3, .. })
        ));
    }

    #[test]
    fn test_panic_is_contained() {
        let env = ScriptedEnv {
            panic_at: Some(3),
            ..scripted(vec![1.0, 1.0, 0.0])
        };
        let runner = runner_for(env, limits());
        let r = runner.evaluate(CandidateId(2), &ConstantPolicy::new(vec![]), 0);
        assert_eq!(r.termination_reason, TerminationReason::Failed);
        assert_eq!(r.total_score, 2.0);
        match r.fault {
            Some(RolloutFault::Panicked { step, message }) => {
                assert_eq!(step, 3);
                assert!(message.contains("exploded"));
            }
            other => panic!("unexpected fault {other:?}"),
        }
    }

    #[test]
    fn test_non_finite_reward_fails() {
        let runner = runner_for(scripted(vec![1.0, f64::NAN]), limits());
        let r = runner.evaluate(CandidateId(0), &ConstantPolicy::new(vec![]), 0);
        assert_eq!(r.termination_reason, TerminationReason::Failed);
        assert_eq!(r.total_score, 1.0);
        assert!(matches!(r.fault, Some(RolloutFault::Diverged { step: 1, .. })));
    }

    #[test]
    fn test_policy_fault_fails() {
        struct Broken;
        impl Policy for Broken {
            fn activate(&self, _latent: &[f32]) -> Result<Vec<f32>, PolicyError> {
                Err(PolicyError("shape mismatch".into()))
            }
        }
        let runner = runner_for(scripted(vec![1.0]), limits());
        let r = runner.evaluate(CandidateId(0), &Broken, 0);
        assert_eq!(r.termination_reason, TerminationReason::Failed);
        assert_eq!(r.step_count, 0);
        assert_eq!(r.total_score, 0.0);
    }

    #[test]
    fn test_env_construction_retried_once() {
        let attempts = Arc::new(AtomicU32::new(0));
        let seen = attempts.clone();
        let factory = move |_seed: u64| -> Result<ScriptedEnv, EnvError> {
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(EnvError::new("transient"))
            } else {
                Ok(ScriptedEnv {
                    done_at: Some(0),
                    ..scripted(vec![3.0])
                })
            }
        };
        let runner = RolloutRunner::new(factory, UnitEncoder, limits());
        let r = runner.evaluate(CandidateId(0), &ConstantPolicy::new(vec![]), 0);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(r.termination_reason, TerminationReason::Done);
        assert_eq!(r.total_score, 3.0);
    }

    #[test]
    fn test_env_unavailable_after_retry() {
        let factory =
            |_seed: u64| -> Result<ScriptedEnv, EnvError> { Err(EnvError::new("rom missing")) };
        let runner = RolloutRunner::new(factory, UnitEncoder, limits());
        let r = runner.evaluate(CandidateId(5), &ConstantPolicy::new(vec![]), 0);
        assert_eq!(r.termination_reason, TerminationReason::Failed);
        assert!(r.is_environment_unavailable());
        assert_eq!(r.step_count, 0);
    }

    #[test]
    fn test_action_is_repeated_between_decisions() {
        /// Rewards 1.0 only while button 0 is held.
        #[derive(Clone)]
        struct HoldEnv {
            t: u64,
        }
        impl Environment for HoldEnv {
            type Observation = u64;
            fn reset(&mut self) -> Result<u64, EnvError> {
                Ok(0)
            }
            fn step(&mut self, action: &Action) -> Result<StepOutcome<u64>, EnvError> {
                self.t += 1;
                Ok(StepOutcome {
                    observation: self.t,
                    reward: if action.is_pressed(0) { 1.0 } else { 0.0 },
                    done: self.t == 8,
                })
            }
        }
        /// Presses button 0 only when the observation index is 0.
        struct FirstOnly;
        impl Policy for FirstOnly {
            fn activate(&self, latent: &[f32]) -> Result<Vec<f32>, PolicyError> {
                Ok(vec![if latent[0] == 0.0 { 1.0 } else { -1.0 }])
            }
        }

        let factory = |_seed: u64| -> Result<HoldEnv, EnvError> { Ok(HoldEnv { t: 0 }) };
        let runner = RolloutRunner::new(factory, UnitEncoder, limits().with_frame_jump(4))
            .with_layout(ActionLayout::direct(1));
        let r = runner.evaluate(CandidateId(0), &FirstOnly, 0);
        // held for steps 0..4, released from the decision at step 4
        assert_eq!(r.total_score, 4.0);
        assert_eq!(r.best_score_step, 3);
        assert_eq!(r.policy_queries, 2);
    }

    #[test]
    fn test_derive_seed_is_stable() {
        assert_eq!(derive_seed(1, 0, 0), 1);
        assert_eq!(derive_seed(1, 2, 3), 1 + 2 * 1_000_003 + 3);
        assert_ne!(derive_seed(1, 0, 1), derive_seed(1, 1, 0));
        // wraps instead of overflowing
        let _ = derive_seed(u64::MAX, VERIFICATION_STREAM, u64::MAX);
    }

    #[test]
    fn test_limits_from_config() {
        let cfg = EvoConfig::default().with_frame_jump(2).with_max_steps(9);
        let l = RolloutLimits::from(&cfg);
        assert_eq!(l.frame_jump, 2);
        assert_eq!(l.max_steps, 9);
        assert_eq!(l.env_retry_backoff, Duration::from_millis(250));
    }
}
