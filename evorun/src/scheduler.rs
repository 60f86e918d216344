// src/scheduler.rs
//
// Population scheduler: the generation loop.
//
// Per generation:
//   Dispatched      every candidate is submitted to the worker pool with a
//                   seed derived from (base_seed, generation, candidate id)
//   AwaitingResults the scheduler blocks at the barrier until every rollout
//                   has returned
//   Aggregated      results are matched to candidates by id, fitness is
//                   assigned and the score/fitness histories are extended
//   Checkpointed    (only when the cadence is due)
//   Bred            the evolution engine produces the next population
//
// Between Aggregated and Bred the best candidate seen so far is verified;
// a pass ends the run as Solved. Cancellation is observed only between
// generations: in-flight rollouts always finish.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::checkpoint::{Checkpoint, CheckpointCadence, CheckpointStore};
use crate::config::EvoConfig;
use crate::error::{EvoError, Result};
use crate::evolution::EvolutionEngine;
use crate::history::{FitnessHistory, FitnessSample, ScoreHistory, ScoreSample};
use crate::logging::{EventSink, GenerationRecord, NoopSink};
use crate::population::{Candidate, CandidateId, Population};
use crate::rl::encoder::ObservationEncoder;
use crate::rl::env::{EnvFactory, FactoryObservation};
use crate::rl::policy::Policy;
use crate::rl::runner::{derive_seed, EvaluationResult, RolloutLimits, RolloutRunner};
use crate::verify::{verify_solved, VerificationOutcome};

/// Cooperative cancellation flag, checked between generations.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Per-generation state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GenerationPhase {
    Dispatched,
    AwaitingResults,
    Aggregated,
    Checkpointed,
    Bred,
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Terminal {
    /// The best candidate passed verification.
    Solved,
    /// Cancellation was observed between generations.
    Interrupted,
    /// `max_generations` generations have been evaluated.
    GenerationLimit,
}

/// Result of one evaluated generation.
#[derive(Debug, Clone)]
pub struct GenerationReport {
    pub generation: u64,
    pub scores: ScoreSample,
    pub fitness: FitnessSample,
    /// One result per candidate, in population order.
    pub results: Vec<EvaluationResult>,
    pub failed: usize,
    pub eval_time: Duration,
}

/// Final state of a run.
#[derive(Debug, Clone)]
pub struct RunOutcome<P> {
    pub terminal: Terminal,
    /// Generations evaluated by this call to `run`.
    pub generations_evaluated: u64,
    /// Last generation that was fully scored, if any.
    pub last_generation: Option<u64>,
    pub best: Option<Candidate<P>>,
    /// Last verification performed (the passing one when Solved).
    pub verification: Option<VerificationOutcome>,
    pub score_history: ScoreHistory,
    pub fitness_history: FitnessHistory,
}

/// Drives generations through a fixed-size worker pool.
pub struct PopulationScheduler<P, F, E, S = NoopSink> {
    config: EvoConfig,
    runner: RolloutRunner<F, E>,
    pool: ThreadPool,
    sink: S,
    store: Option<Box<dyn CheckpointStore<P>>>,
    cadence: CheckpointCadence,
    score_history: ScoreHistory,
    fitness_history: FitnessHistory,
    best: Option<Candidate<P>>,
    phase: Option<GenerationPhase>,
}

impl<P, F, E> PopulationScheduler<P, F, E, NoopSink>
where
    P: Policy + Clone,
    F: EnvFactory,
    E: ObservationEncoder<FactoryObservation<F>>,
{
    /// Validate `config` and build the worker pool once for the whole run.
    pub fn new(config: EvoConfig, factory: F, encoder: E) -> Result<Self> {
        config.validate()?;
        let runner = RolloutRunner::new(factory, encoder, RolloutLimits::from(&config));
        Self::with_runner(config, runner)
    }

    pub fn with_runner(config: EvoConfig, runner: RolloutRunner<F, E>) -> Result<Self> {
        config.validate()?;
        let pool = ThreadPoolBuilder::new()
            .num_threads(config.worker_count)
            .thread_name(|i| format!("evorun-worker-{i}"))
            .build()
            .map_err(|e| EvoError::WorkerPool(e.to_string()))?;
        let cadence = CheckpointCadence::from_config(&config);

        info!(workers = config.worker_count, "worker pool ready");
        Ok(Self {
            config,
            runner,
            pool,
            sink: NoopSink,
            store: None,
            cadence,
            score_history: ScoreHistory::new(),
            fitness_history: FitnessHistory::new(),
            best: None,
            phase: None,
        })
    }
}

impl<P, F, E, S> PopulationScheduler<P, F, E, S>
where
    P: Policy + Clone,
    F: EnvFactory,
    E: ObservationEncoder<FactoryObservation<F>>,
    S: EventSink,
{
    /// Replace the telemetry sink.
    pub fn with_sink<S2: EventSink>(self, sink: S2) -> PopulationScheduler<P, F, E, S2> {
        PopulationScheduler {
            config: self.config,
            runner: self.runner,
            pool: self.pool,
            sink,
            store: self.store,
            cadence: self.cadence,
            score_history: self.score_history,
            fitness_history: self.fitness_history,
            best: self.best,
            phase: self.phase,
        }
    }

    pub fn with_checkpoint_store(mut self, store: Box<dyn CheckpointStore<P>>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(&self) -> &EvoConfig {
        &self.config
    }

    pub fn runner(&self) -> &RolloutRunner<F, E> {
        &self.runner
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn score_history(&self) -> &ScoreHistory {
        &self.score_history
    }

    pub fn fitness_history(&self) -> &FitnessHistory {
        &self.fitness_history
    }

    /// Best candidate across every generation evaluated so far.
    pub fn best(&self) -> Option<&Candidate<P>> {
        self.best.as_ref()
    }

    /// Phase of the current (or last) generation.
    pub fn phase(&self) -> Option<GenerationPhase> {
        self.phase
    }

    fn enter(&mut self, generation: u64, phase: GenerationPhase) {
        debug!(generation, ?phase, "generation phase");
        self.phase = Some(phase);
    }

    /// Evaluate every candidate of `population` and assign fitness.
    ///
    /// Rollout faults are folded into per-candidate results. The only error
    /// raised here is `NoEnvironment`, when not a single environment could be
    /// constructed for the generation.
    pub fn run_generation(&mut self, population: &mut Population<P>) -> Result<GenerationReport> {
        let generation = population.generation();
        let base_seed = self.config.base_seed;
        let started = Instant::now();

        self.enter(generation, GenerationPhase::Dispatched);
        info!(
            generation,
            candidates = population.len(),
            "dispatching generation"
        );

        self.enter(generation, GenerationPhase::AwaitingResults);
        let runner = &self.runner;
        let candidates = population.candidates();
        let results: Vec<EvaluationResult> = self.pool.install(|| {
            candidates
                .par_iter()
                .map(|c| runner.evaluate(c.id, &c.policy, derive_seed(base_seed, generation, c.id.0)))
                .collect()
        });
        let eval_time = started.elapsed();

        if results.iter().all(EvaluationResult::is_environment_unavailable) {
            return Err(EvoError::NoEnvironment {
                generation,
                candidates: results.len(),
            });
        }

        // Match by id, never by position
        let mut by_id: HashMap<CandidateId, EvaluationResult> =
            results.into_iter().map(|r| (r.candidate_id, r)).collect();
        let mut ordered = Vec::with_capacity(population.len());
        for candidate in population.candidates_mut() {
            let result = by_id
                .remove(&candidate.id)
                .ok_or(EvoError::MissingResult(candidate.id))?;
            candidate.apply_result(&result);
            ordered.push(result);
        }

        let scores = ScoreSample::from_results(generation, &ordered);
        let fitness = FitnessSample::from_fitness(generation, &population.fitness_values());
        if !self.score_history.push(scores) || !self.fitness_history.push(fitness) {
            warn!(generation, "generation not after last recorded one; history unchanged");
        }
        self.enter(generation, GenerationPhase::Aggregated);

        if let Some(gen_best) = population.best() {
            let improved = match (&self.best, gen_best.fitness) {
                (None, Some(_)) => true,
                (Some(best), Some(f)) => f > best.fitness.unwrap_or(f64::NEG_INFINITY),
                _ => false,
            };
            if improved {
                self.best = Some(gen_best.clone());
            }
        }

        let failed = population.failed_count();
        info!(
            generation,
            min = scores.min,
            mean = scores.mean,
            max = scores.max,
            failed,
            eval_ms = eval_time.as_millis() as u64,
            "generation scored"
        );

        Ok(GenerationReport {
            generation,
            scores,
            fitness,
            results: ordered,
            failed,
            eval_time,
        })
    }

    /// Re-run the best candidate seen so far for the configured trials.
    pub fn verify_best(&mut self) -> Option<VerificationOutcome> {
        let best = self.best.as_ref()?;
        let outcome = verify_solved(
            &self.runner,
            best.id,
            &best.policy,
            self.config.solved_verification_trials,
            self.config.solved_score_threshold,
            self.config.base_seed,
        );
        self.sink.log_verification(&outcome);
        Some(outcome)
    }

    /// Restore histories, best-so-far and engine state from a checkpoint,
    /// then breed the stored generation. The returned population is the
    /// one to hand to `run`.
    pub fn resume(
        &mut self,
        checkpoint: Checkpoint<P>,
        engine: &mut dyn EvolutionEngine<P>,
    ) -> Result<Population<P>> {
        let generation = checkpoint.generation;
        if !checkpoint.population.is_fully_evaluated() {
            return Err(EvoError::CheckpointCorrupt {
                path: Default::default(),
                reason: format!("generation {generation} is not fully scored"),
            });
        }

        engine.restore_state(checkpoint.engine_state)?;
        self.score_history = checkpoint.score_history;
        self.fitness_history = checkpoint.fitness_history;
        self.best = checkpoint.best;
        self.cadence = CheckpointCadence::from_config(&self.config).with_last_generation(generation);

        let next = engine.breed(&checkpoint.population)?;
        info!(
            from_generation = generation,
            next_generation = next.generation(),
            "resumed from checkpoint"
        );
        Ok(next)
    }

    /// Run generations until solved, interrupted or the generation limit.
    pub fn run(
        &mut self,
        initial: Population<P>,
        engine: &mut dyn EvolutionEngine<P>,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome<P>> {
        let mut population = initial;
        let mut generations_evaluated = 0u64;
        let mut last_generation = None;
        let mut verification = None;

        let terminal = loop {
            if cancel.is_cancelled() {
                break Terminal::Interrupted;
            }
            if let Some(max) = self.config.max_generations {
                if population.generation() >= max {
                    break Terminal::GenerationLimit;
                }
            }

            let report = self.run_generation(&mut population)?;
            generations_evaluated += 1;
            last_generation = Some(report.generation);

            let window = self.config.fitness_window;
            let trailing_mean = self.fitness_history.trailing_mean(window);
            let trailing_min = self.fitness_history.trailing_min(window);
            info!(
                generation = report.generation,
                window,
                trailing_mean,
                "average mean fitness over last {window} generations: {trailing_mean}"
            );
            info!(
                generation = report.generation,
                window,
                trailing_min,
                "average min fitness over last {window} generations: {trailing_min}"
            );

            let checkpointed = self.maybe_checkpoint(&population, engine, false);

            self.sink.log_generation(&GenerationRecord {
                generation: report.generation,
                candidates: population.len(),
                failed: report.failed,
                scores: report.scores,
                fitness: report.fitness,
                trailing_mean_fitness: trailing_mean,
                trailing_min_fitness: trailing_min,
                best_candidate: self.best.as_ref().map(|c| c.id),
                best_fitness: self.best.as_ref().and_then(|c| c.fitness),
                eval_ms: report.eval_time.as_millis() as u64,
                checkpointed,
            });

            verification = self.verify_best();
            if verification.as_ref().is_some_and(|v| v.solved) {
                info!(generation = report.generation, "solved");
                break Terminal::Solved;
            }

            if cancel.is_cancelled() {
                if !checkpointed {
                    self.maybe_checkpoint(&population, engine, true);
                }
                break Terminal::Interrupted;
            }

            population = engine.breed(&population)?;
            self.enter(report.generation, GenerationPhase::Bred);
        };

        self.sink.flush();
        info!(?terminal, generations_evaluated, "run finished");
        Ok(RunOutcome {
            terminal,
            generations_evaluated,
            last_generation,
            best: self.best.clone(),
            verification,
            score_history: self.score_history.clone(),
            fitness_history: self.fitness_history.clone(),
        })
    }

    /// Save a checkpoint of the scored `population` when the cadence is due
    /// (or `force`). A failed write is logged, the run continues in memory
    /// and the cadence is left due, so the next generation tries again.
    fn maybe_checkpoint(
        &mut self,
        population: &Population<P>,
        engine: &dyn EvolutionEngine<P>,
        force: bool,
    ) -> bool {
        let Some(store) = self.store.as_ref() else {
            return false;
        };
        let generation = population.generation();
        let now = Instant::now();
        if !force && !self.cadence.is_due(generation, now) {
            return false;
        }

        let engine_state = match engine.snapshot_state() {
            Ok(state) => state,
            Err(e) => {
                warn!(generation, error = %e, "engine state snapshot failed; checkpoint skipped");
                self.cadence.mark(generation, now);
                return false;
            }
        };
        let checkpoint = Checkpoint {
            generation,
            population: population.clone(),
            score_history: self.score_history.clone(),
            fitness_history: self.fitness_history.clone(),
            best: self.best.clone(),
            engine_state,
            timestamp_ms: unix_millis(),
        };

        match store.save(&checkpoint) {
            Ok(_) => {
                self.cadence.mark(generation, now);
                self.enter(generation, GenerationPhase::Checkpointed);
                true
            }
            Err(e) => {
                // cadence stays due: the next generation retries
                warn!(generation, error = %e, "checkpoint write failed; continuing in memory");
                false
            }
        }
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::population::CandidateStatus;
    use crate::rl::action::Action;
    use crate::rl::encoder::{EncodeError, LatentVector};
    use crate::rl::env::{EnvError, Environment, StepOutcome};
    use crate::rl::policy::PolicyError;
    use crate::rl::runner::TerminationReason;

    /// Policy whose "skill" is the reward it earns per step.
    #[derive(Debug, Clone, PartialEq)]
    struct Skill(f32);

    impl Policy for Skill {
        fn activate(&self, _latent: &[f32]) -> std::result::Result<Vec<f32>, PolicyError> {
            Ok(vec![self.0])
        }
    }

    /// Pays the first logit as reward each step; faults at step 3 when the
    /// logit is negative.
    struct SkillEnv {
        t: u64,
        pay: f64,
    }

    impl Environment for SkillEnv {
        type Observation = ();
        fn reset(&mut self) -> std::result::Result<(), EnvError> {
            Ok(())
        }
        fn step(&mut self, _a: &Action) -> std::result::Result<StepOutcome<()>, EnvError> {
            if self.pay < 0.0 && self.t == 3 {
                return Err(EnvError::new("boom"));
            }
            self.t += 1;
            Ok(StepOutcome {
                observation: (),
                reward: self.pay.abs(),
                done: self.t == 10,
            })
        }
    }

    struct NoEncoder;
    impl ObservationEncoder<()> for NoEncoder {
        fn latent_dim(&self) -> usize {
            0
        }
        fn encode(&self, _o: &()) -> std::result::Result<LatentVector, EncodeError> {
            Ok(vec![])
        }
    }

    /// Evaluate policies directly: the reward comes from a side table keyed
    /// by seed, so each candidate gets its own environment.
    fn scheduler(
        workers: usize,
        pays: Vec<f64>,
    ) -> PopulationScheduler<Skill, impl EnvFactory<Env = SkillEnv>, NoEncoder> {
        let cfg = EvoConfig::default()
            .with_worker_count(workers)
            .with_max_steps(100)
            .with_max_steps_without_progress(100)
            .with_frame_jump(1);
        let base = cfg.base_seed;
        let factory = move |seed: u64| -> std::result::Result<SkillEnv, EnvError> {
            let id = seed.wrapping_sub(base) % 1_000_003;
            Ok(SkillEnv {
                t: 0,
                pay: pays[id as usize],
            })
        };
        PopulationScheduler::new(cfg, factory, NoEncoder).unwrap()
    }

    #[test]
    fn test_run_generation_assigns_fitness_by_id() {
        let pays = vec![1.0, 2.0, -1.0];
        let mut s = scheduler(2, pays);
        let mut pop = Population::from_policies(vec![Skill(0.0), Skill(0.0), Skill(0.0)]).unwrap();

        let report = s.run_generation(&mut pop).unwrap();
        assert_eq!(s.phase(), Some(GenerationPhase::Aggregated));
        assert!(pop.is_fully_evaluated());

        // candidate 0: 10 steps x 1.0, best at step 9
        assert_eq!(report.results[0].total_score, 10.0);
        assert_eq!(pop.candidates()[0].fitness, Some(1.0));
        assert_eq!(pop.candidates()[1].fitness, Some(11.0));
        // candidate 2 faults at step 3 with 3.0 accumulated
        assert_eq!(report.results[2].termination_reason, TerminationReason::Failed);
        assert_eq!(report.results[2].total_score, 3.0);
        assert_eq!(pop.candidates()[2].status, CandidateStatus::Failed);
        assert_eq!(report.failed, 1);

        // aggregate includes the failed candidate
        assert_eq!(report.scores.min, 3.0);
        assert_eq!(report.scores.max, 20.0);
        assert_eq!(s.score_history().len(), 1);
        assert_eq!(s.best().map(|c| c.id), Some(CandidateId(1)));
    }

    #[test]
    fn test_all_environments_unavailable_is_systemic() {
        let cfg = EvoConfig {
            env_retry_backoff_ms: 0,
            ..EvoConfig::default().with_worker_count(2)
        };
        let factory =
            |_seed: u64| -> std::result::Result<SkillEnv, EnvError> { Err(EnvError::new("no rom")) };
        let mut s: PopulationScheduler<Skill, _, _> =
            PopulationScheduler::new(cfg, factory, NoEncoder).unwrap();
        let mut pop = Population::from_policies(vec![Skill(1.0), Skill(1.0)]).unwrap();
        assert!(matches!(
            s.run_generation(&mut pop),
            Err(EvoError::NoEnvironment {
                generation: 0,
                candidates: 2
            })
        ));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let cfg = EvoConfig::default().with_worker_count(0);
        let factory =
            |_seed: u64| -> std::result::Result<SkillEnv, EnvError> { Err(EnvError::new("unused")) };
        let res: Result<PopulationScheduler<Skill, _, _>> =
            PopulationScheduler::new(cfg, factory, NoEncoder);
        assert!(matches!(res, Err(EvoError::InvalidConfig(_))));
    }

    #[test]
    fn test_cancellation_token() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!token.is_cancelled());
        clone.cancel();
        assert!(token.is_cancelled());
    }
}
