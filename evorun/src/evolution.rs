// src/evolution.rs
//
// Evolution engine interface and a reference truncation-selection engine.
//
// - EvolutionEngine: breed(scored population) -> next population, plus an
//   opaque state snapshot so a resumed run continues the same RNG stream
// - Genome: policies that can be perturbed in place
// - MutationEngine: elitism + uniform weight perturbation
//
// Survivors keep their ids; children get fresh ids above every id seen so far.

use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{EvoError, Result};
use crate::population::{Candidate, CandidateId, Population};
use crate::rl::policy::LinearPolicy;

/// Breeds the next generation from a fully scored one.
pub trait EvolutionEngine<P> {
    /// `scored` has a fitness or failure marker on every candidate. The
    /// returned population must carry generation `scored.generation() + 1`.
    fn breed(&mut self, scored: &Population<P>) -> Result<Population<P>>;

    /// Opaque state persisted in checkpoints.
    fn snapshot_state(&self) -> Result<serde_json::Value> {
        Ok(serde_json::Value::Null)
    }

    fn restore_state(&mut self, _state: serde_json::Value) -> Result<()> {
        Ok(())
    }
}

/// Policy whose parameters can be mutated.
pub trait Genome: Clone {
    /// Perturb each parameter with probability `rate` by a uniform draw
    /// from [-power, power].
    fn perturb(&mut self, rng: &mut ChaCha8Rng, rate: f64, power: f32);
}

impl Genome for LinearPolicy {
    fn perturb(&mut self, rng: &mut ChaCha8Rng, rate: f64, power: f32) {
        for w in self.params_mut() {
            if rng.gen_bool(rate) {
                *w += rng.gen_range(-power..=power);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationConfig {
    /// Size of every bred population.
    pub population_size: usize,
    /// Top candidates carried over unchanged.
    pub elite_count: usize,
    /// Fraction of the ranked population eligible as parents.
    pub survival_fraction: f64,
    /// Per-parameter mutation probability.
    pub mutation_rate: f64,
    /// Maximum absolute change of a mutated parameter.
    pub mutation_power: f32,
}

impl Default for MutationConfig {
    fn default() -> Self {
        Self {
            population_size: 50,
            elite_count: 2,
            survival_fraction: 0.2,
            mutation_rate: 0.5,
            mutation_power: 0.5,
        }
    }
}

impl MutationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.population_size == 0 {
            return Err(EvoError::InvalidConfig("population_size must be >= 1".into()));
        }
        if self.elite_count > self.population_size {
            return Err(EvoError::InvalidConfig(
                "elite_count cannot exceed population_size".into(),
            ));
        }
        if !(self.survival_fraction > 0.0 && self.survival_fraction <= 1.0) {
            return Err(EvoError::InvalidConfig(
                "survival_fraction must be in (0, 1]".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.mutation_rate) {
            return Err(EvoError::InvalidConfig(
                "mutation_rate must be in [0, 1]".into(),
            ));
        }
        if !(self.mutation_power.is_finite() && self.mutation_power >= 0.0) {
            return Err(EvoError::InvalidConfig(
                "mutation_power must be finite and >= 0".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct MutationState {
    rng: ChaCha8Rng,
    next_id: u64,
}

/// Truncation selection with elitism.
pub struct MutationEngine {
    config: MutationConfig,
    rng: ChaCha8Rng,
    next_id: u64,
}

impl MutationEngine {
    pub fn new(config: MutationConfig, seed: u64) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            rng: ChaCha8Rng::seed_from_u64(seed),
            next_id: 0,
        })
    }

    pub fn config(&self) -> &MutationConfig {
        &self.config
    }

    /// Generation 0, built from `make` with ids 0..population_size.
    pub fn seed_population<P, M>(&mut self, mut make: M) -> Result<Population<P>>
    where
        M: FnMut(&mut ChaCha8Rng) -> P,
    {
        let candidates = (0..self.config.population_size)
            .map(|_| {
                let id = self.allocate_id();
                Candidate::new(id, make(&mut self.rng))
            })
            .collect();
        Population::new(0, candidates)
    }

    /// RNG stream and id counter, for checkpoints.
    pub fn snapshot_state(&self) -> Result<serde_json::Value> {
        let state = MutationState {
            rng: self.rng.clone(),
            next_id: self.next_id,
        };
        Ok(serde_json::to_value(state)?)
    }

    /// Inverse of `snapshot_state`. `Null` leaves the engine untouched.
    pub fn restore_state(&mut self, state: serde_json::Value) -> Result<()> {
        if state.is_null() {
            return Ok(());
        }
        let state: MutationState = serde_json::from_value(state)?;
        self.rng = state.rng;
        self.next_id = state.next_id;
        Ok(())
    }

    fn allocate_id(&mut self) -> CandidateId {
        let id = CandidateId(self.next_id);
        self.next_id += 1;
        id
    }
}

impl<P: Genome> EvolutionEngine<P> for MutationEngine {
    fn breed(&mut self, scored: &Population<P>) -> Result<Population<P>> {
        if !scored.is_fully_evaluated() {
            return Err(EvoError::EvolutionEngine(format!(
                "generation {} has unevaluated candidates",
                scored.generation()
            )));
        }
        if let Some(max) = scored.max_id() {
            self.next_id = self.next_id.max(max.0 + 1);
        }

        // Best first; ties broken by id for a stable order
        let mut ranked: Vec<&Candidate<P>> = scored.candidates().iter().collect();
        ranked.sort_by(|a, b| {
            let fa = a.fitness.unwrap_or(f64::NEG_INFINITY);
            let fb = b.fitness.unwrap_or(f64::NEG_INFINITY);
            fb.total_cmp(&fa).then_with(|| a.id.cmp(&b.id))
        });

        let size = self.config.population_size;
        let mut next: Vec<Candidate<P>> = Vec::with_capacity(size);

        for elite in ranked.iter().take(self.config.elite_count.min(size)) {
            next.push(Candidate::new(elite.id, elite.policy.clone()));
        }

        let pool_len = ((ranked.len() as f64 * self.config.survival_fraction).ceil() as usize)
            .clamp(1, ranked.len());
        let parents = &ranked[..pool_len];

        while next.len() < size {
            let parent = parents
                .choose(&mut self.rng)
                .ok_or_else(|| EvoError::EvolutionEngine("no parents available".into()))?;
            let mut policy = parent.policy.clone();
            policy.perturb(
                &mut self.rng,
                self.config.mutation_rate,
                self.config.mutation_power,
            );
            let id = self.allocate_id();
            next.push(Candidate::new(id, policy));
        }

        debug!(
            generation = scored.generation() + 1,
            elites = self.config.elite_count.min(size),
            parents = pool_len,
            "bred next generation"
        );
        Population::new(scored.generation() + 1, next)
    }

    fn snapshot_state(&self) -> Result<serde_json::Value> {
        MutationEngine::snapshot_state(self)
    }

    fn restore_state(&mut self, state: serde_json::Value) -> Result<()> {
        MutationEngine::restore_state(self, state)
    }
}
