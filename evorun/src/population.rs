// src/population.rs
//
// Candidates and populations.
//
// A Candidate pairs a stable identifier with an opaque policy and the
// fitness assigned in the current generation. Identifiers survive breeding
// so lineage can be followed across generations.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{EvoError, Result};
use crate::rl::runner::{EvaluationResult, TerminationReason};

/// Stable candidate identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CandidateId(pub u64);

impl fmt::Display for CandidateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Selection score: total score minus the step at which the peak was reached.
///
/// Reaching the same score earlier is strictly better.
pub fn fitness(total_score: f64, best_score_step: u64) -> f64 {
    total_score - best_score_step as f64
}

/// Evaluation status within the current generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CandidateStatus {
    /// Not evaluated yet this generation.
    Pending,
    /// Rollout completed (done, max steps or stalled).
    Scored,
    /// Rollout faulted; fitness reflects the partial score.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate<P> {
    pub id: CandidateId,
    pub policy: P,
    pub fitness: Option<f64>,
    pub status: CandidateStatus,
}

impl<P> Candidate<P> {
    pub fn new(id: CandidateId, policy: P) -> Self {
        Self {
            id,
            policy,
            fitness: None,
            status: CandidateStatus::Pending,
        }
    }

    /// Record the outcome of this generation's rollout.
    pub fn apply_result(&mut self, result: &EvaluationResult) {
        self.fitness = Some(result.fitness());
        self.status = if result.termination_reason == TerminationReason::Failed {
            CandidateStatus::Failed
        } else {
            CandidateStatus::Scored
        };
    }

    /// Forget last generation's fitness (survivors carried into a new generation).
    pub fn reset_evaluation(&mut self) {
        self.fitness = None;
        self.status = CandidateStatus::Pending;
    }

    pub fn is_evaluated(&self) -> bool {
        self.status != CandidateStatus::Pending && self.fitness.is_some()
    }
}

/// Ordered candidates for one generation.
///
/// Deserialisation goes through [`Population::new`], so a decoded
/// population is never empty and never repeats an id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "PopulationRepr<P>")]
pub struct Population<P> {
    generation: u64,
    candidates: Vec<Candidate<P>>,
}

#[derive(Deserialize)]
struct PopulationRepr<P> {
    generation: u64,
    candidates: Vec<Candidate<P>>,
}

impl<P> TryFrom<PopulationRepr<P>> for Population<P> {
    type Error = EvoError;

    fn try_from(repr: PopulationRepr<P>) -> Result<Self> {
        Self::new(repr.generation, repr.candidates)
    }
}

impl<P> Population<P> {
    /// Build a population, rejecting empty or duplicate-id inputs.
    pub fn new(generation: u64, candidates: Vec<Candidate<P>>) -> Result<Self> {
        if candidates.is_empty() {
            return Err(EvoError::EmptyPopulation);
        }
        let mut seen = HashSet::with_capacity(candidates.len());
        for c in &candidates {
            if !seen.insert(c.id) {
                return Err(EvoError::DuplicateCandidate(c.id));
            }
        }
        Ok(Self {
            generation,
            candidates,
        })
    }

    /// Generation 0 from a list of policies, ids assigned 0..n.
    pub fn from_policies(policies: impl IntoIterator<Item = P>) -> Result<Self> {
        let candidates = policies
            .into_iter()
            .enumerate()
            .map(|(i, p)| Candidate::new(CandidateId(i as u64), p))
            .collect();
        Self::new(0, candidates)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn candidates(&self) -> &[Candidate<P>] {
        &self.candidates
    }

    pub fn candidates_mut(&mut self) -> &mut [Candidate<P>] {
        &mut self.candidates
    }

    pub fn into_candidates(self) -> Vec<Candidate<P>> {
        self.candidates
    }

    pub fn get(&self, id: CandidateId) -> Option<&Candidate<P>> {
        self.candidates.iter().find(|c| c.id == id)
    }

    /// True when every candidate carries a fitness or failure marker.
    pub fn is_fully_evaluated(&self) -> bool {
        self.candidates.iter().all(Candidate::is_evaluated)
    }

    /// Highest-fitness candidate; ties resolve to the lowest id.
    pub fn best(&self) -> Option<&Candidate<P>> {
        self.candidates
            .iter()
            .filter(|c| c.fitness.is_some())
            .max_by(|a, b| {
                let fa = a.fitness.unwrap_or(f64::NEG_INFINITY);
                let fb = b.fitness.unwrap_or(f64::NEG_INFINITY);
                fa.total_cmp(&fb).then_with(|| b.id.cmp(&a.id))
            })
    }

    pub fn fitness_values(&self) -> Vec<f64> {
        self.candidates.iter().filter_map(|c| c.fitness).collect()
    }

    pub fn failed_count(&self) -> usize {
        self.candidates
            .iter()
            .filter(|c| c.status == CandidateStatus::Failed)
            .count()
    }

    pub fn max_id(&self) -> Option<CandidateId> {
        self.candidates.iter().map(|c| c.id).max()
    }
}
