// src/history.rs
//
// Per-generation score and fitness histories.
//
// Both are append-only and strictly ordered by generation. Samples are built
// from unordered inputs through OnlineStats::from_unordered, so they depend
// only on the multiset of results.

use serde::{Deserialize, Serialize};

use crate::metrics::{trailing_window_average, OnlineStats};
use crate::rl::runner::EvaluationResult;

/// (min, mean, max) of total scores for one generation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreSample {
    pub generation: u64,
    pub min: f64,
    pub mean: f64,
    pub max: f64,
}

impl ScoreSample {
    /// Aggregate a generation's results. Pure function of the result multiset.
    pub fn from_results(generation: u64, results: &[EvaluationResult]) -> Self {
        let stats = OnlineStats::from_unordered(results.iter().map(|r| r.total_score));
        Self {
            generation,
            min: stats.min(),
            mean: stats.mean(),
            max: stats.max(),
        }
    }
}

/// Append-only sequence of score samples.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreHistory {
    samples: Vec<ScoreSample>,
}

impl ScoreHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a sample. Generations must strictly increase; out-of-order
    /// samples are refused and `false` is returned.
    pub fn push(&mut self, sample: ScoreSample) -> bool {
        if let Some(last) = self.samples.last() {
            if sample.generation <= last.generation {
                return false;
            }
        }
        self.samples.push(sample);
        true
    }

    pub fn samples(&self) -> &[ScoreSample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn last(&self) -> Option<&ScoreSample> {
        self.samples.last()
    }
}

/// Fitness statistics for one generation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FitnessSample {
    pub generation: u64,
    pub min: f64,
    pub mean: f64,
    pub max: f64,
    pub stddev: f64,
}

impl FitnessSample {
    pub fn from_fitness(generation: u64, fitness: &[f64]) -> Self {
        let stats = OnlineStats::from_unordered(fitness.iter().copied());
        Self {
            generation,
            min: stats.min(),
            mean: stats.mean(),
            max: stats.max(),
            stddev: stats.stddev_population(),
        }
    }
}

/// Append-only fitness statistics, used for the trailing-window report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FitnessHistory {
    samples: Vec<FitnessSample>,
}

impl FitnessHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, sample: FitnessSample) -> bool {
        if let Some(last) = self.samples.last() {
            if sample.generation <= last.generation {
                return false;
            }
        }
        self.samples.push(sample);
        true
    }

    pub fn samples(&self) -> &[FitnessSample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Average of mean fitness over the last `window` generations.
    pub fn trailing_mean(&self, window: usize) -> f64 {
        let means: Vec<f64> = self.samples.iter().map(|s| s.mean).collect();
        trailing_window_average(&means, window)
    }

    /// Average of min fitness over the last `window` generations.
    pub fn trailing_min(&self, window: usize) -> f64 {
        let mins: Vec<f64> = self.samples.iter().map(|s| s.min).collect();
        trailing_window_average(&mins, window)
    }
}
