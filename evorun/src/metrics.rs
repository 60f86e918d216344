// src/metrics.rs
//
// Small online statistics helpers used by generation aggregation and
// solved verification.
// - OnlineStats: Welford running mean/variance + min/max.
// - RunningAverage: cumulative mean of a trial sequence.
// - trailing_window_average: sum of the last `window` values divided by `window`.
//
// Aggregation feeds values in sorted order so the result depends only on
// the multiset of inputs, never on arrival order.

#[derive(Debug, Clone, Copy)]
pub struct OnlineStats {
    n: u64,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
}

impl Default for OnlineStats {
    fn default() -> Self {
        Self {
            n: 0,
            mean: 0.0,
            m2: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }
}

impl OnlineStats {
    /// Build stats from an unordered sample. Values are sorted first so the
    /// floating-point reduction is identical for every permutation.
    pub fn from_unordered(values: impl IntoIterator<Item = f64>) -> Self {
        let mut sorted: Vec<f64> = values.into_iter().filter(|x| x.is_finite()).collect();
        sorted.sort_by(f64::total_cmp);

        let mut stats = Self::default();
        for x in sorted {
            stats.add(x);
        }
        stats
    }

    /// Adds a sample if finite. Non-finite samples are ignored.
    pub fn add(&mut self, x: f64) {
        if !x.is_finite() {
            return;
        }

        self.n += 1;
        self.min = self.min.min(x);
        self.max = self.max.max(x);

        // Welford online variance.
        let delta = x - self.mean;
        self.mean += delta / (self.n as f64);
        let delta2 = x - self.mean;
        self.m2 += delta * delta2;
    }

    pub fn n(&self) -> u64 {
        self.n
    }

    pub fn mean(&self) -> f64 {
        if self.n == 0 {
            0.0
        } else {
            self.mean
        }
    }

    pub fn min(&self) -> f64 {
        if self.n == 0 {
            0.0
        } else {
            self.min
        }
    }

    pub fn max(&self) -> f64 {
        if self.n == 0 {
            0.0
        } else {
            self.max
        }
    }

    /// Population variance (divide by n).
    pub fn variance_population(&self) -> f64 {
        if self.n == 0 {
            0.0
        } else {
            self.m2 / (self.n as f64)
        }
    }

    pub fn stddev_population(&self) -> f64 {
        self.variance_population().sqrt()
    }
}

/// Cumulative mean over a sequence of trial scores.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunningAverage {
    n: u64,
    sum: f64,
}

impl RunningAverage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a score and return the updated average.
    pub fn push(&mut self, x: f64) -> f64 {
        self.n += 1;
        self.sum += x;
        self.value()
    }

    pub fn count(&self) -> u64 {
        self.n
    }

    pub fn value(&self) -> f64 {
        if self.n == 0 {
            0.0
        } else {
            self.sum / (self.n as f64)
        }
    }
}

/// Average of the last `window` values, always divided by `window`.
///
/// With fewer than `window` values the missing slots count as zero, so early
/// generations report a diluted average.
pub fn trailing_window_average(values: &[f64], window: usize) -> f64 {
    if window == 0 {
        return 0.0;
    }
    let start = values.len().saturating_sub(window);
    let sum: f64 = values[start..].iter().sum();
    sum / (window as f64)
}
