// src/rl/encoder.rs
//
// Observation encoder interface.
//
// The learned encoder lives outside this crate; the scheduler only needs
// `encode(observation) -> latent vector` of a fixed dimension.

use thiserror::Error;

/// Fixed-size latent representation fed to policies.
pub type LatentVector = Vec<f32>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct EncodeError(pub String);

/// Maps raw observations to latent vectors. Shared read-only across workers.
pub trait ObservationEncoder<O>: Send + Sync {
    /// Dimension of every vector returned by `encode`.
    fn latent_dim(&self) -> usize;

    fn encode(&self, observation: &O) -> Result<LatentVector, EncodeError>;
}

/// Scales numeric observations into a fixed-width latent vector.
///
/// Each feature is multiplied by `scale` and clamped to [-clip, clip]. Short
/// observations are zero-padded, long ones truncated. Non-finite features
/// are rejected.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalingEncoder {
    latent_dim: usize,
    scale: f32,
    clip: f32,
}

impl ScalingEncoder {
    pub fn new(latent_dim: usize) -> Self {
        Self {
            latent_dim,
            scale: 1.0,
            clip: 1.0,
        }
    }

    pub fn with_scale(mut self, scale: f32) -> Self {
        self.scale = scale;
        self
    }

    pub fn with_clip(mut self, clip: f32) -> Self {
        self.clip = clip.abs();
        self
    }
}

impl ObservationEncoder<Vec<f32>> for ScalingEncoder {
    fn latent_dim(&self) -> usize {
        self.latent_dim
    }

    fn encode(&self, observation: &Vec<f32>) -> Result<LatentVector, EncodeError> {
        let mut latent = vec![0.0; self.latent_dim];
        for (slot, &x) in latent.iter_mut().zip(observation.iter()) {
            if !x.is_finite() {
                return Err(EncodeError(format!("non-finite feature {x}")));
            }
            *slot = (x * self.scale).clamp(-self.clip, self.clip);
        }
        Ok(latent)
    }
}
