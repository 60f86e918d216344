// src/rl/policy.rs
//
// Policy trait and reference implementations.
//
// A policy maps a latent vector to one logit per controllable button. The
// scheduler never looks inside a policy; it only calls `activate`.
//
// Design:
// - Policy trait: deterministic for fixed weights, shared read-only by workers
// - ConstantPolicy: fixed logits, used as a test stub
// - LinearPolicy: single dense layer with tanh, the reference evolvable policy

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::action::ActionLogits;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct PolicyError(pub String);

/// Policy trait: interface for all policy implementations.
pub trait Policy: Send + Sync {
    /// Version string for telemetry and winner files.
    fn version(&self) -> &str {
        "unversioned"
    }

    /// Compute action logits for a latent vector.
    ///
    /// Must be a pure function of the weights and the input.
    fn activate(&self, latent: &[f32]) -> Result<ActionLogits, PolicyError>;
}

impl<P: Policy + ?Sized> Policy for Box<P> {
    fn version(&self) -> &str {
        (**self).version()
    }

    fn activate(&self, latent: &[f32]) -> Result<ActionLogits, PolicyError> {
        (**self).activate(latent)
    }
}

/// Returns the same logits for every input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstantPolicy {
    pub logits: ActionLogits,
}

impl ConstantPolicy {
    pub fn new(logits: ActionLogits) -> Self {
        Self { logits }
    }
}

impl Policy for ConstantPolicy {
    fn version(&self) -> &str {
        "constant-v1"
    }

    fn activate(&self, _latent: &[f32]) -> Result<ActionLogits, PolicyError> {
        Ok(self.logits.clone())
    }
}

pub const LINEAR_POLICY_VERSION: &str = "linear-tanh-v1";

/// Dense layer `tanh(W x + b)`.
///
/// `weights` is row-major with `outputs` rows of `inputs` columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearPolicy {
    pub inputs: usize,
    pub outputs: usize,
    pub weights: Vec<f32>,
    pub bias: Vec<f32>,
}

impl LinearPolicy {
    pub fn zeros(inputs: usize, outputs: usize) -> Self {
        Self {
            inputs,
            outputs,
            weights: vec![0.0; inputs * outputs],
            bias: vec![0.0; outputs],
        }
    }

    /// Weights and biases drawn uniformly from [-scale, scale].
    pub fn random<R: Rng + ?Sized>(inputs: usize, outputs: usize, scale: f32, rng: &mut R) -> Self {
        let mut policy = Self::zeros(inputs, outputs);
        for w in policy.params_mut() {
            *w = rng.gen_range(-scale..=scale);
        }
        policy
    }

    pub fn num_params(&self) -> usize {
        self.weights.len() + self.bias.len()
    }

    /// All trainable parameters, weights first.
    pub fn params_mut(&mut self) -> impl Iterator<Item = &mut f32> {
        self.weights.iter_mut().chain(self.bias.iter_mut())
    }
}

impl Policy for LinearPolicy {
    fn version(&self) -> &str {
        LINEAR_POLICY_VERSION
    }

    fn activate(&self, latent: &[f32]) -> Result<ActionLogits, PolicyError> {
        if latent.len() != self.inputs {
            return Err(PolicyError(format!(
                "expected {} inputs, got {}",
                self.inputs,
                latent.len()
            )));
        }
        if self.weights.len() != self.inputs * self.outputs || self.bias.len() != self.outputs {
            return Err(PolicyError("weight shape does not match dimensions".into()));
        }

        let logits = (0..self.outputs)
            .map(|o| {
                let row = &self.weights[o * self.inputs..(o + 1) * self.inputs];
                let z: f32 = row.iter().zip(latent).map(|(w, x)| w * x).sum::<f32>();
                (z + self.bias[o]).tanh()
            })
            .collect();
        Ok(logits)
    }
}
