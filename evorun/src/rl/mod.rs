// src/rl/mod.rs
//
// Rollout layer: everything needed to turn one candidate policy into one
// evaluation result.
//
// Key components:
// - Environment / EnvFactory: reset-step environment contract, one fresh
//   instance per rollout
// - ObservationEncoder: observation -> fixed-length latent vector
// - Policy: latent vector -> action logits
// - ActionLayout: logits -> pad button mask
// - RolloutRunner: the frame-skip rollout protocol with stall detection and
//   fault containment
// - CorridorEnv: built-in side-scrolling environment used by the binary

pub mod action;
pub mod corridor;
pub mod encoder;
pub mod env;
pub mod policy;
pub mod runner;

// Re-exports for convenience
pub use action::{controls, Action, ActionLayout, ActionLogits, PAD_BUTTONS};
pub use corridor::{CorridorConfig, CorridorEnv, CorridorFactory, CORRIDOR_OBS_DIM};
pub use encoder::{EncodeError, LatentVector, ObservationEncoder, ScalingEncoder};
pub use env::{EnvError, EnvFactory, Environment, FactoryObservation, StepOutcome};
pub use policy::{ConstantPolicy, LinearPolicy, Policy, PolicyError, LINEAR_POLICY_VERSION};
pub use runner::{
    derive_seed, EvaluationResult, RolloutLimits, RolloutRunner, TerminationReason,
    VERIFICATION_STREAM,
};
