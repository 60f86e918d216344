// src/rl/corridor.rs
//
// Side-scrolling corridor environment.
//
// A small stand-in for the game the scheduler was built around: run right,
// jump over pits, reach the goal. Reward is forward progress past the
// furthest point reached so far, so the running score never decreases and
// stalls when the agent stops advancing.
//
// - CorridorEnv: Gym-style reset/step over the default 12-button pad
// - CorridorFactory: EnvFactory building one fresh env per rollout seed
//
// The level layout (pit positions) comes from `level_seed` and is shared by
// every rollout; the per-rollout seed only drives velocity noise.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use super::action::{Action, ActionLayout};
use super::env::{EnvError, EnvFactory, Environment, StepOutcome};

/// Length of the observation vector.
pub const CORRIDOR_OBS_DIM: usize = 6;

/// Pits are never placed this close to the start.
const SAFE_START: f64 = 20.0;
/// Distance at which the next pit is considered "far" in observations.
const PIT_SIGHT: f64 = 50.0;

const ACCEL: f64 = 0.5;
const FRICTION: f64 = 0.9;
const GRAVITY: f64 = 0.5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorridorConfig {
    /// Goal distance.
    pub length: f64,
    /// Number of pits in the level.
    pub pit_count: usize,
    /// Width of every pit.
    pub pit_width: f64,
    /// Top horizontal speed.
    pub max_speed: f64,
    /// Initial upward velocity of a jump.
    pub jump_velocity: f64,
    /// Uniform velocity noise amplitude per step.
    pub noise: f64,
    /// Seed for the level layout.
    pub level_seed: u64,
}

impl Default for CorridorConfig {
    fn default() -> Self {
        Self {
            length: 9600.0,
            pit_count: 40,
            pit_width: 3.0,
            max_speed: 4.0,
            jump_velocity: 3.0,
            noise: 0.05,
            level_seed: 7,
        }
    }
}

impl CorridorConfig {
    /// Short level without noise (for tests).
    pub fn deterministic() -> Self {
        Self {
            length: 200.0,
            pit_count: 3,
            noise: 0.0,
            ..Self::default()
        }
    }

    /// Flat level without pits or noise.
    pub fn flat(length: f64) -> Self {
        Self {
            length,
            pit_count: 0,
            noise: 0.0,
            ..Self::default()
        }
    }

    fn validate(&self) -> Result<(), EnvError> {
        if !(self.length.is_finite() && self.length > SAFE_START + 10.0) {
            return Err(EnvError::new(format!(
                "corridor length must exceed {}",
                SAFE_START + 10.0
            )));
        }
        let positive = |v: f64| v.is_finite() && v > 0.0;
        if !(positive(self.pit_width) && positive(self.max_speed)) {
            return Err(EnvError::new("pit_width and max_speed must be positive and finite"));
        }
        Ok(())
    }

    /// Sorted pit start positions for this level.
    fn layout_pits(&self) -> Vec<f64> {
        let mut rng = ChaCha8Rng::seed_from_u64(self.level_seed);
        let hi = self.length - 10.0;
        let mut pits: Vec<f64> = (0..self.pit_count)
            .map(|_| rng.gen_range(SAFE_START..hi))
            .collect();
        pits.sort_by(f64::total_cmp);
        pits
    }
}

/// Gym-style corridor environment.
pub struct CorridorEnv {
    config: CorridorConfig,
    layout: ActionLayout,
    pits: Vec<f64>,
    rng: ChaCha8Rng,
    seed: u64,
    x: f64,
    vx: f64,
    y: f64,
    vy: f64,
    furthest: f64,
    tick: u64,
    done: bool,
}

impl CorridorEnv {
    pub fn new(config: CorridorConfig, seed: u64) -> Result<Self, EnvError> {
        config.validate()?;
        let pits = config.layout_pits();
        Ok(Self {
            config,
            layout: ActionLayout::default(),
            pits,
            rng: ChaCha8Rng::seed_from_u64(seed),
            seed,
            x: 0.0,
            vx: 0.0,
            y: 0.0,
            vy: 0.0,
            furthest: 0.0,
            tick: 0,
            done: false,
        })
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn position(&self) -> f64 {
        self.x
    }

    pub fn pits(&self) -> &[f64] {
        &self.pits
    }

    fn in_pit(&self, x: f64) -> bool {
        self.pits
            .iter()
            .any(|&p| x >= p && x < p + self.config.pit_width)
    }

    fn next_pit_distance(&self) -> f64 {
        self.pits
            .iter()
            .find(|&&p| p + self.config.pit_width > self.x)
            .map(|&p| (p - self.x).max(0.0))
            .unwrap_or(PIT_SIGHT)
    }

    fn pressed(&self, action: &Action, control: usize) -> bool {
        self.layout
            .slots
            .get(control)
            .is_some_and(|&slot| action.is_pressed(slot))
    }

    fn observe(&self) -> Vec<f32> {
        let on_ground = if self.y <= 0.0 { 1.0 } else { 0.0 };
        vec![
            (self.x / self.config.length) as f32,
            (self.vx / self.config.max_speed) as f32,
            (self.y / self.config.jump_velocity.max(1.0)) as f32,
            (self.next_pit_distance().min(PIT_SIGHT) / PIT_SIGHT) as f32,
            on_ground,
            1.0,
        ]
    }
}

impl Environment for CorridorEnv {
    type Observation = Vec<f32>;

    fn reset(&mut self) -> Result<Vec<f32>, EnvError> {
        self.rng = ChaCha8Rng::seed_from_u64(self.seed);
        self.x = 0.0;
        self.vx = 0.0;
        self.y = 0.0;
        self.vy = 0.0;
        self.furthest = 0.0;
        self.tick = 0;
        self.done = false;
        Ok(self.observe())
    }

    fn step(&mut self, action: &Action) -> Result<StepOutcome<Vec<f32>>, EnvError> {
        use super::action::controls::{DOWN, JUMP, LEFT, RIGHT};

        if self.done {
            return Ok(StepOutcome {
                observation: self.observe(),
                reward: 0.0,
                done: true,
            });
        }
        if action.len() != self.layout.pad_size {
            return Err(EnvError::new(format!(
                "expected {} buttons, got {}",
                self.layout.pad_size,
                action.len()
            )));
        }
        self.tick += 1;

        let right = self.pressed(action, RIGHT);
        let left = self.pressed(action, LEFT);
        match (right, left) {
            (true, false) => self.vx += ACCEL,
            (false, true) => self.vx -= ACCEL,
            _ => self.vx *= FRICTION,
        }
        if self.pressed(action, DOWN) {
            self.vx *= 0.5;
        }
        if self.config.noise > 0.0 {
            self.vx += self.rng.gen_range(-self.config.noise..=self.config.noise);
        }
        let max = self.config.max_speed;
        self.vx = self.vx.clamp(-max, max);

        let on_ground = self.y <= 0.0;
        if on_ground && self.pressed(action, JUMP) {
            self.vy = self.config.jump_velocity;
        }
        self.y += self.vy;
        self.vy -= GRAVITY;
        if self.y <= 0.0 {
            self.y = 0.0;
            self.vy = 0.0;
        }

        self.x = (self.x + self.vx).max(0.0);

        let mut reward = 0.0;
        let reached = self.x.min(self.config.length);
        if reached > self.furthest {
            reward = reached - self.furthest;
            self.furthest = reached;
        }

        let fell = self.y <= 0.0 && self.in_pit(self.x);
        let goal = self.x >= self.config.length;
        self.done = fell || goal;

        Ok(StepOutcome {
            observation: self.observe(),
            reward,
            done: self.done,
        })
    }
}

/// Builds one CorridorEnv per rollout.
#[derive(Debug, Clone, Default)]
pub struct CorridorFactory {
    config: CorridorConfig,
}

impl CorridorFactory {
    pub fn new(config: CorridorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CorridorConfig {
        &self.config
    }
}

impl EnvFactory for CorridorFactory {
    type Env = CorridorEnv;

    fn create(&self, seed: u64) -> Result<CorridorEnv, EnvError> {
        CorridorEnv::new(self.config.clone(), seed)
    }
}
