// src/rl/action.rs
//
// Button-pad action vectors and the layout that decodes policy logits into them.
//
// The policy emits one logit per controllable button; a logit > 0 presses the
// button. The layout places each logit at its slot in the full pad, every
// other slot stays released.

use serde::{Deserialize, Serialize};

/// Size of the Genesis-style pad used by the default layout.
pub const PAD_BUTTONS: usize = 12;

/// Logit indices of the default four-output controller.
pub mod controls {
    pub const JUMP: usize = 0;
    pub const LEFT: usize = 1;
    pub const RIGHT: usize = 2;
    pub const DOWN: usize = 3;
}

/// Raw policy outputs.
pub type ActionLogits = Vec<f32>;

/// Fixed-length button vector applied to the environment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Action {
    pub buttons: Vec<bool>,
}

impl Action {
    /// All buttons released.
    pub fn released(len: usize) -> Self {
        Self {
            buttons: vec![false; len],
        }
    }

    pub fn len(&self) -> usize {
        self.buttons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buttons.is_empty()
    }

    pub fn is_pressed(&self, slot: usize) -> bool {
        self.buttons.get(slot).copied().unwrap_or(false)
    }

    pub fn pressed_count(&self) -> usize {
        self.buttons.iter().filter(|b| **b).count()
    }
}

/// Maps logit index -> pad slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionLayout {
    /// Total pad size.
    pub pad_size: usize,
    /// `slots[i]` is the pad slot driven by logit `i`.
    pub slots: Vec<usize>,
}

impl Default for ActionLayout {
    /// JUMP -> B (1), DOWN -> 5, LEFT -> 6, RIGHT -> 7 on a 12-button pad.
    fn default() -> Self {
        let mut slots = vec![0; 4];
        slots[controls::JUMP] = 1;
        slots[controls::LEFT] = 6;
        slots[controls::RIGHT] = 7;
        slots[controls::DOWN] = 5;
        Self {
            pad_size: PAD_BUTTONS,
            slots,
        }
    }
}

impl ActionLayout {
    /// Identity layout: logit i drives slot i.
    pub fn direct(n: usize) -> Self {
        Self {
            pad_size: n,
            slots: (0..n).collect(),
        }
    }

    /// Number of logits the policy must produce.
    pub fn num_outputs(&self) -> usize {
        self.slots.len()
    }

    /// Threshold logits into a pad action. Missing logits leave their slot
    /// released; extra logits and out-of-range slots are ignored.
    pub fn decode(&self, logits: &[f32]) -> Action {
        let mut action = Action::released(self.pad_size);
        for (logit, &slot) in logits.iter().zip(self.slots.iter()) {
            if slot < self.pad_size && *logit > 0.0 {
                action.buttons[slot] = true;
            }
        }
        action
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_layout_maps_controls() {
        let layout = ActionLayout::default();
        assert_eq!(layout.num_outputs(), 4);

        // JUMP and RIGHT pressed
        let action = layout.decode(&[0.7, -0.1, 2.0, 0.0]);
        assert_eq!(action.len(), PAD_BUTTONS);
        assert!(action.is_pressed(1));
        assert!(action.is_pressed(7));
        assert!(!action.is_pressed(6));
        // zero is not pressed
        assert!(!action.is_pressed(5));
        assert_eq!(action.pressed_count(), 2);
    }

    #[test]
    fn test_decode_tolerates_short_logits() {
        let layout = ActionLayout::default();
        let action = layout.decode(&[1.0]);
        assert!(action.is_pressed(1));
        assert_eq!(action.pressed_count(), 1);
    }

    #[test]
    fn test_direct_layout() {
        let layout = ActionLayout::direct(3);
        let action = layout.decode(&[1.0, -1.0, 0.5, 9.0]);
        assert_eq!(action.buttons, vec![true, false, true]);
    }

    #[test]
    fn test_nan_logit_is_not_pressed() {
        let layout = ActionLayout::direct(1);
        assert!(!layout.decode(&[f32::NAN]).is_pressed(0));
    }
}
