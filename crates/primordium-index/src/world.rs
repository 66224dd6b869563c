//! World boundary and movement policy.

use glam::Vec3;
use serde::{Deserialize, Serialize};

/// Axis-aligned simulation volume plus the policy flags every organism
/// consults through its step context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct World {
    min: Vec3,
    max: Vec3,
    precise_movement: bool,
    randomized_execution_order: bool,
    seed: u64,
}

impl World {
    /// Create a world spanning `[min, max]` with the given master seed.
    #[must_use]
    pub fn new(min: Vec3, max: Vec3, seed: u64) -> Self {
        Self {
            min,
            max,
            precise_movement: false,
            randomized_execution_order: false,
            seed,
        }
    }

    /// Whether `point` lies inside the volume. Both faces are inclusive; the
    /// chunk assignment clamp owns points sitting exactly on `max`.
    #[must_use]
    pub fn contains(&self, point: Vec3) -> bool {
        point.cmpge(self.min).all() && point.cmple(self.max).all()
    }

    /// Lower corner of the volume.
    #[must_use]
    pub fn min(&self) -> Vec3 {
        self.min
    }

    /// Upper corner of the volume.
    #[must_use]
    pub fn max(&self) -> Vec3 {
        self.max
    }

    /// Master seed from which per-batch generators are derived.
    #[must_use]
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Whether movers walk up to first contact instead of rejecting blocked
    /// moves outright.
    #[must_use]
    pub fn precise_movement(&self) -> bool {
        self.precise_movement
    }

    pub fn set_precise_movement(&mut self, precise: bool) {
        self.precise_movement = precise;
    }

    /// Whether batch execution order is shuffled each tick.
    #[must_use]
    pub fn randomized_execution_order(&self) -> bool {
        self.randomized_execution_order
    }

    pub fn set_randomized_execution_order(&mut self, randomized: bool) {
        self.randomized_execution_order = randomized;
    }
}
