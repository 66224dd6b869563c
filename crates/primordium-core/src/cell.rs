//! A drifting, dividing cell used as the reference behaviour.

use crate::KindRegistry;
use glam::Vec3;
use primordium_index::{EncodeError, Organism, StepContext};
use rand::rngs::SmallRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Kind tag under which drift cells register their decoder.
pub const DRIFT_CELL_KIND: &str = "cell.drift";

/// Brownian wanderer that divides with a fixed per-tick probability.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DriftCell {
    radius: f32,
    /// Largest per-axis displacement attempted per tick.
    drift: f32,
    /// Probability of attempting a division each tick.
    division_chance: f32,
    /// Divisions performed; children start back at zero.
    divisions: u32,
}

impl DriftCell {
    #[must_use]
    pub fn new(radius: f32, drift: f32, division_chance: f32) -> Self {
        Self {
            radius,
            drift,
            division_chance: division_chance.clamp(0.0, 1.0),
            divisions: 0,
        }
    }

    /// Number of divisions this cell has performed.
    #[must_use]
    pub fn divisions(&self) -> u32 {
        self.divisions
    }

    /// Decode a cell from its JSON payload.
    pub fn decode(payload: &str) -> Result<Box<dyn Organism>, String> {
        serde_json::from_str::<Self>(payload)
            .map(|cell| Box::new(cell) as Box<dyn Organism>)
            .map_err(|err| err.to_string())
    }

    /// Register the drift cell decoder under [`DRIFT_CELL_KIND`].
    pub fn register(registry: &mut KindRegistry) {
        registry.register(DRIFT_CELL_KIND, Self::decode);
    }
}

impl Organism for DriftCell {
    fn kind(&self) -> &'static str {
        DRIFT_CELL_KIND
    }

    fn radius(&self) -> f32 {
        self.radius
    }

    fn step(&mut self, ctx: &mut StepContext<'_>) {
        let drift = self.drift;
        if drift > 0.0 {
            let dir = Vec3::new(
                ctx.rng().random_range(-drift..=drift),
                ctx.rng().random_range(-drift..=drift),
                ctx.rng().random_range(-drift..=drift),
            );
            ctx.try_move(dir);
        }
        if self.division_chance > 0.0 && ctx.rng().random::<f32>() < self.division_chance {
            ctx.reproduce(self);
        }
    }

    fn create_child(&mut self, _rng: &mut SmallRng) -> Box<dyn Organism> {
        self.divisions += 1;
        Box::new(Self {
            radius: self.radius,
            drift: self.drift,
            division_chance: self.division_chance,
            divisions: 0,
        })
    }

    fn encode(&self) -> Result<String, EncodeError> {
        serde_json::to_string(self).map_err(|err| EncodeError(err.to_string()))
    }
}
