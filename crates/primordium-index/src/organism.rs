//! The behaviour contract consumed by the stepping core.

use crate::grid::ChunkedGrid;
use crate::world::World;
use glam::Vec3;
use rand::rngs::SmallRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable identity of an organism within a grid.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct OrganismId(pub(crate) u64);

impl OrganismId {
    /// Raw numeric value, for logging and external bookkeeping.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// Error produced when behaviour state cannot be serialized.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("failed to encode organism state: {0}")]
pub struct EncodeError(pub String);

/// Behaviour attached to one spherical organism.
///
/// The grid owns the organism's position, radius and bounding box; behaviour
/// reads and mutates them through the [`StepContext`] it receives each tick.
/// `Send + Sync` because concurrently stepping chunks read their neighbors'
/// residents.
pub trait Organism: Send + Sync {
    /// Static tag identifying the organism kind. Used to select a decoder
    /// when re-importing persisted organisms; the grid never interprets it.
    fn kind(&self) -> &'static str;

    /// Sphere radius in world units. Must stay constant for the organism's
    /// lifetime and must not exceed the grid's configured largest radius.
    fn radius(&self) -> f32;

    /// Advance one tick. Movement, reproduction and neighborhood queries go
    /// through `ctx`.
    fn step(&mut self, ctx: &mut StepContext<'_>);

    /// Split off a child behaviour. The grid decides the child's position;
    /// implementations divide their internal state.
    fn create_child(&mut self, rng: &mut SmallRng) -> Box<dyn Organism>;

    /// Serialize behaviour state. The grid neither parses nor emits this;
    /// failures propagate to the persistence caller.
    fn encode(&self) -> Result<String, EncodeError>;
}

/// Snapshot of another organism returned by neighborhood queries.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub id: OrganismId,
    pub position: Vec3,
    pub radius: f32,
}

/// Per-organism view handed to [`Organism::step`].
///
/// Caches the stepping organism's position and owning chunk so queries skip
/// the directory. All position mutation funnels back into the grid, which
/// updates the cached bounding box and re-buckets before the new position
/// becomes visible to other workers.
pub struct StepContext<'a> {
    pub(crate) grid: &'a ChunkedGrid,
    pub(crate) id: OrganismId,
    pub(crate) chunk: usize,
    pub(crate) position: Vec3,
    pub(crate) radius: f32,
    pub(crate) rng: &'a mut SmallRng,
}

impl StepContext<'_> {
    /// Identity of the stepping organism.
    #[must_use]
    pub fn id(&self) -> OrganismId {
        self.id
    }

    /// Current position.
    #[must_use]
    pub fn position(&self) -> Vec3 {
        self.position
    }

    /// Sphere radius.
    #[must_use]
    pub fn radius(&self) -> f32 {
        self.radius
    }

    /// The world boundary and policy flags.
    #[must_use]
    pub fn world(&self) -> &World {
        self.grid.world()
    }

    /// Worker-local random generator, derived from the master seed.
    pub fn rng(&mut self) -> &mut SmallRng {
        self.rng
    }

    /// Attempt to move by `dir` under the world's movement policy.
    ///
    /// In the default mode the full displacement is committed only when the
    /// destination is collision free. In precise mode the organism walks
    /// along `dir` up to just short of first contact. Returns whether the
    /// position changed; a zero displacement is a no-op.
    pub fn try_move(&mut self, dir: Vec3) -> bool {
        let grid = self.grid;
        grid.try_move(self, dir)
    }

    /// Attempt to divide, placing a child of `parent` nearby.
    ///
    /// The context cannot reach the behaviour object that is mid-step, so the
    /// organism passes itself. Up to five random directions are tried; each
    /// offers a symmetric split first, then a one-sided placement on either
    /// side. `None` when every candidate position was blocked.
    pub fn reproduce(&mut self, parent: &mut dyn Organism) -> Option<OrganismId> {
        let grid = self.grid;
        grid.reproduce(self, parent)
    }

    /// Whether a sphere of this organism's radius at `probe` would leave the
    /// world or touch any other organism in the current 1-ring.
    #[must_use]
    pub fn overlaps(&self, probe: Vec3) -> bool {
        self.grid
            .overlap_in_ring(self.chunk, self.id, self.radius, probe)
    }

    /// Distance to first contact along `dir`, capped at `length`.
    ///
    /// `Some(0.0)` when the segment endpoint leaves the world; `None` when
    /// the segment is clear. A returned contact distance is already reduced
    /// by the contact margin, so moving exactly that far stays collision
    /// free.
    #[must_use]
    pub fn first_hit(&self, dir: Vec3, length: f32) -> Option<f32> {
        let unit = dir.normalize_or_zero();
        if unit == Vec3::ZERO || length <= 0.0 {
            return None;
        }
        self.grid
            .first_hit_in_ring(self.chunk, self.id, self.radius, self.position, unit, length)
    }

    /// Closest other organism in the current 1-ring, if any.
    #[must_use]
    pub fn nearest_neighbor(&self) -> Option<Neighbor> {
        self.grid
            .nearest_in_ring(self.chunk, self.id, self.position)
    }
}
